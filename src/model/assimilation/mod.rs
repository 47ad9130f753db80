/*
Copyright 2021 Jakub Lewandowski

This file is part of Diffusion Data Assimilation (DiffDA).

Diffusion Data Assimilation (DiffDA) is a free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; either version 3 of the License, or
(at your option) any later version.

Diffusion Data Assimilation (DiffDA) is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with Diffusion Data Assimilation (DiffDA). If not, see https://www.gnu.org/licenses/.
*/

//! Autoregressive data assimilation loop.
//!
//! The first two steps (bootstrap) build corrected analysis states: the
//! forecaster seed from the dataset is corrected with measurements by
//! RePaint (or replaced by ground truth in `era5` mode). From the second
//! step on, the two most recent states are fed to the forecaster and the
//! prediction becomes the input of the next step, without further
//! measurements (steady state).
//!
//! Every step that has a forecast is scored against ground truth and
//! the metrics are sent to a [`TelemetrySink`](telemetry::TelemetrySink).

pub mod metrics;
pub mod telemetry;

use self::metrics::{calculate_stat_rmse, headline_key, headline_rmse, RmseTable};
use self::telemetry::TelemetrySink;
use super::configuration::{Config, InitData, Resolution};
use super::dataset::Dataset;
use super::forcing::{compute_forcings, ForcingKind};
use super::forecaster::{ForecastInputs, Forecaster, TargetTemplate};
use super::normalization::Normalizer;
use super::repaint::{
    denoiser::{Conditioning, Denoiser},
    repaint,
    schedule::NoiseSchedule,
    RepaintInputs, RepaintParams,
};
use super::state::{State, TimeWindow, Variable};
use super::step_seed;
use crate::constants::GRAPHCAST_DATA_TYPE;
use crate::errors::{AssimilationError, ForecastError};
use crate::Float;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;

/// Diffusion timestep at which the denoiser forcings are evaluated.
const FORCING_DIFFUSION_TIMESTEP: usize = 1;

/// States carried between steps.
///
/// After a steady-state step the previous prediction equals the
/// prediction of the step before, and after the second bootstrap step
/// the previous corrected state equals the first corrected state.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct RollingState {
    inputs_pred: Option<State>,
    inputs_pred_prev: Option<State>,
    corrected_pred: Option<State>,
    corrected_pred_prev: Option<State>,
    inputs_pred_full: Option<State>,
    inputs_pred_prev_full: Option<State>,
}

/// Metrics of a single forecast step.
#[derive(Clone, PartialEq, Debug)]
pub struct StepReport {
    pub step: usize,
    pub headline: BTreeMap<String, Float>,
    pub pressure: RmseTable,
    pub surface: RmseTable,
}

impl StepReport {
    /// RMSE of geopotential at 500 hPa, if geopotential is predicted.
    pub fn z500(&self) -> Option<Float> {
        self.headline
            .get(&headline_key(Variable::Geopotential))
            .copied()
    }
}

/// Assimilation run with all its collaborators.
pub struct Assimilation<'a> {
    init_data: InitData,
    resolution: Resolution,
    num_steps: usize,
    random_seed: u64,
    repaint_params: RepaintParams,
    show_progress: bool,
    forecaster: &'a dyn Forecaster,
    denoiser: &'a dyn Denoiser,
    schedule: &'a NoiseSchedule,
    norm_original: &'a Normalizer,
    norm_diff: &'a Normalizer,
}

impl<'a> Assimilation<'a> {
    pub fn new(
        config: &Config,
        forecaster: &'a dyn Forecaster,
        denoiser: &'a dyn Denoiser,
        schedule: &'a NoiseSchedule,
        norm_original: &'a Normalizer,
        norm_diff: &'a Normalizer,
    ) -> Self {
        Assimilation {
            init_data: config.assimilation.init_data,
            resolution: config.assimilation.resolution,
            num_steps: config.assimilation.num_autoregressive_steps,
            random_seed: config.assimilation.random_seed,
            repaint_params: config.repaint.params(),
            show_progress: config.output.progress,
            forecaster,
            denoiser,
            schedule,
            norm_original,
            norm_diff,
        }
    }

    /// Runs all configured steps and returns reports of steps with a forecast.
    ///
    /// Any error stops the run, there is no partial recovery.
    pub fn run(
        &self,
        dataset: &dyn Dataset,
        sink: &mut dyn TelemetrySink,
    ) -> Result<Vec<StepReport>, AssimilationError> {
        info!(
            "Assimilating {} steps with {:?} initialization at {:?}",
            self.num_steps, self.init_data, self.resolution
        );

        let steps_bar = if self.show_progress {
            let bar = ProgressBar::new(self.num_steps as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{prefix} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
                    .progress_chars("#>-"),
            );
            bar
        } else {
            ProgressBar::hidden()
        };
        steps_bar.set_prefix("Validation");

        if dataset.len() < self.num_steps {
            warn!(
                "Dataset has {} samples, run of {} steps will fail at its end",
                dataset.len(),
                self.num_steps
            );
        }

        let mut rolling = RollingState::default();
        let mut reports = Vec::with_capacity(self.num_steps);

        for index in 0..self.num_steps {
            if let Some(report) = self.step(index, dataset, &mut rolling)? {
                debug!("Step {} metrics: {:?}", report.step, report.headline);

                if let Some(z500) = report.z500() {
                    steps_bar.set_message(format!("loss_gc_z500={:.4}", z500));
                }

                sink.log_scalars(index, &report.headline)?;
                sink.log_tables(index, &report.pressure, &report.surface)?;

                reports.push(report);
            }

            steps_bar.inc(1);
        }

        sink.flush()?;
        steps_bar.finish_with_message("All steps finished");

        Ok(reports)
    }

    /// Performs one step, returns `None` when no forecast was made.
    pub fn step(
        &self,
        index: usize,
        dataset: &dyn Dataset,
        rolling: &mut RollingState,
    ) -> Result<Option<StepReport>, AssimilationError> {
        let bootstrap = index <= 1;

        if index == 2 {
            info!("Measurements interpolation disabled, continuing autoregressively");
        }

        let batch = dataset
            .batch(index, bootstrap)
            .map_err(|err| AssimilationError::Dataset(index, err))?;
        let grid = &batch.grid;
        let num_train_timesteps = self.schedule.num_train_timesteps();

        let forcings = compute_forcings(
            batch.datetime,
            grid,
            FORCING_DIFFUSION_TIMESTEP,
            num_train_timesteps,
            ForcingKind::Normalized,
        );
        let forcings_prediction = compute_forcings(
            batch.datetime,
            grid,
            FORCING_DIFFUSION_TIMESTEP,
            num_train_timesteps,
            ForcingKind::Prediction,
        );

        let toa = batch
            .ground_truth
            .select(&[Variable::ToaIncidentSolarRadiation]);
        let norm_toa = self.norm_original.normalize(&toa)?;
        let norm_forcings = forcings.merge(&norm_toa)?;
        let norm_forcings_prediction = forcings_prediction.merge(&norm_toa)?;
        let forcings_prediction = forcings_prediction.merge(&toa)?;
        let ground_truth = batch
            .ground_truth
            .drop_var(Variable::ToaIncidentSolarRadiation);

        if bootstrap {
            rolling.inputs_pred_prev = rolling.inputs_pred.replace(batch.prediction);
        }

        let inputs_pred = rolling
            .inputs_pred
            .clone()
            .ok_or(AssimilationError::MissingPrediction(index))?;
        let norm_inputs_pred = self.conform(self.norm_original.normalize(&inputs_pred)?);
        let norm_static = self.norm_original.normalize(&batch.static_fields)?;
        let targets_template = TargetTemplate::from_state(&self.conform(ground_truth.clone()));

        let diff = if bootstrap {
            rolling.corrected_pred_prev = rolling.corrected_pred.take();

            let corrected_prognostic = match self.init_data {
                InitData::Repaint => {
                    let measurements = batch
                        .measurements
                        .as_ref()
                        .ok_or(AssimilationError::MissingMeasurements(index))?;

                    let measurements_diff = measurements.interpolated.sub(&inputs_pred)?;
                    let norm_measurements_diff = self.norm_diff.normalize(&measurements_diff)?;

                    let mut rng =
                        ChaCha8Rng::seed_from_u64(step_seed(self.random_seed, index as u64));

                    debug!("Correcting forecaster seed of step {} with RePaint", index);
                    let norm_correction = repaint(
                        self.denoiser,
                        self.schedule,
                        &self.repaint_params,
                        &RepaintInputs {
                            mask: &measurements.mask,
                            norm_measurements_diff: &norm_measurements_diff,
                            cond: Conditioning {
                                norm_inputs_pred: &norm_inputs_pred,
                                norm_static: &norm_static,
                                norm_forcings: &norm_forcings,
                            },
                        },
                        &mut rng,
                        self.show_progress,
                    )?;

                    inputs_pred.add(&self.norm_diff.denormalize(&norm_correction)?)?
                }
                InitData::Era5 => ground_truth.clone(),
            };

            rolling.corrected_pred =
                Some(self.conform(corrected_prognostic.merge(&forcings_prediction)?));

            let prediction = match (&rolling.corrected_pred_prev, &rolling.corrected_pred) {
                (Some(previous), Some(current)) => self.forecast(
                    TimeWindow::new(previous, current)?,
                    &norm_static,
                    &norm_forcings_prediction,
                    &targets_template,
                )?,
                _ => {
                    debug!("Step {} seeded the rolling state without forecast", index);
                    return Ok(None);
                }
            };

            rolling.inputs_pred_prev_full =
                Some(self.conform(inputs_pred.merge(&forcings_prediction)?));
            rolling.inputs_pred_prev = Some(inputs_pred);
            rolling.inputs_pred = Some(prediction);

            corrected_prognostic.sub(&ground_truth)?
        } else {
            rolling.inputs_pred_full = Some(self.conform(inputs_pred.merge(&forcings_prediction)?));

            let prediction = match (&rolling.inputs_pred_prev_full, &rolling.inputs_pred_full) {
                (Some(previous), Some(current)) => self.forecast(
                    TimeWindow::new(previous, current)?,
                    &norm_static,
                    &norm_forcings_prediction,
                    &targets_template,
                )?,
                _ => return Err(AssimilationError::MissingPrediction(index)),
            };

            // scored is the input of this step, not the fresh prediction
            let diff = inputs_pred.sub(&ground_truth)?;

            rolling.inputs_pred_prev_full = rolling.inputs_pred_full.clone();
            rolling.inputs_pred_prev = Some(inputs_pred);
            rolling.inputs_pred = Some(prediction);

            diff
        };

        let (pressure, surface) = calculate_stat_rmse(&diff, grid, GRAPHCAST_DATA_TYPE)?;
        let headline = headline_rmse(&diff, grid)?;

        Ok(Some(StepReport {
            step: index,
            headline,
            pressure,
            surface,
        }))
    }

    fn forecast(
        &self,
        inputs: TimeWindow,
        norm_static: &State,
        norm_forcings: &State,
        targets_template: &TargetTemplate,
    ) -> Result<State, AssimilationError> {
        let prediction = self.forecaster.predict(&ForecastInputs {
            inputs,
            norm_static,
            norm_forcings,
            targets_template,
        })?;

        targets_template
            .check(&prediction)
            .map_err(ForecastError::TemplateMismatch)?;

        Ok(prediction)
    }

    /// Removes precipitation for forecasters that do not take it as input.
    fn conform(&self, state: State) -> State {
        if self.resolution.keeps_precipitation() {
            state
        } else {
            state.drop_var(Variable::TotalPrecipitation6hr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::telemetry::CsvTelemetry;
    use super::{Assimilation, RollingState, StepReport};
    use crate::errors::ForecastError;
    use crate::model::configuration::Config;
    use crate::model::dataset::{SparseSampler, SyntheticDataset};
    use crate::model::forecaster::{ForecastInputs, Forecaster, ForecasterOptions, Persistence};
    use crate::model::normalization::{NormStats, Normalizer};
    use crate::model::repaint::denoiser::ZeroPriorDenoiser;
    use crate::model::repaint::schedule::{BetaSchedule, NoiseSchedule};
    use crate::model::state::{State, Variable};
    use std::fs;
    use std::sync::{Arc, Mutex};

    const STEPS: usize = 5;

    fn config(init_data: &str, resolution: &str) -> Config {
        Config::new_from_str(&format!(
            "
assimilation:
  num_autoregressive_steps: {}
  init_data: {}
  resolution: {}
  num_train_timesteps: 100
repaint:
  num_inference_timesteps: 10
  jump_length: 2
  jump_n_sample: 2
measurements:
  num_sparse_samples: 1000
  mask_blur_kernel_size: 0.1
input:
  stats_file: ./test-data/stats.yaml
  start: 2016-01-01T00:00:00
  grid:
    lat_points: 7
    lon_points: 12
  levels: [500, 850]
output:
  progress: false
",
            STEPS, init_data, resolution
        ))
        .unwrap()
    }

    fn dataset(config: &Config) -> SyntheticDataset {
        let sampler = SparseSampler::new(
            config.measurements.num_sparse_samples,
            config.measurements.mask_blur_kernel_size,
            false,
            7,
        );

        SyntheticDataset::new(config.grid(), config.input.start, 6, 0, STEPS, sampler)
    }

    /// Persistence that records variables of every tensor it receives.
    struct Recording {
        inner: Persistence,
        seen: Mutex<Vec<Vec<Variable>>>,
    }

    impl Recording {
        fn new() -> Self {
            Recording {
                inner: Persistence::new(ForecasterOptions::default()),
                seen: Mutex::new(vec![]),
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len() / 5
        }

        fn saw(&self, var: Variable) -> bool {
            self.seen.lock().unwrap().iter().any(|vars| vars.contains(&var))
        }
    }

    impl Forecaster for Recording {
        fn predict(&self, inputs: &ForecastInputs) -> Result<State, ForecastError> {
            let mut seen = self.seen.lock().unwrap();

            for state in [
                inputs.inputs.previous,
                inputs.inputs.current,
                inputs.norm_static,
                inputs.norm_forcings,
            ] {
                seen.push(state.variables());
            }
            seen.push(inputs.targets_template.variables());

            self.inner.predict(inputs)
        }
    }

    fn run_steps(
        config: &Config,
        forecaster: &dyn Forecaster,
    ) -> (Vec<Option<StepReport>>, Vec<RollingState>) {
        let schedule = Arc::new(
            NoiseSchedule::new(BetaSchedule::Linear, 100, 1e-4, 0.02).unwrap(),
        );
        let denoiser = ZeroPriorDenoiser::new(Arc::clone(&schedule));
        let identity = Normalizer::new(Arc::new(NormStats::new()), None);
        let dataset = dataset(config);

        let assimilation =
            Assimilation::new(config, forecaster, &denoiser, &schedule, &identity, &identity);

        let mut rolling = RollingState::default();
        let mut reports = vec![];
        let mut history = vec![];

        for index in 0..STEPS {
            reports.push(assimilation.step(index, &dataset, &mut rolling).unwrap());
            history.push(rolling.clone());
        }

        (reports, history)
    }

    #[test]
    fn first_step_has_no_forecast() {
        let forecaster = Recording::new();
        let (reports, history) = run_steps(&config("era5", "1deg"), &forecaster);

        assert!(reports[0].is_none());
        assert!(reports[1..].iter().all(|report| report.is_some()));
        assert_eq!(forecaster.calls(), STEPS - 1);
        assert!(history[0].corrected_pred.is_some());
        assert!(history[0].corrected_pred_prev.is_none());
    }

    #[test]
    fn era5_bootstrap_has_zero_error() {
        let (reports, _) = run_steps(&config("era5", "1deg"), &Recording::new());
        let report = reports[1].as_ref().unwrap();

        assert_eq!(report.step, 1);
        assert!(!report.headline.is_empty());
        assert!(report.headline.values().all(|value| *value == 0.0));
        assert_eq!(report.z500(), Some(0.0));
    }

    #[test]
    fn rolling_pointers_rotate() {
        let (_, history) = run_steps(&config("era5", "1deg"), &Recording::new());

        assert_eq!(history[1].corrected_pred_prev.as_ref(), history[0].corrected_pred.as_ref());

        for t in 1..STEPS - 1 {
            assert_eq!(history[t + 1].inputs_pred_prev.as_ref(), history[t].inputs_pred.as_ref());
        }

        assert!(history[1].inputs_pred_full.is_none());
        assert!(history[2].inputs_pred_full.is_some());
        for t in 2..STEPS {
            assert_eq!(history[t].inputs_pred_prev_full.as_ref(), history[t].inputs_pred_full.as_ref());
        }
    }

    #[test]
    fn precipitation_kept_at_one_degree() {
        let forecaster = Recording::new();
        let (reports, _) = run_steps(&config("era5", "1deg"), &forecaster);

        assert!(forecaster.saw(Variable::TotalPrecipitation6hr));
        assert!(reports[2]
            .as_ref()
            .unwrap()
            .surface
            .column(Variable::TotalPrecipitation6hr)
            .is_some());
    }

    #[test]
    fn precipitation_never_reaches_quarter_degree_forecaster() {
        for init_data in ["era5", "repaint"] {
            let forecaster = Recording::new();
            let (reports, _) = run_steps(&config(init_data, "0.25deg"), &forecaster);

            assert_eq!(forecaster.calls(), STEPS - 1);
            assert!(!forecaster.saw(Variable::TotalPrecipitation6hr));
            assert!(forecaster.saw(Variable::Temperature2m));
            assert!(reports[3]
                .as_ref()
                .unwrap()
                .surface
                .column(Variable::TotalPrecipitation6hr)
                .is_none());
        }
    }

    #[test]
    fn quarter_degree_telemetry_survives_dropped_precipitation() {
        let config = config("era5", "0.25deg");
        let schedule = Arc::new(
            NoiseSchedule::new(BetaSchedule::Linear, 100, 1e-4, 0.02).unwrap(),
        );
        let denoiser = ZeroPriorDenoiser::new(Arc::clone(&schedule));
        let identity = Normalizer::new(Arc::new(NormStats::new()), None);
        let forecaster = Persistence::new(ForecasterOptions::default());

        let directory =
            std::env::temp_dir().join(format!("diffda-quarter-degree-{}", std::process::id()));
        fs::create_dir_all(&directory).unwrap();
        let mut sink = CsvTelemetry::new(&directory).unwrap();

        let assimilation =
            Assimilation::new(&config, &forecaster, &denoiser, &schedule, &identity, &identity);
        let reports = assimilation.run(&dataset(&config), &mut sink).unwrap();

        assert_eq!(reports.len(), STEPS - 1);

        let surface = fs::read_to_string(directory.join("rmse_surface_level.csv")).unwrap();
        let precipitation_rows: Vec<&str> = surface
            .lines()
            .filter(|line| line.contains(Variable::TotalPrecipitation6hr.name()))
            .collect();

        // only the bootstrap step still carries precipitation
        assert_eq!(precipitation_rows.len(), 1);
        assert!(precipitation_rows[0].starts_with("1,"));
        assert!(surface.lines().any(|line| line.starts_with(&format!("{},", STEPS - 1))));

        fs::remove_dir_all(&directory).unwrap();
    }

    #[test]
    fn dense_measurements_recover_truth() {
        let (reports, _) = run_steps(&config("repaint", "1deg"), &Recording::new());
        let report = reports[1].as_ref().unwrap();

        for (key, value) in &report.headline {
            assert!(*value < 1e-6, "{} = {}", key, value);
        }
    }

    #[test]
    fn repaint_is_reproducible() {
        let (first, _) = run_steps(&config("repaint", "1deg"), &Recording::new());
        let (second, _) = run_steps(&config("repaint", "1deg"), &Recording::new());

        assert_eq!(first, second);
    }
}
