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

//! Module containing the actual model code.
//!
//! A run is an observing-system experiment: a dataset provides ground
//! truth, forecaster seeds and sparse measurements, the assimilation
//! loop corrects and advances the state and every forecast is scored
//! against truth.

mod assimilation;
mod configuration;
mod dataset;
mod forcing;
mod forecaster;
mod normalization;
mod repaint;
pub(crate) mod state;


use crate::{
    errors::ModelError,
    model::{
        assimilation::{
            telemetry::{CsvTelemetry, NullTelemetry, TelemetrySink},
            Assimilation,
        },
        configuration::Config,
        dataset::{SparseSampler, SyntheticDataset},
        forecaster::{ForecasterOptions, Persistence},
        normalization::StatsTables,
        repaint::{denoiser::ZeroPriorDenoiser, schedule::NoiseSchedule},
    },
    ALLOCATOR,
};
use log::{debug, info};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Main model function, responsible for all assimilation steps.
///
/// It reads the configuration given as the first command line argument
/// (`config.yaml` by default), prepares the collaborators of the
/// assimilation and runs it on the threadpool.
pub fn main() -> Result<(), ModelError> {
    info!("Preparing the model core");

    let config_path = env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from("config.yaml"), PathBuf::from);

    let model_core = Core::new(&config_path)?;
    let config = &model_core.config;

    if config.output.telemetry {
        prepare_output_dir(&config.output.directory)?;
    }

    let sampler = SparseSampler::new(
        config.measurements.num_sparse_samples,
        config.measurements.mask_blur_kernel_size,
        config.measurements.fixed_measurements,
        !config.assimilation.random_seed,
    );
    let dataset = SyntheticDataset::new(
        config.grid(),
        config.input.start,
        config.input.timestep_hours,
        config.assimilation.dataset_time_offset,
        config.assimilation.num_autoregressive_steps,
        sampler,
    )
    .with_amplitude(config.input.wave_amplitude)
    .with_prediction_bias(config.input.seed_bias)
    .with_variables(&config.input.variables);

    let forecaster = Persistence::new(ForecasterOptions {
        checkpointing: config
            .forecaster
            .checkpointing(config.assimilation.resolution),
    });
    debug!("Forecaster options: {:?}", forecaster.options());

    let denoiser = ZeroPriorDenoiser::new(Arc::clone(&model_core.schedule));
    let norm_original = model_core.stats.original();
    let norm_diff = model_core.stats.difference();

    let assimilation = Assimilation::new(
        config,
        &forecaster,
        &denoiser,
        &model_core.schedule,
        &norm_original,
        &norm_diff,
    );

    let mut sink: Box<dyn TelemetrySink> = if config.output.telemetry {
        Box::new(CsvTelemetry::new(&config.output.directory)?)
    } else {
        Box::new(NullTelemetry)
    };

    info!("Starting the assimilation");

    let reports = model_core
        .threadpool
        .install(|| assimilation.run(&dataset, sink.as_mut()))?;

    match reports.last().and_then(|report| report.z500()) {
        Some(z500) => info!(
            "{} steps scored, final geopotential RMSE at 500 hPa: {:.4}",
            reports.len(),
            z500
        ),
        None => info!("{} steps scored", reports.len()),
    }

    Ok(())
}

/// Derives the seed of a single step from the run seed
/// with the splitmix64 finalizer.
///
/// Steps get uncorrelated streams, and the stream of a step
/// does not depend on which steps ran before it.
pub(crate) fn step_seed(seed: u64, index: u64) -> u64 {
    let mut z = seed ^ index.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);

    z ^ (z >> 31)
}

/// Structure containing model parameters.
///
/// To run the assimilation model needs to load and compute some
/// initial data which is then stored in this structure.
#[derive(Debug)]
pub struct Core {
    pub config: Config,
    pub threadpool: ThreadPool,
    pub stats: StatsTables,
    pub schedule: Arc<NoiseSchedule>,
}

impl Core {
    /// Model [`Core`] constructor.
    ///
    /// Before the assimilation can start (and to run it safely),
    /// configuration and statistics provided by the user must be
    /// loaded and checked.
    pub fn new(config_path: &Path) -> Result<Self, ModelError> {
        debug!("Reading configuration from {}", config_path.display());
        let config = Config::new_from_file(config_path)?;

        debug!("Setting memory limit");
        ALLOCATOR
            .set_limit(config.resources.memory.saturating_mul(1024 * 1024))
            .map_err(|err| ModelError::MemoryLimit(format!("{:?}", err)))?;

        debug!("Setting up ThreadPool");
        let threadpool = ThreadPoolBuilder::new()
            .num_threads(config.resources.threads as usize)
            .build()?;

        let stats = StatsTables::new_from_file(&config.input.stats_file)?;

        debug!(
            "Building {:?} noise schedule",
            config.repaint.ddpm_beta_schedule
        );
        let schedule = NoiseSchedule::new(
            config.repaint.ddpm_beta_schedule,
            config.assimilation.num_train_timesteps,
            config.repaint.beta_start,
            config.repaint.beta_end,
        )?;

        Ok(Core {
            config,
            threadpool,
            stats,
            schedule: Arc::new(schedule),
        })
    }
}

/// Checks that the output directory is empty or creates it,
/// so telemetry of different runs never mixes.
fn prepare_output_dir(out_path: &Path) -> Result<(), ModelError> {
    debug!("Checking and setting output directory");

    if out_path.is_dir() {
        if out_path.read_dir()?.next().is_none() {
            debug!("Output directory exists but is empty so continuing");
        } else {
            return Err(ModelError::FaultyOutput(
                "Output directory exists and is not empty",
            ));
        }
    } else {
        debug!("Output directory does not exist so creating a new one");
        fs::create_dir_all(out_path)?;
    }

    Ok(())
}
