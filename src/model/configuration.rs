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

//! Module responsible for parsing and checking the configuration file.
//!
//! To provide meaningful error messages. The configuration file uses
//! [YAML](https://en.wikipedia.org/wiki/YAML) and `serde` to enforce
//! strong typing and automatic type checking. Unknown values of
//! enumerated settings (eg. `init_data: bogus`) are rejected here,
//! before any forecaster or diffusion model is called.
//!
//! The structures and their fields in this module directly correspond to
//! the fields inside `config.yaml` so you can check this documentation
//! for more details how to set the config file.

use super::repaint::{schedule::BetaSchedule, RepaintParams};
use super::state::{Grid, Variable};
use crate::constants::PRESSURE_LEVELS;
use crate::errors::ConfigError;
use crate::Float;
use chrono::NaiveDateTime;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Source of the corrected state in the first two steps.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitData {
    /// Diffusion correction of the forecaster seed with measurements.
    Repaint,
    /// Ground truth itself, the upper bound of what assimilation can achieve.
    Era5,
}

/// Horizontal resolution of forecaster and diffusion model.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1deg")]
    OneDegree,
    #[serde(rename = "0.25deg")]
    QuarterDegree,
}

impl Resolution {
    /// The 0.25 degree forecaster does not take precipitation as input.
    pub fn keeps_precipitation(&self) -> bool {
        match self {
            Resolution::OneDegree => true,
            Resolution::QuarterDegree => false,
        }
    }

    /// Global grid shape `(lat, lon)` with poles included.
    pub fn grid_shape(&self) -> (usize, usize) {
        match self {
            Resolution::OneDegree => (181, 360),
            Resolution::QuarterDegree => (721, 1440),
        }
    }
}

/// Fields controlling the autoregressive loop.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct Assimilation {
    /// _(Optional)_ Number of autoregressive steps, the first two
    /// of which seed the rolling state.
    ///
    /// Defaults to `10`. Cannot be less than `1`.
    #[serde(default = "Assimilation::default_steps")]
    pub num_autoregressive_steps: usize,

    /// _(Optional)_ `repaint` or `era5`. Defaults to `repaint`.
    #[serde(default = "Assimilation::default_init_data")]
    pub init_data: InitData,

    /// _(Optional)_ `1deg` or `0.25deg`. Defaults to `1deg`.
    #[serde(default = "Assimilation::default_resolution")]
    pub resolution: Resolution,

    /// _(Optional)_ Seed from which randomness of every step is derived.
    ///
    /// Defaults to `42`.
    #[serde(default = "Assimilation::default_seed")]
    pub random_seed: u64,

    /// _(Optional)_ Index of dataset sample at which the run starts.
    ///
    /// Defaults to `0`.
    #[serde(default)]
    pub dataset_time_offset: usize,

    /// _(Optional)_ Number of timesteps the diffusion model was trained with.
    ///
    /// Defaults to `1000`. Cannot be less than `1`.
    #[serde(default = "Assimilation::default_train_timesteps")]
    pub num_train_timesteps: usize,
}

impl Assimilation {
    fn default_steps() -> usize {
        10
    }

    fn default_init_data() -> InitData {
        InitData::Repaint
    }

    fn default_resolution() -> Resolution {
        Resolution::OneDegree
    }

    fn default_seed() -> u64 {
        42
    }

    fn default_train_timesteps() -> usize {
        1000
    }

    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if self.num_autoregressive_steps < 1 {
            return Err(ConfigError::OutOfBounds(
                "Number of autoregressive steps cannot be less than 1",
            ));
        }

        if self.num_train_timesteps < 1 {
            return Err(ConfigError::OutOfBounds(
                "Number of train timesteps cannot be less than 1",
            ));
        }

        Ok(())
    }
}

impl Default for Assimilation {
    fn default() -> Self {
        Assimilation {
            num_autoregressive_steps: Assimilation::default_steps(),
            init_data: Assimilation::default_init_data(),
            resolution: Assimilation::default_resolution(),
            random_seed: Assimilation::default_seed(),
            dataset_time_offset: 0,
            num_train_timesteps: Assimilation::default_train_timesteps(),
        }
    }
}

/// _(Optional)_ Fields of the diffusion correction.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct Repaint {
    /// _(Optional)_ One of `linear`, `scaled_linear`,
    /// `squaredcos_cap_v2` and `sigmoid`. Defaults to `linear`.
    #[serde(default = "Repaint::default_schedule")]
    pub ddpm_beta_schedule: BetaSchedule,

    /// _(Optional)_ Defaults to `0.0001`.
    #[serde(default = "Repaint::default_beta_start")]
    pub beta_start: Float,

    /// _(Optional)_ Defaults to `0.02`.
    #[serde(default = "Repaint::default_beta_end")]
    pub beta_end: Float,

    /// _(Optional)_ Number of denoising steps, clamped to number
    /// of train timesteps.
    ///
    /// Defaults to `300`. Cannot be less than `1`.
    #[serde(default = "Repaint::default_inference_timesteps")]
    pub num_inference_timesteps: usize,

    /// _(Optional)_ Stochasticity of the reverse step, between `0` and `1`.
    ///
    /// Defaults to `0.0` (deterministic).
    #[serde(default)]
    pub eta: Float,

    /// _(Optional)_ Inference steps between resampling jumps.
    ///
    /// Defaults to `10`. Cannot be less than `1`.
    #[serde(default = "Repaint::default_jump")]
    pub jump_length: usize,

    /// _(Optional)_ How many times each jump span is denoised.
    ///
    /// Defaults to `10`. Cannot be less than `1`.
    #[serde(default = "Repaint::default_jump")]
    pub jump_n_sample: usize,
}

impl Repaint {
    fn default_schedule() -> BetaSchedule {
        BetaSchedule::Linear
    }

    fn default_beta_start() -> Float {
        0.0001
    }

    fn default_beta_end() -> Float {
        0.02
    }

    fn default_inference_timesteps() -> usize {
        300
    }

    fn default_jump() -> usize {
        10
    }

    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.eta) {
            return Err(ConfigError::OutOfBounds("Repaint eta must be between 0 and 1"));
        }

        if self.num_inference_timesteps < 1 {
            return Err(ConfigError::OutOfBounds(
                "Number of inference timesteps cannot be less than 1",
            ));
        }

        if self.jump_length < 1 || self.jump_n_sample < 1 {
            return Err(ConfigError::OutOfBounds(
                "Jump length and jump sample count cannot be less than 1",
            ));
        }

        if !(self.beta_start > 0.0 && self.beta_start <= self.beta_end && self.beta_end < 1.0) {
            return Err(ConfigError::OutOfBounds(
                "Betas must satisfy 0 < beta_start <= beta_end < 1",
            ));
        }

        Ok(())
    }

    pub fn params(&self) -> RepaintParams {
        RepaintParams {
            num_inference_steps: self.num_inference_timesteps,
            eta: self.eta,
            jump_length: self.jump_length,
            jump_n_sample: self.jump_n_sample,
        }
    }
}

impl Default for Repaint {
    fn default() -> Self {
        Repaint {
            ddpm_beta_schedule: Repaint::default_schedule(),
            beta_start: Repaint::default_beta_start(),
            beta_end: Repaint::default_beta_end(),
            num_inference_timesteps: Repaint::default_inference_timesteps(),
            eta: 0.0,
            jump_length: Repaint::default_jump(),
            jump_n_sample: Repaint::default_jump(),
        }
    }
}

/// _(Optional)_ Fields of sparse measurements sampling.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct Measurements {
    /// _(Optional)_ Number of measured grid cells per step.
    ///
    /// Defaults to `4000`. Cannot be less than `1`.
    #[serde(default = "Measurements::default_samples")]
    pub num_sparse_samples: usize,

    /// _(Optional)_ Standard deviation (in grid cells) of the kernel
    /// spreading measurements into the mask.
    ///
    /// Defaults to `1.5`. Must be positive.
    #[serde(default = "Measurements::default_blur")]
    pub mask_blur_kernel_size: Float,

    /// _(Optional)_ Measure the same cells at every step.
    ///
    /// Defaults to `false`.
    #[serde(default)]
    pub fixed_measurements: bool,
}

impl Measurements {
    fn default_samples() -> usize {
        4000
    }

    fn default_blur() -> Float {
        1.5
    }

    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if self.num_sparse_samples < 1 {
            return Err(ConfigError::OutOfBounds(
                "Number of sparse samples cannot be less than 1",
            ));
        }

        if !(self.mask_blur_kernel_size > 0.0) || !self.mask_blur_kernel_size.is_finite() {
            return Err(ConfigError::OutOfBounds(
                "Mask blur kernel size must be positive",
            ));
        }

        Ok(())
    }
}

impl Default for Measurements {
    fn default() -> Self {
        Measurements {
            num_sparse_samples: Measurements::default_samples(),
            mask_blur_kernel_size: Measurements::default_blur(),
            fixed_measurements: false,
        }
    }
}

/// _(Optional)_ Fields of the forecaster construction.
#[derive(Clone, PartialEq, Debug, Deserialize, Default)]
pub struct Forecaster {
    /// _(Optional)_ Gradient checkpointing of the forecaster network.
    ///
    /// Defaults to `true` for `0.25deg` and `false` for `1deg`.
    pub checkpointing: Option<bool>,
}

impl Forecaster {
    pub fn checkpointing(&self, resolution: Resolution) -> bool {
        self.checkpointing
            .unwrap_or(resolution == Resolution::QuarterDegree)
    }
}

/// Horizontal grid shape in gridpoints.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Deserialize)]
pub struct GridShape {
    pub lat_points: usize,
    pub lon_points: usize,
}

/// Fields with information about model input data.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct Input {
    /// YAML file with `mean_by_level`, `stddev_by_level`
    /// and `diffs_stddev_by_level` tables.
    pub stats_file: PathBuf,

    /// Datetime of the first dataset sample.
    pub start: NaiveDateTime,

    /// _(Optional)_ Hours between dataset samples. Defaults to `6`.
    #[serde(default = "Input::default_timestep")]
    pub timestep_hours: i64,

    /// _(Optional)_ Grid of the synthetic experiment.
    ///
    /// Defaults to the global grid of the configured resolution.
    pub grid: Option<GridShape>,

    /// _(Optional)_ Pressure levels (hPa) of the experiment.
    ///
    /// Defaults to the 13 levels of the forecaster. Must contain 500 hPa.
    #[serde(default = "Input::default_levels")]
    pub levels: Vec<u16>,

    /// _(Optional)_ Prognostic variables of the experiment, by dataset name.
    ///
    /// Defaults to all pressure-level and surface variables.
    #[serde(default = "Input::default_variables")]
    pub variables: Vec<Variable>,

    /// _(Optional)_ Amplitude of the travelling wave of synthetic truth,
    /// relative to variable variability. `0` gives fields constant in time.
    ///
    /// Defaults to `1.0`. Cannot be negative.
    #[serde(default = "Input::default_amplitude")]
    pub wave_amplitude: Float,

    /// _(Optional)_ Bias of the forecaster seed relative to
    /// variable variability.
    ///
    /// Defaults to `0.5`.
    #[serde(default = "Input::default_seed_bias")]
    pub seed_bias: Float,
}

impl Input {
    fn default_timestep() -> i64 {
        6
    }

    fn default_levels() -> Vec<u16> {
        PRESSURE_LEVELS.to_vec()
    }

    fn default_variables() -> Vec<Variable> {
        Variable::PRESSURE_LEVEL
            .iter()
            .chain(Variable::SURFACE_LEVEL.iter())
            .copied()
            .collect()
    }

    fn default_amplitude() -> Float {
        1.0
    }

    fn default_seed_bias() -> Float {
        0.5
    }

    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if self.timestep_hours < 1 {
            return Err(ConfigError::OutOfBounds(
                "Timestep cannot be shorter than 1 hour",
            ));
        }

        if let Some(grid) = self.grid {
            if grid.lat_points < 2 || grid.lon_points < 2 {
                return Err(ConfigError::OutOfBounds(
                    "Grid must have at least 2 points along each axis",
                ));
            }
        }

        if !self.levels.contains(&500) {
            return Err(ConfigError::OutOfBounds("Levels must contain 500 hPa"));
        }

        if self.variables.is_empty()
            || self
                .variables
                .iter()
                .any(|var| !var.is_pressure_level() && !Variable::SURFACE_LEVEL.contains(var))
        {
            return Err(ConfigError::OutOfBounds(
                "Variables must be a non-empty list of prognostic variables",
            ));
        }

        if !(self.wave_amplitude >= 0.0) || !self.seed_bias.is_finite() {
            return Err(ConfigError::OutOfBounds(
                "Wave amplitude cannot be negative and seed bias must be finite",
            ));
        }

        Ok(())
    }
}

/// _(Optional)_ Fields controlling the model output.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct Output {
    /// _(Optional)_ Directory for telemetry tables, must be empty
    /// or not exist. Defaults to `./output/`.
    #[serde(default = "Output::default_directory")]
    pub directory: PathBuf,

    /// _(Optional)_ Write metrics and RMSE tables. Defaults to `false`.
    #[serde(default)]
    pub telemetry: bool,

    /// _(Optional)_ Show progress bars. Defaults to `true`.
    #[serde(default = "Output::default_progress")]
    pub progress: bool,
}

impl Output {
    fn default_directory() -> PathBuf {
        PathBuf::from("./output/")
    }

    fn default_progress() -> bool {
        true
    }
}

impl Default for Output {
    fn default() -> Self {
        Output {
            directory: Output::default_directory(),
            telemetry: false,
            progress: Output::default_progress(),
        }
    }
}

/// _(Optional)_ Fields with information about
/// resources available for model.
#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize)]
pub struct Resources {
    /// _(Optional)_ Thread count used for field arithmetic.
    ///
    /// Cannot be less than `1`. Defaults to `1`.
    #[serde(default = "Resources::default_threads")]
    pub threads: u16,

    /// _(Optional)_ Heap memory limit for the model in MB.
    /// Useful for enabling meaningful Out-of-memory error messages.
    ///
    /// Cannot be less than `128`. Defaults to whole addressable-space
    /// (`2^32` or `2^64` bytes).
    ///
    /// If the model gets killed for no apparent reason try setting the
    /// memory limit lower than your avilable system memory and check if
    /// OOM error occurs.
    #[serde(default = "Resources::default_memory")]
    pub memory: usize,
}

impl Resources {
    fn default_threads() -> u16 {
        1
    }

    fn default_memory() -> usize {
        usize::MAX / (1024 * 1024)
    }

    /// Checks if thread count and memory limit are
    /// above limits.
    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if self.threads < 1 {
            return Err(ConfigError::OutOfBounds(
                "Available threads cannot be less than 1",
            ));
        }

        if self.memory < 128 {
            return Err(ConfigError::OutOfBounds(
                "Available memory cannot be less than 128 MB",
            ));
        }

        Ok(())
    }
}

impl Default for Resources {
    fn default() -> Self {
        Resources {
            threads: Resources::default_threads(),
            memory: Resources::default_memory(),
        }
    }
}

/// Main config structure representing the fields in
/// configuration file.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub assimilation: Assimilation,

    #[serde(default)]
    pub repaint: Repaint,

    #[serde(default)]
    pub measurements: Measurements,

    #[serde(default)]
    pub forecaster: Forecaster,

    pub input: Input,

    #[serde(default)]
    pub output: Output,

    #[serde(default)]
    pub resources: Resources,
}

impl Config {
    /// Config structure constructor, responsible for
    /// deserializing configuration and checking it.
    pub fn new_from_file(file_path: &Path) -> Result<Config, ConfigError> {
        let data = fs::read(file_path)?;
        let config: Config = serde_yaml::from_slice(data.as_slice())?;

        config.check_bounds()?;

        Ok(config)
    }

    /// Same as [`Config::new_from_file`] but from YAML text.
    pub fn new_from_str(data: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_yaml::from_str(data)?;

        config.check_bounds()?;

        Ok(config)
    }

    fn check_bounds(&self) -> Result<(), ConfigError> {
        self.assimilation.check_bounds()?;
        self.repaint.check_bounds()?;
        self.measurements.check_bounds()?;
        self.input.check_bounds()?;
        self.resources.check_bounds()?;

        Ok(())
    }

    /// Grid of the experiment.
    pub fn grid(&self) -> Grid {
        let (lat_points, lon_points) = match self.input.grid {
            Some(shape) => (shape.lat_points, shape.lon_points),
            None => self.assimilation.resolution.grid_shape(),
        };

        Grid::regular(lat_points, lon_points, &self.input.levels)
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, InitData, Resolution};
    use crate::errors::ConfigError;
    use crate::model::repaint::schedule::BetaSchedule;
    use std::path::Path;

    const MINIMAL: &str = "
input:
  stats_file: ./test-data/stats.yaml
  start: 2016-01-01T00:00:00
";

    #[test]
    fn defaults() {
        let config = Config::new_from_str(MINIMAL).unwrap();

        assert_eq!(config.assimilation.num_autoregressive_steps, 10);
        assert_eq!(config.assimilation.init_data, InitData::Repaint);
        assert_eq!(config.assimilation.resolution, Resolution::OneDegree);
        assert_eq!(config.repaint.ddpm_beta_schedule, BetaSchedule::Linear);
        assert_eq!(config.repaint.num_inference_timesteps, 300);
        assert_eq!(config.measurements.num_sparse_samples, 4000);
        assert!(!config.forecaster.checkpointing(config.assimilation.resolution));
        assert_eq!(config.grid().horizontal_shape(), (181, 360));
    }

    #[test]
    fn quarter_degree() {
        let config = Config::new_from_str(&format!(
            "{}assimilation:\n  resolution: 0.25deg\n",
            MINIMAL
        ))
        .unwrap();

        assert!(config.forecaster.checkpointing(Resolution::QuarterDegree));
        assert!(!config.assimilation.resolution.keeps_precipitation());
        assert_eq!(config.grid().horizontal_shape(), (721, 1440));
    }

    #[test]
    fn unknown_values_are_rejected() {
        for snippet in [
            "assimilation:\n  init_data: bogus\n",
            "assimilation:\n  resolution: 2deg\n",
            "repaint:\n  ddpm_beta_schedule: quadratic\n",
        ] {
            let config = Config::new_from_str(&format!("{}{}", MINIMAL, snippet));

            assert!(matches!(config, Err(ConfigError::CantDeserialize(_))), "{}", snippet);
        }
    }

    #[test]
    fn out_of_bounds() {
        for snippet in [
            "assimilation:\n  num_autoregressive_steps: 0\n",
            "repaint:\n  eta: 1.5\n",
            "repaint:\n  jump_length: 0\n",
            "measurements:\n  mask_blur_kernel_size: 0.0\n",
            "resources:\n  threads: 0\n",
        ] {
            let config = Config::new_from_str(&format!("{}{}", MINIMAL, snippet));

            assert!(matches!(config, Err(ConfigError::OutOfBounds(_))), "{}", snippet);
        }
    }

    #[test]
    fn read_test_config() {
        let config = Config::new_from_file(Path::new("./test-data/config.yaml")).unwrap();

        assert_eq!(config.input.levels, vec![500, 850]);
        assert!(!config.output.progress);
    }
}
