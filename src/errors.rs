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

use crate::model::state::Variable;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Error while reading configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Error while loading normalization statistics: {0}")]
    Statistics(#[from] DatasetError),

    #[error("Error while building the noise schedule: {0}")]
    Schedule(#[from] RepaintError),

    #[error("Error while assimilating: {0}")]
    Assimilation(#[from] AssimilationError),

    #[error("Error while writing telemetry: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("Error while creating ThreadPool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Cannot set the memory limit: {0}")]
    MemoryLimit(String),

    #[error("Error while handling output: {0}")]
    FaultyOutput(&'static str),

    #[error("Error while performing IO operation: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot open configuration file: {0}")]
    CantOpenFile(#[from] std::io::Error),

    #[error("Cannot deserialize configuration: {0}")]
    CantDeserialize(#[from] serde_yaml::Error),

    #[error("Configuration component is out of bounds {0}")]
    OutOfBounds(&'static str),
}

/// Contract violations between gridded fields.
#[derive(Error, Debug, PartialEq)]
pub enum StateError {
    #[error("Variable {0:?} is missing")]
    MissingVariable(Variable),

    #[error("Shape of {var:?} is {found:?} but {expected:?} was expected")]
    ShapeMismatch {
        var: Variable,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Variable {0:?} has conflicting values in merged states")]
    MergeConflict(Variable),

    #[error("States have different variable sets: {0:?} and {1:?}")]
    VariableSetMismatch(Vec<Variable>, Vec<Variable>),

    #[error("Level {0} hPa is not present on the grid")]
    MissingLevel(u16),

    #[error("Normalization statistics for {0:?} do not match its levels")]
    StatisticsMismatch(Variable),
}

#[derive(Error, Debug)]
pub enum RepaintError {
    #[error("Noise schedule is invalid: {0}")]
    InvalidSchedule(&'static str),

    #[error("Mask shape {mask:?} does not match field grid {field:?}")]
    MaskMismatch {
        mask: (usize, usize),
        field: (usize, usize),
    },

    #[error("Denoiser returned a sample that does not match the input: {0}")]
    Denoiser(StateError),

    #[error("Field contract violated: {0}")]
    State(#[from] StateError),
}

#[derive(Error, Debug)]
pub enum ForecastError {
    #[error("Forecast does not match the target template: {0}")]
    TemplateMismatch(StateError),

    #[error("Field contract violated: {0}")]
    State(#[from] StateError),
}

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Step {0} is outside of the dataset with {1} samples")]
    OutOfRange(usize, usize),

    #[error("Statistics table {0} is missing")]
    MissingStatistics(&'static str),

    #[error("Cannot open statistics file: {0}")]
    CantOpenFile(#[from] std::io::Error),

    #[error("Cannot deserialize statistics: {0}")]
    CantDeserialize(#[from] serde_yaml::Error),

    #[error("Field contract violated: {0}")]
    State(#[from] StateError),
}

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Cannot write CSV record: {0}")]
    Csv(#[from] csv::Error),

    #[error("Error while performing IO operation: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum AssimilationError {
    #[error("Dataset failed at step {0}: {1}")]
    Dataset(usize, DatasetError),

    #[error("Step {0} has no measurements to condition on")]
    MissingMeasurements(usize),

    #[error("Step {0} has no predicted state to continue from")]
    MissingPrediction(usize),

    #[error("Diffusion correction failed: {0}")]
    Repaint(#[from] RepaintError),

    #[error("Forecaster failed: {0}")]
    Forecast(#[from] ForecastError),

    #[error("Telemetry sink failed: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("Field contract violated: {0}")]
    State(#[from] StateError),
}
