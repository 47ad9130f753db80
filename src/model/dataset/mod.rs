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

//! Interface of the data source feeding the assimilation
//! and the data sources provided with the model.

mod measurements;
mod synthetic;

pub use self::measurements::SparseSampler;
pub use self::synthetic::SyntheticDataset;

use super::state::{Grid, State};
use crate::{errors::DatasetError, Float};
use chrono::NaiveDateTime;
use ndarray::Array2;

/// Sparse measurements spread onto the grid.
#[derive(Clone, PartialEq, Debug)]
pub struct Measurements {
    /// Prognostic variables interpolated from measured cells.
    pub interpolated: State,
    /// Trust in the interpolated value per `(lat, lon)` cell, in `[0, 1]`.
    pub mask: Array2<Float>,
}

/// Everything the assimilation needs for a single step.
#[derive(Clone, PartialEq, Debug)]
pub struct Batch {
    pub datetime: NaiveDateTime,
    pub grid: Grid,
    /// Reanalysis state, including top-of-atmosphere solar radiation.
    pub ground_truth: State,
    pub static_fields: State,
    /// Forecaster prediction seeding the first two steps.
    pub prediction: State,
    /// Present only when interpolation was requested.
    pub measurements: Option<Measurements>,
}

/// Time-indexed sequence of batches.
pub trait Dataset: Sync {
    fn len(&self) -> usize;

    /// Reads batch at `index`. Measurements are computed
    /// only when `interpolate` is set.
    fn batch(&self, index: usize, interpolate: bool) -> Result<Batch, DatasetError>;
}
