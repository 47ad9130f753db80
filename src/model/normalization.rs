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

//! Module responsible for (de)normalizing fields with
//! precomputed per-variable, per-level statistics.
//!
//! Three statistics tables are loaded once per run:
//! mean, standard deviation and standard deviation of the
//! 6-hour differences. The last one scales the difference space
//! in which the diffusion model operates.

use super::state::{State, Variable};
use crate::errors::{DatasetError, StateError};
use crate::Float;
use log::{debug, warn};
use ndarray::{Array1, Array3, Axis};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::{fs, path::Path, sync::Arc};

/// Per-variable statistic with one value per level
/// (or a single value for surface variables).
#[derive(Clone, PartialEq, Debug, Default)]
pub struct NormStats {
    by_level: FxHashMap<Variable, Array1<Float>>,
}

impl NormStats {
    pub fn new() -> Self {
        NormStats::default()
    }

    pub fn with(mut self, var: Variable, values: &[Float]) -> Self {
        self.by_level.insert(var, Array1::from(values.to_vec()));
        self
    }

    pub fn get(&self, var: Variable) -> Option<&Array1<Float>> {
        self.by_level.get(&var)
    }
}

#[derive(Deserialize)]
struct RawStatsFile {
    mean_by_level: Option<FxHashMap<Variable, Vec<Float>>>,
    stddev_by_level: Option<FxHashMap<Variable, Vec<Float>>>,
    diffs_stddev_by_level: Option<FxHashMap<Variable, Vec<Float>>>,
}

/// All statistics tables needed by the assimilation.
#[derive(Clone, PartialEq, Debug)]
pub struct StatsTables {
    pub diffs_stddev_by_level: Arc<NormStats>,
    pub mean_by_level: Arc<NormStats>,
    pub stddev_by_level: Arc<NormStats>,
}

impl StatsTables {
    /// Reads statistics tables from YAML file.
    pub fn new_from_file(file_path: &Path) -> Result<Self, DatasetError> {
        debug!("Reading normalization statistics from {:?}", file_path);

        let data = fs::read(file_path)?;
        let raw: RawStatsFile = serde_yaml::from_slice(data.as_slice())?;

        let convert = |table: Option<FxHashMap<Variable, Vec<Float>>>, name| {
            let table = table.ok_or(DatasetError::MissingStatistics(name))?;
            let stats = table
                .into_iter()
                .fold(NormStats::new(), |stats, (var, values)| stats.with(var, &values));

            Ok::<_, DatasetError>(Arc::new(stats))
        };

        Ok(StatsTables {
            diffs_stddev_by_level: convert(raw.diffs_stddev_by_level, "diffs_stddev_by_level")?,
            mean_by_level: convert(raw.mean_by_level, "mean_by_level")?,
            stddev_by_level: convert(raw.stddev_by_level, "stddev_by_level")?,
        })
    }

    /// Normalizer of physical fields.
    pub fn original(&self) -> Normalizer {
        Normalizer::new(
            Arc::clone(&self.stddev_by_level),
            Some(Arc::clone(&self.mean_by_level)),
        )
    }

    /// Normalizer of difference fields, which are not shifted.
    pub fn difference(&self) -> Normalizer {
        Normalizer::new(Arc::clone(&self.diffs_stddev_by_level), None)
    }
}

/// Pure function object applying `(x - location) / scale`.
///
/// Variables without statistics are passed through with a warning.
#[derive(Clone, PartialEq, Debug)]
pub struct Normalizer {
    scales: Arc<NormStats>,
    locations: Option<Arc<NormStats>>,
}

impl Normalizer {
    pub fn new(scales: Arc<NormStats>, locations: Option<Arc<NormStats>>) -> Self {
        Normalizer { scales, locations }
    }

    pub fn normalize(&self, state: &State) -> Result<State, StateError> {
        let mut result = State::new();

        for (var, field) in state.iter() {
            let mut field = field.clone();

            if let Some(locations) = &self.locations {
                match locations.get(*var) {
                    Some(mean) => apply_by_level(*var, &mut field, mean, |x, m| x - m)?,
                    None => warn!("No normalization location found for {}", var.name()),
                }
            }

            match self.scales.get(*var) {
                Some(scale) => apply_by_level(*var, &mut field, scale, |x, s| x / s)?,
                None => warn!("No normalization scale found for {}", var.name()),
            }

            result.insert(*var, field);
        }

        Ok(result)
    }

    /// Inverse of [`Normalizer::normalize`].
    pub fn denormalize(&self, state: &State) -> Result<State, StateError> {
        let mut result = State::new();

        for (var, field) in state.iter() {
            let mut field = field.clone();

            if let Some(scale) = self.scales.get(*var) {
                apply_by_level(*var, &mut field, scale, |x, s| x * s)?;
            }

            if let Some(mean) = self.locations.as_ref().and_then(|l| l.get(*var)) {
                apply_by_level(*var, &mut field, mean, |x, m| x + m)?;
            }

            result.insert(*var, field);
        }

        Ok(result)
    }
}

/// Applies the statistic of each level to the corresponding slice
/// of the field. Single-valued statistics are broadcast to all levels.
fn apply_by_level(
    var: Variable,
    field: &mut Array3<Float>,
    stat: &Array1<Float>,
    op: impl Fn(Float, Float) -> Float,
) -> Result<(), StateError> {
    let levels = field.len_of(Axis(0));

    if stat.len() != levels && stat.len() != 1 {
        return Err(StateError::StatisticsMismatch(var));
    }

    for (i, mut level) in field.axis_iter_mut(Axis(0)).enumerate() {
        let value = if stat.len() == 1 { stat[0] } else { stat[i] };
        level.mapv_inplace(|x| op(x, value));
    }

    Ok(())
}
