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

//! Error statistics of a predicted state against ground truth.

use crate::constants::{HEADLINE_KEY_PREFIX, HEADLINE_LEVEL};
use crate::errors::StateError;
use crate::model::state::{check_shape, Grid, State, Variable};
use crate::Float;
use ndarray::{ArrayView2, Axis};
use std::collections::BTreeMap;

/// Root-mean-square error per level, one column per variable.
#[derive(Clone, PartialEq, Debug)]
pub struct RmseTable {
    pub data_type: String,
    /// Row labels, pressure in hPa or `0` for the surface.
    pub levels: Vec<u16>,
    pub columns: Vec<(Variable, Vec<Float>)>,
}

impl RmseTable {
    fn new(data_type: &str, levels: Vec<u16>) -> Self {
        RmseTable {
            data_type: data_type.to_string(),
            levels,
            columns: vec![],
        }
    }

    #[cfg(test)]
    pub fn column(&self, var: Variable) -> Option<&[Float]> {
        self.columns
            .iter()
            .find(|(column_var, _)| *column_var == var)
            .map(|(_, values)| values.as_slice())
    }
}

/// Computes per-level RMSE tables of pressure-level and surface variables
/// present in `diff`, in canonical variable order.
///
/// Each value is the unweighted mean over latitude and longitude of the
/// squared difference, square-rooted.
pub fn calculate_stat_rmse(
    diff: &State,
    grid: &Grid,
    data_type: &str,
) -> Result<(RmseTable, RmseTable), StateError> {
    let mut pressure = RmseTable::new(data_type, grid.levels.clone());

    for var in Variable::PRESSURE_LEVEL {
        if let Some(field) = diff.get(var) {
            check_field(var, grid, field.shape())?;

            let values = field.axis_iter(Axis(0)).map(rmse).collect();
            pressure.columns.push((var, values));
        }
    }

    let surface_vars: &[Variable] = if diff.contains(Variable::TotalPrecipitation6hr) {
        &Variable::SURFACE_LEVEL
    } else {
        &Variable::SURFACE_LEVEL_NO_TP
    };

    let mut surface = RmseTable::new(data_type, vec![0]);

    for &var in surface_vars {
        if let Some(field) = diff.get(var) {
            check_field(var, grid, field.shape())?;

            surface
                .columns
                .push((var, vec![rmse(field.index_axis(Axis(0), 0))]));
        }
    }

    Ok((pressure, surface))
}

/// Scalar RMSE of every variable in `diff`, pressure-level variables
/// taken at 500 hPa, keyed for telemetry.
pub fn headline_rmse(diff: &State, grid: &Grid) -> Result<BTreeMap<String, Float>, StateError> {
    let mut metrics = BTreeMap::new();

    for (var, field) in diff.iter() {
        let value = if var.is_pressure_level() {
            let level = grid.level_index(HEADLINE_LEVEL)?;
            rmse(field.index_axis(Axis(0), level))
        } else {
            (field.mapv(|d| d * d).mean().unwrap_or(0.0)).sqrt()
        };

        metrics.insert(headline_key(*var), value);
    }

    Ok(metrics)
}

pub fn headline_key(var: Variable) -> String {
    format!("{}{}", HEADLINE_KEY_PREFIX, var.name())
}

fn check_field(var: Variable, grid: &Grid, found: &[usize]) -> Result<(), StateError> {
    let (levels, lat, lon) = grid.field_shape(var);

    check_shape(var, &[levels, lat, lon], found)
}

fn rmse(slice: ArrayView2<Float>) -> Float {
    slice.mapv(|d| d * d).mean().unwrap_or(0.0).sqrt()
}

#[cfg(test)]
mod tests {
    use super::{calculate_stat_rmse, headline_key, headline_rmse};
    use crate::errors::StateError;
    use crate::model::state::{Grid, State, Variable};
    use float_cmp::approx_eq;
    use ndarray::Array3;

    fn grid() -> Grid {
        Grid::regular(3, 4, &[500, 850])
    }

    #[test]
    fn zero_difference() {
        let diff = State::new()
            .with(Variable::Temperature, Array3::zeros((2, 3, 4)))
            .with(Variable::Temperature2m, Array3::zeros((1, 3, 4)));

        let (pressure, surface) = calculate_stat_rmse(&diff, &grid(), "GraphCast_Pred").unwrap();

        assert_eq!(pressure.levels, vec![500, 850]);
        assert_eq!(pressure.column(Variable::Temperature), Some(&[0.0, 0.0][..]));
        assert_eq!(surface.levels, vec![0]);
        assert_eq!(surface.column(Variable::Temperature2m), Some(&[0.0][..]));
        assert_eq!(pressure.data_type, "GraphCast_Pred");
    }

    #[test]
    fn per_level_values() {
        // level 0 is constant 2, level 1 alternates sign around 3
        let field = Array3::from_shape_fn((2, 3, 4), |(l, _, j)| {
            if l == 0 {
                2.0
            } else if j % 2 == 0 {
                3.0
            } else {
                -3.0
            }
        });
        let diff = State::new().with(Variable::Geopotential, field);

        let (pressure, surface) = calculate_stat_rmse(&diff, &grid(), "GraphCast_Pred").unwrap();
        let column = pressure.column(Variable::Geopotential).unwrap();

        assert!(approx_eq!(f64, column[0], 2.0, ulps = 2));
        assert!(approx_eq!(f64, column[1], 3.0, ulps = 2));
        assert!(surface.columns.is_empty());

        let headline = headline_rmse(&diff, &grid()).unwrap();
        assert!(approx_eq!(
            f64,
            headline[&headline_key(Variable::Geopotential)],
            2.0,
            ulps = 2
        ));
    }

    #[test]
    fn precipitation_column_follows_presence() {
        let with_tp = State::new()
            .with(Variable::Temperature2m, Array3::ones((1, 3, 4)))
            .with(Variable::TotalPrecipitation6hr, Array3::ones((1, 3, 4)));

        let (_, surface) = calculate_stat_rmse(&with_tp, &grid(), "GraphCast_Pred").unwrap();
        assert!(surface.column(Variable::TotalPrecipitation6hr).is_some());

        let without_tp = with_tp.drop_var(Variable::TotalPrecipitation6hr);
        let (_, surface) = calculate_stat_rmse(&without_tp, &grid(), "GraphCast_Pred").unwrap();
        assert!(surface.column(Variable::TotalPrecipitation6hr).is_none());
        assert_eq!(surface.columns.len(), 1);
    }

    #[test]
    fn rmse_is_non_negative() {
        let diff = State::new().with(
            Variable::Temperature,
            Array3::from_shape_fn((2, 3, 4), |(l, i, j)| l as f64 - (i * j) as f64),
        );

        let (pressure, _) = calculate_stat_rmse(&diff, &grid(), "GraphCast_Pred").unwrap();

        for (_, values) in &pressure.columns {
            assert!(values.iter().all(|v| *v >= 0.0));
        }
    }

    #[test]
    fn headline_needs_500_hpa() {
        let grid = Grid::regular(3, 4, &[850]);
        let diff = State::new().with(Variable::Temperature, Array3::zeros((1, 3, 4)));

        assert_eq!(headline_rmse(&diff, &grid), Err(StateError::MissingLevel(500)));
    }
}
