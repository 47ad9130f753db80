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

//! Gridded atmospheric states and operations on them.
//!
//! Every field is stored as a 3D array with `(level, lat, lon)` axes.
//! Surface, forcing and static variables carry a single level,
//! so all variables can be handled uniformly by normalization,
//! the diffusion correction and error statistics.

use crate::{errors::StateError, Float};
use ndarray::{Array1, Array3, Zip};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Enum of all variables that can appear in a state.
///
/// Order of variants determines the iteration order of [`State`]
/// fields, which in turn fixes the order in which random noise is
/// drawn for each field.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize)]
pub enum Variable {
    #[serde(rename = "temperature")]
    Temperature,
    #[serde(rename = "geopotential")]
    Geopotential,
    #[serde(rename = "u_component_of_wind")]
    UWind,
    #[serde(rename = "v_component_of_wind")]
    VWind,
    #[serde(rename = "vertical_velocity")]
    VerticalVelocity,
    #[serde(rename = "specific_humidity")]
    SpecificHumidity,
    #[serde(rename = "2m_temperature")]
    Temperature2m,
    #[serde(rename = "mean_sea_level_pressure")]
    MeanSeaLevelPressure,
    #[serde(rename = "10m_v_component_of_wind")]
    VWind10m,
    #[serde(rename = "10m_u_component_of_wind")]
    UWind10m,
    #[serde(rename = "total_precipitation_6hr")]
    TotalPrecipitation6hr,
    #[serde(rename = "toa_incident_solar_radiation")]
    ToaIncidentSolarRadiation,
    #[serde(rename = "year_progress_sin")]
    YearProgressSin,
    #[serde(rename = "year_progress_cos")]
    YearProgressCos,
    #[serde(rename = "day_progress_sin")]
    DayProgressSin,
    #[serde(rename = "day_progress_cos")]
    DayProgressCos,
    #[serde(rename = "diffusion_timestep")]
    DiffusionTimestep,
    #[serde(rename = "geopotential_at_surface")]
    GeopotentialAtSurface,
    #[serde(rename = "land_sea_mask")]
    LandSeaMask,
}

impl Variable {
    pub const PRESSURE_LEVEL: [Variable; 6] = [
        Variable::Temperature,
        Variable::Geopotential,
        Variable::UWind,
        Variable::VWind,
        Variable::VerticalVelocity,
        Variable::SpecificHumidity,
    ];

    pub const SURFACE_LEVEL: [Variable; 5] = [
        Variable::Temperature2m,
        Variable::MeanSeaLevelPressure,
        Variable::VWind10m,
        Variable::UWind10m,
        Variable::TotalPrecipitation6hr,
    ];

    pub const SURFACE_LEVEL_NO_TP: [Variable; 4] = [
        Variable::Temperature2m,
        Variable::MeanSeaLevelPressure,
        Variable::VWind10m,
        Variable::UWind10m,
    ];

    /// Name of the variable as used in datasets and telemetry keys.
    pub fn name(&self) -> &'static str {
        match self {
            Variable::Temperature => "temperature",
            Variable::Geopotential => "geopotential",
            Variable::UWind => "u_component_of_wind",
            Variable::VWind => "v_component_of_wind",
            Variable::VerticalVelocity => "vertical_velocity",
            Variable::SpecificHumidity => "specific_humidity",
            Variable::Temperature2m => "2m_temperature",
            Variable::MeanSeaLevelPressure => "mean_sea_level_pressure",
            Variable::VWind10m => "10m_v_component_of_wind",
            Variable::UWind10m => "10m_u_component_of_wind",
            Variable::TotalPrecipitation6hr => "total_precipitation_6hr",
            Variable::ToaIncidentSolarRadiation => "toa_incident_solar_radiation",
            Variable::YearProgressSin => "year_progress_sin",
            Variable::YearProgressCos => "year_progress_cos",
            Variable::DayProgressSin => "day_progress_sin",
            Variable::DayProgressCos => "day_progress_cos",
            Variable::DiffusionTimestep => "diffusion_timestep",
            Variable::GeopotentialAtSurface => "geopotential_at_surface",
            Variable::LandSeaMask => "land_sea_mask",
        }
    }

    /// Checks if variable carries the vertical (pressure level) axis.
    pub fn is_pressure_level(&self) -> bool {
        Variable::PRESSURE_LEVEL.contains(self)
    }
}

/// Regular latitude-longitude grid with pressure levels.
#[derive(Clone, PartialEq, Debug)]
pub struct Grid {
    pub lat: Array1<Float>,
    pub lon: Array1<Float>,
    pub levels: Vec<u16>,
}

impl Grid {
    /// Global grid with poles included and longitudes starting at Greenwich.
    pub fn regular(lat_points: usize, lon_points: usize, levels: &[u16]) -> Self {
        let lon_step = 360.0 / lon_points as Float;

        Grid {
            lat: Array1::linspace(-90.0, 90.0, lat_points),
            lon: Array1::from_shape_fn(lon_points, |i| i as Float * lon_step),
            levels: levels.to_vec(),
        }
    }

    /// Horizontal shape `(lat, lon)`.
    pub fn horizontal_shape(&self) -> (usize, usize) {
        (self.lat.len(), self.lon.len())
    }

    /// Shape of a field for given variable on this grid.
    pub fn field_shape(&self, var: Variable) -> (usize, usize, usize) {
        let (lat, lon) = self.horizontal_shape();

        if var.is_pressure_level() {
            (self.levels.len(), lat, lon)
        } else {
            (1, lat, lon)
        }
    }

    pub fn level_index(&self, level: u16) -> Result<usize, StateError> {
        self.levels
            .iter()
            .position(|l| *l == level)
            .ok_or(StateError::MissingLevel(level))
    }
}

/// Mapping from variables to gridded fields.
///
/// It mirrors the semantics of a labelled dataset: arithmetic
/// aligns on the variables present in both operands and merging
/// refuses conflicting fields.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct State {
    fields: BTreeMap<Variable, Array3<Float>>,
}

impl State {
    pub fn new() -> Self {
        State::default()
    }

    pub fn insert(&mut self, var: Variable, field: Array3<Float>) -> Option<Array3<Float>> {
        self.fields.insert(var, field)
    }

    pub fn with(mut self, var: Variable, field: Array3<Float>) -> Self {
        self.fields.insert(var, field);
        self
    }

    pub fn get(&self, var: Variable) -> Option<&Array3<Float>> {
        self.fields.get(&var)
    }

    /// Same as [`State::get`] but a missing variable is an error.
    pub fn field(&self, var: Variable) -> Result<&Array3<Float>, StateError> {
        self.fields.get(&var).ok_or(StateError::MissingVariable(var))
    }

    pub fn contains(&self, var: Variable) -> bool {
        self.fields.contains_key(&var)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn variables(&self) -> Vec<Variable> {
        self.fields.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Variable, &Array3<Float>)> {
        self.fields.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Variable, &mut Array3<Float>)> {
        self.fields.iter_mut()
    }

    /// Removes the variable, missing variable is silently ignored.
    pub fn drop_var(mut self, var: Variable) -> Self {
        self.fields.remove(&var);
        self
    }

    /// New state with only requested variables that are present.
    pub fn select(&self, vars: &[Variable]) -> State {
        let fields = self
            .fields
            .iter()
            .filter(|(var, _)| vars.contains(var))
            .map(|(var, field)| (*var, field.clone()))
            .collect();

        State { fields }
    }

    /// Union of variables of both states.
    ///
    /// A variable present in both states must have identical fields.
    pub fn merge(&self, other: &State) -> Result<State, StateError> {
        let mut fields = self.fields.clone();

        for (var, field) in &other.fields {
            match fields.get(var) {
                Some(existing) if existing != field => {
                    return Err(StateError::MergeConflict(*var))
                }
                Some(_) => {}
                None => {
                    fields.insert(*var, field.clone());
                }
            }
        }

        Ok(State { fields })
    }

    /// Element-wise difference on variables present in both states.
    pub fn sub(&self, other: &State) -> Result<State, StateError> {
        self.zip_with(other, |a, b| a - b)
    }

    /// Element-wise sum on variables present in both states.
    pub fn add(&self, other: &State) -> Result<State, StateError> {
        self.zip_with(other, |a, b| a + b)
    }

    fn zip_with(
        &self,
        other: &State,
        op: impl Fn(Float, Float) -> Float + Sync,
    ) -> Result<State, StateError> {
        let mut fields = BTreeMap::new();

        for (var, lhs) in &self.fields {
            let rhs = match other.fields.get(var) {
                Some(rhs) => rhs,
                None => continue,
            };

            check_shape(*var, lhs.shape(), rhs.shape())?;

            let mut result = Array3::zeros(lhs.raw_dim());
            Zip::from(&mut result)
                .and(lhs)
                .and(rhs)
                .par_for_each(|r, &a, &b| *r = op(a, b));

            fields.insert(*var, result);
        }

        Ok(State { fields })
    }

    /// Checks that both states have the same variables with the same shapes.
    pub fn check_compatible(&self, other: &State) -> Result<(), StateError> {
        if !self.fields.keys().eq(other.fields.keys()) {
            return Err(StateError::VariableSetMismatch(
                self.variables(),
                other.variables(),
            ));
        }

        for (var, field) in &self.fields {
            check_shape(*var, field.shape(), other.fields[var].shape())?;
        }

        Ok(())
    }
}

pub(crate) fn check_shape(
    var: Variable,
    expected: &[usize],
    found: &[usize],
) -> Result<(), StateError> {
    if expected != found {
        return Err(StateError::ShapeMismatch {
            var,
            expected: expected.to_vec(),
            found: found.to_vec(),
        });
    }

    Ok(())
}

/// Checks that every field of `others` lies on the horizontal grid of `reference`.
pub fn check_same_grid(reference: &State, others: &[&State]) -> Result<(), StateError> {
    let (var, field) = match reference.iter().next() {
        Some((var, field)) => (*var, field),
        None => return Ok(()),
    };
    let horizontal = &field.shape()[1..];

    for state in others {
        for (_, other) in state.iter() {
            check_shape(var, horizontal, &other.shape()[1..])?;
        }
    }

    Ok(())
}

/// Two time-adjacent states, the only form in which
/// the forecaster accepts its inputs.
#[derive(Copy, Clone, Debug)]
pub struct TimeWindow<'a> {
    pub previous: &'a State,
    pub current: &'a State,
}

impl<'a> TimeWindow<'a> {
    /// Concatenates two states along time, which requires
    /// equal variable sets and shapes.
    pub fn new(previous: &'a State, current: &'a State) -> Result<Self, StateError> {
        previous.check_compatible(current)?;

        Ok(TimeWindow { previous, current })
    }
}
