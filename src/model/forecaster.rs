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

//! Interface of the forecaster advancing the atmospheric state
//! by one step.
//!
//! The forecaster is a pure function of its (immutable, pretrained)
//! parameters and inputs. Implementations receive borrowed states and
//! return a new one, so the assimilation keeps exclusive ownership
//! of its rolling state.

use super::state::{check_same_grid, check_shape, State, TimeWindow, Variable};
use crate::errors::{ForecastError, StateError};
use log::debug;
use std::collections::BTreeMap;

/// Variable set and field shapes the forecaster has to produce.
#[derive(Clone, PartialEq, Debug)]
pub struct TargetTemplate {
    shapes: BTreeMap<Variable, Vec<usize>>,
}

impl TargetTemplate {
    pub fn from_state(state: &State) -> Self {
        let shapes = state
            .iter()
            .map(|(var, field)| (*var, field.shape().to_vec()))
            .collect();

        TargetTemplate { shapes }
    }

    pub fn variables(&self) -> Vec<Variable> {
        self.shapes.keys().copied().collect()
    }

    /// Checks that the state has exactly the template variables and shapes.
    pub fn check(&self, state: &State) -> Result<(), StateError> {
        let found = state.variables();

        if found != self.variables() {
            return Err(StateError::VariableSetMismatch(self.variables(), found));
        }

        for (var, shape) in &self.shapes {
            check_shape(*var, shape, state.field(*var)?.shape())?;
        }

        Ok(())
    }
}

/// Everything the forecaster is called with.
#[derive(Copy, Clone, Debug)]
pub struct ForecastInputs<'a> {
    pub inputs: TimeWindow<'a>,
    pub norm_static: &'a State,
    pub norm_forcings: &'a State,
    pub targets_template: &'a TargetTemplate,
}

/// Construction options of a forecaster.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ForecasterOptions {
    /// Recompute activations in the backward pass instead of storing them,
    /// needed to fit the 0.25 degree network in accelerator memory.
    pub checkpointing: bool,
}

/// Black-box forecaster mapping two adjacent states to the next one.
pub trait Forecaster: Sync {
    fn predict(&self, inputs: &ForecastInputs) -> Result<State, ForecastError>;
}

/// Baseline forecaster: the next state equals the most recent one.
#[derive(Copy, Clone, Debug, Default)]
pub struct Persistence {
    options: ForecasterOptions,
}

impl Persistence {
    pub fn new(options: ForecasterOptions) -> Self {
        debug!("Creating persistence forecaster with {:?}", options);

        Persistence { options }
    }

    pub fn options(&self) -> ForecasterOptions {
        self.options
    }
}

impl Forecaster for Persistence {
    fn predict(&self, inputs: &ForecastInputs) -> Result<State, ForecastError> {
        check_same_grid(
            inputs.inputs.current,
            &[inputs.inputs.previous, inputs.norm_static, inputs.norm_forcings],
        )?;

        let prediction = inputs
            .inputs
            .current
            .select(&inputs.targets_template.variables());

        inputs
            .targets_template
            .check(&prediction)
            .map_err(ForecastError::TemplateMismatch)?;

        Ok(prediction)
    }
}

#[cfg(test)]
mod tests {
    use super::{ForecastInputs, Forecaster, ForecasterOptions, Persistence, TargetTemplate};
    use crate::errors::ForecastError;
    use crate::model::state::{Grid, State, TimeWindow, Variable};
    use ndarray::Array3;

    #[test]
    fn persistence_returns_latest_state() {
        let grid = Grid::regular(2, 3, &[500]);
        let field = |v: f64| Array3::from_elem(grid.field_shape(Variable::Geopotential), v);
        let previous = State::new()
            .with(Variable::Geopotential, field(1.0))
            .with(Variable::DayProgressSin, Array3::zeros((1, 2, 3)));
        let current = State::new()
            .with(Variable::Geopotential, field(2.0))
            .with(Variable::DayProgressSin, Array3::zeros((1, 2, 3)));
        let template = TargetTemplate::from_state(&State::new().with(Variable::Geopotential, field(0.0)));
        let empty = State::new();

        let inputs = ForecastInputs {
            inputs: TimeWindow::new(&previous, &current).unwrap(),
            norm_static: &empty,
            norm_forcings: &empty,
            targets_template: &template,
        };

        let prediction = Persistence::new(ForecasterOptions::default()).predict(&inputs).unwrap();

        assert_eq!(prediction, State::new().with(Variable::Geopotential, field(2.0)));
    }

    #[test]
    fn persistence_checks_template() {
        let grid = Grid::regular(2, 3, &[500]);
        let state = State::new().with(Variable::Temperature2m, Array3::zeros(grid.field_shape(Variable::Temperature2m)));
        let template = TargetTemplate::from_state(&State::new().with(Variable::Geopotential, Array3::zeros((1, 2, 3))));
        let empty = State::new();

        let inputs = ForecastInputs {
            inputs: TimeWindow::new(&state, &state).unwrap(),
            norm_static: &empty,
            norm_forcings: &empty,
            targets_template: &template,
        };

        assert!(matches!(
            Persistence::default().predict(&inputs),
            Err(ForecastError::TemplateMismatch(_))
        ));
    }
}
