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

//! Derived forcing fields that only depend on time and grid.
//!
//! Day and year progress are encoded as sine and cosine of the
//! phase, so the networks see a continuous signal across midnight
//! and across the new year.

use super::state::{Grid, State, Variable};
use crate::constants::{AVG_DAY_PER_YEAR, SEC_PER_DAY};
use crate::Float;
use chrono::NaiveDateTime;
use ndarray::Array3;
use std::f64::consts::PI;

/// Which network the forcings are prepared for.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ForcingKind {
    /// Input of the diffusion denoiser, carries the diffusion timestep.
    Normalized,
    /// Auxiliary input of the forecaster.
    Prediction,
}

/// Computes forcing fields for a single timestamp on the grid.
///
/// `timestep` is the diffusion timestep at which the denoiser is
/// evaluated, it is only used by [`ForcingKind::Normalized`].
pub fn compute_forcings(
    datetime: NaiveDateTime,
    grid: &Grid,
    timestep: usize,
    num_train_timesteps: usize,
    kind: ForcingKind,
) -> State {
    let (lat_len, lon_len) = grid.horizontal_shape();
    let seconds = datetime.timestamp() as Float;

    let year_phase = 2.0 * PI * year_progress(seconds);
    let year_sin = Array3::from_elem((1, lat_len, lon_len), year_phase.sin());
    let year_cos = Array3::from_elem((1, lat_len, lon_len), year_phase.cos());

    let day_sin = Array3::from_shape_fn((1, lat_len, lon_len), |(_, _, j)| {
        (2.0 * PI * day_progress(seconds, grid.lon[j])).sin()
    });
    let day_cos = Array3::from_shape_fn((1, lat_len, lon_len), |(_, _, j)| {
        (2.0 * PI * day_progress(seconds, grid.lon[j])).cos()
    });

    let forcings = State::new()
        .with(Variable::YearProgressSin, year_sin)
        .with(Variable::YearProgressCos, year_cos)
        .with(Variable::DayProgressSin, day_sin)
        .with(Variable::DayProgressCos, day_cos);

    match kind {
        ForcingKind::Prediction => forcings,
        ForcingKind::Normalized => {
            let fraction = timestep as Float / num_train_timesteps.max(1) as Float;

            forcings.with(
                Variable::DiffusionTimestep,
                Array3::from_elem((1, lat_len, lon_len), fraction),
            )
        }
    }
}

/// Fraction of the (average) year elapsed since the epoch, in `[0, 1)`.
pub fn year_progress(seconds_since_epoch: Float) -> Float {
    (seconds_since_epoch / SEC_PER_DAY / AVG_DAY_PER_YEAR).rem_euclid(1.0)
}

/// Fraction of the local solar day elapsed, in `[0, 1)`.
pub fn day_progress(seconds_since_epoch: Float, lon: Float) -> Float {
    let greenwich = seconds_since_epoch.rem_euclid(SEC_PER_DAY) / SEC_PER_DAY;

    (greenwich + lon / 360.0).rem_euclid(1.0)
}

#[cfg(test)]
mod tests {
    use super::{compute_forcings, day_progress, ForcingKind};
    use crate::model::state::{Grid, Variable};
    use chrono::NaiveDate;
    use float_cmp::approx_eq;

    #[test]
    fn day_progress_follows_longitude() {
        let noon = NaiveDate::from_ymd(2016, 1, 1).and_hms(12, 0, 0).timestamp() as f64;

        assert!(approx_eq!(f64, day_progress(noon, 0.0), 0.5));
        assert!(approx_eq!(f64, day_progress(noon, 90.0), 0.75));
        assert!(approx_eq!(f64, day_progress(noon, 180.0), 0.0));
    }

    #[test]
    fn forcing_variants() {
        let grid = Grid::regular(3, 8, &[500]);
        let datetime = NaiveDate::from_ymd(2016, 1, 1).and_hms(6, 0, 0);

        let prediction = compute_forcings(datetime, &grid, 1, 1000, ForcingKind::Prediction);
        let normalized = compute_forcings(datetime, &grid, 1, 1000, ForcingKind::Normalized);

        assert!(!prediction.contains(Variable::DiffusionTimestep));
        assert_eq!(normalized.len(), prediction.len() + 1);

        let timestep = normalized.field(Variable::DiffusionTimestep).unwrap();
        assert!(timestep.iter().all(|v| approx_eq!(f64, *v, 0.001)));

        for (_, field) in prediction.iter() {
            assert_eq!(field.shape(), &[1, 3, 8]);
            assert!(field.iter().all(|v| (-1.0..=1.0).contains(v)));
        }
    }
}
