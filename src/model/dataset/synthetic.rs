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

//! Analytic dataset for observing-system simulation experiments.
//!
//! Ground truth is a level-dependent background profile with
//! a travelling zonal wave on top. The forecaster seed is the truth
//! with a constant bias, so the benefit of assimilating measurements
//! can be checked without any external data.

use super::{Batch, Dataset, SparseSampler};
use crate::constants::SOLAR_CONSTANT;
use crate::model::forcing::{day_progress, year_progress};
use crate::model::state::{Grid, State, Variable};
use crate::{errors::DatasetError, Float};
use chrono::{Duration, NaiveDateTime};
use ndarray::Array3;
use std::f64::consts::PI;

/// Zonal wavenumber of the travelling wave.
const WAVENUMBER: Float = 2.0;

/// Period of the travelling wave in hours.
const WAVE_PERIOD_HOURS: Float = 120.0;

#[derive(Clone, Debug)]
pub struct SyntheticDataset {
    grid: Grid,
    start: NaiveDateTime,
    timestep: Duration,
    offset: usize,
    len: usize,
    variables: Vec<Variable>,
    sampler: SparseSampler,
    amplitude: Float,
    prediction_bias: Float,
}

impl SyntheticDataset {
    /// Dataset of `len` steps beginning `offset` steps after `start`.
    pub fn new(
        grid: Grid,
        start: NaiveDateTime,
        timestep_hours: i64,
        offset: usize,
        len: usize,
        sampler: SparseSampler,
    ) -> Self {
        let variables = Variable::PRESSURE_LEVEL
            .iter()
            .chain(Variable::SURFACE_LEVEL.iter())
            .copied()
            .collect();

        SyntheticDataset {
            grid,
            start,
            timestep: Duration::hours(timestep_hours),
            offset,
            len,
            variables,
            sampler,
            amplitude: 1.0,
            prediction_bias: 0.5,
        }
    }

    /// Restricts prognostic variables to the given set.
    pub fn with_variables(mut self, variables: &[Variable]) -> Self {
        self.variables = variables.to_vec();
        self
    }

    /// Relative amplitude of the travelling wave, `0` gives constant fields.
    pub fn with_amplitude(mut self, amplitude: Float) -> Self {
        self.amplitude = amplitude;
        self
    }

    /// Bias of the forecaster seed in units of variable variability.
    pub fn with_prediction_bias(mut self, bias: Float) -> Self {
        self.prediction_bias = bias;
        self
    }

    fn datetime(&self, index: usize) -> NaiveDateTime {
        self.start + self.timestep * (self.offset + index) as i32
    }

    fn truth(&self, datetime: NaiveDateTime) -> State {
        let hours = (datetime - self.start).num_minutes() as Float / 60.0;
        let omega = 2.0 * PI / WAVE_PERIOD_HOURS;
        let mut state = State::new();

        for var in &self.variables {
            let levels = &self.grid.levels;
            let (var, grid, amplitude) = (*var, &self.grid, self.amplitude);
            let phase = var as usize as Float;

            let field = Array3::from_shape_fn(grid.field_shape(var), |(l, i, j)| {
                let level = if var.is_pressure_level() {
                    Float::from(levels[l])
                } else {
                    1000.0
                };
                let lat = grid.lat[i].to_radians();
                let lon = grid.lon[j].to_radians();
                let wave = (WAVENUMBER * lon - omega * hours + phase).sin();

                background(var, level) + amplitude * variability(var) * lat.cos() * wave
            });

            state.insert(var, field);
        }

        state.with(Variable::ToaIncidentSolarRadiation, self.solar_radiation(datetime))
    }

    /// Instantaneous top-of-atmosphere insolation.
    fn solar_radiation(&self, datetime: NaiveDateTime) -> Array3<Float> {
        let seconds = datetime.timestamp() as Float;
        // equinox falls roughly at 0.2164 of the year
        let declination = 23.44_f64.to_radians() * (2.0 * PI * (year_progress(seconds) - 0.2164)).sin();
        let grid = &self.grid;

        Array3::from_shape_fn(grid.field_shape(Variable::ToaIncidentSolarRadiation), |(_, i, j)| {
            let lat = grid.lat[i].to_radians();
            let hour_angle = 2.0 * PI * (day_progress(seconds, grid.lon[j]) - 0.5);
            let cos_zenith =
                lat.sin() * declination.sin() + lat.cos() * declination.cos() * hour_angle.cos();

            SOLAR_CONSTANT * cos_zenith.max(0.0)
        })
    }

    fn static_fields(&self) -> State {
        let grid = &self.grid;
        let orography = Array3::from_shape_fn(
            grid.field_shape(Variable::GeopotentialAtSurface),
            |(_, i, j)| {
                let lat = grid.lat[i].to_radians();
                let lon = grid.lon[j].to_radians();

                9.806_65 * 1000.0 * ((2.0 * lat).sin() * (3.0 * lon).cos()).max(0.0)
            },
        );
        let land_sea_mask = orography.mapv(|z| if z > 0.0 { 1.0 } else { 0.0 });

        State::new()
            .with(Variable::GeopotentialAtSurface, orography)
            .with(Variable::LandSeaMask, land_sea_mask)
    }

    fn biased(&self, truth: &State) -> State {
        let mut prediction = truth.select(&self.variables);

        for (var, field) in prediction.iter_mut() {
            let bias = self.prediction_bias * variability(*var);
            field.mapv_inplace(|x| x + bias);
        }

        prediction
    }
}

impl Dataset for SyntheticDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn batch(&self, index: usize, interpolate: bool) -> Result<Batch, DatasetError> {
        if index >= self.len {
            return Err(DatasetError::OutOfRange(index, self.len));
        }

        let datetime = self.datetime(index);
        let ground_truth = self.truth(datetime);
        let prediction = self.biased(&ground_truth);

        let measurements = if interpolate {
            let cells = self.sampler.sample_cells(self.offset + index, &self.grid);
            let prognostic = ground_truth.select(&self.variables);

            Some(self.sampler.observe(&cells, &prognostic, &prediction, &self.grid)?)
        } else {
            None
        };

        Ok(Batch {
            datetime,
            grid: self.grid.clone(),
            ground_truth,
            static_fields: self.static_fields(),
            prediction,
            measurements,
        })
    }
}

/// Background value of variable at pressure level (hPa).
fn background(var: Variable, level: Float) -> Float {
    let sigma = level / 1000.0;

    match var {
        Variable::Temperature => 288.0 * sigma.powf(0.19),
        Variable::Geopotential => 9.806_65 * 7600.0 * (1013.25 / level).ln(),
        Variable::UWind => 10.0 * (1.0 - sigma),
        Variable::SpecificHumidity => 0.01 * sigma.powi(3),
        Variable::Temperature2m => 288.0,
        Variable::MeanSeaLevelPressure => 101_325.0,
        Variable::TotalPrecipitation6hr => 0.001,
        _ => 0.0,
    }
}

/// Typical variability of variable, scales waves and seed bias.
fn variability(var: Variable) -> Float {
    match var {
        Variable::Temperature | Variable::Temperature2m => 5.0,
        Variable::Geopotential => 300.0,
        Variable::UWind | Variable::VWind => 5.0,
        Variable::UWind10m | Variable::VWind10m => 3.0,
        Variable::VerticalVelocity => 0.1,
        Variable::SpecificHumidity => 0.001,
        Variable::MeanSeaLevelPressure => 500.0,
        Variable::TotalPrecipitation6hr => 0.0005,
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::SyntheticDataset;
    use crate::errors::DatasetError;
    use crate::model::dataset::{Dataset, SparseSampler};
    use crate::model::state::{Grid, Variable};
    use chrono::NaiveDate;

    fn dataset() -> SyntheticDataset {
        SyntheticDataset::new(
            Grid::regular(7, 12, &[500, 850]),
            NaiveDate::from_ymd(2016, 1, 1).and_hms(0, 0, 0),
            6,
            2,
            3,
            SparseSampler::new(10, 1.0, false, 42),
        )
    }

    #[test]
    fn batch_contents() {
        let batch = dataset().batch(0, true).unwrap();

        assert_eq!(batch.datetime, NaiveDate::from_ymd(2016, 1, 1).and_hms(12, 0, 0));
        assert!(batch.ground_truth.contains(Variable::ToaIncidentSolarRadiation));
        assert!(!batch.prediction.contains(Variable::ToaIncidentSolarRadiation));
        assert!(batch.prediction.contains(Variable::TotalPrecipitation6hr));
        assert_eq!(batch.ground_truth.field(Variable::Temperature).unwrap().shape(), &[2, 7, 12]);
        assert_eq!(batch.static_fields.len(), 2);

        let measurements = batch.measurements.unwrap();
        assert_eq!(measurements.mask.dim(), (7, 12));
        assert_eq!(measurements.interpolated.variables(), batch.prediction.variables());
    }

    #[test]
    fn interpolation_on_request() {
        assert!(dataset().batch(2, false).unwrap().measurements.is_none());
    }

    #[test]
    fn out_of_range() {
        assert!(matches!(dataset().batch(3, true), Err(DatasetError::OutOfRange(3, 3))));
    }

    #[test]
    fn constant_fields_without_wave() {
        let dataset = dataset().with_variables(&[Variable::Geopotential]).with_amplitude(0.0);

        let first = dataset.batch(0, false).unwrap();
        let second = dataset.batch(1, false).unwrap();

        assert_eq!(
            first.ground_truth.field(Variable::Geopotential),
            second.ground_truth.field(Variable::Geopotential)
        );
        assert_eq!(first.prediction.variables(), vec![Variable::Geopotential]);
    }
}
