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

//! Module containing constants used by the model.

use crate::Float;

/// Pressure levels (in hPa) of the forecaster, ordered from top of the atmosphere.
pub const PRESSURE_LEVELS: [u16; 13] = [
    50, 100, 150, 200, 250, 300, 400, 500, 600, 700, 850, 925, 1000,
];

/// Level of the headline metric reported in progress and telemetry.
pub const HEADLINE_LEVEL: u16 = 500;

/// Key prefix of per-variable scalar metrics.
pub const HEADLINE_KEY_PREFIX: &str = "val/graphcast_rmse500hPa/";

/// Data type label of forecaster error tables.
pub const GRAPHCAST_DATA_TYPE: &str = "GraphCast_Pred";

pub const SEC_PER_DAY: Float = 86_400.0;

/// Average length of a year in days (tropical year).
pub const AVG_DAY_PER_YEAR: Float = 365.24219;

/// Solar constant (W m^-2), used by the synthetic top-of-atmosphere radiation.
pub const SOLAR_CONSTANT: Float = 1361.0;

/// Maximum beta of the cosine noise schedule.
pub const MAX_BETA: Float = 0.999;
