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

//! Diffusion Data Assimilation (DiffDA) runs autoregressive data
//! assimilation on top of a neural weather forecaster.
//!
//! The first two steps of a run correct the forecaster's seed
//! predictions with a diffusion model conditioned on sparse
//! measurements (RePaint inpainting). Afterwards the forecaster
//! advances the corrected state on its own and the error against
//! ground truth is tracked at every step.

mod constants;
mod errors;
mod model;

use cap::Cap;
use env_logger::Env;
use log::{error, info};
use std::alloc;

type Float = f64;

/// Global allocator used by the model.
///
/// Use of static global allocator allows for capping the memory to the limit set by user
/// in configuration file. Gridded fields at 0.25 degree resolution are large and
/// an [OOM error](https://en.wikipedia.org/wiki/Out_of_memory) with a message
/// is much easier to act on than a killed process.
#[global_allocator]
static ALLOCATOR: Cap<alloc::System> = Cap::new(alloc::System, usize::MAX);

/// The main program function.
/// Prepares the runtime environment and calls the [`model::main`].
///
/// To provide meaningful and high-quality error messages the `env_logger`
/// needs to be initiated before any log messages are possible to occur.
fn main() {
    #[cfg(not(feature = "debug"))]
    let logger_env = Env::new().filter_or("DIFFDA_LOG_LEVEL", "info");

    #[cfg(feature = "debug")]
    let logger_env = Env::new().filter_or("DIFFDA_LOG_LEVEL", "debug");

    env_logger::Builder::from_env(logger_env)
        .format_timestamp_millis()
        .init();

    match model::main() {
        Ok(_) => info!("Assimilation finished. Check the output directory and log."),
        Err(err) => error!("Assimilation failed with error: {}", err),
    }
}
