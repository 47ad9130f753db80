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

//! Noise schedule of the diffusion process and the RePaint
//! timestep plan with resampling jumps.

use crate::constants::MAX_BETA;
use crate::{errors::RepaintError, Float};
use ndarray::Array1;
use serde::Deserialize;
use std::f64::consts::FRAC_PI_2;

/// Shape of the forward-process variance schedule.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
    #[serde(rename = "squaredcos_cap_v2")]
    SquaredCosCapV2,
    Sigmoid,
}

/// Precomputed betas and cumulative alphas of the forward process.
#[derive(Clone, PartialEq, Debug)]
pub struct NoiseSchedule {
    betas: Array1<Float>,
    alphas_cumprod: Array1<Float>,
}

impl NoiseSchedule {
    pub fn new(
        kind: BetaSchedule,
        num_train_timesteps: usize,
        beta_start: Float,
        beta_end: Float,
    ) -> Result<Self, RepaintError> {
        if num_train_timesteps < 1 {
            return Err(RepaintError::InvalidSchedule(
                "number of train timesteps cannot be less than 1",
            ));
        }

        if !(beta_start > 0.0 && beta_start <= beta_end && beta_end < 1.0) {
            return Err(RepaintError::InvalidSchedule(
                "betas must satisfy 0 < beta_start <= beta_end < 1",
            ));
        }

        let betas = match kind {
            BetaSchedule::Linear => Array1::linspace(beta_start, beta_end, num_train_timesteps),
            BetaSchedule::ScaledLinear => {
                Array1::linspace(beta_start.sqrt(), beta_end.sqrt(), num_train_timesteps)
                    .mapv(|b| b * b)
            }
            BetaSchedule::SquaredCosCapV2 => cosine_betas(num_train_timesteps),
            BetaSchedule::Sigmoid => Array1::<Float>::linspace(-6.0, 6.0, num_train_timesteps)
                .mapv(|x| (beta_end - beta_start) / (1.0 + (-x).exp()) + beta_start),
        };

        let mut cumprod = 1.0;
        let alphas_cumprod = betas.mapv(|beta| {
            cumprod *= 1.0 - beta;
            cumprod
        });

        Ok(NoiseSchedule {
            betas,
            alphas_cumprod,
        })
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.betas.len()
    }

    pub fn beta(&self, t: usize) -> Float {
        self.betas[t]
    }

    /// Cumulative product of alphas up to `t`, with `1` before the first step.
    pub fn alpha_cumprod(&self, t: isize) -> Float {
        if t < 0 {
            1.0
        } else {
            self.alphas_cumprod[t as usize]
        }
    }
}

/// Betas discretizing `alpha_bar(t) = cos^2((t + 0.008) / 1.008 * pi / 2)`.
fn cosine_betas(num_train_timesteps: usize) -> Array1<Float> {
    let alpha_bar = |t: Float| ((t + 0.008) / 1.008 * FRAC_PI_2).cos().powi(2);
    let n = num_train_timesteps as Float;

    Array1::from_shape_fn(num_train_timesteps, |i| {
        let t_1 = i as Float / n;
        let t_2 = (i + 1) as Float / n;

        (1.0 - alpha_bar(t_2) / alpha_bar(t_1)).min(MAX_BETA)
    })
}

/// Sequence of training timesteps visited by RePaint.
///
/// A decreasing timestep is a denoising step, an increasing one
/// means the sample is pushed back by one stride with forward noise.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RepaintPlan {
    pub timesteps: Vec<usize>,
    /// Distance between consecutive inference timesteps in training steps.
    pub stride: usize,
}

impl RepaintPlan {
    pub fn new(
        num_train_timesteps: usize,
        num_inference_steps: usize,
        jump_length: usize,
        jump_n_sample: usize,
    ) -> Result<Self, RepaintError> {
        let num_inference_steps = num_inference_steps.min(num_train_timesteps);

        if num_inference_steps < 1 {
            return Err(RepaintError::InvalidSchedule(
                "number of inference steps cannot be less than 1",
            ));
        }

        if jump_length < 1 || jump_n_sample < 1 {
            return Err(RepaintError::InvalidSchedule(
                "jump length and jump sample count cannot be less than 1",
            ));
        }

        // remaining resampling rounds for each jump point
        let mut jumps = vec![0; num_inference_steps];
        let mut j = 0;
        while j + jump_length < num_inference_steps {
            jumps[j] = jump_n_sample - 1;
            j += jump_length;
        }

        let mut timesteps = Vec::new();
        let mut t = num_inference_steps;

        while t >= 1 {
            t -= 1;
            timesteps.push(t);

            if jumps[t] > 0 {
                jumps[t] -= 1;

                for _ in 0..jump_length {
                    t += 1;
                    timesteps.push(t);
                }
            }
        }

        let stride = num_train_timesteps / num_inference_steps;

        Ok(RepaintPlan {
            timesteps: timesteps.into_iter().map(|t| t * stride).collect(),
            stride,
        })
    }
}
