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

//! Diffusion correction of the predicted state with sparse measurements
//! ("RePaint" inpainting).
//!
//! The diffusion model works in normalized difference space: the sample
//! is the correction to be added to the forecaster prediction, and the
//! known part of the sample is the normalized difference between
//! interpolated measurements and the prediction.
//!
//! Each reverse step denoises the whole sample and then replaces masked
//! cells with the measurement difference noised to the same level.
//! At jump points the sample is pushed back with forward noise and the
//! span is denoised again, which lets unmeasured cells harmonize with
//! measured ones instead of showing seams at mask edges.

pub mod denoiser;
pub mod schedule;

use self::denoiser::{Conditioning, Denoiser};
use self::schedule::{NoiseSchedule, RepaintPlan};
use crate::model::state::State;
use crate::{errors::RepaintError, Float};
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use ndarray::{Array2, Array3, Zip};
use rand::Rng;
use rand_distr::StandardNormal;

/// Parameters of the RePaint sampling loop.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct RepaintParams {
    pub num_inference_steps: usize,
    /// Weight of stochastic (ancestral) noise, `0` gives a deterministic reverse step.
    pub eta: Float,
    pub jump_length: usize,
    pub jump_n_sample: usize,
}

/// Measurement side of the correction.
#[derive(Copy, Clone, Debug)]
pub struct RepaintInputs<'a> {
    /// Trust in measurement per grid cell, `1` for fully known cells.
    pub mask: &'a Array2<Float>,
    pub norm_measurements_diff: &'a State,
    pub cond: Conditioning<'a>,
}

/// Runs the full RePaint loop and returns the corrected normalized difference.
///
/// All randomness is drawn from `rng` in a fixed order, so the same
/// generator state and inputs always produce the same output.
pub fn repaint<D: Denoiser + ?Sized, R: Rng>(
    denoiser: &D,
    schedule: &NoiseSchedule,
    params: &RepaintParams,
    inputs: &RepaintInputs,
    rng: &mut R,
    show_progress: bool,
) -> Result<State, RepaintError> {
    check_mask(inputs)?;

    if inputs.norm_measurements_diff.is_empty() {
        debug!("Nothing to repaint");
        return Ok(State::new());
    }

    let plan = RepaintPlan::new(
        schedule.num_train_timesteps(),
        params.num_inference_steps,
        params.jump_length,
        params.jump_n_sample,
    )?;

    debug!(
        "Repainting {} variables in {} timesteps with stride {}",
        inputs.norm_measurements_diff.len(),
        plan.timesteps.len(),
        plan.stride
    );

    let progress = if show_progress {
        let bar = ProgressBar::new(plan.timesteps.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} [{elapsed_precise}] [{wide_bar:.green/white}] {pos}/{len}")
                .progress_chars("#>-"),
        );
        bar.set_prefix("Repaint");
        bar
    } else {
        ProgressBar::hidden()
    };

    let mut sample = State::new();
    for (var, field) in inputs.norm_measurements_diff.iter() {
        sample.insert(*var, gaussian_noise(field.raw_dim(), rng));
    }

    let mut t_last = plan.timesteps[0] + 1;

    for &t in &plan.timesteps {
        if t < t_last {
            let model_output = denoiser.predict_noise(&sample, t, &inputs.cond)?;
            sample
                .check_compatible(&model_output)
                .map_err(RepaintError::Denoiser)?;

            sample = reverse_step(schedule, &plan, params.eta, &model_output, t, &sample, inputs, rng)?;
        } else {
            sample = undo_step(schedule, &plan, sample, t_last, rng);
        }

        t_last = t;
        progress.inc(1);
    }

    progress.finish_and_clear();

    Ok(sample)
}

/// Posterior variance of the reverse step from `t` to `t - stride`.
fn variance(schedule: &NoiseSchedule, plan: &RepaintPlan, t: usize) -> Float {
    let prev_t = t as isize - plan.stride as isize;
    let alpha_prod_t = schedule.alpha_cumprod(t as isize);
    let alpha_prod_t_prev = schedule.alpha_cumprod(prev_t);

    ((1.0 - alpha_prod_t_prev) / (1.0 - alpha_prod_t)) * (1.0 - alpha_prod_t / alpha_prod_t_prev)
}

/// One denoising step followed by blending with the noised known part.
#[allow(clippy::too_many_arguments)]
fn reverse_step<R: Rng>(
    schedule: &NoiseSchedule,
    plan: &RepaintPlan,
    eta: Float,
    model_output: &State,
    t: usize,
    sample: &State,
    inputs: &RepaintInputs,
    rng: &mut R,
) -> Result<State, RepaintError> {
    let prev_t = t as isize - plan.stride as isize;
    let alpha_prod_t = schedule.alpha_cumprod(t as isize);
    let alpha_prod_t_prev = schedule.alpha_cumprod(prev_t);
    let beta_prod_t = 1.0 - alpha_prod_t;

    let std_dev_t = eta * variance(schedule, plan, t).sqrt();
    let add_variance = t > 0 && eta > 0.0;
    let direction_scale = (1.0 - alpha_prod_t_prev - std_dev_t * std_dev_t)
        .max(0.0)
        .sqrt();

    let mut result = State::new();

    for (var, x) in sample.iter() {
        let eps = model_output.field(*var)?;
        let known = inputs.norm_measurements_diff.field(*var)?;
        let mask = inputs
            .mask
            .broadcast(x.raw_dim())
            .ok_or_else(|| mask_mismatch(inputs.mask, x))?;
        let noise = gaussian_noise(x.raw_dim(), rng);

        let mut prev = Array3::zeros(x.raw_dim());

        Zip::from(&mut prev)
            .and(x)
            .and(eps)
            .and(known)
            .and(&noise)
            .and(&mask)
            .par_for_each(|prev, &x, &eps, &known, &noise, &mask| {
                let pred_original = (x - beta_prod_t.sqrt() * eps) / alpha_prod_t.sqrt();
                let variance = if add_variance { std_dev_t * noise } else { 0.0 };

                let unknown_part =
                    alpha_prod_t_prev.sqrt() * pred_original + direction_scale * eps + variance;
                let known_part = alpha_prod_t_prev.sqrt() * known
                    + (1.0 - alpha_prod_t_prev).sqrt() * noise;

                *prev = mask * known_part + (1.0 - mask) * unknown_part;
            });

        result.insert(*var, prev);
    }

    Ok(result)
}

/// Forward-process noise from `t_last` back up by one stride.
fn undo_step<R: Rng>(
    schedule: &NoiseSchedule,
    plan: &RepaintPlan,
    mut sample: State,
    t_last: usize,
    rng: &mut R,
) -> State {
    for i in 0..plan.stride {
        let beta = schedule.beta(t_last + i);

        for (_, field) in sample.iter_mut() {
            let noise = gaussian_noise(field.raw_dim(), rng);

            Zip::from(field)
                .and(&noise)
                .par_for_each(|x, &n| *x = (1.0 - beta).sqrt() * *x + beta.sqrt() * n);
        }
    }

    sample
}

fn gaussian_noise<R: Rng>(shape: ndarray::Ix3, rng: &mut R) -> Array3<Float> {
    Array3::from_shape_fn(shape, |_| rng.sample(StandardNormal))
}

fn check_mask(inputs: &RepaintInputs) -> Result<(), RepaintError> {
    for (_, field) in inputs.norm_measurements_diff.iter() {
        let shape = field.shape();

        if inputs.mask.dim() != (shape[1], shape[2]) {
            return Err(mask_mismatch(inputs.mask, field));
        }
    }

    Ok(())
}

fn mask_mismatch(mask: &Array2<Float>, field: &Array3<Float>) -> RepaintError {
    let shape = field.shape();

    RepaintError::MaskMismatch {
        mask: mask.dim(),
        field: (shape[1], shape[2]),
    }
}

#[cfg(test)]
mod tests {
    use super::denoiser::{Conditioning, ZeroPriorDenoiser};
    use super::schedule::{BetaSchedule, NoiseSchedule};
    use super::{repaint, RepaintInputs, RepaintParams};
    use crate::errors::RepaintError;
    use crate::model::state::{State, Variable};
    use ndarray::{Array2, Array3};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::sync::Arc;

    const PARAMS: RepaintParams = RepaintParams {
        num_inference_steps: 20,
        eta: 0.0,
        jump_length: 5,
        jump_n_sample: 3,
    };

    fn measurements() -> State {
        State::new()
            .with(
                Variable::Geopotential,
                Array3::from_shape_fn((2, 4, 6), |(l, i, j)| (l + i) as f64 - 0.3 * j as f64),
            )
            .with(Variable::Temperature2m, Array3::from_elem((1, 4, 6), 0.7))
    }

    fn run(mask: &Array2<f64>, eta: f64, seed: u64) -> Result<State, RepaintError> {
        let schedule = Arc::new(NoiseSchedule::new(BetaSchedule::Linear, 100, 1e-4, 0.02).unwrap());
        let denoiser = ZeroPriorDenoiser::new(Arc::clone(&schedule));
        let empty = State::new();
        let diff = measurements();
        let inputs = RepaintInputs {
            mask,
            norm_measurements_diff: &diff,
            cond: Conditioning {
                norm_inputs_pred: &empty,
                norm_static: &empty,
                norm_forcings: &empty,
            },
        };
        let params = RepaintParams { eta, ..PARAMS };
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        repaint(&denoiser, &schedule, &params, &inputs, &mut rng, false)
    }

    #[test]
    fn repaint_is_deterministic() {
        let mask = Array2::from_shape_fn((4, 6), |(i, j)| ((i + j) % 2) as f64);

        assert_eq!(run(&mask, 0.5, 7).unwrap(), run(&mask, 0.5, 7).unwrap());
    }

    #[test]
    fn known_cells_match_measurements() {
        let mask = Array2::ones((4, 6));

        assert_eq!(run(&mask, 0.0, 1).unwrap(), measurements());
        assert_eq!(run(&mask, 1.0, 1).unwrap(), measurements());
    }

    #[test]
    fn unknown_cells_follow_prior() {
        let mask = Array2::from_shape_fn((4, 6), |(_, j)| if j == 0 { 1.0 } else { 0.0 });

        let corrected = run(&mask, 0.0, 3).unwrap();

        for (var, field) in corrected.iter() {
            let known = measurements();
            let known = known.field(*var).unwrap();

            for ((l, i, j), value) in field.indexed_iter() {
                if j == 0 {
                    assert_eq!(*value, known[[l, i, j]]);
                } else {
                    assert!(value.abs() < 1e-6, "{:?} not close to zero: {}", var, value);
                }
            }
        }
    }

    #[test]
    fn mask_shape_is_checked() {
        let mask = Array2::ones((4, 5));

        assert!(matches!(
            run(&mask, 0.0, 1),
            Err(RepaintError::MaskMismatch { mask: (4, 5), field: (4, 6) })
        ));
    }
}
