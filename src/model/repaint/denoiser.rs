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

//! Interface of the pretrained denoising network.

use super::schedule::NoiseSchedule;
use crate::model::state::{check_same_grid, State};
use crate::{
    errors::{RepaintError, StateError},
    Float,
};
use std::sync::Arc;

/// Context the denoiser is conditioned on, all normalized.
#[derive(Copy, Clone, Debug)]
pub struct Conditioning<'a> {
    pub norm_inputs_pred: &'a State,
    pub norm_static: &'a State,
    pub norm_forcings: &'a State,
}

impl Conditioning<'_> {
    /// Checks that every conditioning field lies on the horizontal grid of `sample`.
    pub fn check_grid(&self, sample: &State) -> Result<(), StateError> {
        check_same_grid(
            sample,
            &[self.norm_inputs_pred, self.norm_static, self.norm_forcings],
        )
    }
}

/// Network predicting the noise component (epsilon) of a noisy sample
/// in normalized difference space.
pub trait Denoiser: Sync {
    fn predict_noise(
        &self,
        sample: &State,
        timestep: usize,
        cond: &Conditioning,
    ) -> Result<State, RepaintError>;
}

/// Denoiser that is exact when the difference between truth and
/// prediction is zero everywhere: `eps = x_t / sqrt(1 - alpha_bar_t)`.
///
/// With RePaint it spreads measurements only through the mask, so it
/// serves as the reference against which trained networks are compared.
#[derive(Clone, Debug)]
pub struct ZeroPriorDenoiser {
    schedule: Arc<NoiseSchedule>,
}

impl ZeroPriorDenoiser {
    pub fn new(schedule: Arc<NoiseSchedule>) -> Self {
        ZeroPriorDenoiser { schedule }
    }
}

impl Denoiser for ZeroPriorDenoiser {
    fn predict_noise(
        &self,
        sample: &State,
        timestep: usize,
        cond: &Conditioning,
    ) -> Result<State, RepaintError> {
        cond.check_grid(sample).map_err(RepaintError::Denoiser)?;

        let noise_scale: Float = (1.0 - self.schedule.alpha_cumprod(timestep as isize)).sqrt();
        let mut prediction = sample.clone();

        for (_, field) in prediction.iter_mut() {
            field.mapv_inplace(|x| x / noise_scale);
        }

        Ok(prediction)
    }
}

#[cfg(test)]
mod tests {
    use super::{Conditioning, Denoiser, ZeroPriorDenoiser};
    use crate::errors::{RepaintError, StateError};
    use crate::model::repaint::schedule::{BetaSchedule, NoiseSchedule};
    use crate::model::state::{State, Variable};
    use float_cmp::approx_eq;
    use ndarray::Array3;
    use std::sync::Arc;

    fn denoiser() -> ZeroPriorDenoiser {
        ZeroPriorDenoiser::new(Arc::new(
            NoiseSchedule::new(BetaSchedule::Linear, 10, 0.1, 0.2).unwrap(),
        ))
    }

    #[test]
    fn noise_of_pure_noise_sample() {
        let sample = State::new().with(Variable::Temperature2m, Array3::from_elem((1, 2, 3), 0.6));
        let empty = State::new();
        let cond = Conditioning {
            norm_inputs_pred: &empty,
            norm_static: &empty,
            norm_forcings: &empty,
        };

        let eps = denoiser().predict_noise(&sample, 0, &cond).unwrap();
        let eps = eps.field(Variable::Temperature2m).unwrap();

        // alpha_bar_0 = 0.9
        let expected = 0.6 / 0.1_f64.sqrt();
        assert!(eps.iter().all(|e| approx_eq!(f64, *e, expected, epsilon = 1e-12)));
    }

    #[test]
    fn conditioning_on_other_grid_is_rejected() {
        let sample = State::new().with(Variable::Temperature2m, Array3::zeros((1, 2, 3)));
        let static_fields = State::new().with(Variable::LandSeaMask, Array3::zeros((1, 4, 3)));
        let empty = State::new();
        let cond = Conditioning {
            norm_inputs_pred: &empty,
            norm_static: &static_fields,
            norm_forcings: &empty,
        };

        assert!(matches!(
            denoiser().predict_noise(&sample, 5, &cond),
            Err(RepaintError::Denoiser(StateError::ShapeMismatch { .. }))
        ));
    }
}
