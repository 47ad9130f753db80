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

//! Sparse measurements drawn from ground truth.
//!
//! A set of grid cells is sampled, and each measured value is spread
//! onto neighbouring cells with a Gaussian kernel. The kernel weight sum
//! (capped at one) becomes the soft measurement mask and the
//! kernel-weighted mean becomes the interpolated measurement.

use super::Measurements;
use crate::model::state::{check_shape, Grid, State};
use crate::model::step_seed;
use crate::{errors::StateError, Float};
use log::debug;
use ndarray::{Array2, Array3, Zip};
use rand::{seq::index, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Weight sum below which a cell is considered unobserved.
const MIN_WEIGHT: Float = 1e-12;

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct SparseSampler {
    num_samples: usize,
    blur_sigma: Float,
    fixed: bool,
    seed: u64,
}

impl SparseSampler {
    /// `blur_sigma` is the kernel standard deviation in grid cells.
    /// With `fixed` set the same cells are measured at every step.
    pub fn new(num_samples: usize, blur_sigma: Float, fixed: bool, seed: u64) -> Self {
        SparseSampler {
            num_samples,
            blur_sigma,
            fixed,
            seed,
        }
    }

    /// Distinct `(lat, lon)` cells measured at given step.
    pub fn sample_cells(&self, index: usize, grid: &Grid) -> Vec<(usize, usize)> {
        let (lat_len, lon_len) = grid.horizontal_shape();
        let cells = lat_len * lon_len;
        let amount = self.num_samples.min(cells);

        let draw = if self.fixed { 0 } else { index as u64 };
        let mut rng = ChaCha8Rng::seed_from_u64(step_seed(self.seed, draw));

        index::sample(&mut rng, cells, amount)
            .into_iter()
            .map(|cell| (cell / lon_len, cell % lon_len))
            .collect()
    }

    /// Spreads `truth` values at `cells` onto the grid.
    ///
    /// Cells out of reach of every kernel take the `background` value,
    /// so their measurement difference is zero.
    pub fn observe(
        &self,
        cells: &[(usize, usize)],
        truth: &State,
        background: &State,
        grid: &Grid,
    ) -> Result<Measurements, StateError> {
        for (var, field) in truth.iter() {
            let (levels, lat, lon) = grid.field_shape(*var);
            let expected = [levels, lat, lon];

            check_shape(*var, &expected, field.shape())?;
            check_shape(*var, &expected, background.field(*var)?.shape())?;
        }

        let (lat_len, lon_len) = grid.horizontal_shape();

        let radius = (3.0 * self.blur_sigma).ceil() as isize;
        let lon_radius = radius.min((lon_len as isize - 1) / 2);
        let two_sigma_sq = 2.0 * self.blur_sigma * self.blur_sigma;

        let mut weights = Array2::<Float>::zeros((lat_len, lon_len));
        let mut sums = State::new();
        for (var, field) in truth.iter() {
            sums.insert(*var, Array3::zeros(field.raw_dim()));
        }

        for &(pi, pj) in cells {
            for di in -radius..=radius {
                let i = pi as isize + di;
                if i < 0 || i >= lat_len as isize {
                    continue;
                }

                for dj in -lon_radius..=lon_radius {
                    let j = (pj as isize + dj).rem_euclid(lon_len as isize) as usize;
                    let w = (-((di * di + dj * dj) as Float) / two_sigma_sq).exp();

                    weights[[i as usize, j]] += w;

                    for (var, sum) in sums.iter_mut() {
                        let source = truth.field(*var)?;

                        for l in 0..sum.shape()[0] {
                            sum[[l, i as usize, j]] += w * source[[l, pi, pj]];
                        }
                    }
                }
            }
        }

        let mut interpolated = State::new();

        for (var, sum) in sums.iter() {
            let fallback = background.field(*var)?;
            let mut field = Array3::zeros(sum.raw_dim());

            Zip::indexed(&mut field)
                .and(sum)
                .and(fallback)
                .for_each(|(_, i, j), value, &sum, &fallback| {
                    let weight = weights[[i, j]];
                    *value = if weight > MIN_WEIGHT {
                        sum / weight
                    } else {
                        fallback
                    };
                });

            interpolated.insert(*var, field);
        }

        let mask = weights.mapv(|w| w.min(1.0));

        debug!(
            "Observed {} cells, {:.1}% of grid under mask",
            cells.len(),
            100.0 * mask.sum() / (lat_len * lon_len) as Float
        );

        Ok(Measurements { interpolated, mask })
    }
}
