use ndarray::{Array2, Array3};
use rand::{distributions::Bernoulli, prelude::Distribution, Rng};
use simple_error::{try_with, SimpleError};

use crate::sparse::SparseProjection;

/// Poisson-like background drive: one Bernoulli draw per (batch, time, unit),
/// projected through its own multi-basis weight table.
#[derive(Debug, Clone)]
pub struct BackgroundNoise {
    projection: SparseProjection,
    spike_dist: Bernoulli,
    spike_probability: f64,
}

/// Sampled background spikes, rows ordered batch-major `(batch * time, units)`,
/// and the resulting current `(batch, time, n * B)`.
#[derive(Debug, Clone)]
pub struct NoiseSample {
    pub spikes: Array2<f32>,
    pub current: Array3<f32>,
}

impl BackgroundNoise {
    /// `firing_rate` in Hz, `dt` in ms.
    pub fn new(
        projection: SparseProjection,
        firing_rate: f32,
        dt: f32,
    ) -> Result<Self, SimpleError> {
        let spike_probability = firing_rate as f64 * dt as f64 / 1000.0;
        let spike_dist = try_with!(
            Bernoulli::new(spike_probability),
            "invalid background spike probability"
        );

        Ok(Self {
            projection,
            spike_dist,
            spike_probability,
        })
    }

    pub fn spike_probability(&self) -> f64 {
        self.spike_probability
    }

    pub fn num_units(&self) -> usize {
        self.projection.dense_shape()[1]
    }

    pub fn projection(&self) -> &SparseProjection {
        &self.projection
    }

    pub fn projection_mut(&mut self) -> &mut SparseProjection {
        &mut self.projection
    }

    pub fn sample_spikes<R: Rng>(&self, rng: &mut R, num_rows: usize) -> Array2<f32> {
        let num_units = self.num_units();

        if self.spike_probability == 0.0 {
            return Array2::zeros((num_rows, num_units));
        }

        Array2::from_shape_fn((num_rows, num_units), |_| {
            if self.spike_dist.sample(rng) {
                1.0
            } else {
                0.0
            }
        })
    }

    pub fn inject<R: Rng>(&self, rng: &mut R, batch_size: usize, num_steps: usize) -> NoiseSample {
        let spikes = self.sample_spikes(rng, batch_size * num_steps);
        let num_outputs = self.projection.num_outputs();

        let current = if self.spike_probability == 0.0 {
            Array3::zeros((batch_size, num_steps, num_outputs))
        } else {
            self.projection
                .project(&spikes)
                .into_shape((batch_size, num_steps, num_outputs))
                .expect("projection output is contiguous")
        };

        NoiseSample { spikes, current }
    }
}
