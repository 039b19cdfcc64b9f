//! Spike nonlinearity with a substitute derivative.
//!
//! Forward: Heaviside step on the threshold-relative voltage. Backward: a smooth
//! pseudo-derivative chosen once at construction. Precision only affects how
//! state values are stored, never the 0/1 spike.

use half::{bf16, f16};

use crate::params::{Precision, SurrogateParams};

#[derive(Debug, Clone, Copy)]
pub struct SpikeFunction {
    surrogate: SurrogateParams,
    precision: Precision,
}

impl SpikeFunction {
    pub fn new(surrogate: SurrogateParams, precision: Precision) -> Self {
        Self {
            surrogate,
            precision,
        }
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn spike(&self, v_scaled: f32) -> f32 {
        if v_scaled > 0.0 {
            1.0
        } else {
            0.0
        }
    }

    /// Vector-Jacobian factor of the spike w.r.t. the scaled voltage.
    pub fn pseudo_derivative(&self, v_scaled: f32) -> f32 {
        match self.surrogate {
            SurrogateParams::Triangular { dampening_factor } => {
                dampening_factor * (1.0 - v_scaled.abs()).max(0.0)
            }
            SurrogateParams::Gauss { sigma, amplitude } => {
                amplitude * (-(v_scaled * v_scaled) / (sigma * sigma)).exp()
            }
        }
    }

    pub fn quantize(&self, x: f32) -> f32 {
        self.precision.quantize(x)
    }
}

impl Precision {
    /// Rounds a value to the storage precision and widens it back to f32.
    pub fn quantize(self, x: f32) -> f32 {
        match self {
            Precision::Float32 => x,
            Precision::Float16 => f16::from_f32(x).to_f32(),
            Precision::BFloat16 => bf16::from_f32(x).to_f32(),
        }
    }
}
