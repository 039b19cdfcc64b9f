use serde::{Deserialize, Serialize};

use crate::cell::CellState;

/// Trainable parameters as stored inside the model, i.e. synaptic weights already
/// divided by the voltage scale of their target and by `lr_scale`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub recurrent_weights: Vec<f32>,
    pub input_weights: Vec<f32>,
    pub background_weights: Vec<f32>,
    pub asc_rate_logits: Vec<[f32; 2]>,
    pub readout_weights: Vec<f32>,
    pub readout_bias: Vec<f32>,
    /// Persistent state of a stateful instance.
    #[serde(default)]
    pub cell_state: Option<CellState>,
}
