pub mod cell;
pub mod delay_buffer;
pub mod instance;
pub mod model;
pub mod network;
pub mod neuron;
pub mod noise;
pub mod optimizer;
pub mod params;
pub mod readout;
pub mod regularizers;
pub mod rollout;
pub mod sparse;
pub mod state_snapshot;
pub mod surrogate;

mod types;
mod util;

pub use types::NUM_RECEPTOR_BASES;
