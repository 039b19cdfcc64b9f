use crate::{
    network::{NetworkDescription, NodeTypeParams},
    util::{get_decay_factor, inv_sigmoid, sigmoid},
};

/// Per-type parameters after voltage normalization. Voltages are mapped with
/// `(x - offset) / scale` where `offset = E_L` and `scale = V_th - E_L`, so the
/// threshold sits at 1.0 and rest at 0.0.
#[derive(Debug, Clone)]
struct NormalizedType {
    v_th: f32,
    e_l: f32,
    v_reset: f32,
    voltage_scale: f32,
    voltage_offset: f32,
    decay: f32,
    current_factor: f32,
    g: f32,
    t_ref: f32,
    asc_amps: [f32; 2],
    asc_rate_logits: [f32; 2],
}

impl NormalizedType {
    fn new(raw: &NodeTypeParams, dt: f32) -> Self {
        let voltage_scale = raw.v_th - raw.e_l;
        let voltage_offset = raw.e_l;
        let normalize = |x: f32| (x - voltage_offset) / voltage_scale;

        let tau = raw.c_m / raw.g;
        let decay = get_decay_factor(dt, tau);
        let current_factor = 1.0 / raw.c_m * (1.0 - decay) * tau;

        Self {
            v_th: normalize(raw.v_th),
            e_l: normalize(raw.e_l),
            v_reset: normalize(raw.v_reset),
            voltage_scale,
            voltage_offset,
            decay,
            current_factor,
            g: raw.g,
            t_ref: raw.t_ref,
            asc_amps: [
                raw.asc_amps[0] / voltage_scale,
                raw.asc_amps[1] / voltage_scale,
            ],
            asc_rate_logits: [inv_sigmoid(raw.k[0]), inv_sigmoid(raw.k[1])],
        }
    }
}

/// Per-neuron cell parameters, broadcast from the type tables through the
/// node-to-type mapping and laid out struct-of-arrays.
#[derive(Debug, Clone)]
pub struct CellParams {
    pub v_th: Vec<f32>,
    pub e_l: Vec<f32>,
    pub v_reset: Vec<f32>,
    pub voltage_scale: Vec<f32>,
    pub voltage_offset: Vec<f32>,
    pub decay: Vec<f32>,
    pub current_factor: Vec<f32>,
    pub g: Vec<f32>,
    pub t_ref: Vec<f32>,
    pub asc_amps: Vec<[f32; 2]>,
    /// After-spike current decay rates, stored as logits and read through a sigmoid.
    pub asc_rate_logits: Vec<[f32; 2]>,
}

impl CellParams {
    pub fn from_network(network: &NetworkDescription, dt: f32) -> Self {
        let types: Vec<_> = network
            .node_types
            .iter()
            .map(|raw| NormalizedType::new(raw, dt))
            .collect();

        let ids = &network.node_type_ids;
        let gather = |f: fn(&NormalizedType) -> f32| -> Vec<f32> {
            ids.iter().map(|type_id| f(&types[*type_id])).collect()
        };

        Self {
            v_th: gather(|t| t.v_th),
            e_l: gather(|t| t.e_l),
            v_reset: gather(|t| t.v_reset),
            voltage_scale: gather(|t| t.voltage_scale),
            voltage_offset: gather(|t| t.voltage_offset),
            decay: gather(|t| t.decay),
            current_factor: gather(|t| t.current_factor),
            g: gather(|t| t.g),
            t_ref: gather(|t| t.t_ref),
            asc_amps: ids.iter().map(|type_id| types[*type_id].asc_amps).collect(),
            asc_rate_logits: ids
                .iter()
                .map(|type_id| types[*type_id].asc_rate_logits)
                .collect(),
        }
    }

    pub fn num_neurons(&self) -> usize {
        self.v_th.len()
    }

    pub fn asc_rates(&self, nid: usize) -> [f32; 2] {
        let logits = self.asc_rate_logits[nid];
        [sigmoid(logits[0]), sigmoid(logits[1])]
    }

    pub fn normalize_voltage(&self, nid: usize, voltage: f32) -> f32 {
        (voltage - self.voltage_offset[nid]) / self.voltage_scale[nid]
    }

    pub fn denormalize_voltage(&self, nid: usize, voltage: f32) -> f32 {
        voltage * self.voltage_scale[nid] + self.voltage_offset[nid]
    }

    /// Distance between normalized threshold and rest, the divisor of the
    /// threshold-relative voltage fed to the spike function.
    pub fn threshold_normalizer(&self, nid: usize) -> f32 {
        self.v_th[nid] - self.e_l[nid]
    }
}
