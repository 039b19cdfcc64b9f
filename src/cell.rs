//! GLIF population as a single-step state machine.
//!
//! All voltages inside the state are normalized per neuron (threshold 1, rest 0).
//! The transition is pure: it reads one state and produces the next one together
//! with the emitted spike, voltage and current of the step.

use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use simple_error::SimpleError;
use std::ops::Range;

use crate::{
    delay_buffer::DelayBuffer,
    network::NetworkDescription,
    neuron::CellParams,
    params::{ColumnParams, TechnicalParams},
    sparse::SparseProjection,
    surrogate::SpikeFunction,
    types::NUM_RECEPTOR_BASES,
    util::{get_decay_factor, relu},
};

const B: usize = NUM_RECEPTOR_BASES;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellState {
    pub z_buf: DelayBuffer,
    pub v: Array2<f32>,
    pub r: Array2<f32>,
    pub asc_1: Array2<f32>,
    pub asc_2: Array2<f32>,
    /// Per-basis synaptic current derivative, `(batch, n * B)`.
    pub psc_rise: Array2<f32>,
    pub psc: Array2<f32>,
}

impl CellState {
    pub fn batch_size(&self) -> usize {
        self.v.nrows()
    }

    pub fn select_rows(&self, rows: Range<usize>) -> CellState {
        let slice = |array: &Array2<f32>| array.slice(s![rows.clone(), ..]).to_owned();

        CellState {
            z_buf: self.z_buf.select_rows(rows.clone()),
            v: slice(&self.v),
            r: slice(&self.r),
            asc_1: slice(&self.asc_1),
            asc_2: slice(&self.asc_2),
            psc_rise: slice(&self.psc_rise),
            psc: slice(&self.psc),
        }
    }

    /// Stacks per-shard states along the batch axis.
    pub fn concatenate(parts: &[CellState]) -> CellState {
        assert!(!parts.is_empty(), "nothing to concatenate");
        let stack = |get: fn(&CellState) -> &Array2<f32>| {
            let views: Vec<_> = parts.iter().map(|part| get(part).view()).collect();
            ndarray::concatenate(Axis(0), &views).expect("state shards share their width")
        };

        let z_bufs: Vec<_> = parts.iter().map(|part| part.z_buf.clone()).collect();

        CellState {
            z_buf: DelayBuffer::concatenate(&z_bufs),
            v: stack(|state| &state.v),
            r: stack(|state| &state.r),
            asc_1: stack(|state| &state.asc_1),
            asc_2: stack(|state| &state.asc_2),
            psc_rise: stack(|state| &state.psc_rise),
            psc: stack(|state| &state.psc),
        }
    }
}

/// Emitted per step, shape `(batch, n)`. Voltage and current are de-normalized.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub spike: Array2<f32>,
    pub voltage: Array2<f32>,
    pub current: Array2<f32>,
}

/// Gradient of a loss w.r.t. every differentiable component of a `CellState`.
/// The delay buffer part is laid out `(slot, batch, n)` in logical slot order.
#[derive(Debug, Clone)]
pub struct CellAdjoint {
    pub z_buf: Array3<f32>,
    pub v: Array2<f32>,
    pub asc_1: Array2<f32>,
    pub asc_2: Array2<f32>,
    pub psc_rise: Array2<f32>,
    pub psc: Array2<f32>,
}

impl CellAdjoint {
    pub fn zeros(max_delay: usize, batch_size: usize, num_neurons: usize) -> CellAdjoint {
        CellAdjoint {
            z_buf: Array3::zeros((max_delay, batch_size, num_neurons)),
            v: Array2::zeros((batch_size, num_neurons)),
            asc_1: Array2::zeros((batch_size, num_neurons)),
            asc_2: Array2::zeros((batch_size, num_neurons)),
            psc_rise: Array2::zeros((batch_size, num_neurons * B)),
            psc: Array2::zeros((batch_size, num_neurons * B)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CellParamGradients {
    pub recurrent_weights: Vec<f32>,
    pub asc_rate_logits: Vec<[f32; 2]>,
}

#[derive(Debug, Clone)]
pub struct ColumnCell {
    params: CellParams,
    recurrent: SparseProjection,
    max_delay: usize,
    spike_fn: SpikeFunction,
    syn_decay: [f32; B],
    psc_initial: [f32; B],
    dt: f32,
    lr_scale: f32,
    recurrent_dampening_factor: f32,
    hard_reset: bool,
    check_numerics: bool,
}

impl ColumnCell {
    pub fn new(
        network: &NetworkDescription,
        column_params: &ColumnParams,
        technical_params: &TechnicalParams,
    ) -> ColumnCell {
        let dt = column_params.dt;
        let params = CellParams::from_network(network, dt);
        let (recurrent, max_delay) = SparseProjection::from_recurrent(
            &network.recurrent,
            &params.voltage_scale,
            column_params.recurrent_weight_scale,
            column_params.lr_scale,
            dt,
            column_params.max_delay,
            technical_params.max_projection_elements,
        );

        ColumnCell {
            params,
            recurrent,
            max_delay,
            spike_fn: SpikeFunction::new(column_params.surrogate, column_params.precision),
            syn_decay: network.receptor_taus.map(|tau| get_decay_factor(dt, tau)),
            psc_initial: network.receptor_taus.map(|tau| std::f32::consts::E / tau),
            dt,
            lr_scale: column_params.lr_scale,
            recurrent_dampening_factor: column_params.recurrent_dampening_factor,
            hard_reset: column_params.hard_reset,
            check_numerics: technical_params.check_numerics,
        }
    }

    pub fn num_neurons(&self) -> usize {
        self.params.num_neurons()
    }

    pub fn input_width(&self) -> usize {
        self.num_neurons() * B
    }

    pub fn max_delay(&self) -> usize {
        self.max_delay
    }

    pub fn params(&self) -> &CellParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut CellParams {
        &mut self.params
    }

    pub fn recurrent(&self) -> &SparseProjection {
        &self.recurrent
    }

    pub fn recurrent_mut(&mut self) -> &mut SparseProjection {
        &mut self.recurrent
    }

    pub fn zero_state(&self, batch_size: usize) -> CellState {
        let num_neurons = self.num_neurons();

        CellState {
            z_buf: DelayBuffer::new(self.max_delay, batch_size, num_neurons),
            v: Array2::from_shape_fn((batch_size, num_neurons), |(_, nid)| {
                self.params.v_reset[nid]
            }),
            r: Array2::zeros((batch_size, num_neurons)),
            asc_1: Array2::zeros((batch_size, num_neurons)),
            asc_2: Array2::zeros((batch_size, num_neurons)),
            psc_rise: Array2::zeros((batch_size, num_neurons * B)),
            psc: Array2::zeros((batch_size, num_neurons * B)),
        }
    }

    fn asc_decay_factors(&self) -> Vec<[f32; 2]> {
        (0..self.num_neurons())
            .map(|nid| {
                let [k_1, k_2] = self.params.asc_rates(nid);
                [(-self.dt * k_1).exp(), (-self.dt * k_2).exp()]
            })
            .collect()
    }

    /// Checks a state against the shapes `zero_state` would produce for its batch size.
    pub fn check_state_shape(&self, state: &CellState) -> Result<(), SimpleError> {
        let batch_size = state.batch_size();
        let num_neurons = self.num_neurons();

        if state.z_buf.max_delay() != self.max_delay {
            return Err(SimpleError::new(format!(
                "delay buffer depth mismatch: {} slots, expected {}",
                state.z_buf.max_delay(),
                self.max_delay
            )));
        }

        if state.z_buf.batch_size() != batch_size {
            return Err(SimpleError::new("delay buffer batch mismatch"));
        }

        if state.z_buf.num_neurons() != num_neurons {
            return Err(SimpleError::new(format!(
                "delay buffer width mismatch: {} neurons, expected {}",
                state.z_buf.num_neurons(),
                num_neurons
            )));
        }

        let per_neuron = [&state.v, &state.r, &state.asc_1, &state.asc_2];
        let per_basis = [&state.psc_rise, &state.psc];

        if per_neuron
            .iter()
            .any(|array| array.dim() != (batch_size, num_neurons))
            || per_basis
                .iter()
                .any(|array| array.dim() != (batch_size, num_neurons * B))
        {
            return Err(SimpleError::new("state shape mismatch"));
        }

        Ok(())
    }

    fn assert_state_shape(&self, state: &CellState) {
        if let Err(err) = self.check_state_shape(state) {
            panic!("{}", err);
        }
    }

    /// Advances every batch element by one step. `input` and the optional
    /// `state_input` are per-basis currents of shape `(batch, n * B)`.
    pub fn transition(
        &self,
        input: ArrayView2<f32>,
        state_input: Option<ArrayView2<f32>>,
        state: &CellState,
    ) -> (StepOutput, CellState) {
        self.assert_state_shape(state);
        let batch_size = state.batch_size();
        let num_neurons = self.num_neurons();
        let width = self.input_width();

        assert_eq!(input.dim(), (batch_size, width), "input current shape mismatch");
        if let Some(state_input) = &state_input {
            assert_eq!(state_input.dim(), (batch_size, width), "state input shape mismatch");
        }

        let params = &self.params;
        let q = |x: f32| self.spike_fn.quantize(x);
        let asc_decay = self.asc_decay_factors();

        let prev_z = state.z_buf.latest();
        // forward value of the straight-through buffer equals the buffer itself
        let rec_current = self.recurrent.project(&state.z_buf);

        let mut next_psc_rise = Array2::zeros((batch_size, width));
        let mut next_psc = Array2::zeros((batch_size, width));
        let mut next_v = Array2::zeros((batch_size, num_neurons));
        let mut next_r = Array2::zeros((batch_size, num_neurons));
        let mut next_asc_1 = Array2::zeros((batch_size, num_neurons));
        let mut next_asc_2 = Array2::zeros((batch_size, num_neurons));

        let mut spike = Array2::zeros((batch_size, num_neurons));
        let mut voltage = Array2::zeros((batch_size, num_neurons));
        let mut current = Array2::zeros((batch_size, num_neurons));

        for row in 0..batch_size {
            for nid in 0..num_neurons {
                let mut syn_current = 0.0;

                for basis in 0..B {
                    let col = nid * B + basis;
                    let mut drive = rec_current[[row, col]] + input[[row, col]];
                    if let Some(state_input) = &state_input {
                        drive += state_input[[row, col]];
                    }
                    drive *= self.lr_scale;

                    let decay = self.syn_decay[basis];
                    let rise = state.psc_rise[[row, col]];
                    let psc = state.psc[[row, col]];

                    next_psc_rise[[row, col]] = q(rise * decay + drive * self.psc_initial[basis]);
                    next_psc[[row, col]] = q(psc * decay + self.dt * decay * rise);
                    syn_current += psc;
                }

                let z = prev_z[[row, nid]];
                let r = q(relu(state.r[[row, nid]] + z * params.t_ref[nid] - self.dt));
                let [decay_1, decay_2] = asc_decay[nid];
                let [amp_1, amp_2] = params.asc_amps[nid];
                let asc_1 = state.asc_1[[row, nid]];
                let asc_2 = state.asc_2[[row, nid]];
                let new_asc_1 = q(decay_1 * asc_1 + z * amp_1);
                let new_asc_2 = q(decay_2 * asc_2 + z * amp_2);

                let c1 = syn_current + asc_1 + asc_2 + params.g[nid] * params.e_l[nid];
                let integrated =
                    params.decay[nid] * state.v[[row, nid]] + params.current_factor[nid] * c1;

                let v = q(if self.hard_reset {
                    if r > 0.0 {
                        params.v_reset[nid]
                    } else {
                        integrated
                    }
                } else {
                    integrated + z * (params.v_reset[nid] - params.v_th[nid])
                });

                let v_scaled = (v - params.v_th[nid]) / params.threshold_normalizer(nid);

                spike[[row, nid]] = if r > 0.0 {
                    0.0
                } else {
                    self.spike_fn.spike(v_scaled)
                };

                voltage[[row, nid]] = params.denormalize_voltage(nid, v);
                current[[row, nid]] =
                    (syn_current + new_asc_1 + new_asc_2) * params.voltage_scale[nid];

                next_v[[row, nid]] = v;
                next_r[[row, nid]] = r;
                next_asc_1[[row, nid]] = new_asc_1;
                next_asc_2[[row, nid]] = new_asc_2;
            }
        }

        let mut z_buf = state.z_buf.clone();
        z_buf.push(spike.view());

        let next_state = CellState {
            z_buf,
            v: next_v,
            r: next_r,
            asc_1: next_asc_1,
            asc_2: next_asc_2,
            psc_rise: next_psc_rise,
            psc: next_psc,
        };

        if self.check_numerics {
            assert!(
                next_state.v.iter().all(|x| x.is_finite()),
                "membrane voltage is not finite"
            );
            assert!(
                next_state.psc.iter().all(|x| x.is_finite())
                    && next_state.psc_rise.iter().all(|x| x.is_finite()),
                "synaptic current is not finite"
            );
        }

        (
            StepOutput {
                spike,
                voltage,
                current,
            },
            next_state,
        )
    }

    /// Reverse of one `transition` from `prev` to `next`.
    ///
    /// Takes the adjoint of `next` plus the upstream gradients of the emitted
    /// spike and (de-normalized) voltage, accumulates parameter gradients and
    /// returns the adjoint of `prev` together with the gradient w.r.t. the
    /// step's input current.
    pub fn backward_step(
        &self,
        prev: &CellState,
        next: &CellState,
        grad_spike: ArrayView2<f32>,
        grad_voltage: ArrayView2<f32>,
        adjoint: &CellAdjoint,
        grads: &mut CellParamGradients,
    ) -> (CellAdjoint, Array2<f32>) {
        let batch_size = prev.batch_size();
        let num_neurons = self.num_neurons();
        let params = &self.params;

        assert_eq!(grad_spike.dim(), (batch_size, num_neurons), "spike gradient shape mismatch");
        assert_eq!(
            grad_voltage.dim(),
            (batch_size, num_neurons),
            "voltage gradient shape mismatch"
        );

        let asc_decay = self.asc_decay_factors();
        let mut result = CellAdjoint::zeros(self.max_delay, batch_size, num_neurons);
        let mut grad_input = Array2::zeros((batch_size, self.input_width()));

        for row in 0..batch_size {
            for nid in 0..num_neurons {
                let grad_z = grad_spike[[row, nid]] + adjoint.z_buf[[0, row, nid]];
                let refractory = next.r[[row, nid]] > 0.0;
                let normalizer = params.threshold_normalizer(nid);

                let grad_v_scaled = if refractory {
                    0.0
                } else {
                    let v_scaled = (next.v[[row, nid]] - params.v_th[nid]) / normalizer;
                    grad_z * self.spike_fn.pseudo_derivative(v_scaled)
                };

                let grad_new_v = adjoint.v[[row, nid]]
                    + grad_voltage[[row, nid]] * params.voltage_scale[nid]
                    + grad_v_scaled / normalizer;

                let mut grad_prev_z = 0.0;

                let (grad_c1, grad_v) = if self.hard_reset && refractory {
                    (0.0, 0.0)
                } else {
                    (
                        grad_new_v * params.current_factor[nid],
                        grad_new_v * params.decay[nid],
                    )
                };

                if !self.hard_reset {
                    grad_prev_z += grad_new_v * (params.v_reset[nid] - params.v_th[nid]);
                }

                result.v[[row, nid]] = grad_v;

                let [amp_1, amp_2] = params.asc_amps[nid];
                let [k_1, k_2] = params.asc_rates(nid);
                let [decay_1, decay_2] = asc_decay[nid];
                let adj_asc_1 = adjoint.asc_1[[row, nid]];
                let adj_asc_2 = adjoint.asc_2[[row, nid]];

                result.asc_1[[row, nid]] = grad_c1 + adj_asc_1 * decay_1;
                result.asc_2[[row, nid]] = grad_c1 + adj_asc_2 * decay_2;
                grad_prev_z += adj_asc_1 * amp_1 + adj_asc_2 * amp_2;

                let logit_grads = &mut grads.asc_rate_logits[nid];
                logit_grads[0] += adj_asc_1
                    * prev.asc_1[[row, nid]]
                    * (-self.dt * decay_1)
                    * k_1
                    * (1.0 - k_1);
                logit_grads[1] += adj_asc_2
                    * prev.asc_2[[row, nid]]
                    * (-self.dt * decay_2)
                    * k_2
                    * (1.0 - k_2);

                for basis in 0..B {
                    let col = nid * B + basis;
                    let decay = self.syn_decay[basis];
                    let adj_psc = adjoint.psc[[row, col]];
                    let adj_rise = adjoint.psc_rise[[row, col]];

                    result.psc[[row, col]] = grad_c1 + adj_psc * decay;
                    result.psc_rise[[row, col]] = adj_psc * self.dt * decay + adj_rise * decay;
                    grad_input[[row, col]] = adj_rise * self.psc_initial[basis] * self.lr_scale;
                }

                result.z_buf[[0, row, nid]] += grad_prev_z;
            }
        }

        for slot in 0..self.max_delay - 1 {
            let shifted = adjoint.z_buf.index_axis(Axis(0), slot + 1).to_owned();
            let mut target = result.z_buf.index_axis_mut(Axis(0), slot);
            target += &shifted;
        }

        self.recurrent.accumulate_weight_gradient(
            &prev.z_buf,
            grad_input.view(),
            &mut grads.recurrent_weights,
        );

        let grad_rec_buf = self.recurrent.activity_gradient(grad_input.view());
        for slot in 0..self.max_delay {
            for row in 0..batch_size {
                for nid in 0..num_neurons {
                    result.z_buf[[slot, row, nid]] += self.recurrent_dampening_factor
                        * grad_rec_buf[[row, slot * num_neurons + nid]];
                }
            }
        }

        (result, grad_input)
    }

    pub fn zero_gradients(&self) -> CellParamGradients {
        CellParamGradients {
            recurrent_weights: vec![0.0; self.recurrent.num_edges()],
            asc_rate_logits: vec![[0.0; 2]; self.num_neurons()],
        }
    }
}

#[cfg(test)]
pub mod test_util {
    use super::*;
    use crate::{
        network::{test_util::get_template_network, SynapsePopulation},
        params::test_util::get_template_instance_params,
    };

    pub fn get_template_cell() -> ColumnCell {
        let params = get_template_instance_params();
        ColumnCell::new(
            &get_template_network(),
            &params.column,
            &params.technical_params,
        )
    }

    /// Template neurons without recurrent edges.
    pub fn get_disconnected_cell(column_params: &ColumnParams) -> ColumnCell {
        let mut network = get_template_network();
        network.recurrent = SynapsePopulation::empty(4, 4);
        let params = get_template_instance_params();
        ColumnCell::new(&network, column_params, &params.technical_params)
    }
}
