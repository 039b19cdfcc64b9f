use ndarray::{Array3, ArrayView3, Axis};

use crate::cell::{CellAdjoint, CellParamGradients, CellState, ColumnCell};

/// Emitted outputs over a sequence, each `(batch, time, n)`.
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub spikes: Array3<f32>,
    pub voltages: Array3<f32>,
    pub currents: Array3<f32>,
}

impl Trajectory {
    pub fn batch_size(&self) -> usize {
        self.spikes.len_of(Axis(0))
    }

    pub fn num_steps(&self) -> usize {
        self.spikes.len_of(Axis(1))
    }

    /// Stacks per-shard trajectories along the batch axis.
    pub fn concatenate(parts: &[Trajectory]) -> Trajectory {
        assert!(!parts.is_empty(), "nothing to concatenate");
        let stack = |get: fn(&Trajectory) -> &Array3<f32>| {
            let views: Vec<_> = parts.iter().map(|part| get(part).view()).collect();
            ndarray::concatenate(Axis(0), &views).expect("trajectory shards share their shape")
        };

        Trajectory {
            spikes: stack(|trajectory| &trajectory.spikes),
            voltages: stack(|trajectory| &trajectory.voltages),
            currents: stack(|trajectory| &trajectory.currents),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rollout {
    pub trajectory: Trajectory,
    pub final_state: CellState,
    /// States before every step plus the final one. Empty unless requested.
    pub tape: Vec<CellState>,
}

#[derive(Debug, Clone)]
pub struct RolloutGradients {
    pub params: CellParamGradients,
    /// Gradient w.r.t. the per-step input current, `(batch, time, n * B)`.
    pub input_current: Array3<f32>,
    pub initial_state: CellAdjoint,
}

/// Unrolls `cell` over the time axis of `inputs` (`(batch, time, n * B)`).
///
/// `state_inputs`, when given, is added to the drive of every step.
pub fn rollout(
    cell: &ColumnCell,
    inputs: ArrayView3<f32>,
    state_inputs: Option<ArrayView3<f32>>,
    initial_state: CellState,
    record_tape: bool,
) -> Rollout {
    let (batch_size, num_steps, _) = inputs.dim();
    let num_neurons = cell.num_neurons();

    assert_eq!(
        initial_state.batch_size(),
        batch_size,
        "initial state batch size mismatch"
    );
    if let Some(state_inputs) = &state_inputs {
        assert_eq!(state_inputs.dim(), inputs.dim(), "state input shape mismatch");
    }

    let mut spikes = Array3::zeros((batch_size, num_steps, num_neurons));
    let mut voltages = Array3::zeros((batch_size, num_steps, num_neurons));
    let mut currents = Array3::zeros((batch_size, num_steps, num_neurons));
    let mut tape = Vec::with_capacity(if record_tape { num_steps + 1 } else { 0 });

    let mut state = initial_state;

    for step in 0..num_steps {
        let step_state_input = state_inputs
            .as_ref()
            .map(|state_inputs| state_inputs.index_axis(Axis(1), step));

        let (output, next_state) =
            cell.transition(inputs.index_axis(Axis(1), step), step_state_input, &state);

        spikes.index_axis_mut(Axis(1), step).assign(&output.spike);
        voltages.index_axis_mut(Axis(1), step).assign(&output.voltage);
        currents.index_axis_mut(Axis(1), step).assign(&output.current);

        if record_tape {
            tape.push(state);
        }

        state = next_state;
    }

    if record_tape {
        tape.push(state.clone());
    }

    Rollout {
        trajectory: Trajectory {
            spikes,
            voltages,
            currents,
        },
        final_state: state,
        tape,
    }
}

/// Back-propagation through time over a recorded tape. Upstream gradients are
/// w.r.t. the emitted spikes and de-normalized voltages.
pub fn backward(
    cell: &ColumnCell,
    tape: &[CellState],
    grad_spikes: ArrayView3<f32>,
    grad_voltages: ArrayView3<f32>,
) -> RolloutGradients {
    let (batch_size, num_steps, num_neurons) = grad_spikes.dim();

    assert_eq!(tape.len(), num_steps + 1, "tape does not match the sequence length");
    assert_eq!(grad_voltages.dim(), grad_spikes.dim(), "gradient shape mismatch");
    assert_eq!(num_neurons, cell.num_neurons(), "gradient width mismatch");

    let mut params = cell.zero_gradients();
    let mut input_current = Array3::zeros((batch_size, num_steps, cell.input_width()));
    let mut adjoint = CellAdjoint::zeros(cell.max_delay(), batch_size, num_neurons);

    for step in (0..num_steps).rev() {
        let (prev_adjoint, grad_input) = cell.backward_step(
            &tape[step],
            &tape[step + 1],
            grad_spikes.index_axis(Axis(1), step),
            grad_voltages.index_axis(Axis(1), step),
            &adjoint,
            &mut params,
        );

        input_current
            .index_axis_mut(Axis(1), step)
            .assign(&grad_input);
        adjoint = prev_adjoint;
    }

    RolloutGradients {
        params,
        input_current,
        initial_state: adjoint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cell::test_util::get_template_cell,
        network::{test_util::get_template_network, NetworkDescription, SynapsePopulation},
        params::{test_util::get_template_instance_params, SurrogateParams},
    };
    use float_cmp::assert_approx_eq;
    use ndarray::{arr2, s, Array2};
    use rand::{distributions::Uniform, prelude::Distribution, rngs::StdRng, SeedableRng};
    use statrs::distribution::Normal;

    /// With the pseudo-derivative switched off, BPTT over a sub-threshold
    /// trajectory is the exact gradient.
    fn exact_gradient_cell(network: &NetworkDescription) -> ColumnCell {
        let mut params = get_template_instance_params();
        params.column.surrogate = SurrogateParams::Triangular {
            dampening_factor: 0.0,
        };
        ColumnCell::new(network, &params.column, &params.technical_params)
    }

    fn random_inputs(rng: &mut StdRng, shape: (usize, usize, usize), high: f32) -> Array3<f32> {
        let dist = Uniform::new(0.0, high);
        Array3::from_shape_fn(shape, |_| dist.sample(rng))
    }

    fn random_coefs(rng: &mut StdRng, shape: (usize, usize)) -> Array2<f32> {
        let dist = Normal::new(0.0, 1.0).unwrap();
        Array2::from_shape_fn(shape, |_| dist.sample(rng) as f32)
    }

    /// `sum(coefs * v_final)` on the normalized voltage of the final state.
    fn final_voltage_loss(state: &CellState, coefs: &Array2<f32>) -> f64 {
        state
            .v
            .iter()
            .zip(coefs.iter())
            .map(|(v, c)| (*v as f64) * (*c as f64))
            .sum()
    }

    fn final_voltage_grad(cell: &ColumnCell, coefs: &Array2<f32>, num_steps: usize) -> Array3<f32> {
        let (batch_size, num_neurons) = coefs.dim();
        let mut grad = Array3::zeros((batch_size, num_steps, num_neurons));
        for row in 0..batch_size {
            for nid in 0..num_neurons {
                grad[[row, num_steps - 1, nid]] =
                    coefs[[row, nid]] / cell.params().voltage_scale[nid];
            }
        }
        grad
    }

    fn assert_gradient_close(numerical: f64, analytical: f32, what: &str) {
        let tolerance = 1e-5 + 2e-2 * (analytical.abs() as f64);
        assert!(
            (numerical - analytical as f64).abs() <= tolerance,
            "{}: numerical {} vs analytical {}",
            what,
            numerical,
            analytical
        );
    }

    #[test]
    fn trajectory_shapes() {
        let cell = get_template_cell();
        let mut rng = StdRng::seed_from_u64(0);
        let inputs = random_inputs(&mut rng, (2, 6, 20), 0.1);

        let result = rollout(&cell, inputs.view(), None, cell.zero_state(2), true);

        assert_eq!(result.trajectory.batch_size(), 2);
        assert_eq!(result.trajectory.num_steps(), 6);
        assert_eq!(result.trajectory.voltages.dim(), (2, 6, 4));
        assert_eq!(result.tape.len(), 7);
        assert_eq!(result.tape[6], result.final_state);
        assert_eq!(result.tape[0], cell.zero_state(2));
    }

    #[test]
    fn continuation_matches_single_rollout() {
        let cell = get_template_cell();
        let mut rng = StdRng::seed_from_u64(1);
        let inputs = random_inputs(&mut rng, (3, 10, 20), 30.0);

        let full = rollout(&cell, inputs.view(), None, cell.zero_state(3), false);
        assert!(full.tape.is_empty());
        assert!(full.trajectory.spikes.sum() > 0.0);

        let first = rollout(
            &cell,
            inputs.slice(s![.., ..4, ..]),
            None,
            cell.zero_state(3),
            false,
        );
        let second = rollout(
            &cell,
            inputs.slice(s![.., 4.., ..]),
            None,
            first.final_state,
            false,
        );

        assert_eq!(second.final_state, full.final_state);
        assert_eq!(
            second.trajectory.spikes,
            full.trajectory.spikes.slice(s![.., 4.., ..])
        );
    }

    #[test]
    fn input_gradient_matches_finite_differences() {
        const NUM_STEPS: usize = 8;
        const H: f32 = 0.1;
        let cell = exact_gradient_cell(&get_template_network());
        let mut rng = StdRng::seed_from_u64(2);
        let inputs = random_inputs(&mut rng, (2, NUM_STEPS, 20), 0.5);
        let coefs = random_coefs(&mut rng, (2, 4));

        let base = rollout(&cell, inputs.view(), None, cell.zero_state(2), true);
        assert_eq!(base.trajectory.spikes.sum(), 0.0);

        let grads = backward(
            &cell,
            &base.tape,
            Array3::zeros((2, NUM_STEPS, 4)).view(),
            final_voltage_grad(&cell, &coefs, NUM_STEPS).view(),
        );

        let base_loss = final_voltage_loss(&base.final_state, &coefs);

        for (idx, analytical) in grads.input_current.indexed_iter() {
            let mut perturbed = inputs.clone();
            perturbed[idx] += H;
            let result = rollout(&cell, perturbed.view(), None, cell.zero_state(2), false);
            let numerical =
                (final_voltage_loss(&result.final_state, &coefs) - base_loss) / H as f64;
            assert_gradient_close(numerical, *analytical, "input current");
        }

        // the last two inputs only reach the synaptic traces
        assert!(grads
            .input_current
            .slice(s![.., NUM_STEPS - 2.., ..])
            .iter()
            .all(|g| *g == 0.0));
    }

    #[test]
    fn recurrent_weight_gradient_matches_finite_differences() {
        const NUM_STEPS: usize = 5;
        const H: f32 = 0.01;
        let cell = exact_gradient_cell(&get_template_network());
        let mut rng = StdRng::seed_from_u64(3);
        let coefs = random_coefs(&mut rng, (1, 4));

        let mut initial_state = cell.zero_state(1);
        initial_state.z_buf.push(arr2(&[[1.0, 1.0, 1.0, 1.0]]).view());
        initial_state.z_buf.push(arr2(&[[0.0, 1.0, 1.0, 0.0]]).view());
        let inputs = Array3::zeros((1, NUM_STEPS, 20));

        let base = rollout(&cell, inputs.view(), None, initial_state.clone(), true);
        assert_eq!(base.trajectory.spikes.sum(), 0.0);

        let grads = backward(
            &cell,
            &base.tape,
            Array3::zeros((1, NUM_STEPS, 4)).view(),
            final_voltage_grad(&cell, &coefs, NUM_STEPS).view(),
        );

        let base_loss = final_voltage_loss(&base.final_state, &coefs);

        for edge_id in 0..cell.recurrent().num_edges() {
            let mut perturbed = cell.clone();
            perturbed.recurrent_mut().weights_mut()[edge_id] += H;
            let result = rollout(&perturbed, inputs.view(), None, initial_state.clone(), false);
            let numerical =
                (final_voltage_loss(&result.final_state, &coefs) - base_loss) / H as f64;
            assert_gradient_close(
                numerical,
                grads.params.recurrent_weights[edge_id],
                "recurrent weight",
            );
        }
    }

    #[test]
    fn asc_rate_gradient_matches_finite_differences() {
        const NUM_STEPS: usize = 4;
        const H: f32 = 0.01;
        let mut network = get_template_network();
        network.recurrent = SynapsePopulation::empty(4, 4);
        for node_type in network.node_types.iter_mut() {
            node_type.t_ref = 0.0;
        }
        let cell = exact_gradient_cell(&network);

        let mut rng = StdRng::seed_from_u64(4);
        let coefs = random_coefs(&mut rng, (1, 4));
        let mut initial_state = cell.zero_state(1);
        initial_state.z_buf.push(arr2(&[[1.0, 1.0, 0.0, 1.0]]).view());
        let inputs = Array3::zeros((1, NUM_STEPS, 20));

        let base = rollout(&cell, inputs.view(), None, initial_state.clone(), true);
        assert_eq!(base.trajectory.spikes.sum(), 0.0);

        let grads = backward(
            &cell,
            &base.tape,
            Array3::zeros((1, NUM_STEPS, 4)).view(),
            final_voltage_grad(&cell, &coefs, NUM_STEPS).view(),
        );

        for nid in 0..4 {
            for component in 0..2 {
                let loss_at = |delta: f32| {
                    let mut perturbed = cell.clone();
                    perturbed.params_mut().asc_rate_logits[nid][component] += delta;
                    let result =
                        rollout(&perturbed, inputs.view(), None, initial_state.clone(), false);
                    final_voltage_loss(&result.final_state, &coefs)
                };

                let numerical = (loss_at(H) - loss_at(-H)) / (2.0 * H as f64);
                assert_gradient_close(
                    numerical,
                    grads.params.asc_rate_logits[nid][component],
                    "asc rate logit",
                );
            }
        }

        // neuron 2 never spiked, so its after-spike currents stay at zero
        assert_approx_eq!(f32, grads.params.asc_rate_logits[2][0], 0.0);
    }

    #[test]
    fn sharded_rollout_matches_full_batch() {
        let cell = get_template_cell();
        let mut rng = StdRng::seed_from_u64(9);
        let inputs = random_inputs(&mut rng, (5, 8, 20), 30.0);

        let full = rollout(&cell, inputs.view(), None, cell.zero_state(5), false);

        let shards: Vec<_> = [0..2, 2..5]
            .into_iter()
            .map(|rows| {
                let len = rows.len();
                rollout(
                    &cell,
                    inputs.slice(s![rows, .., ..]),
                    None,
                    cell.zero_state(len),
                    false,
                )
            })
            .collect();

        let trajectories: Vec<_> = shards.iter().map(|part| part.trajectory.clone()).collect();
        let states: Vec<_> = shards.iter().map(|part| part.final_state.clone()).collect();

        let joined = Trajectory::concatenate(&trajectories);
        assert_eq!(joined.spikes, full.trajectory.spikes);
        assert_eq!(joined.voltages, full.trajectory.voltages);
        assert_eq!(CellState::concatenate(&states), full.final_state);
    }
}
