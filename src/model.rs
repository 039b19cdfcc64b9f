//! The trainable column: input projection, background noise, GLIF cell and
//! read-out, together with the objectives and their gradients.

use log::info;
use ndarray::{s, Array2, Array3, ArrayView3};
use rand::Rng;
use simple_error::{try_with, SimpleError};
use std::ops::{AddAssign, Range};

use crate::{
    cell::{CellState, ColumnCell},
    network::{self, NetworkDescription},
    noise::{BackgroundNoise, NoiseSample},
    optimizer::{Adam, ParamGroupId, ParamUpdate},
    params::{self, ColumnParams, InstanceParams},
    readout::Readout,
    regularizers::{RateDistributionTarget, StiffRegularizer, VoltageRegularization},
    rollout::{self, Rollout, Trajectory},
    sparse::SparseProjection,
    state_snapshot::StateSnapshot,
};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Losses {
    pub rate: f32,
    pub voltage: f32,
    pub classification: f32,
    pub weight: f32,
}

impl Losses {
    pub fn total(&self) -> f32 {
        self.rate + self.voltage + self.classification + self.weight
    }
}

impl AddAssign for Losses {
    fn add_assign(&mut self, other: Losses) {
        self.rate += other.rate;
        self.voltage += other.voltage;
        self.classification += other.classification;
        self.weight += other.weight;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelGradients {
    pub recurrent_weights: Vec<f32>,
    pub input_weights: Vec<f32>,
    pub background_weights: Vec<f32>,
    pub asc_rate_logits: Vec<[f32; 2]>,
    pub readout_weights: Vec<f32>,
    pub readout_bias: Vec<f32>,
}

impl ModelGradients {
    pub fn scale(&mut self, factor: f32) {
        for grad in self
            .recurrent_weights
            .iter_mut()
            .chain(self.input_weights.iter_mut())
            .chain(self.background_weights.iter_mut())
            .chain(self.asc_rate_logits.iter_mut().flatten())
            .chain(self.readout_weights.iter_mut())
            .chain(self.readout_bias.iter_mut())
        {
            *grad *= factor;
        }
    }
}

fn add_slice(target: &mut [f32], source: &[f32]) {
    assert_eq!(target.len(), source.len(), "gradient length mismatch");
    for (t, s) in target.iter_mut().zip(source) {
        *t += s;
    }
}

impl AddAssign<&ModelGradients> for ModelGradients {
    fn add_assign(&mut self, other: &ModelGradients) {
        add_slice(&mut self.recurrent_weights, &other.recurrent_weights);
        add_slice(&mut self.input_weights, &other.input_weights);
        add_slice(&mut self.background_weights, &other.background_weights);
        add_slice(&mut self.readout_weights, &other.readout_weights);
        add_slice(&mut self.readout_bias, &other.readout_bias);

        assert_eq!(self.asc_rate_logits.len(), other.asc_rate_logits.len());
        for (t, s) in self.asc_rate_logits.iter_mut().zip(&other.asc_rate_logits) {
            t[0] += s[0];
            t[1] += s[1];
        }
    }
}

/// One batch of external input, `(batch, time, n_inputs)`, with its labels and
/// sample weights for the read-out.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Array3<f32>,
    pub labels: Vec<usize>,
    pub sample_weights: Vec<f32>,
    /// Additive per-basis drive, `(batch, time, n * B)`.
    pub state_inputs: Option<Array3<f32>>,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchView<'a> {
    pub inputs: ArrayView3<'a, f32>,
    pub labels: &'a [usize],
    pub sample_weights: &'a [f32],
    pub state_inputs: Option<ArrayView3<'a, f32>>,
}

impl Batch {
    /// Unlabelled batch with unit sample weights.
    pub fn from_inputs(inputs: Array3<f32>) -> Batch {
        let batch_size = inputs.dim().0;
        Batch {
            inputs,
            labels: vec![0; batch_size],
            sample_weights: vec![1.0; batch_size],
            state_inputs: None,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.inputs.dim().0
    }

    pub fn num_steps(&self) -> usize {
        self.inputs.dim().1
    }

    pub fn view(&self) -> BatchView {
        self.shard(0..self.batch_size())
    }

    pub fn shard(&self, rows: Range<usize>) -> BatchView {
        BatchView {
            inputs: self.inputs.slice(s![rows.clone(), .., ..]),
            labels: &self.labels[rows.clone()],
            sample_weights: &self.sample_weights[rows.clone()],
            state_inputs: self
                .state_inputs
                .as_ref()
                .map(|state_inputs| state_inputs.slice(s![rows, .., ..])),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForwardPass {
    pub rollout: Rollout,
    /// Total drive fed to the cell, `(batch, time, n * B)`.
    pub input_current: Array3<f32>,
    pub noise: NoiseSample,
    pub probabilities: Array2<f32>,
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub losses: Losses,
    pub gradients: ModelGradients,
    pub trajectory: Trajectory,
    pub final_state: CellState,
    pub probabilities: Array2<f32>,
}

#[derive(Debug, Clone, Copy)]
pub struct ParamGroups {
    recurrent: ParamGroupId,
    input: ParamGroupId,
    background: ParamGroupId,
    asc_rate_logits: ParamGroupId,
    readout_weights: ParamGroupId,
    readout_bias: ParamGroupId,
}

#[derive(Debug, Clone)]
pub struct ColumnModel {
    cell: ColumnCell,
    input: SparseProjection,
    noise: BackgroundNoise,
    readout: Readout,
    voltage_regularization: VoltageRegularization,
    weight_regularization: StiffRegularizer,
    column_params: ColumnParams,
    classification_cost: f32,
}

fn flatten_steps(x: ArrayView3<f32>) -> Array2<f32> {
    let (batch_size, num_steps, width) = x.dim();
    Array2::from_shape_fn((batch_size * num_steps, width), |(row, col)| {
        x[[row / num_steps, row % num_steps, col]]
    })
}

fn unflatten_steps(x: Array2<f32>, batch_size: usize, num_steps: usize) -> Array3<f32> {
    let width = x.ncols();
    x.into_shape((batch_size, num_steps, width))
        .expect("projection output is contiguous")
}

impl ColumnModel {
    pub fn new<R: Rng>(
        network: &NetworkDescription,
        params: &InstanceParams,
        rng: &mut R,
    ) -> Result<ColumnModel, SimpleError> {
        try_with!(
            network::validate_network(network),
            "invalid network description"
        );
        try_with!(
            params::validate_instance_params(params),
            "invalid instance parameters"
        );

        let column_params = &params.column;
        let max_elements = params.technical_params.max_projection_elements;

        let cell = ColumnCell::new(network, column_params, &params.technical_params);
        let voltage_scale = &cell.params().voltage_scale;

        let input = SparseProjection::from_population(
            &network.input,
            voltage_scale,
            column_params.input_weight_scale,
            column_params.lr_scale,
            max_elements,
        );

        let background = SparseProjection::from_population(
            &network.background,
            voltage_scale,
            1.0,
            column_params.lr_scale,
            max_elements,
        );
        let noise = BackgroundNoise::new(
            background,
            column_params.background_firing_rate,
            column_params.dt,
        )?;

        let readout = Readout::new(network, &column_params.readout, rng);
        let voltage_regularization =
            VoltageRegularization::new(cell.params(), params.regularization.voltage_cost);
        let weight_regularization = StiffRegularizer::new(
            params.regularization.recurrent_weight_regularization,
            cell.recurrent().weights().to_vec(),
        );

        info!(
            "column model: {} neurons, {} recurrent / {} input / {} background edges, max delay {}",
            cell.num_neurons(),
            cell.recurrent().num_edges(),
            input.num_edges(),
            noise.projection().num_edges(),
            cell.max_delay()
        );

        Ok(ColumnModel {
            cell,
            input,
            noise,
            readout,
            voltage_regularization,
            weight_regularization,
            column_params: column_params.clone(),
            classification_cost: params.regularization.classification_cost,
        })
    }

    pub fn cell(&self) -> &ColumnCell {
        &self.cell
    }

    pub fn input(&self) -> &SparseProjection {
        &self.input
    }

    pub fn noise(&self) -> &BackgroundNoise {
        &self.noise
    }

    pub fn readout(&self) -> &Readout {
        &self.readout
    }

    pub fn num_inputs(&self) -> usize {
        self.input.dense_shape()[1]
    }

    pub fn num_neurons(&self) -> usize {
        self.cell.num_neurons()
    }

    pub fn zero_state(&self, batch_size: usize) -> CellState {
        self.cell.zero_state(batch_size)
    }

    pub fn check_batch(&self, batch: &Batch) -> Result<(), SimpleError> {
        let (batch_size, num_steps, num_inputs) = batch.inputs.dim();

        if num_inputs != self.num_inputs() {
            return Err(SimpleError::new(format!(
                "batch has {} input channels, expected {}",
                num_inputs,
                self.num_inputs()
            )));
        }

        if batch.labels.len() != batch_size || batch.sample_weights.len() != batch_size {
            return Err(SimpleError::new(
                "labels and sample weights must match the batch size",
            ));
        }

        if let Some(label) = batch
            .labels
            .iter()
            .find(|label| **label >= self.readout.num_outputs())
        {
            return Err(SimpleError::new(format!("invalid label: {}", label)));
        }

        if let Some(state_inputs) = &batch.state_inputs {
            if state_inputs.dim() != (batch_size, num_steps, self.cell.input_width()) {
                return Err(SimpleError::new("state inputs do not match the batch shape"));
            }
        }

        Ok(())
    }

    /// Projected input plus, if enabled, background noise. The noise sample is
    /// returned either way.
    pub fn input_current<R: Rng>(
        &self,
        inputs: ArrayView3<f32>,
        rng: &mut R,
    ) -> (Array3<f32>, NoiseSample) {
        let (batch_size, num_steps, num_inputs) = inputs.dim();
        assert_eq!(num_inputs, self.num_inputs(), "input width mismatch");

        let projected = self.input.project(&flatten_steps(inputs));
        let mut current = unflatten_steps(projected, batch_size, num_steps);

        let noise = self.noise.inject(rng, batch_size, num_steps);
        if self.column_params.add_background_noise {
            current += &noise.current;
        }

        (current, noise)
    }

    pub fn forward<R: Rng>(
        &self,
        inputs: ArrayView3<f32>,
        state_inputs: Option<ArrayView3<f32>>,
        initial_state: CellState,
        rng: &mut R,
        record_tape: bool,
    ) -> ForwardPass {
        let (input_current, noise) = self.input_current(inputs, rng);
        let state_inputs = state_inputs.filter(|_| self.column_params.use_state_input);

        let rollout = rollout::rollout(
            &self.cell,
            input_current.view(),
            state_inputs,
            initial_state,
            record_tape,
        );
        let probabilities = self.readout.predict(rollout.trajectory.spikes.view());

        ForwardPass {
            rollout,
            input_current,
            noise,
            probabilities,
        }
    }

    pub fn zero_gradients(&self) -> ModelGradients {
        ModelGradients {
            recurrent_weights: vec![0.0; self.cell.recurrent().num_edges()],
            input_weights: vec![0.0; self.input.num_edges()],
            background_weights: vec![0.0; self.noise.projection().num_edges()],
            asc_rate_logits: vec![[0.0; 2]; self.num_neurons()],
            readout_weights: vec![0.0; self.readout.weights().len()],
            readout_bias: vec![0.0; self.readout.bias().len()],
        }
    }

    /// Forward pass, all per-batch objectives and their gradients.
    ///
    /// `weight_normalizer` is the total sample weight of the whole batch this
    /// view belongs to. The weight regularizer is not included.
    pub fn loss_and_gradients<R: Rng>(
        &self,
        batch: BatchView,
        initial_state: CellState,
        rate_target: Option<&RateDistributionTarget>,
        weight_normalizer: f32,
        rng: &mut R,
    ) -> StepOutcome {
        let forward = self.forward(batch.inputs, batch.state_inputs, initial_state, rng, true);
        let spikes = forward.rollout.trajectory.spikes.view();

        let mut losses = Losses::default();
        let mut gradients = self.zero_gradients();

        let (voltage_loss, grad_voltages) = self
            .voltage_regularization
            .loss_and_grad(forward.rollout.trajectory.voltages.view());
        losses.voltage = voltage_loss;

        let mut grad_spikes = Array3::zeros(spikes.dim());

        if let Some(rate_target) = rate_target {
            let (rate_loss, rate_grad) = rate_target.loss_and_grad(spikes, rng);
            losses.rate = rate_loss;
            grad_spikes += &rate_grad;
        }

        if self.classification_cost > 0.0 {
            let (loss, _, readout_grads) = self.readout.loss_and_grad(
                spikes,
                batch.labels,
                batch.sample_weights,
                weight_normalizer,
                self.classification_cost,
            );
            losses.classification = loss;
            grad_spikes += &readout_grads.spikes;
            gradients.readout_weights = readout_grads.weights;
            gradients.readout_bias = readout_grads.bias;
        }

        let rollout_grads = rollout::backward(
            &self.cell,
            &forward.rollout.tape,
            grad_spikes.view(),
            grad_voltages.view(),
        );
        gradients.recurrent_weights = rollout_grads.params.recurrent_weights;
        gradients.asc_rate_logits = rollout_grads.params.asc_rate_logits;

        if self.column_params.train_input {
            let grad_current = flatten_steps(rollout_grads.input_current.view());
            gradients.input_weights = self
                .input
                .weight_gradient(&flatten_steps(batch.inputs), grad_current.view());

            if self.column_params.add_background_noise {
                gradients.background_weights = self
                    .noise
                    .projection()
                    .weight_gradient(&forward.noise.spikes, grad_current.view());
            }
        }

        StepOutcome {
            losses,
            gradients,
            trajectory: forward.rollout.trajectory,
            final_state: forward.rollout.final_state,
            probabilities: forward.probabilities,
        }
    }

    /// Loss of the drift of the recurrent weights away from their initial
    /// values. Its gradient is added to `gradients`.
    pub fn weight_loss_and_gradient(&self, gradients: &mut ModelGradients) -> f32 {
        let weights = self.cell.recurrent().weights();
        self.weight_regularization
            .accumulate_gradient(weights, &mut gradients.recurrent_weights);
        self.weight_regularization.loss(weights)
    }

    pub fn register_parameters(&self, optimizer: &mut Adam) -> ParamGroups {
        ParamGroups {
            recurrent: optimizer.add_group(
                "recurrent_weights",
                self.cell.recurrent().num_edges(),
                Some(self.cell.recurrent().positive().to_vec()),
            ),
            input: optimizer.add_group(
                "input_weights",
                self.input.num_edges(),
                Some(self.input.positive().to_vec()),
            ),
            background: optimizer.add_group(
                "background_weights",
                self.noise.projection().num_edges(),
                Some(self.noise.projection().positive().to_vec()),
            ),
            asc_rate_logits: optimizer.add_group("asc_rate_logits", 2 * self.num_neurons(), None),
            readout_weights: optimizer.add_group(
                "readout_weights",
                self.readout.weights().len(),
                None,
            ),
            readout_bias: optimizer.add_group("readout_bias", self.readout.bias().len(), None),
        }
    }

    /// One optimizer step over the parameter groups enabled for training.
    pub fn apply_gradients(
        &mut self,
        optimizer: &mut Adam,
        groups: &ParamGroups,
        gradients: &ModelGradients,
    ) {
        let train_recurrent = self.column_params.train_recurrent;
        let train_input = self.column_params.train_input;
        let train_asc_rates = self.column_params.train_asc_rates;

        let mut asc_logits: Vec<f32> = self
            .cell
            .params()
            .asc_rate_logits
            .iter()
            .flatten()
            .copied()
            .collect();
        let asc_grad: Vec<f32> = gradients.asc_rate_logits.iter().flatten().copied().collect();

        {
            let mut updates = Vec::new();

            if train_recurrent {
                updates.push(ParamUpdate {
                    group: groups.recurrent,
                    weights: self.cell.recurrent_mut().weights_mut(),
                    grad: &gradients.recurrent_weights,
                });
            }

            if train_input {
                updates.push(ParamUpdate {
                    group: groups.input,
                    weights: self.input.weights_mut(),
                    grad: &gradients.input_weights,
                });
                updates.push(ParamUpdate {
                    group: groups.background,
                    weights: self.noise.projection_mut().weights_mut(),
                    grad: &gradients.background_weights,
                });
            }

            if train_asc_rates {
                updates.push(ParamUpdate {
                    group: groups.asc_rate_logits,
                    weights: &mut asc_logits,
                    grad: &asc_grad,
                });
            }

            let (readout_weights, readout_bias) = self.readout.parameters_mut();
            updates.push(ParamUpdate {
                group: groups.readout_weights,
                weights: readout_weights,
                grad: &gradients.readout_weights,
            });
            updates.push(ParamUpdate {
                group: groups.readout_bias,
                weights: readout_bias,
                grad: &gradients.readout_bias,
            });

            optimizer.apply(updates);
        }

        if train_asc_rates {
            for (logits, chunk) in self
                .cell
                .params_mut()
                .asc_rate_logits
                .iter_mut()
                .zip(asc_logits.chunks_exact(2))
            {
                *logits = [chunk[0], chunk[1]];
            }
        }
    }

    pub fn snapshot(&self, cell_state: Option<CellState>) -> StateSnapshot {
        StateSnapshot {
            recurrent_weights: self.cell.recurrent().weights().to_vec(),
            input_weights: self.input.weights().to_vec(),
            background_weights: self.noise.projection().weights().to_vec(),
            asc_rate_logits: self.cell.params().asc_rate_logits.clone(),
            readout_weights: self.readout.weights().to_vec(),
            readout_bias: self.readout.bias().to_vec(),
            cell_state,
        }
    }

    pub fn check_cell_state(&self, state: &CellState) -> Result<(), SimpleError> {
        self.cell.check_state_shape(state)
    }

    /// Restores all trainable parameters and leaves the cell state of the
    /// snapshot to the caller. On error the model is unchanged.
    pub fn load_weights(&mut self, snapshot: &StateSnapshot) -> Result<(), SimpleError> {
        if snapshot.asc_rate_logits.len() != self.num_neurons() {
            return Err(SimpleError::new(format!(
                "asc rate logits: {} entries for {} neurons",
                snapshot.asc_rate_logits.len(),
                self.num_neurons()
            )));
        }

        let mut staged = self.clone();

        try_with!(
            staged
                .cell
                .recurrent_mut()
                .load_weights(&snapshot.recurrent_weights),
            "recurrent weights"
        );
        try_with!(
            staged.input.load_weights(&snapshot.input_weights),
            "input weights"
        );
        try_with!(
            staged
                .noise
                .projection_mut()
                .load_weights(&snapshot.background_weights),
            "background weights"
        );
        staged
            .readout
            .load(&snapshot.readout_weights, &snapshot.readout_bias)?;
        staged.cell.params_mut().asc_rate_logits = snapshot.asc_rate_logits.clone();

        *self = staged;
        Ok(())
    }
}
