use ndarray::{s, Array2, Array3, ArrayView3, Axis};
use rand::{distributions::Uniform, prelude::Distribution, Rng};
use serde::{Deserialize, Serialize};
use simple_error::SimpleError;

use crate::{
    network::NetworkDescription,
    params::{ReadoutMode, ReadoutParams},
    util::sigmoid,
};

/// Maps the spikes of the read-out neurons in the cue window to class
/// probabilities.
///
/// In dense mode the weights are stored row-major `(n_inputs, n_output)`. In
/// neuron-output mode there are no weights and the two biases hold the
/// threshold and the scale logit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Readout {
    neuron_ids: Vec<usize>,
    weights: Vec<f32>,
    bias: Vec<f32>,
    n_output: usize,
    cue_duration: usize,
    mode: ReadoutMode,
}

#[derive(Debug, Clone)]
pub struct ReadoutGradients {
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
    /// Gradient w.r.t. the spikes of all neurons, `(batch, time, n)`.
    pub spikes: Array3<f32>,
}

const THRESHOLD: usize = 0;
const SCALE_LOGIT: usize = 1;

fn softplus(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

impl Readout {
    pub fn new<R: Rng>(network: &NetworkDescription, params: &ReadoutParams, rng: &mut R) -> Self {
        let neuron_ids = match &network.readout_neuron_ids {
            Some(ids) => ids.clone(),
            None => (0..network.n_nodes).collect(),
        };

        let n_inputs = neuron_ids.len();

        let weights = match params.mode {
            ReadoutMode::Dense => {
                let limit = (6.0 / (n_inputs + params.n_output) as f32).sqrt();
                let dist = Uniform::new_inclusive(-limit, limit);
                (0..n_inputs * params.n_output)
                    .map(|_| dist.sample(rng))
                    .collect()
            }
            ReadoutMode::NeuronOutput { .. } => Vec::new(),
        };

        Self {
            neuron_ids,
            weights,
            bias: vec![0.0; params.n_output],
            n_output: params.n_output,
            cue_duration: params.cue_duration,
            mode: params.mode,
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.neuron_ids.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.n_output
    }

    pub fn neuron_ids(&self) -> &[usize] {
        &self.neuron_ids
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights
    }

    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    pub fn bias_mut(&mut self) -> &mut [f32] {
        &mut self.bias
    }

    pub fn parameters_mut(&mut self) -> (&mut [f32], &mut [f32]) {
        (&mut self.weights, &mut self.bias)
    }

    fn check_lengths(&self, weights: &[f32], bias: &[f32]) -> Result<(), SimpleError> {
        if weights.len() != self.weights.len() || bias.len() != self.bias.len() {
            return Err(SimpleError::new(format!(
                "readout: expected {} weights and {} biases, got {} and {}",
                self.weights.len(),
                self.bias.len(),
                weights.len(),
                bias.len()
            )));
        }

        Ok(())
    }

    pub fn load(&mut self, weights: &[f32], bias: &[f32]) -> Result<(), SimpleError> {
        self.check_lengths(weights, bias)?;
        self.weights.copy_from_slice(weights);
        self.bias.copy_from_slice(bias);
        Ok(())
    }

    fn window_start(&self, num_steps: usize) -> usize {
        num_steps.saturating_sub(self.cue_duration)
    }

    fn output_scale(&self) -> f32 {
        1.0 + softplus(self.bias[SCALE_LOGIT])
    }

    /// Mean logits over the cue window, `(batch, n_output)`.
    fn mean_logits(&self, spikes: ArrayView3<f32>) -> Array2<f32> {
        match self.mode {
            ReadoutMode::Dense => self.dense_mean_logits(spikes),
            ReadoutMode::NeuronOutput { .. } => self.neuron_output_mean_logits(spikes),
        }
    }

    fn dense_mean_logits(&self, spikes: ArrayView3<f32>) -> Array2<f32> {
        let (batch_size, num_steps, _) = spikes.dim();
        let start = self.window_start(num_steps);
        let window_len = (num_steps - start).max(1) as f32;

        let mut result = Array2::zeros((batch_size, self.n_output));

        for batch in 0..batch_size {
            let mut row = result.row_mut(batch);
            for step in start..num_steps {
                for (input, nid) in self.neuron_ids.iter().enumerate() {
                    let spike = spikes[[batch, step, *nid]];
                    if spike == 0.0 {
                        continue;
                    }
                    let weight_row = &self.weights[input * self.n_output..][..self.n_output];
                    for (out, weight) in weight_row.iter().enumerate() {
                        row[out] += spike * weight;
                    }
                }
            }
            row.mapv_inplace(|x| x / window_len);
            for (out, bias) in self.bias.iter().enumerate() {
                row[out] += bias;
            }
        }

        result
    }

    /// Mean spike of the read-out neurons over the cue window, per batch element.
    fn mean_readout_activity(&self, spikes: ArrayView3<f32>) -> Vec<f32> {
        let (batch_size, num_steps, _) = spikes.dim();
        let start = self.window_start(num_steps);
        let normalizer = ((num_steps - start).max(1) * self.neuron_ids.len().max(1)) as f32;

        (0..batch_size)
            .map(|batch| {
                let total: f32 = (start..num_steps)
                    .flat_map(|step| {
                        self.neuron_ids
                            .iter()
                            .map(move |nid| spikes[[batch, step, *nid]])
                    })
                    .sum();
                total / normalizer
            })
            .collect()
    }

    fn neuron_output_mean_logits(&self, spikes: ArrayView3<f32>) -> Array2<f32> {
        let scale = self.output_scale();
        let threshold = self.bias[THRESHOLD];
        let activity = self.mean_readout_activity(spikes);

        Array2::from_shape_fn((activity.len(), 2), |(batch, out)| {
            if out == 0 {
                threshold * scale
            } else {
                activity[batch] * scale
            }
        })
    }

    /// Class probabilities `(batch, n_output)`.
    pub fn predict(&self, spikes: ArrayView3<f32>) -> Array2<f32> {
        let mut probabilities = self.mean_logits(spikes);
        for mut row in probabilities.axis_iter_mut(Axis(0)) {
            softmax_inplace(row.as_slice_mut().expect("fresh rows are contiguous"));
        }
        probabilities
    }

    /// Weighted cross-entropy `cost * sum_b w_b * -log p_b[label_b] / weight_normalizer`.
    ///
    /// `weight_normalizer` is the total sample weight of the global batch, so losses of
    /// batch shards add up to the loss of the whole batch.
    pub fn loss_and_grad(
        &self,
        spikes: ArrayView3<f32>,
        labels: &[usize],
        sample_weights: &[f32],
        weight_normalizer: f32,
        cost: f32,
    ) -> (f32, Array2<f32>, ReadoutGradients) {
        let (batch_size, num_steps, num_neurons) = spikes.dim();
        assert_eq!(labels.len(), batch_size, "label count mismatch");
        assert_eq!(sample_weights.len(), batch_size, "sample weight count mismatch");

        let probabilities = self.predict(spikes);

        let mut loss = 0.0;
        let mut grads = ReadoutGradients {
            weights: vec![0.0; self.weights.len()],
            bias: vec![0.0; self.n_output],
            spikes: Array3::zeros((batch_size, num_steps, num_neurons)),
        };

        if weight_normalizer <= 0.0 {
            return (loss, probabilities, grads);
        }

        for batch in 0..batch_size {
            let label = labels[batch];
            assert!(label < self.n_output, "label {} out of range", label);

            let scale = cost * sample_weights[batch] / weight_normalizer;
            let probs = probabilities.row(batch);
            loss -= scale * probs[label].max(f32::MIN_POSITIVE).ln();

            let grad_logits: Vec<f32> = probs
                .iter()
                .enumerate()
                .map(|(out, p)| scale * (p - if out == label { 1.0 } else { 0.0 }))
                .collect();

            match self.mode {
                ReadoutMode::Dense => self.accumulate_dense_gradients(
                    spikes,
                    batch,
                    &grad_logits,
                    &mut grads,
                ),
                ReadoutMode::NeuronOutput { dampening_factor } => self
                    .accumulate_neuron_output_gradients(
                        spikes,
                        batch,
                        &grad_logits,
                        dampening_factor,
                        &mut grads,
                    ),
            }
        }

        (loss, probabilities, grads)
    }

    fn accumulate_dense_gradients(
        &self,
        spikes: ArrayView3<f32>,
        batch: usize,
        grad_logits: &[f32],
        grads: &mut ReadoutGradients,
    ) {
        let num_steps = spikes.dim().1;
        let start = self.window_start(num_steps);
        let window_len = (num_steps - start).max(1) as f32;

        for (out, grad) in grad_logits.iter().enumerate() {
            grads.bias[out] += grad;
        }

        for (input, nid) in self.neuron_ids.iter().enumerate() {
            let weight_row = &self.weights[input * self.n_output..][..self.n_output];
            let grad_spike: f32 = weight_row
                .iter()
                .zip(grad_logits)
                .map(|(weight, grad)| weight * grad)
                .sum::<f32>()
                / window_len;

            let mut spike_sum = 0.0;
            for step in start..num_steps {
                spike_sum += spikes[[batch, step, *nid]];
                grads.spikes[[batch, step, *nid]] += grad_spike;
            }

            let grad_row = &mut grads.weights[input * self.n_output..][..self.n_output];
            for (grad_weight, grad) in grad_row.iter_mut().zip(grad_logits) {
                *grad_weight += grad * spike_sum / window_len;
            }
        }
    }

    fn accumulate_neuron_output_gradients(
        &self,
        spikes: ArrayView3<f32>,
        batch: usize,
        grad_logits: &[f32],
        dampening_factor: f32,
        grads: &mut ReadoutGradients,
    ) {
        let num_steps = spikes.dim().1;
        let start = self.window_start(num_steps);
        let normalizer = ((num_steps - start).max(1) * self.neuron_ids.len().max(1)) as f32;

        let scale = self.output_scale();
        let threshold = self.bias[THRESHOLD];
        let activity = self.mean_readout_activity(spikes.slice(s![batch..=batch, .., ..]))[0];

        grads.bias[THRESHOLD] += grad_logits[0] * scale;
        grads.bias[SCALE_LOGIT] += (grad_logits[0] * threshold + grad_logits[1] * activity)
            * sigmoid(self.bias[SCALE_LOGIT]);

        // straight-through, amplified by the inverse dampening
        let grad_spike = grad_logits[1] * scale / normalizer / dampening_factor;
        for step in start..num_steps {
            for nid in &self.neuron_ids {
                grads.spikes[[batch, step, *nid]] += grad_spike;
            }
        }
    }
}

pub fn softmax_inplace(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for value in values.iter_mut() {
        *value = (*value - max).exp();
        sum += *value;
    }
    for value in values.iter_mut() {
        *value /= sum;
    }
}

pub fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (idx, value)| {
            if *value > best.1 {
                (idx, *value)
            } else {
                best
            }
        })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_util::get_template_network;
    use float_cmp::assert_approx_eq;
    use ndarray::Array3;
    use rand::{rngs::StdRng, SeedableRng};

    fn get_readout(cue_duration: usize) -> Readout {
        let mut network = get_template_network();
        network.readout_neuron_ids = Some(vec![1, 3]);
        let params = ReadoutParams {
            n_output: 3,
            cue_duration,
            mode: ReadoutMode::Dense,
        };
        Readout::new(&network, &params, &mut StdRng::seed_from_u64(0))
    }

    fn get_neuron_output_readout(cue_duration: usize, dampening_factor: f32) -> Readout {
        let mut network = get_template_network();
        network.readout_neuron_ids = Some(vec![1, 3]);
        let params = ReadoutParams {
            n_output: 2,
            cue_duration,
            mode: ReadoutMode::NeuronOutput { dampening_factor },
        };
        Readout::new(&network, &params, &mut StdRng::seed_from_u64(0))
    }

    fn random_spikes(batch_size: usize, num_steps: usize, seed: u64) -> Array3<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array3::from_shape_fn((batch_size, num_steps, 4), |_| {
            if rng.gen_bool(0.4) {
                1.0
            } else {
                0.0
            }
        })
    }

    #[test]
    fn glorot_initialization() {
        let sut = get_readout(2);
        let limit = (6.0f32 / 5.0).sqrt();

        assert_eq!(sut.num_inputs(), 2);
        assert_eq!(sut.weights().len(), 6);
        assert!(sut.weights().iter().all(|w| w.abs() <= limit));
        assert!(sut.bias().iter().all(|b| *b == 0.0));
    }

    #[test]
    fn all_neurons_without_readout_ids() {
        let network = get_template_network();
        let sut = Readout::new(
            &network,
            &ReadoutParams::default(),
            &mut StdRng::seed_from_u64(0),
        );
        itertools::assert_equal(sut.neuron_ids().iter().copied(), 0..4);
    }

    #[test]
    fn probabilities_from_cue_window() {
        let mut sut = get_readout(2);
        sut.load(&[1.0, 0.0, 0.0, 0.0, 2.0, 0.0], &[0.0, 0.0, 0.5])
            .unwrap();

        let mut spikes = Array3::zeros((1, 4, 4));
        // outside the window
        spikes[[0, 0, 3]] = 1.0;
        spikes[[0, 2, 1]] = 1.0;
        spikes[[0, 3, 1]] = 1.0;
        spikes[[0, 3, 3]] = 1.0;

        let probabilities = sut.predict(spikes.view());
        let logits = [1.0f32, 1.0, 0.5];
        let norm: f32 = logits.iter().map(|x| x.exp()).sum();

        for out in 0..3 {
            assert_approx_eq!(f32, probabilities[[0, out]], logits[out].exp() / norm, epsilon = 1e-6);
        }
        assert_eq!(argmax(probabilities.row(0).as_slice().unwrap()), 0);
    }

    #[test]
    fn short_sequence_uses_all_steps() {
        let sut = get_readout(10);
        let spikes = random_spikes(2, 3, 1);
        let probabilities = sut.predict(spikes.view());

        for row in probabilities.rows() {
            assert_approx_eq!(f32, row.sum(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn zero_weight_samples_do_not_contribute() {
        let sut = get_readout(3);
        let spikes = random_spikes(2, 5, 2);

        let (loss, _, grads) = sut.loss_and_grad(spikes.view(), &[0, 2], &[0.0, 0.0], 1.0, 1.0);
        assert_eq!(loss, 0.0);
        assert!(grads.spikes.iter().all(|x| *x == 0.0));
        assert!(grads.weights.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn weight_gradient_matches_finite_differences() {
        const H: f32 = 1e-2;
        let sut = get_readout(3);
        let spikes = random_spikes(3, 6, 3);
        let labels = [0, 2, 1];
        let weights = [1.0, 0.5, 2.0];

        let loss_of = |readout: &Readout| {
            readout
                .loss_and_grad(spikes.view(), &labels, &weights, 3.5, 2.0)
                .0
        };

        let (_, _, grads) = sut.loss_and_grad(spikes.view(), &labels, &weights, 3.5, 2.0);

        for idx in 0..sut.weights().len() {
            let mut plus = sut.clone();
            plus.weights_mut()[idx] += H;
            let mut minus = sut.clone();
            minus.weights_mut()[idx] -= H;

            let numeric = (loss_of(&plus) - loss_of(&minus)) / (2.0 * H);
            assert_approx_eq!(f32, grads.weights[idx], numeric, epsilon = 1e-3);
        }

        for out in 0..3 {
            let mut plus = sut.clone();
            plus.bias_mut()[out] += H;
            let mut minus = sut.clone();
            minus.bias_mut()[out] -= H;

            let numeric = (loss_of(&plus) - loss_of(&minus)) / (2.0 * H);
            assert_approx_eq!(f32, grads.bias[out], numeric, epsilon = 1e-3);
        }
    }

    #[test]
    fn spike_gradient_only_inside_window_and_readout_neurons() {
        let sut = get_readout(2);
        let spikes = random_spikes(1, 5, 4);
        let (_, _, grads) = sut.loss_and_grad(spikes.view(), &[1], &[1.0], 1.0, 1.0);

        for step in 0..5 {
            for nid in 0..4 {
                let grad = grads.spikes[[0, step, nid]];
                if step < 3 || nid == 0 || nid == 2 {
                    assert_eq!(grad, 0.0);
                }
            }
        }
        assert!(grads.spikes.iter().any(|x| *x != 0.0));
    }

    #[test]
    fn load_rejects_wrong_length() {
        let mut sut = get_readout(2);
        let result = sut.load(&[0.0; 5], &[0.0; 3]);
        assert_eq!(
            result.unwrap_err().as_str(),
            "readout: expected 6 weights and 3 biases, got 5 and 3"
        );
    }

    #[test]
    fn neuron_output_has_threshold_and_scale_only() {
        let sut = get_neuron_output_readout(2, 0.2);
        assert!(sut.weights().is_empty());
        assert_eq!(sut.bias(), &[0.0, 0.0]);
        assert_eq!(sut.num_outputs(), 2);
    }

    #[test]
    fn neuron_output_compares_mean_activity_with_threshold() {
        let mut sut = get_neuron_output_readout(2, 0.2);
        sut.load(&[], &[0.3, -0.5]).unwrap();

        let mut spikes = Array3::zeros((1, 4, 4));
        // outside the window or not read out
        spikes[[0, 1, 1]] = 1.0;
        spikes[[0, 3, 0]] = 1.0;
        spikes[[0, 2, 1]] = 1.0;
        spikes[[0, 3, 1]] = 1.0;
        spikes[[0, 3, 3]] = 1.0;

        let scale = 1.0 + (1.0 + (-0.5f32).exp()).ln();
        let logits = [0.3 * scale, 0.75 * scale];
        let norm: f32 = logits.iter().map(|x| x.exp()).sum();

        let probabilities = sut.predict(spikes.view());
        for out in 0..2 {
            assert_approx_eq!(f32, probabilities[[0, out]], logits[out].exp() / norm, epsilon = 1e-6);
        }
    }

    #[test]
    fn neuron_output_gradients_match_finite_differences() {
        const H: f32 = 1e-2;
        const DAMPENING: f32 = 0.2;
        let mut sut = get_neuron_output_readout(3, DAMPENING);
        sut.load(&[], &[0.1, 0.4]).unwrap();

        let spikes = random_spikes(3, 6, 5);
        let labels = [0, 1, 1];
        let weights = [1.0, 0.5, 2.0];

        let loss_of = |readout: &Readout, spikes: &Array3<f32>| {
            readout
                .loss_and_grad(spikes.view(), &labels, &weights, 3.5, 2.0)
                .0
        };

        let (_, _, grads) = sut.loss_and_grad(spikes.view(), &labels, &weights, 3.5, 2.0);
        assert!(grads.weights.is_empty());

        for idx in 0..2 {
            let mut plus = sut.clone();
            plus.bias_mut()[idx] += H;
            let mut minus = sut.clone();
            minus.bias_mut()[idx] -= H;

            let numeric = (loss_of(&plus, &spikes) - loss_of(&minus, &spikes)) / (2.0 * H);
            assert_approx_eq!(f32, grads.bias[idx], numeric, epsilon = 1e-3);
        }

        // spikes get the exact gradient scaled by the inverse dampening
        for (batch, step, nid) in [(0, 4, 1), (1, 5, 3), (2, 3, 3)] {
            let mut plus = spikes.clone();
            plus[[batch, step, nid]] += H;
            let mut minus = spikes.clone();
            minus[[batch, step, nid]] -= H;

            let numeric = (loss_of(&sut, &plus) - loss_of(&sut, &minus)) / (2.0 * H);
            assert_approx_eq!(
                f32,
                grads.spikes[[batch, step, nid]],
                numeric / DAMPENING,
                epsilon = 1e-3
            );
        }

        for step in 0..6 {
            for nid in [0, 2] {
                assert_eq!(grads.spikes[[0, step, nid]], 0.0);
            }
            if step < 3 {
                assert_eq!(grads.spikes[[1, step, 1]], 0.0);
            }
        }
    }
}
