//! Differentiable penalties on trajectories and weights.
//!
//! Every objective returns its value together with the gradient w.r.t. its
//! input so the caller can feed it straight into back-propagation.

use itertools::Itertools;
use log::debug;
use ndarray::{Array3, ArrayView3, Axis};
use rand::{seq::SliceRandom, Rng};
use simple_error::SimpleError;

use crate::{
    network::NetworkDescription,
    neuron::CellParams,
    types::{HashMap, HashSet},
    util::relu,
};

/// Smoothing width of the quantile loss around zero.
pub const QUANTILE_KAPPA: f32 = 0.002;

/// Huber-smoothed pinball loss of the residual `u` at quantile level `tau`.
pub fn huber_quantile_loss(u: f32, tau: f32, kappa: f32) -> f32 {
    let weight = quantile_weight(u, tau);

    if u.abs() <= kappa {
        weight / (2.0 * kappa) * u * u
    } else {
        weight * (u.abs() - 0.5 * kappa)
    }
}

pub fn huber_quantile_grad(u: f32, tau: f32, kappa: f32) -> f32 {
    let weight = quantile_weight(u, tau);

    if u.abs() <= kappa {
        weight * u / kappa
    } else {
        weight * u.signum()
    }
}

fn quantile_weight(u: f32, tau: f32) -> f32 {
    let indicator = if u <= 0.0 { 1.0 } else { 0.0 };
    (tau - indicator).abs()
}

/// Draws `num_neurons` rates from an empirical sample, with replacement, and
/// returns them sorted ascending.
pub fn sample_firing_rates<R: Rng>(rates: &[f32], num_neurons: usize, rng: &mut R) -> Vec<f32> {
    assert!(!rates.is_empty(), "empty rate sample");

    let mut sampled: Vec<f32> = (0..num_neurons)
        .map(|_| *rates.choose(rng).expect("sample is not empty"))
        .collect();
    sampled.sort_by(f32::total_cmp);
    sampled
}

#[derive(Debug, Clone)]
pub struct RateGroup {
    pub neuron_ids: Vec<usize>,
    /// Target rates in spikes per step, ascending.
    pub sorted_target_rates: Vec<f32>,
}

/// Matches the distribution of observed per-neuron rates to a target
/// distribution, separately for every group of neurons.
#[derive(Debug, Clone)]
pub struct RateDistributionTarget {
    groups: Vec<RateGroup>,
    rate_cost: f32,
}

impl RateDistributionTarget {
    pub fn new(groups: Vec<RateGroup>, rate_cost: f32) -> Result<Self, SimpleError> {
        let mut seen = HashSet::default();

        for (group_id, group) in groups.iter().enumerate() {
            if let Some(nid) = group.neuron_ids.iter().find(|nid| !seen.insert(**nid)) {
                return Err(SimpleError::new(format!(
                    "rate group {}: neuron {} is already targeted",
                    group_id, nid
                )));
            }

            if group.neuron_ids.len() != group.sorted_target_rates.len() {
                return Err(SimpleError::new(format!(
                    "rate group {}: {} neurons but {} target rates",
                    group_id,
                    group.neuron_ids.len(),
                    group.sorted_target_rates.len()
                )));
            }

            if group
                .sorted_target_rates
                .iter()
                .tuple_windows()
                .any(|(a, b)| a > b)
            {
                return Err(SimpleError::new(format!(
                    "rate group {}: target rates are not sorted",
                    group_id
                )));
            }
        }

        Ok(Self { groups, rate_cost })
    }

    /// One group per node type, targets sampled from the per-type empirical
    /// rates. Types without a sample are left out.
    pub fn from_type_rates<R: Rng>(
        network: &NetworkDescription,
        type_rates: &HashMap<usize, Vec<f32>>,
        rate_cost: f32,
        rng: &mut R,
    ) -> Result<Self, SimpleError> {
        let mut groups = Vec::new();

        for type_id in type_rates.keys().copied().sorted() {
            let neuron_ids: Vec<usize> = network
                .node_type_ids
                .iter()
                .positions(|id| *id == type_id)
                .collect();

            if neuron_ids.is_empty() {
                continue;
            }

            let rates = &type_rates[&type_id];
            if rates.is_empty() {
                return Err(SimpleError::new(format!(
                    "empty rate sample for node type {}",
                    type_id
                )));
            }

            let sorted_target_rates = sample_firing_rates(rates, neuron_ids.len(), rng);
            groups.push(RateGroup {
                neuron_ids,
                sorted_target_rates,
            });
        }

        debug!("rate distribution target with {} groups", groups.len());
        Self::new(groups, rate_cost)
    }

    /// Checks that every targeted neuron exists in a column of `num_neurons`.
    pub fn validate(&self, num_neurons: usize) -> Result<(), SimpleError> {
        for (group_id, group) in self.groups.iter().enumerate() {
            if let Some(nid) = group.neuron_ids.iter().find(|nid| **nid >= num_neurons) {
                return Err(SimpleError::new(format!(
                    "rate group {}: neuron {} out of range for {} neurons",
                    group_id, nid, num_neurons
                )));
            }
        }

        Ok(())
    }

    pub fn groups(&self) -> &[RateGroup] {
        &self.groups
    }

    /// Loss and its gradient w.r.t. `spikes` (`(batch, time, n)`).
    pub fn loss_and_grad<R: Rng>(
        &self,
        spikes: ArrayView3<f32>,
        rng: &mut R,
    ) -> (f32, Array3<f32>) {
        let (batch_size, num_steps, _) = spikes.dim();
        let mut grad = Array3::zeros(spikes.dim());

        if batch_size * num_steps == 0 {
            return (0.0, grad);
        }

        let rates = spikes
            .mean_axis(Axis(0))
            .and_then(|per_step| per_step.mean_axis(Axis(0)))
            .expect("non-empty batch and time axes");
        let rate_grad_scale = 1.0 / (batch_size * num_steps) as f32;

        let mut loss = 0.0;

        for group in &self.groups {
            let count = group.neuron_ids.len();

            let mut shuffled = group.neuron_ids.clone();
            shuffled.shuffle(rng);
            shuffled.sort_by(|a, b| rates[*a].total_cmp(&rates[*b]));

            let ranked = shuffled.iter().zip(&group.sorted_target_rates).enumerate();

            for (rank, (nid, target)) in ranked {
                let tau = (rank + 1) as f32 / count as f32;
                let u = target - rates[*nid];
                loss += huber_quantile_loss(u, tau, QUANTILE_KAPPA);

                // du / d rate = -1
                let rate_grad = -huber_quantile_grad(u, tau, QUANTILE_KAPPA) * self.rate_cost;
                grad.index_axis_mut(Axis(2), *nid)
                    .fill(rate_grad * rate_grad_scale);
            }
        }

        (loss * self.rate_cost, grad)
    }
}

/// Squared hinge on normalized voltages outside `[-1, 1]`, summed over neurons
/// and averaged over batch and time.
#[derive(Debug, Clone)]
pub struct VoltageRegularization {
    voltage_scale: Vec<f32>,
    voltage_offset: Vec<f32>,
    voltage_cost: f32,
}

impl VoltageRegularization {
    pub fn new(cell_params: &CellParams, voltage_cost: f32) -> Self {
        Self {
            voltage_scale: cell_params.voltage_scale.clone(),
            voltage_offset: cell_params.voltage_offset.clone(),
            voltage_cost,
        }
    }

    /// Loss and gradient w.r.t. the de-normalized `voltages` (`(batch, time, n)`).
    pub fn loss_and_grad(&self, voltages: ArrayView3<f32>) -> (f32, Array3<f32>) {
        let (batch_size, num_steps, num_neurons) = voltages.dim();
        assert_eq!(num_neurons, self.voltage_scale.len(), "voltage width mismatch");

        let mut grad = Array3::zeros(voltages.dim());
        let num_samples = (batch_size * num_steps).max(1) as f32;
        let mut total = 0.0;

        for ((row, step, nid), voltage) in voltages.indexed_iter() {
            let v = (voltage - self.voltage_offset[nid]) / self.voltage_scale[nid];
            let above = relu(v - 1.0);
            let below = relu(-v - 1.0);
            total += above * above + below * below;
            grad[[row, step, nid]] = 2.0 * (above - below) / self.voltage_scale[nid]
                * self.voltage_cost
                / num_samples;
        }

        (total / num_samples * self.voltage_cost, grad)
    }
}

/// Keeps weights close to their initial values.
#[derive(Debug, Clone)]
pub struct StiffRegularizer {
    strength: f32,
    initial_value: Vec<f32>,
}

impl StiffRegularizer {
    pub fn new(strength: f32, initial_value: Vec<f32>) -> Self {
        Self {
            strength,
            initial_value,
        }
    }

    pub fn loss(&self, weights: &[f32]) -> f32 {
        assert_eq!(weights.len(), self.initial_value.len());
        self.strength
            * weights
                .iter()
                .zip(&self.initial_value)
                .map(|(w, w0)| (w - w0) * (w - w0))
                .sum::<f32>()
    }

    pub fn accumulate_gradient(&self, weights: &[f32], grad: &mut [f32]) {
        assert_eq!(weights.len(), self.initial_value.len());
        assert_eq!(grad.len(), weights.len());

        if self.strength == 0.0 {
            return;
        }

        for ((g, w), w0) in grad.iter_mut().zip(weights).zip(&self.initial_value) {
            *g += 2.0 * self.strength * (w - w0);
        }
    }
}
