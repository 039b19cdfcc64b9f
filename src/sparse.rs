//! Coordinate-sparse projection split across receptor bases.
//!
//! Each edge carries one weight and a coefficient per basis. Projecting an
//! activity matrix of shape `(rows, n_sources)` yields `(rows, n_targets * B)`,
//! where column `target * B + b` holds the contribution to basis `b`.

use log::debug;
use ndarray::{s, Array2, ArrayView2, ArrayViewMut2};
use serde::{Deserialize, Serialize};
use simple_error::SimpleError;

use crate::{
    delay_buffer::DelayBuffer, network::SynapsePopulation, optimizer::apply_sign_constraint,
    types::NUM_RECEPTOR_BASES,
};

/// Dense activity addressed by (row, source column).
pub trait SourceActivity {
    fn num_rows(&self) -> usize;
    fn num_cols(&self) -> usize;
    fn value(&self, row: usize, col: usize) -> f32;
}

impl SourceActivity for ArrayView2<'_, f32> {
    fn num_rows(&self) -> usize {
        self.nrows()
    }

    fn num_cols(&self) -> usize {
        self.ncols()
    }

    fn value(&self, row: usize, col: usize) -> f32 {
        self[[row, col]]
    }
}

impl SourceActivity for Array2<f32> {
    fn num_rows(&self) -> usize {
        self.nrows()
    }

    fn num_cols(&self) -> usize {
        self.ncols()
    }

    fn value(&self, row: usize, col: usize) -> f32 {
        self[[row, col]]
    }
}

impl SourceActivity for DelayBuffer {
    fn num_rows(&self) -> usize {
        self.batch_size()
    }

    fn num_cols(&self) -> usize {
        self.max_delay() * self.num_neurons()
    }

    fn value(&self, row: usize, col: usize) -> f32 {
        self.expanded_value(row, col)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseProjection {
    targets: Vec<usize>,
    sources: Vec<usize>,
    weights: Vec<f32>,
    receptor_weights: Vec<[f32; NUM_RECEPTOR_BASES]>,
    positive: Vec<bool>,
    dense_shape: [usize; 2],
    max_elements: usize,
}

/// Discretized recurrent delays: steps per edge in `1..=max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldedDelays {
    pub steps: Vec<usize>,
    pub max_delay: usize,
}

pub fn fold_delays(delays: &[f32], dt: f32, configured_max_delay: usize) -> FoldedDelays {
    let longest = delays.iter().fold(0.0f32, |acc, delay| acc.max(*delay));
    let max_delay = ((longest / dt).round() as usize).clamp(1, configured_max_delay);
    let max_delay_ms = max_delay as f32 * dt;

    let steps = delays
        .iter()
        .map(|delay| ((delay.clamp(dt, max_delay_ms) / dt).round() as usize).clamp(1, max_delay))
        .collect();

    FoldedDelays { steps, max_delay }
}

impl SparseProjection {
    /// Builds a projection from a population, dividing every weight by the
    /// voltage scale of its target and applying the population scale factor.
    pub fn from_population(
        population: &SynapsePopulation,
        target_voltage_scales: &[f32],
        weight_scale: f32,
        lr_scale: f32,
        max_elements: usize,
    ) -> Self {
        let targets: Vec<usize> = population.indices.iter().map(|[tgt, _]| *tgt).collect();
        let weights: Vec<f32> = population
            .weights
            .iter()
            .zip(&targets)
            .map(|(w, tgt)| w / target_voltage_scales[*tgt] * weight_scale / lr_scale)
            .collect();
        let positive = weights.iter().map(|w| *w >= 0.0).collect();

        Self {
            targets,
            sources: population.indices.iter().map(|[_, src]| *src).collect(),
            weights,
            receptor_weights: population.receptor_weights.clone(),
            positive,
            dense_shape: population.dense_shape,
            max_elements,
        }
    }

    /// Recurrent variant: source columns are shifted into the delay block of
    /// each edge, giving a dense shape of `(n, max_delay * n)`.
    pub fn from_recurrent(
        population: &SynapsePopulation,
        target_voltage_scales: &[f32],
        weight_scale: f32,
        lr_scale: f32,
        dt: f32,
        configured_max_delay: usize,
        max_elements: usize,
    ) -> (Self, usize) {
        let mut projection = Self::from_population(
            population,
            target_voltage_scales,
            weight_scale,
            lr_scale,
            max_elements,
        );

        let folded = fold_delays(&population.delays, dt, configured_max_delay);
        let num_neurons = population.dense_shape[1];

        for (source, steps) in projection.sources.iter_mut().zip(&folded.steps) {
            *source += num_neurons * (steps - 1);
        }

        projection.dense_shape = [population.dense_shape[0], folded.max_delay * num_neurons];

        (projection, folded.max_delay)
    }

    pub fn num_edges(&self) -> usize {
        self.weights.len()
    }

    pub fn dense_shape(&self) -> [usize; 2] {
        self.dense_shape
    }

    pub fn num_outputs(&self) -> usize {
        self.dense_shape[0] * NUM_RECEPTOR_BASES
    }

    pub fn edge(&self, edge_id: usize) -> (usize, usize) {
        (self.targets[edge_id], self.sources[edge_id])
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights
    }

    pub fn positive(&self) -> &[bool] {
        &self.positive
    }

    fn rows_per_chunk(&self) -> usize {
        (self.max_elements / self.num_edges().max(1)).max(1)
    }

    pub fn project<A: SourceActivity + ?Sized>(&self, activity: &A) -> Array2<f32> {
        assert_eq!(
            activity.num_cols(),
            self.dense_shape[1],
            "activity width does not match projection"
        );

        let num_rows = activity.num_rows();
        let mut result = Array2::zeros((num_rows, self.num_outputs()));
        let rows_per_chunk = self.rows_per_chunk();

        if num_rows > rows_per_chunk {
            debug!(
                "projecting {} rows over {} edges in chunks of {} rows",
                num_rows,
                self.num_edges(),
                rows_per_chunk
            );
        }

        let mut chunk_start = 0;
        while chunk_start < num_rows {
            let chunk_end = (chunk_start + rows_per_chunk).min(num_rows);
            self.project_rows(
                activity,
                chunk_start,
                result.slice_mut(s![chunk_start..chunk_end, ..]),
            );
            chunk_start = chunk_end;
        }

        result
    }

    fn project_rows<A: SourceActivity + ?Sized>(
        &self,
        activity: &A,
        row_offset: usize,
        mut out: ArrayViewMut2<f32>,
    ) {
        for (local_row, mut out_row) in out.rows_mut().into_iter().enumerate() {
            let row = row_offset + local_row;

            for edge_id in 0..self.num_edges() {
                let source_value = activity.value(row, self.sources[edge_id]);

                if source_value == 0.0 {
                    continue;
                }

                let weighted = self.weights[edge_id] * source_value;
                let base = self.targets[edge_id] * NUM_RECEPTOR_BASES;

                for (basis, coef) in self.receptor_weights[edge_id].iter().enumerate() {
                    out_row[base + basis] += weighted * coef;
                }
            }
        }
    }

    fn basis_sum(&self, edge_id: usize, grad_out: &ArrayView2<f32>, row: usize) -> f32 {
        let base = self.targets[edge_id] * NUM_RECEPTOR_BASES;
        self.receptor_weights[edge_id]
            .iter()
            .enumerate()
            .map(|(basis, coef)| coef * grad_out[[row, base + basis]])
            .sum()
    }

    /// Accumulates the gradient w.r.t. the stored weights into `grad`.
    pub fn accumulate_weight_gradient<A: SourceActivity + ?Sized>(
        &self,
        activity: &A,
        grad_out: ArrayView2<f32>,
        grad: &mut [f32],
    ) {
        assert_eq!(grad.len(), self.num_edges());
        assert_eq!(grad_out.dim(), (activity.num_rows(), self.num_outputs()));

        for row in 0..activity.num_rows() {
            for (edge_id, edge_grad) in grad.iter_mut().enumerate() {
                let source_value = activity.value(row, self.sources[edge_id]);

                if source_value != 0.0 {
                    *edge_grad += source_value * self.basis_sum(edge_id, &grad_out, row);
                }
            }
        }
    }

    pub fn weight_gradient<A: SourceActivity + ?Sized>(
        &self,
        activity: &A,
        grad_out: ArrayView2<f32>,
    ) -> Vec<f32> {
        let mut grad = vec![0.0; self.num_edges()];
        self.accumulate_weight_gradient(activity, grad_out, &mut grad);
        grad
    }

    /// Gradient w.r.t. the activity, shape `(rows, n_sources)`.
    pub fn activity_gradient(&self, grad_out: ArrayView2<f32>) -> Array2<f32> {
        assert_eq!(grad_out.ncols(), self.num_outputs());
        let mut result = Array2::zeros((grad_out.nrows(), self.dense_shape[1]));

        for row in 0..grad_out.nrows() {
            for edge_id in 0..self.num_edges() {
                result[[row, self.sources[edge_id]]] +=
                    self.weights[edge_id] * self.basis_sum(edge_id, &grad_out, row);
            }
        }

        result
    }

    /// Loaded weights are projected onto the signs fixed at construction.
    pub fn load_weights(&mut self, weights: &[f32]) -> Result<(), SimpleError> {
        if weights.len() != self.num_edges() {
            return Err(SimpleError::new(format!(
                "{} weights for {} edges",
                weights.len(),
                self.num_edges()
            )));
        }

        self.weights.copy_from_slice(weights);
        apply_sign_constraint(&mut self.weights, &self.positive);
        Ok(())
    }
}
