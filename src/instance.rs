use crate::cell::CellState;
use crate::model::{
    Batch, ColumnModel, ForwardPass, Losses, ModelGradients, ParamGroups, StepOutcome,
};
use crate::network::NetworkDescription;
use crate::optimizer::Adam;
use crate::params;
use crate::params::{GradientReduction, InstanceParams};
use crate::regularizers::RateDistributionTarget;
use crate::rollout::Trajectory;
use crate::state_snapshot::StateSnapshot;
use crate::util::get_shard_range;
use bus::{Bus, BusReader};
use core_affinity::CoreId;
use itertools::Itertools;
use log::{debug, info, warn};
use ndarray::{concatenate, Array2, Axis};
use num_cpus;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use simple_error::SimpleResult;
use simple_error::{try_with, SimpleError};
use std::sync::mpsc::channel as mpsc_channel;
use std::sync::mpsc::Receiver as MpscReceiver;
use std::sync::mpsc::Sender as MpscSender;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Instant;

pub fn create_instance(
    network: &NetworkDescription,
    params: InstanceParams,
    rate_target: Option<RateDistributionTarget>,
) -> Result<Instance, SimpleError> {
    try_with!(
        params::validate_instance_params(&params),
        "invalid instance parameters"
    );

    let seed = params
        .technical_params
        .seed_override
        .unwrap_or_else(|| rand::thread_rng().gen());
    let mut rng = StdRng::seed_from_u64(seed);

    let model = ColumnModel::new(network, &params, &mut rng)?;

    if let Some(rate_target) = &rate_target {
        try_with!(
            rate_target.validate(model.num_neurons()),
            "invalid rate target"
        );
    }
    let mut optimizer = Adam::new(&params.optimizer);
    let param_groups = model.register_parameters(&mut optimizer);

    let mut broadcast_tx = Bus::new(1);
    let (replica_result_tx, replica_result_rx) = mpsc_channel();

    let num_replicas = get_num_threads(&params);
    let mut join_handles = Vec::new();

    info!("starting {} replica threads, seed {}", num_replicas, seed);

    for replica_id in 0..num_replicas {
        let broadcast_rx = broadcast_tx.add_rx();
        let replica_result_tx = replica_result_tx.clone();
        let pin_threads = params.technical_params.pin_threads;

        join_handles.push(thread::spawn(move || {
            if pin_threads {
                let core_id = CoreId { id: replica_id };
                core_affinity::set_for_current(core_id);
            }

            run_replica(replica_id, num_replicas, broadcast_rx, replica_result_tx);
        }));
    }

    Ok(Instance {
        model: Arc::new(model),
        optimizer,
        param_groups,
        rate_target: rate_target.map(Arc::new),
        training_params: params.training.clone(),
        rng,
        state: None,
        broadcast_tx: Some(broadcast_tx),
        replica_result_rx,
        num_replicas,
        step_count: 0,
        join_handles,
    })
}

fn get_num_threads(params: &InstanceParams) -> usize {
    params
        .technical_params
        .num_threads
        .unwrap_or_else(|| num_cpus::get())
}

#[derive(Debug, Clone)]
enum ReplicaTask {
    Train {
        rate_target: Option<Arc<RateDistributionTarget>>,
        weight_normalizer: f32,
    },
    Rollout,
}

/// Read-only input of one step, shared by all replicas.
#[derive(Debug)]
struct StepContext {
    model: Arc<ColumnModel>,
    batch: Arc<Batch>,
    initial_state: CellState,
    seeds: Vec<u64>,
    task: ReplicaTask,
}

#[derive(Debug)]
enum ReplicaOutcome {
    Train(StepOutcome),
    Rollout(ForwardPass),
}

#[derive(Debug)]
struct ReplicaResult {
    replica_id: usize,
    outcome: thread::Result<ReplicaOutcome>,
}

fn run_replica(
    replica_id: usize,
    num_replicas: usize,
    mut broadcast_rx: BusReader<Arc<StepContext>>,
    replica_result_tx: MpscSender<ReplicaResult>,
) {
    while let Ok(ctx) = broadcast_rx.recv() {
        // a panicking shard must still report, otherwise the main thread waits forever
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            process_shard(&ctx, replica_id, num_replicas)
        }));

        // release the shared model before reporting back
        drop(ctx);

        replica_result_tx
            .send(ReplicaResult {
                replica_id,
                outcome,
            })
            .expect("replica result channel closed");
    }

    debug!("replica {} stopped", replica_id);
}

fn process_shard(ctx: &StepContext, replica_id: usize, num_replicas: usize) -> ReplicaOutcome {
    let rows = get_shard_range(num_replicas, replica_id, ctx.batch.batch_size());
    let mut rng = StdRng::seed_from_u64(ctx.seeds[replica_id]);
    let shard = ctx.batch.shard(rows.clone());
    let initial_state = ctx.initial_state.select_rows(rows);

    match &ctx.task {
        ReplicaTask::Train {
            rate_target,
            weight_normalizer,
        } => ReplicaOutcome::Train(ctx.model.loss_and_gradients(
            shard,
            initial_state,
            rate_target.as_deref(),
            *weight_normalizer,
            &mut rng,
        )),
        ReplicaTask::Rollout => ReplicaOutcome::Rollout(ctx.model.forward(
            shard.inputs,
            shard.state_inputs,
            initial_state,
            &mut rng,
            false,
        )),
    }
}

#[derive(Debug)]
pub struct TrainStepResult {
    pub step: usize,
    pub losses: Losses,
    pub probabilities: Array2<f32>,
    pub trajectory: Trajectory,
    /// Mean spike probability per neuron and step over the batch.
    pub mean_rate: f32,
}

#[derive(Debug)]
pub struct RolloutResult {
    pub trajectory: Trajectory,
    pub final_state: CellState,
    pub probabilities: Array2<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub completed_steps: usize,
    /// Mean over the completed steps.
    pub losses: Losses,
    pub accuracy: f32,
}

pub struct Instance {
    model: Arc<ColumnModel>,
    optimizer: Adam,
    param_groups: ParamGroups,
    rate_target: Option<Arc<RateDistributionTarget>>,
    training_params: params::TrainingParams,
    rng: StdRng,
    state: Option<CellState>,
    broadcast_tx: Option<Bus<Arc<StepContext>>>,
    replica_result_rx: MpscReceiver<ReplicaResult>,
    num_replicas: usize,
    step_count: usize,
    join_handles: Vec<JoinHandle<()>>,
}

impl Instance {
    pub fn get_num_neurons(&self) -> usize {
        self.model.num_neurons()
    }

    pub fn get_num_inputs(&self) -> usize {
        self.model.num_inputs()
    }

    pub fn get_num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn get_step_count(&self) -> usize {
        self.step_count
    }

    pub fn model(&self) -> &ColumnModel {
        &self.model
    }

    pub fn state(&self) -> Option<&CellState> {
        self.state.as_ref()
    }

    pub fn reset_state(&mut self) {
        self.state = None;
    }

    fn initial_state(&mut self, batch_size: usize) -> CellState {
        match self.state.take() {
            Some(state) if state.batch_size() == batch_size => state,
            Some(state) => {
                warn!(
                    "batch size changed from {} to {}, starting from zero state",
                    state.batch_size(),
                    batch_size
                );
                self.model.zero_state(batch_size)
            }
            None => self.model.zero_state(batch_size),
        }
    }

    fn check_batch(&self, batch: &Batch) -> SimpleResult<()> {
        if batch.batch_size() == 0 {
            return Err(SimpleError::new("empty batch"));
        }

        self.model.check_batch(batch)
    }

    /// Runs `ctx` on every replica and returns the outcomes in replica order.
    /// A panic in any replica is re-raised here once all replicas have reported.
    fn run_replicas(&mut self, ctx: StepContext) -> Vec<ReplicaOutcome> {
        self.broadcast_tx
            .as_mut()
            .expect("replica broadcast channel already closed")
            .broadcast(Arc::new(ctx));

        let mut results = Vec::new();

        for _ in 0..self.num_replicas {
            results.push(
                self.replica_result_rx
                    .recv()
                    .expect("replica result channel closed"),
            );
        }

        results.sort_by_key(|result| result.replica_id);

        let mut outcomes = Vec::with_capacity(results.len());
        let mut first_panic = None;

        for result in results {
            match result.outcome {
                Ok(outcome) => outcomes.push(outcome),
                Err(payload) => {
                    warn!("replica {} panicked", result.replica_id);
                    first_panic.get_or_insert(payload);
                }
            }
        }

        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }

        outcomes
    }

    fn draw_seeds(&mut self) -> Vec<u64> {
        (0..self.num_replicas).map(|_| self.rng.gen()).collect()
    }

    /// Forward and backward pass over `batch`, followed by one optimizer step.
    /// In stateful mode the final cell state becomes the initial state of the
    /// next step.
    pub fn train_step(&mut self, batch: Batch) -> SimpleResult<TrainStepResult> {
        self.check_batch(&batch)?;

        let batch_size = batch.batch_size();
        let initial_state = if self.training_params.stateful {
            self.initial_state(batch_size)
        } else {
            self.model.zero_state(batch_size)
        };

        let mut weight_normalizer: f32 = batch.sample_weights.iter().sum();
        if self.training_params.gradient_reduction == GradientReduction::Mean {
            // undone by the mean reduction, so the read-out term stays a global mean
            weight_normalizer /= self.num_replicas as f32;
        }

        let ctx = StepContext {
            model: self.model.clone(),
            batch: Arc::new(batch),
            initial_state,
            seeds: self.draw_seeds(),
            task: ReplicaTask::Train {
                rate_target: self.rate_target.clone(),
                weight_normalizer,
            },
        };

        let outcomes = self.run_replicas(ctx);
        let aggregated = aggregate_train_outcomes(
            outcomes,
            self.training_params.gradient_reduction,
            self.num_replicas,
        );

        let mut losses = aggregated.losses;
        let mut gradients = aggregated.gradients;
        losses.weight = self.model.weight_loss_and_gradient(&mut gradients);

        let model = Arc::make_mut(&mut self.model);
        model.apply_gradients(&mut self.optimizer, &self.param_groups, &gradients);

        if self.training_params.stateful {
            self.state = Some(aggregated.final_state);
        }

        let step = self.step_count;
        self.step_count += 1;

        let mean_rate = aggregated.trajectory.spikes.mean().unwrap_or(0.0);

        debug!(
            "step {}: total loss {:.5} (rate {:.5}, voltage {:.5}, classification {:.5}, weight {:.5}), mean rate {:.4}",
            step,
            losses.total(),
            losses.rate,
            losses.voltage,
            losses.classification,
            losses.weight,
            mean_rate
        );

        Ok(TrainStepResult {
            step,
            losses,
            probabilities: aggregated.probabilities,
            trajectory: aggregated.trajectory,
            mean_rate,
        })
    }

    /// Evaluation rollout from the zero state. Parameters and the persistent
    /// state are left untouched.
    pub fn rollout(&mut self, batch: Batch) -> SimpleResult<RolloutResult> {
        self.check_batch(&batch)?;
        let batch_size = batch.batch_size();

        let ctx = StepContext {
            model: self.model.clone(),
            batch: Arc::new(batch),
            initial_state: self.model.zero_state(batch_size),
            seeds: self.draw_seeds(),
            task: ReplicaTask::Rollout,
        };

        let passes: Vec<ForwardPass> = self
            .run_replicas(ctx)
            .into_iter()
            .map(|outcome| match outcome {
                ReplicaOutcome::Rollout(pass) => pass,
                ReplicaOutcome::Train(_) => unreachable!("rollout task yields forward passes"),
            })
            .collect();

        let trajectories = passes
            .iter()
            .map(|pass| pass.rollout.trajectory.clone())
            .collect_vec();
        let states = passes
            .iter()
            .map(|pass| pass.rollout.final_state.clone())
            .collect_vec();
        let probabilities = passes
            .iter()
            .map(|pass| pass.probabilities.view())
            .collect_vec();

        Ok(RolloutResult {
            trajectory: Trajectory::concatenate(&trajectories),
            final_state: CellState::concatenate(&states),
            probabilities: concatenate(Axis(0), &probabilities)
                .expect("probability shards share their width"),
        })
    }

    /// Runs `num_epochs` epochs of `steps_per_epoch` training steps, drawing
    /// batches from `next_batch(epoch, step)`. The cell state is reset at every
    /// epoch start. Stops between steps once the configured wall-clock budget
    /// is spent.
    pub fn run_epochs<F>(
        &mut self,
        num_epochs: usize,
        steps_per_epoch: usize,
        mut next_batch: F,
    ) -> SimpleResult<Vec<EpochSummary>>
    where
        F: FnMut(usize, usize) -> Batch,
    {
        let start_time = Instant::now();
        let max_seconds = self.training_params.max_time.map(|hours| hours * 3600.0);
        let mut summaries = Vec::new();

        'epochs: for epoch in 0..num_epochs {
            self.reset_state();

            let mut summary = EpochSummary {
                epoch,
                completed_steps: 0,
                losses: Losses::default(),
                accuracy: 0.0,
            };
            let mut correct = 0.0;
            let mut total_weight = 0.0;

            for step in 0..steps_per_epoch {
                if let Some(max_seconds) = max_seconds {
                    if start_time.elapsed().as_secs_f64() > max_seconds {
                        info!(
                            "wall-clock budget of {:.3} h exhausted in epoch {} after {} steps",
                            max_seconds / 3600.0,
                            epoch,
                            summary.completed_steps
                        );
                        summaries.push(finish_summary(summary, correct, total_weight));
                        break 'epochs;
                    }
                }

                let batch = next_batch(epoch, step);
                let labels = batch.labels.clone();
                let sample_weights = batch.sample_weights.clone();
                let result = self.train_step(batch)?;

                for ((probs, label), weight) in
                    result.probabilities.rows().into_iter().zip(&labels).zip(&sample_weights)
                {
                    let predicted = crate::readout::argmax(&probs.to_vec());
                    if predicted == *label {
                        correct += weight;
                    }
                    total_weight += weight;
                }

                summary.losses += result.losses;
                summary.completed_steps += 1;
            }

            let summary = finish_summary(summary, correct, total_weight);
            info!(
                "epoch {}: {} steps, mean loss {:.5}, accuracy {:.3}",
                epoch,
                summary.completed_steps,
                summary.losses.total(),
                summary.accuracy
            );
            summaries.push(summary);
        }

        Ok(summaries)
    }

    pub fn extract_state_snapshot(&self) -> StateSnapshot {
        self.model.snapshot(self.state.clone())
    }

    /// Restores parameters and cell state. Nothing changes if the snapshot does
    /// not fit the model.
    pub fn load_state_snapshot(&mut self, snapshot: &StateSnapshot) -> SimpleResult<()> {
        if let Some(state) = &snapshot.cell_state {
            try_with!(self.model.check_cell_state(state), "cell state");
        }

        Arc::make_mut(&mut self.model).load_weights(snapshot)?;
        self.state = snapshot.cell_state.clone();
        Ok(())
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        drop(self.broadcast_tx.take()); // signals the replica threads to exit the loop

        self.join_handles.drain(..).for_each(|join_handle| {
            join_handle.join().ok();
        });
    }
}

fn finish_summary(mut summary: EpochSummary, correct: f32, total_weight: f32) -> EpochSummary {
    if summary.completed_steps > 0 {
        let mut losses = summary.losses;
        let scale = 1.0 / summary.completed_steps as f32;
        losses.rate *= scale;
        losses.voltage *= scale;
        losses.classification *= scale;
        losses.weight *= scale;
        summary.losses = losses;
    }

    if total_weight > 0.0 {
        summary.accuracy = correct / total_weight;
    }

    summary
}

struct AggregatedOutcome {
    losses: Losses,
    gradients: ModelGradients,
    trajectory: Trajectory,
    final_state: CellState,
    probabilities: Array2<f32>,
}

/// Reduces replica outcomes, ordered by replica id, into one gradient set and
/// reassembles the per-shard outputs along the batch axis.
fn aggregate_train_outcomes(
    outcomes: Vec<ReplicaOutcome>,
    reduction: GradientReduction,
    num_replicas: usize,
) -> AggregatedOutcome {
    let outcomes = outcomes
        .into_iter()
        .map(|outcome| match outcome {
            ReplicaOutcome::Train(outcome) => outcome,
            ReplicaOutcome::Rollout(_) => unreachable!("train task yields step outcomes"),
        })
        .collect_vec();

    let mut losses = Losses::default();
    let mut gradients = outcomes[0].gradients.clone();
    losses += outcomes[0].losses;

    for outcome in &outcomes[1..] {
        losses += outcome.losses;
        gradients += &outcome.gradients;
    }

    if reduction == GradientReduction::Mean {
        let scale = 1.0 / num_replicas as f32;
        gradients.scale(scale);
        losses.rate *= scale;
        losses.voltage *= scale;
        losses.classification *= scale;
    }

    let trajectories = outcomes
        .iter()
        .map(|outcome| outcome.trajectory.clone())
        .collect_vec();
    let states = outcomes
        .iter()
        .map(|outcome| outcome.final_state.clone())
        .collect_vec();
    let probabilities = outcomes
        .iter()
        .map(|outcome| outcome.probabilities.view())
        .collect_vec();

    AggregatedOutcome {
        losses,
        gradients,
        trajectory: Trajectory::concatenate(&trajectories),
        final_state: CellState::concatenate(&states),
        probabilities: concatenate(Axis(0), &probabilities)
            .expect("probability shards share their width"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        delay_buffer::DelayBuffer, network::test_util::get_template_network,
        params::test_util::get_template_instance_params, regularizers::RateGroup,
        util::test_util::assert_all,
    };
    use float_cmp::assert_approx_eq;
    use itertools::assert_equal;
    use ndarray::Array3;

    fn driven_batch(batch_size: usize, num_steps: usize) -> Batch {
        let mut batch = Batch::from_inputs(Array3::from_shape_fn(
            (batch_size, num_steps, 2),
            |(row, step, channel)| ((row + step + channel) % 3) as f32 * 50.0,
        ));
        batch.labels = (0..batch_size).map(|row| row % 2).collect();
        batch
    }

    fn create_template_instance(num_threads: usize) -> Instance {
        let mut params = get_template_instance_params();
        params.technical_params.num_threads = Some(num_threads);
        params.regularization.classification_cost = 1.0;
        create_instance(&get_template_network(), params, None).unwrap()
    }

    fn available_threads() -> usize {
        num_cpus::get().min(3)
    }

    #[test]
    fn dimensions() {
        let instance = create_template_instance(1);
        assert_eq!(instance.get_num_neurons(), 4);
        assert_eq!(instance.get_num_inputs(), 2);
        assert_eq!(instance.get_num_replicas(), 1);
        assert_eq!(instance.get_step_count(), 0);
    }

    #[test]
    fn invalid_params() {
        let mut params = get_template_instance_params();
        params.optimizer.learning_rate = 0.0;
        let result = create_instance(&get_template_network(), params, None);
        assert_eq!(
            result.err().unwrap().as_str(),
            "invalid instance parameters, learning_rate must be strictly positive"
        );
    }

    #[test]
    fn invalid_batch() {
        let mut instance = create_template_instance(1);

        let result = instance.train_step(Batch::from_inputs(Array3::zeros((0, 5, 2))));
        assert_eq!(result.unwrap_err().as_str(), "empty batch");

        let result = instance.rollout(Batch::from_inputs(Array3::zeros((2, 5, 1))));
        assert_eq!(
            result.unwrap_err().as_str(),
            "batch has 1 input channels, expected 2"
        );
        assert_eq!(instance.get_step_count(), 0);
    }

    #[test]
    fn replicas_reproduce_single_thread_rollout() {
        let mut single = create_template_instance(1);
        let mut multi = create_template_instance(available_threads());

        let reference = single.rollout(driven_batch(5, 20)).unwrap();
        let result = multi.rollout(driven_batch(5, 20)).unwrap();

        assert!(reference.trajectory.spikes.sum() > 0.0);
        assert_eq!(result.trajectory.spikes, reference.trajectory.spikes);
        assert_eq!(result.final_state, reference.final_state);
        assert_eq!(result.probabilities.dim(), (5, 2));
    }

    #[test]
    fn replicas_reproduce_single_thread_training() {
        let mut single = create_template_instance(1);
        let mut multi = create_template_instance(available_threads());

        // the voltage regularizer averages per shard, so only the first step
        // and the read-out are comparable
        let reference = single.train_step(driven_batch(5, 20)).unwrap();
        let result = multi.train_step(driven_batch(5, 20)).unwrap();

        assert_approx_eq!(
            f32,
            result.losses.classification,
            reference.losses.classification,
            epsilon = 1e-5
        );
        assert_eq!(result.trajectory.spikes, reference.trajectory.spikes);

        let reference = single.extract_state_snapshot();
        let result = multi.extract_state_snapshot();
        for (a, b) in result.readout_bias.iter().zip(&reference.readout_bias) {
            assert_approx_eq!(f32, *a, *b, epsilon = 1e-5);
        }
        for (a, b) in result.readout_weights.iter().zip(&reference.readout_weights) {
            assert_approx_eq!(f32, *a, *b, epsilon = 1e-5);
        }
    }

    #[test]
    fn signs_survive_training() {
        let mut instance = create_template_instance(1);
        let initial = instance.extract_state_snapshot();

        for _ in 0..5 {
            instance.train_step(driven_batch(4, 10)).unwrap();
        }

        let trained = instance.extract_state_snapshot();
        for (w, w0) in trained.recurrent_weights.iter().zip(&initial.recurrent_weights) {
            assert!(*w0 < 0.0 && *w <= 0.0 || *w0 >= 0.0 && *w >= 0.0);
        }
        assert_eq!(instance.get_step_count(), 5);
    }

    #[test]
    fn stateful_continuation() {
        let mut instance = create_template_instance(1);
        assert!(instance.state().is_none());

        let result = instance.train_step(driven_batch(2, 6)).unwrap();
        assert_eq!(result.step, 0);
        assert_eq!(instance.state().unwrap().batch_size(), 2);
        assert_ne!(instance.state().unwrap(), &instance.model().zero_state(2));

        let snapshot = instance.extract_state_snapshot();
        assert_eq!(snapshot.cell_state.as_ref(), instance.state());

        instance.reset_state();
        assert!(instance.state().is_none());

        instance.load_state_snapshot(&snapshot).unwrap();
        assert_eq!(instance.state(), snapshot.cell_state.as_ref());
    }

    #[test]
    #[should_panic(expected = "membrane voltage is not finite")]
    fn replica_panic_reaches_caller() {
        let mut instance = create_template_instance(available_threads());

        let mut state = instance.model().zero_state(3);
        state.v[[0, 0]] = f32::NAN;
        let mut snapshot = instance.extract_state_snapshot();
        snapshot.cell_state = Some(state);
        instance.load_state_snapshot(&snapshot).unwrap();

        // only the first shard sees the broken row
        instance.train_step(driven_batch(3, 4)).unwrap();
    }

    #[test]
    fn mismatched_snapshot_rejected_without_changes() {
        let mut instance = create_template_instance(1);
        instance.train_step(driven_batch(2, 4)).unwrap();
        let before = instance.extract_state_snapshot();

        let mut broken = before.clone();
        broken.readout_bias.fill(1.0);
        broken.cell_state.as_mut().unwrap().z_buf = DelayBuffer::new(1, 2, 4);

        assert_eq!(
            instance.load_state_snapshot(&broken).unwrap_err().as_str(),
            "cell state, delay buffer depth mismatch: 1 slots, expected 3"
        );
        assert_eq!(instance.extract_state_snapshot(), before);

        let mut broken = before.clone();
        broken.cell_state = None;
        broken.background_weights.push(0.0);
        assert!(instance.load_state_snapshot(&broken).is_err());
        assert_eq!(instance.extract_state_snapshot(), before);
    }

    #[test]
    fn rate_target_checked_against_network() {
        let groups = vec![RateGroup {
            neuron_ids: vec![0, 7],
            sorted_target_rates: vec![0.01, 0.02],
        }];
        let rate_target = RateDistributionTarget::new(groups, 1.0).unwrap();

        let result = create_instance(
            &get_template_network(),
            get_template_instance_params(),
            Some(rate_target),
        );
        assert_eq!(
            result.err().unwrap().as_str(),
            "invalid rate target, rate group 0: neuron 7 out of range for 4 neurons"
        );
    }

    #[test]
    fn stateless_training_keeps_no_state() {
        let mut params = get_template_instance_params();
        params.training.stateful = false;
        let mut instance = create_instance(&get_template_network(), params, None).unwrap();

        instance.train_step(driven_batch(2, 6)).unwrap();
        assert!(instance.state().is_none());
    }

    #[test]
    fn epochs_reset_state_and_report() {
        let mut instance = create_template_instance(1);
        let mut requested = Vec::new();

        let summaries = instance
            .run_epochs(2, 3, |epoch, step| {
                requested.push((epoch, step));
                driven_batch(2, 6)
            })
            .unwrap();

        assert_equal(
            requested,
            [(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)],
        );
        assert_eq!(summaries.len(), 2);
        assert_all(summaries.iter(), |summary| summary.completed_steps == 3);
        assert_all(summaries.iter(), |summary| {
            (0.0..=1.0).contains(&summary.accuracy)
        });
        assert_eq!(instance.get_step_count(), 6);
    }

    #[test]
    fn wall_clock_budget_stops_between_steps() {
        let mut params = get_template_instance_params();
        params.training.max_time = Some(1e-12);
        let mut instance = create_instance(&get_template_network(), params, None).unwrap();

        let summaries = instance
            .run_epochs(3, 4, |_, _| driven_batch(1, 4))
            .unwrap();

        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].completed_steps <= 1);
    }

    #[test]
    fn mean_reduction_scales_sum() {
        let network = get_template_network();
        let mut params = get_template_instance_params();
        params.regularization.classification_cost = 1.0;
        let mut sum_instance = create_instance(&network, params.clone(), None).unwrap();
        params.training.gradient_reduction = GradientReduction::Mean;
        let mut mean_instance = create_instance(&network, params, None).unwrap();

        let summed = sum_instance.train_step(driven_batch(3, 8)).unwrap();
        let averaged = mean_instance.train_step(driven_batch(3, 8)).unwrap();

        // a single replica averages over one gradient set
        assert_approx_eq!(
            f32,
            summed.losses.total(),
            averaged.losses.total(),
            epsilon = 1e-6
        );
    }

    #[test]
    fn mean_reduction_keeps_classification_independent_of_replicas() {
        let network = get_template_network();
        let mut params = get_template_instance_params();
        params.regularization.classification_cost = 1.0;
        params.training.gradient_reduction = GradientReduction::Mean;

        let mut single = create_instance(&network, params.clone(), None).unwrap();
        params.technical_params.num_threads = Some(available_threads());
        let mut multi = create_instance(&network, params, None).unwrap();

        let reference = single.train_step(driven_batch(5, 20)).unwrap();
        let result = multi.train_step(driven_batch(5, 20)).unwrap();

        assert!(reference.losses.classification > 0.0);
        assert_approx_eq!(
            f32,
            result.losses.classification,
            reference.losses.classification,
            epsilon = 1e-5
        );
    }
}
