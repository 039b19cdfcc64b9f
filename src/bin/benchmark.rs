use std::time::Instant;

use glif_column::{instance, model::Batch};
use ndarray::Array3;
use rand::{prelude::Distribution, rngs::StdRng, SeedableRng};
use statrs::distribution::Poisson;

#[path = "../scenario_params.rs"]
mod scenario_params;

const BATCH_SIZE: usize = 8;
const NUM_STEPS: usize = 100;
const NUM_TRAIN_STEPS: usize = 20;

fn main() {
    env_logger::Builder::from_default_env().init();

    let mut params = scenario_params::get_scenario_params();
    params.technical_params.num_threads = Some(num_cpus::get().min(BATCH_SIZE));

    let network = scenario_params::get_scenario_network(0);
    let mut instance = instance::create_instance(&network, params, None).unwrap();

    let mut rng = StdRng::seed_from_u64(0);
    let input_count_dist = Poisson::new(0.02).unwrap();

    let mut spike_count = 0.0;
    let wall_start = Instant::now();

    for step in 0..NUM_TRAIN_STEPS {
        let mut batch = Batch::from_inputs(Array3::from_shape_fn(
            (BATCH_SIZE, NUM_STEPS, scenario_params::NUM_INPUTS),
            |_| input_count_dist.sample(&mut rng) as f32,
        ));
        batch.labels = (0..BATCH_SIZE).map(|row| (row + step) % 2).collect();

        let result = instance.train_step(batch).unwrap();
        spike_count += result.trajectory.spikes.sum() as f64;
    }

    let wall_time = wall_start.elapsed();
    let neuron_steps = (NUM_TRAIN_STEPS * BATCH_SIZE * NUM_STEPS * scenario_params::NUM_NEURONS) as f64;
    let neuron_step_throughput = neuron_steps / wall_time.as_secs_f64();

    eprintln!("Replicas: {}", instance.get_num_replicas());
    eprintln!("Spikes per neuron step: {:.4}", spike_count / neuron_steps);
    eprintln!(
        "Training throughput (forward + backward): {:.3e} neuron steps/s ({:.3} ns per neuron step)",
        neuron_step_throughput,
        1e9 / neuron_step_throughput
    );
}
