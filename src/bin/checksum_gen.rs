use glif_column::{instance, model::Batch};
use ndarray::Array3;
use rand::{prelude::Distribution, rngs::StdRng, SeedableRng};
use statrs::distribution::Poisson;

#[path = "../scenario_params.rs"]
mod scenario_params;

fn main() {
    env_logger::Builder::from_default_env().init();

    let network = scenario_params::get_scenario_network(0);
    let mut instance =
        instance::create_instance(&network, scenario_params::get_scenario_params(), None).unwrap();

    let mut rng = StdRng::seed_from_u64(0);
    let input_count_dist = Poisson::new(0.05).unwrap();

    let make_batch = |rng: &mut StdRng| {
        let mut batch = Batch::from_inputs(Array3::from_shape_fn(
            (2, 200, scenario_params::NUM_INPUTS),
            |_| input_count_dist.sample(rng) as f32,
        ));
        batch.labels = vec![0, 1];
        batch
    };

    let rollout = instance.rollout(make_batch(&mut rng)).unwrap();

    let mut spike_checksum = 0usize;
    for ((_, t, nid), spike) in rollout.trajectory.spikes.indexed_iter() {
        if *spike > 0.0 {
            spike_checksum += t * nid;
        }
    }

    let voltage_checksum: f64 = rollout.trajectory.voltages.iter().map(|v| *v as f64).sum();
    let current_checksum: f64 = rollout.trajectory.currents.iter().map(|c| *c as f64).sum();

    println!("rollout result:");
    println!("...spike checksum: {}", spike_checksum);
    println!("...voltage checksum: {}", voltage_checksum);
    println!("...current checksum: {}", current_checksum);

    let mut loss_checksum = 0.0;
    for _ in 0..3 {
        let result = instance.train_step(make_batch(&mut rng)).unwrap();
        loss_checksum += result.losses.total() as f64;
    }

    let snapshot = instance.extract_state_snapshot();
    let weight_checksum: f64 = snapshot
        .recurrent_weights
        .iter()
        .enumerate()
        .map(|(edge_id, weight)| edge_id as f64 * *weight as f64)
        .sum();
    let state_checksum: f64 = snapshot
        .cell_state
        .map(|state| state.v.iter().map(|v| *v as f64).sum())
        .unwrap_or(0.0);

    println!("training result:");
    println!("...loss checksum: {}", loss_checksum);
    println!("...recurrent weight checksum: {}", weight_checksum);
    println!("...cell state checksum: {}", state_checksum);
}
