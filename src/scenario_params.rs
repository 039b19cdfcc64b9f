use glif_column::network::{NetworkDescription, NodeTypeParams, SynapsePopulation};
use glif_column::params::InstanceParams;
use rand::{distributions::Uniform, prelude::Distribution, rngs::StdRng, Rng, SeedableRng};

pub const NUM_NEURONS: usize = 400;
pub const NUM_EXCITATORY: usize = 320;
pub const NUM_INPUTS: usize = 40;
pub const NUM_BACKGROUND_UNITS: usize = 10;

pub fn get_scenario_params() -> InstanceParams {
    let params_yaml_str = r#"
column:
  dt: 1.0
  surrogate: !Triangular
    dampening_factor: 0.5
  precision: Float32
  recurrent_dampening_factor: 0.5
  input_weight_scale: 1.0
  recurrent_weight_scale: 1.0
  lr_scale: 1.0
  max_delay: 5
  hard_reset: true
  train_recurrent: true
  train_input: true
  train_asc_rates: false
  background_firing_rate: 250.0
  add_background_noise: true
  use_state_input: false
  readout:
    n_output: 2
    cue_duration: 20
regularization:
  rate_cost: 10.0
  voltage_cost: 0.00001
  recurrent_weight_regularization: 0.1
  classification_cost: 1.0
optimizer:
  learning_rate: 0.01
  beta_1: 0.9
  beta_2: 0.999
  epsilon: 0.00000000001
training:
  stateful: true
  gradient_reduction: Sum
  max_time: null
technical_params:
  num_threads: 1
  pin_threads: false
  seed_override: 0
  max_projection_elements: 2147483648
  check_numerics: false
"#;

    serde_yaml::from_str(params_yaml_str).unwrap()
}

fn excitatory_type() -> NodeTypeParams {
    NodeTypeParams {
        v_th: -50.0,
        e_l: -70.0,
        v_reset: -70.0,
        c_m: 150.0,
        g: 7.5,
        t_ref: 3.0,
        asc_amps: [-15.0, -5.0],
        k: [0.3, 0.03],
    }
}

fn inhibitory_type() -> NodeTypeParams {
    NodeTypeParams {
        v_th: -45.0,
        e_l: -68.0,
        v_reset: -68.0,
        c_m: 60.0,
        g: 6.0,
        t_ref: 1.5,
        asc_amps: [-5.0, 0.0],
        k: [0.2, 0.05],
    }
}

fn random_population<R: Rng>(
    rng: &mut R,
    n_targets: usize,
    n_sources: usize,
    connect_density: f64,
    mut edge: impl FnMut(&mut R, usize) -> (f32, f32, [f32; 5]),
) -> SynapsePopulation {
    let mut population = SynapsePopulation::empty(n_targets, n_sources);

    for target in 0..n_targets {
        for source in 0..n_sources {
            if rng.gen_bool(connect_density) {
                let (weight, delay, receptor_weights) = edge(rng, source);
                population.indices.push([target, source]);
                population.weights.push(weight);
                population.delays.push(delay);
                population.receptor_weights.push(receptor_weights);
            }
        }
    }

    population
}

/// Random column of excitatory and inhibitory neurons, excitatory synapses on
/// the fast receptor bases and inhibitory ones on the slow bases.
pub fn get_scenario_network(seed: u64) -> NetworkDescription {
    let mut rng = StdRng::seed_from_u64(seed);
    let exc_weight = Uniform::new(0.0, 8.0);
    let inh_weight = Uniform::new(0.0, 16.0);
    let delay = Uniform::new(1.0, 5.0);

    let recurrent = random_population(&mut rng, NUM_NEURONS, NUM_NEURONS, 0.1, |rng, source| {
        if source < NUM_EXCITATORY {
            (exc_weight.sample(rng), delay.sample(rng), [0.8, 0.2, 0.0, 0.0, 0.0])
        } else {
            (-inh_weight.sample(rng), delay.sample(rng), [0.0, 0.0, 0.7, 0.3, 0.0])
        }
    });

    let input = random_population(&mut rng, NUM_NEURONS, NUM_INPUTS, 0.2, |rng, _| {
        (exc_weight.sample(rng), 0.0, [0.5, 0.5, 0.0, 0.0, 0.0])
    });

    let background = random_population(
        &mut rng,
        NUM_NEURONS,
        NUM_BACKGROUND_UNITS,
        0.5,
        |rng, _| (exc_weight.sample(rng) * 0.25, 0.0, [0.0, 0.0, 0.0, 0.0, 1.0]),
    );

    NetworkDescription {
        n_nodes: NUM_NEURONS,
        node_type_ids: (0..NUM_NEURONS)
            .map(|nid| if nid < NUM_EXCITATORY { 0 } else { 1 })
            .collect(),
        node_types: vec![excitatory_type(), inhibitory_type()],
        receptor_taus: glif_column::network::DEFAULT_RECEPTOR_TAUS,
        recurrent,
        input,
        background,
        readout_neuron_ids: Some((0..NUM_EXCITATORY).step_by(4).collect()),
    }
}
