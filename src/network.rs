//! Network description consumed at construction time.
//!
//! Produced by an external loader; this module only defines the data model and
//! checks it for consistency before any operator is built from it.

use serde::{Deserialize, Serialize};
use simple_error::{try_with, SimpleError};

use crate::types::NUM_RECEPTOR_BASES;

pub const DEFAULT_RECEPTOR_TAUS: [f32; NUM_RECEPTOR_BASES] = [2.0, 5.0, 10.0, 20.0, 50.0];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDescription {
    pub n_nodes: usize,
    pub node_type_ids: Vec<usize>,
    pub node_types: Vec<NodeTypeParams>,
    #[serde(default = "default_receptor_taus")]
    pub receptor_taus: [f32; NUM_RECEPTOR_BASES],
    pub recurrent: SynapsePopulation,
    pub input: SynapsePopulation,
    pub background: SynapsePopulation,
    #[serde(default)]
    pub readout_neuron_ids: Option<Vec<usize>>,
}

/// Raw GLIF parameters of one neuron type, in physical units (mV, pF, nS, ms).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTypeParams {
    pub v_th: f32,
    pub e_l: f32,
    pub v_reset: f32,
    pub c_m: f32,
    pub g: f32,
    pub t_ref: f32,
    pub asc_amps: [f32; 2],
    /// After-spike current decay rates in 1/ms, each in (0, 1).
    pub k: [f32; 2],
}

/// Edge list of one synapse population in coordinate form.
///
/// `indices[e] = [target, source]`, `dense_shape = [n_targets, n_sources]`. Delays
/// are only read for the recurrent population and may be left empty elsewhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynapsePopulation {
    pub indices: Vec<[usize; 2]>,
    pub weights: Vec<f32>,
    #[serde(default)]
    pub delays: Vec<f32>,
    pub dense_shape: [usize; 2],
    pub receptor_weights: Vec<[f32; NUM_RECEPTOR_BASES]>,
}

fn default_receptor_taus() -> [f32; NUM_RECEPTOR_BASES] {
    DEFAULT_RECEPTOR_TAUS
}

impl SynapsePopulation {
    pub fn num_edges(&self) -> usize {
        self.indices.len()
    }

    pub fn empty(n_targets: usize, n_sources: usize) -> Self {
        Self {
            dense_shape: [n_targets, n_sources],
            ..Default::default()
        }
    }
}

impl NetworkDescription {
    pub fn num_inputs(&self) -> usize {
        self.input.dense_shape[1]
    }

    pub fn num_background_units(&self) -> usize {
        self.background.dense_shape[1]
    }

    pub fn from_json(json: &str) -> Result<Self, SimpleError> {
        let network: NetworkDescription =
            try_with!(serde_json::from_str(json), "malformed network description");
        try_with!(validate_network(&network), "invalid network description");
        Ok(network)
    }
}

pub fn validate_network(network: &NetworkDescription) -> Result<(), SimpleError> {
    if network.node_type_ids.len() != network.n_nodes {
        return Err(SimpleError::new(format!(
            "node_type_ids has {} entries, expected {}",
            network.node_type_ids.len(),
            network.n_nodes
        )));
    }

    if let Some(type_id) = network
        .node_type_ids
        .iter()
        .find(|type_id| **type_id >= network.node_types.len())
    {
        return Err(SimpleError::new(format!("invalid node type id: {}", type_id)));
    }

    for node_type in &network.node_types {
        validate_node_type_params(node_type)?;
    }

    if network.receptor_taus.iter().any(|tau| *tau <= 0.0) {
        return Err(SimpleError::new("receptor_taus must be strictly positive"));
    }

    validate_population("recurrent synapses", &network.recurrent, network.n_nodes, true)?;
    validate_population("input synapses", &network.input, network.n_nodes, false)?;
    validate_population(
        "background synapses",
        &network.background,
        network.n_nodes,
        false,
    )?;

    if network.recurrent.dense_shape[1] != network.n_nodes {
        return Err(SimpleError::new(
            "recurrent synapses: source dimension must equal n_nodes",
        ));
    }

    if let Some(readout_neuron_ids) = &network.readout_neuron_ids {
        if let Some(nid) = readout_neuron_ids.iter().find(|nid| **nid >= network.n_nodes) {
            return Err(SimpleError::new(format!("invalid readout neuron id: {}", nid)));
        }
    }

    Ok(())
}

fn validate_node_type_params(params: &NodeTypeParams) -> Result<(), SimpleError> {
    if params.v_th <= params.e_l {
        return Err(SimpleError::new("v_th must be greater than e_l"));
    }

    if params.c_m <= 0.0 {
        return Err(SimpleError::new("c_m must be strictly positive"));
    }

    if params.g <= 0.0 {
        return Err(SimpleError::new("g must be strictly positive"));
    }

    if params.t_ref < 0.0 {
        return Err(SimpleError::new("t_ref must not be negative"));
    }

    if params.k.iter().any(|k| *k <= 0.0 || *k >= 1.0) {
        return Err(SimpleError::new("k must be in (0, 1)"));
    }

    Ok(())
}

fn validate_population(
    name: &str,
    population: &SynapsePopulation,
    n_nodes: usize,
    needs_delays: bool,
) -> Result<(), SimpleError> {
    let num_edges = population.num_edges();

    if population.dense_shape[0] != n_nodes {
        return Err(SimpleError::new(format!(
            "{}: target dimension must equal n_nodes",
            name
        )));
    }

    if population.weights.len() != num_edges {
        return Err(SimpleError::new(format!(
            "{}: {} weights for {} edges",
            name,
            population.weights.len(),
            num_edges
        )));
    }

    if population.receptor_weights.len() != num_edges {
        return Err(SimpleError::new(format!(
            "{}: {} receptor weight rows for {} edges",
            name,
            population.receptor_weights.len(),
            num_edges
        )));
    }

    if needs_delays && population.delays.len() != num_edges {
        return Err(SimpleError::new(format!(
            "{}: {} delays for {} edges",
            name,
            population.delays.len(),
            num_edges
        )));
    }

    if population.delays.iter().any(|delay| !delay.is_finite() || *delay < 0.0) {
        return Err(SimpleError::new(format!(
            "{}: delays must be finite and not negative",
            name
        )));
    }

    if population.weights.iter().any(|weight| !weight.is_finite()) {
        return Err(SimpleError::new(format!("{}: weights must be finite", name)));
    }

    for [target, source] in &population.indices {
        if *target >= population.dense_shape[0] {
            return Err(SimpleError::new(format!(
                "{}: target index {} out of range",
                name, target
            )));
        }

        if *source >= population.dense_shape[1] {
            return Err(SimpleError::new(format!(
                "{}: source index {} out of range",
                name, source
            )));
        }
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_util::get_template_network;
    use super::*;

    #[test]
    fn valid_network() {
        assert!(validate_network(&get_template_network()).is_ok());
    }

    #[test]
    fn type_id_count_mismatch() {
        let mut network = get_template_network();
        network.node_type_ids.pop();
        let result = validate_network(&network);

        assert_eq!(
            result.unwrap_err().as_str(),
            "node_type_ids has 3 entries, expected 4"
        );
    }

    #[test]
    fn invalid_type_id() {
        let mut network = get_template_network();
        network.node_type_ids[2] = 2;
        let result = validate_network(&network);

        assert_eq!(result.unwrap_err().as_str(), "invalid node type id: 2");
    }

    #[test]
    fn threshold_below_rest() {
        let mut network = get_template_network();
        network.node_types[0].v_th = -80.0;
        let result = validate_network(&network);

        assert_eq!(result.unwrap_err().as_str(), "v_th must be greater than e_l");
    }

    #[test]
    fn asc_rate_out_of_range() {
        let mut network = get_template_network();
        network.node_types[1].k[1] = 1.0;
        let result = validate_network(&network);

        assert_eq!(result.unwrap_err().as_str(), "k must be in (0, 1)");
    }

    #[test]
    fn target_out_of_range() {
        let mut network = get_template_network();
        network.recurrent.indices[0] = [12, 0];
        let result = validate_network(&network);

        assert_eq!(
            result.unwrap_err().as_str(),
            "recurrent synapses: target index 12 out of range"
        );
    }

    #[test]
    fn source_out_of_range() {
        let mut network = get_template_network();
        network.input.indices[3] = [3, 2];
        let result = validate_network(&network);

        assert_eq!(
            result.unwrap_err().as_str(),
            "input synapses: source index 2 out of range"
        );
    }

    #[test]
    fn weight_count_mismatch() {
        let mut network = get_template_network();
        network.background.weights.pop();
        let result = validate_network(&network);

        assert_eq!(
            result.unwrap_err().as_str(),
            "background synapses: 3 weights for 4 edges"
        );
    }

    #[test]
    fn missing_recurrent_delays() {
        let mut network = get_template_network();
        network.recurrent.delays.clear();
        let result = validate_network(&network);

        assert_eq!(
            result.unwrap_err().as_str(),
            "recurrent synapses: 0 delays for 4 edges"
        );
    }

    #[test]
    fn invalid_readout_neuron() {
        let mut network = get_template_network();
        network.readout_neuron_ids = Some(vec![0, 4]);
        let result = validate_network(&network);

        assert_eq!(result.unwrap_err().as_str(), "invalid readout neuron id: 4");
    }

    #[test]
    fn json_round_trip_validates() {
        let network = get_template_network();
        let json = serde_json::to_string(&network).unwrap();
        let loaded = NetworkDescription::from_json(&json).unwrap();
        assert_eq!(loaded.n_nodes, 4);
        assert_eq!(loaded.recurrent.num_edges(), 4);

        let mut broken = network;
        broken.node_types[0].c_m = 0.0;
        let json = serde_json::to_string(&broken).unwrap();
        assert!(NetworkDescription::from_json(&json).is_err());
    }
}
