use serde::{Deserialize, Serialize};
use simple_error::SimpleError;

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct InstanceParams {
    pub column: ColumnParams,
    pub regularization: RegularizationParams,
    pub optimizer: OptimizerParams,
    pub training: TrainingParams,
    pub technical_params: TechnicalParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnParams {
    /// Simulation step in ms.
    pub dt: f32,
    pub surrogate: SurrogateParams,
    pub precision: Precision,
    pub recurrent_dampening_factor: f32,
    pub input_weight_scale: f32,
    pub recurrent_weight_scale: f32,
    pub lr_scale: f32,
    pub max_delay: usize,
    pub hard_reset: bool,
    pub train_recurrent: bool,
    pub train_input: bool,
    pub train_asc_rates: bool,
    /// Background unit firing rate in Hz.
    pub background_firing_rate: f32,
    pub add_background_noise: bool,
    pub use_state_input: bool,
    pub readout: ReadoutParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SurrogateParams {
    Triangular { dampening_factor: f32 },
    Gauss { sigma: f32, amplitude: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    Float32,
    Float16,
    BFloat16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadoutParams {
    pub n_output: usize,
    pub cue_duration: usize,
    #[serde(default)]
    pub mode: ReadoutMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ReadoutMode {
    /// Dense layer over the spikes of the read-out neurons.
    Dense,
    /// Two-class read-out of the mean spike of the read-out neurons against a
    /// learned threshold, both multiplied by a learned positive scale. Spike
    /// gradients pass straight through, divided by `dampening_factor`.
    NeuronOutput { dampening_factor: f32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegularizationParams {
    pub rate_cost: f32,
    pub voltage_cost: f32,
    pub recurrent_weight_regularization: f32,
    pub classification_cost: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerParams {
    pub learning_rate: f32,
    pub beta_1: f32,
    pub beta_2: f32,
    pub epsilon: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GradientReduction {
    Sum,
    /// Divides the summed rate and voltage terms by the replica count. The
    /// classification term is a mean over the global sample weight either way
    /// and does not depend on the replica count.
    Mean,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingParams {
    pub stateful: bool,
    pub gradient_reduction: GradientReduction,
    /// Wall-clock budget in hours, checked between training steps.
    pub max_time: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalParams {
    pub num_threads: Option<usize>,
    pub pin_threads: bool,
    pub seed_override: Option<u64>,
    /// Element budget of a single sparse projection pass before it is chunked.
    pub max_projection_elements: usize,
    pub check_numerics: bool,
}

impl Default for ColumnParams {
    fn default() -> Self {
        Self {
            dt: 1.0,
            surrogate: SurrogateParams::default(),
            precision: Precision::Float32,
            recurrent_dampening_factor: 0.5,
            input_weight_scale: 1.0,
            recurrent_weight_scale: 1.0,
            lr_scale: 1.0,
            max_delay: 5,
            hard_reset: true,
            train_recurrent: true,
            train_input: false,
            train_asc_rates: false,
            background_firing_rate: 250.0,
            add_background_noise: true,
            use_state_input: false,
            readout: ReadoutParams::default(),
        }
    }
}

impl Default for SurrogateParams {
    fn default() -> Self {
        SurrogateParams::Triangular {
            dampening_factor: 0.5,
        }
    }
}

impl Default for ReadoutParams {
    fn default() -> Self {
        Self {
            n_output: 2,
            cue_duration: 40,
            mode: ReadoutMode::default(),
        }
    }
}

impl Default for ReadoutMode {
    fn default() -> Self {
        ReadoutMode::Dense
    }
}

impl Default for RegularizationParams {
    fn default() -> Self {
        Self {
            rate_cost: 10.0,
            voltage_cost: 1e-5,
            recurrent_weight_regularization: 0.0,
            classification_cost: 0.0,
        }
    }
}

impl Default for OptimizerParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-11,
        }
    }
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            stateful: true,
            gradient_reduction: GradientReduction::Sum,
            max_time: None,
        }
    }
}

impl Default for TechnicalParams {
    fn default() -> Self {
        Self {
            num_threads: Some(1),
            pin_threads: false,
            seed_override: None,
            max_projection_elements: 1 << 31,
            check_numerics: false,
        }
    }
}

pub fn validate_instance_params(instance_params: &InstanceParams) -> Result<(), SimpleError> {
    validate_column_params(&instance_params.column)?;
    validate_regularization_params(&instance_params.regularization)?;
    validate_optimizer_params(&instance_params.optimizer)?;
    validate_training_params(&instance_params.training)?;
    validate_technical_params(&instance_params.technical_params)?;
    Ok(())
}

pub fn validate_column_params(column_params: &ColumnParams) -> Result<(), SimpleError> {
    if column_params.dt <= 0.0 {
        return Err(SimpleError::new("dt must be strictly positive"));
    }

    validate_surrogate_params(&column_params.surrogate)?;

    if column_params.recurrent_dampening_factor < 0.0
        || column_params.recurrent_dampening_factor > 1.0
    {
        return Err(SimpleError::new(
            "recurrent_dampening_factor must be in [0, 1]",
        ));
    }

    if column_params.lr_scale <= 0.0 {
        return Err(SimpleError::new("lr_scale must be strictly positive"));
    }

    if !column_params.input_weight_scale.is_finite()
        || !column_params.recurrent_weight_scale.is_finite()
    {
        return Err(SimpleError::new("weight scales must be finite"));
    }

    if column_params.max_delay == 0 {
        return Err(SimpleError::new("max_delay must be strictly positive"));
    }

    if column_params.background_firing_rate < 0.0 {
        return Err(SimpleError::new(
            "background_firing_rate must not be negative",
        ));
    }

    if column_params.background_firing_rate * column_params.dt > 1000.0 {
        return Err(SimpleError::new(
            "background_firing_rate is too high for one spike per step",
        ));
    }

    if column_params.readout.n_output == 0 {
        return Err(SimpleError::new("n_output must be strictly positive"));
    }

    if column_params.readout.cue_duration == 0 {
        return Err(SimpleError::new("cue_duration must be strictly positive"));
    }

    if let ReadoutMode::NeuronOutput { dampening_factor } = column_params.readout.mode {
        if column_params.readout.n_output != 2 {
            return Err(SimpleError::new(
                "neuron output read-out requires n_output = 2",
            ));
        }

        if dampening_factor <= 0.0 {
            return Err(SimpleError::new(
                "read-out dampening_factor must be strictly positive",
            ));
        }
    }

    Ok(())
}

fn validate_surrogate_params(surrogate_params: &SurrogateParams) -> Result<(), SimpleError> {
    match *surrogate_params {
        SurrogateParams::Triangular { dampening_factor } => {
            if dampening_factor <= 0.0 {
                return Err(SimpleError::new(
                    "dampening_factor must be strictly positive",
                ));
            }
        }
        SurrogateParams::Gauss { sigma, amplitude } => {
            if sigma <= 0.0 {
                return Err(SimpleError::new("sigma must be strictly positive"));
            }

            if amplitude <= 0.0 {
                return Err(SimpleError::new("amplitude must be strictly positive"));
            }
        }
    }

    Ok(())
}

fn validate_regularization_params(
    regularization_params: &RegularizationParams,
) -> Result<(), SimpleError> {
    if regularization_params.rate_cost < 0.0 {
        return Err(SimpleError::new("rate_cost must not be negative"));
    }

    if regularization_params.voltage_cost < 0.0 {
        return Err(SimpleError::new("voltage_cost must not be negative"));
    }

    if regularization_params.recurrent_weight_regularization < 0.0 {
        return Err(SimpleError::new(
            "recurrent_weight_regularization must not be negative",
        ));
    }

    if regularization_params.classification_cost < 0.0 {
        return Err(SimpleError::new("classification_cost must not be negative"));
    }

    Ok(())
}

fn validate_optimizer_params(optimizer_params: &OptimizerParams) -> Result<(), SimpleError> {
    if optimizer_params.learning_rate <= 0.0 {
        return Err(SimpleError::new("learning_rate must be strictly positive"));
    }

    if !(0.0..1.0).contains(&optimizer_params.beta_1) {
        return Err(SimpleError::new("beta_1 must be in [0, 1)"));
    }

    if !(0.0..1.0).contains(&optimizer_params.beta_2) {
        return Err(SimpleError::new("beta_2 must be in [0, 1)"));
    }

    if optimizer_params.epsilon <= 0.0 {
        return Err(SimpleError::new("epsilon must be strictly positive"));
    }

    Ok(())
}

fn validate_training_params(training_params: &TrainingParams) -> Result<(), SimpleError> {
    if let Some(max_time) = training_params.max_time {
        if max_time <= 0.0 {
            return Err(SimpleError::new("max_time must be strictly positive"));
        }
    }

    Ok(())
}

fn validate_technical_params(technical_params: &TechnicalParams) -> Result<(), SimpleError> {
    if let Some(num_threads) = technical_params.num_threads {
        if num_threads == 0 {
            return Err(SimpleError::new("num_threads must be strictly positive"));
        }

        if num_cpus::get() < num_threads {
            return Err(SimpleError::new(
                "num_threads must not be greater than number of available CPUs",
            ));
        }
    }

    if technical_params.max_projection_elements == 0 {
        return Err(SimpleError::new(
            "max_projection_elements must be strictly positive",
        ));
    }

    Ok(())
}
