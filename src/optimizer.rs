use crate::{params::OptimizerParams, util::relu};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamGroupId(usize);

#[derive(Debug, Clone)]
struct ParamGroup {
    name: String,
    m: Vec<f32>,
    v: Vec<f32>,
    positive: Option<Vec<bool>>,
}

/// One gradient application for a registered group.
pub struct ParamUpdate<'a> {
    pub group: ParamGroupId,
    pub weights: &'a mut [f32],
    pub grad: &'a [f32],
}

/// Adam with bias-corrected step size. Groups registered with a sign mask are
/// projected back onto their sign after every update.
#[derive(Debug, Clone)]
pub struct Adam {
    params: OptimizerParams,
    step: i32,
    groups: Vec<ParamGroup>,
}

impl Adam {
    pub fn new(params: &OptimizerParams) -> Self {
        Self {
            params: params.clone(),
            step: 0,
            groups: Vec::new(),
        }
    }

    pub fn add_group(&mut self, name: &str, len: usize, positive: Option<Vec<bool>>) -> ParamGroupId {
        if let Some(positive) = &positive {
            assert_eq!(positive.len(), len, "sign mask length mismatch");
        }

        self.groups.push(ParamGroup {
            name: name.to_string(),
            m: vec![0.0; len],
            v: vec![0.0; len],
            positive,
        });

        ParamGroupId(self.groups.len() - 1)
    }

    pub fn group_name(&self, group: ParamGroupId) -> &str {
        &self.groups[group.0].name
    }

    pub fn num_steps(&self) -> i32 {
        self.step
    }

    /// Applies one optimizer step to all given groups.
    pub fn apply(&mut self, updates: Vec<ParamUpdate>) {
        self.step += 1;

        let OptimizerParams {
            learning_rate,
            beta_1,
            beta_2,
            epsilon,
        } = self.params;

        let step_size =
            learning_rate * (1.0 - beta_2.powi(self.step)).sqrt() / (1.0 - beta_1.powi(self.step));

        for update in updates {
            let group = &mut self.groups[update.group.0];
            assert_eq!(
                update.weights.len(),
                group.m.len(),
                "{}: weight count mismatch",
                group.name
            );
            assert_eq!(
                update.grad.len(),
                group.m.len(),
                "{}: gradient count mismatch",
                group.name
            );

            for idx in 0..group.m.len() {
                let grad = update.grad[idx];
                group.m[idx] = beta_1 * group.m[idx] + (1.0 - beta_1) * grad;
                group.v[idx] = beta_2 * group.v[idx] + (1.0 - beta_2) * grad * grad;
                update.weights[idx] -= step_size * group.m[idx] / (group.v[idx].sqrt() + epsilon);
            }

            if let Some(positive) = &group.positive {
                apply_sign_constraint(update.weights, positive);
            }
        }
    }
}

pub fn apply_sign_constraint(weights: &mut [f32], positive: &[bool]) {
    for (weight, positive) in weights.iter_mut().zip(positive) {
        *weight = if *positive {
            relu(*weight)
        } else {
            -relu(-*weight)
        };
    }
}
