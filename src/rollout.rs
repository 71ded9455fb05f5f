//! Trajectory drivers: sequential training loss, step-by-step generation
//! and in-context learning.
//!
//! These wrap [`DecisionModel::forward`] with the tensor plumbing a
//! training or serving loop needs: position bookkeeping against the loss
//! schedule, two-pass action sampling, and memory commits.

use candle_core::{DType, Tensor, D};
use rand::Rng;
use tracing::debug;

use crate::backbone::BackboneMemory;
use crate::error::{DecisionError, Result};
use crate::loss::{
    parameter_regularization, valid_action_mask, weighted_cross_entropy, weighted_entropy,
    weighted_mse, LossReduction, LossReport,
};
use crate::model::{DecisionModel, ForwardOptions};

/// Options for [`DecisionModel::sequential_loss`].
#[derive(Debug, Clone)]
pub struct LossOptions {
    /// Fraction of state inputs corrupted during training.
    pub state_dropout: f64,
    /// Fraction of reward inputs corrupted during training.
    pub reward_dropout: f64,
    /// Commit this window into the memory handle.
    pub update_memory: bool,
    /// Apply the position-weighting schedule on top of the validity mask.
    pub use_loss_weight: bool,
    /// How per-element losses are reduced.
    pub reduction: LossReduction,
}

impl Default for LossOptions {
    fn default() -> Self {
        Self {
            state_dropout: 0.0,
            reward_dropout: 0.0,
            update_memory: true,
            use_loss_weight: true,
            reduction: LossReduction::PerBatch,
        }
    }
}

/// Options for [`DecisionModel::generate`].
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Sampling temperature for the action distribution.
    pub temperature: f64,
    /// Keep only action indices below this bound before sampling.
    pub action_clip: Option<usize>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            action_clip: None,
        }
    }
}

/// One sampled step from [`DecisionModel::generate`].
#[derive(Debug, Clone)]
pub struct GenerationStep {
    /// Predicted distribution over next states, conditioned on the
    /// sampled action.
    pub state_probs: Vec<f32>,
    /// Sampled action id.
    pub action: u32,
    /// Predicted reward for the sampled action, when rewards are active.
    pub reward: Option<f32>,
}

impl DecisionModel {
    /// Compute the multi-task training loss over one window of steps.
    ///
    /// `observations` spans `steps + 1` entries: the first `steps` are
    /// model inputs and the last `steps` are next-state targets.
    /// `behavior_actions` are the actions actually taken (model inputs),
    /// `label_actions` the supervision targets; entries outside
    /// `[0, num_actions)` are padding and are masked out. `rewards` is
    /// `(batch, steps)` when the pattern carries rewards.
    ///
    /// The window's schedule position is taken from `memory` before the
    /// forward pass; with `update_memory` set the window is committed so
    /// the next call continues where this one ended.
    pub fn sequential_loss(
        &self,
        memory: &mut BackboneMemory,
        prompts: Option<&Tensor>,
        observations: &Tensor,
        rewards: Option<&Tensor>,
        behavior_actions: &Tensor,
        label_actions: &Tensor,
        options: &LossOptions,
    ) -> Result<LossReport> {
        if !self.config().state.is_discrete() {
            return Err(DecisionError::UnsupportedModality {
                modality: "state",
                operation: "sequential_loss",
                detail: "cross-entropy training requires discrete states".to_string(),
            });
        }
        let num_actions = self.config().action.num_classes().ok_or_else(|| {
            DecisionError::UnsupportedModality {
                modality: "action",
                operation: "sequential_loss",
                detail: "policy loss requires a discrete action space".to_string(),
            }
        })?;

        let (batch, obs_steps) = match observations.dims() {
            [b, s] => (*b, *s),
            dims => {
                return Err(DecisionError::shape_mismatch(
                    "observations",
                    "(batch, steps + 1)",
                    format!("{dims:?}"),
                ))
            }
        };
        if obs_steps < 2 {
            return Err(DecisionError::shape_mismatch(
                "observations",
                "(batch, steps + 1) with steps >= 1",
                format!("({batch}, {obs_steps})"),
            ));
        }
        let steps = obs_steps - 1;

        let reward_in = match (self.config().pattern.has_reward(), rewards) {
            (true, Some(r)) => {
                let kind = self.config().reward;
                if kind.and_then(|k| k.dim()) != Some(1) {
                    return Err(DecisionError::UnsupportedModality {
                        modality: "reward",
                        operation: "sequential_loss",
                        detail: "mean-squared-error training requires a scalar continuous reward"
                            .to_string(),
                    });
                }
                if r.dims().len() != 2 {
                    return Err(DecisionError::shape_mismatch(
                        "rewards",
                        "(batch, steps)",
                        format!("{:?}", r.dims()),
                    ));
                }
                Some(r.unsqueeze(D::Minus1)?)
            }
            (true, None) => {
                return Err(DecisionError::MissingModality {
                    modality: "reward",
                    pattern: self.config().pattern.as_str(),
                })
            }
            (false, _) => None,
        };

        // Schedule position, in steps, before any state changes.
        let occ = self.config().occupancy();
        let position = memory.len() / occ;
        debug!(position, steps, batch, "sequential loss window");

        let mask = valid_action_mask(label_actions, num_actions)?;
        let weight = if options.use_loss_weight {
            let schedule = self.schedule().slice(position, steps, self.device())?;
            mask.broadcast_mul(&schedule)?
        } else {
            mask
        };

        let forward_options = ForwardOptions {
            state_dropout: options.state_dropout,
            reward_dropout: options.reward_dropout,
            temperature: 1.0,
            need_cache: options.update_memory,
        };
        let (out, new_memory) = self.forward(
            prompts,
            &observations.narrow(1, 0, steps)?,
            behavior_actions,
            reward_in.as_ref(),
            Some(&*memory),
            &forward_options,
        )?;

        let next_states = observations.narrow(1, 1, steps)?;
        let (world_state, count) =
            weighted_cross_entropy(&out.state, &next_states, &weight, options.reduction)?;

        let world_reward = match (&out.reward, &reward_in) {
            (Some(pred), Some(target)) => {
                Some(weighted_mse(pred, target, &weight, options.reduction)?)
            }
            _ => None,
        };

        let (policy, _) =
            weighted_cross_entropy(&out.action, label_actions, &weight, options.reduction)?;
        let entropy = weighted_entropy(&out.action, &weight, options.reduction)?;
        let regularization = parameter_regularization(&self.trainable_vars(), self.device())?;

        if options.update_memory {
            if let Some(m) = new_memory {
                *memory = m;
            }
        }

        Ok(LossReport {
            world_state,
            world_reward,
            policy,
            entropy,
            regularization,
            count,
        })
    }

    /// Sample one action for the current observation and predict its
    /// consequences.
    ///
    /// Two forward passes: the first, with the reserved placeholder action,
    /// yields the action distribution (temperature-scaled, optionally
    /// truncated to `action_clip` indices and renormalized) from which one
    /// action is drawn with `rng`; the second conditions on the realized
    /// action so the returned state distribution and reward agree with it.
    /// Neither pass commits to `memory`. If truncation leaves zero mass the
    /// draw falls back to the argmax of the untruncated distribution.
    pub fn generate<R: Rng>(
        &self,
        memory: &BackboneMemory,
        prompt: Option<u32>,
        observation: u32,
        options: &GenerateOptions,
        rng: &mut R,
    ) -> Result<GenerationStep> {
        if !self.config().state.is_discrete() {
            return Err(DecisionError::UnsupportedModality {
                modality: "state",
                operation: "generate",
                detail: "step sampling requires discrete states".to_string(),
            });
        }
        let num_actions = self.config().action.num_classes().ok_or_else(|| {
            DecisionError::UnsupportedModality {
                modality: "action",
                operation: "generate",
                detail: "categorical sampling requires a discrete action space".to_string(),
            }
        })?;
        if self.config().pattern.has_prompt() && !prompt_kind_is_discrete(self) {
            return Err(DecisionError::UnsupportedModality {
                modality: "prompt",
                operation: "generate",
                detail: "scalar prompts require a discrete prompt space".to_string(),
            });
        }

        let device = self.device();
        let obs_in = Tensor::full(observation, (1, 1), device)?;
        let prompt_in = match (self.config().pattern.has_prompt(), prompt) {
            (true, Some(p)) => Some(Tensor::full(p, (1, 1), device)?),
            (true, None) => {
                return Err(DecisionError::MissingModality {
                    modality: "prompt",
                    pattern: self.config().pattern.as_str(),
                })
            }
            (false, _) => None,
        };
        // Reward is unknown at decision time; feed the neutral default.
        let reward_in = if self.config().pattern.has_reward() {
            Some(Tensor::zeros((1, 1, 1), DType::F32, device)?)
        } else {
            None
        };
        let placeholder = Tensor::full(num_actions as u32, (1, 1), device)?;

        let first_pass = ForwardOptions {
            temperature: options.temperature,
            need_cache: false,
            ..ForwardOptions::default()
        };
        let (out, _) = self.forward(
            prompt_in.as_ref(),
            &obs_in,
            &placeholder,
            reward_in.as_ref(),
            Some(memory),
            &first_pass,
        )?;

        let raw = out.action.flatten_all()?.to_vec1::<f32>()?;
        let mut probs = raw.clone();
        if let Some(clip) = options.action_clip {
            for p in probs.iter_mut().skip(clip.min(num_actions)) {
                *p = 0.0;
            }
        }
        let total: f32 = probs.iter().sum();
        let action = if total > 0.0 {
            sample_categorical(&probs, total, rng.gen())
        } else {
            argmax(&raw)
        };

        let realized = Tensor::full(action as u32, (1, 1), device)?;
        let second_pass = ForwardOptions {
            need_cache: false,
            ..ForwardOptions::default()
        };
        let (out, _) = self.forward(
            prompt_in.as_ref(),
            &obs_in,
            &realized,
            reward_in.as_ref(),
            Some(memory),
            &second_pass,
        )?;

        let state_probs = out.state.flatten_all()?.to_vec1::<f32>()?;
        let reward = match out.reward {
            Some(r) => r.flatten_all()?.to_vec1::<f32>()?.first().copied(),
            None => None,
        };
        debug!(observation, action, "sampled step");

        Ok(GenerationStep {
            state_probs,
            action: action as u32,
            reward,
        })
    }

    /// Fold one observed transition into backbone memory.
    ///
    /// All supplied values are real environment data; no gradient or
    /// prediction is produced. `single_batch` and `single_step` prepend the
    /// batch and time axes, so a scalar tuple can be fed directly. Rewards
    /// may be given per step as `(batch, steps)`; the feature axis is added
    /// here. The handle is advanced in place by one window.
    pub fn in_context_learn(
        &self,
        memory: &mut BackboneMemory,
        prompt: Option<&Tensor>,
        observation: &Tensor,
        action: &Tensor,
        reward: Option<&Tensor>,
        single_batch: bool,
        single_step: bool,
    ) -> Result<()> {
        let obs_in = self.lift(observation, single_batch, single_step)?;
        let act_in = self.lift(action, single_batch, single_step)?;
        let prompt_in = match prompt {
            Some(p) => Some(self.lift(p, single_batch, single_step)?),
            None => None,
        };
        let reward_in = match reward {
            Some(r) => {
                let r = self.lift(r, single_batch, single_step)?;
                let r = if r.dims().len() == 2 {
                    r.unsqueeze(D::Minus1)?
                } else {
                    r
                };
                Some(r)
            }
            None => None,
        };

        let (_, new_memory) = self.forward(
            prompt_in.as_ref(),
            &obs_in,
            &act_in,
            reward_in.as_ref(),
            Some(&*memory),
            &ForwardOptions::default(),
        )?;
        if let Some(m) = new_memory {
            *memory = m;
        }
        debug!(positions = memory.len(), "context window committed");
        Ok(())
    }

    /// Normalize a tensor's leading axes and device.
    fn lift(&self, t: &Tensor, single_batch: bool, single_step: bool) -> Result<Tensor> {
        let mut t = t.to_device(self.device())?;
        if single_batch {
            t = t.unsqueeze(0)?;
        }
        if single_step {
            t = t.unsqueeze(1)?;
        }
        Ok(t)
    }
}

fn prompt_kind_is_discrete(model: &DecisionModel) -> bool {
    model
        .config()
        .prompt
        .map(|k| k.is_discrete())
        .unwrap_or(false)
}

/// Walk the cumulative distribution; zero-probability entries are skipped
/// so a clipped index can never be drawn.
fn sample_categorical(probs: &[f32], total: f32, u: f32) -> usize {
    let mut acc = 0.0f32;
    let mut last = 0usize;
    for (i, p) in probs.iter().enumerate() {
        if *p <= 0.0 {
            continue;
        }
        last = i;
        acc += p / total;
        if u < acc {
            return i;
        }
    }
    last
}

fn argmax(values: &[f32]) -> usize {
    let mut best = 0usize;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}
