//! Configuration for the decision model.
//!
//! The configuration fixes everything that is decided at construction time:
//! - Which modality streams are active and in what per-step order
//! - Whether each modality is discrete (class ids) or continuous (vectors)
//! - Backbone hyperparameters (layers, heads, feed-forward width, rotary range)
//! - Loss-weighting schedule parameters
//! - Which modules are frozen for fine-tuning
//!
//! Configs serialize with serde and round-trip through TOML files.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DecisionError, Result};

/// One of the four trajectory data streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    /// Task conditioning signal, present only in prompt-bearing patterns.
    Prompt,
    /// Environment observation, always present.
    State,
    /// Action taken by the behavior policy, always present.
    Action,
    /// Scalar feedback, present only in reward-bearing patterns.
    Reward,
}

impl Modality {
    /// Lowercase name used in error messages and logging.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prompt => "prompt",
            Self::State => "state",
            Self::Action => "action",
            Self::Reward => "reward",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed ordering/subset of modalities composing one trajectory step.
///
/// The pattern determines the per-step slot count (`occupancy`), which
/// encoders and decoders exist, and where the policy and world-model heads
/// read the backbone output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OccupancyPattern {
    /// state, action
    Sa,
    /// state, action, reward
    Sar,
    /// prompt, state, action
    Psa,
    /// prompt, state, action, reward
    Psar,
}

impl OccupancyPattern {
    /// Slot order for this pattern.
    #[must_use]
    pub fn slots(&self) -> &'static [Modality] {
        use Modality::{Action, Prompt, Reward, State};
        match self {
            Self::Sa => &[State, Action],
            Self::Sar => &[State, Action, Reward],
            Self::Psa => &[Prompt, State, Action],
            Self::Psar => &[Prompt, State, Action, Reward],
        }
    }

    /// Number of slots per trajectory step (2–4).
    #[must_use]
    pub fn occupancy(&self) -> usize {
        self.slots().len()
    }

    /// Slot index of a modality, if active in this pattern.
    #[must_use]
    pub fn slot_of(&self, modality: Modality) -> Option<usize> {
        self.slots().iter().position(|m| *m == modality)
    }

    /// Slot whose backbone output feeds the action decoder (the state slot).
    #[must_use]
    pub fn policy_slot(&self) -> usize {
        self.slot_of(Modality::State).unwrap_or_default()
    }

    /// Slot whose backbone output feeds the state/reward decoders (the
    /// action slot).
    #[must_use]
    pub fn world_slot(&self) -> usize {
        self.slot_of(Modality::Action).unwrap_or_default()
    }

    #[must_use]
    pub fn has_prompt(&self) -> bool {
        self.slot_of(Modality::Prompt).is_some()
    }

    #[must_use]
    pub fn has_reward(&self) -> bool {
        self.slot_of(Modality::Reward).is_some()
    }

    /// Lowercase name used in error messages and logging.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sa => "sa",
            Self::Sar => "sar",
            Self::Psa => "psa",
            Self::Psar => "psar",
        }
    }
}

impl fmt::Display for OccupancyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input/output type of one modality stream.
///
/// Dispatch on the tag happens once at construction time: discrete
/// modalities get embedding-table encoders and class-distribution decoders,
/// continuous ones get MLP encoders and regression decoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ModalityKind {
    /// Class-id valued stream with `num_classes` distinct values.
    Discrete {
        /// Size of the class vocabulary.
        num_classes: usize,
    },

    /// Vector valued stream of width `dim`.
    Continuous {
        /// Raw feature width.
        dim: usize,
    },
}

impl ModalityKind {
    #[must_use]
    pub fn is_discrete(&self) -> bool {
        matches!(self, Self::Discrete { .. })
    }

    /// Class count for discrete kinds.
    #[must_use]
    pub fn num_classes(&self) -> Option<usize> {
        match self {
            Self::Discrete { num_classes } => Some(*num_classes),
            Self::Continuous { .. } => None,
        }
    }

    /// Feature width for continuous kinds.
    #[must_use]
    pub fn dim(&self) -> Option<usize> {
        match self {
            Self::Discrete { .. } => None,
            Self::Continuous { dim } => Some(*dim),
        }
    }
}

/// Modules that can be excluded from the trainable variable set.
///
/// Each value maps to a fixed variable-name prefix, so freezing is a pure
/// function of the config: applying it twice yields the same set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrozenModule {
    Backbone,
    PromptEncoder,
    StateEncoder,
    ActionEncoder,
    RewardEncoder,
    StateDecoder,
    ActionDecoder,
    RewardDecoder,
}

impl FrozenModule {
    /// Variable-name prefix owned by this module.
    #[must_use]
    pub fn var_prefix(&self) -> &'static str {
        match self {
            Self::Backbone => "backbone",
            Self::PromptEncoder => "prompt_encoder",
            Self::StateEncoder => "state_encoder",
            Self::ActionEncoder => "action_encoder",
            Self::RewardEncoder => "reward_encoder",
            Self::StateDecoder => "state_decoder",
            Self::ActionDecoder => "action_decoder",
            Self::RewardDecoder => "reward_decoder",
        }
    }

    /// The modality this module serves, if it is modality-specific.
    fn modality(&self) -> Option<Modality> {
        match self {
            Self::Backbone => None,
            Self::PromptEncoder => Some(Modality::Prompt),
            Self::StateEncoder | Self::StateDecoder => Some(Modality::State),
            Self::ActionEncoder | Self::ActionDecoder => Some(Modality::Action),
            Self::RewardEncoder | Self::RewardDecoder => Some(Modality::Reward),
        }
    }
}

/// Causal backbone hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// Number of transformer layers.
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    /// Number of attention heads. Must divide the model hidden size.
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,

    /// Feed-forward inner width.
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,

    /// Rotary table length in backbone tokens; bounds memory + window.
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,

    /// RoPE base frequency.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,

    /// Layer norm epsilon.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_num_layers() -> usize {
    8
}
fn default_num_heads() -> usize {
    8
}
fn default_intermediate_size() -> usize {
    2048
}
fn default_max_positions() -> usize {
    12288
}
fn default_rope_theta() -> f32 {
    10000.0
}
fn default_layer_norm_eps() -> f64 {
    1e-5
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            num_layers: default_num_layers(),
            num_heads: default_num_heads(),
            intermediate_size: default_intermediate_size(),
            max_positions: default_max_positions(),
            rope_theta: default_rope_theta(),
            layer_norm_eps: default_layer_norm_eps(),
        }
    }
}

/// Full decision-model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionModelConfig {
    /// Active modality set and per-step slot order.
    pub pattern: OccupancyPattern,

    /// Shared embedding width of every slot and the backbone.
    pub hidden_size: usize,

    /// Prompt stream type; required iff the pattern has a prompt slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<ModalityKind>,

    /// State stream type.
    pub state: ModalityKind,

    /// Action stream type.
    pub action: ModalityKind,

    /// Reward stream type; required iff the pattern has a reward slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward: Option<ModalityKind>,

    /// Inner width of the residual decoder blocks.
    #[serde(default = "default_decoder_hidden_size")]
    pub decoder_hidden_size: usize,

    /// Backbone hyperparameters.
    #[serde(default)]
    pub backbone: BackboneConfig,

    /// Length of the linear loss-weight ramp, in trajectory steps.
    #[serde(default = "default_context_warmup")]
    pub context_warmup: usize,

    /// Total loss-weighting schedule length, in trajectory steps.
    #[serde(default = "default_max_position_loss_weighting")]
    pub max_position_loss_weighting: usize,

    /// Modules excluded from `trainable_vars()`.
    #[serde(default)]
    pub frozen_modules: Vec<FrozenModule>,
}

fn default_decoder_hidden_size() -> usize {
    512
}
fn default_context_warmup() -> usize {
    1000
}
fn default_max_position_loss_weighting() -> usize {
    4000
}

impl Default for DecisionModelConfig {
    fn default() -> Self {
        Self {
            pattern: OccupancyPattern::Sar,
            hidden_size: 512,
            prompt: None,
            state: ModalityKind::Discrete { num_classes: 128 },
            action: ModalityKind::Discrete { num_classes: 5 },
            reward: Some(ModalityKind::Continuous { dim: 1 }),
            decoder_hidden_size: default_decoder_hidden_size(),
            backbone: BackboneConfig::default(),
            context_warmup: default_context_warmup(),
            max_position_loss_weighting: default_max_position_loss_weighting(),
            frozen_modules: Vec::new(),
        }
    }
}

impl DecisionModelConfig {
    /// Small configuration for quick experiments.
    #[must_use]
    pub fn small() -> Self {
        Self {
            hidden_size: 256,
            state: ModalityKind::Discrete { num_classes: 64 },
            decoder_hidden_size: 256,
            backbone: BackboneConfig {
                num_layers: 4,
                num_heads: 4,
                intermediate_size: 1024,
                max_positions: 6144,
                ..BackboneConfig::default()
            },
            context_warmup: 256,
            max_position_loss_weighting: 2000,
            ..Self::default()
        }
    }

    /// Tiny configuration for unit tests.
    #[must_use]
    pub fn test() -> Self {
        Self {
            pattern: OccupancyPattern::Sar,
            hidden_size: 32,
            prompt: None,
            state: ModalityKind::Discrete { num_classes: 16 },
            action: ModalityKind::Discrete { num_classes: 5 },
            reward: Some(ModalityKind::Continuous { dim: 1 }),
            decoder_hidden_size: 32,
            backbone: BackboneConfig {
                num_layers: 2,
                num_heads: 2,
                intermediate_size: 64,
                max_positions: 192,
                ..BackboneConfig::default()
            },
            context_warmup: 8,
            max_position_loss_weighting: 64,
            frozen_modules: Vec::new(),
        }
    }

    /// Per-head width of the backbone.
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.backbone.num_heads
    }

    /// Slot count per trajectory step under the active pattern.
    #[must_use]
    pub fn occupancy(&self) -> usize {
        self.pattern.occupancy()
    }

    /// Kind of a modality, if active under the pattern.
    #[must_use]
    pub fn kind_of(&self, modality: Modality) -> Option<ModalityKind> {
        if self.pattern.slot_of(modality).is_none() {
            return None;
        }
        match modality {
            Modality::Prompt => self.prompt,
            Modality::State => Some(self.state),
            Modality::Action => Some(self.action),
            Modality::Reward => self.reward,
        }
    }

    /// Loads a configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| DecisionError::config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration to a TOML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| DecisionError::config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Validates dimension and pattern consistency.
    ///
    /// All checks here are fatal: a config that fails any of them would
    /// produce a model that cannot honor its own occupancy pattern.
    pub fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 {
            return Err(DecisionError::invalid_config("hidden_size must be > 0"));
        }
        if self.backbone.num_layers == 0 {
            return Err(DecisionError::invalid_config("num_layers must be > 0"));
        }
        if self.backbone.num_heads == 0 || self.hidden_size % self.backbone.num_heads != 0 {
            return Err(DecisionError::invalid_config(format!(
                "hidden_size {} must be divisible by num_heads {}",
                self.hidden_size, self.backbone.num_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(DecisionError::invalid_config(format!(
                "head_dim {} must be even for rotary embedding",
                self.head_dim()
            )));
        }
        if self.backbone.intermediate_size == 0 {
            return Err(DecisionError::invalid_config(
                "intermediate_size must be > 0",
            ));
        }
        if self.decoder_hidden_size == 0 {
            return Err(DecisionError::invalid_config(
                "decoder_hidden_size must be > 0",
            ));
        }
        if self.backbone.layer_norm_eps <= 0.0 {
            return Err(DecisionError::invalid_config("layer_norm_eps must be > 0"));
        }

        if self.pattern.has_prompt() != self.prompt.is_some() {
            return Err(DecisionError::invalid_config(format!(
                "pattern '{}' and prompt modality disagree: pattern {} a prompt slot",
                self.pattern,
                if self.pattern.has_prompt() {
                    "declares"
                } else {
                    "does not declare"
                }
            )));
        }
        if self.pattern.has_reward() != self.reward.is_some() {
            return Err(DecisionError::invalid_config(format!(
                "pattern '{}' and reward modality disagree: pattern {} a reward slot",
                self.pattern,
                if self.pattern.has_reward() {
                    "declares"
                } else {
                    "does not declare"
                }
            )));
        }

        for modality in self.pattern.slots() {
            let kind = self
                .kind_of(*modality)
                .ok_or_else(|| DecisionError::invalid_config(format!("{modality} kind missing")))?;
            let width = match kind {
                ModalityKind::Discrete { num_classes } => num_classes,
                ModalityKind::Continuous { dim } => dim,
            };
            if width == 0 {
                return Err(DecisionError::invalid_config(format!(
                    "{modality} modality has zero width"
                )));
            }
        }

        if self.max_position_loss_weighting == 0 {
            return Err(DecisionError::invalid_config(
                "max_position_loss_weighting must be > 0",
            ));
        }
        if self.context_warmup > self.max_position_loss_weighting {
            return Err(DecisionError::invalid_config(format!(
                "context_warmup {} exceeds max_position_loss_weighting {}",
                self.context_warmup, self.max_position_loss_weighting
            )));
        }
        let needed = self.max_position_loss_weighting * self.occupancy();
        if self.backbone.max_positions < needed {
            return Err(DecisionError::invalid_config(format!(
                "backbone.max_positions {} is shorter than the schedule requires ({needed} tokens)",
                self.backbone.max_positions
            )));
        }

        for frozen in &self.frozen_modules {
            if let Some(modality) = frozen.modality() {
                if self.pattern.slot_of(modality).is_none() {
                    return Err(DecisionError::invalid_config(format!(
                        "frozen module '{}' refers to a modality absent from pattern '{}'",
                        frozen.var_prefix(),
                        self.pattern
                    )));
                }
            }
        }

        Ok(())
    }
}
