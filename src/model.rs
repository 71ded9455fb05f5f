//! The decision model.
//!
//! Assembles per-step tokens from up to four modality streams (prompt,
//! state, action, reward), runs them through the causal backbone as one
//! interleaved sequence, and decodes policy and world-model predictions
//! from the slot outputs:
//! - The action decoder reads the state slot's output (policy head)
//! - The state and reward decoders read the action slot's output
//!   (world-model heads, predicting the next state and the current reward)

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, VarBuilder, VarMap};
use tracing::debug;

use crate::backbone::{BackboneMemory, CausalBackbone};
use crate::config::{DecisionModelConfig, FrozenModule, ModalityKind};
use crate::error::{DecisionError, Result};
use crate::loss::LossSchedule;
use crate::modality::{ModalityDecoder, ModalityEncoder};

/// Options controlling one forward pass.
#[derive(Debug, Clone)]
pub struct ForwardOptions {
    /// Fraction of state inputs corrupted during training (noise + mask).
    pub state_dropout: f64,
    /// Fraction of reward inputs corrupted during training.
    pub reward_dropout: f64,
    /// Temperature applied to the action decoder.
    pub temperature: f64,
    /// Whether to return an extended memory handle.
    pub need_cache: bool,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            state_dropout: 0.0,
            reward_dropout: 0.0,
            temperature: 1.0,
            need_cache: true,
        }
    }
}

/// Per-modality predictions from one forward pass.
#[derive(Debug)]
pub struct ForwardOutput {
    /// Distribution over next states, `(batch, steps, num_states)`.
    pub state: Tensor,
    /// Distribution over actions, `(batch, steps, num_actions)`.
    pub action: Tensor,
    /// Predicted rewards `(batch, steps, dim)`, when rewards are active.
    pub reward: Option<Tensor>,
}

/// Everything the model holds for an active reward stream.
struct RewardStream {
    kind: ModalityKind,
    encoder: ModalityEncoder,
    decoder: ModalityDecoder,
    mask_query: Tensor,
}

/// Decision model over interleaved modality slots.
pub struct DecisionModel {
    backbone: CausalBackbone,
    prompt_encoder: Option<ModalityEncoder>,
    state_encoder: ModalityEncoder,
    action_encoder: ModalityEncoder,
    reward: Option<RewardStream>,
    state_decoder: ModalityDecoder,
    action_decoder: ModalityDecoder,
    slot_embed: Tensor,
    state_mask: Tensor,
    schedule: LossSchedule,
    var_map: VarMap,
    config: DecisionModelConfig,
    device: Device,
}

impl DecisionModel {
    /// Create a model with freshly initialized parameters.
    ///
    /// # Example
    /// ```no_run
    /// use candle_core::Device;
    /// use decision_model_rs::{DecisionModel, DecisionModelConfig};
    ///
    /// let config = DecisionModelConfig::test();
    /// let model = DecisionModel::new(&config, &Device::Cpu).unwrap();
    /// ```
    pub fn new(config: &DecisionModelConfig, device: &Device) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        Self::from_varbuilder(config, vb, device, var_map)
    }

    /// Build the model over a caller-shared variable map.
    pub fn with_varmap(
        config: &DecisionModelConfig,
        var_map: VarMap,
        device: &Device,
    ) -> Result<Self> {
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        Self::from_varbuilder(config, vb, device, var_map)
    }

    fn from_varbuilder(
        config: &DecisionModelConfig,
        vb: VarBuilder,
        device: &Device,
        var_map: VarMap,
    ) -> Result<Self> {
        config.validate()?;

        let hidden = config.hidden_size;
        let eps = config.backbone.layer_norm_eps;
        let randn = Init::Randn {
            mean: 0.0,
            stdev: 1.0,
        };

        let backbone = CausalBackbone::new(config, vb.pp("backbone"), device)?;

        let prompt_encoder = match (config.pattern.has_prompt(), config.prompt) {
            (true, Some(kind)) => Some(ModalityEncoder::new(
                &kind,
                hidden,
                false,
                vb.pp("prompt_encoder"),
            )?),
            _ => None,
        };

        let state_encoder =
            ModalityEncoder::new(&config.state, hidden, false, vb.pp("state_encoder"))?;
        // The action table reserves one extra row used as the "not yet
        // chosen" placeholder during generation.
        let action_encoder =
            ModalityEncoder::new(&config.action, hidden, true, vb.pp("action_encoder"))?;

        let state_decoder = ModalityDecoder::new(
            &config.state,
            hidden,
            config.decoder_hidden_size,
            eps,
            vb.pp("state_decoder"),
        )?;
        let action_decoder = ModalityDecoder::new(
            &config.action,
            hidden,
            config.decoder_hidden_size,
            eps,
            vb.pp("action_decoder"),
        )?;

        let reward = match (config.pattern.has_reward(), config.reward) {
            (true, Some(kind)) => Some(RewardStream {
                kind,
                encoder: ModalityEncoder::new(&kind, hidden, false, vb.pp("reward_encoder"))?,
                decoder: ModalityDecoder::new(
                    &kind,
                    hidden,
                    config.decoder_hidden_size,
                    eps,
                    vb.pp("reward_decoder"),
                )?,
                mask_query: vb.get_with_hints((1, 1, hidden), "reward_mask", randn)?,
            }),
            _ => None,
        };

        let occ = config.occupancy();
        let slot_embed = vb.get_with_hints((1, 1, occ, hidden), "slot_embed", randn)?;
        let state_mask = vb.get_with_hints((1, 1, hidden), "state_mask", randn)?;

        let schedule =
            LossSchedule::new(config.context_warmup, config.max_position_loss_weighting)?;

        debug!(
            pattern = config.pattern.as_str(),
            occupancy = occ,
            layers = config.backbone.num_layers,
            hidden_size = hidden,
            "decision model constructed"
        );

        Ok(Self {
            backbone,
            prompt_encoder,
            state_encoder,
            action_encoder,
            reward,
            state_decoder,
            action_decoder,
            slot_embed,
            state_mask,
            schedule,
            var_map,
            config: config.clone(),
            device: device.clone(),
        })
    }

    /// Encode one maskable stream with training-time corruption.
    ///
    /// Two dropout decisions are drawn once per batch element and held
    /// across the whole time window: one adds Gaussian noise (before
    /// encoding for continuous streams, on the embedding for discrete
    /// ones), the other replaces the encoded vector with the learned mask
    /// query. At rate zero the path is skipped without consuming RNG.
    fn encode_corrupted(
        raw: &Tensor,
        kind: ModalityKind,
        encoder: &ModalityEncoder,
        mask_query: &Tensor,
        rate: f64,
    ) -> Result<Tensor> {
        if rate <= 0.0 {
            return encoder.forward(raw);
        }
        let device = raw.device();
        let batch = raw.dim(0)?;
        let half = (rate * 0.5).min(1.0) as f32;

        let noise_flag = Tensor::rand(0f32, 1f32, (batch, 1, 1), device)?
            .lt(half)?
            .to_dtype(DType::F32)?;
        let mask_flag = Tensor::rand(0f32, 1f32, (batch, 1, 1), device)?
            .lt(half)?
            .to_dtype(DType::F32)?;

        let encoded = if kind.is_discrete() {
            let encoded = encoder.forward(raw)?;
            let eps = encoded.randn_like(0.0, 1.0)?;
            encoded.broadcast_add(&eps.broadcast_mul(&noise_flag)?)?
        } else {
            let eps = raw.randn_like(0.0, 1.0)?;
            let noised = raw.broadcast_add(&eps.broadcast_mul(&noise_flag)?)?;
            encoder.forward(&noised)?
        };

        let keep = (1.0 - &mask_flag)?;
        Ok(encoded
            .broadcast_mul(&keep)?
            .broadcast_add(&mask_query.broadcast_mul(&mask_flag)?)?)
    }

    /// Assemble, run and decode one window of trajectory steps.
    ///
    /// Discrete streams are `(batch, steps)` ids, continuous streams
    /// `(batch, steps, dim)` values; `prompts` and `rewards` are required
    /// exactly when the pattern has those slots. All tensors must live on
    /// the model's device. `memory` is read but never modified; committing
    /// an extended handle is the caller's decision.
    pub fn forward(
        &self,
        prompts: Option<&Tensor>,
        observations: &Tensor,
        actions: &Tensor,
        rewards: Option<&Tensor>,
        memory: Option<&BackboneMemory>,
        options: &ForwardOptions,
    ) -> Result<(ForwardOutput, Option<BackboneMemory>)> {
        let pattern = self.config.pattern;
        let (batch, steps) = leading_dims("observations", observations)?;
        check_stream("actions", actions, batch, steps)?;

        let prompts = if pattern.has_prompt() {
            let p = prompts.ok_or(DecisionError::MissingModality {
                modality: "prompt",
                pattern: pattern.as_str(),
            })?;
            check_stream("prompts", p, batch, steps)?;
            Some(p)
        } else {
            None
        };
        let rewards = if pattern.has_reward() {
            let r = rewards.ok_or(DecisionError::MissingModality {
                modality: "reward",
                pattern: pattern.as_str(),
            })?;
            check_stream("rewards", r, batch, steps)?;
            Some(r)
        } else {
            None
        };

        // Encode each active stream to (batch, steps, hidden).
        let state_in = Self::encode_corrupted(
            observations,
            self.config.state,
            &self.state_encoder,
            &self.state_mask,
            options.state_dropout,
        )?;
        let action_in = self.action_encoder.forward(actions)?;
        let prompt_in = match (&self.prompt_encoder, prompts) {
            (Some(encoder), Some(p)) => Some(encoder.forward(p)?),
            _ => None,
        };
        let reward_in = match (&self.reward, rewards) {
            (Some(stream), Some(r)) => Some(Self::encode_corrupted(
                r,
                stream.kind,
                &stream.encoder,
                &stream.mask_query,
                options.reward_dropout,
            )?),
            _ => None,
        };

        // Slot assembly: prompt first, reward last in every pattern that
        // carries them.
        let occ = pattern.occupancy();
        let mut slots: Vec<Tensor> = Vec::with_capacity(occ);
        if let Some(p) = &prompt_in {
            slots.push(p.unsqueeze(2)?);
        }
        slots.push(state_in.unsqueeze(2)?);
        slots.push(action_in.unsqueeze(2)?);
        if let Some(r) = &reward_in {
            slots.push(r.unsqueeze(2)?);
        }

        let tokens = Tensor::cat(&slots, 2)?.broadcast_add(&self.slot_embed)?;
        let tokens = tokens.reshape((batch, steps * occ, self.config.hidden_size))?;

        let (hidden, new_memory) = self.backbone.forward(&tokens, memory, options.need_cache)?;
        let hidden = hidden.reshape((batch, steps, occ, self.config.hidden_size))?;

        let policy_h = hidden.narrow(2, pattern.policy_slot(), 1)?.squeeze(2)?;
        let world_h = hidden.narrow(2, pattern.world_slot(), 1)?.squeeze(2)?;

        let state = self.state_decoder.forward(&world_h, 1.0)?;
        let action = self.action_decoder.forward(&policy_h, options.temperature)?;
        let reward = match &self.reward {
            Some(stream) => Some(stream.decoder.forward(&world_h, 1.0)?),
            None => None,
        };

        Ok((
            ForwardOutput {
                state,
                action,
                reward,
            },
            new_memory,
        ))
    }

    /// Fresh, empty memory sized for this model's backbone.
    #[must_use]
    pub fn new_memory(&self) -> BackboneMemory {
        BackboneMemory::new(self.backbone.num_layers())
    }

    /// All variables not owned by a frozen module.
    ///
    /// Model-level parameters (slot embedding and mask queries) are always
    /// trainable. The filter is a pure function of the config, so applying
    /// it repeatedly yields the same set.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let frozen_prefixes: Vec<String> = self
            .config
            .frozen_modules
            .iter()
            .map(|m| format!("{}.", m.var_prefix()))
            .collect();

        let data = self.var_map.data().lock().unwrap();
        data.iter()
            .filter(|(name, _)| !frozen_prefixes.iter().any(|p| name.starts_with(p.as_str())))
            .map(|(_, var)| var.clone())
            .collect()
    }

    /// Whether a module is excluded from training.
    #[must_use]
    pub fn is_frozen(&self, module: FrozenModule) -> bool {
        self.config.frozen_modules.contains(&module)
    }

    /// Save weights in safetensors format.
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        self.var_map.save(path)?;
        Ok(())
    }

    /// Create a model and load weights from a safetensors file.
    ///
    /// The config must match the one the weights were saved with.
    pub fn load(
        config: &DecisionModelConfig,
        path: &std::path::Path,
        device: &Device,
    ) -> Result<Self> {
        let mut model = Self::new(config, device)?;
        model.var_map.load(path)?;
        Ok(model)
    }

    #[must_use]
    pub fn config(&self) -> &DecisionModelConfig {
        &self.config
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[must_use]
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    pub(crate) fn schedule(&self) -> &LossSchedule {
        &self.schedule
    }
}

fn leading_dims(name: &'static str, t: &Tensor) -> Result<(usize, usize)> {
    let dims = t.dims();
    if dims.len() < 2 {
        return Err(DecisionError::shape_mismatch(
            name,
            "(batch, steps, ...)",
            format!("{dims:?}"),
        ));
    }
    Ok((dims[0], dims[1]))
}

fn check_stream(name: &'static str, t: &Tensor, batch: usize, steps: usize) -> Result<()> {
    let (b, s) = leading_dims(name, t)?;
    if (b, s) != (batch, steps) {
        return Err(DecisionError::shape_mismatch(
            name,
            format!("({batch}, {steps}, ...)"),
            format!("({b}, {s}, ...)"),
        ));
    }
    Ok(())
}
