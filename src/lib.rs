//! Sequence decision model over reinforcement-learning trajectories.
//!
//! This crate implements a causal transformer over interleaved modality
//! slots, providing:
//! - Up to four per-step streams (prompt, state, action, reward) in a
//!   configurable occupancy pattern
//! - A shared causal backbone with rotary attention and caller-owned
//!   key/value memory handles
//! - A policy head (action prediction) and world-model heads (next state
//!   and reward) decoded from different slot outputs
//! - Position-weighted, masked multi-task losses for trajectory training
//! - Step-by-step generation and in-context learning drivers
//!
//! # Example
//!
//! ```no_run
//! use candle_core::{Device, Tensor};
//! use decision_model_rs::{DecisionModel, DecisionModelConfig, GenerateOptions};
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//!
//! let config = DecisionModelConfig::small();
//! let device = Device::Cpu;
//! let model = DecisionModel::new(&config, &device).unwrap();
//!
//! // Sample an action for the current observation...
//! let mut memory = model.new_memory();
//! let mut rng = StdRng::seed_from_u64(0);
//! let step = model
//!     .generate(&memory, None, 3, &GenerateOptions::default(), &mut rng)
//!     .unwrap();
//!
//! // ...act in the environment, then commit the real transition.
//! let obs = Tensor::new(3u32, &device).unwrap();
//! let act = Tensor::new(step.action, &device).unwrap();
//! let rew = Tensor::new(0.0f32, &device).unwrap();
//! model
//!     .in_context_learn(&mut memory, None, &obs, &act, Some(&rew), true, true)
//!     .unwrap();
//! ```

pub mod attention;
pub mod backbone;
pub mod config;
pub mod error;
pub mod layer;
pub mod loss;
pub mod mlp;
pub mod modality;
pub mod model;
pub mod rollout;

pub use backbone::{BackboneMemory, CausalBackbone};
pub use config::{
    BackboneConfig, DecisionModelConfig, FrozenModule, Modality, ModalityKind, OccupancyPattern,
};
pub use error::{DecisionError, Result};
pub use loss::{LossReduction, LossReport, LossSchedule};
pub use model::{DecisionModel, ForwardOptions, ForwardOutput};
pub use rollout::{GenerateOptions, GenerationStep, LossOptions};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::backbone::BackboneMemory;
    pub use crate::config::{DecisionModelConfig, ModalityKind, OccupancyPattern};
    pub use crate::error::{DecisionError, Result};
    pub use crate::model::{DecisionModel, ForwardOptions, ForwardOutput};
    pub use crate::rollout::{GenerateOptions, GenerationStep, LossOptions};
}
