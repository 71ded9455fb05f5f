//! Gated feed-forward block for the causal backbone.
//!
//! FFN(x) = down(squared_relu(gate(x)) * up(x))

use candle_core::{Result, Tensor};
use candle_nn::{linear_no_bias, Linear, Module, VarBuilder};

use crate::config::DecisionModelConfig;

/// Squared ReLU: x * max(x, 0)
pub fn squared_relu(x: &Tensor) -> Result<Tensor> {
    x.mul(&x.relu()?)
}

/// Gate/up/down feed-forward block with squared-ReLU gating
pub struct FeedForward {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl FeedForward {
    /// Create the feed-forward block
    pub fn new(config: &DecisionModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let intermediate = config.backbone.intermediate_size;

        let gate_proj = linear_no_bias(hidden, intermediate, vb.pp("gate_proj"))?;
        let up_proj = linear_no_bias(hidden, intermediate, vb.pp("up_proj"))?;
        let down_proj = linear_no_bias(intermediate, hidden, vb.pp("down_proj"))?;

        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    /// Forward pass over (batch, seq_len, hidden_size) activations
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gated = squared_relu(&self.gate_proj.forward(x)?)?;
        let hidden = gated.mul(&self.up_proj.forward(x)?)?;
        self.down_proj.forward(&hidden)
    }
}
