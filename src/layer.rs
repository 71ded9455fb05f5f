//! Backbone layer combining attention and feed-forward.
//!
//! Each layer runs pre-norm attention and a normed feed-forward block
//! with residual connections around both. The layer's key/value cache
//! is threaded through for incremental decode.

use candle_core::{Device, Result, Tensor};
use candle_nn::{layer_norm, LayerNorm, Module, VarBuilder};

use crate::attention::{CausalSelfAttention, KvCache};
use crate::config::DecisionModelConfig;
use crate::mlp::FeedForward;

/// Single backbone layer
pub struct BackboneLayer {
    attention: CausalSelfAttention,
    ffn: FeedForward,
    input_norm: LayerNorm,
    post_attention_norm: LayerNorm,
}

impl BackboneLayer {
    /// Create one layer
    pub fn new(config: &DecisionModelConfig, vb: VarBuilder, device: &Device) -> Result<Self> {
        let hidden = config.hidden_size;
        let eps = config.backbone.layer_norm_eps;

        let attention = CausalSelfAttention::new(config, vb.pp("attention"), device)?;
        let ffn = FeedForward::new(config, vb.pp("ffn"))?;

        let input_norm = layer_norm(hidden, eps, vb.pp("input_norm"))?;
        let post_attention_norm = layer_norm(hidden, eps, vb.pp("post_attention_norm"))?;

        Ok(Self {
            attention,
            ffn,
            input_norm,
            post_attention_norm,
        })
    }

    /// Apply the layer to (batch, seq_len, hidden_size) activations.
    /// Returns output of the same shape plus this layer's extended cache.
    pub fn forward(
        &self,
        x: &Tensor,
        cache: Option<&KvCache>,
        mask: Option<&Tensor>,
        need_cache: bool,
    ) -> Result<(Tensor, Option<KvCache>)> {
        // Pre-norm attention with a residual connection
        let attn_in = self.input_norm.forward(x)?;
        let (attn_out, new_cache) = self.attention.forward(&attn_in, cache, mask, need_cache)?;
        let x = x.add(&attn_out)?;

        // Normed feed-forward with a second residual
        let ffn_in = self.post_attention_norm.forward(&x)?;
        let x = x.add(&self.ffn.forward(&ffn_in)?)?;

        Ok((x, new_cache))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_layer_shape() {
        let config = DecisionModelConfig::test();
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let layer = BackboneLayer::new(&config, vb, &device).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (2, 5, config.hidden_size), &device).unwrap();
        let mask = crate::attention::causal_mask(5, 0, &device).unwrap();
        let (out, cache) = layer.forward(&x, None, Some(&mask), true).unwrap();

        assert_eq!(out.dims(), &[2, 5, config.hidden_size]);
        assert_eq!(cache.unwrap().0.dim(2).unwrap(), 5);
    }
}
