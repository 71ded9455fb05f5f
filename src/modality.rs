//! Per-modality encoders and decoders.
//!
//! A modality stream is either discrete (class ids) or continuous
//! (real-valued vectors); the variant is fixed by configuration and
//! dispatched once at construction time.

use candle_core::{DType, Tensor};
use candle_nn::ops::softmax_last_dim;
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, Module, VarBuilder};

use crate::config::ModalityKind;
use crate::error::Result;

enum EncoderInner {
    Discrete(Embedding),
    Continuous { in_proj: Linear, out_proj: Linear },
}

/// Maps a raw modality stream to `(batch, steps, hidden)` embeddings.
pub struct ModalityEncoder {
    inner: EncoderInner,
}

impl ModalityEncoder {
    /// Build an encoder for `kind`.
    ///
    /// `reserve_default` adds one extra embedding row past the class range,
    /// used as the placeholder id when the real value is not yet known.
    pub fn new(
        kind: &ModalityKind,
        hidden_size: usize,
        reserve_default: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let inner = match kind {
            ModalityKind::Discrete { num_classes } => {
                let rows = num_classes + usize::from(reserve_default);
                EncoderInner::Discrete(embedding(rows, hidden_size, vb.pp("embed"))?)
            }
            ModalityKind::Continuous { dim } => EncoderInner::Continuous {
                in_proj: linear(*dim, hidden_size, vb.pp("in_proj"))?,
                out_proj: linear(hidden_size, hidden_size, vb.pp("out_proj"))?,
            },
        };
        Ok(Self { inner })
    }

    /// Encode a stream. Discrete streams take `(batch, steps)` ids,
    /// continuous streams take `(batch, steps, dim)` values.
    pub fn forward(&self, raw: &Tensor) -> Result<Tensor> {
        match &self.inner {
            EncoderInner::Discrete(embed) => {
                let ids = raw.to_dtype(DType::U32)?;
                Ok(embed.forward(&ids)?)
            }
            EncoderInner::Continuous { in_proj, out_proj } => {
                let h = in_proj.forward(raw)?.gelu()?;
                Ok(out_proj.forward(&h)?)
            }
        }
    }
}

/// Maps backbone hidden vectors to per-modality predictions.
///
/// A residual MLP block refines the hidden state, then an output head
/// projects to the modality width. Discrete heads return a
/// temperature-scaled distribution; continuous heads return values.
pub struct ModalityDecoder {
    up_proj: Linear,
    down_proj: Linear,
    norm: LayerNorm,
    head: Linear,
    discrete: bool,
}

impl ModalityDecoder {
    pub fn new(
        kind: &ModalityKind,
        hidden_size: usize,
        decoder_hidden_size: usize,
        layer_norm_eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let out_size = match kind {
            ModalityKind::Discrete { num_classes } => *num_classes,
            ModalityKind::Continuous { dim } => *dim,
        };
        Ok(Self {
            up_proj: linear(hidden_size, decoder_hidden_size, vb.pp("up_proj"))?,
            down_proj: linear(decoder_hidden_size, hidden_size, vb.pp("down_proj"))?,
            norm: layer_norm(hidden_size, layer_norm_eps, vb.pp("norm"))?,
            head: linear(hidden_size, out_size, vb.pp("head"))?,
            discrete: kind.is_discrete(),
        })
    }

    /// Decode `(batch, steps, hidden)` vectors.
    ///
    /// `temperature` scales discrete logits before the softmax and is
    /// ignored for continuous outputs.
    pub fn forward(&self, xs: &Tensor, temperature: f64) -> Result<Tensor> {
        let h = self.down_proj.forward(&self.up_proj.forward(xs)?.gelu()?)?;
        let h = self.norm.forward(&(xs + h)?)?;
        let out = self.head.forward(&h)?;
        if self.discrete {
            let scaled = (out / temperature)?;
            Ok(softmax_last_dim(&scaled)?)
        } else {
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn test_vb(varmap: &VarMap) -> VarBuilder {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn test_discrete_encoder_shape() {
        let varmap = VarMap::new();
        let kind = ModalityKind::Discrete { num_classes: 16 };
        let encoder = ModalityEncoder::new(&kind, 32, false, test_vb(&varmap)).unwrap();

        let ids = Tensor::zeros((2, 4), DType::U32, &Device::Cpu).unwrap();
        let out = encoder.forward(&ids).unwrap();
        assert_eq!(out.dims(), &[2, 4, 32]);
    }

    #[test]
    fn test_reserved_row_is_addressable() {
        let varmap = VarMap::new();
        let kind = ModalityKind::Discrete { num_classes: 5 };
        let encoder = ModalityEncoder::new(&kind, 32, true, test_vb(&varmap)).unwrap();

        // Id 5 is past the class range and only valid via the reserved row.
        let ids = Tensor::full(5u32, (1, 1), &Device::Cpu).unwrap();
        let out = encoder.forward(&ids).unwrap();
        assert_eq!(out.dims(), &[1, 1, 32]);
    }

    #[test]
    fn test_continuous_encoder_shape() {
        let varmap = VarMap::new();
        let kind = ModalityKind::Continuous { dim: 1 };
        let encoder = ModalityEncoder::new(&kind, 32, false, test_vb(&varmap)).unwrap();

        let values = Tensor::randn(0.0f32, 1.0, (2, 4, 1), &Device::Cpu).unwrap();
        let out = encoder.forward(&values).unwrap();
        assert_eq!(out.dims(), &[2, 4, 32]);
    }

    #[test]
    fn test_discrete_decoder_is_distribution() {
        let varmap = VarMap::new();
        let kind = ModalityKind::Discrete { num_classes: 5 };
        let decoder = ModalityDecoder::new(&kind, 32, 64, 1e-5, test_vb(&varmap)).unwrap();

        let hidden = Tensor::randn(0.0f32, 1.0, (2, 4, 32), &Device::Cpu).unwrap();
        let probs = decoder.forward(&hidden, 1.0).unwrap();
        assert_eq!(probs.dims(), &[2, 4, 5]);

        let sums = probs
            .sum(candle_core::D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5, "probabilities sum to {s}");
        }
    }

    #[test]
    fn test_temperature_flattens_distribution() {
        let varmap = VarMap::new();
        let kind = ModalityKind::Discrete { num_classes: 5 };
        let decoder = ModalityDecoder::new(&kind, 32, 64, 1e-5, test_vb(&varmap)).unwrap();

        let hidden = Tensor::randn(0.0f32, 1.0, (1, 1, 32), &Device::Cpu).unwrap();
        let sharp = decoder.forward(&hidden, 0.1).unwrap();
        let flat = decoder.forward(&hidden, 10.0).unwrap();

        let max_of = |t: &Tensor| -> f32 {
            t.flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
                .into_iter()
                .fold(f32::MIN, f32::max)
        };
        assert!(max_of(&sharp) >= max_of(&flat));
    }

    #[test]
    fn test_continuous_decoder_shape() {
        let varmap = VarMap::new();
        let kind = ModalityKind::Continuous { dim: 1 };
        let decoder = ModalityDecoder::new(&kind, 32, 64, 1e-5, test_vb(&varmap)).unwrap();

        let hidden = Tensor::randn(0.0f32, 1.0, (2, 4, 32), &Device::Cpu).unwrap();
        let out = decoder.forward(&hidden, 1.0).unwrap();
        assert_eq!(out.dims(), &[2, 4, 1]);
    }
}
