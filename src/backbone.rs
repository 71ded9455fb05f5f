//! Causal transformer backbone over interleaved slot tokens.
//!
//! The backbone is agnostic to what its tokens mean. Slot assembly and
//! head routing live in the model layer above; this module only runs
//! the layer stack and manages the key/value memory handle.

use candle_core::{Device, Tensor};
use candle_nn::{layer_norm, LayerNorm, Module, VarBuilder};

use crate::attention::{causal_mask, KvCache};
use crate::config::DecisionModelConfig;
use crate::error::{DecisionError, Result};
use crate::layer::BackboneLayer;

/// Cached attention state owned by the caller.
///
/// Holds one key/value pair per layer plus the number of backbone token
/// positions they cover. Probing forwards read from a handle without
/// changing it; committing a step means replacing the handle with the
/// returned one.
#[derive(Debug, Clone)]
pub struct BackboneMemory {
    layers: Vec<Option<KvCache>>,
    positions: usize,
}

impl BackboneMemory {
    /// Create an empty memory for a backbone with `num_layers` layers.
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: vec![None; num_layers],
            positions: 0,
        }
    }

    /// Number of backbone token positions already cached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions == 0
    }

    /// Drop all cached state, keeping the layer count.
    pub fn reset(&mut self) {
        for layer in &mut self.layers {
            *layer = None;
        }
        self.positions = 0;
    }

    pub(crate) fn layer(&self, idx: usize) -> Option<&KvCache> {
        self.layers.get(idx).and_then(|c| c.as_ref())
    }
}

/// Stack of causal attention layers with a final norm.
pub struct CausalBackbone {
    layers: Vec<BackboneLayer>,
    final_norm: LayerNorm,
    max_positions: usize,
}

impl CausalBackbone {
    pub fn new(config: &DecisionModelConfig, vb: VarBuilder, device: &Device) -> Result<Self> {
        let mut layers = Vec::with_capacity(config.backbone.num_layers);
        for i in 0..config.backbone.num_layers {
            let layer = BackboneLayer::new(config, vb.pp(format!("layers.{}", i)), device)?;
            layers.push(layer);
        }

        let final_norm = layer_norm(
            config.hidden_size,
            config.backbone.layer_norm_eps,
            vb.pp("final_norm"),
        )?;

        Ok(Self {
            layers,
            final_norm,
            max_positions: config.backbone.max_positions,
        })
    }

    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Forward pass over `(batch, seq_len, hidden)` token states.
    ///
    /// `memory` supplies cached keys and values from earlier positions and is
    /// never modified; when `need_cache` is set, an extended memory covering
    /// the old and new positions is returned alongside the output.
    pub fn forward(
        &self,
        xs: &Tensor,
        memory: Option<&BackboneMemory>,
        need_cache: bool,
    ) -> Result<(Tensor, Option<BackboneMemory>)> {
        let (_, seq_len, _) = xs.dims3()?;
        let offset = memory.map_or(0, BackboneMemory::len);

        if offset + seq_len > self.max_positions {
            return Err(DecisionError::PositionOverflow {
                what: "backbone positions",
                start: offset,
                end: offset + seq_len,
                len: self.max_positions,
            });
        }

        // A single query position attends to all cached positions, so the
        // mask is only needed for multi-token inputs.
        let mask = if seq_len > 1 {
            Some(causal_mask(seq_len, offset, xs.device())?)
        } else {
            None
        };

        let mut hidden = xs.clone();
        let mut new_layers = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate() {
            let cache = memory.and_then(|m| m.layer(i));
            let (out, new_cache) = layer.forward(&hidden, cache, mask.as_ref(), need_cache)?;
            hidden = out;
            if need_cache {
                new_layers.push(new_cache);
            }
        }

        let hidden = self.final_norm.forward(&hidden)?;

        let new_memory = need_cache.then(|| BackboneMemory {
            layers: new_layers,
            positions: offset + seq_len,
        });

        Ok((hidden, new_memory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build_backbone(config: &DecisionModelConfig) -> CausalBackbone {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        CausalBackbone::new(config, vb, &device).unwrap()
    }

    #[test]
    fn test_forward_shape() {
        let config = DecisionModelConfig::test();
        let backbone = build_backbone(&config);
        let device = Device::Cpu;

        let xs = Tensor::randn(0.0f32, 1.0, (2, 6, config.hidden_size), &device).unwrap();
        let (out, memory) = backbone.forward(&xs, None, true).unwrap();

        assert_eq!(out.dims(), &[2, 6, config.hidden_size]);
        let memory = memory.unwrap();
        assert_eq!(memory.len(), 6);
        assert!(!memory.is_empty());
    }

    #[test]
    fn test_incremental_matches_full() {
        let config = DecisionModelConfig::test();
        let backbone = build_backbone(&config);
        let device = Device::Cpu;

        let xs = Tensor::randn(0.0f32, 1.0, (1, 6, config.hidden_size), &device).unwrap();

        // Full pass over all 6 positions at once.
        let (full, _) = backbone.forward(&xs, None, false).unwrap();
        let full_tail = full.narrow(1, 4, 2).unwrap();

        // Same positions fed as 4 then 2, continuing through memory.
        let head = xs.narrow(1, 0, 4).unwrap();
        let tail = xs.narrow(1, 4, 2).unwrap();
        let (_, memory) = backbone.forward(&head, None, true).unwrap();
        let memory = memory.unwrap();
        assert_eq!(memory.len(), 4);
        let (incremental, _) = backbone.forward(&tail, Some(&memory), false).unwrap();

        let expected = full_tail.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let got = incremental.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (e, g) in expected.iter().zip(got.iter()) {
            assert!((e - g).abs() < 1e-4, "expected {e}, got {g}");
        }
    }

    #[test]
    fn test_forward_does_not_mutate_memory() {
        let config = DecisionModelConfig::test();
        let backbone = build_backbone(&config);
        let device = Device::Cpu;

        let xs = Tensor::randn(0.0f32, 1.0, (1, 3, config.hidden_size), &device).unwrap();
        let (_, memory) = backbone.forward(&xs, None, true).unwrap();
        let memory = memory.unwrap();

        // Probing twice from the same handle must see the same positions.
        let probe = Tensor::randn(0.0f32, 1.0, (1, 3, config.hidden_size), &device).unwrap();
        let (_, extended) = backbone.forward(&probe, Some(&memory), true).unwrap();
        assert_eq!(memory.len(), 3);
        assert_eq!(extended.unwrap().len(), 6);
        let (_, extended) = backbone.forward(&probe, Some(&memory), true).unwrap();
        assert_eq!(extended.unwrap().len(), 6);
    }

    #[test]
    fn test_position_overflow() {
        let config = DecisionModelConfig::test();
        let backbone = build_backbone(&config);
        let device = Device::Cpu;

        let too_long = config.backbone.max_positions + 1;
        let xs = Tensor::zeros((1, too_long, config.hidden_size), DType::F32, &device).unwrap();
        let err = backbone.forward(&xs, None, false).unwrap_err();
        assert!(matches!(err, DecisionError::PositionOverflow { .. }));
    }

    #[test]
    fn test_memory_reset() {
        let mut memory = BackboneMemory::new(2);
        assert!(memory.is_empty());

        let config = DecisionModelConfig::test();
        let backbone = build_backbone(&config);
        let device = Device::Cpu;
        let xs = Tensor::randn(0.0f32, 1.0, (1, 3, config.hidden_size), &device).unwrap();
        let (_, new_memory) = backbone.forward(&xs, None, true).unwrap();
        memory = new_memory.unwrap();
        assert_eq!(memory.len(), 3);

        memory.reset();
        assert!(memory.is_empty());
        assert!(memory.layer(0).is_none());
    }
}
