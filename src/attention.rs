//! Multi-head causal self-attention with key/value caching.
//!
//! Rotary position embeddings (RoPE) are applied at an absolute offset.
//! The query block attends a cached key/value prefix under a block
//! causal mask, so decoding continues incrementally from the cache.

use candle_core::{DType, Device, IndexOp, Result, Tensor, D};
use candle_nn::{linear_no_bias, Linear, Module, VarBuilder};

use crate::config::DecisionModelConfig;

/// Cached keys and values for one attention layer.
///
/// Both tensors have shape `(batch, num_heads, positions, head_dim)`.
pub type KvCache = (Tensor, Tensor);

/// Precomputed cos/sin tables for rotary position embedding.
pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    /// Create RoPE tables covering `max_positions` backbone tokens
    pub fn new(config: &DecisionModelConfig, device: &Device) -> Result<Self> {
        let dim = config.head_dim();
        let theta = config.backbone.rope_theta;
        let max_positions = config.backbone.max_positions;

        // 1 / theta^(i/dim) over the even channel indices
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| 1.0 / theta.powf(i as f32 / dim as f32))
            .collect();
        let inv_freq = Tensor::new(inv_freq, device)?.reshape((1, dim / 2))?;

        let positions = Tensor::arange(0u32, max_positions as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_positions, 1))?;

        // One angle per (position, channel pair), repeated across both halves
        let freqs = positions.matmul(&inv_freq)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;

        Ok(Self {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
        })
    }

    /// Apply RoPE to query and key tensors at absolute position `start_pos`.
    /// Both inputs are (batch, seq_len, num_heads, head_dim).
    pub fn apply(&self, q: &Tensor, k: &Tensor, start_pos: usize) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(1)?;

        // Slice the tables at the absolute offset; the inserted head axis
        // lets them broadcast as (seq_len, 1, head_dim).
        let cos = self.cos.i(start_pos..start_pos + seq_len)?.unsqueeze(1)?;
        let sin = self.sin.i(start_pos..start_pos + seq_len)?.unsqueeze(1)?;

        let q_rot = rotate_half(q, &cos, &sin)?;
        let k_rot = rotate_half(k, &cos, &sin)?;

        Ok((q_rot, k_rot))
    }
}

/// Half-rotation step of RoPE: x * cos + [-hi, lo] * sin
fn rotate_half(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let half = x.dim(D::Minus1)? / 2;
    let lo = x.narrow(D::Minus1, 0, half)?;
    let hi = x.narrow(D::Minus1, half, half)?;

    let swapped = Tensor::cat(&[&hi.neg()?, &lo], D::Minus1)?;
    x.broadcast_mul(cos)?
        .broadcast_add(&swapped.broadcast_mul(sin)?)
}

/// Multi-head causal self-attention over an optionally cached prefix
pub struct CausalSelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    rotary: RotaryEmbedding,
    num_heads: usize,
    head_dim: usize,
}

impl CausalSelfAttention {
    /// Build the q/k/v/o projections and this layer's RoPE tables.
    pub fn new(config: &DecisionModelConfig, vb: VarBuilder, device: &Device) -> Result<Self> {
        let hidden = config.hidden_size;
        let num_heads = config.backbone.num_heads;
        let head_dim = config.head_dim();

        let q_proj = linear_no_bias(hidden, num_heads * head_dim, vb.pp("q_proj"))?;
        let k_proj = linear_no_bias(hidden, num_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj = linear_no_bias(hidden, num_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = linear_no_bias(num_heads * head_dim, hidden, vb.pp("o_proj"))?;

        let rotary = RotaryEmbedding::new(config, device)?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            rotary,
            num_heads,
            head_dim,
        })
    }

    /// Run the query block `x` against the cached prefix.
    ///
    /// Takes and returns (batch, seq_len, hidden_size). When `need_cache`
    /// is set, also returns the extended key/value pair for this layer.
    pub fn forward(
        &self,
        x: &Tensor,
        cache: Option<&KvCache>,
        mask: Option<&Tensor>,
        need_cache: bool,
    ) -> Result<(Tensor, Option<KvCache>)> {
        let (batch, seq_len, _) = x.dims3()?;
        let offset = match cache {
            Some((k, _)) => k.dim(2)?,
            None => 0,
        };

        // Project and split heads: (batch, seq, num_heads, head_dim)
        let split = (batch, seq_len, self.num_heads, self.head_dim);
        let q = self.q_proj.forward(x)?.reshape(split)?;
        let k = self.k_proj.forward(x)?.reshape(split)?;
        let v = self.v_proj.forward(x)?.reshape(split)?;

        // Rotary positions are absolute: new tokens start after the cache.
        let (q, k) = self.rotary.apply(&q, &k, offset)?;

        // (batch, num_heads, seq, head_dim)
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;

        // Prepend cached positions along the sequence axis.
        let (k, v) = match cache {
            Some((ck, cv)) => (
                Tensor::cat(&[ck, &k], 2)?.contiguous()?,
                Tensor::cat(&[cv, &v], 2)?.contiguous()?,
            ),
            None => (k, v),
        };

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn = (q.matmul(&k.t()?.contiguous()?)? * scale)?;

        let attn = match mask {
            Some(m) => attn.broadcast_add(m)?,
            None => attn,
        };

        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn.matmul(&v)?;

        // Merge heads back to (batch, seq, hidden)
        let out = out
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        let out = self.o_proj.forward(&out)?;

        let new_cache = if need_cache { Some((k, v)) } else { None };
        Ok((out, new_cache))
    }
}

/// Causal mask for a query block of `q_len` tokens over `mem_len` cached
/// positions plus the block itself.
///
/// Query `i` may attend key `j` iff `j <= mem_len + i`.
pub fn causal_mask(q_len: usize, mem_len: usize, device: &Device) -> Result<Tensor> {
    let total = mem_len + q_len;
    let mask: Vec<f32> = (0..q_len)
        .flat_map(|i| {
            (0..total).map(move |j| {
                if j <= mem_len + i {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();
    Tensor::from_vec(mask, (1, 1, q_len, total), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_rotary_embedding() {
        let config = DecisionModelConfig::test();
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(&config, &device).unwrap();

        let dims = (2, 16, config.backbone.num_heads, config.head_dim());
        let q = Tensor::randn(0.0f32, 1.0, dims, &device).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, dims, &device).unwrap();

        let (q_rot, k_rot) = rope.apply(&q, &k, 0).unwrap();
        assert_eq!(q_rot.dims(), q.dims());
        assert_eq!(k_rot.dims(), k.dims());

        // Applying at a nonzero offset must stay in range and change values.
        let (q_off, _) = rope.apply(&q, &k, 3).unwrap();
        let same: f32 = (q_rot - &q_off)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(same > 0.0, "offset should shift the rotation");
    }

    #[test]
    fn test_causal_mask_without_memory() {
        let device = Device::Cpu;
        let mask = causal_mask(4, 0, &device).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 4, 4]);
        let vals: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();

        assert_eq!(vals[0], 0.0); // (0,0)
        assert!(vals[1].is_infinite()); // (0,1)
        assert_eq!(vals[5], 0.0); // (1,1)
    }

    #[test]
    fn test_causal_mask_with_memory() {
        let device = Device::Cpu;
        let mask = causal_mask(2, 3, &device).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 2, 5]);
        let vals: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();

        // First query sees all 3 cached positions plus itself.
        assert_eq!(&vals[0..4], &[0.0, 0.0, 0.0, 0.0]);
        assert!(vals[4].is_infinite());
        // Second query sees everything.
        assert!(vals[5..10].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_attention_shapes() {
        let config = DecisionModelConfig::test();
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let attn = CausalSelfAttention::new(&config, vb, &device).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (2, 6, config.hidden_size), &device).unwrap();
        let mask = causal_mask(6, 0, &device).unwrap();

        let (out, kv) = attn.forward(&x, None, Some(&mask), true).unwrap();
        assert_eq!(out.dims(), &[2, 6, config.hidden_size]);

        let (k, v) = kv.unwrap();
        assert_eq!(k.dim(2).unwrap(), 6);
        assert_eq!(v.dim(2).unwrap(), 6);
    }

    #[test]
    fn test_attention_cache_extends() {
        let config = DecisionModelConfig::test();
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let attn = CausalSelfAttention::new(&config, vb, &device).unwrap();
        let x1 = Tensor::randn(0.0f32, 1.0, (1, 4, config.hidden_size), &device).unwrap();
        let x2 = Tensor::randn(0.0f32, 1.0, (1, 2, config.hidden_size), &device).unwrap();

        let mask1 = causal_mask(4, 0, &device).unwrap();
        let (_, kv) = attn.forward(&x1, None, Some(&mask1), true).unwrap();
        let kv = kv.unwrap();

        let mask2 = causal_mask(2, 4, &device).unwrap();
        let (out, kv2) = attn.forward(&x2, Some(&kv), Some(&mask2), true).unwrap();
        assert_eq!(out.dims(), &[1, 2, config.hidden_size]);
        assert_eq!(kv2.unwrap().0.dim(2).unwrap(), 6);
    }
}
