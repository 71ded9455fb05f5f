//! Position-weighted, masked loss terms for trajectory training.

use candle_core::{DType, Device, Tensor, Var, D};

use crate::error::{DecisionError, Result};

/// How a weighted loss term is reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossReduction {
    /// Sum over the time axis, keeping one value per batch element.
    #[default]
    PerBatch,
    /// Sum over every axis, producing a scalar.
    Scalar,
}

fn reduce_sum(t: &Tensor, reduction: LossReduction) -> Result<Tensor> {
    match reduction {
        LossReduction::PerBatch => Ok(t.sum(1)?),
        LossReduction::Scalar => Ok(t.sum_all()?),
    }
}

/// Precomputed per-position loss weighting.
///
/// Ramps linearly from 1.0e-3 to 1.0 across the warmup window, stays flat
/// at 1.0 afterwards, and is normalized so the full schedule sums to one.
/// Early context positions, where the model has seen little history,
/// contribute less than later ones.
#[derive(Debug, Clone)]
pub struct LossSchedule {
    weights: Vec<f32>,
}

impl LossSchedule {
    pub fn new(context_warmup: usize, max_position: usize) -> Result<Self> {
        if context_warmup > max_position {
            return Err(DecisionError::invalid_config(format!(
                "context_warmup {} exceeds max_position_loss_weighting {}",
                context_warmup, max_position
            )));
        }
        let mut weights = Vec::with_capacity(max_position);
        if context_warmup == 1 {
            weights.push(1.0e-3);
        } else if context_warmup > 1 {
            let step = (1.0 - 1.0e-3) / (context_warmup - 1) as f32;
            for i in 0..context_warmup {
                weights.push(1.0e-3 + step * i as f32);
            }
        }
        weights.resize(max_position, 1.0);

        let total: f32 = weights.iter().sum();
        if total > 0.0 {
            for w in &mut weights {
                *w /= total;
            }
        }
        Ok(Self { weights })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Slice positions `[start, start + len)` as a `(1, len)` tensor for
    /// broadcasting over a batch.
    pub fn slice(&self, start: usize, len: usize, device: &Device) -> Result<Tensor> {
        let end = start + len;
        if end > self.weights.len() {
            return Err(DecisionError::PositionOverflow {
                what: "loss schedule",
                start,
                end,
                len: self.weights.len(),
            });
        }
        Ok(Tensor::from_slice(&self.weights[start..end], (1, len), device)?)
    }
}

/// Weight of 1.0 where the label is a valid class id in `[0, num_classes)`,
/// 0.0 elsewhere. Invalid entries are padding and must not carry gradient.
pub fn valid_action_mask(labels: &Tensor, num_classes: usize) -> Result<Tensor> {
    let labels = labels.to_dtype(DType::I64)?;
    let ge = labels.ge(0i64)?;
    let lt = labels.lt(num_classes as i64)?;
    Ok(ge.mul(&lt)?.to_dtype(DType::F32)?)
}

/// Weighted cross-entropy of predicted class probabilities against integer
/// targets, with a `1e-10` floor inside the logarithm.
///
/// `probs` is `(batch, steps, classes)`, `targets` `(batch, steps)` and
/// `weight` `(batch, steps)`. Targets are clamped into range before the
/// gather; out-of-range entries must carry zero weight. Returns the reduced
/// loss together with the reduced weight mass (`count`) so callers can
/// normalize scale.
pub fn weighted_cross_entropy(
    probs: &Tensor,
    targets: &Tensor,
    weight: &Tensor,
    reduction: LossReduction,
) -> Result<(Tensor, Tensor)> {
    let (_, _, classes) = probs.dims3()?;
    let targets = targets.to_dtype(DType::I64)?;
    let clamped = targets.clamp(0i64, classes as i64 - 1)?;

    let picked = probs
        .gather(&clamped.unsqueeze(D::Minus1)?, D::Minus1)?
        .squeeze(D::Minus1)?;
    let nll = (picked + 1.0e-10)?.log()?.neg()?;

    let loss = reduce_sum(&nll.broadcast_mul(weight)?, reduction)?;
    let count = reduce_sum(weight, reduction)?;
    Ok((loss, count))
}

/// Weighted mean-squared error. `pred` and `target` are
/// `(batch, steps, dim)`; the error is averaged over `dim` and then
/// weighted per step.
pub fn weighted_mse(
    pred: &Tensor,
    target: &Tensor,
    weight: &Tensor,
    reduction: LossReduction,
) -> Result<Tensor> {
    let se = (pred - target)?.sqr()?.mean(D::Minus1)?;
    reduce_sum(&se.broadcast_mul(weight)?, reduction)
}

/// Weighted entropy of a probability distribution, returned positive.
pub fn weighted_entropy(
    probs: &Tensor,
    weight: &Tensor,
    reduction: LossReduction,
) -> Result<Tensor> {
    let logp = (probs + 1.0e-10)?.log()?;
    let ent = probs.mul(&logp)?.sum(D::Minus1)?.neg()?;
    reduce_sum(&ent.broadcast_mul(weight)?, reduction)
}

/// Mean of per-parameter mean squares over the given variables.
pub fn parameter_regularization(vars: &[Var], device: &Device) -> Result<Tensor> {
    if vars.is_empty() {
        return Ok(Tensor::zeros((), DType::F32, device)?);
    }
    let mut acc = Tensor::zeros((), DType::F32, device)?;
    for var in vars {
        acc = (acc + var.as_tensor().sqr()?.mean_all()?)?;
    }
    Ok((acc / vars.len() as f64)?)
}

/// Named loss terms produced by one training step.
#[derive(Debug)]
pub struct LossReport {
    /// Cross-entropy of predicted next states against observed next states.
    pub world_state: Tensor,
    /// Mean-squared error of predicted rewards, when rewards are active.
    pub world_reward: Option<Tensor>,
    /// Cross-entropy of predicted actions against label actions.
    pub policy: Tensor,
    /// Entropy of the action distribution (positive; the training loop
    /// decides its sign).
    pub entropy: Tensor,
    /// L2 regularization over the trainable parameters.
    pub regularization: Tensor,
    /// Effective weight mass behind the cross-entropy terms.
    pub count: Tensor,
}
