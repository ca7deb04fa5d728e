//! Masked softmax / log-softmax over the last axis.
//!
//! The mask is non-zero at allowed positions and 0 at forbidden ones (any
//! dtype) and must broadcast to the score shape (e.g. a `[V]` output mask
//! against `[B, T, V]` logits). Forbidden positions come out as exactly 0 (softmax)
//! or exactly [`MASKED_LOG_PROB`] (log-softmax).
//!
//! A row with no allowed position is all 0 under softmax and all
//! [`MASKED_LOG_PROB`] under log-softmax. No NaN is produced in either case,
//! whatever the masked scores hold.

use candle_core::{Tensor, D};

use crate::Result;

/// Log-probability written to masked positions.
pub const MASKED_LOG_PROB: f64 = -1e9;

/// `value` broadcast to the shape and dtype of `like`.
fn filled(like: &Tensor, value: f64) -> Result<Tensor> {
    Ok(Tensor::full(value, like.dims(), like.device())?.to_dtype(like.dtype())?)
}

struct Shifted {
    /// `x - max(x)` over allowed positions, `-inf` elsewhere.
    scores: Tensor,
    /// `u8` mask at the score shape.
    allowed: Tensor,
    /// `u8`, `[..., 1]`: the row has at least one allowed position.
    any_allowed: Tensor,
}

/// Masked slots never enter the arithmetic, so their raw values (NaN and
/// infinities included) cannot reach the result.
fn shift(scores: &Tensor, mask: &Tensor) -> Result<Shifted> {
    let allowed = mask
        .ne(0.0)?
        .broadcast_as(scores.shape())?
        .contiguous()?;
    let any_allowed = allowed.max_keepdim(D::Minus1)?;

    let filled_scores = allowed.where_cond(scores, &filled(scores, f64::NEG_INFINITY)?)?;
    let max = filled_scores.max_keepdim(D::Minus1)?;
    // A fully masked row has a -inf max.
    let max = any_allowed.where_cond(&max, &max.zeros_like()?)?;
    Ok(Shifted {
        scores: filled_scores.broadcast_sub(&max)?,
        allowed,
        any_allowed,
    })
}

/// Row sums of `exp`, with fully masked rows set to 1.
fn row_sums(exp: &Tensor, any_allowed: &Tensor) -> Result<Tensor> {
    let sum = exp.sum_keepdim(D::Minus1)?;
    Ok(any_allowed.where_cond(&sum, &sum.ones_like()?)?)
}

/// Softmax restricted to positions where `mask` is non-zero.
pub fn masked_softmax(scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let shifted = shift(scores, mask)?;
    let exp = shifted.scores.exp()?;
    let sum = row_sums(&exp, &shifted.any_allowed)?;
    let probs = exp.broadcast_div(&sum)?;
    Ok(shifted.allowed.where_cond(&probs, &probs.zeros_like()?)?)
}

/// Log-softmax restricted to positions where `mask` is non-zero.
pub fn masked_log_softmax(scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let shifted = shift(scores, mask)?;
    let sum = row_sums(&shifted.scores.exp()?, &shifted.any_allowed)?;
    let log_probs = shifted.scores.broadcast_sub(&sum.log()?)?;
    let sentinel = filled(&log_probs, MASKED_LOG_PROB)?;
    Ok(shifted.allowed.where_cond(&log_probs, &sentinel)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn rows(t: &Tensor) -> Vec<Vec<f32>> {
        t.to_vec2().unwrap()
    }

    #[test]
    fn softmax_masked_positions_are_zero() {
        let dev = Device::Cpu;
        let scores = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0], [0.5, -1.0, 8.0, 2.0]], &dev).unwrap();
        let mask = Tensor::new(&[[1f32, 1.0, 0.0, 1.0], [0.0, 1.0, 1.0, 0.0]], &dev).unwrap();
        let probs = rows(&masked_softmax(&scores, &mask).unwrap());

        assert_eq!(probs[0][2], 0.0);
        assert_eq!(probs[1][0], 0.0);
        assert_eq!(probs[1][3], 0.0);
        for row in &probs {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "row sums to {sum}");
        }
        // Unmasked ratios follow the unmasked softmax.
        let expected = 1.0 / (1.0 + (-2.0f32).exp() + (-3.0f32).exp());
        assert!((probs[0][3] - expected).abs() < 1e-5);
    }

    #[test]
    fn softmax_survives_large_scores() {
        let dev = Device::Cpu;
        let scores = Tensor::new(&[[1e4f32, 1e4 - 1.0, -1e4]], &dev).unwrap();
        let mask = Tensor::new(&[1f32, 1.0, 1.0], &dev).unwrap();
        let probs = rows(&masked_softmax(&scores, &mask).unwrap());
        assert!(probs[0].iter().all(|p| p.is_finite()));
        assert!((probs[0].iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn log_softmax_normalises_over_unmasked() {
        let dev = Device::Cpu;
        let scores = Tensor::randn(0f32, 3.0, (3, 7), &dev).unwrap();
        let mask = Tensor::new(&[0f32, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0], &dev).unwrap();
        let log_probs = rows(&masked_log_softmax(&scores, &mask).unwrap());

        for row in &log_probs {
            assert!(row[0] <= MASKED_LOG_PROB as f32);
            assert!(row[3] <= MASKED_LOG_PROB as f32);
            let total: f32 = row.iter().map(|lp| lp.exp()).sum();
            assert!((total - 1.0).abs() < 1e-5, "exp sums to {total}");
        }
    }

    #[test]
    fn log_softmax_broadcasts_mask_over_batch_and_time() {
        let dev = Device::Cpu;
        let scores = Tensor::randn(0f32, 1.0, (2, 3, 4), &dev).unwrap();
        let mask = Tensor::new(&[1f32, 0.0, 1.0, 1.0], &dev).unwrap();
        let log_probs: Vec<Vec<Vec<f32>>> =
            masked_log_softmax(&scores, &mask).unwrap().to_vec3().unwrap();
        for step in log_probs.iter().flatten() {
            assert_eq!(step[1], MASKED_LOG_PROB as f32);
            let total: f32 = step.iter().map(|lp| lp.exp()).sum();
            assert!((total - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn fully_masked_row_falls_back_deterministically() {
        let dev = Device::Cpu;
        let scores = Tensor::new(&[[3.0f32, -2.0, 0.5], [1.0, 2.0, 3.0]], &dev).unwrap();
        let mask = Tensor::new(&[[0u8, 0, 0], [1, 1, 1]], &dev).unwrap();

        let probs = rows(&masked_softmax(&scores, &mask).unwrap());
        assert_eq!(probs[0], vec![0.0, 0.0, 0.0]);
        assert!((probs[1].iter().sum::<f32>() - 1.0).abs() < 1e-5);

        let log_probs = rows(&masked_log_softmax(&scores, &mask).unwrap());
        assert!(log_probs[0].iter().all(|&lp| lp == MASKED_LOG_PROB as f32));
        assert!(log_probs.iter().flatten().all(|lp| !lp.is_nan()));
    }

    #[test]
    fn very_negative_allowed_scores_still_normalise() {
        let dev = Device::Cpu;
        let scores = Tensor::new(&[[-3e9f32, -3e9 + 1024.0, 0.0]], &dev).unwrap();
        let mask = Tensor::new(&[[1f32, 1.0, 0.0]], &dev).unwrap();

        let probs = rows(&masked_softmax(&scores, &mask).unwrap());
        assert_eq!(probs[0][2], 0.0);
        assert!((probs[0].iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!((probs[0][1] - 1.0).abs() < 1e-6);

        let log_probs = rows(&masked_log_softmax(&scores, &mask).unwrap());
        assert_eq!(log_probs[0][2], MASKED_LOG_PROB as f32);
        let total: f32 = log_probs[0].iter().map(|lp| lp.exp()).sum();
        assert!((total - 1.0).abs() < 1e-6, "exp sums to {total}");
    }

    #[test]
    fn non_finite_masked_scores_are_ignored() {
        let dev = Device::Cpu;
        let scores = Tensor::new(
            &[
                [1.0f32, 2.0, f32::INFINITY],
                [1.0, 2.0, f32::NEG_INFINITY],
                [1.0, 2.0, f32::NAN],
            ],
            &dev,
        )
        .unwrap();
        let mask = Tensor::new(&[1u8, 1, 0], &dev).unwrap();
        let expected = 1.0 / (1.0 + (-1.0f32).exp());

        let probs = rows(&masked_softmax(&scores, &mask).unwrap());
        for row in &probs {
            assert_eq!(row[2], 0.0);
            assert!((row[1] - expected).abs() < 1e-6, "row {row:?}");
        }

        let log_probs = rows(&masked_log_softmax(&scores, &mask).unwrap());
        for row in &log_probs {
            assert_eq!(row[2], MASKED_LOG_PROB as f32);
            assert!((row[1] - expected.ln()).abs() < 1e-5, "row {row:?}");
        }
    }
}
