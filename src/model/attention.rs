//! Attention scorers for the character decoding step.
//!
//! Each variant maps the decoder step state `q: [B, H]` and the encoder
//! hidden states `k: [B, S, H]` to unnormalised scores `[B, S]`:
//!
//! ```text
//! dot         q · k_s
//! general     (W q + b) · k_s
//! 1_layer_nn  w · [k_s; q] + b
//! concat      v · tanh(W [k_s; q] + b) + c
//! ```
//!
//! Weight keys mirror the training code: `attn_proj_general`,
//! `attn_proj_1_layer_nn`, `attn_proj_layer1`, `attn_proj_layer2`.

use candle_core::{Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};

use super::masked::masked_softmax;
use crate::config::AttentionType;
use crate::{Error, Result};

/// Attention scorer, bound to one variant at construction.
#[derive(Debug, Clone)]
pub enum Attention {
    None,
    Dot,
    General { proj: Linear },
    OneLayerNn { proj: Linear },
    Concat { hidden: Linear, score: Linear },
}

impl Attention {
    pub fn new(
        kind: AttentionType,
        hidden_size: usize,
        attn_hidden_size: Option<usize>,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(match kind {
            AttentionType::None => Attention::None,
            AttentionType::Dot => Attention::Dot,
            AttentionType::General => Attention::General {
                proj: candle_nn::linear(hidden_size, hidden_size, vb.pp("attn_proj_general"))?,
            },
            AttentionType::OneLayerNn => Attention::OneLayerNn {
                proj: candle_nn::linear(2 * hidden_size, 1, vb.pp("attn_proj_1_layer_nn"))?,
            },
            AttentionType::Concat => {
                let width = attn_hidden_size.filter(|&w| w > 0).ok_or_else(|| {
                    Error::config("concat attention requires a positive attn_hidden_size")
                })?;
                Attention::Concat {
                    hidden: candle_nn::linear(2 * hidden_size, width, vb.pp("attn_proj_layer1"))?,
                    score: candle_nn::linear(width, 1, vb.pp("attn_proj_layer2"))?,
                }
            }
        })
    }

    pub fn kind(&self) -> AttentionType {
        match self {
            Attention::None => AttentionType::None,
            Attention::Dot => AttentionType::Dot,
            Attention::General { .. } => AttentionType::General,
            Attention::OneLayerNn { .. } => AttentionType::OneLayerNn,
            Attention::Concat { .. } => AttentionType::Concat,
        }
    }

    /// Unnormalised scores `[B, S]`, or `None` for the `none` variant.
    pub fn scores(&self, query: &Tensor, keys: &Tensor) -> Result<Option<Tensor>> {
        let scores = match self {
            Attention::None => return Ok(None),
            Attention::Dot => keys.broadcast_mul(&query.unsqueeze(1)?)?.sum(D::Minus1)?,
            Attention::General { proj } => {
                // [B, S, H] x [B, H, 1] → [B, S, 1]
                let projected = proj.forward(query)?.unsqueeze(2)?;
                keys.contiguous()?.matmul(&projected)?.squeeze(2)?
            }
            Attention::OneLayerNn { proj } => proj.forward(&pair_features(query, keys)?)?.squeeze(2)?,
            Attention::Concat { hidden, score } => {
                let h = hidden.forward(&pair_features(query, keys)?)?.tanh()?;
                score.forward(&h)?.squeeze(2)?
            }
        };
        Ok(Some(scores))
    }

    /// Context vector `[B, H]` from the validity mask `[B, S]`, or `None`
    /// for the `none` variant. Invalid timesteps get exactly zero weight.
    pub fn context(&self, query: &Tensor, keys: &Tensor, valid: &Tensor) -> Result<Option<Tensor>> {
        let Some(scores) = self.scores(query, keys)? else {
            return Ok(None);
        };
        let weights = masked_softmax(&scores, valid)?.unsqueeze(1)?; // [B, 1, S]
        let keep = valid.ne(0.0)?.unsqueeze(2)?.broadcast_as(keys.shape())?;
        let keys = keep.where_cond(keys, &keys.zeros_like()?)?;
        Ok(Some(weights.matmul(&keys)?.squeeze(1)?))
    }
}

/// `[k_s; q]` for every encoder timestep: `[B, S, 2H]`.
fn pair_features(query: &Tensor, keys: &Tensor) -> Result<Tensor> {
    let expanded = query.unsqueeze(1)?.broadcast_as(keys.shape())?;
    Ok(Tensor::cat(&[keys, &expanded], D::Minus1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    fn all_variants() -> [AttentionType; 4] {
        [
            AttentionType::Dot,
            AttentionType::General,
            AttentionType::OneLayerNn,
            AttentionType::Concat,
        ]
    }

    #[test]
    fn score_shapes() {
        let dev = Device::Cpu;
        let query = Tensor::randn(0f32, 1.0, (2, 6), &dev).unwrap();
        let keys = Tensor::randn(0f32, 1.0, (2, 5, 6), &dev).unwrap();
        for kind in all_variants() {
            let (_varmap, vb) = make_vb(&dev);
            let attn = Attention::new(kind, 6, Some(4), vb).unwrap();
            assert_eq!(attn.kind(), kind);
            let scores = attn.scores(&query, &keys).unwrap().unwrap();
            assert_eq!(scores.dims(), &[2, 5], "{kind:?}");
        }
    }

    #[test]
    fn dot_scores_are_inner_products() {
        let dev = Device::Cpu;
        let (_varmap, vb) = make_vb(&dev);
        let attn = Attention::new(AttentionType::Dot, 2, None, vb).unwrap();
        let query = Tensor::new(&[[1f32, 2.0]], &dev).unwrap();
        let keys = Tensor::new(&[[[3f32, 4.0], [-1.0, 0.5]]], &dev).unwrap();
        let scores: Vec<Vec<f32>> = attn.scores(&query, &keys).unwrap().unwrap().to_vec2().unwrap();
        assert_eq!(scores, vec![vec![11.0, 0.0]]);
    }

    #[test]
    fn general_matches_explicit_bilinear_form() {
        let dev = Device::Cpu;
        let (_varmap, vb) = make_vb(&dev);
        let attn = Attention::new(AttentionType::General, 3, None, vb).unwrap();
        let Attention::General { proj } = &attn else {
            panic!("wrong variant");
        };
        let query = Tensor::randn(0f32, 1.0, (1, 3), &dev).unwrap();
        let keys = Tensor::randn(0f32, 1.0, (1, 4, 3), &dev).unwrap();
        let scores: Vec<f32> = attn.scores(&query, &keys).unwrap().unwrap().squeeze(0).unwrap().to_vec1().unwrap();

        let projected: Vec<f32> = proj.forward(&query).unwrap().squeeze(0).unwrap().to_vec1().unwrap();
        let keys: Vec<Vec<f32>> = keys.squeeze(0).unwrap().to_vec2().unwrap();
        for (s, key) in scores.iter().zip(&keys) {
            let expected: f32 = key.iter().zip(&projected).map(|(a, b)| a * b).sum();
            assert!((s - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn padded_steps_get_no_weight() {
        let dev = Device::Cpu;
        let query = Tensor::randn(0f32, 1.0, (2, 4), &dev).unwrap();
        let keys = Tensor::randn(0f32, 1.0, (2, 3, 4), &dev).unwrap();
        let valid = Tensor::new(&[[1f32, 1.0, 1.0], [1.0, 0.0, 0.0]], &dev).unwrap();
        for kind in all_variants() {
            let (_varmap, vb) = make_vb(&dev);
            let attn = Attention::new(kind, 4, Some(5), vb).unwrap();
            let context = attn.context(&query, &keys, &valid).unwrap().unwrap();
            assert_eq!(context.dims(), &[2, 4]);

            // Row 1 only sees step 0, so its context is exactly that state.
            let diff: f32 = (context.get(1).unwrap() - keys.get(1).unwrap().get(0).unwrap())
                .unwrap()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar()
                .unwrap();
            assert!(diff < 1e-5, "{kind:?}: {diff}");
        }
    }

    #[test]
    fn none_has_no_context() {
        let dev = Device::Cpu;
        let (_varmap, vb) = make_vb(&dev);
        let attn = Attention::new(AttentionType::None, 4, None, vb).unwrap();
        let query = Tensor::zeros((1, 4), DType::F32, &dev).unwrap();
        let keys = Tensor::zeros((1, 2, 4), DType::F32, &dev).unwrap();
        let valid = Tensor::ones((1, 2), DType::F32, &dev).unwrap();
        assert!(attn.context(&query, &keys, &valid).unwrap().is_none());
    }

    #[test]
    fn concat_without_width_fails() {
        let (_varmap, vb) = make_vb(&Device::Cpu);
        assert!(matches!(
            Attention::new(AttentionType::Concat, 4, None, vb),
            Err(Error::Config(_))
        ));
    }
}
