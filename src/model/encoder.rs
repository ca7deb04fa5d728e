//! Video encoder: recurrent network over per-frame landmark features.
//!
//! ## Architecture
//!
//! ```text
//! frames [B, T, num_lmks, lmk_dim]
//!   → flatten                     [B, T, frame_dim]
//!   → sort by length (desc)
//!   → RNN / GRU / LSTM, L layers, optionally bidirectional
//!   → recombine directions        final: [L, B, H * dirs]
//!   → restore batch order         hidden: [B, T, H * dirs]
//!   → (CTC) Linear(H * dirs, V + 1) → masked log-softmax
//! ```
//!
//! The CTC head reserves index 0 for the blank, so vocabulary index `i`
//! is emitted at `i + 1`. `PAD` and `BOS` are masked out of its output.
//!
//! ## Weight key paths
//!
//! ```text
//! rnn.{weight,bias}_{ih,hh}_l{k}[_reverse]
//! output_proj.{weight,bias}            (CTC only)
//! ```

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder, VarMap};

use super::lengths_from_tensor;
use super::masked::masked_log_softmax;
use super::rnn::{RecurrentState, Rnn};
use super::sort::{restore_batch_order, sort_batch_by_length};
use crate::checkpoint::{
    BestError, CheckpointStore, ImprovementNotifier, SafetensorsStore, TracingNotifier,
};
use crate::config::{EncoderConfig, FrameProcessing};
use crate::vocab::Vocabulary;
use crate::{Error, Result};

/// Result of [`VideoEncoder::forward`].
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `[B, T, V + 1]` CTC log-probabilities, present when CTC is enabled.
    pub log_probs: Option<Tensor>,
    /// `[B, T, H * dirs]`, zero past each sequence's length.
    pub hidden_states: Tensor,
    /// `[L, B, H * dirs]` per component.
    pub final_state: RecurrentState,
}

#[derive(Debug, Clone)]
struct CtcHead {
    output_proj: Linear,
    /// `[V + 1]`, 0 at `PAD + 1` and `BOS + 1`.
    output_mask: Tensor,
}

/// Bidirectional recurrent encoder with an optional CTC head.
pub struct VideoEncoder {
    config: EncoderConfig,
    rnn: Rnn,
    ctc: Option<CtcHead>,
    params: VarMap,
    best_error: BestError,
    training: bool,
}

impl VideoEncoder {
    /// Build an encoder with freshly initialised parameters.
    ///
    /// `vocab` is required when `config.enable_ctc` is set and ignored otherwise.
    pub fn new(config: &EncoderConfig, vocab: Option<&Vocabulary>, device: &Device) -> Result<Self> {
        config.validate()?;
        let ctc_vocab = match (config.enable_ctc, vocab) {
            (true, Some(vocab)) if !vocab.is_empty() => Some(vocab),
            (true, _) => {
                return Err(Error::config(
                    "CTC requires a non-empty vocabulary (char2idx)",
                ))
            }
            (false, _) => None,
        };

        let params = VarMap::new();
        let vb = VarBuilder::from_varmap(&params, DType::F32, device);

        let rnn = Rnn::new(
            config.rnn_type,
            config.frame_dim,
            config.hidden_size,
            config.num_layers,
            config.bidirectional,
            config.rnn_dropout,
            vb.pp("rnn"),
        )?;

        let ctc = match ctc_vocab {
            Some(vocab) => {
                let adj_vocab_size = vocab.len() + 1;
                Some(CtcHead {
                    output_proj: candle_nn::linear(
                        config.output_size(),
                        adj_vocab_size,
                        vb.pp("output_proj"),
                    )?,
                    output_mask: vocab.output_mask(1, device)?,
                })
            }
            None => None,
        };

        tracing::debug!(
            "VideoEncoder: {:?} {}x{} (bidirectional={}), frame_dim={}, ctc={}",
            config.rnn_type,
            config.num_layers,
            config.hidden_size,
            config.bidirectional,
            config.frame_dim,
            ctc.is_some()
        );

        Ok(Self {
            config: config.clone(),
            rnn,
            ctc,
            params,
            best_error: BestError::default(),
            training: false,
        })
    }

    /// Build an encoder and load its parameters from a safetensors checkpoint.
    pub fn load(
        config: &EncoderConfig,
        vocab: Option<&Vocabulary>,
        path: impl AsRef<Path>,
        device: &Device,
    ) -> Result<Self> {
        let mut encoder = Self::new(config, vocab, device)?;
        encoder.params.load(path)?;
        Ok(encoder)
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Feature width of hidden states and final state (`H * dirs`).
    pub fn output_size(&self) -> usize {
        self.config.output_size()
    }

    /// Width of the CTC output (`V + 1`), if the head is enabled.
    pub fn adj_vocab_size(&self) -> Option<usize> {
        self.ctc.as_ref().map(|ctc| ctc.output_mask.elem_count())
    }

    /// Trainable parameters, for an external optimiser.
    pub fn params(&self) -> &VarMap {
        &self.params
    }

    /// Toggle inter-layer dropout.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn best_error(&self) -> f64 {
        self.best_error.value()
    }

    /// Encode a padded batch.
    ///
    /// - `frames`: `[B, T, num_lmks, lmk_dim]`
    /// - `frame_lens`: `[B]` integer lengths, each in `1..=T`
    pub fn forward(&self, frames: &Tensor, frame_lens: &Tensor) -> Result<EncoderOutput> {
        let frames = self.process_frames(frames)?;
        let (batch, _, _) = frames.dims3()?;
        let lengths = lengths_from_tensor(frame_lens, batch)?;

        let sorted = sort_batch_by_length(&frames, &lengths)?;
        let (hidden_states, final_state) =
            self.rnn
                .forward(&sorted.batch, &sorted.lengths, None, self.training)?;

        let final_state = if self.config.bidirectional {
            final_state.cat_directions()?
        } else {
            final_state
        };

        let hidden_states = restore_batch_order(&hidden_states, &sorted.restoration_indices, 0)?;
        let final_state = final_state.index_select(&sorted.restoration_indices, 1)?;

        let log_probs = match &self.ctc {
            Some(ctc) => {
                let logits = ctc.output_proj.forward(&hidden_states)?;
                Some(masked_log_softmax(&logits, &ctc.output_mask)?)
            }
            None => None,
        };

        Ok(EncoderOutput {
            log_probs,
            hidden_states,
            final_state,
        })
    }

    fn process_frames(&self, frames: &Tensor) -> Result<Tensor> {
        match self.config.frame_processing {
            FrameProcessing::Flatten => {
                let dims = frames.dims();
                if dims.len() < 3 {
                    return Err(Error::shape(format!(
                        "frames must be [B, T, ...features], got {dims:?}"
                    )));
                }
                let frame_dim: usize = dims[2..].iter().product();
                if frame_dim != self.config.frame_dim {
                    return Err(Error::shape(format!(
                        "frames flatten to {frame_dim} features, encoder expects {}",
                        self.config.frame_dim
                    )));
                }
                Ok(frames.reshape((dims[0], dims[1], frame_dim))?)
            }
        }
    }

    /// Checkpoint the parameters to `path` if `error` beats the best so far.
    ///
    /// Writes safetensors and logs the improvement via `tracing`.
    pub fn save_best_model(&mut self, error: f64, path: impl AsRef<Path>) -> Result<bool> {
        self.save_best_model_with(error, path, &SafetensorsStore, &TracingNotifier)
    }

    pub fn save_best_model_with(
        &mut self,
        error: f64,
        path: impl AsRef<Path>,
        store: &dyn CheckpointStore,
        notifier: &dyn ImprovementNotifier,
    ) -> Result<bool> {
        self.best_error
            .save_if_improved(error, path.as_ref(), &self.params, store, notifier)
    }
}
