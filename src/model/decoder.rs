//! Attention-based character decoding step.
//!
//! One call produces the distribution over the next character. The caller
//! runs the loop: it threads the returned state into the next call and picks
//! the next input token (ground truth or the model's own prediction).
//!
//! ```text
//! token [B] → Embedding(V, char_dim) → RNN step (L layers, H = encoder width)
//!   h [B, H] ──┬────────────────────────────────┐
//!              └→ scores vs encoder states [B, S] │ (attention != none)
//!                 → masked softmax → context [B, H]
//!                 → tanh(concat_layer([context; h]))
//!   → output_proj(H, V) → masked log-softmax (PAD, BOS removed)
//! ```
//!
//! ## Weight key paths
//!
//! ```text
//! embedding.weight
//! rnn.{weight,bias}_{ih,hh}_l{k}
//! attn_proj_general | attn_proj_1_layer_nn | attn_proj_layer{1,2}
//! concat_layer.{weight,bias}
//! output_proj.{weight,bias}
//! ```

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Embedding, Linear, VarBuilder, VarMap};

use super::attention::Attention;
use super::encoder::VideoEncoder;
use super::lengths_from_tensor;
use super::masked::masked_log_softmax;
use super::rnn::{time_mask, RecurrentState, Rnn};
use crate::checkpoint::{
    BestError, CheckpointStore, ImprovementNotifier, SafetensorsStore, TracingNotifier,
};
use crate::config::{AttentionType, DecoderConfig, RnnType};
use crate::vocab::Vocabulary;
use crate::{Error, Result};

/// Single-step character decoder over encoder hidden states.
pub struct CharDecodingStep {
    config: DecoderConfig,
    hidden_size: usize,
    vocab_size: usize,
    pad_idx: u32,
    embedding: Embedding,
    rnn: Rnn,
    attention: Attention,
    concat_layer: Linear,
    output_proj: Linear,
    /// `[V]`, 0 at `PAD` and `BOS`.
    output_mask: Tensor,
    params: VarMap,
    best_error: BestError,
    training: bool,
}

impl CharDecodingStep {
    /// Build a decoder matched to `encoder`: same cell type and layer
    /// count, hidden size equal to the encoder's output width.
    pub fn new(
        encoder: &VideoEncoder,
        config: &DecoderConfig,
        vocab: &Vocabulary,
        device: &Device,
    ) -> Result<Self> {
        let enc = encoder.config();
        Self::with_shape(
            enc.rnn_type,
            enc.num_layers,
            encoder.output_size(),
            config,
            vocab,
            device,
        )
    }

    /// Build a decoder for an explicit recurrent shape.
    pub fn with_shape(
        rnn_type: RnnType,
        num_layers: usize,
        hidden_size: usize,
        config: &DecoderConfig,
        vocab: &Vocabulary,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        if hidden_size == 0 || num_layers == 0 {
            return Err(Error::config("decoder needs a positive hidden size and layer count"));
        }

        let params = VarMap::new();
        let vb = VarBuilder::from_varmap(&params, DType::F32, device);
        let vocab_size = vocab.len();

        let embedding = candle_nn::embedding(vocab_size, config.char_dim, vb.pp("embedding"))?;
        let rnn = Rnn::new(
            rnn_type,
            config.char_dim,
            hidden_size,
            num_layers,
            false,
            config.rnn_dropout,
            vb.pp("rnn"),
        )?;
        let attention = Attention::new(
            config.attention_type,
            hidden_size,
            config.attn_hidden_size,
            vb.clone(),
        )?;
        let concat_layer = candle_nn::linear(2 * hidden_size, hidden_size, vb.pp("concat_layer"))?;
        let output_proj = candle_nn::linear(hidden_size, vocab_size, vb.pp("output_proj"))?;

        tracing::debug!(
            "CharDecodingStep: {:?} {}x{}, vocab={}, char_dim={}, attention={:?}",
            rnn_type,
            num_layers,
            hidden_size,
            vocab_size,
            config.char_dim,
            config.attention_type
        );

        Ok(Self {
            config: config.clone(),
            hidden_size,
            vocab_size,
            pad_idx: vocab.pad_idx(),
            embedding,
            rnn,
            attention,
            concat_layer,
            output_proj,
            output_mask: vocab.output_mask(0, device)?,
            params,
            best_error: BestError::default(),
            training: false,
        })
    }

    /// Build a decoder and load its parameters from a safetensors checkpoint.
    pub fn load(
        encoder: &VideoEncoder,
        config: &DecoderConfig,
        vocab: &Vocabulary,
        path: impl AsRef<Path>,
        device: &Device,
    ) -> Result<Self> {
        let mut decoder = Self::new(encoder, config, vocab, device)?;
        decoder.params.load(path)?;
        Ok(decoder)
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn attention_type(&self) -> AttentionType {
        self.attention.kind()
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn params(&self) -> &VarMap {
        &self.params
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn best_error(&self) -> f64 {
        self.best_error.value()
    }

    /// Zero state `[L, batch, H]` of the decoder's cell type.
    pub fn initial_state(&self, batch: usize, device: &Device) -> Result<RecurrentState> {
        RecurrentState::zeros(
            self.rnn.kind(),
            self.rnn.num_layers(),
            batch,
            self.hidden_size,
            DType::F32,
            device,
        )
    }

    /// One decoding step.
    ///
    /// - `input_token`: `[B]` previous character ids
    /// - `previous_state`: `[L, B, H]`, e.g. the encoder's final state
    /// - `encoder_lens`: `[B]` valid encoder lengths, each in `1..=S`
    /// - `encoder_hidden_states`: `[B, S, H]`
    ///
    /// Returns `[B, V]` log-probabilities and the new `[L, B, H]` state.
    pub fn forward(
        &self,
        input_token: &Tensor,
        previous_state: &RecurrentState,
        encoder_lens: &Tensor,
        encoder_hidden_states: &Tensor,
    ) -> Result<(Tensor, RecurrentState)> {
        let batch = input_token.dims1()?;
        let (enc_batch, en_seq_len, enc_hidden) = encoder_hidden_states.dims3()?;
        if enc_batch != batch || enc_hidden != self.hidden_size {
            return Err(Error::shape(format!(
                "encoder states {:?} do not match batch {batch} / hidden {}",
                encoder_hidden_states.dims(),
                self.hidden_size
            )));
        }
        let lengths = lengths_from_tensor(encoder_lens, batch)?;
        if lengths.iter().any(|&l| l == 0 || l > en_seq_len) {
            return Err(Error::shape(format!(
                "encoder lengths {lengths:?} must lie in 1..={en_seq_len}"
            )));
        }
        let device = encoder_hidden_states.device();
        let encoder_mask = time_mask(&lengths, en_seq_len, device)?;

        let embedded = self.embed(input_token)?.unsqueeze(1)?; // [B, 1, char_dim]
        let (step, new_state) =
            self.rnn
                .forward(&embedded, &vec![1; batch], Some(previous_state), self.training)?;
        let hidden = step.squeeze(1)?; // [B, H]

        let working = match self
            .attention
            .context(&hidden, encoder_hidden_states, &encoder_mask)?
        {
            Some(context) => self
                .concat_layer
                .forward(&Tensor::cat(&[&context, &hidden], D::Minus1)?)?
                .tanh()?,
            None => hidden,
        };

        let logits = self.output_proj.forward(&working)?;
        let log_probs = masked_log_softmax(&logits, &self.output_mask)?;
        Ok((log_probs, new_state))
    }

    /// `[B]` ids → `[B, char_dim]`, with `PAD` mapped to the zero vector.
    fn embed(&self, input_token: &Tensor) -> Result<Tensor> {
        let ids = input_token.to_dtype(DType::U32)?;
        let tokens: Vec<u32> = ids.to_vec1()?;
        if let Some(bad) = tokens.iter().find(|&&t| t as usize >= self.vocab_size) {
            return Err(Error::shape(format!(
                "token id {bad} outside vocabulary of {}",
                self.vocab_size
            )));
        }
        let keep: Vec<f32> = tokens
            .iter()
            .map(|&t| if t == self.pad_idx { 0.0 } else { 1.0 })
            .collect();
        let keep = Tensor::from_vec(keep, (tokens.len(), 1), ids.device())?;
        Ok(self.embedding.forward(&ids)?.broadcast_mul(&keep)?)
    }

    /// Checkpoint the parameters to `path` if `error` beats the best so far.
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
