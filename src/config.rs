//! Configuration for the video encoder and the character decoding step.
//!
//! Variant names match the strings used by the training scripts
//! (`"LSTM"`, `"flatten"`, `"1_layer_nn"`, ...), so configs can be read
//! straight from their JSON dumps.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Recurrent cell used by both encoder and decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RnnType {
    /// Elman RNN with tanh nonlinearity.
    #[serde(rename = "RNN")]
    Rnn,
    #[serde(rename = "GRU")]
    Gru,
    /// Dual-gate cell carrying a (hidden, cell) pair.
    #[serde(rename = "LSTM")]
    Lstm,
}

impl RnnType {
    /// Number of stacked gate blocks in the input/hidden weight matrices.
    pub fn gate_count(self) -> usize {
        match self {
            RnnType::Rnn => 1,
            RnnType::Gru => 3,
            RnnType::Lstm => 4,
        }
    }
}

/// How per-frame landmark features are turned into one vector per timestep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameProcessing {
    /// `[B, T, num_landmarks, landmark_dim]` → `[B, T, num_landmarks * landmark_dim]`.
    Flatten,
}

/// Attention scoring mechanism of the decoding step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttentionType {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "dot")]
    Dot,
    #[serde(rename = "general")]
    General,
    #[serde(rename = "1_layer_nn")]
    OneLayerNn,
    #[serde(rename = "concat")]
    Concat,
}

/// Configuration for [`crate::model::encoder::VideoEncoder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Flattened feature width of one frame (`num_landmarks * landmark_dim`).
    pub frame_dim: usize,

    /// Hidden size per direction.
    pub hidden_size: usize,

    #[serde(default = "default_frame_processing")]
    pub frame_processing: FrameProcessing,

    #[serde(default = "default_rnn_type")]
    pub rnn_type: RnnType,

    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    #[serde(default = "default_bidirectional")]
    pub bidirectional: bool,

    /// Dropout between stacked recurrent layers (training only).
    #[serde(default)]
    pub rnn_dropout: f64,

    /// Adds a per-timestep CTC head. Requires a vocabulary at construction.
    #[serde(default)]
    pub enable_ctc: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            frame_dim: default_frame_dim(),
            hidden_size: default_hidden_size(),
            frame_processing: default_frame_processing(),
            rnn_type: default_rnn_type(),
            num_layers: default_num_layers(),
            bidirectional: default_bidirectional(),
            rnn_dropout: 0.0,
            enable_ctc: false,
        }
    }
}

impl EncoderConfig {
    /// Number of recurrent directions (2 when bidirectional).
    pub fn num_directions(&self) -> usize {
        if self.bidirectional {
            2
        } else {
            1
        }
    }

    /// Feature width of the hidden states and recombined final state.
    pub fn output_size(&self) -> usize {
        self.hidden_size * self.num_directions()
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_dim == 0 || self.hidden_size == 0 {
            return Err(Error::config("frame_dim and hidden_size must be positive"));
        }
        if self.num_layers == 0 {
            return Err(Error::config("num_layers must be at least 1"));
        }
        check_dropout(self.rnn_dropout)
    }
}

/// Configuration for [`crate::model::decoder::CharDecodingStep`].
///
/// Hidden size, cell type and layer count are inherited from the encoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Character embedding width.
    #[serde(default = "default_char_dim")]
    pub char_dim: usize,

    #[serde(default)]
    pub rnn_dropout: f64,

    #[serde(default = "default_attention_type")]
    pub attention_type: AttentionType,

    /// Intermediate width of the `concat` scorer. Required for that variant.
    #[serde(default)]
    pub attn_hidden_size: Option<usize>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            char_dim: default_char_dim(),
            rnn_dropout: 0.0,
            attention_type: default_attention_type(),
            attn_hidden_size: None,
        }
    }
}

impl DecoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.char_dim == 0 {
            return Err(Error::config("char_dim must be positive"));
        }
        if self.attention_type == AttentionType::Concat
            && !self.attn_hidden_size.is_some_and(|size| size > 0)
        {
            return Err(Error::config(
                "concat attention requires a positive attn_hidden_size",
            ));
        }
        check_dropout(self.rnn_dropout)
    }
}

fn check_dropout(p: f64) -> Result<()> {
    if (0.0..1.0).contains(&p) {
        Ok(())
    } else {
        Err(Error::config(format!("rnn_dropout must be in [0, 1), got {p}")))
    }
}

fn default_frame_dim() -> usize {
    // 68 facial landmarks × (x, y)
    136
}
fn default_hidden_size() -> usize {
    256
}
fn default_frame_processing() -> FrameProcessing {
    FrameProcessing::Flatten
}
fn default_rnn_type() -> RnnType {
    RnnType::Lstm
}
fn default_num_layers() -> usize {
    1
}
fn default_bidirectional() -> bool {
    true
}
fn default_char_dim() -> usize {
    64
}
fn default_attention_type() -> AttentionType {
    AttentionType::None
}
