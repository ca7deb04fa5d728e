//! Sequence-model core for visual speech recognition in pure Rust.
//!
//! A candle-based recurrent encoder / attention decoder that maps a padded
//! batch of per-frame landmark features to character log-probabilities.
//!
//! ## Architecture
//!
//! ```text
//! frames [B, T, lmks, dim] + frame_lens
//!        ↓
//!  VideoEncoder (sort → RNN/GRU/LSTM → restore)
//!        ├→ CTC log-probs [B, T, V + 1]        (optional)
//!        ↓
//!  hidden states [B, T, H], final state [L, B, H]
//!        ↓
//!  CharDecodingStep (embed → RNN step → attention → projection)
//!        ↓ once per output position, driven by the caller
//!  log-probs [B, V]
//! ```
//!
//! ## Modules
//!
//! - [`model`]: length sorting, masked normalisation, recurrent layers,
//!   encoder, attention scorers, decoder
//! - [`vocab`]: `char2idx` vocabulary and output masks
//! - [`config`]: serde-backed encoder / decoder configuration
//! - [`checkpoint`]: save-on-improvement policy and its I/O ports

pub mod checkpoint;
pub mod config;
pub mod model;
pub mod vocab;

mod error;

pub use error::{Error, Result};
pub use model::decoder::CharDecodingStep;
pub use model::encoder::{EncoderOutput, VideoEncoder};
pub use model::rnn::RecurrentState;
