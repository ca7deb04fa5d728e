//! Encode a random landmark batch and run a few greedy decoding steps.
//!
//! Usage: cargo run --example decode_step [char2idx.json]

use candle_core::{DType, Device, Tensor, D};
use lipread_rs::config::{AttentionType, DecoderConfig, EncoderConfig};
use lipread_rs::vocab::{Vocabulary, BOS, PAD};
use lipread_rs::{CharDecodingStep, VideoEncoder};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .init();

    let device = Device::Cpu;

    let vocab = match std::env::args().nth(1) {
        Some(path) => Vocabulary::from_json_file(path)?,
        None => {
            let mut symbols = vec![PAD.to_string(), BOS.to_string()];
            symbols.extend(('a'..='z').map(String::from));
            symbols.push(" ".to_string());
            Vocabulary::from_symbols(symbols)?
        }
    };

    // 68 landmarks x 2 coordinates, 256-wide bidirectional LSTM.
    let encoder_config = EncoderConfig {
        num_layers: 2,
        enable_ctc: true,
        ..EncoderConfig::default()
    };
    let encoder = VideoEncoder::new(&encoder_config, Some(&vocab), &device)?;

    let decoder_config = DecoderConfig {
        char_dim: 16,
        attention_type: AttentionType::Concat,
        attn_hidden_size: Some(24),
        ..DecoderConfig::default()
    };
    let decoder = CharDecodingStep::new(&encoder, &decoder_config, &vocab, &device)?;

    // Two clips of 12 and 7 frames.
    let frames = Tensor::randn(0f32, 1.0, (2, 12, 68, 2), &device)?;
    let frame_lens = Tensor::new(&[12u32, 7], &device)?;
    let encoded = encoder.forward(&frames, &frame_lens)?;
    if let Some(ctc) = &encoded.log_probs {
        println!("CTC log-probs: {:?}", ctc.dims());
    }

    let mut state = encoded.final_state;
    let mut tokens = Tensor::new(&[vocab.bos_idx(), vocab.bos_idx()], &device)?;
    for step in 0..5 {
        let (log_probs, next_state) =
            decoder.forward(&tokens, &state, &frame_lens, &encoded.hidden_states)?;
        tokens = log_probs.argmax(D::Minus1)?.to_dtype(DType::U32)?;
        state = next_state;
        println!("step {step}: {:?}", tokens.to_vec1::<u32>()?);
    }

    Ok(())
}
