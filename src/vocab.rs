//! Character vocabulary (`char2idx`) and output masks derived from it.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};

use crate::{Error, Result};

/// Padding symbol. Never emitted by the model.
pub const PAD: &str = "<pad>";
/// Beginning-of-sequence symbol. Fed as the first decoder input, never emitted.
pub const BOS: &str = "<bos>";

/// Injective symbol → index mapping with dense indices `0..len`.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    char2idx: HashMap<String, u32>,
}

impl Vocabulary {
    /// Wrap an existing mapping, checking the contract.
    ///
    /// Fails if `PAD` or `BOS` is missing, two symbols share an index, or an
    /// index falls outside `0..len`.
    pub fn new(char2idx: HashMap<String, u32>) -> Result<Self> {
        for reserved in [PAD, BOS] {
            if !char2idx.contains_key(reserved) {
                return Err(Error::Vocab(format!("missing reserved symbol {reserved:?}")));
            }
        }

        let len = char2idx.len();
        let mut seen = vec![false; len];
        for (symbol, &idx) in &char2idx {
            let slot = seen.get_mut(idx as usize).ok_or_else(|| {
                Error::Vocab(format!("index {idx} of {symbol:?} is outside 0..{len}"))
            })?;
            if *slot {
                return Err(Error::Vocab(format!("index {idx} is assigned twice")));
            }
            *slot = true;
        }

        Ok(Self { char2idx })
    }

    /// Build from an ordered symbol list; the position of each symbol is its index.
    pub fn from_symbols<I, S>(symbols: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut char2idx = HashMap::new();
        for (idx, symbol) in symbols.into_iter().enumerate() {
            let symbol = symbol.into();
            if char2idx.insert(symbol.clone(), idx as u32).is_some() {
                return Err(Error::Vocab(format!("duplicate symbol {symbol:?}")));
            }
        }
        Self::new(char2idx)
    }

    /// Load a JSON object of the form `{"<pad>": 0, "<bos>": 1, "a": 2, ...}`.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let char2idx: HashMap<String, u32> = serde_json::from_str(&data)?;
        Self::new(char2idx)
    }

    pub fn len(&self) -> usize {
        self.char2idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.char2idx.is_empty()
    }

    pub fn get(&self, symbol: &str) -> Option<u32> {
        self.char2idx.get(symbol).copied()
    }

    pub fn pad_idx(&self) -> u32 {
        self.char2idx[PAD]
    }

    pub fn bos_idx(&self) -> u32 {
        self.char2idx[BOS]
    }

    /// Output mask of width `len + shift` with `PAD` and `BOS` (moved by
    /// `shift`) set to 0 and every other slot set to 1.
    ///
    /// The CTC head uses `shift = 1` so index 0 stays free for the blank.
    pub fn output_mask(&self, shift: usize, device: &Device) -> Result<Tensor> {
        let width = self.len() + shift;
        let mut mask = vec![1f32; width];
        mask[self.pad_idx() as usize + shift] = 0.0;
        mask[self.bos_idx() as usize + shift] = 0.0;
        Ok(Tensor::from_vec(mask, width, device)?)
    }
}
