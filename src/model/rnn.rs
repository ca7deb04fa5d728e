//! Stacked, optionally bidirectional recurrent layers with length masking.
//!
//! Cells follow the PyTorch `nn.RNN` / `nn.GRU` / `nn.LSTM` formulation and
//! weight layout, so converted state dicts load without renaming:
//!
//! ```text
//! weight_ih_l{k}[_reverse]   [gates * hidden, input]
//! weight_hh_l{k}[_reverse]   [gates * hidden, hidden]
//! bias_ih_l{k}[_reverse]     [gates * hidden]
//! bias_hh_l{k}[_reverse]     [gates * hidden]
//! ```
//!
//! Gate order is (r, z, n) for GRU and (i, f, g, o) for LSTM.
//!
//! Variable-length batches are handled by stepping every sequence through
//! the longest length and selecting between the new state and the previous
//! one under a per-timestep validity mask. Padded frames may hold any value,
//! NaN included. A sequence's state is therefore
//! frozen past its end, and the backward direction starts from the zero
//! state at its own last valid frame, as with packed sequences.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Init, VarBuilder};

use crate::config::RnnType;
use crate::{Error, Result};

/// Recurrent state, shaped `[slots, batch, hidden]` per component.
///
/// `slots` is `num_layers * num_directions` as produced by [`Rnn::forward`],
/// or `num_layers` after [`RecurrentState::cat_directions`].
#[derive(Debug, Clone)]
pub enum RecurrentState {
    /// RNN and GRU cells.
    Simple(Tensor),
    /// LSTM cells. Both components are always transformed together.
    DualGate { hidden: Tensor, cell: Tensor },
}

impl RecurrentState {
    /// All-zero state for `kind`.
    pub fn zeros(
        kind: RnnType,
        slots: usize,
        batch: usize,
        hidden_size: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let zeros = || Tensor::zeros((slots, batch, hidden_size), dtype, device);
        Ok(match kind {
            RnnType::Rnn | RnnType::Gru => RecurrentState::Simple(zeros()?),
            RnnType::Lstm => RecurrentState::DualGate {
                hidden: zeros()?,
                cell: zeros()?,
            },
        })
    }

    /// Apply `f` to every component.
    pub fn map(&self, f: impl Fn(&Tensor) -> candle_core::Result<Tensor>) -> Result<Self> {
        Ok(match self {
            RecurrentState::Simple(h) => RecurrentState::Simple(f(h)?),
            RecurrentState::DualGate { hidden, cell } => RecurrentState::DualGate {
                hidden: f(hidden)?,
                cell: f(cell)?,
            },
        })
    }

    /// Combine matching components of two states of the same variant.
    fn zip_with(
        &self,
        other: &Self,
        f: impl Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
    ) -> Result<Self> {
        match (self, other) {
            (RecurrentState::Simple(a), RecurrentState::Simple(b)) => {
                Ok(RecurrentState::Simple(f(a, b)?))
            }
            (
                RecurrentState::DualGate { hidden: ha, cell: ca },
                RecurrentState::DualGate { hidden: hb, cell: cb },
            ) => Ok(RecurrentState::DualGate {
                hidden: f(ha, hb)?,
                cell: f(ca, cb)?,
            }),
            _ => Err(Error::shape("mixed simple and dual-gate recurrent states")),
        }
    }

    /// The hidden component (`h`), whatever the variant.
    pub fn hidden(&self) -> &Tensor {
        match self {
            RecurrentState::Simple(h) => h,
            RecurrentState::DualGate { hidden, .. } => hidden,
        }
    }

    pub fn dims(&self) -> &[usize] {
        self.hidden().dims()
    }

    /// Select batch rows (`dim` is the batch axis, 1 for stacked states).
    pub fn index_select(&self, indices: &Tensor, dim: usize) -> Result<Self> {
        self.map(|t| t.index_select(indices, dim))
    }

    /// `[layers * 2, batch, hidden]` → `[layers, batch, hidden * 2]`.
    ///
    /// Even slots (forward) and odd slots (backward) of each layer are
    /// concatenated on the feature axis, forward first.
    pub fn cat_directions(&self) -> Result<Self> {
        self.map(|t| {
            let (slots, batch, hidden) = t.dims3()?;
            if slots % 2 != 0 {
                candle_core::bail!("cat_directions needs an even slot count, got {slots}");
            }
            // [layers, 2, batch, hidden] → [layers, batch, 2, hidden] → [layers, batch, 2 * hidden]
            t.reshape((slots / 2, 2, batch, hidden))?
                .transpose(1, 2)?
                .reshape((slots / 2, batch, 2 * hidden))
        })
    }

    /// One slot, `[batch, hidden]` per component.
    fn slot(&self, index: usize) -> Result<Self> {
        self.map(|t| t.get(index))
    }

    /// Stack per-slot `[batch, hidden]` states into `[slots, batch, hidden]`.
    fn stack(slots: &[RecurrentState]) -> Result<Self> {
        let first = slots
            .first()
            .ok_or_else(|| Error::shape("cannot stack an empty state list"))?;
        match first {
            RecurrentState::Simple(_) => {
                let hs: Vec<&Tensor> = slots.iter().map(|s| s.hidden()).collect();
                Ok(RecurrentState::Simple(Tensor::stack(&hs, 0)?))
            }
            RecurrentState::DualGate { .. } => {
                let mut hs = Vec::with_capacity(slots.len());
                let mut cs = Vec::with_capacity(slots.len());
                for s in slots {
                    match s {
                        RecurrentState::DualGate { hidden, cell } => {
                            hs.push(hidden);
                            cs.push(cell);
                        }
                        RecurrentState::Simple(_) => {
                            return Err(Error::shape("mixed simple and dual-gate recurrent states"))
                        }
                    }
                }
                Ok(RecurrentState::DualGate {
                    hidden: Tensor::stack(&hs, 0)?,
                    cell: Tensor::stack(&cs, 0)?,
                })
            }
        }
    }

    /// `self` where `keep` (`u8`, `[batch, hidden]`) is set, `previous` elsewhere.
    fn select(&self, previous: &Self, keep: &Tensor) -> Result<Self> {
        self.zip_with(previous, |new, old| keep.where_cond(new, old))
    }
}

/// One direction of one layer.
#[derive(Debug, Clone)]
struct Cell {
    kind: RnnType,
    weight_ih: Tensor, // [gates * hidden, input]
    weight_hh: Tensor, // [gates * hidden, hidden]
    bias_ih: Tensor,   // [gates * hidden]
    bias_hh: Tensor,   // [gates * hidden]
    hidden_size: usize,
}

impl Cell {
    fn new(
        kind: RnnType,
        input_size: usize,
        hidden_size: usize,
        suffix: &str,
        vb: &VarBuilder,
    ) -> Result<Self> {
        let gate_size = kind.gate_count() * hidden_size;
        let bound = 1.0 / (hidden_size as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        Ok(Self {
            kind,
            weight_ih: vb.get_with_hints((gate_size, input_size), &format!("weight_ih_{suffix}"), init)?,
            weight_hh: vb.get_with_hints((gate_size, hidden_size), &format!("weight_hh_{suffix}"), init)?,
            bias_ih: vb.get_with_hints(gate_size, &format!("bias_ih_{suffix}"), init)?,
            bias_hh: vb.get_with_hints(gate_size, &format!("bias_hh_{suffix}"), init)?,
            hidden_size,
        })
    }

    /// Advance one timestep: `x` is `[batch, input]`, `state` is `[batch, hidden]`.
    fn step(&self, x: &Tensor, state: &RecurrentState) -> Result<RecurrentState> {
        let gi = x.matmul(&self.weight_ih.t()?)?.broadcast_add(&self.bias_ih)?;
        let gh = state
            .hidden()
            .matmul(&self.weight_hh.t()?)?
            .broadcast_add(&self.bias_hh)?;
        let hs = self.hidden_size;

        match (self.kind, state) {
            (RnnType::Rnn, RecurrentState::Simple(_)) => {
                Ok(RecurrentState::Simple((gi + gh)?.tanh()?))
            }
            (RnnType::Gru, RecurrentState::Simple(h)) => {
                let r = candle_nn::ops::sigmoid(
                    &(gi.narrow(D::Minus1, 0, hs)? + gh.narrow(D::Minus1, 0, hs)?)?,
                )?;
                let z = candle_nn::ops::sigmoid(
                    &(gi.narrow(D::Minus1, hs, hs)? + gh.narrow(D::Minus1, hs, hs)?)?,
                )?;
                let n = (gi.narrow(D::Minus1, 2 * hs, hs)?
                    + (r * gh.narrow(D::Minus1, 2 * hs, hs)?)?)?
                .tanh()?;
                // h' = (1 - z) * n + z * h
                let h_new = (((1.0 - &z)? * n)? + (z * h)?)?;
                Ok(RecurrentState::Simple(h_new))
            }
            (RnnType::Lstm, RecurrentState::DualGate { cell, .. }) => {
                let gates = (gi + gh)?;
                let i = candle_nn::ops::sigmoid(&gates.narrow(D::Minus1, 0, hs)?)?;
                let f = candle_nn::ops::sigmoid(&gates.narrow(D::Minus1, hs, hs)?)?;
                let g = gates.narrow(D::Minus1, 2 * hs, hs)?.tanh()?;
                let o = candle_nn::ops::sigmoid(&gates.narrow(D::Minus1, 3 * hs, hs)?)?;
                let c_new = ((f * cell)? + (i * g)?)?;
                let h_new = (o * c_new.tanh()?)?;
                Ok(RecurrentState::DualGate {
                    hidden: h_new,
                    cell: c_new,
                })
            }
            _ => Err(Error::shape(format!(
                "{:?} cell received the wrong recurrent state variant",
                self.kind
            ))),
        }
    }
}

/// Multi-layer recurrent network over batch-first sequences.
#[derive(Debug, Clone)]
pub struct Rnn {
    kind: RnnType,
    /// `layers[l][d]`, `d = 0` forward, `d = 1` backward.
    layers: Vec<Vec<Cell>>,
    hidden_size: usize,
    dropout: f64,
}

impl Rnn {
    pub fn new(
        kind: RnnType,
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        bidirectional: bool,
        dropout: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let num_dirs = if bidirectional { 2 } else { 1 };
        let mut layers = Vec::with_capacity(num_layers);
        for l in 0..num_layers {
            let layer_input = if l == 0 {
                input_size
            } else {
                hidden_size * num_dirs
            };
            let mut cells = vec![Cell::new(kind, layer_input, hidden_size, &format!("l{l}"), &vb)?];
            if bidirectional {
                cells.push(Cell::new(
                    kind,
                    layer_input,
                    hidden_size,
                    &format!("l{l}_reverse"),
                    &vb,
                )?);
            }
            layers.push(cells);
        }
        Ok(Self {
            kind,
            layers,
            hidden_size,
            dropout,
        })
    }

    pub fn kind(&self) -> RnnType {
        self.kind
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn num_directions(&self) -> usize {
        self.layers.first().map_or(1, Vec::len)
    }

    /// Run over `xs: [batch, seq_len, input]`.
    ///
    /// - `lengths`: valid length per row, each in `1..=seq_len`
    /// - `initial`: `[layers * dirs, batch, hidden]` state, zeros if `None`
    /// - `train`: enables inter-layer dropout
    ///
    /// Returns the per-timestep top-layer output `[batch, seq_len, hidden * dirs]`
    /// (zero past each row's length) and the final state
    /// `[layers * dirs, batch, hidden]` in PyTorch slot order.
    pub fn forward(
        &self,
        xs: &Tensor,
        lengths: &[usize],
        initial: Option<&RecurrentState>,
        train: bool,
    ) -> Result<(Tensor, RecurrentState)> {
        let (batch, seq_len, _) = xs.dims3()?;
        if lengths.len() != batch {
            return Err(Error::shape(format!(
                "{} lengths for a batch of {batch}",
                lengths.len()
            )));
        }
        let max_len = lengths.iter().copied().max().unwrap_or(0);
        if max_len > seq_len || lengths.contains(&0) {
            return Err(Error::shape(format!(
                "lengths {lengths:?} must lie in 1..={seq_len}"
            )));
        }

        let num_slots = self.num_layers() * self.num_directions();
        let initial = match initial {
            Some(state) => {
                if state.dims() != [num_slots, batch, self.hidden_size] {
                    return Err(Error::shape(format!(
                        "initial state {:?}, expected [{num_slots}, {batch}, {}]",
                        state.dims(),
                        self.hidden_size
                    )));
                }
                state.clone()
            }
            None => RecurrentState::zeros(
                self.kind,
                num_slots,
                batch,
                self.hidden_size,
                xs.dtype(),
                xs.device(),
            )?,
        };

        // Nothing past the longest row can change any state.
        let mut layer_input = xs.narrow(1, 0, max_len)?;
        let valid = time_mask(lengths, max_len, xs.device())?;

        let mut finals = Vec::with_capacity(num_slots);
        for (l, cells) in self.layers.iter().enumerate() {
            let mut outputs = Vec::with_capacity(cells.len());
            for (d, cell) in cells.iter().enumerate() {
                let slot = l * cells.len() + d;
                let (out, last) = run_direction(cell, &layer_input, &valid, initial.slot(slot)?, d == 1)?;
                outputs.push(out);
                finals.push(last);
            }
            layer_input = Tensor::cat(&outputs, D::Minus1)?;
            if train && self.dropout > 0.0 && l + 1 < self.layers.len() {
                layer_input = candle_nn::ops::dropout(&layer_input, self.dropout as f32)?;
            }
        }

        let output = if max_len < seq_len {
            let width = layer_input.dim(2)?;
            let pad = Tensor::zeros((batch, seq_len - max_len, width), layer_input.dtype(), layer_input.device())?;
            Tensor::cat(&[&layer_input, &pad], 1)?
        } else {
            layer_input
        };

        Ok((output, RecurrentState::stack(&finals)?))
    }
}

/// `u8` `[batch, steps]`, 1 where `t < lengths[b]`.
pub(crate) fn time_mask(lengths: &[usize], steps: usize, device: &Device) -> Result<Tensor> {
    let lens: Vec<u32> = lengths.iter().map(|&l| l as u32).collect();
    let lens = Tensor::from_vec(lens, (lengths.len(), 1), device)?;
    let positions = Tensor::arange(0u32, steps as u32, device)?.unsqueeze(0)?;
    Ok(positions.broadcast_lt(&lens)?)
}

/// Run one cell across time. Returns `[batch, steps, hidden]` and the last
/// valid `[batch, hidden]` state of every row.
fn run_direction(
    cell: &Cell,
    xs: &Tensor,
    valid: &Tensor,
    mut state: RecurrentState,
    reverse: bool,
) -> Result<(Tensor, RecurrentState)> {
    let steps = xs.dim(1)?;
    let mut outputs = Vec::with_capacity(steps);
    let order: Box<dyn Iterator<Item = usize>> = if reverse {
        Box::new((0..steps).rev())
    } else {
        Box::new(0..steps)
    };
    let zeros = Tensor::zeros((xs.dim(0)?, cell.hidden_size), xs.dtype(), xs.device())?;
    for t in order {
        let keep = valid.narrow(1, t, 1)?.broadcast_as(zeros.shape())?; // [batch, hidden]
        let x = xs.narrow(1, t, 1)?.squeeze(1)?.contiguous()?;
        let next = cell.step(&x, &state)?;
        state = next.select(&state, &keep)?;
        outputs.push(keep.where_cond(state.hidden(), &zeros)?);
    }
    if reverse {
        outputs.reverse();
    }
    Ok((Tensor::stack(&outputs, 1)?, state))
}
