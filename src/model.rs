//! Model components for the lipreading core.
//!
//! ## Components
//!
//! - [`sort`]: reorder a batch by descending length and back
//! - [`masked`]: masked softmax / log-softmax
//! - [`rnn`]: stacked RNN / GRU / LSTM with length masking
//! - [`encoder`]: video encoder with optional CTC head
//! - [`attention`]: dot, general, 1-layer-nn and concat scorers
//! - [`decoder`]: single-step attention character decoder

pub mod attention;
pub mod decoder;
pub mod encoder;
pub mod masked;
pub mod rnn;
pub mod sort;

use candle_core::{DType, Tensor};

use crate::{Error, Result};

/// Read a `[batch]` integer tensor of lengths into host memory.
pub(crate) fn lengths_from_tensor(lengths: &Tensor, batch: usize) -> Result<Vec<usize>> {
    if lengths.dims() != [batch] {
        return Err(Error::shape(format!(
            "lengths must be [{batch}], got {:?}",
            lengths.dims()
        )));
    }
    let lengths: Vec<u32> = lengths.to_dtype(DType::U32)?.to_vec1()?;
    Ok(lengths.into_iter().map(|l| l as usize).collect())
}
