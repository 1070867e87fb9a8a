//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape, dtype and layout assertions that can
//! be wired into constructors or forward paths. They return
//! `candle_core::Result<()>` so call sites can propagate errors without
//! panicking. Every helper takes a `name` used to prefix the message.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(name: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [_, _, actual_hidden] if *actual_hidden == hidden => Ok(()),
        dims => Err(Error::Msg(format!(
            "{name}: expected (batch, seq, {hidden}) layout, got {:?}",
            dims
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(name: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}

/// Checks that two tensors share a dtype.
pub fn expect_same_dtype(name: &str, tensor: &Tensor, other_name: &str, other: &Tensor) -> Result<()> {
    if tensor.dtype() == other.dtype() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name} has dtype {:?} but {other_name} has dtype {:?}",
            tensor.dtype(),
            other.dtype()
        )))
    }
}

/// Rejects strided views; kernels read parameters as dense row-major buffers.
pub fn expect_contiguous(name: &str, tensor: &Tensor) -> Result<()> {
    if tensor.is_contiguous() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected a contiguous tensor, got strides {:?}",
            tensor.stride()
        )))
    }
}
