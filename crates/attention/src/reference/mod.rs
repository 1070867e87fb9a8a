//! Exact attention assembled from plain candle ops.

pub mod exact;

pub use exact::ExactAttention;
