//! Generation utilities for the T2S decode loop
//!
//! This module provides:
//! - Per-row sampling (repetition penalty, temperature, top-k, top-p)
//! - Greedy argmax used for EOS detection
//! - Per-session RNG via [`SamplingContext`] for reproducible generation
//! - [`BatchTracker`] for retiring finished rows mid-batch

mod batch;
mod sampling;

pub use batch::BatchTracker;
pub use sampling::{greedy_rows, sample_next, SamplingContext, SamplingParams};
