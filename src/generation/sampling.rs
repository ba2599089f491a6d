//! Token sampling for the autoregressive T2S decode loop
//!
//! Sampling runs per batch row: repetition penalty against that row's
//! running ids, then temperature, top-k and top-p filtering, then a
//! multinomial draw. Create a [`SamplingContext`] with an optional seed
//! for reproducible outputs.

use anyhow::Result;
use candle_core::{DType, Tensor, D};

/// RNG state for a single generation session.
///
/// Encapsulates all randomness so that multiple sessions can run
/// concurrently without interfering with each other.
///
/// # Determinism
///
/// When created with a seed, the same seed produces identical output
/// across runs and threads. Without a seed, uses system entropy.
pub struct SamplingContext {
    /// PCG state (only used when seeded)
    state: u64,
    /// Whether we're in seeded mode
    seeded: bool,
    /// Counter for unseeded fallback
    counter: u64,
}

impl SamplingContext {
    /// Create a new sampling context with an optional seed.
    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(s) => {
                // Mix seed with PCG increment to avoid degenerate states
                let state = s
                    .wrapping_mul(2685821657736338717)
                    .wrapping_add(1442695040888963407);
                Self {
                    state,
                    seeded: true,
                    counter: 0,
                }
            }
            None => Self {
                state: 0,
                seeded: false,
                counter: 0,
            },
        }
    }

    /// Re-seed the RNG, returning it to a deterministic initial state.
    pub fn reset(&mut self, seed: u64) {
        self.state = seed
            .wrapping_mul(2685821657736338717)
            .wrapping_add(1442695040888963407);
        self.seeded = true;
    }

    /// Generate a random f32 in [0, 1).
    fn rand_f32(&mut self) -> f32 {
        if !self.seeded {
            use std::time::{SystemTime, UNIX_EPOCH};

            let seed = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as u64;
            let count = self.counter;
            self.counter += 1;

            let state = seed
                .wrapping_add(count)
                .wrapping_mul(1103515245)
                .wrapping_add(12345);
            return (state as f32) / (u64::MAX as f32);
        }

        // PCG XSH RR 64/32
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);

        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        let output = xorshifted.rotate_right(rot);

        (output as f32) / (u32::MAX as f32)
    }
}

/// Decoding controls for one generation call.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    /// Top-k filtering (0 = disabled)
    pub top_k: usize,
    /// Top-p (nucleus) filtering threshold (1.0 = disabled)
    pub top_p: f64,
    /// Sampling temperature (1.0 = no change)
    pub temperature: f64,
    /// Repetition penalty over the row's running ids (1.0 = no penalty)
    pub repetition_penalty: f64,
    /// Stop a row once it has generated more than this many tokens past its
    /// prompt (-1 = disabled)
    pub early_stop_num: i64,
    /// Override for the padded text length (defaults to the batch maximum)
    pub max_text_len: Option<usize>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            top_k: 5,
            top_p: 1.0,
            temperature: 1.0,
            repetition_penalty: 1.35,
            early_stop_num: -1,
            max_text_len: None,
        }
    }
}

/// Down-weight logits for ids already present in the row.
///
/// Positive logits are divided by the penalty, negative logits multiplied,
/// so a penalty > 1.0 always reduces the id's relative probability.
fn penalize_repeats(row: &mut [f32], ids: &[u32], penalty: f32) {
    if (penalty - 1.0).abs() < 1e-9 {
        return;
    }
    let mut seen = vec![false; row.len()];
    for &id in ids {
        let idx = id as usize;
        if idx < row.len() && !seen[idx] {
            seen[idx] = true;
            if row[idx] > 0.0 {
                row[idx] /= penalty;
            } else {
                row[idx] *= penalty;
            }
        }
    }
}

/// Keep only the top k logits, set the rest to -inf.
fn top_k_filter(row: &mut [f32], k: usize) {
    if k == 0 || k >= row.len() {
        return;
    }
    let mut sorted: Vec<f32> = row.to_vec();
    sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let threshold = sorted[k - 1];
    for v in row.iter_mut() {
        if *v < threshold {
            *v = f32::NEG_INFINITY;
        }
    }
}

/// Keep the smallest set of ids whose cumulative probability exceeds p.
fn top_p_filter(row: &mut [f32], p: f32) {
    if p >= 1.0 {
        return;
    }
    let vocab = row.len();
    let mut indices: Vec<usize> = (0..vocab).collect();
    indices.sort_unstable_by(|&a, &b| {
        row[b].partial_cmp(&row[a]).unwrap_or(std::cmp::Ordering::Equal)
    });

    // Softmax over the sorted values to get a cumulative distribution
    let max_val = row[indices[0]];
    let mut exp_sorted: Vec<f32> = indices.iter().map(|&i| (row[i] - max_val).exp()).collect();
    let sum: f32 = exp_sorted.iter().sum();
    for v in &mut exp_sorted {
        *v /= sum;
    }

    let mut cumsum = 0.0f32;
    let mut cutoff = vocab;
    for (i, &prob) in exp_sorted.iter().enumerate() {
        cumsum += prob;
        if cumsum > p {
            cutoff = i + 1;
            break;
        }
    }

    let keep: Vec<usize> = indices[..cutoff].to_vec();
    let kept_vals: Vec<f32> = keep.iter().map(|&i| row[i]).collect();
    for v in row.iter_mut() {
        *v = f32::NEG_INFINITY;
    }
    for (&i, &v) in keep.iter().zip(kept_vals.iter()) {
        row[i] = v;
    }
}

/// In-place softmax over one logit row.
fn softmax_row(row: &mut [f32]) {
    let max_val = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in row.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }
    for v in row.iter_mut() {
        *v /= sum;
    }
}

/// Draw one id from a probability row via inverse-CDF sampling.
fn multinomial_row(probs: &[f32], ctx: &mut SamplingContext) -> u32 {
    let u = ctx.rand_f32();
    let mut cumsum = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if cumsum >= u {
            return i as u32;
        }
    }
    // Rounding can leave the cumulative sum just under u; fall back to
    // the last id that actually carries probability mass, never a
    // filtered-out one.
    probs
        .iter()
        .rposition(|&p| p > 0.0)
        .unwrap_or(probs.len() - 1) as u32
}

/// Sample the next id for every row in the batch.
///
/// `logits` has shape `[batch, vocab]`; `prev_ids[i]` is row i's running
/// sequence (prompt + generated so far). Filter order follows the T2S
/// decoder: repetition penalty, temperature, top-k, top-p, multinomial.
pub fn sample_next(
    logits: &Tensor,
    prev_ids: &[Vec<u32>],
    params: &SamplingParams,
    ctx: &mut SamplingContext,
) -> Result<Vec<u32>> {
    let (batch, _vocab) = logits.dims2()?;
    anyhow::ensure!(
        prev_ids.len() == batch,
        "prev_ids rows ({}) do not match logits batch ({})",
        prev_ids.len(),
        batch
    );
    let rows: Vec<Vec<f32>> = logits.to_dtype(DType::F32)?.to_vec2()?;

    let mut out = Vec::with_capacity(batch);
    for (b, mut row) in rows.into_iter().enumerate() {
        penalize_repeats(&mut row, &prev_ids[b], params.repetition_penalty as f32);

        if params.temperature > 0.0 && (params.temperature - 1.0).abs() > 1e-9 {
            let t = params.temperature as f32;
            for v in &mut row {
                *v /= t;
            }
        }

        top_k_filter(&mut row, params.top_k);
        top_p_filter(&mut row, params.top_p as f32);
        softmax_row(&mut row);
        out.push(multinomial_row(&row, ctx));
    }
    Ok(out)
}

/// Greedy argmax per row, over the raw (unpenalized) logits.
pub fn greedy_rows(logits: &Tensor) -> Result<Vec<u32>> {
    Ok(logits.argmax(D::Minus1)?.to_dtype(DType::U32)?.to_vec1()?)
}
