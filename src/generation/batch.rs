//! Live-row bookkeeping for batched decoding
//!
//! Rows finish at different steps. Finished rows are dropped from the
//! working tensors so later steps only pay for rows still generating;
//! [`BatchTracker`] maps compacted positions back to original rows.

use anyhow::Result;

use crate::models::MAX_DECODE_STEPS;

/// Tracks which original batch rows are still generating.
pub struct BatchTracker {
    /// For each compacted position, the original row index
    live: Vec<usize>,
    /// Terminal step per original row (None while still generating)
    terminal_steps: Vec<Option<usize>>,
}

impl BatchTracker {
    pub fn new(batch_size: usize) -> Self {
        Self {
            live: (0..batch_size).collect(),
            terminal_steps: vec![None; batch_size],
        }
    }

    /// Number of rows still generating.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_done(&self) -> bool {
        self.live.is_empty()
    }

    /// Original row index for a compacted position.
    pub fn original_row(&self, compact_idx: usize) -> usize {
        self.live[compact_idx]
    }

    /// Retire finished rows and return the surviving compacted positions.
    ///
    /// `finished` holds `(compacted position, terminal step)` pairs for rows
    /// that just terminated. The returned keep list is what working tensors
    /// should be index_select'ed with.
    pub fn retire(&mut self, finished: &[(usize, usize)]) -> Result<Vec<usize>> {
        for &(pos, step) in finished {
            anyhow::ensure!(
                pos < self.live.len(),
                "finished position {} out of range (live {})",
                pos,
                self.live.len()
            );
            let row = self.live[pos];
            anyhow::ensure!(
                self.terminal_steps[row].is_none(),
                "row {} retired twice",
                row
            );
            self.terminal_steps[row] = Some(step);
        }
        let keep: Vec<usize> = (0..self.live.len())
            .filter(|pos| !finished.iter().any(|&(p, _)| p == *pos))
            .collect();
        self.live = keep.iter().map(|&pos| self.live[pos]).collect();
        Ok(keep)
    }

    /// Terminal step per original row. Rows never retired report the
    /// last decode step.
    pub fn into_terminal_steps(self) -> Vec<usize> {
        self.terminal_steps
            .into_iter()
            .map(|s| s.unwrap_or(MAX_DECODE_STEPS - 1))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retire_compacts_and_maps() {
        let mut tracker = BatchTracker::new(4);
        assert_eq!(tracker.live_count(), 4);

        // Rows 1 and 3 (compacted positions 1 and 3) finish at steps 10 and 9.
        let keep = tracker.retire(&[(1, 10), (3, 9)]).unwrap();
        assert_eq!(keep, vec![0, 2]);
        assert_eq!(tracker.live_count(), 2);
        assert_eq!(tracker.original_row(0), 0);
        assert_eq!(tracker.original_row(1), 2);

        // Compacted position 1 is now original row 2.
        let keep = tracker.retire(&[(1, 25)]).unwrap();
        assert_eq!(keep, vec![0]);
        assert_eq!(tracker.original_row(0), 0);

        let keep = tracker.retire(&[(0, 40)]).unwrap();
        assert!(keep.is_empty());
        assert!(tracker.is_done());

        assert_eq!(tracker.into_terminal_steps(), vec![40, 10, 25, 9]);
    }

    #[test]
    fn test_retire_none_is_noop() {
        let mut tracker = BatchTracker::new(2);
        let keep = tracker.retire(&[]).unwrap();
        assert_eq!(keep, vec![0, 1]);
        assert_eq!(tracker.live_count(), 2);
    }

    #[test]
    fn test_retire_out_of_range_errors() {
        let mut tracker = BatchTracker::new(2);
        assert!(tracker.retire(&[(5, 0)]).is_err());
    }

    #[test]
    fn test_unretired_rows_report_step_cap() {
        let mut tracker = BatchTracker::new(3);
        tracker.retire(&[(1, 42)]).unwrap();
        assert_eq!(
            tracker.into_terminal_steps(),
            vec![MAX_DECODE_STEPS - 1, 42, MAX_DECODE_STEPS - 1]
        );
    }
}
