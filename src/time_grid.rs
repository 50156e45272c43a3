//! # Coarse/fine temporal alignment
//!
//! The control vector lives on a **coarse** clock (one value per coarse timestep, with
//! per-step durations `τ_i`), while the external model consumes **per-day files** indexed
//! by the fine step `Δ`. [`TimeGrid`] owns the bookkeeping between the two:
//!
//! - Each daily file has exactly `D/Δ + 1` entries (`D` = 86 400 s); the final entry is the
//!   zero hour of the next day.
//! - Expansion is a *drain*: each coarse step carries an integer budget `τ_i/Δ` of fine
//!   entries; entries are consumed greedily in order, and the day-final entry is emitted
//!   **without** consuming — it duplicates the coarse step that covers the next instant.
//!   When two coarse steps meet at the day boundary this duplicated entry is therefore
//!   shared with the next coarse step (the "boundary doubling" rule).
//! - The transpose (used when mapping adjoint sensitivities back onto the coarse clock)
//!   sums every fine entry, duplicates included, into its source coarse step.
//!
//! The per-day spans are precomputed at construction and the two invariants — day sums of
//! `D/Δ + 1` and monotone nondecreasing coarse indices — are asserted there.
//!
//! ## See also
//! ------------
//! * [`crate::model`] – Applies the spans to expand emission fields to model input files.
//! * [`crate::data::physical::PhysicalData`] – Carries the coarse `tsec` duration vectors.

use serde::{Deserialize, Serialize};

use crate::constants::DAYSEC;
use crate::data::domain::DomainRecord;
use crate::errors::FourdvarError;

/// A run of identical fine entries drawn from one coarse step: `(coarse index, repetitions)`.
pub type Span = (usize, usize);

/// Precomputed alignment of one coarse control clock with the fine model clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeGrid {
    /// Fine model timestep, seconds.
    step_seconds: u64,
    /// Coarse step durations, seconds.
    tsec: Vec<u64>,
    /// Per-day span lists; every day sums to `DAYSEC/Δ + 1` repetitions.
    spans: Vec<Vec<Span>>,
}

impl TimeGrid {
    /// Build the alignment of the coarse durations `tsec` with the fine clock of `domain`.
    ///
    /// Arguments
    /// -----------------
    /// * `domain`: the model domain (fine step and run-day range).
    /// * `tsec`: coarse step durations in seconds, in order.
    ///
    /// Return
    /// ----------
    /// * A [`TimeGrid`], or a [`FourdvarError::InvalidTimestep`] if any duration rule is
    ///   violated: durations must be positive multiples of the fine step, must sum to the
    ///   run length, and a step shorter than one day must not straddle a calendar-day
    ///   boundary (steps of one day or more must be whole-day multiples starting at a day
    ///   boundary).
    pub fn new(domain: &DomainRecord, tsec: &[u64]) -> Result<Self, FourdvarError> {
        let step = domain.step_seconds;
        let n_days = domain.n_days();
        if tsec.is_empty() {
            return Err(FourdvarError::InvalidTimestep(
                "coarse timestep list is empty".into(),
            ));
        }
        let mut cursor: u64 = 0;
        for (i, &tau) in tsec.iter().enumerate() {
            if tau == 0 || tau % step != 0 {
                return Err(FourdvarError::InvalidTimestep(format!(
                    "coarse step {i} of {tau} s is not a positive multiple of the fine step {step} s"
                )));
            }
            if tau < DAYSEC {
                if cursor % DAYSEC + tau > DAYSEC {
                    return Err(FourdvarError::InvalidTimestep(format!(
                        "coarse step {i} of {tau} s straddles a calendar-day boundary"
                    )));
                }
            } else if tau % DAYSEC != 0 || cursor % DAYSEC != 0 {
                return Err(FourdvarError::InvalidTimestep(format!(
                    "coarse step {i} of {tau} s must be a whole-day multiple starting at a day boundary"
                )));
            }
            cursor += tau;
        }
        if cursor != n_days as u64 * DAYSEC {
            return Err(FourdvarError::InvalidTimestep(format!(
                "coarse step durations sum to {cursor} s, run length is {} s",
                n_days as u64 * DAYSEC
            )));
        }

        let spans = Self::drain(step, tsec, n_days);
        Ok(TimeGrid {
            step_seconds: step,
            tsec: tsec.to_vec(),
            spans,
        })
    }

    /// The drain: greedily consume fine-entry budgets, one day at a time, then emit the
    /// day-final duplicate without consuming.
    fn drain(step: u64, tsec: &[u64], n_days: usize) -> Vec<Vec<Span>> {
        let per_day = (DAYSEC / step) as usize;
        let mut budget: Vec<usize> = tsec.iter().map(|&tau| (tau / step) as usize).collect();
        let mut cur = 0usize;
        let mut spans = Vec::with_capacity(n_days);
        for _ in 0..n_days {
            let mut day = Vec::new();
            let mut left = per_day;
            while left > 0 {
                let take = left.min(budget[cur]);
                day.push((cur, take));
                budget[cur] -= take;
                left -= take;
                if budget[cur] == 0 && cur + 1 < tsec.len() {
                    cur += 1;
                }
            }
            // Day-final entry: the coarse step covering the next instant, not consumed.
            let dup = if budget[cur] > 0 { cur } else { cur.min(tsec.len() - 1) };
            day.push((dup, 1));
            debug_assert_eq!(day.iter().map(|s| s.1).sum::<usize>(), per_day + 1);
            debug_assert!(day.windows(2).all(|w| w[0].0 <= w[1].0));
            spans.push(day);
        }
        debug_assert!(budget.iter().all(|&b| b == 0));
        spans
    }

    /// Number of coarse steps.
    pub fn n_coarse(&self) -> usize {
        self.tsec.len()
    }

    /// Coarse durations in seconds.
    pub fn tsec(&self) -> &[u64] {
        &self.tsec
    }

    /// Number of run days covered.
    pub fn n_days(&self) -> usize {
        self.spans.len()
    }

    /// Fine entries per daily file (`DAYSEC/Δ + 1`).
    pub fn entries_per_day(&self) -> usize {
        (DAYSEC / self.step_seconds) as usize + 1
    }

    /// Span list for one day: `(coarse index, repetitions)` in emission order.
    pub fn day_spans(&self, day: usize) -> &[Span] {
        &self.spans[day]
    }

    /// Expand a per-coarse-step scalar series to one day of fine entries.
    pub fn expand_day(&self, day: usize, coarse: &[f64]) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.entries_per_day());
        for &(idx, reps) in self.day_spans(day) {
            out.extend(std::iter::repeat(coarse[idx]).take(reps));
        }
        out
    }

    /// Transpose of [`expand_day`](Self::expand_day) accumulated over the run: sum fine
    /// values (duplicates included) into their source coarse steps.
    pub fn contract_day_into(&self, day: usize, fine: &[f64], coarse_acc: &mut [f64]) {
        let mut pos = 0;
        for &(idx, reps) in self.day_spans(day) {
            for v in &fine[pos..pos + reps] {
                coarse_acc[idx] += v;
            }
            pos += reps;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::domain::ModelDate;
    use approx::assert_relative_eq;

    fn domain(days: u8) -> DomainRecord {
        let mut dom = DomainRecord::example();
        dom.end_date = ModelDate::new(2019, 7, days);
        dom
    }

    #[test]
    fn one_day_one_step() {
        let grid = TimeGrid::new(&domain(1), &[DAYSEC]).unwrap();
        assert_eq!(grid.day_spans(0), &[(0, 24), (0, 1)]);
        assert_eq!(grid.entries_per_day(), 25);
    }

    #[test]
    fn two_half_day_steps_share_the_day_final_entry_source() {
        let grid = TimeGrid::new(&domain(1), &[DAYSEC / 2, DAYSEC / 2]).unwrap();
        assert_eq!(grid.day_spans(0), &[(0, 12), (1, 12), (1, 1)]);
    }

    #[test]
    fn day_boundary_entry_is_shared_with_the_next_coarse_step() {
        let grid = TimeGrid::new(&domain(2), &[DAYSEC, DAYSEC]).unwrap();
        // The hour-24 entry of day 0 is drawn from coarse step 1 without consuming it.
        assert_eq!(grid.day_spans(0), &[(0, 24), (1, 1)]);
        assert_eq!(grid.day_spans(1), &[(1, 24), (1, 1)]);
    }

    #[test]
    fn multi_day_coarse_step_repeats_across_days() {
        let grid = TimeGrid::new(&domain(3), &[2 * DAYSEC, DAYSEC]).unwrap();
        assert_eq!(grid.day_spans(0), &[(0, 24), (0, 1)]);
        assert_eq!(grid.day_spans(1), &[(0, 24), (1, 1)]);
        assert_eq!(grid.day_spans(2), &[(1, 24), (1, 1)]);
    }

    #[test]
    fn every_day_sums_to_the_file_entry_count_and_indices_are_monotone() {
        let grid = TimeGrid::new(
            &domain(2),
            &[6 * 3600, 6 * 3600, 12 * 3600, DAYSEC],
        )
        .unwrap();
        for day in 0..grid.n_days() {
            let spans = grid.day_spans(day);
            assert_eq!(
                spans.iter().map(|s| s.1).sum::<usize>(),
                grid.entries_per_day()
            );
            assert!(spans.windows(2).all(|w| w[0].0 <= w[1].0));
        }
    }

    #[test]
    fn straddling_and_misaligned_steps_are_rejected() {
        assert!(TimeGrid::new(&domain(2), &[18 * 3600, 18 * 3600, 12 * 3600]).is_err());
        assert!(TimeGrid::new(&domain(1), &[DAYSEC + 1]).is_err());
        assert!(TimeGrid::new(&domain(1), &[DAYSEC / 2]).is_err());
        // A whole-day step may not start mid-day.
        assert!(TimeGrid::new(&domain(2), &[1800, DAYSEC, DAYSEC - 1800]).is_err());
    }

    #[test]
    fn expand_then_contract_is_the_exact_transpose() {
        let grid = TimeGrid::new(&domain(1), &[DAYSEC / 2, DAYSEC / 2]).unwrap();
        let coarse = [3.0, 7.0];
        let fine = grid.expand_day(0, &coarse);
        assert_eq!(fine.len(), 25);
        assert_relative_eq!(fine[0], 3.0);
        assert_relative_eq!(fine[12], 7.0);
        assert_relative_eq!(fine[24], 7.0);

        // <contract(f), c> == <f, expand(c)> for arbitrary f.
        let f: Vec<f64> = (0..25).map(|i| (i as f64 * 0.37).sin()).collect();
        let mut acc = [0.0, 0.0];
        grid.contract_day_into(0, &f, &mut acc);
        let lhs: f64 = acc.iter().zip(coarse.iter()).map(|(a, c)| a * c).sum();
        let rhs: f64 = f.iter().zip(fine.iter()).map(|(a, b)| a * b).sum();
        assert_relative_eq!(lhs, rhs, max_relative = 1e-12);
    }
}
