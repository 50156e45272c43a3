//! # Model domain description
//!
//! The *domain record* is the single shape authority of the assimilation: grid extents,
//! vertical sigma levels, the fine model timestep and the run date range. It is the first
//! record of the canonical observation file (see [`crate::data::observation`]) and every
//! container validates itself against it.
//!
//! ## Overview
//!
//! - [`ModelDate`] — calendar date with the three filename conventions (`YYYYMMDD`,
//!   `YYYYDDD`, `YYYY-MM-DD`) and day arithmetic backed by `hifitime`.
//! - [`DomainRecord`] — grid metadata plus species list.
//! - [`Coord6`] — the 6-tuple `(day, step, layer, row, col, species)` addressing a single
//!   scalar of a 4-D model field; the key type of sparse observation weight grids.
//!
//! ## See also
//! ------------
//! * [`crate::data::observation::WeightGrid`] – Sparse linear functionals keyed by [`Coord6`].
//! * [`crate::time_grid::TimeGrid`] – Coarse/fine temporal alignment over the run days.

use hifitime::Epoch;
use serde::{Deserialize, Serialize};

use crate::constants::DAYSEC;
use crate::errors::FourdvarError;

/// Calendar date (UTC) used for run-day bookkeeping and filename tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelDate {
    pub year: i32,
    pub month: u8,
    pub day: u8,
}

impl ModelDate {
    pub fn new(year: i32, month: u8, day: u8) -> Self {
        ModelDate { year, month, day }
    }

    /// Epoch at the zero hour (00:00:00 UTC) of this date.
    pub fn to_epoch(&self) -> Epoch {
        Epoch::from_gregorian_utc(self.year, self.month, self.day, 0, 0, 0, 0)
    }

    /// Date shifted by a signed number of whole days.
    pub fn add_days(&self, days: i64) -> Self {
        let mjd = self.to_epoch().to_mjd_utc_days() + days as f64;
        // Re-anchor at noon to stay clear of midnight rounding in the float MJD.
        let (year, month, day, ..) = Epoch::from_mjd_utc(mjd + 0.5).to_gregorian_utc();
        ModelDate { year, month, day }
    }

    /// Day-of-year ordinal, 1-based (001 = January 1st).
    pub fn ordinal(&self) -> u16 {
        const CUM: [u16; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];
        let leap = (self.year % 4 == 0 && self.year % 100 != 0) || self.year % 400 == 0;
        let mut doy = CUM[(self.month - 1) as usize] + self.day as u16;
        if leap && self.month > 2 {
            doy += 1;
        }
        doy
    }

    /// `YYYYMMDD` form.
    pub fn ymd8(&self) -> String {
        format!("{:04}{:02}{:02}", self.year, self.month, self.day)
    }

    /// `YYYYDDD` (year + ordinal day) form.
    pub fn yd7(&self) -> String {
        format!("{:04}{:03}", self.year, self.ordinal())
    }

    /// `YYYY-MM-DD` form.
    pub fn iso(&self) -> String {
        format!("{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }

    /// Parse an ISO `YYYY-MM-DD` string.
    pub fn parse_iso(s: &str) -> Result<Self, FourdvarError> {
        let bad = || FourdvarError::Validation(format!("invalid date string: {s:?}"));
        let mut parts = s.split('-');
        let year = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        let month = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        let day = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        if parts.next().is_some() || month == 0 || month > 12 || day == 0 || day > 31 {
            return Err(bad());
        }
        Ok(ModelDate { year, month, day })
    }
}

impl std::fmt::Display for ModelDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.iso())
    }
}

/// Address of a single scalar in a 4-D model field.
///
/// `day` indexes the run days of the domain, `step` the fine timestep within the day,
/// `spc` the species list of the domain. Used as the key of sparse weight grids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Coord6 {
    pub day: usize,
    pub step: usize,
    pub lay: usize,
    pub row: usize,
    pub col: usize,
    pub spc: usize,
}

/// Grid metadata of the model domain: the shape authority for every data container.
///
/// The vertical coordinate is a terrain-following sigma coordinate: `sigma` holds the
/// `lays + 1` interface values, descending from 1.0 (surface) to 0.0 (model top), and the
/// pressure at an interface is `ptop + sigma · (psurf − ptop)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRecord {
    /// Number of grid rows.
    pub rows: usize,
    /// Number of grid columns.
    pub cols: usize,
    /// Number of vertical layers.
    pub lays: usize,
    /// Horizontal cell size along columns, metres.
    pub xcell: f64,
    /// Horizontal cell size along rows, metres.
    pub ycell: f64,
    /// Sigma interface values, length `lays + 1`, descending from 1.0 to 0.0.
    pub sigma: Vec<f64>,
    /// Model-top pressure, Pa.
    pub ptop: f64,
    /// Fine model timestep, seconds.
    pub step_seconds: u64,
    /// First run day (inclusive).
    pub start_date: ModelDate,
    /// Last run day (inclusive).
    pub end_date: ModelDate,
    /// Species names, in storage order.
    pub species: Vec<String>,
}

impl DomainRecord {
    /// Validate the internal consistency of the record.
    ///
    /// Return
    /// ----------
    /// * `Ok(())` or a [`FourdvarError::Validation`] describing the first violated rule.
    pub fn validate(&self) -> Result<(), FourdvarError> {
        if self.rows == 0 || self.cols == 0 || self.lays == 0 {
            return Err(FourdvarError::Validation(
                "domain grid extents must be nonzero".into(),
            ));
        }
        if self.species.is_empty() {
            return Err(FourdvarError::Validation(
                "domain species list is empty".into(),
            ));
        }
        if self.sigma.len() != self.lays + 1 {
            return Err(FourdvarError::Validation(format!(
                "sigma vector has {} entries, expected lays + 1 = {}",
                self.sigma.len(),
                self.lays + 1
            )));
        }
        if self.sigma.windows(2).any(|w| w[0] <= w[1]) {
            return Err(FourdvarError::Validation(
                "sigma interface values must be strictly decreasing".into(),
            ));
        }
        if self.step_seconds == 0 || DAYSEC % self.step_seconds != 0 {
            return Err(FourdvarError::InvalidTimestep(format!(
                "fine step of {} s does not divide the day",
                self.step_seconds
            )));
        }
        if self.end_date < self.start_date {
            return Err(FourdvarError::Validation(format!(
                "run ends ({}) before it starts ({})",
                self.end_date, self.start_date
            )));
        }
        Ok(())
    }

    /// Number of run days (inclusive range).
    pub fn n_days(&self) -> usize {
        let d0 = self.start_date.to_epoch().to_mjd_utc_days();
        let d1 = self.end_date.to_epoch().to_mjd_utc_days();
        ((d1 - d0).round() as i64 + 1) as usize
    }

    /// Run days in order.
    pub fn days(&self) -> Vec<ModelDate> {
        (0..self.n_days() as i64)
            .map(|k| self.start_date.add_days(k))
            .collect()
    }

    /// Number of fine steps per day (`DAYSEC / Δ`); daily files carry one more entry.
    pub fn steps_per_day(&self) -> usize {
        (DAYSEC / self.step_seconds) as usize
    }

    /// Storage index of a species name.
    pub fn species_index(&self, name: &str) -> Option<usize> {
        self.species.iter().position(|s| s == name)
    }

    /// Horizontal cell area `XCELL · YCELL` in m².
    pub fn cell_area(&self) -> f64 {
        self.xcell * self.ycell
    }

    /// Whether a coordinate lies inside the model domain and time range.
    ///
    /// The `step` bound is `steps_per_day()` inclusive: daily files carry `D/Δ + 1`
    /// entries, the last being the zero hour of the next day.
    pub fn contains(&self, c: &Coord6) -> bool {
        c.day < self.n_days()
            && c.step <= self.steps_per_day()
            && c.lay < self.lays
            && c.row < self.rows
            && c.col < self.cols
            && c.spc < self.species.len()
    }

    /// A trivially valid single-species domain used by the consistency test suites.
    pub fn example() -> Self {
        DomainRecord {
            rows: 10,
            cols: 10,
            lays: 1,
            xcell: 1000.0,
            ycell: 1000.0,
            sigma: vec![1.0, 0.0],
            ptop: 5_000.0,
            step_seconds: 3600,
            start_date: ModelDate::new(2019, 7, 1),
            end_date: ModelDate::new(2019, 7, 1),
            species: vec!["X".to_string()],
        }
    }
}
