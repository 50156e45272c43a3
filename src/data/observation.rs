//! # Observation records
//!
//! The canonical observation set: a [`DomainRecord`] followed by a sequence of
//! [`ObsRecord`]s. Each record is a **sparse linear functional** of the 4-D model output —
//! a [`WeightGrid`] mapping [`Coord6`] coordinates to real weights — together with the
//! observed `value`, its 1-σ `uncertainty`, an additive `offset_term` (the a-priori column
//! already embedded in a retrieval; zero by default) and free passthrough metadata
//! (sounding id, surface type, QA flag, ...).
//!
//! An observation is *valid* iff every coordinate of its weight grid lies within the model
//! domain and time range; invalid records are dropped with a warning
//! ([`ObservationData::filter_domain`]).
//!
//! On disk the weight-grid keys use calendar-date strings and species names; they are
//! resolved against the domain record on load and records referencing unknown dates or
//! species are dropped the same way as spatially out-of-domain ones.
//!
//! ## See also
//! ------------
//! * [`crate::obs_operator`] – Applies the weight grids to a model output.
//! * [`crate::adjoint_forcing`] – The transpose scatter.
//! * [`crate::weights`] – Construction of weight grids from retrieval geometry.

use std::collections::HashMap;

use camino::Utf8Path;
use log::warn;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::data::domain::{Coord6, DomainRecord, ModelDate};
use crate::errors::FourdvarError;

/// Sparse linear functional over the 4-D model output.
pub type WeightGrid = HashMap<Coord6, f64>;

/// A single observation record.
#[derive(Debug, Clone, PartialEq)]
pub struct ObsRecord {
    /// Observed value.
    pub value: f64,
    /// 1-σ observation uncertainty, strictly positive.
    pub uncertainty: f64,
    /// Sparse weights over model coordinates.
    pub weight_grid: WeightGrid,
    /// Additive simulation offset; zero unless the retrieval embeds an a-priori column.
    pub offset_term: f64,
    /// Representative surface cell, if the preprocessor recorded one.
    pub lite_coord: Option<Coord6>,
    /// Passthrough metadata (sounding id, surface type, QA flag, ...).
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ObsRecord {
    /// Whether every weight-grid coordinate lies inside `domain`.
    pub fn is_valid(&self, domain: &DomainRecord) -> bool {
        !self.weight_grid.is_empty() && self.weight_grid.keys().all(|c| domain.contains(c))
    }
}

/// The observation set: domain record plus observation records.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationData {
    pub domain: DomainRecord,
    pub records: Vec<ObsRecord>,
}

impl ObservationData {
    /// Construct and immediately validate uncertainties.
    pub fn new(domain: DomainRecord, records: Vec<ObsRecord>) -> Result<Self, FourdvarError> {
        domain.validate()?;
        if let Some(i) = records.iter().position(|r| r.uncertainty <= 0.0) {
            return Err(FourdvarError::Validation(format!(
                "observation {i} has non-positive uncertainty"
            )));
        }
        Ok(ObservationData { domain, records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop records whose weight grid leaves the model domain, warning per drop.
    ///
    /// Return
    /// ----------
    /// * The filtered set and the number of dropped records.
    pub fn filter_domain(self) -> (Self, usize) {
        let domain = self.domain;
        let before = self.records.len();
        let records: Vec<ObsRecord> = self
            .records
            .into_iter()
            .enumerate()
            .filter_map(|(i, rec)| {
                if rec.is_valid(&domain) {
                    Some(rec)
                } else {
                    warn!("dropping observation {i}: weight grid leaves the model domain");
                    None
                }
            })
            .collect();
        let dropped = before - records.len();
        (ObservationData { domain, records }, dropped)
    }

    /// Observed values as a vector.
    pub fn values(&self) -> Array1<f64> {
        Array1::from_iter(self.records.iter().map(|r| r.value))
    }

    /// 1-σ uncertainties as a vector.
    pub fn uncertainties(&self) -> Array1<f64> {
        Array1::from_iter(self.records.iter().map(|r| r.uncertainty))
    }

    /// Archive to the canonical file form.
    pub fn archive(&self, path: &Utf8Path) -> Result<(), FourdvarError> {
        crate::archive::write_json(path, &ObsFile::from_data(self))
    }

    /// Read the canonical observation file.
    ///
    /// Records referencing unknown dates or species are dropped with a warning; spatial
    /// validity is *not* enforced here — run [`filter_domain`](Self::filter_domain) after
    /// loading.
    pub fn from_file(path: &Utf8Path) -> Result<Self, FourdvarError> {
        let raw: ObsFile = crate::archive::read_json(path)?;
        raw.into_data()
    }

    /// A trivially valid single-observation set on the example domain.
    pub fn example() -> Self {
        let domain = DomainRecord::example();
        let mut weight_grid = WeightGrid::new();
        weight_grid.insert(
            Coord6 { day: 0, step: 23, lay: 0, row: 5, col: 5, spc: 0 },
            1.0,
        );
        ObservationData {
            domain,
            records: vec![ObsRecord {
                value: 1.0,
                uncertainty: 0.1,
                weight_grid,
                offset_term: 0.0,
                lite_coord: None,
                metadata: HashMap::new(),
            }],
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Canonical file form
// -------------------------------------------------------------------------------------------------

pub(crate) const OBS_FORMAT: &str = "fourdvar.observations.v1";

/// One weight-grid entry in the file form: dates and species are symbolic.
#[derive(Debug, Serialize, Deserialize)]
struct WeightEntry {
    date: String,
    step: usize,
    lay: usize,
    row: usize,
    col: usize,
    species: String,
    weight: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ObsFileRecord {
    value: f64,
    uncertainty: f64,
    weight_grid: Vec<WeightEntry>,
    #[serde(default)]
    offset_term: f64,
    #[serde(default)]
    lite_coord: Option<Coord6>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ObsFile {
    format: String,
    domain: DomainRecord,
    observations: Vec<ObsFileRecord>,
}

impl ObsFile {
    fn from_data(data: &ObservationData) -> Self {
        let days = data.domain.days();
        let observations = data
            .records
            .iter()
            .map(|rec| {
                let mut weight_grid: Vec<WeightEntry> = rec
                    .weight_grid
                    .iter()
                    .map(|(c, &w)| WeightEntry {
                        date: days[c.day].iso(),
                        step: c.step,
                        lay: c.lay,
                        row: c.row,
                        col: c.col,
                        species: data.domain.species[c.spc].clone(),
                        weight: w,
                    })
                    .collect();
                weight_grid.sort_by(|a, b| {
                    (&a.date, a.step, a.lay, a.row, a.col)
                        .cmp(&(&b.date, b.step, b.lay, b.row, b.col))
                });
                ObsFileRecord {
                    value: rec.value,
                    uncertainty: rec.uncertainty,
                    weight_grid,
                    offset_term: rec.offset_term,
                    lite_coord: rec.lite_coord,
                    metadata: rec.metadata.clone(),
                }
            })
            .collect();
        ObsFile {
            format: OBS_FORMAT.to_string(),
            domain: data.domain.clone(),
            observations,
        }
    }

    fn into_data(self) -> Result<ObservationData, FourdvarError> {
        if self.format != OBS_FORMAT {
            return Err(FourdvarError::Archive(format!(
                "unrecognized observation file format {:?}",
                self.format
            )));
        }
        self.domain.validate()?;
        let day_index: HashMap<ModelDate, usize> = self
            .domain
            .days()
            .into_iter()
            .enumerate()
            .map(|(i, d)| (d, i))
            .collect();

        let mut records = Vec::with_capacity(self.observations.len());
        for (i, raw) in self.observations.into_iter().enumerate() {
            let mut weight_grid = WeightGrid::with_capacity(raw.weight_grid.len());
            let mut resolvable = true;
            for e in &raw.weight_grid {
                let date = ModelDate::parse_iso(&e.date)?;
                let (day, spc) = match (
                    day_index.get(&date),
                    self.domain.species_index(&e.species),
                ) {
                    (Some(&day), Some(spc)) => (day, spc),
                    _ => {
                        resolvable = false;
                        break;
                    }
                };
                weight_grid.insert(
                    Coord6 { day, step: e.step, lay: e.lay, row: e.row, col: e.col, spc },
                    e.weight,
                );
            }
            if !resolvable {
                warn!("dropping observation {i}: date or species outside the model domain");
                continue;
            }
            records.push(ObsRecord {
                value: raw.value,
                uncertainty: raw.uncertainty,
                weight_grid,
                offset_term: raw.offset_term,
                lite_coord: raw.lite_coord,
                metadata: raw.metadata,
            });
        }
        ObservationData::new(self.domain, records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_is_valid_on_its_domain() {
        let obs = ObservationData::example();
        assert!(obs.records[0].is_valid(&obs.domain));
        let (kept, dropped) = obs.filter_domain();
        assert_eq!(dropped, 0);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn out_of_range_row_is_dropped() {
        let mut obs = ObservationData::example();
        let mut bad = obs.records[0].clone();
        bad.weight_grid.insert(
            Coord6 { day: 0, step: 0, lay: 0, row: 10, col: 0, spc: 0 },
            0.5,
        );
        obs.records.push(bad);
        let (kept, dropped) = obs.filter_domain();
        assert_eq!(dropped, 1);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn empty_weight_grid_is_invalid() {
        let obs = ObservationData::example();
        let rec = ObsRecord {
            weight_grid: WeightGrid::new(),
            ..obs.records[0].clone()
        };
        assert!(!rec.is_valid(&obs.domain));
    }

    #[test]
    fn non_positive_uncertainty_fails_construction() {
        let obs = ObservationData::example();
        let mut rec = obs.records[0].clone();
        rec.uncertainty = 0.0;
        assert!(ObservationData::new(obs.domain, vec![rec]).is_err());
    }

    #[test]
    fn file_form_round_trips() {
        let obs = ObservationData::example();
        let raw = ObsFile::from_data(&obs);
        let back = raw.into_data().unwrap();
        assert_eq!(back, obs);
    }

    #[test]
    fn unknown_species_in_file_is_dropped_on_load() {
        let obs = ObservationData::example();
        let mut raw = ObsFile::from_data(&obs);
        raw.observations[0].weight_grid[0].species = "CO2".to_string();
        let back = raw.into_data().unwrap();
        assert!(back.is_empty());
    }
}
