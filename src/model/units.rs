//! # Physical-to-model unit conversion
//!
//! The control vector carries emissions as either a flux (mol s⁻¹ m⁻²) or a unitless
//! multiplier on a daily template, and boundary conditions as ppm s⁻¹ per region. The
//! model consumes mol s⁻¹ per cell throughout. [`UnitConverter`] owns all the factors:
//!
//! - **Flux** emissions scale by the cell area `XCELL · YCELL`.
//! - **Multiplier** emissions scale by the matching template entry (per day, per fine step).
//! - **BCON** entries scale by `Σ_l ρJ̄_l · Δz_l · A / (k · M_air)` over the region's
//!   layers, with `ρJ̄_l` the mean density–Jacobian over the region's boundary cells.
//!   Without meteorology the factor is 1.0 (values already in model units).
//! - **ICON** scale factors multiply a template concentration field, or stand in directly
//!   as a uniform field when no template is given.
//!
//! All conversions are linear, so the adjoint applies the same factors; the BCON region
//! factors are computed once and memoized.

use ndarray::{Array1, Array3, Array4, Array5};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::constants::{K_PPM, M_AIR, NUM_BCON_REGIONS};
use crate::data::domain::DomainRecord;
use crate::data::physical::PhysicalData;
use crate::errors::FourdvarError;

/// Interpretation of the physical emission values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmissionKind {
    /// mol s⁻¹ m⁻² per cell; converted by the cell area.
    Flux,
    /// Unitless multiplier on a per-day template already in mol s⁻¹.
    Multiplier,
}

/// Meteorological fields needed by the BCON conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meteorology {
    /// Density × Jacobian, `(L, R, C)`, kg m⁻³.
    pub rho_j: Array3<f64>,
    /// Layer thicknesses, `(L,)`, m.
    pub dz: Array1<f64>,
}

/// Lateral faces in BCON region order; region `b` is face `b / 2`, lower slab when
/// `b % 2 == 0`, upper slab otherwise.
const FACES: [Face; 4] = [Face::South, Face::North, Face::West, Face::East];

#[derive(Debug, Clone, Copy)]
enum Face {
    South,
    North,
    West,
    East,
}

/// All physical ↔ model unit factors for one run.
#[derive(Debug)]
pub struct UnitConverter {
    domain: DomainRecord,
    emis_lays: usize,
    bcon_up_lay: usize,
    kind: EmissionKind,
    /// Per-day multiplier templates, `(S, D/Δ+1, L_e, R, C)`; required for
    /// [`EmissionKind::Multiplier`].
    templates: Option<Vec<Array5<f64>>>,
    /// ICON template field, `(S, L, R, C)`, ppm.
    icon_template: Option<Array4<f64>>,
    met: Option<Meteorology>,
    bcon_factors: OnceCell<[f64; NUM_BCON_REGIONS]>,
}

impl UnitConverter {
    /// Build and shape-check a converter.
    pub fn new(
        domain: DomainRecord,
        emis_lays: usize,
        bcon_up_lay: usize,
        kind: EmissionKind,
        templates: Option<Vec<Array5<f64>>>,
        icon_template: Option<Array4<f64>>,
        met: Option<Meteorology>,
    ) -> Result<Self, FourdvarError> {
        let n_spc = domain.species.len();
        let entries = domain.steps_per_day() + 1;
        match (kind, &templates) {
            (EmissionKind::Multiplier, None) => {
                return Err(FourdvarError::Config(
                    "multiplier emissions require a template field".into(),
                ));
            }
            (_, Some(t)) => {
                if t.len() != domain.n_days() {
                    return Err(FourdvarError::Config(format!(
                        "{} emission templates for a {}-day run",
                        t.len(),
                        domain.n_days()
                    )));
                }
                let want = (n_spc, entries, emis_lays, domain.rows, domain.cols);
                for (d, day) in t.iter().enumerate() {
                    if day.dim() != want {
                        return Err(FourdvarError::Config(format!(
                            "emission template for day {d} has shape {:?}, expected {want:?}",
                            day.dim()
                        )));
                    }
                }
            }
            (EmissionKind::Flux, None) => {}
        }
        if let Some(tpl) = &icon_template {
            let want = (n_spc, domain.lays, domain.rows, domain.cols);
            if tpl.dim() != want {
                return Err(FourdvarError::Config(format!(
                    "ICON template has shape {:?}, expected {want:?}",
                    tpl.dim()
                )));
            }
        }
        if let Some(met) = &met {
            if met.rho_j.dim() != (domain.lays, domain.rows, domain.cols)
                || met.dz.len() != domain.lays
            {
                return Err(FourdvarError::Config(
                    "meteorology fields do not match the domain grid".into(),
                ));
            }
        }
        Ok(UnitConverter {
            domain,
            emis_lays,
            bcon_up_lay,
            kind,
            templates,
            icon_template,
            met,
            bcon_factors: OnceCell::new(),
        })
    }

    pub fn kind(&self) -> EmissionKind {
        self.kind
    }

    /// Check that a physical control vector matches the grid and layer split the
    /// factors were built for.
    pub fn check_physical(&self, phys: &PhysicalData) -> Result<(), FourdvarError> {
        if phys.domain != self.domain {
            return Err(FourdvarError::Validation(
                "physical domain record differs from the unit converter's".into(),
            ));
        }
        if phys.emis_lays != self.emis_lays || phys.bcon_up_lay != self.bcon_up_lay {
            return Err(FourdvarError::Validation(format!(
                "physical layer split (emis {}, bcon {}) differs from the converter's \
                 (emis {}, bcon {})",
                phys.emis_lays, phys.bcon_up_lay, self.emis_lays, self.bcon_up_lay
            )));
        }
        Ok(())
    }

    /// Factor converting the physical emission value feeding fine entry
    /// `(day, entry, spc, lay, row, col)` into mol s⁻¹ per cell.
    pub fn emis_factor(
        &self,
        day: usize,
        entry: usize,
        spc: usize,
        lay: usize,
        row: usize,
        col: usize,
    ) -> f64 {
        match self.kind {
            EmissionKind::Flux => self.domain.cell_area(),
            EmissionKind::Multiplier => {
                // Presence and shape are checked at construction.
                self.templates.as_ref().map_or(0.0, |t| {
                    t[day][[spc, entry, lay, row, col]]
                })
            }
        }
    }

    /// Factor converting the BCON entry of region `b` from ppm s⁻¹ to mol s⁻¹.
    pub fn bcon_factor(&self, region: usize) -> f64 {
        self.bcon_factors.get_or_init(|| self.compute_bcon_factors())[region]
    }

    fn compute_bcon_factors(&self) -> [f64; NUM_BCON_REGIONS] {
        let mut factors = [1.0; NUM_BCON_REGIONS];
        let met = match &self.met {
            Some(m) => m,
            None => return factors,
        };
        let area = self.domain.cell_area();
        for (b, factor) in factors.iter_mut().enumerate() {
            let face = FACES[b / 2];
            let lays = if b % 2 == 0 {
                0..self.bcon_up_lay
            } else {
                self.bcon_up_lay..self.domain.lays
            };
            let mut acc = 0.0;
            for lay in lays {
                acc += self.face_mean_rho_j(met, face, lay) * met.dz[lay] * area;
            }
            *factor = acc / (K_PPM * M_AIR);
        }
        factors
    }

    /// Mean density–Jacobian over the boundary cells of one face at one layer.
    fn face_mean_rho_j(&self, met: &Meteorology, face: Face, lay: usize) -> f64 {
        let (rows, cols) = (self.domain.rows, self.domain.cols);
        let (sum, count) = match face {
            Face::South => ((0..cols).map(|c| met.rho_j[[lay, 0, c]]).sum::<f64>(), cols),
            Face::North => (
                (0..cols).map(|c| met.rho_j[[lay, rows - 1, c]]).sum::<f64>(),
                cols,
            ),
            Face::West => ((0..rows).map(|r| met.rho_j[[lay, r, 0]]).sum::<f64>(), rows),
            Face::East => (
                (0..rows).map(|r| met.rho_j[[lay, r, cols - 1]]).sum::<f64>(),
                rows,
            ),
        };
        sum / count as f64
    }

    /// Expand ICON scale factors to the full initial-condition field (ppm).
    pub fn icon_field(&self, scale: &Array1<f64>) -> Array4<f64> {
        match &self.icon_template {
            Some(tpl) => {
                let mut field = tpl.clone();
                for (s, mut slab) in field.outer_iter_mut().enumerate() {
                    slab *= scale[s];
                }
                field
            }
            None => {
                let mut field = Array4::zeros((
                    scale.len(),
                    self.domain.lays,
                    self.domain.rows,
                    self.domain.cols,
                ));
                for (s, mut slab) in field.outer_iter_mut().enumerate() {
                    slab.fill(scale[s]);
                }
                field
            }
        }
    }

    /// Transpose of [`icon_field`](Self::icon_field): contract a field sensitivity onto
    /// the per-species scale factors.
    pub fn icon_adjoint(&self, sense: &Array4<f64>) -> Array1<f64> {
        let n_spc = sense.dim().0;
        let mut out = Array1::zeros(n_spc);
        for s in 0..n_spc {
            out[s] = match &self.icon_template {
                Some(tpl) => tpl
                    .index_axis(ndarray::Axis(0), s)
                    .iter()
                    .zip(sense.index_axis(ndarray::Axis(0), s).iter())
                    .map(|(t, g)| t * g)
                    .sum(),
                None => sense.index_axis(ndarray::Axis(0), s).iter().sum(),
            };
        }
        out
    }
}
