//! # Physical control vector
//!
//! [`PhysicalData`] is the control vector in its natural, interpretable parameterization:
//!
//! - optional **initial-condition** scale factors, one per species;
//! - the **emission** field, shape `(S, T_e, L_e, R, C)` — coarse timesteps `T_e` with
//!   per-step durations `tsec_emis`, emission layers `L_e ≤ L`;
//! - the **boundary-condition** field, shape `(S, T_b, B)` over the fixed region count
//!   `B = 8` (four lateral faces, each split at `bcon_up_lay`).
//!
//! The prior error covariance is block-diagonal across the three blocks. ICON and BCON
//! blocks are diagonal (scalar uncertainties); the emission block is a per-timestep
//! low-rank factorization `C_t = V_t · diag(λ_t²) · V_tᵀ` held in [`CovBlock`]. The dense
//! covariance is never materialized.
//!
//! Instances are immutable value objects: transforms produce new instances. Shapes,
//! uncertainty positivity, coarse-timestep rules and covariance ranks are all checked
//! by [`PhysicalData::validated`] before an instance is released to the rest of the
//! engine.
//!
//! ## See also
//! ------------
//! * [`crate::precon::Preconditioner`] – Maps between this space and the whitened space.
//! * [`crate::archive`] – Self-describing archive files (`archive` / `from_file`).

use camino::Utf8Path;
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array3, Array5};
use serde::{Deserialize, Serialize};

use crate::constants::NUM_BCON_REGIONS;
use crate::data::domain::DomainRecord;
use crate::errors::FourdvarError;
use crate::time_grid::TimeGrid;

/// Low-rank factor of one emission-timestep covariance block: `C_t = V · diag(λ²) · Vᵀ`.
///
/// Columns of `basis` are orthonormal eigenvectors over the flattened emission slab
/// (flatten order `(species, layer, row, col)`, row-major); `sval` holds the singular
/// values λ (square roots of eigenvalues), all strictly positive.
#[derive(Debug, Clone, PartialEq)]
pub struct CovBlock {
    pub basis: DMatrix<f64>,
    pub sval: DVector<f64>,
}

impl CovBlock {
    pub fn rank(&self) -> usize {
        self.sval.len()
    }
}

/// The physical control vector, its uncertainties, and its prior covariance factors.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalData {
    pub domain: DomainRecord,
    /// Number of emission layers, `1 ..= domain.lays`.
    pub emis_lays: usize,
    /// Vertical layer splitting each boundary face into lower/upper regions.
    pub bcon_up_lay: usize,
    /// Coarse emission step durations, seconds.
    pub tsec_emis: Vec<u64>,
    /// Coarse boundary-condition step durations, seconds.
    pub tsec_bcon: Vec<u64>,
    /// Emission field, `(S, T_e, L_e, R, C)`.
    pub emis: Array5<f64>,
    /// Boundary-condition field, `(S, T_b, B)`.
    pub bcon: Array3<f64>,
    /// BCON 1-σ uncertainties, same shape as `bcon`, strictly positive.
    pub bcon_unc: Array3<f64>,
    /// Initial-condition scale factors per species.
    pub icon: Option<Array1<f64>>,
    /// ICON 1-σ uncertainties per species, strictly positive.
    pub icon_unc: Option<Array1<f64>>,
    /// Per-emission-timestep covariance factors, length `T_e`.
    pub cov_emis: Vec<CovBlock>,
}

/// Adjoint dual of [`PhysicalData`]: same field shapes, no uncertainties or covariance.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalAdjoint {
    pub emis: Array5<f64>,
    pub bcon: Array3<f64>,
    pub icon: Option<Array1<f64>>,
}

impl PhysicalAdjoint {
    /// Zero adjoint with the field shapes of `phys`.
    pub fn zeros_like(phys: &PhysicalData) -> Self {
        PhysicalAdjoint {
            emis: Array5::zeros(phys.emis.raw_dim()),
            bcon: Array3::zeros(phys.bcon.raw_dim()),
            icon: phys.icon.as_ref().map(|i| Array1::zeros(i.len())),
        }
    }

    /// Inner product `⟨self, a − b⟩` over all physical fields.
    ///
    /// Used by the preconditioner adjoint-consistency test, where `a − b` is
    /// `unwhiten(x) − prior`.
    pub fn dot_diff(&self, a: &PhysicalData, b: &PhysicalData) -> f64 {
        let mut acc = 0.0;
        for (w, (x, y)) in self.emis.iter().zip(a.emis.iter().zip(b.emis.iter())) {
            acc += w * (x - y);
        }
        for (w, (x, y)) in self.bcon.iter().zip(a.bcon.iter().zip(b.bcon.iter())) {
            acc += w * (x - y);
        }
        if let (Some(w), Some(x), Some(y)) = (&self.icon, &a.icon, &b.icon) {
            for ((w, x), y) in w.iter().zip(x.iter()).zip(y.iter()) {
                acc += w * (x - y);
            }
        }
        acc
    }
}

impl PhysicalData {
    /// Length of the flattened emission slab of one coarse timestep.
    pub fn slab_len(&self) -> usize {
        self.domain.species.len() * self.emis_lays * self.domain.rows * self.domain.cols
    }

    /// Cardinality of the unknown (whitened) space:
    /// `#icon + Σ_t rank(C_t) + #bcon`.
    pub fn n_unknowns(&self) -> usize {
        let icon = self.icon.as_ref().map_or(0, |i| i.len());
        let emis: usize = self.cov_emis.iter().map(|b| b.rank()).sum();
        icon + emis + self.bcon.len()
    }

    /// Validate every construction invariant and release the instance.
    ///
    /// Return
    /// ----------
    /// * `Ok(self)` if every construction invariant holds, otherwise the first violation as a
    ///   [`FourdvarError::Validation`] / [`FourdvarError::InvalidTimestep`] /
    ///   [`FourdvarError::CovarianceRank`].
    pub fn validated(self) -> Result<Self, FourdvarError> {
        self.domain.validate()?;
        let dom = &self.domain;
        let n_spc = dom.species.len();

        if self.emis_lays == 0 || self.emis_lays > dom.lays {
            return Err(FourdvarError::Validation(format!(
                "emission layer count {} outside 1..={}",
                self.emis_lays, dom.lays
            )));
        }
        if self.bcon_up_lay == 0 || self.bcon_up_lay > dom.lays {
            return Err(FourdvarError::Validation(format!(
                "bcon_up_lay {} outside 1..={}",
                self.bcon_up_lay, dom.lays
            )));
        }

        // Timestep rules (positive multiples of Δ, day alignment, run coverage).
        TimeGrid::new(dom, &self.tsec_emis)?;
        TimeGrid::new(dom, &self.tsec_bcon)?;

        let want_emis = (
            n_spc,
            self.tsec_emis.len(),
            self.emis_lays,
            dom.rows,
            dom.cols,
        );
        if self.emis.dim() != want_emis {
            return Err(FourdvarError::Validation(format!(
                "emission field has shape {:?}, expected {:?}",
                self.emis.dim(),
                want_emis
            )));
        }
        let want_bcon = (n_spc, self.tsec_bcon.len(), NUM_BCON_REGIONS);
        if self.bcon.dim() != want_bcon {
            return Err(FourdvarError::Validation(format!(
                "boundary-condition field has shape {:?}, expected {:?}",
                self.bcon.dim(),
                want_bcon
            )));
        }
        if self.bcon_unc.dim() != want_bcon {
            return Err(FourdvarError::Validation(
                "BCON uncertainty shape differs from the value field".into(),
            ));
        }
        if self.bcon_unc.iter().any(|&u| u <= 0.0) {
            return Err(FourdvarError::Validation(
                "BCON uncertainties must be strictly positive".into(),
            ));
        }

        match (&self.icon, &self.icon_unc) {
            (None, None) => {}
            (Some(v), Some(u)) => {
                if v.len() != n_spc || u.len() != n_spc {
                    return Err(FourdvarError::Validation(format!(
                        "ICON vectors have lengths {}/{}, expected {}",
                        v.len(),
                        u.len(),
                        n_spc
                    )));
                }
                if u.iter().any(|&x| x <= 0.0) {
                    return Err(FourdvarError::Validation(
                        "ICON uncertainties must be strictly positive".into(),
                    ));
                }
            }
            _ => {
                return Err(FourdvarError::Validation(
                    "ICON values and uncertainties must be provided together".into(),
                ));
            }
        }

        if self.cov_emis.len() != self.tsec_emis.len() {
            return Err(FourdvarError::Validation(format!(
                "{} covariance blocks for {} emission timesteps",
                self.cov_emis.len(),
                self.tsec_emis.len()
            )));
        }
        let slab = self.slab_len();
        for (t, block) in self.cov_emis.iter().enumerate() {
            if block.basis.ncols() != block.sval.len() {
                return Err(FourdvarError::CovarianceRank {
                    step: t,
                    basis: block.basis.ncols(),
                    sval: block.sval.len(),
                });
            }
            if block.rank() == 0 || block.basis.nrows() != slab {
                return Err(FourdvarError::Validation(format!(
                    "covariance basis at step {t} has {} rows / rank {}, slab length is {slab}",
                    block.basis.nrows(),
                    block.rank()
                )));
            }
            if block.sval.iter().any(|&s| s <= 0.0) {
                return Err(FourdvarError::Validation(format!(
                    "singular values at step {t} must be strictly positive"
                )));
            }
        }
        // Orthonormality of the basis columns is not checked here (it is O(n·r²));
        // the preconditioner self-test catches a non-orthonormal basis at run start.
        Ok(self)
    }

    /// Archive this object to a self-describing file (see [`crate::archive`]).
    pub fn archive(&self, path: &Utf8Path) -> Result<(), FourdvarError> {
        crate::archive::write_json(path, &PhysicalArchive::from_data(self))
    }

    /// Read an archived instance back; the result is re-validated.
    pub fn from_file(path: &Utf8Path) -> Result<Self, FourdvarError> {
        let raw: PhysicalArchive = crate::archive::read_json(path)?;
        raw.into_data()
    }

    /// A trivially valid single-species instance used by the consistency test suites.
    pub fn example() -> Self {
        let domain = DomainRecord::example();
        let slab = domain.rows * domain.cols; // 1 species, 1 layer
        let rank = 2;
        let mut basis = DMatrix::zeros(slab, rank);
        basis[(0, 0)] = 1.0;
        basis[(1, 1)] = 1.0;
        PhysicalData {
            emis_lays: 1,
            bcon_up_lay: 1,
            tsec_emis: vec![crate::constants::DAYSEC],
            tsec_bcon: vec![crate::constants::DAYSEC],
            emis: Array5::zeros((1, 1, 1, domain.rows, domain.cols)),
            bcon: Array3::zeros((1, 1, NUM_BCON_REGIONS)),
            bcon_unc: Array3::from_elem((1, 1, NUM_BCON_REGIONS), 1.0),
            icon: Some(Array1::from_elem(1, 1.0)),
            icon_unc: Some(Array1::from_elem(1, 1.0)),
            cov_emis: vec![CovBlock {
                basis,
                sval: DVector::from_element(rank, 1.0),
            }],
            domain,
        }
    }
}

/// On-disk form of [`PhysicalData`].
///
/// Per the archive contract, the variable per-timestep ranks are stored as an explicit
/// length vector and the factor arrays are padded to the maximum rank.
#[derive(Debug, Serialize, Deserialize)]
pub struct PhysicalArchive {
    pub format: String,
    pub domain: DomainRecord,
    pub emis_lays: usize,
    pub bcon_up_lay: usize,
    pub tsec_emis: Vec<u64>,
    pub tsec_bcon: Vec<u64>,
    pub emis: Array5<f64>,
    pub bcon: Array3<f64>,
    pub bcon_unc: Array3<f64>,
    pub icon: Option<Array1<f64>>,
    pub icon_unc: Option<Array1<f64>>,
    /// Rank of each covariance block, length `T_e`.
    pub ranks: Vec<usize>,
    /// Singular values, one row per timestep, padded with zeros to `max(ranks)`.
    pub sval: Vec<Vec<f64>>,
    /// Basis matrices, row-major `slab_len × max(ranks)` per timestep, zero-padded.
    pub basis: Vec<Vec<f64>>,
}

pub(crate) const PHYSICAL_FORMAT: &str = "fourdvar.physical.v1";

impl PhysicalArchive {
    pub fn from_data(data: &PhysicalData) -> Self {
        let max_rank = data.cov_emis.iter().map(CovBlock::rank).max().unwrap_or(0);
        let slab = data.slab_len();
        let mut ranks = Vec::new();
        let mut sval = Vec::new();
        let mut basis = Vec::new();
        for block in &data.cov_emis {
            ranks.push(block.rank());
            let mut s = vec![0.0; max_rank];
            s[..block.rank()].copy_from_slice(block.sval.as_slice());
            sval.push(s);
            let mut b = vec![0.0; slab * max_rank];
            for i in 0..slab {
                for j in 0..block.rank() {
                    b[i * max_rank + j] = block.basis[(i, j)];
                }
            }
            basis.push(b);
        }
        PhysicalArchive {
            format: PHYSICAL_FORMAT.to_string(),
            domain: data.domain.clone(),
            emis_lays: data.emis_lays,
            bcon_up_lay: data.bcon_up_lay,
            tsec_emis: data.tsec_emis.clone(),
            tsec_bcon: data.tsec_bcon.clone(),
            emis: data.emis.clone(),
            bcon: data.bcon.clone(),
            bcon_unc: data.bcon_unc.clone(),
            icon: data.icon.clone(),
            icon_unc: data.icon_unc.clone(),
            ranks,
            sval,
            basis,
        }
    }

    pub fn into_data(self) -> Result<PhysicalData, FourdvarError> {
        if self.format != PHYSICAL_FORMAT {
            return Err(FourdvarError::Archive(format!(
                "unrecognized physical archive format {:?}",
                self.format
            )));
        }
        let max_rank = self.ranks.iter().copied().max().unwrap_or(0);
        if self.sval.len() != self.ranks.len() || self.basis.len() != self.ranks.len() {
            return Err(FourdvarError::Archive(
                "covariance factor arrays disagree with the rank vector".into(),
            ));
        }
        let mut cov_emis = Vec::with_capacity(self.ranks.len());
        let slab = {
            let (s, _, l, r, c) = self.emis.dim();
            s * l * r * c
        };
        for ((rank, s), b) in self.ranks.iter().zip(&self.sval).zip(&self.basis) {
            if s.len() != max_rank || b.len() != slab * max_rank {
                return Err(FourdvarError::Archive(
                    "padded covariance factor has unexpected length".into(),
                ));
            }
            let sval = DVector::from_iterator(*rank, s[..*rank].iter().copied());
            let basis =
                DMatrix::from_fn(slab, *rank, |i, j| b[i * max_rank + j]);
            cov_emis.push(CovBlock { basis, sval });
        }
        PhysicalData {
            domain: self.domain,
            emis_lays: self.emis_lays,
            bcon_up_lay: self.bcon_up_lay,
            tsec_emis: self.tsec_emis,
            tsec_bcon: self.tsec_bcon,
            emis: self.emis,
            bcon: self.bcon,
            bcon_unc: self.bcon_unc,
            icon: self.icon,
            icon_unc: self.icon_unc,
            cov_emis,
        }
        .validated()
    }
}
