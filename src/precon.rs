//! # Preconditioner
//!
//! Bi-directional map between **physical** space and the **unknown** (whitened) space.
//! The preconditioner is the square root of the prior error covariance: with `x` unknown
//! and `p` physical, `p − p_prior = √C · x`, which turns the prior term of the cost into
//! `½‖x‖²` and flattens the optimization landscape.
//!
//! The walk order over the unknown vector is fixed:
//!
//! 1. **ICON** scalars, multiplied by the per-species uncertainty;
//! 2. per emission timestep `t`, `rank(C_t)` coefficients: `√C_t · v = V_t · (λ_t ⊙ v)`,
//!    the result reshaped into `(species, layer, row, col)` and deposited at row `t`;
//! 3. **BCON** entries, multiplied by the BCON uncertainty.
//!
//! Whitening is the exact dual (`x_t = (V_tᵀ · u) ⊘ λ_t`), and the gradient transform
//! [`Preconditioner::whiten_adjoint`] is the transpose `√C_tᵀ · u = λ_t ⊙ (V_tᵀ · u)`.
//!
//! [`Preconditioner::self_check`] verifies the round-trip and adjoint identities on
//! deterministic vectors; a failure is fatal (exit code 3) — it indicates a covariance
//! factorization whose basis is not orthonormal, or mismatched bookkeeping.
//!
//! ## See also
//! ------------
//! * [`crate::data::physical::CovBlock`] – The per-timestep low-rank factors.
//! * [`crate::variational`] – Runs the self-check before the first evaluation.

use nalgebra::DVector;
use ndarray::Array1;

use crate::constants::{PRECON_ADJOINT_TOL, PRECON_ROUND_TRIP_TOL};
use crate::data::physical::{PhysicalAdjoint, PhysicalData};
use crate::data::unknown::UnknownData;
use crate::errors::FourdvarError;

/// Square-root prior covariance transform anchored at a validated prior.
#[derive(Debug, Clone)]
pub struct Preconditioner {
    prior: PhysicalData,
}

impl Preconditioner {
    pub fn new(prior: PhysicalData) -> Result<Self, FourdvarError> {
        let prior = prior.validated()?;
        Ok(Preconditioner { prior })
    }

    pub fn prior(&self) -> &PhysicalData {
        &self.prior
    }

    pub fn n_unknowns(&self) -> usize {
        self.prior.n_unknowns()
    }

    fn check_len(&self, len: usize) -> Result<(), FourdvarError> {
        if len != self.n_unknowns() {
            return Err(FourdvarError::Validation(format!(
                "unknown vector has {len} entries, preconditioner expects {}",
                self.n_unknowns()
            )));
        }
        Ok(())
    }

    /// Map an unknown vector to physical space: `p = p_prior + √C · x`.
    pub fn unwhiten(&self, x: &UnknownData) -> Result<PhysicalData, FourdvarError> {
        self.check_len(x.len())?;
        let mut phys = self.prior.clone();
        let xs = &x.0;
        let mut pos = 0;

        if let (Some(icon), Some(unc)) = (phys.icon.as_mut(), self.prior.icon_unc.as_ref()) {
            for (s, v) in icon.iter_mut().enumerate() {
                *v += xs[pos] * unc[s];
                pos += 1;
            }
        }

        let (_, _, lays, rows, cols) = phys.emis.dim();
        for (t, block) in self.prior.cov_emis.iter().enumerate() {
            let rank = block.rank();
            let mut coeff =
                DVector::from_iterator(rank, (pos..pos + rank).map(|i| xs[i]));
            pos += rank;
            coeff.component_mul_assign(&block.sval);
            let slab = &block.basis * coeff;
            let mut i = 0;
            for s in 0..phys.domain.species.len() {
                for l in 0..lays {
                    for r in 0..rows {
                        for c in 0..cols {
                            phys.emis[[s, t, l, r, c]] += slab[i];
                            i += 1;
                        }
                    }
                }
            }
        }

        for (b, u) in phys.bcon.iter_mut().zip(self.prior.bcon_unc.iter()) {
            *b += xs[pos] * u;
            pos += 1;
        }
        debug_assert_eq!(pos, xs.len());
        Ok(phys)
    }

    /// Flattened emission difference `phys − prior` at coarse step `t`,
    /// flatten order `(species, layer, row, col)`.
    fn slab_diff(&self, phys: &PhysicalData, t: usize) -> DVector<f64> {
        let (n_spc, _, lays, rows, cols) = phys.emis.dim();
        DVector::from_iterator(
            n_spc * lays * rows * cols,
            itertools::iproduct!(0..n_spc, 0..lays, 0..rows, 0..cols).map(|(s, l, r, c)| {
                phys.emis[[s, t, l, r, c]] - self.prior.emis[[s, t, l, r, c]]
            }),
        )
    }

    /// Map a physical vector to unknown space: `x = √C⁻¹ · (p − p_prior)`.
    ///
    /// The inverse square root is taken in the range of the low-rank factors:
    /// `x_t = (V_tᵀ · u) ⊘ λ_t`.
    pub fn whiten(&self, phys: &PhysicalData) -> Result<UnknownData, FourdvarError> {
        if phys.emis.dim() != self.prior.emis.dim() || phys.bcon.dim() != self.prior.bcon.dim() {
            return Err(FourdvarError::Validation(
                "physical field shapes differ from the prior".into(),
            ));
        }
        if phys.icon.as_ref().map(|i| i.len()) != self.prior.icon.as_ref().map(|i| i.len()) {
            return Err(FourdvarError::Validation(
                "physical ICON cardinality differs from the prior".into(),
            ));
        }
        let mut out = Vec::with_capacity(self.n_unknowns());

        if let (Some(icon), Some(prior), Some(unc)) = (
            phys.icon.as_ref(),
            self.prior.icon.as_ref(),
            self.prior.icon_unc.as_ref(),
        ) {
            for s in 0..icon.len() {
                out.push((icon[s] - prior[s]) / unc[s]);
            }
        }

        for (t, block) in self.prior.cov_emis.iter().enumerate() {
            let u = self.slab_diff(phys, t);
            let proj = block.basis.tr_mul(&u);
            for (v, lam) in proj.iter().zip(block.sval.iter()) {
                out.push(v / lam);
            }
        }

        for ((b, p), u) in phys
            .bcon
            .iter()
            .zip(self.prior.bcon.iter())
            .zip(self.prior.bcon_unc.iter())
        {
            out.push((b - p) / u);
        }

        let x = UnknownData(Array1::from_vec(out));
        self.check_len(x.len())?;
        Ok(x)
    }

    /// Gradient transform: `√Cᵀ` applied to a physical-space adjoint.
    ///
    /// This is the transpose of [`unwhiten`](Self::unwhiten) (without the prior shift):
    /// ICON/BCON adjoints multiply by their uncertainties, emission slabs map through
    /// `λ_t ⊙ (V_tᵀ · u)`.
    pub fn whiten_adjoint(&self, adj: &PhysicalAdjoint) -> Result<UnknownData, FourdvarError> {
        let mut out = Vec::with_capacity(self.n_unknowns());

        if let (Some(a), Some(unc)) = (adj.icon.as_ref(), self.prior.icon_unc.as_ref()) {
            if a.len() != unc.len() {
                return Err(FourdvarError::Validation(
                    "adjoint ICON length differs from the prior".into(),
                ));
            }
            for s in 0..a.len() {
                out.push(a[s] * unc[s]);
            }
        }

        if adj.emis.dim() != self.prior.emis.dim() {
            return Err(FourdvarError::Validation(
                "adjoint emission shape differs from the prior".into(),
            ));
        }
        let (n_spc, _, lays, rows, cols) = adj.emis.dim();
        for (t, block) in self.prior.cov_emis.iter().enumerate() {
            let u = DVector::from_iterator(
                n_spc * lays * rows * cols,
                itertools::iproduct!(0..n_spc, 0..lays, 0..rows, 0..cols)
                    .map(|(s, l, r, c)| adj.emis[[s, t, l, r, c]]),
            );
            let proj = block.basis.tr_mul(&u);
            for (v, lam) in proj.iter().zip(block.sval.iter()) {
                out.push(v * lam);
            }
        }

        for (a, u) in adj.bcon.iter().zip(self.prior.bcon_unc.iter()) {
            out.push(a * u);
        }

        let x = UnknownData(Array1::from_vec(out));
        self.check_len(x.len())?;
        Ok(x)
    }

    /// Deterministic round-trip and adjoint-consistency check.
    ///
    /// Return
    /// ----------
    /// * `Ok(())`, or [`FourdvarError::PreconditionerInconsistent`] if either identity
    ///   fails beyond tolerance (`1e-10` round-trip, `1e-9` adjoint).
    pub fn self_check(&self) -> Result<(), FourdvarError> {
        let n = self.n_unknowns();
        let x = UnknownData(Array1::from_iter(
            (0..n).map(|i| (0.7 * i as f64 + 0.3).sin() + 0.1),
        ));
        let phys = self.unwhiten(&x)?;
        let back = self.whiten(&phys)?;
        let num = (&back.0 - &x.0).mapv(f64::abs).sum();
        let den = x.0.mapv(f64::abs).sum().max(1e-300);
        if num / den > PRECON_ROUND_TRIP_TOL {
            return Err(FourdvarError::PreconditionerInconsistent(format!(
                "whiten(unwhiten(x)) deviates by relative {:.3e}",
                num / den
            )));
        }

        let mut adj = PhysicalAdjoint::zeros_like(&self.prior);
        for (i, v) in adj.emis.iter_mut().enumerate() {
            *v = (0.13 * i as f64).cos();
        }
        for (i, v) in adj.bcon.iter_mut().enumerate() {
            *v = (0.41 * i as f64 + 1.0).sin();
        }
        if let Some(icon) = adj.icon.as_mut() {
            for (i, v) in icon.iter_mut().enumerate() {
                *v = 0.5 + i as f64;
            }
        }
        let lhs = adj.dot_diff(&phys, &self.prior);
        let rhs = self.whiten_adjoint(&adj)?.0.dot(&x.0);
        let scale = lhs.abs().max(rhs.abs()).max(1e-300);
        if (lhs - rhs).abs() / scale > PRECON_ADJOINT_TOL {
            return Err(FourdvarError::PreconditionerInconsistent(format!(
                "adjoint identity deviates: <p_adj, sqrtC x> = {lhs:.12e} vs <sqrtC^T p_adj, x> = {rhs:.12e}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::domain::DomainRecord;
    use crate::data::physical::CovBlock;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;
    use ndarray::{Array3, Array5};

    /// Rank-3 factorization over a 3×4 single-layer grid (slab length 12),
    /// orthonormal basis, λ = [2, 1, 0.5]. No ICON block.
    fn low_rank_prior() -> PhysicalData {
        let mut domain = DomainRecord::example();
        domain.rows = 3;
        domain.cols = 4;
        let mut basis = DMatrix::zeros(12, 3);
        // Orthonormal columns spread over several cells.
        let h = 0.5_f64.sqrt();
        basis[(0, 0)] = h;
        basis[(5, 0)] = h;
        basis[(1, 1)] = h;
        basis[(6, 1)] = -h;
        basis[(11, 2)] = 1.0;
        PhysicalData {
            emis_lays: 1,
            bcon_up_lay: 1,
            tsec_emis: vec![crate::constants::DAYSEC],
            tsec_bcon: vec![crate::constants::DAYSEC],
            emis: Array5::zeros((1, 1, 1, 3, 4)),
            bcon: Array3::zeros((1, 1, 8)),
            bcon_unc: Array3::from_elem((1, 1, 8), 2.5),
            icon: None,
            icon_unc: None,
            cov_emis: vec![CovBlock {
                basis,
                sval: nalgebra::DVector::from_vec(vec![2.0, 1.0, 0.5]),
            }],
            domain,
        }
    }

    #[test]
    fn unwhitening_combines_scaled_basis_columns() {
        let prior = low_rank_prior();
        let basis = prior.cov_emis[0].basis.clone();
        let pre = Preconditioner::new(prior).unwrap();
        let mut x = UnknownData::zeros(pre.n_unknowns());
        x.0[0] = 1.0;
        x.0[1] = 1.0;
        x.0[2] = 1.0;
        let phys = pre.unwhiten(&x).unwrap();
        for r in 0..3 {
            for c in 0..4 {
                let i = r * 4 + c;
                let want = 2.0 * basis[(i, 0)] + basis[(i, 1)] + 0.5 * basis[(i, 2)];
                assert_relative_eq!(phys.emis[[0, 0, 0, r, c]], want, epsilon = 1e-14);
            }
        }
        // Whitening the result recovers (1, 1, 1, 0, ..., 0).
        let back = pre.whiten(&phys).unwrap();
        assert_relative_eq!(back.0[0], 1.0, max_relative = 1e-12);
        assert_relative_eq!(back.0[1], 1.0, max_relative = 1e-12);
        assert_relative_eq!(back.0[2], 1.0, max_relative = 1e-12);
        for i in 3..back.len() {
            assert_relative_eq!(back.0[i], 0.0, epsilon = 1e-14);
        }
    }

    #[test]
    fn bcon_entries_scale_by_their_uncertainty() {
        let pre = Preconditioner::new(low_rank_prior()).unwrap();
        let mut x = UnknownData::zeros(pre.n_unknowns());
        x.0[3] = 2.0; // first BCON entry
        let phys = pre.unwhiten(&x).unwrap();
        assert_relative_eq!(phys.bcon[[0, 0, 0]], 5.0);
        assert_relative_eq!(pre.whiten(&phys).unwrap().0[3], 2.0, max_relative = 1e-12);
    }

    #[test]
    fn self_check_passes_for_consistent_factors() {
        Preconditioner::new(low_rank_prior()).unwrap().self_check().unwrap();
        Preconditioner::new(PhysicalData::example())
            .unwrap()
            .self_check()
            .unwrap();
    }

    #[test]
    fn self_check_detects_a_non_orthonormal_basis() {
        let mut prior = low_rank_prior();
        prior.cov_emis[0].basis[(0, 0)] = 1.7;
        let pre = Preconditioner::new(prior).unwrap();
        assert!(matches!(
            pre.self_check(),
            Err(FourdvarError::PreconditionerInconsistent(_))
        ));
    }

    #[test]
    fn adjoint_identity_holds_with_icon_present() {
        let pre = Preconditioner::new(PhysicalData::example()).unwrap();
        let x = UnknownData(Array1::from_iter((0..pre.n_unknowns()).map(|i| i as f64 * 0.1 - 0.4)));
        let phys = pre.unwhiten(&x).unwrap();

        let mut adj = PhysicalAdjoint::zeros_like(pre.prior());
        for (i, v) in adj.emis.iter_mut().enumerate() {
            *v = ((i % 7) as f64) - 3.0;
        }
        adj.icon = Some(Array1::from_elem(1, 2.0));
        for (i, v) in adj.bcon.iter_mut().enumerate() {
            *v = i as f64 * 0.25;
        }
        let lhs = adj.dot_diff(&phys, pre.prior());
        let rhs = pre.whiten_adjoint(&adj).unwrap().0.dot(&x.0);
        assert_relative_eq!(lhs, rhs, max_relative = 1e-9);
    }

    #[test]
    fn wrong_cardinality_is_rejected() {
        let pre = Preconditioner::new(PhysicalData::example()).unwrap();
        let x = UnknownData::zeros(pre.n_unknowns() + 1);
        assert!(pre.unwhiten(&x).is_err());
    }

    #[test]
    fn whitening_a_mismatched_physical_vector_is_an_error_not_a_panic() {
        let pre = Preconditioner::new(low_rank_prior()).unwrap();
        let mut phys = low_rank_prior();
        // One extra coarse emission step relative to the prior the factors belong to.
        phys.tsec_emis = vec![crate::constants::DAYSEC / 2; 2];
        phys.emis = Array5::zeros((1, 2, 1, 3, 4));
        assert!(matches!(
            pre.whiten(&phys),
            Err(FourdvarError::Validation(_))
        ));
    }
}
