// Each integration test binary pulls a different subset of these fixtures.
#![allow(dead_code)]

use std::collections::HashMap;

use camino::Utf8PathBuf;
use nalgebra::{DMatrix, DVector};
use ndarray::{Array3, Array5};

use fourdvar::config::MinimizerConfig;
use fourdvar::constants::{DAYSEC, NUM_BCON_REGIONS};
use fourdvar::context::AssimilationContext;
use fourdvar::data::domain::{Coord6, DomainRecord};
use fourdvar::data::observation::{ObsRecord, ObservationData, WeightGrid};
use fourdvar::data::physical::{CovBlock, PhysicalData};
use fourdvar::model::emulator::EmulatorDriver;
use fourdvar::model::units::{EmissionKind, UnitConverter};

/// Emulator gain giving an observation operator of order one on the example grid.
pub const TEST_GAIN: f64 = 1e-10;

pub fn scratch(tag: &str) -> Utf8PathBuf {
    let dir = Utf8PathBuf::from(format!(
        "{}/fourdvar_it_{tag}_{}",
        std::env::temp_dir().display(),
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Zero-emission prior on the 10×10 example domain with an identity (full-rank, unit)
/// emission covariance, no initial-condition block, unit BCON uncertainties.
pub fn identity_prior() -> PhysicalData {
    let domain = DomainRecord::example();
    let slab = domain.rows * domain.cols;
    PhysicalData {
        emis_lays: 1,
        bcon_up_lay: 1,
        tsec_emis: vec![DAYSEC],
        tsec_bcon: vec![DAYSEC],
        emis: Array5::zeros((1, 1, 1, domain.rows, domain.cols)),
        bcon: Array3::zeros((1, 1, NUM_BCON_REGIONS)),
        bcon_unc: Array3::from_elem((1, 1, NUM_BCON_REGIONS), 1.0),
        icon: None,
        icon_unc: None,
        cov_emis: vec![CovBlock {
            basis: DMatrix::identity(slab, slab),
            sval: DVector::from_element(slab, 1.0),
        }],
        domain,
    }
}

pub fn point_obs(coord: Coord6, value: f64, sigma: f64) -> ObsRecord {
    ObsRecord {
        value,
        uncertainty: sigma,
        weight_grid: WeightGrid::from_iter([(coord, 1.0)]),
        offset_term: 0.0,
        lite_coord: Some(coord),
        metadata: HashMap::new(),
    }
}

pub fn flux_units(prior: &PhysicalData) -> UnitConverter {
    UnitConverter::new(
        prior.domain.clone(),
        prior.emis_lays,
        prior.bcon_up_lay,
        EmissionKind::Flux,
        None,
        None,
        None,
    )
    .unwrap()
}

pub fn emulator_context(
    prior: PhysicalData,
    records: Vec<ObsRecord>,
    maxiter: u64,
) -> AssimilationContext {
    let obs = ObservationData { domain: prior.domain.clone(), records };
    let units = flux_units(&prior);
    let driver = Box::new(EmulatorDriver::new(
        prior.domain.clone(),
        prior.emis_lays,
        TEST_GAIN,
    ));
    let minimizer = MinimizerConfig { maxiter, ..MinimizerConfig::default() };
    AssimilationContext::new(prior, obs, units, driver, minimizer).unwrap()
}
