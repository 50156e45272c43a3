mod common;

use nalgebra::{DMatrix, DVector};
use ndarray::Array5;

use fourdvar::data::domain::Coord6;
use fourdvar::data::model_io::ModelInputData;
use fourdvar::data::observation::ObservationData;
use fourdvar::data::physical::{CovBlock, PhysicalData};

use common::scratch;

#[test]
fn physical_archive_survives_the_disk_with_variable_ranks() {
    let dir = scratch("arc_phys");
    let mut phys = PhysicalData::example();
    phys.tsec_emis = vec![43_200, 43_200];
    phys.emis = Array5::zeros((1, 2, 1, 10, 10));
    phys.emis[[0, 1, 0, 4, 6]] = -3.25;
    let mut wide = DMatrix::zeros(100, 3);
    wide[(10, 0)] = 1.0;
    wide[(11, 1)] = 1.0;
    wide[(12, 2)] = 1.0;
    phys.cov_emis = vec![
        phys.cov_emis[0].clone(),
        CovBlock { basis: wide, sval: DVector::from_vec(vec![4.0, 2.0, 0.25]) },
    ];
    let phys = phys.validated().unwrap();

    let path = dir.join("prior.json");
    phys.archive(&path).unwrap();
    let back = PhysicalData::from_file(&path).unwrap();
    assert_eq!(back, phys);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn observation_archive_keeps_offsets_and_metadata() {
    let dir = scratch("arc_obs");
    let mut obs = ObservationData::example();
    obs.records[0].offset_term = 0.75;
    obs.records[0].lite_coord =
        Some(Coord6 { day: 0, step: 23, lay: 0, row: 5, col: 5, spc: 0 });
    obs.records[0]
        .metadata
        .insert("sounding_id".into(), serde_json::json!(20150601123456u64));
    obs.records[0]
        .metadata
        .insert("surface_type".into(), serde_json::json!("land"));

    let path = dir.join("observations.json");
    obs.archive(&path).unwrap();
    let back = ObservationData::from_file(&path).unwrap();
    assert_eq!(back, obs);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn model_input_archive_drops_the_working_directory() {
    let dir = scratch("arc_input");
    let mut input = ModelInputData::example();
    input.emis[0][[0, 3, 0, 1, 2]] = 42.0;
    input.bcon[0][[0, 3, 5]] = -1.5;
    input.attach_workdir(dir.join("workdir"));
    std::fs::create_dir_all(dir.join("workdir")).unwrap();

    let path = dir.join("input.json");
    input.archive(&path).unwrap();
    let back = ModelInputData::from_file(&path).unwrap();
    // The payload round-trips; the working directory is runtime state and stays behind.
    assert!(back.workdir().is_none());
    input.cleanup().unwrap();
    assert_eq!(back, input);
    std::fs::remove_dir_all(&dir).unwrap();
}
