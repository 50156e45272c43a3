mod common;

use approx::{assert_abs_diff_eq, assert_relative_eq};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use fourdvar::constants::MODEL_DOT_PRODUCT_TOL;
use fourdvar::data::domain::Coord6;
use fourdvar::data::model_io::AdjointForcingData;
use fourdvar::model::emulator::EmulatorDriver;
use fourdvar::model::{map_sense, prepare_input, ModelDriver};
use fourdvar::time_grid::TimeGrid;
use fourdvar::variational::{RestartMode, VariationalLoop};

use common::{emulator_context, flux_units, identity_prior, point_obs, scratch, TEST_GAIN};

fn observed_cell() -> Coord6 {
    Coord6 { day: 0, step: 23, lay: 0, row: 5, col: 5, spc: 0 }
}

#[test]
fn gradient_points_into_the_observed_cell_only() {
    let ctx = emulator_context(
        identity_prior(),
        vec![point_obs(observed_cell(), 1.0, 0.1)],
        30,
    );
    let x0 = ctx.initial_unknown();
    let grad = ctx.gradient(&x0).unwrap();

    // Unknown walk order: 100 emission coefficients (identity basis), then 8 BCON.
    let observed_unknown = 5 * 10 + 5;
    assert!(grad[observed_unknown] < 0.0);
    for (i, g) in grad.iter().enumerate() {
        if i != observed_unknown {
            assert_abs_diff_eq!(*g, 0.0, epsilon = 1e-12);
        }
    }
}

#[test]
fn minimization_recovers_a_positive_emission_at_the_observed_cell() {
    let dir = scratch("scenario_a");
    let ctx = emulator_context(
        identity_prior(),
        vec![point_obs(observed_cell(), 1.0, 0.1)],
        30,
    );
    let outcome = VariationalLoop::new(ctx, dir.clone())
        .run(RestartMode::Fresh)
        .unwrap();

    assert!(outcome.best_cost < 0.5, "best cost {}", outcome.best_cost);
    assert!(outcome.posterior.emis[[0, 0, 0, 5, 5]] > 0.0);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn full_chain_dot_product_identity_holds_on_random_fields() {
    // <Fwd(Prep(p)), f> == <p, MapSense(Adj(f))> across the whole model seam.
    let prior = identity_prior();
    let units = flux_units(&prior);
    let emis_grid = TimeGrid::new(&prior.domain, &prior.tsec_emis).unwrap();
    let bcon_grid = TimeGrid::new(&prior.domain, &prior.tsec_bcon).unwrap();
    let driver = EmulatorDriver::new(prior.domain.clone(), prior.emis_lays, TEST_GAIN);

    let mut rng = StdRng::seed_from_u64(7);
    let normal = Normal::new(0.0, 1.0).unwrap();

    let mut phys = prior.clone();
    for v in phys.emis.iter_mut() {
        *v = normal.sample(&mut rng);
    }
    let input = prepare_input(&phys, &emis_grid, &bcon_grid, &units).unwrap();
    let output = driver.run_fwd(&input).unwrap();

    let mut forcing = AdjointForcingData::zeros(&prior.domain);
    for v in forcing.forcing[0].iter_mut() {
        *v = normal.sample(&mut rng);
    }
    let sense = driver.run_adj(&input, &forcing).unwrap();
    let adj = map_sense(&sense, &phys, &emis_grid, &bcon_grid, &units).unwrap();

    let lhs = output.dot_forcing(&forcing);
    let mut zero = prior.clone();
    zero.emis.fill(0.0);
    let rhs = adj.dot_diff(&phys, &zero);
    assert_relative_eq!(lhs, rhs, max_relative = MODEL_DOT_PRODUCT_TOL);
}
