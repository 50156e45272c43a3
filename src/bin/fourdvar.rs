//! Command-line entry point: `fourdvar run` / `fourdvar restart`.
//!
//! Exit codes: 0 success, 1 configuration/validation problem, 2 external model failure,
//! 3 preconditioner inconsistency. Logging verbosity is controlled by `RUST_LOG`.

use camino::Utf8PathBuf;
use log::{error, info};
use structopt::StructOpt;

use fourdvar::archive::prepare_archive_dir;
use fourdvar::config::RunConfig;
use fourdvar::context::AssimilationContext;
use fourdvar::errors::FourdvarError;
use fourdvar::variational::{RestartMode, VariationalLoop};

#[derive(Debug, StructOpt)]
#[structopt(name = "fourdvar", about = "4D-Var assimilation of atmospheric trace species")]
struct Opt {
    /// Run configuration file.
    #[structopt(short, long, default_value = "fourdvar.json", parse(from_str))]
    config: Utf8PathBuf,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Start a fresh assimilation run.
    Run,
    /// Resume or cold-restart a previous run in the existing archive directory.
    Restart {
        /// Resume exactly from the last checkpoint.
        #[structopt(long, conflicts_with = "iter")]
        last: bool,
        /// Cold-start from the archived iterate K.
        #[structopt(long)]
        iter: Option<u64>,
    },
}

fn execute(opt: Opt) -> Result<(), FourdvarError> {
    let config = RunConfig::from_file(&opt.config)?;

    let mode = match opt.command {
        Command::Run => RestartMode::Fresh,
        Command::Restart { last: true, .. } => RestartMode::Last,
        Command::Restart { iter: Some(k), .. } => RestartMode::Iter(k),
        Command::Restart { .. } => {
            return Err(FourdvarError::Config(
                "restart requires --last or --iter K".into(),
            ));
        }
    };

    // A fresh run prepares the archive directory; restarts must find it in place.
    let archive = match mode {
        RestartMode::Fresh => prepare_archive_dir(
            &config.archive_path(),
            config.overwrite_archive,
            &config.name_ext,
            &config.description,
        )?,
        _ => {
            let dir = config.archive_path();
            if !dir.is_dir() {
                return Err(FourdvarError::Config(format!(
                    "no archive directory to restart in at {dir}"
                )));
            }
            dir
        }
    };
    info!("archive directory: {archive}");

    let ctx = AssimilationContext::from_config(&config)?;
    let outcome = VariationalLoop::new(ctx, archive).run(mode)?;
    println!(
        "converged after {} iterations: best cost {:.8e} ({})",
        outcome.iterations, outcome.best_cost, outcome.termination
    );
    Ok(())
}

fn main() {
    env_logger::init();
    let opt = Opt::from_args();
    if let Err(e) = execute(opt) {
        error!("{e}");
        eprintln!("fourdvar: {e}");
        std::process::exit(e.exit_code());
    }
}
