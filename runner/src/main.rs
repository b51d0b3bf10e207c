use clap::{Parser, Subcommand};
use fluxdist_runner::{
    batch::{palm, BatchError},
    config::{installed_solvers, ConfigErrors, PoolConfig, RunConfig},
    executors::{serve, WorkerError},
    orchestrator::{Orchestrator, OrchestratorError},
    partition::Strategy,
    pool::{PoolError, WorkerPool},
    results::persist,
    solver::exec::ExecSolver,
    store::{load_model, StoreError},
};
use std::{
    error::Error as _,
    io,
    path::{Path, PathBuf},
    process::ExitCode,
};
use thiserror::Error;
use tracing::{error, info, Level};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

#[derive(Parser)]
#[command(name = "fluxdist", version, about = "Distributed flux balance and flux variability analysis")]
struct Cli {
    /// log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a distributed FBA/ FVA as described by a YAML run file
    Run {
        config: PathBuf,
        /// override the number of local workers
        #[arg(short, long)]
        workers: Option<usize>,
        /// override the partition strategy (0, 1 or 2)
        #[arg(short, long)]
        strategy: Option<u8>,
    },
    /// Solve one block read from stdin and write the results to stdout
    Worker,
    /// Run a script over every model of a directory
    Palm {
        dir: PathBuf,
        #[arg(long)]
        script: PathBuf,
        /// variable to collect from the script output, repeatable
        #[arg(long = "var")]
        variables: Vec<String>,
        /// pool description (YAML), either a run file or a bare `pool` section
        #[arg(long)]
        pool: Option<PathBuf>,
        /// number of sessions, every worker of the pool by default
        #[arg(long)]
        sessions: Option<usize>,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value = "*")]
        glob: String,
    },
    /// List the solver executables found on PATH
    Check,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Run(#[from] OrchestratorError),
    #[error("Failed to save results")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Batch(#[from] BatchError),
}

fn run(config: &Path, workers: Option<usize>, strategy: Option<u8>) -> Result<(), CliError> {
    let mut config = RunConfig::load(config)?;

    if let Some(workers) = workers {
        config.pool.local = workers;
    }
    if let Some(strategy) = strategy {
        config.analysis.strategy = Strategy::try_from(strategy).map_err(ConfigErrors::from)?;
    }

    if config.preflight_checks() {
        return Err(ConfigErrors::Preflight.into());
    }

    let model = load_model(
        &config.model.path,
        &config.model.matrix,
        &config.model.name,
        &config.model.fields,
    )
    .map_err(ConfigErrors::from)?;
    info!(
        reactions = model.reactions(),
        metabolites = model.metabolites(),
        "Loaded model {}",
        config.model.name
    );

    let pool = WorkerPool::acquire(&config.pool)?;
    let result = Orchestrator::new(&pool, ExecSolver::new(config.solver.clone()))
        .distributed_fba(&model, &config.analysis);
    pool.release();
    let result = result?;

    if let Some(output) = config.output.as_ref() {
        persist(&result, &output.path, &output.fields)?;
    }

    println!("{}", result.summarize());

    Ok(())
}

fn run_palm(
    dir: &Path,
    script: &Path,
    variables: &[String],
    pool: Option<&Path>,
    sessions: Option<usize>,
    output: &Path,
    glob: &str,
) -> Result<(), CliError> {
    let config = match pool {
        Some(path) => PoolConfig::load(path)?,
        None => PoolConfig::default(),
    };

    let pool = WorkerPool::acquire(&config)?;
    let sessions = sessions.unwrap_or(pool.size());
    let table = palm(&pool, dir, glob, script, variables, sessions, output);
    pool.release();

    let table = table?;
    info!(rows = table.rows.len(), "Finished PALM");

    Ok(())
}

fn check() {
    let solvers = installed_solvers();

    if solvers.is_empty() {
        println!("No known solver executable found on PATH");
    }
    for (name, path) in solvers {
        println!("{name:<10} {}", path.display());
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    // stdout carries results (and the block protocol for `worker`), logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::from_level(default_level).into())
                .from_env_lossy(),
        )
        .with_writer(io::stderr)
        .init();

    let outcome = match cli.command {
        Commands::Run {
            config,
            workers,
            strategy,
        } => run(&config, workers, strategy),
        Commands::Worker => serve(io::stdin().lock(), io::stdout().lock()).map_err(CliError::from),
        Commands::Palm {
            dir,
            script,
            variables,
            pool,
            sessions,
            output,
            glob,
        } => run_palm(
            &dir,
            &script,
            &variables,
            pool.as_deref(),
            sessions,
            &output,
            &glob,
        ),
        Commands::Check => {
            check();
            Ok(())
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            let mut source = e.source();
            while let Some(cause) = source {
                error!("  caused by: {cause}");
                source = cause.source();
            }

            ExitCode::FAILURE
        }
    }
}
