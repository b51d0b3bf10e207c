use crate::{
    baseline::{pre_fba, Baseline},
    config::{AnalysisConfig, ConfigErrors},
    executors::Executors,
    model::{Model, ModelError},
    partition::PartitionError,
    pool::WorkerPool,
    results::{AggregatedResult, BlockFailure, ResultSink, RunInfo},
    solver::Solver,
    task::BlockJob,
};
use rayon::prelude::*;
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid analysis configuration")]
    Config(#[from] ConfigErrors),
    #[error("Invalid model")]
    Model(#[from] ModelError),
    #[error("Failed to partition the tasks")]
    Partition(#[from] PartitionError),
    #[error("No workers available")]
    NoWorkers,
}

/// Phases of a distributed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Configuring,
    PreSolving,
    Partitioning,
    Dispatching,
    Gathering,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
struct StateMachine {
    history: Vec<RunState>,
}

impl StateMachine {
    fn new() -> Self {
        Self {
            history: vec![RunState::Idle],
        }
    }

    fn current(&self) -> RunState {
        self.history.last().copied().unwrap_or(RunState::Idle)
    }

    fn transition(&mut self, next: RunState) {
        info!(from = %self.current(), to = %next, "Run state changed");
        self.history.push(next);
    }
}

/// Drives one distributed FBA/ FVA run over a provisioned worker pool
#[derive(Debug)]
pub struct Orchestrator<'p, S: Solver> {
    pool: &'p WorkerPool,
    solver: S,
    machine: StateMachine,
}

impl<'p, S: Solver> Orchestrator<'p, S> {
    pub fn new(pool: &'p WorkerPool, solver: S) -> Self {
        Self {
            pool,
            solver,
            machine: StateMachine::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.machine.current()
    }

    /// every state the orchestrator went through, starting with `Idle`
    pub fn history(&self) -> &[RunState] {
        &self.machine.history
    }

    /// Solve the min and/ or max flux of every listed reaction of `model`.
    ///
    /// Blocks whose worker can't be reached are reported as [`BlockFailure`]s in
    /// the result, their reactions keep the "not run" sentinel.
    #[instrument(skip_all, fields(workers = self.pool.size(), strategy = %analysis.strategy))]
    pub fn distributed_fba(
        &mut self,
        model: &Model,
        analysis: &AnalysisConfig,
    ) -> Result<AggregatedResult, OrchestratorError> {
        let start = Instant::now();
        self.machine = StateMachine::new();
        self.machine.transition(RunState::Configuring);

        match self.run(model, analysis, start) {
            Ok(result) => {
                self.machine.transition(RunState::Done);
                info!(
                    failed_blocks = result.failures.len(),
                    "Finished distributed run in {:.3}s",
                    result.info.elapsed.as_secs_f64()
                );

                Ok(result)
            }
            Err(e) => {
                error!("Distributed run failed: {e}");
                self.machine.transition(RunState::Failed);

                Err(e)
            }
        }
    }

    fn run(
        &mut self,
        model: &Model,
        analysis: &AnalysisConfig,
        start: Instant,
    ) -> Result<AggregatedResult, OrchestratorError> {
        let Self {
            pool,
            solver,
            machine,
        } = self;

        model.validate()?;
        let plan = analysis.plan(model)?;
        if pool.size() == 0 {
            return Err(OrchestratorError::NoWorkers);
        }

        let baseline = if analysis.pre_fba {
            machine.transition(RunState::PreSolving);
            pre_fba(model, solver, analysis.opt_percentage, analysis.objective)
        } else {
            Baseline::skipped(model)
        };

        machine.transition(RunState::Partitioning);
        let density = model.column_density(&plan.reactions);
        let blocks = analysis.strategy.split(plan.len(), pool.size(), &density)?;

        // a remote worker without a shippable solver fails the run before any dispatch
        let executors = pool
            .workers()
            .iter()
            .map(|worker| Executors::load(worker, &baseline.model, &*solver))
            .collect::<Result<Vec<_>, _>>()?;

        let jobs: Vec<BlockJob> = blocks
            .iter()
            .enumerate()
            .filter(|(_, positions)| !positions.is_empty())
            .map(|(worker, positions)| BlockJob {
                worker,
                tasks: plan.tasks(positions),
                keep_flux_vectors: analysis.keep_flux_vectors,
                checkpoint_dir: analysis.checkpoint_dir.clone(),
            })
            .collect();

        machine.transition(RunState::Dispatching);
        let sink = ResultSink::default();
        let processed = AtomicU64::new(0);
        let total = jobs.len();

        pool.install(|| {
            jobs.par_iter().for_each(|job| {
                let outcome = executors[job.worker].execute(job).map_err(|e| {
                    error!(worker = job.worker, "Block failed: {e}");

                    BlockFailure {
                        worker: job.worker,
                        reactions: job.reactions(),
                        error: e.to_string(),
                    }
                });
                sink.push(outcome);

                info!(
                    worker = job.worker,
                    "Done with {}/{total} blocks",
                    processed.fetch_add(1, Ordering::SeqCst) + 1
                );
            })
        });

        machine.transition(RunState::Gathering);
        let mut result = AggregatedResult::empty(
            model.reactions(),
            &plan,
            analysis.keep_flux_vectors,
            &baseline,
            RunInfo {
                solver: solver.name().to_owned(),
                workers: pool.size(),
                strategy: analysis.strategy,
                elapsed: start.elapsed(),
            },
        );

        for outcome in sink.take() {
            match outcome {
                Ok(block) => result.merge(block),
                Err(failure) => result.fail(failure),
            }
        }

        if result.is_partial() {
            warn!(
                failed_blocks = result.failures.len(),
                "Some blocks failed, their reactions were not run"
            );
        }
        result.info.elapsed = start.elapsed();

        Ok(result)
    }
}
