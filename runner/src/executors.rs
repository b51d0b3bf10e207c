mod local;
mod remote;

pub use local::LocalExecutor;
pub use remote::{serve, RemoteExecutor, RemoteJob};

use crate::{
    config::ConfigErrors,
    model::Model,
    pool::{util::checkpoint_path, Worker, WorkerKind},
    process::ProcessError,
    results::{not_run, persist_block},
    solver::{LpSession, Solution, Solver, SolverError, Status},
    store::StoreError,
    task::{BlockJob, BlockResult, TaskResult},
};
use std::{fs, time::Instant};
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

/// Problems that take down a whole block, as opposed to a single task
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to set up the solver")]
    Solver(#[from] SolverError),
    #[error("Failed to communicate with the worker process")]
    Process(#[from] ProcessError),
    #[error("Worker process exited with {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },
    #[error("Failed to exchange the block with the worker")]
    Protocol(#[from] serde_yaml::Error),
    #[error("Failed to create the checkpoint directory")]
    Checkpoint(#[source] std::io::Error),
    #[error("Failed to write the checkpoint")]
    Store(#[from] StoreError),
}

/// Solve every task of `job` against `model` with a single solver session.
///
/// A failing task is recorded through its status and doesn't stop the block.
#[instrument(skip_all, fields(worker = job.worker, tasks = job.tasks.len()), level = "debug")]
pub fn solve_block<S: Solver>(
    model: &Model,
    solver: &S,
    job: &BlockJob,
) -> Result<BlockResult, WorkerError> {
    let start = Instant::now();
    let mut session = solver.build(model)?;
    let mut c = vec![0.0; model.reactions()];
    let mut results = Vec::with_capacity(job.tasks.len());

    for task in job.tasks.iter() {
        if task.reaction >= c.len() {
            warn!(reaction = task.reaction, "Skipping task outside of the model");
            results.extend(not_run(std::slice::from_ref(task)));
            continue;
        }

        c[task.reaction] = 1.0;
        let solution = match session.solve(&c, task.direction.sense()) {
            Ok(solution) => solution,
            Err(error) => {
                warn!(
                    reaction = task.reaction,
                    direction = ?task.direction,
                    "Solve failed: {error}"
                );

                Solution::without_values(Status::Undocumented)
            }
        };
        c[task.reaction] = 0.0;

        trace!(
            reaction = task.reaction,
            direction = ?task.direction,
            status = %solution.status,
            objective = solution.objective
        );

        let flux = (job.keep_flux_vectors && !solution.solution.is_empty())
            .then_some(solution.solution);
        results.push(TaskResult {
            reaction: task.reaction,
            direction: task.direction,
            status: solution.status.reported(),
            objective: solution.objective,
            flux,
        });
    }

    let mut block = BlockResult {
        worker: job.worker,
        results,
        checkpoint: None,
        runtime_ms: start.elapsed().as_millis() as u64,
    };

    if let Some(dir) = job.checkpoint_dir.as_ref() {
        fs::create_dir_all(dir).map_err(WorkerError::Checkpoint)?;
        let path = checkpoint_path(dir, job.worker);
        persist_block(&block, &path)?;
        debug!(path = %path.display(), "Wrote checkpoint");

        // flux vectors stay in the checkpoint
        block.results.iter_mut().for_each(|result| result.flux = None);
        block.checkpoint = Some(path);
    }

    Ok(block)
}

/// The way a block reaches the worker it was assigned to
#[derive(Debug)]
pub enum Executors<'a, S: Solver> {
    Local(LocalExecutor<'a, S>),
    Remote(RemoteExecutor<'a>),
}

impl<'a, S: Solver> Executors<'a, S> {
    /// fails for remote workers if the solver has no shippable description
    pub fn load(worker: &'a Worker, model: &'a Model, solver: &'a S) -> Result<Self, ConfigErrors> {
        match &worker.kind {
            WorkerKind::Local => Ok(Self::Local(LocalExecutor::load(model, solver))),
            WorkerKind::Remote(host) => {
                let config = solver
                    .remote_config()
                    .ok_or(ConfigErrors::RemoteSolverUnavailable(worker.id))?;

                Ok(Self::Remote(RemoteExecutor::load(host, model, config)))
            }
        }
    }

    pub fn execute(&self, job: &BlockJob) -> Result<BlockResult, WorkerError> {
        match self {
            Self::Local(executor) => executor.execute(job),
            Self::Remote(executor) => executor.execute(job),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::tests::small_model,
        results::load_block,
        solver::testing::VertexSolver,
        task::{Direction, OptMode, TaskPlan},
    };

    fn job(keep_flux_vectors: bool) -> BlockJob {
        let plan = TaskPlan {
            reactions: vec![1, 0],
            modes: vec![OptMode::Both, OptMode::Maximize],
        };

        BlockJob {
            worker: 3,
            tasks: plan.tasks(&[0, 1]),
            keep_flux_vectors,
            checkpoint_dir: None,
        }
    }

    #[test]
    fn solves_every_task_of_a_block() {
        let block = solve_block(&small_model(), &VertexSolver, &job(true)).unwrap();

        assert_eq!(block.worker, 3);
        assert_eq!(block.results.len(), 3);
        assert_eq!(block.results[0].direction, Direction::Min);
        assert!((block.results[0].objective - 0.0).abs() < 1e-7);
        assert!((block.results[1].objective - 10.0).abs() < 1e-7);
        assert!((block.results[2].objective - 10.0).abs() < 1e-7);
        assert!(block.results.iter().all(|r| r.status == Status::Optimal));
        assert_eq!(block.results[1].flux.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn drops_flux_vectors_unless_requested() {
        let block = solve_block(&small_model(), &VertexSolver, &job(false)).unwrap();

        assert!(block.results.iter().all(|r| r.flux.is_none()));
    }

    #[test]
    fn infeasible_tasks_do_not_stop_the_block() {
        let mut model = small_model();
        model.b[0] = 30.0;

        let block = solve_block(&model, &VertexSolver, &job(true)).unwrap();

        assert_eq!(block.results.len(), 3);
        assert!(block.results.iter().all(|r| r.status == Status::Infeasible));
        assert!(block.results.iter().all(|r| r.objective.is_nan()));
    }

    #[test]
    fn checkpoints_keep_flux_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(true);
        job.checkpoint_dir = Some(dir.path().join("chunks"));

        let block = solve_block(&small_model(), &VertexSolver, &job).unwrap();
        let path = block.checkpoint.clone().unwrap();

        assert!(path.starts_with(dir.path().join("chunks")));
        assert!(path.to_string_lossy().ends_with("_worker3.db"));
        assert!(block.results.iter().all(|r| r.flux.is_none()));

        let stored = load_block(&path).unwrap();
        assert_eq!(stored.results.len(), 3);
        assert!(stored.results.iter().all(|r| r.flux.is_some()));
    }

    #[test]
    fn remote_worker_needs_shippable_solver() {
        let worker = Worker {
            id: 4,
            kind: WorkerKind::Remote(std::sync::Arc::new(crate::pool::RemoteHost {
                host: "node".into(),
                dir: "/tmp".into(),
                flags: Vec::new(),
                exe: "fluxdist".into(),
                ssh_command: "ssh".into(),
            })),
        };
        let model = small_model();

        assert!(matches!(
            Executors::load(&worker, &model, &VertexSolver),
            Err(ConfigErrors::RemoteSolverUnavailable(4))
        ));
    }
}
