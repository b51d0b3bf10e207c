use super::{solve_block, WorkerError};
use crate::{
    config::SolverConfig,
    model::Model,
    pool::{RemoteHost, WORKER_TIMEOUT},
    process::run_with_input,
    solver::exec::ExecSolver,
    task::{BlockJob, BlockResult},
};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::{debug, info, instrument};

/// Everything a remote worker needs to solve one block
#[derive(Deserialize, Debug)]
pub struct RemoteJob {
    pub model: Model,
    pub solver: SolverConfig,
    pub job: BlockJob,
}

// borrowed twin of `RemoteJob` so nothing gets cloned before sending
#[derive(Serialize)]
struct RemoteJobRef<'a> {
    model: &'a Model,
    solver: &'a SolverConfig,
    job: &'a BlockJob,
}

/// Executor that ships blocks to a `fluxdist worker` process over SSH
#[derive(Debug)]
pub struct RemoteExecutor<'a> {
    host: &'a RemoteHost,
    model: &'a Model,
    solver: &'a SolverConfig,
}

impl<'a> RemoteExecutor<'a> {
    pub fn load(host: &'a RemoteHost, model: &'a Model, solver: &'a SolverConfig) -> Self {
        Self {
            host,
            model,
            solver,
        }
    }

    #[instrument(skip_all, fields(worker = job.worker, host = %self.host.host), level = "debug")]
    pub fn execute(&self, job: &BlockJob) -> Result<BlockResult, WorkerError> {
        let request = serde_yaml::to_string(&RemoteJobRef {
            model: self.model,
            solver: self.solver,
            job,
        })?;

        let mut command = self.host.command(self.host.exe.as_os_str(), &["worker"]);
        let output = run_with_input(&mut command, request, *WORKER_TIMEOUT)?;

        if !output.status.success() {
            return Err(WorkerError::Exited {
                code: output.status.code(),
                stderr: output.stderr,
            });
        }

        let block: BlockResult = serde_yaml::from_str(&output.stdout)?;
        debug!(
            tasks = block.results.len(),
            runtime = ?output.runtime,
            "Finished remote block"
        );

        Ok(block)
    }
}

/// Remote side of [`RemoteExecutor`]: read a [`RemoteJob`] from `input`, solve it
/// with the shipped solver description and write the [`BlockResult`] to `output`
pub fn serve<R: Read, W: Write>(input: R, mut output: W) -> Result<(), WorkerError> {
    let RemoteJob { model, solver, job } = serde_yaml::from_reader(input)?;
    info!(
        worker = job.worker,
        tasks = job.tasks.len(),
        solver = %solver.name,
        "Received block"
    );

    let block = solve_block(&model, &ExecSolver::new(solver), &job)?;
    serde_yaml::to_writer(&mut output, &block)?;
    output
        .flush()
        .map_err(|error| WorkerError::Process(error.into()))?;

    Ok(())
}
