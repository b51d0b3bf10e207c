use super::{solve_block, WorkerError};
use crate::{
    model::Model,
    solver::Solver,
    task::{BlockJob, BlockResult},
};
use tracing::{debug, instrument};

/// Executor that solves on the calling thread of the worker pool
#[derive(Debug)]
pub struct LocalExecutor<'a, S: Solver> {
    model: &'a Model,
    solver: &'a S,
}

impl<'a, S: Solver> LocalExecutor<'a, S> {
    pub fn load(model: &'a Model, solver: &'a S) -> Self {
        Self { model, solver }
    }

    #[instrument(skip_all, fields(worker = job.worker), level = "debug")]
    pub fn execute(&self, job: &BlockJob) -> Result<BlockResult, WorkerError> {
        let block = solve_block(self.model, self.solver, job)?;
        debug!(
            tasks = block.results.len(),
            runtime_ms = block.runtime_ms,
            "Finished local block"
        );

        Ok(block)
    }
}
