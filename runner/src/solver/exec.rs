use super::{LpSession, Solution, Solver, SolverError, Status};
use crate::{
    config::SolverConfig,
    model::{Model, ObjectiveSense, RowSense, SparseMatrix},
    process::run_with_input,
};
use serde::{Deserialize, Serialize};
use std::{process::Command, time::Duration};
use tracing::{debug, trace};

/// Solver backed by an external executable.
///
/// Every solve writes the LP as a YAML document to the executable's stdin and
/// expects a YAML [`Solution`] on its stdout. The part of the document that
/// doesn't depend on the objective is rendered once per session.
#[derive(Debug, Clone)]
pub struct ExecSolver {
    config: SolverConfig,
}

impl ExecSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }
}

#[derive(Debug)]
pub struct ExecSession {
    config: SolverConfig,
    reactions: usize,
    fixed: String,
}

#[derive(Serialize)]
struct FixedLp<'a> {
    a: &'a SparseMatrix,
    b: &'a [f64],
    lb: &'a [f64],
    ub: &'a [f64],
    csense: &'a [RowSense],
    params: &'a [(String, serde_yaml::Value)],
}

#[derive(Serialize)]
struct Objective<'a> {
    c: &'a [f64],
    osense: ObjectiveSense,
}

#[derive(Deserialize)]
struct Reply {
    status: i32,
    #[serde(default = "not_available")]
    objective: f64,
    #[serde(default)]
    solution: Vec<f64>,
}

fn not_available() -> f64 {
    f64::NAN
}

impl Solver for ExecSolver {
    type Session = ExecSession;

    fn name(&self) -> &str {
        &self.config.name
    }

    fn build(&self, model: &Model) -> Result<Self::Session, SolverError> {
        let fixed = serde_yaml::to_string(&FixedLp {
            a: &model.a,
            b: &model.b,
            lb: &model.lb,
            ub: &model.ub,
            csense: &model.csense,
            params: &self.config.params,
        })?;
        debug!(bytes = fixed.len(), "Rendered LP for solver {}", self.config.name);

        Ok(ExecSession {
            config: self.config.clone(),
            reactions: model.reactions(),
            fixed,
        })
    }

    fn remote_config(&self) -> Option<&SolverConfig> {
        Some(&self.config)
    }
}

impl ExecSession {
    /// full LP document: the prerendered model followed by the objective
    fn request(&self, c: &[f64], osense: ObjectiveSense) -> Result<String, SolverError> {
        let objective = serde_yaml::to_string(&Objective { c, osense })?;

        let mut request = String::with_capacity(self.fixed.len() + objective.len());
        request.push_str(&self.fixed);
        request.push_str(&objective);

        Ok(request)
    }
}

impl LpSession for ExecSession {
    fn solve(&mut self, c: &[f64], osense: ObjectiveSense) -> Result<Solution, SolverError> {
        let request = self.request(c, osense)?;

        let mut command = Command::new(&self.config.exec);
        let output = run_with_input(
            &mut command,
            request,
            Some(Duration::from_millis(self.config.timeout_ms)),
        )?;
        trace!(stderr = %output.stderr, "Solver {} finished", self.config.name);

        if !output.status.success() {
            return Err(SolverError::Exit {
                code: output.status.code(),
                stderr: output.stderr,
            });
        }

        let reply: Reply = serde_yaml::from_str(&output.stdout)?;
        if !reply.solution.is_empty() && reply.solution.len() != self.reactions {
            return Err(SolverError::SolutionLength {
                expected: self.reactions,
                found: reply.solution.len(),
            });
        }

        let solution = Solution {
            status: Status::from_solver(reply.status),
            objective: reply.objective,
            solution: reply.solution,
        };
        debug!(
            status = %solution.status,
            runtime = ?output.runtime,
            "Solved LP"
        );

        Ok(solution)
    }
}
