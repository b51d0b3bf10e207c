use crate::{
    model::{Model, ObjectiveSense},
    solver::{LpSession, Solution, Solver, Status},
};
use tracing::{info, instrument, warn};

/// Result of solving the original objective ahead of the analysis
#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    pub status: Status,
    /// optimal objective value, NaN whenever the solve wasn't optimal
    pub objective: f64,
    pub solution: Vec<f64>,
    /// model every task runs against, carries the objective bound row if one was added
    pub model: Model,
}

impl Baseline {
    /// the baseline couldn't be established and tasks run without an objective bound
    pub fn is_degraded(&self) -> bool {
        !self.status.is_optimal()
    }

    /// placeholder when no pre-solve was requested
    pub fn skipped(model: &Model) -> Self {
        Self {
            status: Status::Undefined,
            objective: f64::NAN,
            solution: Vec::new(),
            model: model.clone(),
        }
    }
}

/// Solve the original objective `c` of `model` once and, for `opt_percentage > 0`,
/// derive a model that only admits solutions within that percentage of the optimum:
/// `c'v >= opt * p / 100` when maximizing, `c'v <= opt * p / 100` when minimizing.
///
/// A failed baseline is reported through its status; the returned model is then
/// the unmodified input.
#[instrument(skip(model, solver), level = "info")]
pub fn pre_fba<S: Solver>(
    model: &Model,
    solver: &S,
    opt_percentage: f64,
    objective: ObjectiveSense,
) -> Baseline {
    let solution = match solver
        .build(model)
        .and_then(|mut session| session.solve(&model.c, objective))
    {
        Ok(solution) => solution,
        Err(error) => {
            warn!(error = ?error, "Baseline solve failed: {error}");

            Solution::without_values(Status::Undocumented)
        }
    };

    if !solution.status.is_optimal() {
        warn!(
            status = %solution.status,
            "Baseline is not optimal, tasks run without an objective bound"
        );

        return Baseline {
            status: solution.status,
            objective: f64::NAN,
            solution: solution.solution,
            model: model.clone(),
        };
    }

    info!(objective = solution.objective, "Solved baseline");

    let model = if opt_percentage > 0.0 {
        let rhs = solution.objective * opt_percentage / 100.0;
        info!(bound = rhs, "Bounding objective at {opt_percentage}% of the optimum");

        model.with_objective_bound(objective, rhs)
    } else {
        model.clone()
    };

    Baseline {
        status: solution.status,
        objective: solution.objective,
        solution: solution.solution,
        model,
    }
}
