pub mod exec;
#[cfg(test)]
pub(crate) mod testing;

use crate::{config::SolverConfig, model::Model, model::ObjectiveSense, process::ProcessError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("Failed to run solver")]
    Process(#[from] ProcessError),
    #[error("Solver exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },
    #[error("Failed to read solver output")]
    Decode(#[from] serde_yaml::Error),
    #[error("Solver returned {found} values for {expected} reactions")]
    SolutionLength { expected: usize, found: usize },
}

/// Solution status of a single LP.
///
/// Stored and transferred as the COBRA integer codes
/// (`-1` not run, `0` infeasible, `1` optimal, `2` unbounded, `3` user limit,
/// `4` infeasible or unbounded, `5` undocumented); every other code is kept as
/// a solver native status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum Status {
    #[default]
    Undefined,
    Infeasible,
    Optimal,
    Unbounded,
    UserLimit,
    InfeasibleOrUnbounded,
    Undocumented,
    SolverNative(i32),
}

impl From<i32> for Status {
    fn from(code: i32) -> Self {
        match code {
            -1 => Self::Undefined,
            0 => Self::Infeasible,
            1 => Self::Optimal,
            2 => Self::Unbounded,
            3 => Self::UserLimit,
            4 => Self::InfeasibleOrUnbounded,
            5 => Self::Undocumented,
            native => Self::SolverNative(native),
        }
    }
}

impl From<Status> for i32 {
    fn from(status: Status) -> Self {
        match status {
            Status::Undefined => -1,
            Status::Infeasible => 0,
            Status::Optimal => 1,
            Status::Unbounded => 2,
            Status::UserLimit => 3,
            Status::InfeasibleOrUnbounded => 4,
            Status::Undocumented => 5,
            Status::SolverNative(code) => code,
        }
    }
}

impl Status {
    /// Status code reported by a solver. `-1` is reserved for tasks that never
    /// ran, a solver reporting it gets [`Status::Undocumented`].
    pub fn from_solver(code: i32) -> Self {
        match code {
            -1 => Self::Undocumented,
            code => code.into(),
        }
    }

    /// status of a task that was actually solved, never the "not run" sentinel
    pub fn reported(self) -> Self {
        match self {
            Self::Undefined | Self::SolverNative(-1) => Self::Undocumented,
            status => status,
        }
    }

    pub fn is_optimal(self) -> bool {
        self == Self::Optimal
    }

    /// true for every status that stems from an actual solve
    pub fn was_run(self) -> bool {
        self != Self::Undefined
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "not run"),
            Self::Infeasible => write!(f, "infeasible"),
            Self::Optimal => write!(f, "optimal"),
            Self::Unbounded => write!(f, "unbounded"),
            Self::UserLimit => write!(f, "user limit hit"),
            Self::InfeasibleOrUnbounded => write!(f, "infeasible or unbounded"),
            Self::Undocumented => write!(f, "undocumented"),
            Self::SolverNative(code) => write!(f, "solver status {code}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub status: Status,
    #[serde(default = "not_available")]
    pub objective: f64,
    /// primal solution, empty whenever the solver didn't produce one
    #[serde(default)]
    pub solution: Vec<f64>,
}

fn not_available() -> f64 {
    f64::NAN
}

impl Solution {
    pub fn without_values(status: Status) -> Self {
        Self {
            status,
            objective: f64::NAN,
            solution: Vec::new(),
        }
    }
}

/// A solver prepared for one fixed model. Only the objective changes between calls.
pub trait LpSession {
    fn solve(&mut self, c: &[f64], osense: ObjectiveSense) -> Result<Solution, SolverError>;
}

pub trait Solver: Send + Sync {
    type Session: LpSession;

    fn name(&self) -> &str;

    /// set up the model once, the session is reused for a whole block of tasks
    fn build(&self, model: &Model) -> Result<Self::Session, SolverError>;

    /// description shipped to remote workers, which rebuild the solver from it
    fn remote_config(&self) -> Option<&SolverConfig> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solver_reported_minus_one_counts_as_run() {
        assert_eq!(Status::from_solver(-1), Status::Undocumented);
        assert!(Status::from_solver(-1).was_run());
        assert_eq!(Status::from_solver(1), Status::Optimal);
        assert_eq!(Status::from_solver(42), Status::SolverNative(42));

        assert_eq!(Status::Undefined.reported(), Status::Undocumented);
        assert_eq!(Status::SolverNative(-1).reported(), Status::Undocumented);
        assert_eq!(Status::Unbounded.reported(), Status::Unbounded);
    }

    #[test]
    fn status_codes_round_trip_through_serde() {
        let statuses: Vec<Status> = serde_yaml::from_str("[-1, 0, 1, 2, 3, 4, 5, 17]").unwrap();

        assert_eq!(
            statuses,
            vec![
                Status::Undefined,
                Status::Infeasible,
                Status::Optimal,
                Status::Unbounded,
                Status::UserLimit,
                Status::InfeasibleOrUnbounded,
                Status::Undocumented,
                Status::SolverNative(17)
            ]
        );
        assert_eq!(i32::from(Status::SolverNative(17)), 17);
    }

    #[test]
    fn undefined_is_not_a_run() {
        assert!(!Status::Undefined.was_run());
        assert!(Status::Infeasible.was_run());
        assert!(!Status::Infeasible.is_optimal());
    }

    #[test]
    fn missing_objective_reads_as_nan() {
        let solution: Solution = serde_yaml::from_str("status: 0").unwrap();

        assert!(solution.objective.is_nan());
        assert!(solution.solution.is_empty());
    }
}
