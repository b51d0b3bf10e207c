//! Exhaustive vertex enumeration for tiny, bounded LPs. Only used by tests.

use super::{LpSession, Solution, Solver, SolverError, Status};
use crate::model::{Model, ObjectiveSense, RowSense};
use itertools::Itertools;

const TOLERANCE: f64 = 1e-7;

pub(crate) struct VertexSolver;

pub(crate) struct VertexSession {
    // (coefficients, rhs, sense) for every row and every finite bound
    constraints: Vec<(Vec<f64>, f64, RowSense)>,
    reactions: usize,
}

impl Solver for VertexSolver {
    type Session = VertexSession;

    fn name(&self) -> &str {
        "vertex"
    }

    fn build(&self, model: &Model) -> Result<Self::Session, SolverError> {
        let n = model.reactions();
        let mut rows = vec![vec![0.0; n]; model.metabolites()];
        for (row, col, value) in model.a.entries() {
            rows[*row][*col] += value;
        }

        let mut constraints: Vec<_> = rows
            .into_iter()
            .zip(model.b.iter().zip(model.csense.iter()))
            .map(|(row, (b, sense))| (row, *b, *sense))
            .collect();

        for reaction in 0..n {
            let mut unit = vec![0.0; n];
            unit[reaction] = 1.0;

            constraints.push((unit.clone(), model.lb[reaction], RowSense::Greater));
            constraints.push((unit, model.ub[reaction], RowSense::Less));
        }

        Ok(VertexSession {
            constraints,
            reactions: n,
        })
    }
}

/// Gaussian elimination with partial pivoting, None for singular systems
fn solve_square(mut matrix: Vec<Vec<f64>>, mut rhs: Vec<f64>) -> Option<Vec<f64>> {
    let n = rhs.len();

    for col in 0..n {
        let pivot = (col..n).max_by(|a, b| matrix[*a][col].abs().total_cmp(&matrix[*b][col].abs()))?;
        if matrix[pivot][col].abs() < 1e-12 {
            return None;
        }
        matrix.swap(col, pivot);
        rhs.swap(col, pivot);

        for row in (col + 1)..n {
            let factor = matrix[row][col] / matrix[col][col];
            for k in col..n {
                matrix[row][k] -= factor * matrix[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let sum: f64 = ((row + 1)..n).map(|k| matrix[row][k] * x[k]).sum();
        x[row] = (rhs[row] - sum) / matrix[row][row];
    }

    Some(x)
}

impl VertexSession {
    fn feasible(&self, x: &[f64]) -> bool {
        self.constraints.iter().all(|(row, rhs, sense)| {
            let activity: f64 = row.iter().zip(x).map(|(a, x)| a * x).sum();

            match sense {
                RowSense::Equal => (activity - rhs).abs() <= TOLERANCE,
                RowSense::Greater => activity >= rhs - TOLERANCE,
                RowSense::Less => activity <= rhs + TOLERANCE,
            }
        })
    }
}

impl LpSession for VertexSession {
    fn solve(&mut self, c: &[f64], osense: ObjectiveSense) -> Result<Solution, SolverError> {
        let mut best: Option<(f64, Vec<f64>)> = None;

        for active in (0..self.constraints.len()).combinations(self.reactions) {
            let matrix = active.iter().map(|i| self.constraints[*i].0.clone()).collect();
            let rhs = active.iter().map(|i| self.constraints[*i].1).collect();

            let Some(x) = solve_square(matrix, rhs) else {
                continue;
            };
            if !self.feasible(&x) {
                continue;
            }

            let objective: f64 = c.iter().zip(x.iter()).map(|(c, x)| c * x).sum();
            let better = match &best {
                None => true,
                Some((current, _)) => match osense {
                    ObjectiveSense::Maximize => objective > *current + TOLERANCE,
                    ObjectiveSense::Minimize => objective < *current - TOLERANCE,
                },
            };

            if better {
                best = Some((objective, x));
            }
        }

        Ok(match best {
            Some((objective, solution)) => Solution {
                status: Status::Optimal,
                objective,
                solution,
            },
            None => Solution::without_values(Status::Infeasible),
        })
    }
}
