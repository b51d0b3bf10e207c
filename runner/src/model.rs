use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Field {field} has length {found}, expected {expected}")]
    DimensionMismatch {
        field: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Matrix entry ({row}, {col}) lies outside of a {rows}x{cols} matrix")]
    EntryOutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },
    #[error("Unknown objective sense '{0}', expected 'max' or 'min'")]
    UnknownObjectiveSense(String),
    #[error("Unknown constraint sense '{0}', expected one of E, G, L")]
    UnknownRowSense(char),
    #[error("Lower bound exceeds upper bound for reaction {0}")]
    InvertedBounds(usize),
}

/// Objective sense, encoded the same way as the `osense` field of a stored model
#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy, Default)]
#[repr(i8)]
pub enum ObjectiveSense {
    #[default]
    Maximize = -1,
    Minimize = 1,
}

impl ObjectiveSense {
    /// interpret a stored `osense` value, negative values mean maximization
    pub fn from_code(code: f64) -> Self {
        if code < 0.0 {
            Self::Maximize
        } else {
            Self::Minimize
        }
    }

    pub fn code(self) -> f64 {
        self as i8 as f64
    }
}

impl FromStr for ObjectiveSense {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "max" | "maximize" => Ok(Self::Maximize),
            "min" | "minimize" => Ok(Self::Minimize),
            other => Err(ModelError::UnknownObjectiveSense(other.to_owned())),
        }
    }
}

impl fmt::Display for ObjectiveSense {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Maximize => write!(f, "max"),
            Self::Minimize => write!(f, "min"),
        }
    }
}

/// Sense of a single constraint row
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowSense {
    #[serde(rename = "E")]
    Equal,
    #[serde(rename = "G")]
    Greater,
    #[serde(rename = "L")]
    Less,
}

impl RowSense {
    pub fn from_char(value: char) -> Result<Self, ModelError> {
        match value {
            'E' | '=' => Ok(Self::Equal),
            'G' | '>' => Ok(Self::Greater),
            'L' | '<' => Ok(Self::Less),
            other => Err(ModelError::UnknownRowSense(other)),
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Self::Equal => 'E',
            Self::Greater => 'G',
            Self::Less => 'L',
        }
    }
}

/// Sparse matrix in coordinate form
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
pub struct SparseMatrix {
    rows: usize,
    cols: usize,
    entries: Vec<(usize, usize, f64)>,
}

impl SparseMatrix {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            entries: Vec::new(),
        }
    }

    pub fn from_triplets(
        rows: usize,
        cols: usize,
        entries: Vec<(usize, usize, f64)>,
    ) -> Result<Self, ModelError> {
        if let Some(&(row, col, _)) = entries.iter().find(|(row, col, _)| *row >= rows || *col >= cols)
        {
            return Err(ModelError::EntryOutOfBounds {
                row,
                col,
                rows,
                cols,
            });
        }

        Ok(Self {
            rows,
            cols,
            entries,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn nnz(&self) -> usize {
        self.entries.iter().filter(|(_, _, value)| *value != 0.0).count()
    }

    pub fn entries(&self) -> &[(usize, usize, f64)] {
        &self.entries
    }

    /// number of nonzero entries per column
    pub fn column_nnz(&self) -> Vec<usize> {
        let mut counts = vec![0; self.cols];

        for (_, col, value) in self.entries.iter() {
            if *value != 0.0 {
                counts[*col] += 1;
            }
        }

        counts
    }

    /// copy of the matrix with one additional row appended at the bottom
    pub fn with_row(&self, coefficients: &[f64]) -> Self {
        let mut entries = self.entries.clone();
        entries.extend(
            coefficients
                .iter()
                .enumerate()
                .filter(|(_, value)| **value != 0.0)
                .map(|(col, value)| (self.rows, col, *value)),
        );

        Self {
            rows: self.rows + 1,
            cols: self.cols,
            entries,
        }
    }
}

/// A linear program as loaded from a model file:
///
/// ```text
/// max/min c'v  s.t.  A v (=, >=, <=) b,  lb <= v <= ub
/// ```
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Model {
    #[serde(alias = "S")]
    pub a: SparseMatrix,
    pub b: Vec<f64>,
    pub c: Vec<f64>,
    pub lb: Vec<f64>,
    pub ub: Vec<f64>,
    #[serde(default)]
    pub osense: ObjectiveSense,
    pub csense: Vec<RowSense>,
    #[serde(default)]
    pub rxns: Vec<String>,
    #[serde(default)]
    pub mets: Vec<String>,
}

/// Name of the row appended by `Model::with_objective_bound`
pub const OBJECTIVE_BOUND_ROW: &str = "objective_bound";

impl Model {
    /// number of reactions (columns)
    pub fn reactions(&self) -> usize {
        self.c.len()
    }

    /// number of metabolites (rows)
    pub fn metabolites(&self) -> usize {
        self.b.len()
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let n = self.reactions();
        let m = self.metabolites();

        let checks: [(&'static str, usize, usize); 8] = [
            ("lb", n, self.lb.len()),
            ("ub", n, self.ub.len()),
            ("S.cols", n, self.a.cols()),
            ("S.rows", m, self.a.rows()),
            ("csense", m, self.csense.len()),
            // names are optional, but must match when present
            ("rxns", n, if self.rxns.is_empty() { n } else { self.rxns.len() }),
            ("mets", m, if self.mets.is_empty() { m } else { self.mets.len() }),
            ("b", m, self.b.len()),
        ];

        for (field, expected, found) in checks {
            if expected != found {
                return Err(ModelError::DimensionMismatch {
                    field,
                    expected,
                    found,
                });
            }
        }

        match self.lb.iter().zip(self.ub.iter()).position(|(lb, ub)| lb > ub) {
            Some(reaction) => Err(ModelError::InvertedBounds(reaction)),
            None => Ok(()),
        }
    }

    /// nonzero count of the matrix column of each of the given reactions
    pub fn column_density(&self, reactions: &[usize]) -> Vec<usize> {
        let counts = self.a.column_nnz();

        reactions
            .iter()
            .map(|reaction| counts.get(*reaction).copied().unwrap_or(0))
            .collect()
    }

    /// name of a reaction, falls back to a positional name for unnamed models
    pub fn reaction_name(&self, reaction: usize) -> String {
        self.rxns
            .get(reaction)
            .cloned()
            .unwrap_or_else(|| format!("R{reaction}"))
    }

    /// Copy of the model with an extra row bounding the objective `c'v` by `rhs`.
    /// The row is a lower bound when maximizing and an upper bound when minimizing.
    pub fn with_objective_bound(&self, sense: ObjectiveSense, rhs: f64) -> Self {
        let mut b = self.b.clone();
        b.push(rhs);

        let mut csense = self.csense.clone();
        csense.push(match sense {
            ObjectiveSense::Maximize => RowSense::Greater,
            ObjectiveSense::Minimize => RowSense::Less,
        });

        let mut mets = self.mets.clone();
        if !mets.is_empty() {
            mets.push(OBJECTIVE_BOUND_ROW.to_owned());
        }

        Self {
            a: self.a.with_row(&self.c),
            b,
            c: self.c.clone(),
            lb: self.lb.clone(),
            ub: self.ub.clone(),
            osense: self.osense,
            csense,
            rxns: self.rxns.clone(),
            mets,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// x0 + x1 = 10, 0 <= x <= 10, objective x0
    pub(crate) fn small_model() -> Model {
        Model {
            a: SparseMatrix::from_triplets(1, 2, vec![(0, 0, 1.0), (0, 1, 1.0)]).unwrap(),
            b: vec![10.0],
            c: vec![1.0, 0.0],
            lb: vec![0.0, 0.0],
            ub: vec![10.0, 10.0],
            osense: ObjectiveSense::Maximize,
            csense: vec![RowSense::Equal],
            rxns: vec!["EX_a".into(), "EX_b".into()],
            mets: vec!["m".into()],
        }
    }

    #[test]
    fn validate_accepts_consistent_model() {
        assert_eq!(small_model().validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_short_bounds() {
        let mut model = small_model();
        model.ub.pop();

        assert_eq!(
            model.validate(),
            Err(ModelError::DimensionMismatch {
                field: "ub",
                expected: 2,
                found: 1
            })
        );
    }

    #[test]
    fn triplets_outside_matrix_are_rejected() {
        assert!(matches!(
            SparseMatrix::from_triplets(1, 1, vec![(1, 0, 1.0)]),
            Err(ModelError::EntryOutOfBounds { row: 1, .. })
        ));
    }

    #[test]
    fn objective_bound_appends_one_row() {
        let model = small_model();
        let bounded = model.with_objective_bound(ObjectiveSense::Maximize, 9.0);

        assert_eq!(bounded.metabolites(), 2);
        assert_eq!(bounded.a.rows(), 2);
        assert_eq!(bounded.b, vec![10.0, 9.0]);
        assert_eq!(bounded.csense, vec![RowSense::Equal, RowSense::Greater]);
        assert_eq!(bounded.mets.last().map(String::as_str), Some(OBJECTIVE_BOUND_ROW));
        assert!(bounded.a.entries().contains(&(1, 0, 1.0)));
        assert_eq!(bounded.validate(), Ok(()));
        // the original stays untouched
        assert_eq!(model.metabolites(), 1);

        let bounded = model.with_objective_bound(ObjectiveSense::Minimize, 1.0);
        assert_eq!(bounded.csense[1], RowSense::Less);
    }

    #[test]
    fn column_density_counts_nonzeros() {
        let model = Model {
            a: SparseMatrix::from_triplets(
                2,
                3,
                vec![(0, 0, 1.0), (1, 0, -1.0), (0, 2, 2.0), (1, 1, 0.0)],
            )
            .unwrap(),
            ..small_model()
        };

        assert_eq!(model.column_density(&[2, 0, 1]), vec![1, 2, 0]);
    }

    #[test]
    fn objective_sense_parsing() {
        assert_eq!("MAX".parse::<ObjectiveSense>(), Ok(ObjectiveSense::Maximize));
        assert_eq!("min".parse::<ObjectiveSense>(), Ok(ObjectiveSense::Minimize));
        assert!("avg".parse::<ObjectiveSense>().is_err());
        assert_eq!(ObjectiveSense::from_code(-1.0), ObjectiveSense::Maximize);
        assert_eq!(ObjectiveSense::Minimize.code(), 1.0);
    }
}
