pub mod sqlite;

use crate::model::{Model, ModelError, ObjectiveSense, RowSense, SparseMatrix};
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, str::FromStr};
use thiserror::Error;
use tracing::{debug, info};

pub use sqlite::Store;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error")]
    SQLite(#[from] rusqlite::Error),
    #[error("Field '{field}' of '{owner}' was not found")]
    MissingField { owner: String, field: String },
    #[error("Field '{field}' is stored as {found}, expected {expected}")]
    WrongKind {
        field: String,
        expected: ArrayKind,
        found: ArrayKind,
    },
    #[error("Field '{field}' is corrupt: {reason}")]
    Corrupt { field: String, reason: String },
    #[error("Stored model is invalid")]
    Model(#[from] ModelError),
}

/// Storage type of a named array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ArrayKind {
    Float = 0,
    Int = 1,
    Sparse = 2,
    Text = 3,
}

impl fmt::Display for ArrayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float => write!(f, "float array"),
            Self::Int => write!(f, "integer array"),
            Self::Sparse => write!(f, "sparse matrix"),
            Self::Text => write!(f, "text array"),
        }
    }
}

impl TryFrom<i64> for ArrayKind {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Float),
            1 => Ok(Self::Int),
            2 => Ok(Self::Sparse),
            3 => Ok(Self::Text),
            other => Err(other),
        }
    }
}

/// A named array as it is kept in a store file. Dense arrays are column-major.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredArray {
    Float {
        rows: usize,
        cols: usize,
        data: Vec<f64>,
    },
    Int {
        rows: usize,
        cols: usize,
        data: Vec<i64>,
    },
    Sparse(SparseMatrix),
    Text {
        rows: usize,
        cols: usize,
        data: Vec<String>,
    },
}

const TRIPLET_SIZE: usize = 24;

impl StoredArray {
    pub fn column(data: Vec<f64>) -> Self {
        Self::Float {
            rows: data.len(),
            cols: 1,
            data,
        }
    }

    pub fn scalar(value: f64) -> Self {
        Self::column(vec![value])
    }

    pub fn text(data: Vec<String>) -> Self {
        Self::Text {
            rows: data.len(),
            cols: 1,
            data,
        }
    }

    pub fn kind(&self) -> ArrayKind {
        match self {
            Self::Float { .. } => ArrayKind::Float,
            Self::Int { .. } => ArrayKind::Int,
            Self::Sparse(_) => ArrayKind::Sparse,
            Self::Text { .. } => ArrayKind::Text,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        match self {
            Self::Float { rows, cols, .. }
            | Self::Int { rows, cols, .. }
            | Self::Text { rows, cols, .. } => (*rows, *cols),
            Self::Sparse(matrix) => (matrix.rows(), matrix.cols()),
        }
    }

    /// raw bytes for the blob column, floats keep their exact bit pattern
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Float { data, .. } => data.iter().flat_map(|value| value.to_le_bytes()).collect(),
            Self::Int { data, .. } => data.iter().flat_map(|value| value.to_le_bytes()).collect(),
            Self::Sparse(matrix) => matrix
                .entries()
                .iter()
                .flat_map(|(row, col, value)| {
                    (*row as u64)
                        .to_le_bytes()
                        .into_iter()
                        .chain((*col as u64).to_le_bytes())
                        .chain(value.to_le_bytes())
                })
                .collect(),
            // every entry is terminated by a NUL byte
            Self::Text { data, .. } => data
                .iter()
                .flat_map(|value| value.bytes().chain(std::iter::once(0)))
                .collect(),
        }
    }

    pub fn decode(
        field: &str,
        kind: ArrayKind,
        rows: usize,
        cols: usize,
        blob: &[u8],
    ) -> Result<Self, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            field: field.to_owned(),
            reason,
        };
        let expect_len = |found: usize| {
            if found == rows * cols {
                Ok(())
            } else {
                Err(corrupt(format!("{found} entries for shape {rows}x{cols}")))
            }
        };

        match kind {
            ArrayKind::Float | ArrayKind::Int => {
                if blob.len() % 8 != 0 {
                    return Err(corrupt(format!("{} bytes is not a multiple of 8", blob.len())));
                }
                expect_len(blob.len() / 8)?;

                let words = blob.chunks_exact(8).map(|chunk| {
                    let mut word = [0u8; 8];
                    word.copy_from_slice(chunk);
                    word
                });

                Ok(if kind == ArrayKind::Float {
                    Self::Float {
                        rows,
                        cols,
                        data: words.map(f64::from_le_bytes).collect(),
                    }
                } else {
                    Self::Int {
                        rows,
                        cols,
                        data: words.map(i64::from_le_bytes).collect(),
                    }
                })
            }
            ArrayKind::Sparse => {
                if blob.len() % TRIPLET_SIZE != 0 {
                    return Err(corrupt(format!("{} bytes of triplets", blob.len())));
                }

                let entries = blob
                    .chunks_exact(TRIPLET_SIZE)
                    .map(|chunk| {
                        let mut words = [[0u8; 8]; 3];
                        for (word, bytes) in words.iter_mut().zip(chunk.chunks_exact(8)) {
                            word.copy_from_slice(bytes);
                        }

                        (
                            u64::from_le_bytes(words[0]) as usize,
                            u64::from_le_bytes(words[1]) as usize,
                            f64::from_le_bytes(words[2]),
                        )
                    })
                    .collect();

                Ok(Self::Sparse(SparseMatrix::from_triplets(rows, cols, entries)?))
            }
            ArrayKind::Text => {
                let text = String::from_utf8(blob.to_vec())
                    .map_err(|error| corrupt(format!("invalid utf-8: {error}")))?;
                let mut data: Vec<String> = text.split('\0').map(str::to_owned).collect();
                // the last terminator leaves an empty tail behind
                data.pop();
                expect_len(data.len())?;

                Ok(Self::Text { rows, cols, data })
            }
        }
    }

    fn wrong_kind(&self, field: &str, expected: ArrayKind) -> StoreError {
        StoreError::WrongKind {
            field: field.to_owned(),
            expected,
            found: self.kind(),
        }
    }

    pub fn into_floats(self, field: &str) -> Result<Vec<f64>, StoreError> {
        match self {
            Self::Float { data, .. } => Ok(data),
            Self::Int { data, .. } => Ok(data.into_iter().map(|value| value as f64).collect()),
            other => Err(other.wrong_kind(field, ArrayKind::Float)),
        }
    }

    pub fn into_ints(self, field: &str) -> Result<Vec<i64>, StoreError> {
        match self {
            Self::Int { data, .. } => Ok(data),
            other => Err(other.wrong_kind(field, ArrayKind::Int)),
        }
    }

    pub fn into_text(self, field: &str) -> Result<Vec<String>, StoreError> {
        match self {
            Self::Text { data, .. } => Ok(data),
            other => Err(other.wrong_kind(field, ArrayKind::Text)),
        }
    }

    /// dense float matrices are accepted as well and converted
    pub fn into_sparse(self, field: &str) -> Result<SparseMatrix, StoreError> {
        match self {
            Self::Sparse(matrix) => Ok(matrix),
            Self::Float { rows, cols, data } => {
                let entries = data
                    .into_iter()
                    .enumerate()
                    .filter(|(_, value)| *value != 0.0)
                    .map(|(index, value)| (index % rows.max(1), index / rows.max(1), value))
                    .collect();

                Ok(SparseMatrix::from_triplets(rows, cols, entries)?)
            }
            other => Err(other.wrong_kind(field, ArrayKind::Sparse)),
        }
    }
}

/// Fields of a stored model struct
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelField {
    #[serde(rename = "ub")]
    Ub,
    #[serde(rename = "lb")]
    Lb,
    #[serde(rename = "osense")]
    Osense,
    #[serde(rename = "c")]
    C,
    #[serde(rename = "b")]
    B,
    #[serde(rename = "csense", alias = "sense")]
    Csense,
    #[serde(rename = "rxns", alias = "colNames")]
    Rxns,
    #[serde(rename = "mets", alias = "rowNames")]
    Mets,
}

pub const DEFAULT_MODEL_FIELDS: [ModelField; 8] = [
    ModelField::Ub,
    ModelField::Lb,
    ModelField::Osense,
    ModelField::C,
    ModelField::B,
    ModelField::Csense,
    ModelField::Rxns,
    ModelField::Mets,
];

impl ModelField {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ub => "ub",
            Self::Lb => "lb",
            Self::Osense => "osense",
            Self::C => "c",
            Self::B => "b",
            Self::Csense => "csense",
            Self::Rxns => "rxns",
            Self::Mets => "mets",
        }
    }
}

impl FromStr for ModelField {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ub" => Ok(Self::Ub),
            "lb" => Ok(Self::Lb),
            "osense" => Ok(Self::Osense),
            "c" => Ok(Self::C),
            "b" => Ok(Self::B),
            "csense" | "sense" => Ok(Self::Csense),
            "rxns" | "colNames" => Ok(Self::Rxns),
            "mets" | "rowNames" => Ok(Self::Mets),
            other => Err(other.to_owned()),
        }
    }
}

/// Load the model struct `model_name` from the store at `path`.
///
/// `matrix` names the constraint matrix field (usually `S` or `A`). The fields
/// `ub`, `lb`, `c` and `b` are required; `osense` defaults to maximization,
/// `csense` to equality rows and names to positional ones.
pub fn load_model(
    path: &Path,
    matrix: &str,
    model_name: &str,
    fields: &[ModelField],
) -> Result<Model, StoreError> {
    let store = Store::open(path)?;

    let read = |field: &str, requested: bool| -> Result<Option<StoredArray>, StoreError> {
        if requested {
            store.read(model_name, field)
        } else {
            Ok(None)
        }
    };
    let require = |field: ModelField| -> Result<StoredArray, StoreError> {
        read(field.name(), fields.contains(&field))?.ok_or_else(|| StoreError::MissingField {
            owner: model_name.to_owned(),
            field: field.name().to_owned(),
        })
    };

    let a = store
        .read(model_name, matrix)?
        .ok_or_else(|| StoreError::MissingField {
            owner: model_name.to_owned(),
            field: matrix.to_owned(),
        })?
        .into_sparse(matrix)?;

    let ub = require(ModelField::Ub)?.into_floats("ub")?;
    let lb = require(ModelField::Lb)?.into_floats("lb")?;
    let c = require(ModelField::C)?.into_floats("c")?;
    let b = require(ModelField::B)?.into_floats("b")?;

    let osense = match read("osense", fields.contains(&ModelField::Osense))? {
        Some(array) => ObjectiveSense::from_code(
            array
                .into_floats("osense")?
                .first()
                .copied()
                .unwrap_or(ObjectiveSense::Maximize.code()),
        ),
        None => ObjectiveSense::Maximize,
    };

    let csense = match read("csense", fields.contains(&ModelField::Csense))? {
        Some(array) => array
            .into_text("csense")?
            .iter()
            .map(|sense| RowSense::from_char(sense.chars().next().unwrap_or('E')))
            .collect::<Result<Vec<_>, _>>()?,
        None => vec![RowSense::Equal; b.len()],
    };

    let rxns = match read("rxns", fields.contains(&ModelField::Rxns))? {
        Some(array) => array.into_text("rxns")?,
        None => (0..c.len()).map(|i| format!("R{i}")).collect(),
    };
    let mets = match read("mets", fields.contains(&ModelField::Mets))? {
        Some(array) => array.into_text("mets")?,
        None => (0..b.len()).map(|i| format!("M{i}")).collect(),
    };

    store.close()?;

    let model = Model {
        a,
        b,
        c,
        lb,
        ub,
        osense,
        csense,
        rxns,
        mets,
    };
    model.validate()?;

    info!(
        path = %path.display(),
        reactions = model.reactions(),
        metabolites = model.metabolites(),
        "Loaded model {model_name}"
    );

    Ok(model)
}

/// Save `model` as struct `model_name`, its matrix under the field name `matrix`
pub fn save_model(
    path: &Path,
    matrix: &str,
    model_name: &str,
    model: &Model,
) -> Result<(), StoreError> {
    let store = Store::open(path)?;

    store.write_all(
        model_name,
        vec![
            (matrix.to_owned(), StoredArray::Sparse(model.a.clone())),
            ("ub".to_owned(), StoredArray::column(model.ub.clone())),
            ("lb".to_owned(), StoredArray::column(model.lb.clone())),
            ("c".to_owned(), StoredArray::column(model.c.clone())),
            ("b".to_owned(), StoredArray::column(model.b.clone())),
            ("osense".to_owned(), StoredArray::scalar(model.osense.code())),
            (
                "csense".to_owned(),
                StoredArray::text(
                    model
                        .csense
                        .iter()
                        .map(|sense| sense.as_char().to_string())
                        .collect(),
                ),
            ),
            ("rxns".to_owned(), StoredArray::text(model.rxns.clone())),
            ("mets".to_owned(), StoredArray::text(model.mets.clone())),
        ]
        .into_iter(),
    )?;

    debug!(path = %path.display(), "Saved model {model_name}");

    store.close()
}
