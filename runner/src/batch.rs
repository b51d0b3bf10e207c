use crate::{
    pool::{Worker, WorkerPool, WORKER_TIMEOUT},
    process::{run_with_input, ProcessError},
    store::{Store, StoreError, StoredArray},
};
use globset::GlobBuilder;
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use rayon::prelude::*;
use std::{
    ops::Range,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

const TABLE_OWNER: &str = "palm";
const TABLE_NAME: &str = "table";
const MISSING: &str = "NaN";

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("No models found in {0}")]
    NoModels(PathBuf),
    #[error("Cannot share models over zero sessions")]
    NoSessions,
    #[error("Invalid model glob")]
    Glob(#[from] globset::Error),
    #[error("Failed to start the script for {model}")]
    Spawn {
        model: PathBuf,
        #[source]
        source: ProcessError,
    },
    #[error("Failed to store the table")]
    Store(#[from] StoreError),
}

/// How N models are shared over the sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareLoad {
    /// never more sessions than models
    pub sessions: usize,
    /// models per session
    pub quotient: usize,
    /// extra models of the last session
    pub remainder: usize,
}

impl ShareLoad {
    /// model index range of `session`, the last one also takes the remainder
    pub fn range(&self, session: usize) -> Range<usize> {
        let start = session * self.quotient;
        let end = start + self.quotient;

        if session + 1 == self.sessions {
            start..end + self.remainder
        } else {
            start..end
        }
    }
}

/// Split `models` over at most `sessions` sessions
pub fn share_load(models: usize, sessions: usize) -> Result<ShareLoad, BatchError> {
    if sessions == 0 {
        return Err(BatchError::NoSessions);
    }

    let sessions = sessions.min(models);
    if sessions == 0 {
        return Ok(ShareLoad {
            sessions: 0,
            quotient: 0,
            remainder: 0,
        });
    }

    let share = ShareLoad {
        sessions,
        quotient: models / sessions,
        remainder: models % sessions,
    };
    debug!(
        models,
        sessions,
        quotient = share.quotient,
        remainder = share.remainder,
        "Shared load"
    );

    Ok(share)
}

/// Per-model values, one row per model and one column per variable
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    fn new(variables: &[String]) -> Self {
        Self {
            header: std::iter::once("model".to_owned())
                .chain(variables.iter().cloned())
                .collect(),
            rows: Vec::new(),
        }
    }

    /// the header row followed by all model rows
    pub fn cells(&self) -> impl Iterator<Item = &Vec<String>> {
        std::iter::once(&self.header).chain(self.rows.iter())
    }

    fn append(&mut self, other: Table) {
        self.rows.extend(other.rows);
    }

    fn to_array(&self) -> StoredArray {
        let rows = self.rows.len() + 1;
        let cols = self.header.len();
        // column-major like every other stored array
        let data = (0..cols)
            .flat_map(|col| {
                self.cells()
                    .map(move |row| row.get(col).cloned().unwrap_or_else(|| MISSING.to_owned()))
            })
            .collect();

        StoredArray::Text { rows, cols, data }
    }

    fn from_array(rows: usize, cols: usize, data: Vec<String>) -> Self {
        let mut cells: Vec<Vec<String>> = vec![Vec::with_capacity(cols); rows];
        for (index, value) in data.into_iter().enumerate() {
            cells[index % rows.max(1)].push(value);
        }

        let mut cells = cells.into_iter();
        Self {
            header: cells.next().unwrap_or_default(),
            rows: cells.collect(),
        }
    }
}

fn cell(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Null => MISSING.to_owned(),
        serde_yaml::Value::Bool(value) => value.to_string(),
        serde_yaml::Value::Number(value) => value.to_string(),
        serde_yaml::Value::String(value) => value.clone(),
        other => serde_yaml::to_string(other)
            .map(|value| value.trim().to_owned())
            .unwrap_or_else(|_| MISSING.to_owned()),
    }
}

fn model_name(model: &Path) -> String {
    model
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| model.to_string_lossy().into_owned())
}

/// Run `script <model>` on `worker` for every model and read the requested
/// `variables` from the YAML mapping the script prints.
///
/// A script that fails for one model only leaves that model's cells at NaN.
#[instrument(skip_all, fields(worker = worker.id, models = models.len()))]
pub fn loop_models(
    worker: &Worker,
    script: &Path,
    models: &[PathBuf],
    variables: &[String],
) -> Result<Table, BatchError> {
    let mut table = Table::new(variables);

    for model in models {
        let mut command = worker.command(script.as_os_str(), &[model.to_string_lossy()]);

        let values = match run_with_input(&mut command, "", *WORKER_TIMEOUT) {
            Err(ProcessError::Spawn(source)) => {
                return Err(BatchError::Spawn {
                    model: model.clone(),
                    source: ProcessError::Spawn(source),
                })
            }
            Err(e) => {
                warn!(model = %model.display(), "Script did not finish: {e}");
                None
            }
            Ok(output) if !output.status.success() => {
                warn!(
                    model = %model.display(),
                    code = ?output.status.code(),
                    "Script failed: {}",
                    output.stderr.trim()
                );
                None
            }
            Ok(output) => match serde_yaml::from_str::<serde_yaml::Mapping>(&output.stdout) {
                Ok(values) => Some(values),
                Err(e) => {
                    warn!(model = %model.display(), "Failed to read script output: {e}");
                    None
                }
            },
        };

        let row = std::iter::once(model_name(model))
            .chain(variables.iter().map(|variable| {
                values
                    .as_ref()
                    .and_then(|values| values.get(variable.as_str()))
                    .map(cell)
                    .unwrap_or_else(|| MISSING.to_owned())
            }))
            .collect();
        table.rows.push(row);
    }

    Ok(table)
}

/// files in `dir` (not recursing) whose name matches `glob`, sorted by path
pub fn collect_models(dir: &Path, glob: &str) -> Result<Vec<PathBuf>, BatchError> {
    let matcher = GlobBuilder::new(glob).build()?.compile_matcher();
    debug!("Filtering with glob: {matcher:?}");

    let mut builder = WalkBuilder::new(dir);
    builder.max_depth(Some(1)).standard_filters(false);

    let models = builder
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Failed to search for models: {e}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_some_and(|kind| kind.is_file()))
        .filter(|entry| matcher.is_match(entry.file_name()))
        .map(DirEntry::into_path)
        .sorted()
        .collect_vec();

    if models.is_empty() {
        return Err(BatchError::NoModels(dir.to_path_buf()));
    }

    Ok(models)
}

/// Run `script` over every model in `dir`, spread over `sessions` workers of `pool`,
/// and store the combined table (in file order) at `output`.
#[instrument(skip(pool, variables), fields(workers = pool.size()))]
pub fn palm(
    pool: &WorkerPool,
    dir: &Path,
    glob: &str,
    script: &Path,
    variables: &[String],
    sessions: usize,
    output: &Path,
) -> Result<Table, BatchError> {
    let models = collect_models(dir, glob)?;

    if sessions > pool.size() {
        warn!(
            "Requested {sessions} sessions but the pool only has {} workers",
            pool.size()
        );
    }
    let share = share_load(models.len(), sessions.min(pool.size()))?;
    info!(
        models = models.len(),
        sessions = share.sessions,
        "Each session handles {} models, the last one {} more",
        share.quotient,
        share.remainder
    );

    let workers = pool.workers();
    let tables = pool.install(|| {
        (0..share.sessions)
            .into_par_iter()
            .map(|session| {
                loop_models(
                    &workers[session],
                    script,
                    &models[share.range(session)],
                    variables,
                )
            })
            .collect::<Result<Vec<_>, _>>()
    })?;

    let mut table = Table::new(variables);
    tables.into_iter().for_each(|part| table.append(part));

    let store = Store::open(output)?;
    store.write(TABLE_OWNER, TABLE_NAME, &table.to_array())?;
    store.close()?;
    info!(path = %output.display(), rows = table.rows.len(), "Saved table");

    Ok(table)
}

/// Read back a table stored by [`palm`]
pub fn load_table(path: &Path) -> Result<Table, BatchError> {
    let store = Store::open(path)?;
    let array = store
        .read(TABLE_OWNER, TABLE_NAME)?
        .ok_or_else(|| StoreError::MissingField {
            owner: TABLE_OWNER.to_owned(),
            field: TABLE_NAME.to_owned(),
        })?;
    store.close()?;

    let (rows, cols) = array.shape();

    Ok(Table::from_array(rows, cols, array.into_text(TABLE_NAME)?))
}
