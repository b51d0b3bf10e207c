use crate::{
    baseline::Baseline,
    partition::Strategy,
    solver::Status,
    store::{ArrayKind, Store, StoreError, StoredArray},
    task::{BlockResult, Direction, Task, TaskPlan, TaskResult},
};
use parking_lot::FairMutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{info, warn};

const RESULTS_OWNER: &str = "results";
const BLOCK_OWNER: &str = "block";

/// Fields of the aggregated result that can be written to a result file
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultField {
    #[serde(rename = "minFlux")]
    MinFlux,
    #[serde(rename = "maxFlux")]
    MaxFlux,
    #[serde(rename = "optsol", alias = "optSol")]
    OptSol,
    #[serde(rename = "fbasol", alias = "fbaSol")]
    FbaSol,
    #[serde(rename = "fvamin", alias = "fvaMin")]
    FvaMin,
    #[serde(rename = "fvamax", alias = "fvaMax")]
    FvaMax,
    #[serde(rename = "statussolmin", alias = "statusMin")]
    StatusMin,
    #[serde(rename = "statussolmax", alias = "statusMax")]
    StatusMax,
    #[serde(rename = "rxnsList", alias = "taskList")]
    TaskList,
}

pub const ALL_RESULT_FIELDS: [ResultField; 9] = [
    ResultField::MinFlux,
    ResultField::MaxFlux,
    ResultField::OptSol,
    ResultField::FbaSol,
    ResultField::FvaMin,
    ResultField::FvaMax,
    ResultField::StatusMin,
    ResultField::StatusMax,
    ResultField::TaskList,
];

impl ResultField {
    pub fn name(self) -> &'static str {
        match self {
            Self::MinFlux => "minFlux",
            Self::MaxFlux => "maxFlux",
            Self::OptSol => "optsol",
            Self::FbaSol => "fbasol",
            Self::FvaMin => "fvamin",
            Self::FvaMax => "fvamax",
            Self::StatusMin => "statussolmin",
            Self::StatusMax => "statussolmax",
            Self::TaskList => "rxnsList",
        }
    }
}

/// Flux vectors of one direction, one column per analyzed reaction, column-major
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FluxMatrix {
    pub rows: usize,
    /// reaction solved for in each column
    pub reactions: Vec<usize>,
    pub data: Vec<f64>,
    index: HashMap<usize, usize>,
}

impl FluxMatrix {
    /// matrix of `rows` x `reactions.len()` entries, all of them NaN
    pub fn new(rows: usize, reactions: Vec<usize>) -> Self {
        let index = reactions
            .iter()
            .enumerate()
            .map(|(column, reaction)| (*reaction, column))
            .collect();

        Self {
            rows,
            data: vec![f64::NAN; rows * reactions.len()],
            reactions,
            index,
        }
    }

    fn from_data(rows: usize, reactions: Vec<usize>, data: Vec<f64>) -> Self {
        let mut matrix = Self::new(rows, reactions);
        matrix.data = data;

        matrix
    }

    pub fn columns(&self) -> usize {
        self.reactions.len()
    }

    pub fn column(&self, reaction: usize) -> Option<&[f64]> {
        let column = *self.index.get(&reaction)?;

        Some(&self.data[column * self.rows..(column + 1) * self.rows])
    }

    /// returns false if the reaction has no column or the flux has the wrong length
    fn set_column(&mut self, reaction: usize, flux: &[f64]) -> bool {
        match self.index.get(&reaction) {
            Some(column) if flux.len() == self.rows => {
                let start = column * self.rows;
                self.data[start..start + self.rows].copy_from_slice(flux);

                true
            }
            _ => false,
        }
    }
}

/// A block that produced no results at all
#[derive(Debug, Clone, PartialEq)]
pub struct BlockFailure {
    pub worker: usize,
    pub reactions: Vec<usize>,
    pub error: String,
}

/// Bookkeeping of a run, used for the summary
#[derive(Debug, Clone, PartialEq)]
pub struct RunInfo {
    pub solver: String,
    pub workers: usize,
    pub strategy: Strategy,
    pub elapsed: Duration,
}

/// Per-reaction results of a distributed run, indexed by reaction.
///
/// Entries of reactions that were not solved in a direction hold NaN (fluxes)
/// and [`Status::Undefined`] (statuses).
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedResult {
    pub min_flux: Vec<f64>,
    pub max_flux: Vec<f64>,
    pub opt_sol: f64,
    pub fba_sol: Vec<f64>,
    pub baseline_status: Status,
    pub fva_min: FluxMatrix,
    pub fva_max: FluxMatrix,
    pub status_min: Vec<Status>,
    pub status_max: Vec<Status>,
    pub reactions: Vec<usize>,
    pub failures: Vec<BlockFailure>,
    pub checkpoints: Vec<PathBuf>,
    pub info: RunInfo,
}

impl AggregatedResult {
    /// skeleton for `plan`, flux matrices only get columns if flux vectors are kept
    pub fn empty(
        reactions: usize,
        plan: &TaskPlan,
        keep_flux_vectors: bool,
        baseline: &Baseline,
        info: RunInfo,
    ) -> Self {
        let matrix = |direction| {
            if keep_flux_vectors {
                FluxMatrix::new(reactions, plan.reactions_in(direction))
            } else {
                FluxMatrix::new(reactions, Vec::new())
            }
        };

        Self {
            min_flux: vec![f64::NAN; reactions],
            max_flux: vec![f64::NAN; reactions],
            opt_sol: baseline.objective,
            fba_sol: baseline.solution.clone(),
            baseline_status: baseline.status,
            fva_min: matrix(Direction::Min),
            fva_max: matrix(Direction::Max),
            status_min: vec![Status::Undefined; reactions],
            status_max: vec![Status::Undefined; reactions],
            reactions: plan.reactions.clone(),
            failures: Vec::new(),
            checkpoints: Vec::new(),
            info,
        }
    }

    /// scatter the results of one block into place, the merge order doesn't matter
    pub fn merge(&mut self, block: BlockResult) {
        if let Some(checkpoint) = block.checkpoint {
            self.checkpoints.push(checkpoint);
        }

        for result in block.results {
            self.merge_task(result);
        }
    }

    fn merge_task(&mut self, result: TaskResult) {
        let (fluxes, statuses, matrix) = match result.direction {
            Direction::Min => (&mut self.min_flux, &mut self.status_min, &mut self.fva_min),
            Direction::Max => (&mut self.max_flux, &mut self.status_max, &mut self.fva_max),
        };

        if result.reaction >= fluxes.len() {
            warn!(
                reaction = result.reaction,
                "Dropping result for a reaction outside of the model"
            );
            return;
        }

        fluxes[result.reaction] = result.objective;
        statuses[result.reaction] = result.status;

        if let Some(flux) = result.flux {
            if !matrix.set_column(result.reaction, &flux) {
                warn!(
                    reaction = result.reaction,
                    length = flux.len(),
                    "Dropping unexpected flux vector"
                );
            }
        }
    }

    pub fn fail(&mut self, failure: BlockFailure) {
        self.failures.push(failure);
    }

    /// true if some tasks never produced a result because their block failed
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Human readable overview of the run
    pub fn summarize(&self) -> Summary<'_> {
        Summary(self)
    }
}

/// Printable overview of an [`AggregatedResult`]
pub struct Summary<'a>(&'a AggregatedResult);

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = self.0;
        let solved = |statuses: &[Status]| statuses.iter().filter(|s| s.was_run()).count();
        let failed = |statuses: &[Status]| {
            statuses
                .iter()
                .filter(|s| s.was_run() && !s.is_optimal())
                .count()
        };

        writeln!(f, "==== fluxdist summary ====")?;
        writeln!(f, " solver:              {}", result.info.solver)?;
        writeln!(
            f,
            " optimal objective:   {} ({})",
            result.opt_sol, result.baseline_status
        )?;
        writeln!(
            f,
            " reactions analyzed:  {} (min {}, max {})",
            result.reactions.len(),
            solved(&result.status_min),
            solved(&result.status_max)
        )?;
        for (name, fluxes) in [("minFlux", &result.min_flux), ("maxFlux", &result.max_flux)] {
            match range(fluxes) {
                Some((low, high)) => writeln!(
                    f,
                    " {name} range:       [{low}, {high}], norm {}",
                    norm(fluxes)
                )?,
                None => writeln!(f, " {name} range:       none")?,
            }
        }
        writeln!(
            f,
            " non-optimal tasks:   min {}, max {}",
            failed(&result.status_min),
            failed(&result.status_max)
        )?;
        writeln!(f, " failed blocks:       {}", result.failures.len())?;
        writeln!(f, " workers:             {}", result.info.workers)?;
        writeln!(f, " strategy:            {}", result.info.strategy)?;
        write!(
            f,
            " solution time:       {:.3} s",
            result.info.elapsed.as_secs_f64()
        )
    }
}

/// (min, max) over the entries that were solved
fn range(values: &[f64]) -> Option<(f64, f64)> {
    values
        .iter()
        .filter(|value| value.is_finite())
        .fold(None, |acc, value| match acc {
            None => Some((*value, *value)),
            Some((low, high)) => Some((low.min(*value), high.max(*value))),
        })
}

fn norm(values: &[f64]) -> f64 {
    values
        .iter()
        .filter(|value| value.is_finite())
        .map(|value| value * value)
        .sum::<f64>()
        .sqrt()
}

/// Shared collection point for the block outcomes of all workers
#[derive(Debug, Clone, Default)]
pub struct ResultSink(Arc<FairMutex<Vec<Result<BlockResult, BlockFailure>>>>);

impl ResultSink {
    pub fn push(&self, outcome: Result<BlockResult, BlockFailure>) {
        self.0.lock_arc().push(outcome);
    }

    pub fn take(&self) -> Vec<Result<BlockResult, BlockFailure>> {
        std::mem::take(&mut *self.0.lock_arc())
    }
}

fn statuses_to_array(statuses: &[Status]) -> StoredArray {
    StoredArray::Int {
        rows: statuses.len(),
        cols: 1,
        data: statuses.iter().map(|s| i32::from(*s) as i64).collect(),
    }
}

fn ints_to_array(values: &[usize]) -> StoredArray {
    StoredArray::Int {
        rows: values.len(),
        cols: 1,
        data: values.iter().map(|value| *value as i64).collect(),
    }
}

fn matrix_arrays(name: &str, matrix: &FluxMatrix) -> [(String, StoredArray); 2] {
    [
        (
            name.to_owned(),
            StoredArray::Float {
                rows: matrix.rows,
                cols: matrix.columns(),
                data: matrix.data.clone(),
            },
        ),
        (format!("{name}Columns"), ints_to_array(&matrix.reactions)),
    ]
}

/// Write the selected `fields` of `result` to the store file at `path`
pub fn persist(result: &AggregatedResult, path: &Path, fields: &[ResultField]) -> Result<(), StoreError> {
    let mut arrays: Vec<(String, StoredArray)> = Vec::new();

    for field in fields {
        let name = field.name().to_owned();

        match field {
            ResultField::MinFlux => arrays.push((name, StoredArray::column(result.min_flux.clone()))),
            ResultField::MaxFlux => arrays.push((name, StoredArray::column(result.max_flux.clone()))),
            ResultField::OptSol => arrays.push((name, StoredArray::scalar(result.opt_sol))),
            ResultField::FbaSol => arrays.push((name, StoredArray::column(result.fba_sol.clone()))),
            ResultField::FvaMin => arrays.extend(matrix_arrays(&name, &result.fva_min)),
            ResultField::FvaMax => arrays.extend(matrix_arrays(&name, &result.fva_max)),
            ResultField::StatusMin => arrays.push((name, statuses_to_array(&result.status_min))),
            ResultField::StatusMax => arrays.push((name, statuses_to_array(&result.status_max))),
            ResultField::TaskList => arrays.push((name, ints_to_array(&result.reactions))),
        }
    }

    let store = Store::open(path)?;
    store.replace_all(RESULTS_OWNER, arrays.into_iter())?;
    store.close()?;

    info!(path = %path.display(), "Saved {} result fields", fields.len());

    Ok(())
}

/// Result fields read back from a store file, absent if they weren't requested
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PersistedResults {
    pub min_flux: Option<Vec<f64>>,
    pub max_flux: Option<Vec<f64>>,
    pub opt_sol: Option<f64>,
    pub fba_sol: Option<Vec<f64>>,
    pub fva_min: Option<FluxMatrix>,
    pub fva_max: Option<FluxMatrix>,
    pub status_min: Option<Vec<Status>>,
    pub status_max: Option<Vec<Status>>,
    pub reactions: Option<Vec<usize>>,
}

fn required(store: &Store, owner: &str, name: &str) -> Result<StoredArray, StoreError> {
    store.read(owner, name)?.ok_or_else(|| StoreError::MissingField {
        owner: owner.to_owned(),
        field: name.to_owned(),
    })
}

fn read_indices(store: &Store, owner: &str, name: &str) -> Result<Vec<usize>, StoreError> {
    required(store, owner, name)?
        .into_ints(name)?
        .into_iter()
        .map(|value| {
            usize::try_from(value).map_err(|_| StoreError::Corrupt {
                field: name.to_owned(),
                reason: format!("negative index {value}"),
            })
        })
        .collect()
}

fn read_statuses(store: &Store, owner: &str, name: &str) -> Result<Vec<Status>, StoreError> {
    Ok(required(store, owner, name)?
        .into_ints(name)?
        .into_iter()
        .map(|code| Status::from(code as i32))
        .collect())
}

fn read_matrix(store: &Store, name: &str) -> Result<FluxMatrix, StoreError> {
    let reactions = read_indices(store, RESULTS_OWNER, &format!("{name}Columns"))?;
    let (rows, data) = match required(store, RESULTS_OWNER, name)? {
        StoredArray::Float { rows, data, .. } => (rows, data),
        other => {
            return Err(StoreError::WrongKind {
                field: name.to_owned(),
                expected: ArrayKind::Float,
                found: other.kind(),
            })
        }
    };

    if data.len() != rows * reactions.len() {
        return Err(StoreError::Corrupt {
            field: name.to_owned(),
            reason: format!("{} values for {rows} x {} entries", data.len(), reactions.len()),
        });
    }

    Ok(FluxMatrix::from_data(rows, reactions, data))
}

/// Read the selected `fields` of a result file written by [`persist`]
pub fn load(path: &Path, fields: &[ResultField]) -> Result<PersistedResults, StoreError> {
    let store = Store::open(path)?;
    let mut results = PersistedResults::default();
    let floats = |name: &str| required(&store, RESULTS_OWNER, name)?.into_floats(name);

    for field in fields {
        let name = field.name();

        match field {
            ResultField::MinFlux => results.min_flux = Some(floats(name)?),
            ResultField::MaxFlux => results.max_flux = Some(floats(name)?),
            ResultField::OptSol => {
                results.opt_sol = Some(floats(name)?.first().copied().unwrap_or(f64::NAN))
            }
            ResultField::FbaSol => results.fba_sol = Some(floats(name)?),
            ResultField::FvaMin => results.fva_min = Some(read_matrix(&store, name)?),
            ResultField::FvaMax => results.fva_max = Some(read_matrix(&store, name)?),
            ResultField::StatusMin => {
                results.status_min = Some(read_statuses(&store, RESULTS_OWNER, name)?)
            }
            ResultField::StatusMax => {
                results.status_max = Some(read_statuses(&store, RESULTS_OWNER, name)?)
            }
            ResultField::TaskList => {
                results.reactions = Some(read_indices(&store, RESULTS_OWNER, name)?)
            }
        }
    }

    store.close()?;

    Ok(results)
}

/// Write the complete results of one block, flux vectors included, to a checkpoint file
pub fn persist_block(block: &BlockResult, path: &Path) -> Result<(), StoreError> {
    let fluxes: Vec<&Vec<f64>> = block.results.iter().filter_map(|r| r.flux.as_ref()).collect();
    let rows = fluxes.first().map(|flux| flux.len()).unwrap_or_default();
    if fluxes.iter().any(|flux| flux.len() != rows) {
        return Err(StoreError::Corrupt {
            field: "flux".to_owned(),
            reason: "flux vectors differ in length".to_owned(),
        });
    }

    let reactions: Vec<usize> = block.results.iter().map(|r| r.reaction).collect();
    let directions: Vec<usize> = block
        .results
        .iter()
        .map(|r| match r.direction {
            Direction::Min => 0,
            Direction::Max => 1,
        })
        .collect();
    let has_flux: Vec<usize> = block.results.iter().map(|r| r.flux.is_some() as usize).collect();
    let statuses: Vec<Status> = block.results.iter().map(|r| r.status).collect();

    let store = Store::open(path)?;
    store.replace_all(
        BLOCK_OWNER,
        [
            ("worker".to_owned(), ints_to_array(&[block.worker])),
            ("reactions".to_owned(), ints_to_array(&reactions)),
            ("directions".to_owned(), ints_to_array(&directions)),
            ("hasFlux".to_owned(), ints_to_array(&has_flux)),
            ("status".to_owned(), statuses_to_array(&statuses)),
            (
                "objective".to_owned(),
                StoredArray::column(block.results.iter().map(|r| r.objective).collect()),
            ),
            (
                "flux".to_owned(),
                StoredArray::Float {
                    rows,
                    cols: fluxes.len(),
                    data: fluxes.into_iter().flatten().copied().collect(),
                },
            ),
        ]
        .into_iter(),
    )?;
    store.close()
}

/// Read back a block written by [`persist_block`]
pub fn load_block(path: &Path) -> Result<BlockResult, StoreError> {
    let store = Store::open(path)?;

    let worker = read_indices(&store, BLOCK_OWNER, "worker")?
        .first()
        .copied()
        .unwrap_or_default();
    let reactions = read_indices(&store, BLOCK_OWNER, "reactions")?;
    let directions = read_indices(&store, BLOCK_OWNER, "directions")?;
    let has_flux = read_indices(&store, BLOCK_OWNER, "hasFlux")?;
    let statuses = read_statuses(&store, BLOCK_OWNER, "status")?;
    let objectives = required(&store, BLOCK_OWNER, "objective")?.into_floats("objective")?;
    let (rows, flux) = match required(&store, BLOCK_OWNER, "flux")? {
        StoredArray::Float { rows, data, .. } => (rows, data),
        other => {
            return Err(StoreError::WrongKind {
                field: "flux".to_owned(),
                expected: ArrayKind::Float,
                found: other.kind(),
            })
        }
    };
    store.close()?;

    let tasks = reactions.len();
    if [directions.len(), has_flux.len(), statuses.len(), objectives.len()]
        .iter()
        .any(|len| *len != tasks)
    {
        return Err(StoreError::Corrupt {
            field: "reactions".to_owned(),
            reason: "block arrays differ in length".to_owned(),
        });
    }

    let mut columns = flux.chunks(rows.max(1));
    let mut results = Vec::with_capacity(tasks);
    for index in 0..tasks {
        let flux = if has_flux[index] == 1 {
            let column = columns.next().ok_or_else(|| StoreError::Corrupt {
                field: "flux".to_owned(),
                reason: "fewer flux vectors than flagged".to_owned(),
            })?;

            Some(column.to_vec())
        } else {
            None
        };

        results.push(TaskResult {
            reaction: reactions[index],
            direction: if directions[index] == 0 {
                Direction::Min
            } else {
                Direction::Max
            },
            status: statuses[index],
            objective: objectives[index],
            flux,
        });
    }

    Ok(BlockResult {
        worker,
        results,
        checkpoint: Some(path.to_path_buf()),
        runtime_ms: 0,
    })
}

/// results of `tasks` that could not be attempted, reported as not run
pub fn not_run(tasks: &[Task]) -> Vec<TaskResult> {
    tasks
        .iter()
        .map(|task| TaskResult {
            reaction: task.reaction,
            direction: task.direction,
            status: Status::Undefined,
            objective: f64::NAN,
            flux: None,
        })
        .collect()
}
