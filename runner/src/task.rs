use crate::{model::ObjectiveSense, solver::Status};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::path::PathBuf;

/// Which optimizations to run for a reaction
#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy, Default)]
#[repr(u8)]
pub enum OptMode {
    Minimize = 0,
    Maximize = 1,
    #[default]
    Both = 2,
}

impl OptMode {
    pub fn directions(self) -> &'static [Direction] {
        match self {
            Self::Minimize => &[Direction::Min],
            Self::Maximize => &[Direction::Max],
            Self::Both => &[Direction::Min, Direction::Max],
        }
    }
}

/// Either a single mode for every reaction or one mode per listed reaction
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum OptModes {
    All(OptMode),
    PerReaction(Vec<OptMode>),
}

impl Default for OptModes {
    fn default() -> Self {
        Self::All(OptMode::Both)
    }
}

#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum Direction {
    #[serde(rename = "min")]
    Min,
    #[serde(rename = "max")]
    Max,
}

impl Direction {
    pub fn sense(self) -> ObjectiveSense {
        match self {
            Self::Min => ObjectiveSense::Minimize,
            Self::Max => ObjectiveSense::Maximize,
        }
    }
}

/// A single LP: optimize the flux through `reaction` in `direction`
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Copy)]
pub struct Task {
    pub reaction: usize,
    pub direction: Direction,
}

#[derive(Deserialize, Serialize, PartialEq, Debug, Clone)]
pub struct TaskResult {
    pub reaction: usize,
    pub direction: Direction,
    pub status: Status,
    pub objective: f64,
    /// only present when flux vectors were requested and the solver returned one
    #[serde(default)]
    pub flux: Option<Vec<f64>>,
}

/// Work unit handed to a single worker
#[derive(Deserialize, Serialize, PartialEq, Debug, Clone)]
pub struct BlockJob {
    pub worker: usize,
    pub tasks: Vec<Task>,
    pub keep_flux_vectors: bool,
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
}

impl BlockJob {
    /// reactions touched by this block, in block order and without repetitions
    pub fn reactions(&self) -> Vec<usize> {
        let mut reactions: Vec<usize> = Vec::new();

        for task in self.tasks.iter() {
            if reactions.last() != Some(&task.reaction) {
                reactions.push(task.reaction);
            }
        }

        reactions
    }
}

/// Everything a worker sends back for one block
#[derive(Deserialize, Serialize, PartialEq, Debug, Clone)]
pub struct BlockResult {
    pub worker: usize,
    pub results: Vec<TaskResult>,
    /// per-worker file holding the full results when checkpointing is enabled
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,
    pub runtime_ms: u64,
}

/// Validated reaction list with one mode per reaction
#[derive(Debug, Clone, PartialEq)]
pub struct TaskPlan {
    pub reactions: Vec<usize>,
    pub modes: Vec<OptMode>,
}

impl TaskPlan {
    pub fn len(&self) -> usize {
        self.reactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactions.is_empty()
    }

    /// expand positions of the reaction list into tasks, min before max per reaction
    pub fn tasks(&self, positions: &[usize]) -> Vec<Task> {
        positions
            .iter()
            .flat_map(|position| {
                let reaction = self.reactions[*position];

                self.modes[*position]
                    .directions()
                    .iter()
                    .map(move |direction| Task {
                        reaction,
                        direction: *direction,
                    })
            })
            .collect()
    }

    /// reactions (in list order) that get solved in `direction`
    pub fn reactions_in(&self, direction: Direction) -> Vec<usize> {
        self.reactions
            .iter()
            .zip(self.modes.iter())
            .filter(|(_, mode)| mode.directions().contains(&direction))
            .map(|(reaction, _)| *reaction)
            .collect()
    }
}
