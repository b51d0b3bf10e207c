
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("Unknown partition strategy {0}, expected 0, 1 or 2")]
    UnknownStrategy(u8),
    #[error("Cannot split tasks over zero workers")]
    NoWorkers,
    #[error("Got {found} densities for {expected} tasks")]
    DensityLength { expected: usize, found: usize },
}

/// How the reaction list is split over the workers
#[derive(Serialize_repr, Deserialize_repr, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Strategy {
    /// even, contiguous split without looking at the cost of a task
    #[default]
    Blind = 0,
    /// every worker draws one dense task from the front and one sparse task from the back
    Extremal = 1,
    /// every worker draws one task from the front and one from the center of what is left
    Central = 2,
}

impl TryFrom<u8> for Strategy {
    type Error = PartitionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Blind),
            1 => Ok(Self::Extremal),
            2 => Ok(Self::Central),
            other => Err(PartitionError::UnknownStrategy(other)),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blind => write!(f, "0 (blind)"),
            Self::Extremal => write!(f, "1 (extremal dense-and-sparse)"),
            Self::Central => write!(f, "2 (central dense-and-sparse)"),
        }
    }
}

/// One block per worker, each block a list of positions into the task list.
pub type Blocks = Vec<Vec<usize>>;

/// task positions sorted by descending density, ties keep their original order
pub fn density_order(density: &[usize]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..density.len()).collect();
    order.sort_by(|a, b| density[*b].cmp(&density[*a]));

    order
}

impl Strategy {
    /// Split `task_count` tasks over `workers` blocks.
    ///
    /// `density` holds the cost proxy of every task and is only consulted by the
    /// dense-and-sparse strategies. The result is always a partition: every
    /// position in `0..task_count` lands in exactly one block.
    pub fn split(
        self,
        task_count: usize,
        workers: usize,
        density: &[usize],
    ) -> Result<Blocks, PartitionError> {
        if workers == 0 {
            return Err(PartitionError::NoWorkers);
        }

        let blocks = match self {
            Self::Blind => split_blind(task_count, workers),
            Self::Extremal | Self::Central => {
                if density.len() != task_count {
                    return Err(PartitionError::DensityLength {
                        expected: task_count,
                        found: density.len(),
                    });
                }

                let order = density_order(density);

                if self == Self::Extremal {
                    split_extremal(&order, workers)
                } else {
                    split_central(&order, workers)
                }
            }
        };

        debug!(
            strategy = %self,
            sizes = ?blocks.iter().map(Vec::len).collect::<Vec<_>>(),
            "Split {task_count} tasks over {workers} workers"
        );

        Ok(blocks)
    }
}

fn split_blind(task_count: usize, workers: usize) -> Blocks {
    if workers >= task_count {
        return (0..workers)
            .map(|worker| {
                if worker < task_count {
                    vec![worker]
                } else {
                    Vec::new()
                }
            })
            .collect();
    }

    let per_worker = task_count / workers;

    (0..workers)
        .map(|worker| {
            let start = worker * per_worker;
            // the remainder goes entirely to the last worker
            let end = if worker + 1 == workers {
                task_count
            } else {
                start + per_worker
            };

            (start..end).collect()
        })
        .collect()
}

fn split_extremal(order: &[usize], workers: usize) -> Blocks {
    let mut blocks = vec![Vec::new(); workers];
    let (mut front, mut back) = (0, order.len());

    'rounds: while front < back {
        for block in blocks.iter_mut() {
            if front >= back {
                break 'rounds;
            }

            block.push(order[front]);
            front += 1;

            if front < back {
                back -= 1;
                block.push(order[back]);
            }
        }
    }

    blocks
}

fn split_central(order: &[usize], workers: usize) -> Blocks {
    let mut blocks = vec![Vec::new(); workers];
    // Taking one task from each half keeps `center` at the midpoint of what is left
    let half = (order.len() + 1) / 2;
    let (mut front, mut center) = (0, half);

    'rounds: while front < half || center < order.len() {
        for block in blocks.iter_mut() {
            if front >= half && center >= order.len() {
                break 'rounds;
            }

            if front < half {
                block.push(order[front]);
                front += 1;
            }

            if center < order.len() {
                block.push(order[center]);
                center += 1;
            }
        }
    }

    blocks
}
