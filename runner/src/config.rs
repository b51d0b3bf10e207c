use crate::{
    model::{Model, ObjectiveSense},
    partition::{PartitionError, Strategy},
    results::{ResultField, ALL_RESULT_FIELDS},
    store::{ModelField, StoreError, DEFAULT_MODEL_FIELDS},
    task::{OptModes, TaskPlan},
};
use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    collections::BTreeSet, env, fs::File, io::Error, os::unix::fs::MetadataExt, path::Path,
    path::PathBuf,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read configuration")]
    Read(#[source] Error),
    #[error("Failed to parse configuration")]
    Parse(#[from] serde_yaml::Error),
    #[error("Configuration contains errors, see the log above")]
    Preflight,
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[source] Error),
    #[error("Failed to load model")]
    Model(#[from] StoreError),
    #[error("Reaction list is empty")]
    EmptyReactionList,
    #[error("Reaction index {index} is out of range for a model with {reactions} reactions")]
    ReactionOutOfRange { index: usize, reactions: usize },
    #[error("Reaction {0} is listed more than once")]
    DuplicateReaction(usize),
    #[error("{reactions} reactions were listed but {modes} optimization modes were given")]
    ModeLengthMismatch { reactions: usize, modes: usize },
    #[error("Optimization percentage {0} lies outside of [0, 100]")]
    InvalidPercentage(f64),
    #[error("Invalid partition strategy")]
    Strategy(#[from] PartitionError),
    #[error("Worker {0} is remote, but the solver cannot be shipped to remote workers")]
    RemoteSolverUnavailable(usize),
}

/// Everything needed for one distributed run, read from a YAML file
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub model: ModelConfig,
    pub solver: SolverConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    pub output: Option<OutputConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub path: PathBuf,
    // field name of the constraint matrix, usually S or A
    #[serde(default = "default_matrix")]
    pub matrix: String,
    // name of the model struct inside the file
    #[serde(default = "default_model_name")]
    pub name: String,
    #[serde(default = "default_model_fields")]
    pub fields: Vec<ModelField>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SolverConfig {
    pub name: String,
    // solver executable, speaks YAML over stdin/ stdout
    pub exec: PathBuf,
    // ordered parameter list, forwarded with every solve
    #[serde(default)]
    pub params: Vec<(String, serde_yaml::Value)>,
    #[serde(default = "default_solver_timeout")]
    pub timeout_ms: u64,
}

/// All options of a distributed FBA/ FVA run and their defaults
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AnalysisConfig {
    /// only consider solutions within this percentage of the optimum
    #[serde(default = "default_percentage")]
    pub opt_percentage: f64,
    /// sense of the original objective
    #[serde(
        default,
        deserialize_with = "objective_from_str",
        serialize_with = "objective_to_str"
    )]
    pub objective: ObjectiveSense,
    /// reactions to analyze, all reactions if absent
    #[serde(default)]
    pub reactions: Option<Vec<usize>>,
    #[serde(default)]
    pub opt_modes: OptModes,
    #[serde(default)]
    pub strategy: Strategy,
    /// solve the original objective first and bound it
    #[serde(default = "default_true")]
    pub pre_fba: bool,
    #[serde(default = "default_true")]
    pub keep_flux_vectors: bool,
    /// write every block to a per-worker file instead of shipping flux vectors back
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            opt_percentage: default_percentage(),
            objective: ObjectiveSense::Maximize,
            reactions: None,
            opt_modes: OptModes::default(),
            strategy: Strategy::default(),
            pre_fba: true,
            keep_flux_vectors: true,
            checkpoint_dir: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// number of local workers
    #[serde(default = "num_cpus::get")]
    pub local: usize,
    #[serde(default)]
    pub ssh: Vec<SshWorkerConfig>,
    #[serde(default = "default_ssh_command")]
    pub ssh_command: String,
    /// pin local workers to cores
    #[serde(default)]
    pub pin_threads: bool,
    /// check that every SSH host is reachable while acquiring the pool
    #[serde(default)]
    pub probe: bool,
}

impl PoolConfig {
    /// read a pool description, either on its own or as the `pool` section of a run file
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path).map_err(ConfigErrors::Read)?;
        let document: serde_yaml::Value = serde_yaml::from_reader(file)?;
        let section = document.get("pool").cloned().unwrap_or(document);

        Ok(serde_yaml::from_value(section)?)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            local: num_cpus::get(),
            ssh: Vec::new(),
            ssh_command: default_ssh_command(),
            pin_threads: false,
            probe: false,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SshWorkerConfig {
    #[serde(alias = "usernode")]
    pub host: String,
    pub procs: usize,
    pub dir: PathBuf,
    // extra flags for the ssh invocation, e.g. `-4 -p22`
    #[serde(default)]
    pub flags: String,
    #[serde(alias = "exename")]
    pub exe: PathBuf,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    pub path: PathBuf,
    #[serde(default = "default_result_fields")]
    pub fields: Vec<ResultField>,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path).map_err(ConfigErrors::Read)?;

        Ok(serde_yaml::from_reader(file)?)
    }

    /// Check the configuration and report every problem found, returns true on errors
    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if !self.model.path.is_file() {
            error!(
                "model.path ({}) is either not a file or not found",
                self.model.path.to_string_lossy()
            );
            contains_error = true;
        }

        match check_executable(&self.solver.exec) {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    "Solver {} target {} is not executable",
                    self.solver.name,
                    self.solver.exec.to_string_lossy()
                );
                contains_error = true;
            }
            Err(e) => {
                error!(
                    "Failed to determine if solver.exec ({}) is an executable: {e}",
                    self.solver.exec.to_string_lossy()
                );
                contains_error = true;
            }
        }

        if self.solver.timeout_ms == 0 {
            error!("solver.timeout_ms cannot be 0");
            contains_error = true;
        }

        let duplicated_params = self
            .solver
            .params
            .iter()
            .map(|(name, _)| name)
            .duplicates()
            .collect_vec();
        if !duplicated_params.is_empty() {
            warn!("solver.params sets {duplicated_params:?} more than once, the last value wins");
        }

        if let Err(e) = self.analysis.check_percentage() {
            error!("analysis.opt_percentage: {e}");
            contains_error = true;
        }

        if let (Some(reactions), OptModes::PerReaction(modes)) =
            (&self.analysis.reactions, &self.analysis.opt_modes)
        {
            if reactions.len() != modes.len() {
                error!(
                    "analysis.reactions lists {} reactions but analysis.opt_modes has {} entries",
                    reactions.len(),
                    modes.len()
                );
                contains_error = true;
            }
        }

        if self.pool.local == 0 && self.pool.ssh.is_empty() {
            error!("pool contains neither local nor ssh workers");
            contains_error = true;
        }

        for (index, worker) in self.pool.ssh.iter().enumerate() {
            if worker.procs == 0 {
                warn!("pool.ssh[{index}] ({}) has procs = 0 and is ignored", worker.host);
            }

            if worker.host.is_empty() {
                error!("pool.ssh[{index}].host cannot be empty");
                contains_error = true;
            }
        }

        if let Some(output) = self.output.as_mut() {
            if output.fields.is_empty() {
                warn!("output.fields is empty. Falling back to all fields");
                output.fields = default_result_fields();
            }
        }

        contains_error
    }
}

impl AnalysisConfig {
    fn check_percentage(&self) -> Result<(), ConfigErrors> {
        if (0.0..=100.0).contains(&self.opt_percentage) {
            Ok(())
        } else {
            Err(ConfigErrors::InvalidPercentage(self.opt_percentage))
        }
    }

    /// Validate the reaction list and modes against `model`
    pub fn plan(&self, model: &Model) -> Result<TaskPlan, ConfigErrors> {
        self.check_percentage()?;

        let reactions = match &self.reactions {
            Some(reactions) => reactions.clone(),
            None => (0..model.reactions()).collect(),
        };

        if reactions.is_empty() {
            return Err(ConfigErrors::EmptyReactionList);
        }

        let mut seen = BTreeSet::new();
        for reaction in reactions.iter() {
            if *reaction >= model.reactions() {
                return Err(ConfigErrors::ReactionOutOfRange {
                    index: *reaction,
                    reactions: model.reactions(),
                });
            }

            if !seen.insert(*reaction) {
                return Err(ConfigErrors::DuplicateReaction(*reaction));
            }
        }

        let modes = match &self.opt_modes {
            OptModes::All(mode) => vec![*mode; reactions.len()],
            OptModes::PerReaction(modes) => {
                if modes.len() != reactions.len() {
                    return Err(ConfigErrors::ModeLengthMismatch {
                        reactions: reactions.len(),
                        modes: modes.len(),
                    });
                }

                modes.clone()
            }
        };

        Ok(TaskPlan { reactions, modes })
    }
}

/// Solver executables the original tooling knew about
pub const KNOWN_SOLVERS: [&str; 7] = [
    "glpsol", "clp", "cbc", "highs", "cplex", "gurobi_cl", "mosek",
];

/// find all known solver executables on `PATH`
pub fn installed_solvers() -> Vec<(&'static str, PathBuf)> {
    let paths = env::var_os("PATH").unwrap_or_default();

    KNOWN_SOLVERS
        .iter()
        .filter_map(|solver| {
            env::split_paths(&paths)
                .map(|dir| dir.join(solver))
                .find(|candidate| matches!(check_executable(candidate), Ok(true)))
                .map(|path| (*solver, path))
        })
        .collect()
}

fn objective_from_str<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ObjectiveSense, D::Error> {
    String::deserialize(deserializer)?
        .parse()
        .map_err(serde::de::Error::custom)
}

fn objective_to_str<S: Serializer>(objective: &ObjectiveSense, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&objective.to_string())
}

fn default_matrix() -> String {
    "S".to_owned()
}

fn default_model_name() -> String {
    "model".to_owned()
}

fn default_model_fields() -> Vec<ModelField> {
    DEFAULT_MODEL_FIELDS.to_vec()
}

fn default_result_fields() -> Vec<ResultField> {
    ALL_RESULT_FIELDS.to_vec()
}

fn default_solver_timeout() -> u64 {
    60_000
}

fn default_percentage() -> f64 {
    100.0
}

fn default_true() -> bool {
    true
}

fn default_ssh_command() -> String {
    "ssh".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::tests::small_model, task::OptMode};

    const CONFIG: &str = "
model:
  path: ecoli_core_model.db
solver:
  name: glpk
  exec: /usr/bin/glpk-yaml
  params:
    - [presolve, true]
    - [tmlim, 100]
analysis:
  opt_percentage: 90
  objective: max
  reactions: [1, 0]
  opt_modes: [0, 2]
  strategy: 1
pool:
  local: 2
  ssh:
    - usernode: first.last@server.com
      procs: 32
      dir: ~/fluxdist
      flags: -4 -p22
      exename: /usr/local/bin/fluxdist
output:
  path: results.db
";

    #[test]
    fn parses_full_config() {
        let config: RunConfig = serde_yaml::from_str(CONFIG).unwrap();

        assert_eq!(config.model.matrix, "S");
        assert_eq!(config.model.fields, DEFAULT_MODEL_FIELDS.to_vec());
        assert_eq!(config.solver.params.len(), 2);
        assert_eq!(config.solver.timeout_ms, 60_000);
        assert_eq!(config.analysis.strategy, Strategy::Extremal);
        assert_eq!(config.analysis.objective, ObjectiveSense::Maximize);
        assert!(config.analysis.pre_fba);
        assert_eq!(config.pool.ssh[0].host, "first.last@server.com");
        assert_eq!(config.pool.ssh_command, "ssh");
        assert_eq!(config.output.unwrap().fields, ALL_RESULT_FIELDS.to_vec());
    }

    #[test]
    fn rejects_unknown_strategy_and_fields() {
        let bad_strategy = CONFIG.replace("strategy: 1", "strategy: 7");
        assert!(serde_yaml::from_str::<RunConfig>(&bad_strategy).is_err());

        let unknown_field = CONFIG.replace("strategy: 1", "strategy: 1\n  workers: 3");
        assert!(serde_yaml::from_str::<RunConfig>(&unknown_field).is_err());
    }

    #[test]
    fn preflight_collects_errors() {
        let mut config: RunConfig = serde_yaml::from_str(CONFIG).unwrap();
        config.analysis.opt_modes = OptModes::PerReaction(vec![OptMode::Both]);

        // model, solver and mode list are all broken
        assert!(config.preflight_checks());
    }

    #[test]
    fn plan_defaults_to_all_reactions() {
        let plan = AnalysisConfig::default().plan(&small_model()).unwrap();

        assert_eq!(plan.reactions, vec![0, 1]);
        assert_eq!(plan.modes, vec![OptMode::Both; 2]);
    }

    #[test]
    fn plan_rejects_bad_lists() {
        let model = small_model();
        let config = |reactions: Vec<usize>, modes: OptModes| AnalysisConfig {
            reactions: Some(reactions),
            opt_modes: modes,
            ..AnalysisConfig::default()
        };

        assert!(matches!(
            config(vec![0, 2], OptModes::default()).plan(&model),
            Err(ConfigErrors::ReactionOutOfRange { index: 2, .. })
        ));
        assert!(matches!(
            config(vec![1, 1], OptModes::default()).plan(&model),
            Err(ConfigErrors::DuplicateReaction(1))
        ));
        assert!(matches!(
            config(vec![], OptModes::default()).plan(&model),
            Err(ConfigErrors::EmptyReactionList)
        ));
        assert!(matches!(
            config(vec![0, 1], OptModes::PerReaction(vec![OptMode::Minimize])).plan(&model),
            Err(ConfigErrors::ModeLengthMismatch {
                reactions: 2,
                modes: 1
            })
        ));
        assert!(matches!(
            AnalysisConfig {
                opt_percentage: 120.0,
                ..AnalysisConfig::default()
            }
            .plan(&model),
            Err(ConfigErrors::InvalidPercentage(_))
        ));
    }

    #[test]
    fn pool_loads_from_run_file_or_on_its_own() {
        let dir = tempfile::tempdir().unwrap();
        let run = dir.path().join("run.yaml");
        let bare = dir.path().join("pool.yaml");
        std::fs::write(&run, CONFIG).unwrap();
        std::fs::write(&bare, "local: 0\nssh:\n  - {host: node, procs: 4, dir: /tmp, exe: fluxdist}\n").unwrap();

        let from_run = PoolConfig::load(&run).unwrap();
        assert_eq!(from_run.local, 2);
        assert_eq!(from_run.ssh[0].host, "first.last@server.com");
        assert_eq!(from_run.ssh[0].procs, 32);

        let from_bare = PoolConfig::load(&bare).unwrap();
        assert_eq!(from_bare.local, 0);
        assert_eq!(from_bare.ssh[0].procs, 4);
        assert_eq!(from_bare.ssh_command, "ssh");
    }
}
