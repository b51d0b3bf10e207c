use fluxdist_runner::{
    config::{AnalysisConfig, PoolConfig, SolverConfig, SshWorkerConfig},
    model::{Model, ObjectiveSense, SparseMatrix},
    orchestrator::{Orchestrator, RunState},
    partition::Strategy,
    pool::WorkerPool,
    results::{load, persist, ALL_RESULT_FIELDS},
    solver::{exec::ExecSolver, LpSession, Solution, Solver, SolverError, Status},
    store::{load_model, save_model, DEFAULT_MODEL_FIELDS},
    task::{OptMode, OptModes},
};
use std::{fs, os::unix::fs::PermissionsExt, path::Path, path::PathBuf};

const REACTIONS: usize = 20;

/// Solves LPs without constraint rows: every flux sits on one of its bounds
struct BoxSolver {
    remote: Option<SolverConfig>,
}

struct BoxSession {
    lb: Vec<f64>,
    ub: Vec<f64>,
}

impl Solver for BoxSolver {
    type Session = BoxSession;

    fn name(&self) -> &str {
        "box"
    }

    fn build(&self, model: &Model) -> Result<Self::Session, SolverError> {
        Ok(BoxSession {
            lb: model.lb.clone(),
            ub: model.ub.clone(),
        })
    }

    fn remote_config(&self) -> Option<&SolverConfig> {
        self.remote.as_ref()
    }
}

impl LpSession for BoxSession {
    fn solve(&mut self, c: &[f64], osense: ObjectiveSense) -> Result<Solution, SolverError> {
        let solution: Vec<f64> = c
            .iter()
            .zip(self.lb.iter().zip(self.ub.iter()))
            .map(|(c, (lb, ub))| {
                let upper = match osense {
                    ObjectiveSense::Maximize => *c > 0.0,
                    ObjectiveSense::Minimize => *c < 0.0,
                };

                if upper {
                    *ub
                } else {
                    *lb
                }
            })
            .collect();

        Ok(Solution {
            status: Status::Optimal,
            objective: c.iter().zip(solution.iter()).map(|(c, v)| c * v).sum(),
            solution,
        })
    }
}

/// reaction i may carry a flux in [-i, 2i]
fn box_model() -> Model {
    Model {
        a: SparseMatrix::new(0, REACTIONS),
        b: Vec::new(),
        c: (0..REACTIONS).map(|i| if i == 0 { 1.0 } else { 0.0 }).collect(),
        lb: (0..REACTIONS).map(|i| -(i as f64)).collect(),
        ub: (0..REACTIONS).map(|i| 2.0 * i as f64).collect(),
        osense: ObjectiveSense::Maximize,
        csense: Vec::new(),
        rxns: (0..REACTIONS).map(|i| format!("R{i}")).collect(),
        mets: Vec::new(),
    }
}

fn scenario() -> AnalysisConfig {
    AnalysisConfig {
        reactions: Some(vec![1, 5, 9]),
        opt_modes: OptModes::PerReaction(vec![OptMode::Minimize, OptMode::Maximize, OptMode::Both]),
        strategy: Strategy::Blind,
        pre_fba: false,
        ..AnalysisConfig::default()
    }
}

fn executable(path: &Path, body: &str) -> PathBuf {
    fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();

    path.to_path_buf()
}

#[test]
fn only_listed_reactions_are_populated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.db");
    save_model(&path, "S", "model", &box_model()).unwrap();
    let model = load_model(&path, "S", "model", &DEFAULT_MODEL_FIELDS).unwrap();

    let pool = WorkerPool::acquire(&PoolConfig {
        local: 2,
        ..PoolConfig::default()
    })
    .unwrap();
    let mut orchestrator = Orchestrator::new(&pool, BoxSolver { remote: None });
    let result = orchestrator.distributed_fba(&model, &scenario()).unwrap();

    assert_eq!(orchestrator.state(), RunState::Done);
    assert!(!orchestrator.history().contains(&RunState::PreSolving));

    assert_eq!(result.min_flux[1], -1.0);
    assert_eq!(result.max_flux[5], 10.0);
    assert_eq!(result.min_flux[9], -9.0);
    assert_eq!(result.max_flux[9], 18.0);

    for reaction in 0..REACTIONS {
        let min_run = reaction == 1 || reaction == 9;
        let max_run = reaction == 5 || reaction == 9;

        assert_eq!(result.status_min[reaction].was_run(), min_run, "min {reaction}");
        assert_eq!(result.status_max[reaction].was_run(), max_run, "max {reaction}");
        assert_eq!(!result.min_flux[reaction].is_nan(), min_run);
        assert_eq!(!result.max_flux[reaction].is_nan(), max_run);
    }

    assert_eq!(result.fva_min.reactions, vec![1, 9]);
    assert_eq!(result.fva_max.reactions, vec![5, 9]);
    assert_eq!(result.fva_max.column(5).unwrap()[5], 10.0);
    assert!(result.failures.is_empty());
    assert_eq!(result.info.workers, 2);

    pool.release();
}

#[test]
fn results_survive_a_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("results.db");
    let pool = WorkerPool::acquire(&PoolConfig {
        local: 3,
        ..PoolConfig::default()
    })
    .unwrap();

    let result = Orchestrator::new(&pool, BoxSolver { remote: None })
        .distributed_fba(
            &box_model(),
            &AnalysisConfig {
                strategy: Strategy::Extremal,
                ..AnalysisConfig::default()
            },
        )
        .unwrap();
    persist(&result, &output, &ALL_RESULT_FIELDS).unwrap();
    let loaded = load(&output, &ALL_RESULT_FIELDS).unwrap();

    let bits = |values: &[f64]| values.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&loaded.min_flux.unwrap()), bits(&result.min_flux));
    assert_eq!(bits(&loaded.max_flux.unwrap()), bits(&result.max_flux));
    assert_eq!(bits(&loaded.fba_sol.unwrap()), bits(&result.fba_sol));
    assert_eq!(loaded.opt_sol.unwrap().to_bits(), result.opt_sol.to_bits());
    assert_eq!(loaded.fva_max.unwrap().data.len(), REACTIONS * REACTIONS);
    assert_eq!(loaded.status_min.unwrap(), result.status_min);
    assert_eq!(loaded.reactions.unwrap(), (0..REACTIONS).collect::<Vec<_>>());

    // reaction 0 is fixed at zero by its bounds
    assert_eq!(result.baseline_status, Status::Optimal);
    assert_eq!(result.opt_sol, 0.0);
}

#[test]
fn unreachable_worker_drops_its_block() {
    let pool = WorkerPool::acquire(&PoolConfig {
        local: 1,
        ssh: vec![SshWorkerConfig {
            host: "node".into(),
            procs: 1,
            dir: PathBuf::from("/tmp"),
            flags: String::new(),
            exe: PathBuf::from("fluxdist"),
        }],
        ssh_command: "/nonexistent/ssh".into(),
        ..PoolConfig::default()
    })
    .unwrap();
    let solver = BoxSolver {
        remote: Some(SolverConfig {
            name: "box".into(),
            exec: PathBuf::from("/nonexistent/solver"),
            params: Vec::new(),
            timeout_ms: 1_000,
        }),
    };

    let result = Orchestrator::new(&pool, solver)
        .distributed_fba(&box_model(), &scenario())
        .unwrap();

    // blind split over two workers: [1] locally, [5, 9] on the remote host
    assert_eq!(result.min_flux[1], -1.0);
    assert!(result.max_flux[5].is_nan());
    assert!(result.min_flux[9].is_nan() && result.max_flux[9].is_nan());
    assert_eq!(result.status_max[9], Status::Undefined);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].worker, 1);
    assert_eq!(result.failures[0].reactions, vec![5, 9]);
    assert!(result.is_partial());
}

#[test]
fn remote_workers_speak_yaml_over_ssh() {
    let dir = tempfile::tempdir().unwrap();
    // stands in for ssh: drop the host and run the remote command line locally
    let ssh = executable(&dir.path().join("ssh"), "shift\nexec /bin/sh -c \"$1\"");
    let values = vec!["3.0"; REACTIONS].join(", ");
    let solver = executable(
        &dir.path().join("solver.sh"),
        &format!("cat > /dev/null\nprintf 'status: 1\\nobjective: 3.0\\nsolution: [{values}]\\n'"),
    );

    let pool = WorkerPool::acquire(&PoolConfig {
        local: 0,
        ssh: vec![SshWorkerConfig {
            host: "node".into(),
            procs: 2,
            dir: dir.path().to_path_buf(),
            flags: String::new(),
            exe: PathBuf::from(env!("CARGO_BIN_EXE_fluxdist")),
        }],
        ssh_command: ssh.to_string_lossy().into_owned(),
        ..PoolConfig::default()
    })
    .unwrap();
    let solver = ExecSolver::new(SolverConfig {
        name: "fixed".into(),
        exec: solver,
        params: Vec::new(),
        timeout_ms: 5_000,
    });

    let result = Orchestrator::new(&pool, solver)
        .distributed_fba(&box_model(), &scenario())
        .unwrap();

    assert!(result.failures.is_empty(), "{:?}", result.failures);
    assert_eq!(result.min_flux[1], 3.0);
    assert_eq!(result.max_flux[5], 3.0);
    assert_eq!(result.status_max[9], Status::Optimal);
    assert_eq!(result.fva_max.column(9).unwrap(), &[3.0; REACTIONS][..]);
    assert!(result.max_flux[1].is_nan());
}

#[test]
fn checkpoints_are_written_per_worker() {
    let dir = tempfile::tempdir().unwrap();
    let pool = WorkerPool::acquire(&PoolConfig {
        local: 2,
        ..PoolConfig::default()
    })
    .unwrap();

    let result = Orchestrator::new(&pool, BoxSolver { remote: None })
        .distributed_fba(
            &box_model(),
            &AnalysisConfig {
                checkpoint_dir: Some(dir.path().to_path_buf()),
                ..scenario()
            },
        )
        .unwrap();

    assert_eq!(result.checkpoints.len(), 2);
    assert!(result.checkpoints.iter().all(|path| path.is_file()));
    // fluxes come back, flux vectors stay in the checkpoints
    assert_eq!(result.max_flux[9], 18.0);
    assert!(result.fva_max.column(9).unwrap().iter().all(|v| v.is_nan()));
}
