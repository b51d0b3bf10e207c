pub mod util;

use crate::{
    config::{PoolConfig, SshWorkerConfig},
    process::{run_with_input, ProcessError},
};
use once_cell::sync::Lazy;
use std::{env, ffi::OsStr, path::PathBuf, process::Command, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Environment variable holding the worker timeout in seconds
pub const WORKER_TIMEOUT_VAR: &str = "FLUXDIST_WORKER_TIMEOUT";

/// Optional limit for a remote worker to finish its block, read once from the environment
pub static WORKER_TIMEOUT: Lazy<Option<Duration>> = Lazy::new(|| {
    let value = env::var(WORKER_TIMEOUT_VAR).ok()?;

    match value.parse::<u64>() {
        Ok(seconds) => Some(Duration::from_secs(seconds)),
        Err(error) => {
            warn!("Ignoring {WORKER_TIMEOUT_VAR}={value}: {error}");
            None
        }
    }
});

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Failed to build the local thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Remote host {host} is unreachable")]
    Unreachable {
        host: String,
        #[source]
        source: ProcessError,
    },
    #[error("Remote host {host} rejected the probe: {stderr}")]
    ProbeFailed { host: String, stderr: String },
}

/// Connection details shared by all worker processes on one SSH host
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteHost {
    pub host: String,
    pub dir: PathBuf,
    pub flags: Vec<String>,
    pub exe: PathBuf,
    pub ssh_command: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerKind {
    /// a thread of the pool, solving in-process
    Local,
    /// a process on a remote host reached over SSH
    Remote(Arc<RemoteHost>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Worker {
    pub id: usize,
    pub kind: WorkerKind,
}

/// quote a single argument for the remote shell
fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        value.to_owned()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// like `shell_quote`, but keeps a leading `~/` outside of the quotes so it still expands
fn quote_dir(dir: &str) -> String {
    match dir.strip_prefix("~/") {
        Some(rest) => format!("~/{}", shell_quote(rest)),
        None => shell_quote(dir),
    }
}

impl RemoteHost {
    fn new(config: &SshWorkerConfig, ssh_command: &str) -> Self {
        Self {
            host: config.host.clone(),
            dir: config.dir.clone(),
            flags: config.flags.split_whitespace().map(str::to_owned).collect(),
            exe: config.exe.clone(),
            ssh_command: ssh_command.to_owned(),
        }
    }

    /// `program args..` executed in the working directory of the remote host
    pub fn command<S: AsRef<str>>(&self, program: &OsStr, args: &[S]) -> Command {
        let remote_line = std::iter::once(program.to_string_lossy().into_owned())
            .chain(args.iter().map(|arg| arg.as_ref().to_owned()))
            .map(|part| shell_quote(&part))
            .collect::<Vec<_>>()
            .join(" ");

        let mut command = Command::new(&self.ssh_command);
        command.args(&self.flags).arg(&self.host).arg(format!(
            "cd {} && {remote_line}",
            quote_dir(&self.dir.to_string_lossy())
        ));

        command
    }

    fn probe(&self) -> Result<(), PoolError> {
        let mut command = self.command(OsStr::new("true"), &[] as &[&str]);

        match run_with_input(&mut command, "", Some(PROBE_TIMEOUT)) {
            Ok(output) if output.status.success() => {
                debug!(host = %self.host, "Probed remote host");
                Ok(())
            }
            Ok(output) => Err(PoolError::ProbeFailed {
                host: self.host.clone(),
                stderr: output.stderr,
            }),
            Err(source) => Err(PoolError::Unreachable {
                host: self.host.clone(),
                source,
            }),
        }
    }
}

impl Worker {
    /// command running `program` on this worker's machine
    pub fn command<S: AsRef<str>>(&self, program: &OsStr, args: &[S]) -> Command {
        match &self.kind {
            WorkerKind::Local => {
                let mut command = Command::new(program);
                command.args(args.iter().map(|arg| arg.as_ref()));

                command
            }
            WorkerKind::Remote(host) => host.command(program, args),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.kind, WorkerKind::Remote(_))
    }
}

/// A fixed set of workers, provisioned once and reused for every block of a run
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Worker>,
    threads: rayon::ThreadPool,
}

impl WorkerPool {
    pub fn acquire(config: &PoolConfig) -> Result<Self, PoolError> {
        let mut workers: Vec<Worker> = (0..config.local)
            .map(|id| Worker {
                id,
                kind: WorkerKind::Local,
            })
            .collect();

        for ssh in config.ssh.iter().filter(|ssh| ssh.procs > 0) {
            let host = Arc::new(RemoteHost::new(ssh, &config.ssh_command));

            if config.probe {
                host.probe()?;
            }

            for _ in 0..ssh.procs {
                workers.push(Worker {
                    id: workers.len(),
                    kind: WorkerKind::Remote(host.clone()),
                });
            }
        }

        if workers.is_empty() {
            warn!("Acquired an empty worker pool");
        }

        // every worker gets its own thread, remote workers block theirs while waiting
        let pin_threads = config.pin_threads;
        let local = config.local;
        let cores = affinity::get_core_num();
        let threads = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.len().max(1))
            .thread_name(|index| format!("fluxdist-worker-{index}"))
            .start_handler(move |index| {
                if pin_threads && index < local && cores > 0 {
                    if let Err(error) = affinity::set_thread_affinity([index % cores]) {
                        error!("Failed to pin worker thread {index}: {error}");
                    }
                }
            })
            .build()?;

        info!(
            local = config.local,
            remote = workers.len() - config.local,
            "Acquired worker pool"
        );

        Ok(Self { workers, threads })
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// run `op` inside the pool's threads
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.threads.install(op)
    }

    pub fn release(self) {
        info!(workers = self.workers.len(), "Released worker pool");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> RemoteHost {
        RemoteHost::new(
            &SshWorkerConfig {
                host: "first.last@server.com".into(),
                procs: 2,
                dir: PathBuf::from("~/fluxdist dir"),
                flags: "-4 -p22".into(),
                exe: PathBuf::from("/usr/bin/fluxdist"),
            },
            "ssh",
        )
    }

    #[test]
    fn remote_command_runs_in_working_dir() {
        let command = remote().command(OsStr::new("/usr/bin/fluxdist"), &["worker"]);

        assert_eq!(command.get_program(), "ssh");
        assert_eq!(
            command.get_args().collect::<Vec<_>>(),
            vec![
                "-4",
                "-p22",
                "first.last@server.com",
                "cd ~/'fluxdist dir' && /usr/bin/fluxdist worker"
            ]
        );
    }

    #[test]
    fn quotes_shell_arguments() {
        assert_eq!(shell_quote("plain-arg_1.0"), "plain-arg_1.0");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(quote_dir("~/COBRA"), "~/COBRA");
        assert_eq!(quote_dir("/data/my models"), "'/data/my models'");
    }

    #[test]
    fn acquires_local_and_remote_workers() {
        let pool = WorkerPool::acquire(&PoolConfig {
            local: 2,
            ssh: vec![SshWorkerConfig {
                host: "node".into(),
                procs: 3,
                dir: PathBuf::from("/tmp"),
                flags: String::new(),
                exe: PathBuf::from("fluxdist"),
            }],
            ..PoolConfig::default()
        })
        .unwrap();

        assert_eq!(pool.size(), 5);
        assert_eq!(pool.workers().iter().filter(|w| w.is_remote()).count(), 3);
        assert!(pool
            .workers()
            .iter()
            .enumerate()
            .all(|(index, worker)| worker.id == index));
        assert_eq!(pool.install(rayon::current_num_threads), 5);
        pool.release();
    }

    #[test]
    fn unreachable_host_fails_probe() {
        let result = WorkerPool::acquire(&PoolConfig {
            local: 1,
            ssh: vec![SshWorkerConfig {
                host: "node".into(),
                procs: 1,
                dir: PathBuf::from("/tmp"),
                flags: String::new(),
                exe: PathBuf::from("fluxdist"),
            }],
            ssh_command: "/nonexistent/ssh".into(),
            probe: true,
            ..PoolConfig::default()
        });

        assert!(matches!(result, Err(PoolError::Unreachable { .. })));
    }
}
