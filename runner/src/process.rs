use std::{
    io::{ErrorKind, Read, Write},
    process::{ChildStdin, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::debug;
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn child process")]
    Spawn(#[source] std::io::Error),
    #[error("Failed to communicate with child process")]
    Io(#[from] std::io::Error),
    #[error("Child process ran into timeout after {0:?}")]
    Timeout(Duration),
    #[error("Output reader thread panicked")]
    Reader,
    #[error("Input writer thread panicked")]
    Writer,
}

#[derive(Debug, Clone)]
/// container for everything a finished child process left behind
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub runtime: Duration,
}

fn drain<R: Read + Send + 'static>(source: Option<R>) -> thread::JoinHandle<std::io::Result<String>> {
    thread::spawn(move || {
        let mut buffer = String::new();

        if let Some(mut source) = source {
            source.read_to_string(&mut buffer)?;
        }

        Ok(buffer)
    })
}

fn feed(sink: Option<ChildStdin>, input: Vec<u8>) -> thread::JoinHandle<std::io::Result<()>> {
    thread::spawn(move || {
        if let Some(mut sink) = sink {
            match sink.write_all(&input) {
                // the child stopped reading, its exit status tells why
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    debug!("Child process closed its stdin early")
                }
                result => result?,
            }
        }
        // dropping the sink closes the pipe, the child sees a clear end of input

        Ok(())
    })
}

/// Spawn `command`, feed `input` to its stdin and collect stdout/ stderr.
/// Without a timeout this waits for as long as the child runs.
pub fn run_with_input(
    command: &mut Command,
    input: impl Into<Vec<u8>>,
    timeout: Option<Duration>,
) -> Result<ProcessOutput, ProcessError> {
    let start = Instant::now();
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(ProcessError::Spawn)?;

    // all pipes are served concurrently, the timeout starts counting right away
    let stdin = feed(child.stdin.take(), input.into());
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    debug!(pid = child.id(), "Waiting on child process");
    let status = match timeout {
        Some(timeout) => match child.wait_timeout(timeout)? {
            Some(status) => status,
            None => {
                child.kill()?;
                child.wait()?;

                return Err(ProcessError::Timeout(timeout));
            }
        },
        None => child.wait()?,
    };

    stdin.join().map_err(|_| ProcessError::Writer)??;
    let stdout = stdout.join().map_err(|_| ProcessError::Reader)??;
    let stderr = stderr.join().map_err(|_| ProcessError::Reader)??;

    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        runtime: start.elapsed(),
    })
}
