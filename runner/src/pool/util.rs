use std::path::{Path, PathBuf};
use tracing::error;

/// name of the machine this process runs on, `localhost` if it can't be determined
pub fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(hostname) => hostname.to_string_lossy().into_owned(),
        Err(error) => {
            error!(error = ?error, "Failed to retrieve hostname: {error}");

            "localhost".to_owned()
        }
    }
}

/// per-worker result file inside `dir`, prefixed by the host so shared directories don't collide
pub fn checkpoint_path(dir: &Path, worker: usize) -> PathBuf {
    dir.join(checkpoint_file_name(&hostname(), worker))
}

pub fn checkpoint_file_name(hostname: &str, worker: usize) -> String {
    format!("{hostname}_worker{worker}.db")
}
