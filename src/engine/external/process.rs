use std::fs::File;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::BackendError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs an engine to completion with stdout redirected to `stdout_path`.
///
/// With a `timeout`, the child is polled and killed once the bound elapses,
/// which surfaces as [`BackendError::Timeout`]. On unix the engine gets its
/// own process group and the whole group is killed, MPI ranks included.
pub fn run(
    mut command: Command,
    stdout_path: &Path,
    timeout: Option<Duration>,
) -> Result<ExitStatus, BackendError> {
    let stdout = File::create(stdout_path)?;
    let stderr = stdout.try_clone()?;

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    debug!("Spawning {:?}", command);
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
        .map_err(|e| {
            BackendError::Evaluation(format!(
                "failed to spawn {:?}: {}",
                command.get_program(),
                e
            ))
        })?;

    let Some(limit) = timeout else {
        return Ok(child.wait()?);
    };

    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if started.elapsed() >= limit {
            warn!(
                "{:?} exceeded {:?}, killing pid {}",
                command.get_program(),
                limit,
                child.id()
            );
            kill_tree(&mut child);
            return Err(BackendError::Timeout(limit));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: plain syscall; the group was created for this child.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}
