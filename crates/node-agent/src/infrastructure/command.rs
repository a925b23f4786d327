//! Blocking subprocess helpers shared by the CLI-driven backends

use std::io::Read;
use std::path::PathBuf;
use std::process::Child;
use std::process::Command;
use std::process::Stdio;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;
use tracing::warn;

use crate::domain::scheduling::BackendError;
use crate::domain::scheduling::PullHandle;
use crate::domain::scheduling::PullProgress;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

fn describe(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn drain<R: Read + Send + 'static>(source: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut source) = source {
            let _ = source.read_to_string(&mut buf);
        }
        buf
    })
}

/// Run `program` to completion, killing it once `timeout` elapses.
pub fn run_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<CommandOutput, BackendError> {
    let command_line = describe(program, args);
    debug!(command = %command_line, "Running backend command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BackendError::Timeout(command_line));
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(CommandOutput {
        success: status.success(),
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

/// Map a failed command's stderr onto the backend error taxonomy.
pub fn classify_failure(command: &str, stderr: &str) -> BackendError {
    let message = stderr.trim().to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("no space left on device") {
        BackendError::NoDiskSpace(message)
    } else if lower.contains("no such image")
        || lower.contains("pull access denied")
        || lower.contains("manifest unknown")
    {
        BackendError::ImageNotFound(message)
    } else if lower.contains("no such container")
        || lower.contains("no such object")
        || lower.contains("failed to get domain")
        || lower.contains("domain not found")
    {
        BackendError::NotFound(message)
    } else {
        BackendError::CommandFailed {
            command: command.to_string(),
            message,
        }
    }
}

/// Run and turn a non-zero exit into a classified error; returns trimmed stdout.
pub fn run_checked(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<String, BackendError> {
    let output = run_with_timeout(program, args, timeout)?;
    if output.success {
        Ok(output.stdout.trim().to_string())
    } else {
        Err(classify_failure(&describe(program, args), &output.stderr))
    }
}

/// Background child process standing in for an artifact pull.
///
/// When `finish` is set, a successful exit renames the staged download into place.
pub struct ProcessPull {
    child: Child,
    finish: Option<(PathBuf, PathBuf)>,
}

impl ProcessPull {
    pub fn spawn(
        program: &str,
        args: &[String],
        finish: Option<(PathBuf, PathBuf)>,
    ) -> Result<Self, BackendError> {
        debug!(command = %describe(program, args), "Spawning pull");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Self { child, finish })
    }
}

impl PullHandle for ProcessPull {
    fn poll(&mut self) -> PullProgress {
        match self.child.try_wait() {
            Ok(None) => PullProgress::Running,
            Ok(Some(status)) => {
                let mut success = status.success();
                if success {
                    if let Some((staged, target)) = self.finish.take() {
                        if let Err(e) = std::fs::rename(&staged, &target) {
                            warn!(
                                error = %e,
                                target = %target.display(),
                                "Failed to move pulled artifact"
                            );
                            success = false;
                        }
                    }
                }
                PullProgress::Finished { success }
            }
            Err(e) => {
                warn!(error = %e, "Failed to poll pull process");
                PullProgress::Finished { success: false }
            }
        }
    }

    fn terminate(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some((staged, _)) = self.finish.take() {
            let _ = std::fs::remove_file(staged);
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn captures_output_of_finished_command() {
        let output = run_with_timeout(
            "sh",
            &args(&["-c", "echo out; echo err >&2"]),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(output.success);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    fn kills_command_past_timeout() {
        let err = run_with_timeout("sleep", &args(&["5"]), Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
    }

    #[test]
    fn failed_command_is_classified() {
        let err = run_checked(
            "sh",
            &args(&["-c", "echo 'Error: No such container: abc' >&2; exit 1"]),
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
    }

    #[test]
    fn stderr_classification() {
        assert!(matches!(
            classify_failure("docker create", "write /var/lib: no space left on device"),
            BackendError::NoDiskSpace(_)
        ));
        assert!(matches!(
            classify_failure("docker create", "Unable to find image: No such image: foo"),
            BackendError::ImageNotFound(_)
        ));
        assert!(matches!(
            classify_failure("virsh start", "error: failed to get domain 'x'"),
            BackendError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure("docker start", "permission denied"),
            BackendError::CommandFailed { .. }
        ));
    }

    #[test]
    fn pull_process_renames_staged_file_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("img.part");
        let target = dir.path().join("img");
        let mut pull = ProcessPull::spawn(
            "sh",
            &args(&["-c", &format!("echo data > {}", staged.display())]),
            Some((staged.clone(), target.clone())),
        )
        .unwrap();

        let mut progress = pull.poll();
        for _ in 0..100 {
            if progress != PullProgress::Running {
                break;
            }
            thread::sleep(Duration::from_millis(20));
            progress = pull.poll();
        }
        assert_eq!(progress, PullProgress::Finished { success: true });
        assert!(target.exists());
        assert!(!staged.exists());
    }
}
