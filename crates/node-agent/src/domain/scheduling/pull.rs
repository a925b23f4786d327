//! Serializes artifact pulls to at most one in flight per node.

use tracing::info;
use tracing::warn;

use super::traits::ExecutionBackend;
use super::traits::PullHandle;
use super::types::PullError;
use super::types::PullProgress;

/// Result of polling the pull manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullState {
    Idle,
    Pulling { name: String, started_at: i64 },
    Success { name: String },
    Error { name: String },
}

struct InFlight {
    name: String,
    started_at: i64,
    handle: Box<dyn PullHandle>,
}

#[derive(Default)]
pub struct PullManager {
    current: Option<InFlight>,
}

impl std::fmt::Debug for PullManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullManager")
            .field("current", &self.current_pull())
            .finish()
    }
}

impl PullManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name and start time of the pull in flight, if any
    pub fn current_pull(&self) -> Option<(&str, i64)> {
        self.current
            .as_ref()
            .map(|p| (p.name.as_str(), p.started_at))
    }

    pub fn is_pulling(&self, name: &str) -> bool {
        self.current.as_ref().is_some_and(|p| p.name == name)
    }

    /// Launch a pull of `name`.
    ///
    /// Starting the artifact already in flight is a no-op. A different artifact in flight
    /// fails with [`PullError::AlreadyPulling`] and leaves that pull untouched.
    pub fn start_pull<B>(&mut self, backend: &B, name: &str, now_ms: i64) -> Result<(), PullError>
    where
        B: ExecutionBackend + ?Sized,
    {
        if let Some(current) = &self.current {
            if current.name == name {
                return Ok(());
            }
            return Err(PullError::AlreadyPulling {
                current: current.name.clone(),
                requested: name.to_string(),
            });
        }

        let handle = backend.pull(name)?;
        info!(artifact = name, "Artifact pull started");
        self.current = Some(InFlight {
            name: name.to_string(),
            started_at: now_ms,
            handle,
        });
        Ok(())
    }

    /// Non-blocking poll. A finished pull is reported once and the manager returns to idle.
    pub fn check_state(&mut self) -> PullState {
        let Some(current) = self.current.as_mut() else {
            return PullState::Idle;
        };

        match current.handle.poll() {
            PullProgress::Running => PullState::Pulling {
                name: current.name.clone(),
                started_at: current.started_at,
            },
            PullProgress::Finished { success } => {
                let name = current.name.clone();
                self.current = None;
                if success {
                    info!(artifact = %name, "Artifact pull finished");
                    PullState::Success { name }
                } else {
                    warn!(artifact = %name, "Artifact pull failed");
                    PullState::Error { name }
                }
            }
        }
    }

    /// Cancel the pull in flight; always succeeds.
    pub fn terminate(&mut self) {
        if let Some(mut current) = self.current.take() {
            info!(artifact = %current.name, "Terminating artifact pull");
            current.handle.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::scheduling::mock::MockBackend;

    #[test]
    fn second_distinct_pull_is_rejected_without_disturbing_first() {
        let backend = MockBackend::new();
        let mut pulls = PullManager::new();

        pulls
            .start_pull(&backend, "image-a", 100)
            .expect("first pull should start");
        let err = pulls
            .start_pull(&backend, "image-b", 200)
            .expect_err("second pull should fail");
        assert!(matches!(err, PullError::AlreadyPulling { .. }));

        assert_eq!(pulls.current_pull(), Some(("image-a", 100)));
        assert_eq!(backend.pull_requests(), vec!["image-a".to_string()]);

        pulls
            .start_pull(&backend, "image-a", 300)
            .expect("same artifact is a no-op");
        assert_eq!(pulls.current_pull(), Some(("image-a", 100)));
    }

    #[test]
    fn finished_pull_is_reported_once() {
        let backend = MockBackend::new();
        backend.set_pull_polls("image-a", 2, true);
        let mut pulls = PullManager::new();
        pulls.start_pull(&backend, "image-a", 0).expect("should start");

        for _ in 0..2 {
            assert_eq!(
                pulls.check_state(),
                PullState::Pulling {
                    name: "image-a".to_string(),
                    started_at: 0
                }
            );
        }
        assert_eq!(
            pulls.check_state(),
            PullState::Success {
                name: "image-a".to_string()
            }
        );
        assert_eq!(pulls.check_state(), PullState::Idle);
        assert!(backend.artifact_present("image-a"));
    }

    #[test]
    fn failed_pull_reports_error() {
        let backend = MockBackend::new();
        backend.set_pull_polls("image-a", 0, false);
        let mut pulls = PullManager::new();
        pulls.start_pull(&backend, "image-a", 0).expect("should start");

        assert_eq!(
            pulls.check_state(),
            PullState::Error {
                name: "image-a".to_string()
            }
        );
        assert_eq!(pulls.check_state(), PullState::Idle);
    }

    #[test]
    fn terminate_is_always_safe() {
        let backend = MockBackend::new();
        let mut pulls = PullManager::new();
        pulls.terminate();

        pulls.start_pull(&backend, "image-a", 0).expect("should start");
        pulls.terminate();
        assert_eq!(pulls.check_state(), PullState::Idle);
        assert_eq!(backend.terminated_pulls(), vec!["image-a".to_string()]);

        pulls
            .start_pull(&backend, "image-b", 10)
            .expect("new pull after terminate");
    }
}
