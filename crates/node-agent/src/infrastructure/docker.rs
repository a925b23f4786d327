//! Container backend driving the `docker` CLI

use std::process::Child;
use std::process::Command;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;
use tracing::info;
use tracing::warn;

use super::command::classify_failure;
use super::command::run_checked;
use super::command::run_with_timeout;
use super::command::ProcessPull;
use crate::domain::resource::join_ids;
use crate::domain::scheduling::BackendError;
use crate::domain::scheduling::ExecutionBackend;
use crate::domain::scheduling::InstanceConfig;
use crate::domain::scheduling::InstanceState;
use crate::domain::scheduling::PullHandle;

/// Mount points of the task's code and data directories inside the container
pub const CODE_MOUNT: &str = "/code";
pub const DATA_MOUNT: &str = "/data";

pub struct DockerBackend {
    binary: String,
    command_timeout: Duration,
    /// `docker commit` runs detached; finished ones are reaped on the next artifact check
    commits: Mutex<Vec<Child>>,
}

impl DockerBackend {
    pub fn new(binary: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            command_timeout,
            commits: Mutex::new(Vec::new()),
        }
    }

    fn docker(&self, args: Vec<String>) -> Result<String, BackendError> {
        run_checked(&self.binary, &args, self.command_timeout)
    }

    fn reap_commits(&self) {
        let Ok(mut commits) = self.commits.lock() else {
            return;
        };
        commits.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    warn!(status = %status, "Background commit failed");
                }
                false
            }
            Ok(None) => true,
            Err(_) => false,
        });
    }
}

/// `docker create` arguments for `config`.
pub fn create_args(config: &InstanceConfig) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), config.name.clone()];

    if !config.gpus.is_empty() {
        args.push("--gpus".to_string());
        args.push(format!("\"device={}\"", join_ids(&config.gpus)));
    }
    for (key, value) in &config.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    for (container, host) in &config.ports {
        args.push("-p".to_string());
        args.push(format!("{host}:{container}"));
    }
    if let Some(memory) = &config.memory {
        args.push("--memory".to_string());
        args.push(memory.clone());
    }
    if let Some(swap) = &config.memory_swap {
        args.push("--memory-swap".to_string());
        args.push(swap.clone());
    }
    if let Some(shares) = config.cpu_shares {
        args.push("--cpu-shares".to_string());
        args.push(shares.to_string());
    }
    if !config.code_dir.is_empty() {
        args.push("-v".to_string());
        args.push(format!("{}:{CODE_MOUNT}", config.code_dir));
    }
    if !config.data_dir.is_empty() {
        args.push("-v".to_string());
        args.push(format!("{}:{DATA_MOUNT}:ro", config.data_dir));
    }

    args.push(config.image.clone());

    if !config.entry_file.is_empty() {
        args.push("python3".to_string());
        args.push(format!("{CODE_MOUNT}/{}", config.entry_file));
        args.extend(config.hyper_parameters.split_whitespace().map(str::to_string));
    }
    args
}

/// Parses `docker inspect --format '{{.Id}} {{.State.Running}} {{.State.ExitCode}}'`.
pub fn parse_inspect(output: &str) -> Option<InstanceState> {
    let mut parts = output.split_whitespace();
    let handle = parts.next()?.to_string();
    let running = parts.next()?.parse::<bool>().ok()?;
    let exit_code = parts.next()?.parse::<i32>().ok()?;
    Some(InstanceState {
        running,
        exit_code,
        handle,
    })
}

impl ExecutionBackend for DockerBackend {
    fn create(&self, config: &InstanceConfig) -> Result<String, BackendError> {
        let handle = self.docker(create_args(config))?;
        info!(name = %config.name, image = %config.image, handle = %handle, "Container created");
        Ok(handle)
    }

    fn start(&self, handle: &str) -> Result<(), BackendError> {
        self.docker(vec!["start".to_string(), handle.to_string()])
            .map(|_| ())
    }

    fn stop(&self, handle: &str, timeout: Duration) -> Result<(), BackendError> {
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            timeout.as_secs().to_string(),
            handle.to_string(),
        ];
        run_checked(&self.binary, &args, timeout + self.command_timeout).map(|_| ())
    }

    fn restart(&self, handle: &str) -> Result<(), BackendError> {
        self.docker(vec!["restart".to_string(), handle.to_string()])
            .map(|_| ())
    }

    fn reset(&self, handle: &str) -> Result<(), BackendError> {
        self.docker(vec![
            "restart".to_string(),
            "-t".to_string(),
            "0".to_string(),
            handle.to_string(),
        ])
        .map(|_| ())
    }

    fn remove(&self, handle: &str) -> Result<(), BackendError> {
        self.docker(vec!["rm".to_string(), "-f".to_string(), handle.to_string()])
            .map(|_| ())
    }

    fn inspect(&self, handle_or_name: &str) -> Result<InstanceState, BackendError> {
        let output = self.docker(vec![
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            "--format".to_string(),
            "{{.Id}} {{.State.Running}} {{.State.ExitCode}}".to_string(),
            handle_or_name.to_string(),
        ])?;
        parse_inspect(&output).ok_or_else(|| BackendError::CommandFailed {
            command: "docker inspect".to_string(),
            message: format!("unexpected output `{output}`"),
        })
    }

    fn artifact_exists(&self, name: &str, timeout: Duration) -> Result<bool, BackendError> {
        self.reap_commits();
        let args = vec![
            "image".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Id}}".to_string(),
            name.to_string(),
        ];
        let output = run_with_timeout(&self.binary, &args, timeout)?;
        if output.success {
            return Ok(true);
        }
        match classify_failure("docker image inspect", &output.stderr) {
            BackendError::ImageNotFound(_) | BackendError::NotFound(_) => Ok(false),
            other => Err(other),
        }
    }

    fn pull(&self, name: &str) -> Result<Box<dyn PullHandle>, BackendError> {
        let pull = ProcessPull::spawn(&self.binary, &["pull".to_string(), name.to_string()], None)?;
        Ok(Box::new(pull))
    }

    fn commit(&self, handle: &str, artifact: &str) -> Result<(), BackendError> {
        let child = Command::new(&self.binary)
            .args(["commit", handle, artifact])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        debug!(handle, artifact, "Container commit started");
        if let Ok(mut commits) = self.commits.lock() {
            commits.push(child);
        }
        Ok(())
    }

    fn remove_artifact(&self, name: &str) -> Result<(), BackendError> {
        self.docker(vec!["rmi".to_string(), "-f".to_string(), name.to_string()])
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::domain::resource::DeviceSet;

    fn config() -> InstanceConfig {
        InstanceConfig {
            name: "job-1".to_string(),
            image: "trainer:2".to_string(),
            gpus: [0, 2].into_iter().collect::<DeviceSet>(),
            env: BTreeMap::from([("MODE".to_string(), "train".to_string())]),
            ports: BTreeMap::from([("22".to_string(), "20022".to_string())]),
            memory: Some("8g".to_string()),
            memory_swap: None,
            cpu_shares: Some(512),
            entry_file: "train.py".to_string(),
            code_dir: "/srv/code".to_string(),
            data_dir: String::new(),
            hyper_parameters: "--epochs 3".to_string(),
        }
    }

    #[test]
    fn create_arguments_follow_instance_config() {
        let args = create_args(&config());
        let expected: Vec<String> = [
            "create",
            "--name",
            "job-1",
            "--gpus",
            "\"device=0,2\"",
            "-e",
            "MODE=train",
            "-p",
            "20022:22",
            "--memory",
            "8g",
            "--cpu-shares",
            "512",
            "-v",
            "/srv/code:/code",
            "trainer:2",
            "python3",
            "/code/train.py",
            "--epochs",
            "3",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn inspect_output_is_parsed() {
        let state = parse_inspect("abc123 false 137\n").unwrap();
        assert_eq!(
            state,
            InstanceState {
                running: false,
                exit_code: 137,
                handle: "abc123".to_string(),
            }
        );
        assert!(parse_inspect("abc123 maybe").is_none());
    }
}
