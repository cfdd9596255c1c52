//! Docker-compatible CLI client.
//!
//! Arguments are passed to the engine binary as an argv vector; nothing is
//! ever interpreted by a shell, so no escaping is involved.
//!
//! # Notes on stdout/stderr capture and timeouts
//!
//! stdout and stderr are drained on their own threads while the child runs.
//! Reading them only after exit can deadlock once the child fills a pipe.
//! Timeouts are enforced here with a hard kill rather than relying on the
//! engine to give up.

use std::collections::BTreeMap;
use std::io::{self, ErrorKind, IsTerminal, Read};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, trace};

use super::{BindMount, ContainerEngine, ContainerHandle, ContainerSpec, ContainerState};
use crate::error::EngineError;

/// Default limit for a single engine invocation.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Output of one engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (-1 if killed by a signal).
    pub exit_code: i32,
}

impl CommandOutput {
    /// Returns `true` if the command exited successfully (exit code 0).
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Drives `docker` (or a compatible binary such as `podman`).
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    timeout: Duration,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    /// A client running `binary`.
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the per-invocation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The engine binary.
    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Runs the binary with `args`, returning its output whatever the exit code.
    ///
    /// # Errors
    ///
    /// - `EngineError::Unavailable` if the binary cannot be spawned
    /// - `EngineError::CommandFailed` on timeout or a wait failure
    #[instrument(skip(self), fields(binary = %self.binary))]
    pub fn execute(&self, args: &[String]) -> Result<CommandOutput, EngineError> {
        let operation = self.describe(args);
        trace!("Spawning engine command");
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&self.binary, &e))?;

        // Drain stdout/stderr concurrently so the child can't deadlock on full pipes.
        let stdout_reader = child.stdout.take();
        let stderr_reader = child.stderr.take();
        let (stdout_tx, stdout_rx) = mpsc::channel::<Vec<u8>>();
        let (stderr_tx, stderr_rx) = mpsc::channel::<Vec<u8>>();

        let stdout_join = thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut r) = stdout_reader {
                let _ = r.read_to_end(&mut buf);
            }
            let _ = stdout_tx.send(buf);
        });
        let stderr_join = thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut r) = stderr_reader {
                let _ = r.read_to_end(&mut buf);
            }
            let _ = stderr_tx.send(buf);
        });

        let start = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if start.elapsed() > self.timeout {
                        debug!(elapsed_ms = %start.elapsed().as_millis(), "Engine command timed out, killing it");
                        let _ = child.kill();
                        let _ = child.wait();
                        let _ = stdout_join.join();
                        let _ = stderr_join.join();
                        return Err(EngineError::CommandFailed {
                            operation,
                            message: format!("timed out after {}s", self.timeout.as_secs()),
                        });
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    let _ = stdout_join.join();
                    let _ = stderr_join.join();
                    return Err(EngineError::CommandFailed {
                        operation,
                        message: format!("failed to wait for command: {e}"),
                    });
                }
            }
        };

        let stdout = String::from_utf8_lossy(&stdout_rx.recv().unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_rx.recv().unwrap_or_default()).into_owned();
        let _ = stdout_join.join();
        let _ = stderr_join.join();

        let exit_code = status.code().unwrap_or(-1);
        debug!(exit_code, elapsed_ms = %start.elapsed().as_millis(), "Engine command completed");
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    /// Runs the binary and maps a non-zero exit to an [`EngineError`].
    fn run(&self, kind: &'static str, name: &str, args: &[String]) -> Result<String, EngineError> {
        let output = self.execute(args)?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(classify_failure(
                &self.describe(args),
                kind,
                name,
                &output.stderr,
            ))
        }
    }

    fn describe(&self, args: &[String]) -> String {
        match args.first() {
            Some(sub) if sub == "volume" || sub == "container" => {
                format!("{} {} {}", self.binary, sub, args.get(1).map_or("", String::as_str))
            }
            Some(sub) => format!("{} {sub}", self.binary),
            None => self.binary.clone(),
        }
    }
}

impl ContainerEngine for DockerCli {
    fn name(&self) -> &str {
        &self.binary
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle, EngineError> {
        let stdout = self.run("container", &spec.name, &create_args(spec))?;
        let id = stdout.trim();
        if id.is_empty() {
            return Err(EngineError::CommandFailed {
                operation: format!("{} create", self.binary),
                message: "engine returned no container id".to_string(),
            });
        }
        debug!(%id, "Container created");
        Ok(ContainerHandle(id.to_string()))
    }

    fn start(&self, container: &str) -> Result<(), EngineError> {
        self.run("container", container, &args(["start", container]))
            .map(|_| ())
    }

    fn stop(&self, container: &str) -> Result<(), EngineError> {
        self.run("container", container, &args(["stop", container]))
            .map(|_| ())
    }

    fn remove_container(&self, container: &str) -> Result<(), EngineError> {
        self.run("container", container, &args(["rm", "--force", container]))
            .map(|_| ())
    }

    fn create_volume(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), EngineError> {
        let mut argv = args(["volume", "create"]);
        for (key, value) in labels {
            argv.push("--label".to_string());
            argv.push(format!("{key}={value}"));
        }
        argv.push(name.to_string());
        self.run("volume", name, &argv).map(|_| ())
    }

    fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.run("volume", name, &args(["volume", "rm", name]))
            .map(|_| ())
    }

    fn inspect(&self, container: &str) -> Result<ContainerState, EngineError> {
        let stdout = self.run(
            "container",
            container,
            &args(["inspect", "--type", "container", "--format", "{{.State.Status}}", container]),
        )?;
        Ok(ContainerState::parse(&stdout))
    }

    fn restart(&self, container: &str) -> Result<(), EngineError> {
        self.run("container", container, &args(["restart", container]))
            .map(|_| ())
    }

    #[instrument(skip(self, command), fields(binary = %self.binary))]
    fn exec_interactive(&self, container: &str, command: &[String]) -> Result<i32, EngineError> {
        let tty = io::stdin().is_terminal() && io::stdout().is_terminal();
        let argv = exec_args(container, command, tty);
        debug!(tty, "Attaching to container");
        let status = Command::new(&self.binary)
            .args(&argv)
            .status()
            .map_err(|e| spawn_error(&self.binary, &e))?;
        Ok(status.code().unwrap_or(-1))
    }
}

fn spawn_error(binary: &str, e: &io::Error) -> EngineError {
    if e.kind() == ErrorKind::NotFound {
        EngineError::Unavailable {
            reason: format!("'{binary}' not found on PATH"),
        }
    } else {
        EngineError::Unavailable {
            reason: format!("failed to run '{binary}': {e}"),
        }
    }
}

/// Builds the argv for an attached `exec`. `--tty` only when both ends are terminals.
pub(crate) fn exec_args(container: &str, command: &[String], tty: bool) -> Vec<String> {
    let mut argv = args(["exec", "--interactive"]);
    if tty {
        argv.push("--tty".to_string());
    }
    argv.push(container.to_string());
    argv.extend(command.iter().cloned());
    argv
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// Builds the argv for `create`.
pub(crate) fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut argv = args(["create", "--name"]);
    argv.push(spec.name.clone());
    argv.push("--hostname".to_string());
    argv.push(spec.name.clone());

    for (key, value) in &spec.labels {
        argv.push("--label".to_string());
        argv.push(format!("{key}={value}"));
    }
    for mount in &spec.mounts {
        argv.push("--mount".to_string());
        argv.push(bind_mount_arg(mount));
    }
    for volume in &spec.volumes {
        let target = volume.target.to_string_lossy();
        argv.push("--mount".to_string());
        argv.push(mount_arg(&[
            ("type", "volume"),
            ("source", volume.name.as_str()),
            ("target", &*target),
        ]));
    }
    if let Some(workdir) = &spec.workdir {
        argv.push("--workdir".to_string());
        argv.push(workdir.to_string_lossy().into_owned());
    }

    // Options end here; nothing after the image is parsed as a flag.
    argv.push(spec.image.clone());
    argv.extend(spec.command.iter().cloned());
    argv
}

fn bind_mount_arg(mount: &BindMount) -> String {
    let source = mount.source.to_string_lossy();
    let target = mount.target.to_string_lossy();
    let mut fields = vec![("type", "bind"), ("source", &*source), ("target", &*target)];
    if mount.read_only {
        fields.push(("readonly", "true"));
    }
    mount_arg(&fields)
}

/// Joins `key=value` fields for `--mount`. The value is parsed as CSV, so a
/// field holding a comma or quote is wrapped in quotes with inner quotes doubled.
fn mount_arg(fields: &[(&str, &str)]) -> String {
    fields
        .iter()
        .map(|(key, value)| {
            let field = format!("{key}={value}");
            if field.contains(',') || field.contains('"') {
                format!("\"{}\"", field.replace('"', "\"\""))
            } else {
                field
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Maps a failed invocation to an [`EngineError`] from its stderr.
pub(crate) fn classify_failure(
    operation: &str,
    kind: &'static str,
    name: &str,
    stderr: &str,
) -> EngineError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("no such container")
        || lower.contains("no such volume")
        || lower.contains("no such object")
        || lower.contains("no container with name")
    {
        EngineError::NotFound {
            kind,
            name: name.to_string(),
        }
    } else if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("cannot connect to podman")
    {
        EngineError::Unavailable {
            reason: stderr.trim().to_string(),
        }
    } else if lower.contains("permission denied") {
        EngineError::PermissionDenied
    } else {
        EngineError::CommandFailed {
            operation: operation.to_string(),
            message: stderr.trim().to_string(),
        }
    }
}
