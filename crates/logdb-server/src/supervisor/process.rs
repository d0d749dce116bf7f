//! Launching worker processes

use std::ffi::OsString;
use std::process::Stdio;
use tokio::process::{Child, ChildStdout, Command};
use tracing::warn;

use crate::error::SupervisorError;

/// What to execute for a worker class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

pub struct SpawnedProcess {
    pub child: Child,
    pub pid: u32,
    /// Liveness pipe
    pub stdout: ChildStdout,
}

/// Start a worker with stdout piped for liveness and stderr passed through
/// to the supervisor's own log stream.
pub async fn spawn(class: &str, spec: &ProcessSpec) -> Result<SpawnedProcess, SupervisorError> {
    let mut cmd = Command::new(&spec.program);

    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
        class: class.to_string(),
        source,
    })?;

    let Some(stdout) = child.stdout.take() else {
        reap(class, child).await;
        return Err(SupervisorError::MissingStdout {
            class: class.to_string(),
        });
    };

    let Some(pid) = child.id() else {
        reap(class, child).await;
        return Err(SupervisorError::Spawn {
            class: class.to_string(),
            source: std::io::Error::other("process exited before its pid was read"),
        });
    };

    Ok(SpawnedProcess { child, pid, stdout })
}

/// Kill a child that cannot be supervised and wait for it, so it does not
/// linger as a zombie.
pub async fn reap(class: &str, mut child: Child) {
    if let Err(e) = child.start_kill() {
        warn!(class, error = %e, "Failed to kill worker");
    }
    if let Err(e) = child.wait().await {
        warn!(class, error = %e, "Failed to wait for worker");
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_stdout_is_piped() {
        let spec = ProcessSpec::new("sh").args(["-c", "printf ..."]);
        let mut spawned = spawn("echo", &spec).await.unwrap();
        assert!(spawned.pid > 0);

        let mut out = String::new();
        spawned.stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "...");
        assert!(spawned.child.wait().await.unwrap().success());
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_env_is_passed() {
        let spec = ProcessSpec::new("sh")
            .arg("-c")
            .arg("test \"$LOGDB_WORKER\" = loader")
            .env("LOGDB_WORKER", "loader");
        let mut spawned = spawn("env", &spec).await.unwrap();
        assert!(spawned.child.wait().await.unwrap().success());
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_missing_program_is_a_spawn_error() {
        let spec = ProcessSpec::new("logdb_nonexistent_program_12345");
        let err = spawn("ghost", &spec).await.err().unwrap();
        assert!(matches!(err, SupervisorError::Spawn { ref class, .. } if class == "ghost"));
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_reap_kills_and_waits() {
        let child = Command::new("sh").args(["-c", "exec sleep 30"]).kill_on_drop(true).spawn().unwrap();
        let pid = child.id().unwrap();

        tokio::time::timeout(Duration::from_secs(5), reap("sleeper", child))
            .await
            .expect("reap should not block on a killed child");

        // Reaped, so not even a zombie is left to signal
        let alive = std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stderr(Stdio::null())
            .status()
            .unwrap()
            .success();
        assert!(!alive);
    }
}
