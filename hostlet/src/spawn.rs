//! Child process launching.
//!
//! Every caller goes through `SpawnOptions`: stream behavior, environment and
//! process-group placement are first-class spawn parameters rather than
//! ambient process state. Children are placed in their own process group so
//! termination signals reach the whole tree, and carry `kill_on_drop` as a
//! reaping backstop.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};

/// Per-stream behavior for a spawned child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioPolicy {
    #[default]
    Inherit,
    Piped,
    Null,
}

impl StdioPolicy {
    fn to_stdio(self) -> Stdio {
        match self {
            Self::Inherit => Stdio::inherit(),
            Self::Piped => Stdio::piped(),
            Self::Null => Stdio::null(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("build command `{command}` exited with code {code:?}")]
    ExitStatus { command: String, code: Option<i32> },
    #[error("failed to wait for build command `{command}`: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Builder for one child process launch.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    stdin: StdioPolicy,
    stdout: StdioPolicy,
    stderr: StdioPolicy,
    new_process_group: bool,
}

impl SpawnOptions {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            stdin: StdioPolicy::Null,
            stdout: StdioPolicy::Inherit,
            stderr: StdioPolicy::Inherit,
            new_process_group: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, policy: StdioPolicy) -> Self {
        self.stdin = policy;
        self
    }

    pub fn stdout(mut self, policy: StdioPolicy) -> Self {
        self.stdout = policy;
        self
    }

    pub fn stderr(mut self, policy: StdioPolicy) -> Self {
        self.stderr = policy;
        self
    }

    pub fn new_process_group(mut self, enabled: bool) -> Self {
        self.new_process_group = enabled;
        self
    }

    pub fn uses_process_group(&self) -> bool {
        self.new_process_group
    }

    /// Human-readable command line for error messages and logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(self.stdin.to_stdio())
            .stdout(self.stdout.to_stdio())
            .stderr(self.stderr.to_stdio())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        if self.new_process_group {
            cmd.process_group(0);
        }
        cmd
    }

    /// Spawn the child and hand back its handle.
    pub fn launch(&self) -> Result<Child, LaunchError> {
        tracing::debug!(command = %self.command_line(), "Launching child process");
        self.command().spawn().map_err(|source| LaunchError::Spawn {
            command: self.command_line(),
            source,
        })
    }

    /// Run to completion, for build commands. Non-zero exit is a typed error
    /// carrying the exit code, distinct from a failure to launch at all.
    pub async fn run_to_completion(&self) -> Result<(), BuildError> {
        let mut child = self.launch()?;
        let status = child.wait().await.map_err(|source| BuildError::Wait {
            command: self.command_line(),
            source,
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(BuildError::ExitStatus {
                command: self.command_line(),
                code: status.code(),
            })
        }
    }
}
