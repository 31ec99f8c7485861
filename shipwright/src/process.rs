//! External command execution
//!
//! Commands are always built from an argument vector. Nothing in this crate
//! splices configuration values into a shell string.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

/// Number of trailing stderr lines kept in a failure message
const STDERR_TAIL: usize = 20;

#[derive(Debug, Clone)]
struct Arg {
    value: String,
    secret: bool,
}

/// A command to run to completion
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<Arg>,
    cwd: Option<PathBuf>,
    envs: BTreeMap<String, String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(Arg {
            value: value.into(),
            secret: false,
        });
        self
    }

    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for value in values {
            self = self.arg(value);
        }
        self
    }

    /// An argument that is passed through but masked in logs and errors
    pub fn secret_arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(Arg {
            value: value.into(),
            secret: true,
        });
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, envs: &BTreeMap<String, String>) -> Self {
        self.envs
            .extend(envs.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Run the command, failing on spawn errors and non-zero exit status
    pub async fn run(&self) -> Result<(), String> {
        info!("Running: {}", self);

        let mut command = Command::new(&self.program);
        command
            .args(self.args.iter().map(|a| a.value.as_str()))
            .envs(&self.envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let output = command
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", self, e))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!("[{}] {}", self.program, line);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            debug!("[{}] {}", self.program, line);
        }

        if output.status.success() {
            return Ok(());
        }

        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(STDERR_TAIL)..].join("\n");
        Err(format!("{} exited with {}: {}", self, output.status, tail.trim()))
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.secret {
                write!(f, " ****")?;
            } else {
                write!(f, " {}", arg.value)?;
            }
        }
        Ok(())
    }
}
