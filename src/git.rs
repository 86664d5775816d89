//! Source checkout via the git CLI

use crate::error::{HotifyError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, info};

/// Fetches service source code into a working directory
#[async_trait]
pub trait GitSource: Send + Sync {
    /// Clone `url` into `dest`, which may exist but must be empty
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<()>;

    /// Pull the latest changes into an existing checkout
    async fn pull(&self, dest: &Path) -> Result<()>;
}

/// [`GitSource`] backed by the `git` executable
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl GitCli {
    pub fn new() -> Self {
        Self {
            program: "git".to_string(),
        }
    }

    /// Use a different git executable
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, action: &'static str, cmd: &mut Command) -> Result<()> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("GIT_TERMINAL_PROMPT", "0");

        let output = cmd.output().await.map_err(|e| HotifyError::Git {
            action,
            output: format!("failed to run {}: {}", self.program, e),
        })?;

        if !output.status.success() {
            return Err(HotifyError::Git {
                action,
                output: combined_output(&output),
            });
        }

        debug!(action, "git finished");
        Ok(())
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GitSource for GitCli {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<()> {
        info!(url, dest = %dest.display(), "Cloning repository");
        let mut cmd = Command::new(&self.program);
        cmd.arg("clone").arg(url).arg(dest);
        self.run("clone", &mut cmd).await
    }

    async fn pull(&self, dest: &Path) -> Result<()> {
        info!(dest = %dest.display(), "Pulling repository");
        let mut cmd = Command::new(&self.program);
        cmd.arg("pull").current_dir(dest);
        self.run("pull", &mut cmd).await
    }
}

/// stdout followed by stderr, lossily decoded
pub(crate) fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text.trim_end().to_string()
}
