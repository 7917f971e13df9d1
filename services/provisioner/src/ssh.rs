//! SSH transport collaborator.
//!
//! The engine only needs to run one remote command per node (installing an
//! authorized public key). `SshTransport` abstracts the session so tests can
//! record commands; `CommandSshTransport` shells out to the system `ssh`
//! client.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::types::SshCredential;

/// SSH errors.
#[derive(Debug, Error)]
pub enum SshError {
    /// The node has no address to connect to.
    #[error("no reachable address")]
    NoAddress,

    /// The client process could not be started.
    #[error("failed to spawn ssh client: {0}")]
    Spawn(#[from] std::io::Error),

    /// The remote command exited non-zero.
    #[error("remote command exited with status {status}: {stderr}")]
    ExitStatus { status: i32, stderr: String },

    /// The remote command wrote to standard error.
    #[error("remote command wrote to stderr: {0}")]
    Stderr(String),

    /// The session did not finish in time.
    #[error("ssh session timed out after {0:?}")]
    Timeout(Duration),
}

/// Captured output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs one command on a remote host.
#[async_trait]
pub trait SshTransport: Send + Sync {
    async fn run(
        &self,
        host: &str,
        credential: &SshCredential,
        command: &str,
    ) -> Result<CommandOutput, SshError>;
}

/// Command that installs `public_key` as the only authorized key.
pub fn authorized_key_command(public_key: &str) -> String {
    format!(
        "mkdir -p ~/.ssh; echo {} > ~/.ssh/authorized_keys",
        shell_quote(public_key.trim_matches('\n'))
    )
}

/// Single-quote `raw` for a POSIX shell.
fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Install a public key on a host.
///
/// Fails on a non-zero exit status or any output on standard error.
pub async fn upload_key(
    transport: &dyn SshTransport,
    host: &str,
    credential: &SshCredential,
    public_key: &str,
) -> Result<(), SshError> {
    let command = authorized_key_command(public_key);
    info!(host = %host, user = %credential.user, "Uploading public key");

    let output = transport.run(host, credential, &command).await?;
    if output.status != 0 {
        return Err(SshError::ExitStatus {
            status: output.status,
            stderr: output.stderr,
        });
    }
    if !output.stderr.is_empty() {
        return Err(SshError::Stderr(output.stderr));
    }

    debug!(host = %host, stdout = %output.stdout, "Public key uploaded");
    Ok(())
}

/// Transport backed by the system `ssh` client.
///
/// Password logins go through `sshpass`; the password is passed in the
/// `SSHPASS` environment variable rather than on the command line.
pub struct CommandSshTransport {
    timeout: Duration,
}

impl CommandSshTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn build(&self, host: &str, credential: &SshCredential, command: &str) -> Command {
        let mut cmd = match &credential.password {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh").env("SSHPASS", password);
                cmd
            }
            None => Command::new("ssh"),
        };

        cmd.arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("LogLevel=ERROR")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.timeout.as_secs().max(1)))
            .arg("-p")
            .arg(credential.port.to_string());

        if let Some(key_path) = &credential.key_path {
            cmd.arg("-i").arg(key_path);
        }

        cmd.arg(format!("{}@{}", credential.user, host))
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Default for CommandSshTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl SshTransport for CommandSshTransport {
    async fn run(
        &self,
        host: &str,
        credential: &SshCredential,
        command: &str,
    ) -> Result<CommandOutput, SshError> {
        let output = tokio::time::timeout(
            self.timeout,
            self.build(host, credential, command).output(),
        )
        .await
        .map_err(|_| SshError::Timeout(self.timeout))??;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
