//! Local control channel.
//!
//! A Unix socket accepting short commands, one connection at a time. Nothing
//! is ever written back to the client and there is no access control beyond
//! the filesystem permissions of the socket path.

use crate::dns_server::accepted_or_backoff;
use crate::plugin::prometheus::CONTROL_COMMANDS_TOTAL;
use crate::shutdown::Shutdown;
use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};

/// Largest command read in one go.
pub const COMMAND_BUF_SIZE: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// List the entries of the configured root directory into the log.
    ListRoot,
    Unknown(String),
}

/// Tokens recognised on the wire. Matching is exact, byte for byte.
const COMMANDS: &[(&str, ControlCommand)] = &[("ls", ControlCommand::ListRoot)];

impl ControlCommand {
    pub fn parse(raw: &[u8]) -> Self {
        COMMANDS
            .iter()
            .find(|(token, _)| token.as_bytes() == raw)
            .map(|(_, command)| command.clone())
            .unwrap_or_else(|| ControlCommand::Unknown(String::from_utf8_lossy(raw).into_owned()))
    }

    pub fn label(&self) -> &'static str {
        match self {
            ControlCommand::ListRoot => "ls",
            ControlCommand::Unknown(_) => "unknown",
        }
    }
}

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    root: PathBuf,
}

impl ControlServer {
    pub fn bind(path: &Path, root: &Path) -> Result<Self> {
        let listener = UnixListener::bind(path)
            .with_context(|| format!("Listen {} error", path.display()))?;
        tracing::info!("Control channel listening on {}", path.display());
        Ok(Self { listener, path: path.to_path_buf(), root: root.to_path_buf() })
    }

    /// Accept and handle connections strictly one after another until shutdown.
    /// The socket file is removed on the way out.
    pub async fn serve(self, mut shutdown: Shutdown) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.requested() => break,
                accepted = self.listener.accept() => accepted,
            };
            let Some((stream, _)) = accepted_or_backoff(accepted, "Control").await else { continue };
            tokio::select! {
                _ = shutdown.requested() => break,
                _ = self.handle_connection(stream) => {}
            }
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!("Failed to remove control socket {}: {}", self.path.display(), e);
        }
    }

    async fn handle_connection(&self, mut stream: UnixStream) {
        let mut buf = [0u8; COMMAND_BUF_SIZE];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("Control read error: {}", e);
                    return;
                }
            };
            self.execute(ControlCommand::parse(&buf[..n]));
        }
    }

    pub fn execute(&self, command: ControlCommand) {
        CONTROL_COMMANDS_TOTAL.with_label_values(&[command.label()]).inc();
        match command {
            ControlCommand::ListRoot => match list_dir(&self.root) {
                Ok(names) => {
                    for name in names {
                        tracing::info!("{}", name);
                    }
                }
                Err(e) => tracing::warn!("Failed to list {}: {}", self.root.display(), e),
            },
            ControlCommand::Unknown(payload) => tracing::info!("Server got: {}", payload),
        }
    }
}

/// Entry names of `dir`, sorted.
pub fn list_dir(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

/// Client mode: deliver one message to a running instance and return without
/// waiting for anything back.
pub fn send(path: &Path, message: &str) -> Result<()> {
    let mut stream = std::os::unix::net::UnixStream::connect(path)
        .with_context(|| format!("Dial error {}", path.display()))?;
    tracing::info!("Client Mode enabled.");
    tracing::info!("Sending to the server: {}", message);
    stream.write_all(message.as_bytes())?;
    Ok(())
}
