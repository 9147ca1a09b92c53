//! Byte-stream transports for bridge connections.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::config::TransportConfig;

pub type BoxedReader = Box<dyn AsyncBufRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Child process has no {0} pipe")]
    MissingPipe(&'static str),
}

/// An established byte stream to a remote tool server.
pub struct RawLink {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    /// Spawned server process, killed when the link is dropped
    pub child: Option<Child>,
}

/// Opens a fresh [`RawLink`] each time a bridge (re)connects.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<RawLink, TransportError>;

    fn endpoint(&self) -> String;
}

pub fn connector_for(transport: &TransportConfig) -> Arc<dyn Connector> {
    match transport {
        TransportConfig::Stdio { command, args, env } => Arc::new(StdioConnector {
            command: command.clone(),
            args: args.clone(),
            env: env.clone(),
        }),
        TransportConfig::Tcp { address } => Arc::new(TcpConnector {
            address: address.clone(),
        }),
    }
}

/// Spawns the server as a child process and talks over its stdin/stdout.
#[derive(Debug, Clone)]
pub struct StdioConnector {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[async_trait]
impl Connector for StdioConnector {
    async fn connect(&self) -> Result<RawLink, TransportError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Spawn {
                command: self.command.clone(),
                source: e,
            })?;

        let stdin = child.stdin.take().ok_or(TransportError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(TransportError::MissingPipe("stdout"))?;

        // Server logs go to our debug output
        if let Some(stderr) = child.stderr.take() {
            let command = self.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %command, "{}", line.trim_end());
                }
            });
        }

        Ok(RawLink {
            reader: Box::new(BufReader::new(stdout)),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }

    fn endpoint(&self) -> String {
        TransportConfig::Stdio {
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
        }
        .endpoint()
    }
}

/// Connects to a server that is already listening on a TCP address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub address: String,
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<RawLink, TransportError> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| TransportError::Connect {
                address: self.address.clone(),
                source: e,
            })?;
        let (read_half, write_half) = stream.into_split();
        Ok(RawLink {
            reader: Box::new(BufReader::new(read_half)),
            writer: Box::new(write_half),
            child: None,
        })
    }

    fn endpoint(&self) -> String {
        format!("tcp:{}", self.address)
    }
}
