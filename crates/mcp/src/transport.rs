//! Duplex byte channel to a tool server (spawn, read, write, terminate).

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::Span;

use crate::error::{Error, Result};

/// Maximum size of a single inbound message (1MB).
/// Sized for large tool outputs (file reads, search results).
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How to launch a tool server process.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl ServerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Launch configuration for a server script.
    ///
    /// `.py` scripts run under `python`, `.js` scripts under `node`;
    /// anything else is executed directly.
    pub fn from_script(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let display = path.to_string_lossy().into_owned();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("py") => Self::new("python").arg(display),
            Some("js") => Self::new("node").arg(display),
            _ => Self::new(display),
        }
    }
}

impl std::fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.command)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Shared handle to the child process behind a [`Transport`].
///
/// Cloning yields another handle to the same process. Termination happens
/// at most once no matter how many handles call [`ProcessHandle::terminate`].
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    child: Arc<Mutex<Option<Child>>>,
    command: Arc<str>,
}

impl ProcessHandle {
    /// The command this process was started from.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Kill the process and reap it.
    ///
    /// Returns `false` if it had already been terminated through any handle.
    pub async fn terminate(&self) -> Result<bool> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(false);
        };

        match child.try_wait()? {
            Some(status) => {
                tracing::debug!(command = %self.command, %status, "server already exited");
            }
            None => {
                child.kill().await?;
                tracing::debug!(command = %self.command, "server terminated");
            }
        }
        Ok(true)
    }

    /// Whether the process is still running.
    pub async fn is_running(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

/// Read side of a transport with the partial line carried across reads.
struct LineReader {
    inner: BufReader<BoxedReader>,
    pending: Vec<u8>,
    /// Set while skipping the tail of an oversized line.
    discarding: bool,
}

/// A live duplex connection to a tool server.
///
/// Messages are newline-delimited. A transport is usually backed by a child
/// process's stdio, but can wrap any pair of async streams.
pub struct Transport {
    reader: Mutex<LineReader>,
    writer: Mutex<Option<BoxedWriter>>,
    process: Option<ProcessHandle>,
    open: AtomicBool,
    span: Span,
}

impl Transport {
    /// Spawn the server process and connect to its stdin/stdout.
    pub fn spawn(config: &ServerConfig) -> Result<Self> {
        let spawn_error = |source| Error::Spawn {
            command: config.command.clone(),
            source,
        };

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(spawn_error)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("failed to capture stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("failed to capture stdout")))?;

        tracing::debug!(server = %config, pid = ?child.id(), "spawned tool server");

        let process = ProcessHandle {
            child: Arc::new(Mutex::new(Some(child))),
            command: config.command.as_str().into(),
        };

        let mut transport = Self::from_streams(stdout, stdin);
        transport.process = Some(process);
        Ok(transport)
    }

    /// Wrap an already-connected pair of streams (no child process).
    pub fn from_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Mutex::new(LineReader {
                inner: BufReader::new(Box::new(reader)),
                pending: Vec::new(),
                discarding: false,
            }),
            writer: Mutex::new(Some(Box::new(writer))),
            process: None,
            open: AtomicBool::new(true),
            span: Span::none(),
        }
    }

    /// Attach the span that this transport's events are recorded under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Handle to the child process, if this transport spawned one.
    pub fn process(&self) -> Option<ProcessHandle> {
        self.process.clone()
    }

    /// Liveness flag: `false` once closed or once the peer hung up.
    pub fn is_alive(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Write one message.
    pub async fn send(&self, message: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(Error::Closed);
        };

        writer.write_all(message.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        tracing::trace!(parent: &self.span, message, "sent");
        Ok(())
    }

    /// Read the next non-empty message.
    ///
    /// At most `MAX_OUTPUT_SIZE + 1` bytes of a line are buffered; the rest
    /// of an oversized line is discarded on the following reads. A read that
    /// is cancelled keeps its partial line for the next call.
    pub async fn recv(&self) -> Result<String> {
        let mut guard = self.reader.lock().await;
        let LineReader {
            inner,
            pending,
            discarding,
        } = &mut *guard;

        loop {
            let limit = (MAX_OUTPUT_SIZE + 1).saturating_sub(pending.len()) as u64;
            let bytes_read = (&mut *inner).take(limit).read_until(b'\n', pending).await?;

            if pending.last() == Some(&b'\n') {
                let line = std::mem::take(pending);
                if std::mem::take(discarding) {
                    continue;
                }
                let line = String::from_utf8(line)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                tracing::trace!(parent: &self.span, message = trimmed, "received");
                return Ok(trimmed.to_string());
            }

            if pending.len() > MAX_OUTPUT_SIZE {
                let size = pending.len();
                pending.clear();
                if !std::mem::replace(discarding, true) {
                    tracing::warn!(parent: &self.span, max = MAX_OUTPUT_SIZE, "dropping oversized message");
                    return Err(Error::OutputTooLarge {
                        size,
                        max: MAX_OUTPUT_SIZE,
                    });
                }
                continue;
            }

            if bytes_read == 0 {
                self.open.store(false, Ordering::SeqCst);
                return Err(Error::Closed);
            }
        }
    }

    /// Close the write end, signalling EOF to the peer.
    pub async fn close_writer(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }

    /// Release both stream ends and terminate the process.
    ///
    /// Calling this on a closed transport is a no-op.
    pub async fn close(&self) -> Result<()> {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        // A peer that already hung up leaves the writer in place.
        let writer_result = self.close_writer().await;
        if let Some(process) = &self.process {
            process.terminate().await?;
        }
        if was_open {
            tracing::debug!(parent: &self.span, "transport closed");
        }
        match writer_result {
            // A broken pipe while closing means the peer is already gone.
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn script_launch_by_extension() {
        let py = ServerConfig::from_script("server/weather.py");
        assert_eq!(py.command, "python");
        assert_eq!(py.args, vec!["server/weather.py"]);

        let js = ServerConfig::from_script("build/index.js");
        assert_eq!(js.command, "node");
        assert_eq!(js.args, vec!["build/index.js"]);

        let bin = ServerConfig::from_script("./target/debug/tool-server");
        assert_eq!(bin.command, "./target/debug/tool-server");
        assert!(bin.args.is_empty());
    }

    #[test]
    fn config_display() {
        let config = ServerConfig::new("node").arg("index.js").arg("--verbose");
        assert_eq!(config.to_string(), "node index.js --verbose");
    }

    #[tokio::test]
    async fn spawn_missing_executable_fails() {
        let config = ServerConfig::new("definitely-not-a-real-tool-server-binary");
        let err = Transport::spawn(&config).err().unwrap();
        assert!(matches!(err, Error::Spawn { .. }));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn streams_round_trip_and_close() {
        let (client, server) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let ours = Transport::from_streams(client_read, client_write);
        let theirs = Transport::from_streams(server_read, server_write);

        ours.send("{\"hello\":1}").await.unwrap();
        assert_eq!(theirs.recv().await.unwrap(), "{\"hello\":1}");

        ours.close().await.unwrap();
        assert!(!ours.is_alive());
        assert!(matches!(ours.send("late").await, Err(Error::Closed)));
        assert!(matches!(theirs.recv().await, Err(Error::Closed)));
        assert!(!theirs.is_alive());

        // Second close is a no-op.
        ours.close().await.unwrap();
    }

    #[tokio::test]
    async fn oversized_line_is_skipped_without_buffering_it() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(client);
        let transport = Transport::from_streams(read, write);

        tokio::spawn(async move {
            let huge = vec![b'x'; MAX_OUTPUT_SIZE + 4096];
            server.write_all(&huge).await.unwrap();
            server.write_all(b"\n{\"ok\":1}\n").await.unwrap();
            server.shutdown().await.unwrap();
        });

        match transport.recv().await {
            Err(Error::OutputTooLarge { size, max }) => {
                assert_eq!(max, MAX_OUTPUT_SIZE);
                assert_eq!(size, MAX_OUTPUT_SIZE + 1);
            }
            other => panic!("expected oversized message error, got {other:?}"),
        }
        assert_eq!(transport.recv().await.unwrap(), "{\"ok\":1}");
        assert!(matches!(transport.recv().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn cancelled_read_keeps_partial_line() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (read, write) = tokio::io::split(client);
        let transport = Transport::from_streams(read, write);

        server.write_all(b"{\"par").await.unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(20), transport.recv()).await;
        assert!(waited.is_err());

        server.write_all(b"tial\":1}\n").await.unwrap();
        assert_eq!(transport.recv().await.unwrap(), "{\"partial\":1}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn close_terminates_process_once() {
        let transport = Transport::spawn(&ServerConfig::new("cat")).unwrap();
        let process = transport.process().unwrap();
        assert!(process.is_running().await);

        transport.send("ping").await.unwrap();
        assert_eq!(transport.recv().await.unwrap(), "ping");

        transport.close().await.unwrap();
        assert!(!process.is_running().await);
        assert!(!process.terminate().await.unwrap());
        transport.close().await.unwrap();
    }
}
