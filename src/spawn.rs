//! Worker process launching.
//!
//! The scheduler talks to workers through [`WorkerLink`]s handed out by a
//! [`WorkerSpawner`]. The production spawner starts one OS process per job
//! and frames messages over the child's stdio; [`LocalSpawner`] runs the
//! worker runtime as an in-process task over a duplex pipe, which is how the
//! integration tests and the demo exercise the full pipeline without forking.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::codec;
use crate::error::{ForemanError, Result};
use crate::protocol::{WorkerMessage, WorkerOrder};
use crate::scheduler::{Job, JobId};
use crate::worker::JobRegistry;

/// Something a worker's channel produced, tagged with the owning job.
#[derive(Debug)]
pub enum WorkerEvent {
    Message { id: JobId, message: WorkerMessage },
    /// The channel reached clean EOF: the worker process exited.
    Closed { id: JobId },
    /// The channel broke mid-frame or produced undecodable bytes.
    Failed { id: JobId, error: ForemanError },
}

/// The scheduler's grip on one spawned worker.
#[derive(Debug)]
pub struct WorkerLink {
    /// Reported by the worker's handshake; `None` until it arrives.
    pub pid: Option<u32>,
    /// Whether the handshake has been seen yet.
    pub handshaken: bool,
    orders: mpsc::UnboundedSender<WorkerOrder>,
}

impl WorkerLink {
    pub fn send(&self, order: WorkerOrder) -> Result<()> {
        self.orders
            .send(order)
            .map_err(|_| ForemanError::ChannelClosed)
    }
}

/// Starts a worker for one job and wires its channel into the scheduler's
/// worker-event stream.
#[async_trait]
pub trait WorkerSpawner: Send {
    async fn spawn(&mut self, job: &Job, events: mpsc::Sender<WorkerEvent>) -> Result<WorkerLink>;
}

/// Connect a raw duplex byte stream to the scheduler: frames read from
/// `reader` become [`WorkerEvent`]s, orders sent on the link are framed onto
/// `writer`. Useful for custom spawner implementations.
pub fn wire_worker<R, W>(
    id: JobId,
    reader: R,
    writer: W,
    events: mpsc::Sender<WorkerEvent>,
) -> WorkerLink
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (orders_tx, mut orders_rx) = mpsc::unbounded_channel::<WorkerOrder>();

    tokio::spawn(async move {
        let mut writer = writer;
        while let Some(order) = orders_rx.recv().await {
            if let Err(e) = codec::write_frame(&mut writer, &order).await {
                tracing::warn!(job_id = %id, error = %e, "Worker channel write failed");
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut reader = reader;
        loop {
            let event = match codec::read_frame::<_, WorkerMessage>(&mut reader).await {
                Ok(Some(message)) => WorkerEvent::Message { id, message },
                Ok(None) => WorkerEvent::Closed { id },
                Err(error) => WorkerEvent::Failed { id, error },
            };
            let terminal = !matches!(event, WorkerEvent::Message { .. });
            if events.send(event).await.is_err() || terminal {
                break;
            }
        }
    });

    WorkerLink {
        pid: None,
        handshaken: false,
        orders: orders_tx,
    }
}

/// Spawns one OS process per job, framing messages over the child's
/// stdin/stdout. Stderr is inherited so worker logs land next to the
/// scheduler's own.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-execute the current binary with the given arguments, the usual
    /// arrangement when the application embeds all three roles.
    pub fn current_exe(args: Vec<String>) -> Result<Self> {
        let program = std::env::current_exe().map_err(|e| ForemanError::Spawn(e.to_string()))?;
        Ok(Self::new(program, args))
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&mut self, job: &Job, events: mpsc::Sender<WorkerEvent>) -> Result<WorkerLink> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| ForemanError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ForemanError::Spawn("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ForemanError::Spawn("worker stdout not captured".to_string()))?;

        let id = job.id;
        let pid = child.id();
        tracing::debug!(job_id = %id, pid = ?pid, "Worker process spawned");

        // Reap the child once it exits so it never lingers as a zombie.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::debug!(job_id = %id, %status, "Worker process exited"),
                Err(e) => tracing::warn!(job_id = %id, error = %e, "Failed to reap worker"),
            }
        });

        let mut link = wire_worker(id, stdout, stdin, events);
        link.pid = pid;
        Ok(link)
    }
}

/// Runs the worker runtime as a task inside the scheduler's own process,
/// sharing one [`JobRegistry`]. No processes are forked; everything else
/// behaves exactly like the production path, including the handshake and
/// the one-terminal-message contract.
#[derive(Clone)]
pub struct LocalSpawner {
    registry: Arc<JobRegistry>,
}

impl LocalSpawner {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl WorkerSpawner for LocalSpawner {
    async fn spawn(&mut self, job: &Job, events: mpsc::Sender<WorkerEvent>) -> Result<WorkerLink> {
        let (host_io, worker_io) = tokio::io::duplex(256 * 1024);
        let registry = self.registry.clone();
        let id = job.id;

        tokio::spawn(async move {
            let (reader, writer) = tokio::io::split(worker_io);
            if let Err(e) = crate::worker::run(reader, writer, registry).await {
                tracing::warn!(job_id = %id, error = %e, "In-process worker failed");
            }
        });

        let (reader, writer) = tokio::io::split(host_io);
        Ok(wire_worker(id, reader, writer, events))
    }
}
