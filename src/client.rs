//! The submitter client.
//!
//! Applications create a [`Client`], submit jobs, and await the returned
//! [`JobHandle`]s. One background listener receives scheduler messages and
//! settles the matching futures; if the scheduler channel goes away with
//! futures still pending, every one of them is rejected exactly once with
//! the distinguished host-shutdown failure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};

use crate::codec;
use crate::error::{ForemanError, Result};
use crate::protocol::{ClientMessage, HostMessage, JobCall, JobFailure, Progress};
use crate::scheduler::JobId;

/// How to reach a scheduler process.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Concurrency cap to request before the first submission.
    pub max_workers: Option<usize>,
}

impl ClientOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            max_workers: None,
        }
    }

    /// Re-execute the current binary with the `host` subcommand, the usual
    /// arrangement when the application embeds all three roles.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().map_err(|e| ForemanError::Spawn(e.to_string()))?;
        Ok(Self::new(program).with_args(vec!["host".to_string()]))
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }
}

/// Description of a job to submit.
#[derive(Debug, Clone)]
pub struct JobSpec {
    func: String,
    args: Vec<u8>,
    name: Option<String>,
    icon: Option<String>,
    depends_on: Vec<JobId>,
}

impl JobSpec {
    /// A job calling the registered function `func` with no arguments.
    pub fn call(func: impl Into<String>) -> Self {
        Self {
            func: func.into(),
            args: Vec::new(),
            name: None,
            icon: None,
            depends_on: Vec::new(),
        }
    }

    /// Attach a serialized argument record the handler knows how to decode.
    pub fn args<T: Serialize>(mut self, args: &T) -> Result<Self> {
        self.args = bincode::serialize(args)?;
        Ok(self)
    }

    pub fn raw_args(mut self, args: Vec<u8>) -> Self {
        self.args = args;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    /// Require `dep` to complete before this job may start.
    pub fn after(mut self, dep: &JobHandle) -> Self {
        self.depends_on.push(dep.id());
        self
    }
}

type Settlement = std::result::Result<Vec<u8>, JobFailure>;

struct PendingFuture {
    result_tx: oneshot::Sender<Settlement>,
    progress_tx: watch::Sender<Progress>,
}

/// One pending slot per submitted job. A slot settles exactly once; a second
/// settlement attempt is reported as [`ForemanError::AlreadySettled`].
#[derive(Default)]
pub(crate) struct FutureTable {
    pending: Mutex<HashMap<JobId, PendingFuture>>,
}

impl FutureTable {
    fn register(&self, id: JobId) -> (oneshot::Receiver<Settlement>, watch::Receiver<Progress>) {
        let (result_tx, result_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = watch::channel(Progress::default());
        self.pending.lock().unwrap().insert(
            id,
            PendingFuture {
                result_tx,
                progress_tx,
            },
        );
        (result_rx, progress_rx)
    }

    fn settle(&self, id: JobId, settlement: Settlement) -> Result<()> {
        let pending = self
            .pending
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or(ForemanError::AlreadySettled(id))?;
        // The handle may have been dropped without being awaited.
        let _ = pending.result_tx.send(settlement);
        Ok(())
    }

    fn progress(&self, id: JobId, progress: Progress) {
        if let Some(pending) = self.pending.lock().unwrap().get(&id) {
            let _ = pending.progress_tx.send(progress);
        }
    }

    /// Reject everything still pending. Draining the map makes this
    /// exactly-once per future no matter how often it is called.
    fn reject_all(&self, failure: &JobFailure) {
        let drained: Vec<PendingFuture> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, p)| p).collect()
        };
        for p in drained {
            let _ = p.result_tx.send(Err(failure.clone()));
        }
    }
}

/// A write-once handle to one submitted job.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    result_rx: oneshot::Receiver<Settlement>,
    progress_rx: watch::Receiver<Progress>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Wait until the job finishes, yielding its result bytes or re-raising
    /// the remote failure.
    pub async fn result(self) -> Settlement {
        match self.result_rx.await {
            Ok(settlement) => settlement,
            // Listener gone without settling: the host is gone too.
            Err(_) => Err(JobFailure::host_shutdown()),
        }
    }

    /// Like [`result`](Self::result), decoding the bytes as `T`.
    pub async fn result_as<T: DeserializeOwned>(self) -> std::result::Result<T, JobFailure> {
        let bytes = self.result().await?;
        bincode::deserialize(&bytes)
            .map_err(|e| JobFailure::new("DecodeError", format!("undecodable result: {e}")))
    }

    /// Watch progress reports forwarded for this job.
    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress_rx.clone()
    }
}

pub struct Client {
    outbound: mpsc::Sender<ClientMessage>,
    futures: Arc<FutureTable>,
    closing: Arc<AtomicBool>,
    // Held so the scheduler child is not reaped while the client lives.
    _child: Option<tokio::process::Child>,
}

impl Client {
    /// Spawn a scheduler process and connect to it. If the options carry a
    /// concurrency cap it is sent before anything else.
    pub async fn launch(options: ClientOptions) -> Result<Self> {
        let mut child = Command::new(&options.program)
            .args(&options.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| ForemanError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ForemanError::Spawn("scheduler stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ForemanError::Spawn("scheduler stdout not captured".to_string()))?;

        let mut client = Self::over_stream(stdout, stdin);
        client._child = Some(child);
        if let Some(max_workers) = options.max_workers {
            client.configure(max_workers).await?;
        }
        Ok(client)
    }

    /// Connect over an existing duplex stream, e.g. to an in-process
    /// scheduler on the other end of `tokio::io::duplex`.
    pub fn over_stream<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let futures = Arc::new(FutureTable::default());
        let closing = Arc::new(AtomicBool::new(false));

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientMessage>(64);
        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = codec::write_frame(&mut writer, &message).await {
                    tracing::warn!(error = %e, "Scheduler channel write failed");
                    break;
                }
            }
        });

        let listener_futures = futures.clone();
        let listener_closing = closing.clone();
        tokio::spawn(async move {
            let mut reader = reader;
            loop {
                match codec::read_frame::<_, HostMessage>(&mut reader).await {
                    Ok(Some(HostMessage::Result { id, value })) => {
                        if let Err(e) = listener_futures.settle(id, Ok(value)) {
                            tracing::error!(job_id = %id, error = %e, "Result for a settled future");
                        }
                    }
                    Ok(Some(HostMessage::Exception { id, failure })) => {
                        if let Err(e) = listener_futures.settle(id, Err(failure)) {
                            tracing::error!(job_id = %id, error = %e, "Exception for a settled future");
                        }
                    }
                    Ok(Some(HostMessage::Progress { id, progress })) => {
                        listener_futures.progress(id, progress);
                    }
                    Ok(Some(HostMessage::Shutdown)) | Ok(None) => {
                        tracing::debug!("Scheduler channel closed");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Scheduler channel corrupted");
                        break;
                    }
                }
            }
            listener_closing.store(true, Ordering::SeqCst);
            listener_futures.reject_all(&JobFailure::host_shutdown());
        });

        Self {
            outbound: outbound_tx,
            futures,
            closing,
            _child: None,
        }
    }

    /// Request a concurrency cap. Send this once, before any submission.
    pub async fn configure(&self, max_workers: usize) -> Result<()> {
        self.send(ClientMessage::Config {
            max_workers: Some(max_workers),
        })
        .await
    }

    /// Submit a job and get back its future. Never blocks on the job itself.
    pub async fn submit(&self, spec: JobSpec) -> Result<JobHandle> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(ForemanError::ChannelClosed);
        }

        let id = JobId::random();
        let name = spec.name.clone().unwrap_or_else(|| spec.func.clone());
        let payload = bincode::serialize(&JobCall::raw(spec.func, spec.args))?;

        let (result_rx, progress_rx) = self.futures.register(id);
        let message = ClientMessage::Submit {
            id,
            name,
            icon: spec.icon,
            payload,
            depends_on: spec.depends_on,
        };
        if let Err(e) = self.send(message).await {
            // Nothing was submitted; settle the slot so it cannot leak.
            let _ = self.futures.settle(id, Err(JobFailure::host_shutdown()));
            return Err(e);
        }

        Ok(JobHandle {
            id,
            result_rx,
            progress_rx,
        })
    }

    /// Tell the scheduler no more submissions will come. Outstanding jobs
    /// keep running, but nothing more is forwarded here: futures still
    /// pending reject with the host-shutdown failure once the scheduler
    /// drains and closes the channel.
    pub async fn shutdown(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        // The channel being gone already means the same thing.
        let _ = self.outbound.send(ClientMessage::Shutdown).await;
        Ok(())
    }

    async fn send(&self, message: ClientMessage) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| ForemanError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn future_settles_exactly_once() {
        let table = FutureTable::default();
        let id = JobId::random();
        let (result_rx, _progress_rx) = table.register(id);

        table.settle(id, Ok(vec![1, 2, 3])).unwrap();
        let err = table.settle(id, Ok(vec![4])).unwrap_err();
        assert!(matches!(err, ForemanError::AlreadySettled(settled) if settled == id));

        assert_eq!(result_rx.await.unwrap().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn reject_all_rejects_each_pending_future_once() {
        let table = FutureTable::default();
        let a = JobId::random();
        let b = JobId::random();
        let (rx_a, _) = table.register(a);
        let (rx_b, _) = table.register(b);

        table.reject_all(&JobFailure::host_shutdown());
        // A second sweep has nothing left to reject.
        table.reject_all(&JobFailure::host_shutdown());

        assert!(rx_a.await.unwrap().unwrap_err().is_host_shutdown());
        assert!(rx_b.await.unwrap().unwrap_err().is_host_shutdown());
    }

    #[tokio::test]
    async fn progress_updates_reach_the_watcher() {
        let table = FutureTable::default();
        let id = JobId::random();
        let (_rx, progress_rx) = table.register(id);

        table.progress(
            id,
            Progress {
                value: Some(2),
                maximum: Some(4),
                status: None,
            },
        );
        assert_eq!(progress_rx.borrow().value, Some(2));
    }

    #[test]
    fn job_spec_builder() {
        let spec = JobSpec::call("shell")
            .name("list files")
            .icon("terminal.png");
        assert_eq!(spec.func, "shell");
        assert_eq!(spec.name.as_deref(), Some("list files"));
        assert_eq!(spec.icon.as_deref(), Some("terminal.png"));
        assert!(spec.depends_on.is_empty());
    }
}
