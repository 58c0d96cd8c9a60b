//! The scheduling engine.
//!
//! One task owns the authoritative job table and everything that mutates it:
//! - **Poke pass**: re-evaluate every waiting job against its dependencies
//!   and the concurrency cap, spawning workers for jobs that may start.
//! - **Prune**: drop finished jobs from the poke queue (they stay in the
//!   table for dependency lookups and retries).
//! - **Wait**: block on the client channel, the worker channels, and the
//!   external action channel, with a short timeout while a failed job could
//!   still be retried.
//! - **Dispatch**: route one message to its handler and publish a
//!   `MessageSeen` event for observers.
//!
//! Per-channel reader tasks only decode frames and forward them here; no job
//! state is touched outside this task, so there is no locking.

pub mod events;
pub mod job;
pub mod table;

pub use events::{MessageSource, SchedulerEvent};
pub use job::{Job, JobId, JobState};
pub use table::JobTable;

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::codec;
use crate::config::SchedulerConfig;
use crate::error::{ForemanError, Result};
use crate::notify::{Notification, NotificationSink};
use crate::protocol::{ClientMessage, HostMessage, JobFailure, WorkerMessage, WorkerOrder};
use crate::spawn::{WorkerEvent, WorkerLink, WorkerSpawner};

/// What the client channel produced.
#[derive(Debug)]
enum ClientEvent {
    Message(ClientMessage),
    Closed,
    Failed(ForemanError),
}

/// Requests from outside the message protocol, issued by a presentation
/// layer through a [`SchedulerHandle`].
#[derive(Debug)]
pub enum SchedulerAction {
    Retry(JobId),
}

/// Handle for injecting actions into a running scheduler. Create handles
/// before calling [`Scheduler::run`]; once every handle is dropped the
/// scheduler stops waiting for retries.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    actions: mpsc::Sender<SchedulerAction>,
}

impl SchedulerHandle {
    /// Ask the scheduler to retry a failed job. A retry of a job that is not
    /// in a failed state is ignored.
    pub async fn retry(&self, id: JobId) -> Result<()> {
        self.actions
            .send(SchedulerAction::Retry(id))
            .await
            .map_err(|_| ForemanError::ChannelClosed)
    }
}

/// Outcome of evaluating one waiting job during a poke pass.
enum Eligibility {
    DependencyFailed(JobId),
    Blocked,
    Queued,
    Activate,
}

pub struct Scheduler<S: WorkerSpawner> {
    config: SchedulerConfig,
    table: JobTable,
    spawner: S,
    notifier: Box<dyn NotificationSink>,
    links: HashMap<JobId, WorkerLink>,

    client_rx: mpsc::Receiver<ClientEvent>,
    outbound: Option<mpsc::Sender<HostMessage>>,
    outbound_task: Option<JoinHandle<()>>,
    worker_tx: mpsc::Sender<WorkerEvent>,
    worker_rx: mpsc::Receiver<WorkerEvent>,
    actions_rx: mpsc::Receiver<SchedulerAction>,
    actions_seed: Option<mpsc::Sender<SchedulerAction>>,
    events: broadcast::Sender<SchedulerEvent>,

    client_open: bool,
    actions_open: bool,
}

impl<S: WorkerSpawner> Scheduler<S> {
    /// Build a scheduler over a duplex channel to the client. Spawns the
    /// channel's reader and writer tasks immediately.
    pub fn new<R, W>(
        config: SchedulerConfig,
        spawner: S,
        reader: R,
        writer: W,
        notifier: Box<dyn NotificationSink>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (client_tx, client_rx) = mpsc::channel::<ClientEvent>(64);
        tokio::spawn(async move {
            let mut reader = reader;
            loop {
                let event = match codec::read_frame::<_, ClientMessage>(&mut reader).await {
                    Ok(Some(message)) => ClientEvent::Message(message),
                    Ok(None) => ClientEvent::Closed,
                    Err(error) => ClientEvent::Failed(error),
                };
                let terminal = !matches!(event, ClientEvent::Message(_));
                if client_tx.send(event).await.is_err() || terminal {
                    break;
                }
            }
        });

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<HostMessage>(64);
        let outbound_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = codec::write_frame(&mut writer, &message).await {
                    tracing::warn!(error = %e, "Client channel write failed");
                    break;
                }
            }
        });

        let (worker_tx, worker_rx) = mpsc::channel::<WorkerEvent>(256);
        let (actions_tx, actions_rx) = mpsc::channel::<SchedulerAction>(16);
        let (events, _) = broadcast::channel(256);

        Self {
            config,
            table: JobTable::new(),
            spawner,
            notifier,
            links: HashMap::new(),
            client_rx,
            outbound: Some(outbound_tx),
            outbound_task: Some(outbound_task),
            worker_tx,
            worker_rx,
            actions_rx,
            actions_seed: Some(actions_tx),
            events,
            client_open: true,
            actions_open: true,
        }
    }

    /// An action handle for presentation collaborators. Must be taken before
    /// [`run`](Self::run) starts.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            actions: self
                .actions_seed
                .clone()
                .expect("handle() must be called before run()"),
        }
    }

    /// Subscribe to state-change and message-seen events.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Drive the engine until there is nothing left to do: the client channel
    /// is closed, no job is waiting or active, and no failed job can still be
    /// retried. Returns an error only on client-channel corruption.
    pub async fn run(mut self) -> Result<()> {
        // Handles taken before run keep the action channel alive; the seed
        // itself must not, or the loop could never observe it closing.
        drop(self.actions_seed.take());

        loop {
            self.poke().await;
            self.table.prune_finished();
            if self.done() {
                break;
            }
            self.wait_and_dispatch().await?;
        }

        tracing::info!("Scheduler drained; shutting down");
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(HostMessage::Shutdown).await;
        }
        if let Some(task) = self.outbound_task.take() {
            let _ = task.await;
        }
        Ok(())
    }

    fn done(&self) -> bool {
        !self.client_open
            && self.table.active_count() == 0
            && self.table.waiting_count() == 0
            && (!self.table.has_failed() || !self.actions_open)
    }

    async fn wait_and_dispatch(&mut self) -> Result<()> {
        // With only failed jobs left, wake periodically so a retry arriving
        // through a slow path is noticed even if the action channel is quiet.
        let idle_retry = self.table.has_failed()
            && self.table.active_count() == 0
            && self.table.waiting_count() == 0;

        tokio::select! {
            event = self.client_rx.recv(), if self.client_open => {
                match event {
                    Some(ClientEvent::Message(message)) => self.handle_client_message(message),
                    // A closed channel reads as a shutdown notice.
                    Some(ClientEvent::Closed) | None => self.handle_client_message(ClientMessage::Shutdown),
                    Some(ClientEvent::Failed(error)) => {
                        tracing::error!(error = %error, "Client channel corrupted; aborting");
                        return Err(error);
                    }
                }
            }
            Some(event) = self.worker_rx.recv() => {
                self.handle_worker_event(event).await;
            }
            action = self.actions_rx.recv(), if self.actions_open => {
                match action {
                    Some(SchedulerAction::Retry(id)) => self.handle_retry(id),
                    None => self.actions_open = false,
                }
            }
            _ = tokio::time::sleep(self.config.retry_poll_interval), if idle_retry => {}
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Poke pass
    // ------------------------------------------------------------------

    /// Re-evaluate every waiting job in queue order. Retried jobs sit at the
    /// front of the queue, so they are considered first.
    async fn poke(&mut self) {
        for id in self.table.poke_queue() {
            let eligibility = {
                let Some(job) = self.table.get(&id) else { continue };
                if !job.state.is_waiting() {
                    continue;
                }
                self.evaluate(job)
            };
            match eligibility {
                Eligibility::DependencyFailed(dep) => {
                    self.transition(id, JobState::DependencyFailed);
                    let failure = JobFailure::dependency_failed(dep);
                    self.notify_failure(id, &failure);
                    self.send_client(HostMessage::Exception { id, failure }).await;
                }
                Eligibility::Blocked => self.transition(id, JobState::Blocked),
                Eligibility::Queued => self.transition(id, JobState::Queued),
                Eligibility::Activate => self.activate(id).await,
            }
        }
    }

    fn evaluate(&self, job: &Job) -> Eligibility {
        for dep in &job.depends_on {
            match self.table.get(dep) {
                Some(d) if d.state.is_failed() => return Eligibility::DependencyFailed(*dep),
                Some(d) if !d.state.is_finished() => return Eligibility::Blocked,
                Some(_) => {}
                // Dependencies must be submitted before the jobs that need
                // them; an unknown id can never complete.
                None => return Eligibility::DependencyFailed(*dep),
            }
        }
        if self.table.active_count() >= self.config.max_workers {
            Eligibility::Queued
        } else {
            Eligibility::Activate
        }
    }

    async fn activate(&mut self, id: JobId) {
        let Some(job) = self.table.get(&id).cloned() else {
            return;
        };
        match self.spawner.spawn(&job, self.worker_tx.clone()).await {
            Ok(link) => {
                // The pipe is open as soon as the spawn returns; the payload
                // can go out without waiting for the handshake.
                let order = WorkerOrder::Submit {
                    id,
                    payload: job.payload.clone(),
                };
                if let Err(e) = link.send(order) {
                    self.fail_job(id, JobFailure::new(crate::protocol::KIND_SPAWN_FAILED, e.to_string()))
                        .await;
                    return;
                }
                self.links.insert(id, link);
                self.transition(id, JobState::Active);
                tracing::info!(job_id = %id, name = %job.name, "Job started");
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Worker spawn failed");
                self.fail_job(id, JobFailure::new(crate::protocol::KIND_SPAWN_FAILED, e.to_string()))
                    .await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Client channel
    // ------------------------------------------------------------------

    fn handle_client_message(&mut self, message: ClientMessage) {
        self.emit_seen(MessageSource::Client, message.kind());
        match message {
            ClientMessage::Config { max_workers } => {
                if let Some(n) = max_workers {
                    tracing::info!(max_workers = n, "Concurrency cap updated");
                    self.config.max_workers = n;
                }
            }
            ClientMessage::Submit {
                id,
                name,
                icon,
                payload,
                depends_on,
            } => {
                tracing::info!(job_id = %id, name = %name, deps = depends_on.len(), "Job submitted");
                let job = Job::new(id, name, icon, payload, depends_on);
                if !self.table.insert(job) {
                    tracing::warn!(job_id = %id, "Duplicate job id ignored");
                }
            }
            ClientMessage::Shutdown => {
                tracing::info!("Client channel closed; no more submissions");
                self.client_open = false;
                // Stop forwarding results; nobody is listening anymore.
                self.outbound = None;
            }
        }
    }

    // ------------------------------------------------------------------
    // Worker channels
    // ------------------------------------------------------------------

    async fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Message { id, message } => {
                self.emit_seen(MessageSource::Worker(id), message.kind());
                let Some(link) = self.links.get_mut(&id) else {
                    tracing::debug!(job_id = %id, kind = message.kind(), "Message from detached worker ignored");
                    return;
                };
                if !link.handshaken {
                    match message {
                        WorkerMessage::Handshake { pid } => {
                            link.handshaken = true;
                            link.pid = Some(pid);
                            tracing::debug!(job_id = %id, pid, "Worker handshake");
                        }
                        other => {
                            tracing::warn!(job_id = %id, kind = other.kind(), "Worker spoke before handshaking");
                            self.links.remove(&id);
                            self.fail_job(id, JobFailure::worker_terminated("worker did not handshake"))
                                .await;
                        }
                    }
                    return;
                }
                self.handle_worker_message(id, message).await;
            }
            WorkerEvent::Closed { id } => {
                self.emit_seen(MessageSource::Worker(id), "eof");
                self.links.remove(&id);
                if self.unfinished(id) {
                    tracing::warn!(job_id = %id, "Worker exited without a terminal message");
                    self.fail_job(id, JobFailure::worker_terminated("worker terminated unexpectedly"))
                        .await;
                }
            }
            WorkerEvent::Failed { id, error } => {
                self.emit_seen(MessageSource::Worker(id), "error");
                tracing::warn!(job_id = %id, error = %error, "Worker channel broke");
                self.links.remove(&id);
                if self.unfinished(id) {
                    self.fail_job(
                        id,
                        JobFailure::worker_terminated(format!("worker channel error: {error}")),
                    )
                    .await;
                }
            }
        }
    }

    async fn handle_worker_message(&mut self, id: JobId, message: WorkerMessage) {
        match message {
            WorkerMessage::Handshake { pid } => {
                tracing::warn!(job_id = %id, pid, "Duplicate handshake ignored");
            }
            WorkerMessage::Notify {
                message,
                title,
                icon,
                sticky,
            } => {
                let (job_name, job_icon) = match self.table.get(&id) {
                    Some(job) => (job.name.clone(), job.icon.clone()),
                    None => (id.to_string(), None),
                };
                self.notifier.notify(
                    id,
                    Notification {
                        title: title.unwrap_or(job_name),
                        message,
                        icon: icon.or(job_icon),
                        sticky,
                    },
                );
            }
            WorkerMessage::Progress(progress) => {
                // Pure pass-through; progress never changes job state.
                self.send_client(HostMessage::Progress { id, progress }).await;
            }
            WorkerMessage::Result { value } => {
                self.links.remove(&id);
                self.transition(id, JobState::Complete);
                tracing::info!(job_id = %id, "Job complete");
                self.send_client(HostMessage::Result { id, value }).await;
            }
            WorkerMessage::Exception { failure } => {
                self.links.remove(&id);
                tracing::warn!(job_id = %id, kind = %failure.kind, message = %failure.message, "Job failed");
                self.fail_job(id, failure).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    fn handle_retry(&mut self, id: JobId) {
        match self.table.retry(id) {
            Some(outcome) => {
                tracing::info!(
                    job_id = %id,
                    cascaded = outcome.cascaded.len(),
                    "Retrying failed job"
                );
                let _ = self.events.send(SchedulerEvent::StateChanged {
                    id,
                    from: outcome.from,
                    to: JobState::Inited,
                });
                for dep in outcome.cascaded {
                    let _ = self.events.send(SchedulerEvent::StateChanged {
                        id: dep,
                        from: JobState::DependencyFailed,
                        to: JobState::Inited,
                    });
                }
            }
            None => {
                tracing::debug!(job_id = %id, "Retry ignored; job is not in a failed state");
            }
        }
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    fn unfinished(&self, id: JobId) -> bool {
        self.table
            .get(&id)
            .is_some_and(|job| !job.state.is_finished())
    }

    /// Move a job to a new state, publishing the change. Finished states are
    /// sticky; only an explicit retry may leave them.
    fn transition(&mut self, id: JobId, to: JobState) {
        let Some(job) = self.table.get_mut(&id) else {
            return;
        };
        let from = job.state;
        if from == to {
            return;
        }
        if from.is_finished() {
            tracing::debug!(job_id = %id, from = %from, to = %to, "Ignoring transition out of a terminal state");
            return;
        }
        job.state = to;
        tracing::debug!(job_id = %id, from = %from, to = %to, "Job state changed");
        let _ = self.events.send(SchedulerEvent::StateChanged { id, from, to });
    }

    async fn fail_job(&mut self, id: JobId, failure: JobFailure) {
        self.transition(id, JobState::Failed);
        self.notify_failure(id, &failure);
        self.send_client(HostMessage::Exception { id, failure }).await;
    }

    fn notify_failure(&self, id: JobId, failure: &JobFailure) {
        let (title, icon) = match self.table.get(&id) {
            Some(job) => (format!("{} failed", job.name), job.icon.clone()),
            None => (format!("{id} failed"), None),
        };
        self.notifier.notify(
            id,
            Notification {
                title,
                message: failure.to_string(),
                icon,
                sticky: true,
            },
        );
    }

    async fn send_client(&mut self, message: HostMessage) {
        if let Some(outbound) = &self.outbound {
            if outbound.send(message).await.is_err() {
                tracing::warn!("Client writer gone; dropping outbound messages");
                self.outbound = None;
            }
        }
    }

    fn emit_seen(&self, source: MessageSource, kind: &'static str) {
        let _ = self.events.send(SchedulerEvent::MessageSeen { source, kind });
    }
}
