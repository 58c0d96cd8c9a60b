//! Wire messages exchanged between the client, the scheduler, and workers.
//!
//! Each process pair talks over one duplex channel. The catalogue is closed:
//! every message is a variant of one of the four enums below, so dispatch is
//! an exhaustive `match` rather than a string lookup.

use serde::{Deserialize, Serialize};

use crate::scheduler::JobId;

/// Failure kind for a dependency that ended in a failed state.
pub const KIND_DEPENDENCY_FAILED: &str = "DependencyFailed";
/// Failure kind synthesized when a worker's channel closes before a terminal
/// message arrives.
pub const KIND_WORKER_TERMINATED: &str = "WorkerTerminated";
/// Failure kind used by the client when the scheduler channel goes away with
/// futures still pending.
pub const KIND_HOST_SHUTDOWN: &str = "HostShutdown";
/// Failure kind used when the scheduler could not start a worker process.
pub const KIND_SPAWN_FAILED: &str = "SpawnFailed";
/// Failure kind for a payload naming a function the worker does not know.
pub const KIND_UNKNOWN_JOB: &str = "UnknownJob";
/// Failure kind for an argument record the handler could not decode.
pub const KIND_BAD_ARGUMENTS: &str = "BadArguments";
/// Failure kind for a job handler that panicked.
pub const KIND_PANIC: &str = "Panic";
/// Failure kind for a shell command that exited non-zero.
pub const KIND_COMMAND_FAILED: &str = "CommandFailed";

/// Structured description of a job-level failure, carried over the wire and
/// surfaced to the submitter as a rejected future.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: String,
    pub message: String,
    pub trace: Option<String>,
}

impl JobFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    pub fn dependency_failed(dep: JobId) -> Self {
        Self::new(KIND_DEPENDENCY_FAILED, format!("dependency {dep} failed"))
    }

    pub fn worker_terminated(detail: impl Into<String>) -> Self {
        Self::new(KIND_WORKER_TERMINATED, detail)
    }

    pub fn host_shutdown() -> Self {
        Self::new(KIND_HOST_SHUTDOWN, "host shut down with futures pending")
    }

    pub fn is_dependency_failure(&self) -> bool {
        self.kind == KIND_DEPENDENCY_FAILED
    }

    pub fn is_worker_termination(&self) -> bool {
        self.kind == KIND_WORKER_TERMINATED
    }

    pub fn is_host_shutdown(&self) -> bool {
        self.kind == KIND_HOST_SHUTDOWN
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for JobFailure {}

/// A progress report from a running job. All fields are optional; a job may
/// report only a status line, only a counter, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub value: Option<u64>,
    pub maximum: Option<u64>,
    pub status: Option<String>,
}

/// The payload of a job: a registered function name plus a serialized
/// argument record whose schema is known to the submitter and the handler.
/// The scheduler never decodes this; it only forwards the bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCall {
    pub func: String,
    pub args: Vec<u8>,
}

impl JobCall {
    pub fn new<T: Serialize>(func: impl Into<String>, args: &T) -> bincode::Result<Self> {
        Ok(Self {
            func: func.into(),
            args: bincode::serialize(args)?,
        })
    }

    pub fn raw(func: impl Into<String>, args: Vec<u8>) -> Self {
        Self {
            func: func.into(),
            args,
        }
    }

    pub fn decode_args<T: serde::de::DeserializeOwned>(&self) -> bincode::Result<T> {
        bincode::deserialize(&self.args)
    }
}

/// Client → scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Set the concurrency cap. Sent at most once, before any submission.
    Config { max_workers: Option<usize> },
    /// Submit a new job.
    Submit {
        id: JobId,
        name: String,
        icon: Option<String>,
        payload: Vec<u8>,
        depends_on: Vec<JobId>,
    },
    /// No more submissions will come.
    Shutdown,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Config { .. } => "config",
            ClientMessage::Submit { .. } => "submit",
            ClientMessage::Shutdown => "shutdown",
        }
    }
}

/// Scheduler → client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HostMessage {
    Result { id: JobId, value: Vec<u8> },
    Exception { id: JobId, failure: JobFailure },
    Progress { id: JobId, progress: Progress },
    Shutdown,
}

impl HostMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            HostMessage::Result { .. } => "result",
            HostMessage::Exception { .. } => "exception",
            HostMessage::Progress { .. } => "progress",
            HostMessage::Shutdown => "shutdown",
        }
    }
}

/// Scheduler → worker. A worker receives exactly one `Submit` in its life.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerOrder {
    Submit { id: JobId, payload: Vec<u8> },
}

/// Worker → scheduler. The first message must be `Handshake`; the last must
/// be `Result` or `Exception`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerMessage {
    Handshake {
        pid: u32,
    },
    Notify {
        message: String,
        title: Option<String>,
        icon: Option<String>,
        sticky: bool,
    },
    Progress(Progress),
    Result {
        value: Vec<u8>,
    },
    Exception {
        failure: JobFailure,
    },
}

impl WorkerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Handshake { .. } => "handshake",
            WorkerMessage::Notify { .. } => "notify",
            WorkerMessage::Progress(_) => "progress",
            WorkerMessage::Result { .. } => "result",
            WorkerMessage::Exception { .. } => "exception",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_constructors_use_distinguished_kinds() {
        let dep = JobFailure::dependency_failed(JobId::random());
        assert!(dep.is_dependency_failure());
        assert!(!dep.is_host_shutdown());

        let term = JobFailure::worker_terminated("worker terminated unexpectedly");
        assert!(term.is_worker_termination());
        assert_eq!(term.message, "worker terminated unexpectedly");

        assert!(JobFailure::host_shutdown().is_host_shutdown());
    }

    #[test]
    fn job_call_round_trips_args() {
        let call = JobCall::new("echo", &(1u32, "two".to_string())).unwrap();
        assert_eq!(call.func, "echo");
        let (a, b): (u32, String) = call.decode_args().unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, "two");
    }

    #[test]
    fn message_kinds() {
        assert_eq!(ClientMessage::Shutdown.kind(), "shutdown");
        assert_eq!(
            WorkerMessage::Progress(Progress::default()).kind(),
            "progress"
        );
        assert_eq!(HostMessage::Shutdown.kind(), "shutdown");
    }
}
