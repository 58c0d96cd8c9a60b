use crate::scheduler::job::{JobId, JobState};

/// Which channel a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSource {
    Client,
    Worker(JobId),
}

/// Events published by the scheduler for observers such as a presentation
/// layer. Observers only display; they never mutate job state directly.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// A job moved between states during a poke pass or a message handler.
    StateChanged {
        id: JobId,
        from: JobState,
        to: JobState,
    },
    /// A message was dispatched, whatever its type. Emitted unconditionally
    /// so observers can show activity without understanding the protocol.
    MessageSeen {
        source: MessageSource,
        kind: &'static str,
    },
}
