use thiserror::Error;

use crate::scheduler::JobId;

#[derive(Error, Debug)]
pub enum ForemanError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Future already settled for job {0}")]
    AlreadySettled(JobId),
}

pub type Result<T> = std::result::Result<T, ForemanError>;
