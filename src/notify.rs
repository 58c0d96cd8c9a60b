//! User-visible notifications.
//!
//! The scheduler reports job failures and worker-initiated toasts through a
//! sink trait; the default sink writes structured log lines. A desktop
//! integration would provide its own implementation.

use crate::scheduler::JobId;

#[derive(Debug, Clone)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub icon: Option<String>,
    /// Sticky notifications stay visible until dismissed; used for failures.
    pub sticky: bool,
}

/// Fire-and-forget notification sink. Implementations must not block.
pub trait NotificationSink: Send {
    fn notify(&self, job_id: JobId, notification: Notification);
}

/// Default sink: emits notifications as log records.
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn notify(&self, job_id: JobId, notification: Notification) {
        if notification.sticky {
            tracing::warn!(
                job_id = %job_id,
                title = %notification.title,
                message = %notification.message,
                "Notification"
            );
        } else {
            tracing::info!(
                job_id = %job_id,
                title = %notification.title,
                message = %notification.message,
                "Notification"
            );
        }
    }
}
