//! Task observation.
//!
//! Callbacks never run on a transfer thread. Every engine owns one notifier
//! thread that drains an unbounded queue and invokes monitors in the order
//! events were queued. Events are queued under the task's state lock, so a
//! task's callbacks follow its state transitions exactly: `on_start`, then
//! progress, then one terminal callback.
//!
//! Progress is coalesced: while one progress event of a task is still
//! waiting for delivery, further chunks only update the counters. A slow
//! monitor therefore sees fewer progress calls but never stalls a transfer.
//! Monitors may call back into the task (`state()`, `cancel()`, ...).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;

use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::task::{TaskHandle, TaskOutput};

/// Receives lifecycle notifications for a single task.
///
/// Exactly one of `on_success`, `on_failure` or `on_cancel` is called per
/// started or cancelled task, and nothing is called after it.
#[allow(unused_variables)]
pub trait TaskMonitor: Send + Sync {
    fn on_start(&self, task: &TaskHandle) {}

    /// `total` is the announced body length, `None` when the server did not
    /// send one.
    fn on_progress(&self, task: &TaskHandle, transferred: u64, total: Option<u64>) {}

    fn on_success(&self, task: &TaskHandle, output: &TaskOutput) {}

    fn on_failure(&self, task: &TaskHandle, error: &CoreError) {}

    fn on_cancel(&self, task: &TaskHandle) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    Start,
    Progress { transferred: u64, total: Option<u64> },
    Success(TaskOutput),
    Failure(CoreError),
    Cancel,
}

impl MonitorEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MonitorEvent::Success(_) | MonitorEvent::Failure(_) | MonitorEvent::Cancel
        )
    }
}

pub(crate) struct Notification {
    pub(crate) monitor: Arc<dyn TaskMonitor>,
    pub(crate) task: TaskHandle,
    pub(crate) event: MonitorEvent,
}

impl Notification {
    fn deliver(self) {
        let Notification {
            monitor,
            task,
            event,
        } = self;
        if let MonitorEvent::Progress { .. } = event {
            task.progress_delivered();
        }
        let result = catch_unwind(AssertUnwindSafe(|| match &event {
            MonitorEvent::Start => monitor.on_start(&task),
            MonitorEvent::Progress { transferred, total } => {
                monitor.on_progress(&task, *transferred, *total)
            }
            MonitorEvent::Success(output) => monitor.on_success(&task, output),
            MonitorEvent::Failure(error) => monitor.on_failure(&task, error),
            MonitorEvent::Cancel => monitor.on_cancel(&task),
        }));
        if result.is_err() {
            warn!(task_id = %task.id(), ?event, "task monitor panicked");
        }
    }
}

/// Sending half of the engine's notifier thread.
#[derive(Clone)]
pub(crate) struct Notifier {
    sender: Sender<Notification>,
}

impl Notifier {
    /// Starts the delivery thread. It exits once every sender is gone.
    pub(crate) fn spawn() -> CoreResult<Self> {
        let (sender, receiver) = mpsc::channel::<Notification>();
        thread::Builder::new()
            .name("fetchpool-notifier".to_string())
            .spawn(move || {
                for notification in receiver {
                    notification.deliver();
                }
            })
            .map_err(|err| CoreError::InvalidState(format!("spawn notifier: {}", err)))?;
        Ok(Self { sender })
    }

    pub(crate) fn send(&self, notification: Notification) {
        if self.sender.send(notification).is_err() {
            warn!("notifier thread is gone, dropping monitor event");
        }
    }
}
