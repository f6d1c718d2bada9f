use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::cache::{freshness, ResponseCache};
use crate::config::RequestConfig;
use crate::error::{CoreError, CoreResult};
use crate::monitor::{MonitorEvent, Notification, Notifier, TaskMonitor};
use crate::net::{DownloadRequest, NetClient, NetResponse};
use crate::pool::ConnectionPool;
use crate::sink::{Sink, TaskTarget};

pub type TaskId = Uuid;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskState {
    Created,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Created => "created",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "created" => Some(TaskState::Created),
            "running" => Some(TaskState::Running),
            "succeeded" => Some(TaskState::Succeeded),
            "failed" => Some(TaskState::Failed),
            "cancelled" => Some(TaskState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a successful task produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutput {
    Text(Arc<str>),
    File(PathBuf),
}

impl TaskOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            TaskOutput::Text(text) => Some(text),
            TaskOutput::File(_) => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            TaskOutput::Text(_) => None,
            TaskOutput::File(path) => Some(path),
        }
    }
}

/// Engine resources a task borrows while it runs.
pub(crate) struct TaskContext {
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) net: Arc<dyn NetClient>,
    pub(crate) cache: Arc<ResponseCache>,
    pub(crate) request: RequestConfig,
}

struct TaskCore {
    id: TaskId,
    url: Url,
    target: TaskTarget,
    context: Arc<TaskContext>,
    cancel: Arc<AtomicBool>,
    progress_queued: AtomicBool,
    inner: Mutex<TaskInner>,
    settled: Condvar,
}

struct TaskInner {
    state: TaskState,
    monitor: Option<Arc<dyn TaskMonitor>>,
    notifier: Notifier,
    bytes_transferred: u64,
    total_bytes: Option<u64>,
    error: Option<CoreError>,
    output: Option<TaskOutput>,
    worker_active: bool,
}

/// Shared handle to one download and its state machine.
///
/// `Created → Running → {Succeeded, Failed, Cancelled}`, or straight from
/// `Created` to `Cancelled`. Every transition happens under the task's state
/// lock, which is what makes a cancel racing a completion settle on a single
/// terminal state.
#[derive(Clone)]
pub struct TaskHandle {
    core: Arc<TaskCore>,
}

impl TaskHandle {
    pub(crate) fn new(
        url: Url,
        target: TaskTarget,
        monitor: Option<Arc<dyn TaskMonitor>>,
        context: Arc<TaskContext>,
        notifier: Notifier,
    ) -> Self {
        Self {
            core: Arc::new(TaskCore {
                id: Uuid::new_v4(),
                url,
                target,
                context,
                cancel: Arc::new(AtomicBool::new(false)),
                progress_queued: AtomicBool::new(false),
                inner: Mutex::new(TaskInner {
                    state: TaskState::Created,
                    monitor,
                    notifier,
                    bytes_transferred: 0,
                    total_bytes: None,
                    error: None,
                    output: None,
                    worker_active: false,
                }),
                settled: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.core.id
    }

    pub fn url(&self) -> &Url {
        &self.core.url
    }

    pub fn state(&self) -> TaskState {
        self.lock().state
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.lock().bytes_transferred
    }

    /// Announced body length, `None` while unknown.
    pub fn total_bytes(&self) -> Option<u64> {
        self.lock().total_bytes
    }

    pub fn error(&self) -> Option<CoreError> {
        self.lock().error.clone()
    }

    pub fn output(&self) -> Option<TaskOutput> {
        self.lock().output.clone()
    }

    /// Attaches a monitor. Only allowed before the task starts.
    pub fn set_monitor(&self, monitor: Arc<dyn TaskMonitor>) -> CoreResult<()> {
        let mut inner = self.lock();
        if inner.state != TaskState::Created {
            return Err(CoreError::InvalidState(format!(
                "cannot attach monitor to task in state {}",
                inner.state
            )));
        }
        inner.monitor = Some(monitor);
        Ok(())
    }

    /// Starts the transfer on a worker thread and returns right away.
    pub fn start(&self) -> CoreResult<()> {
        let mut inner = self.lock();
        if inner.state != TaskState::Created {
            return Err(CoreError::InvalidState(format!(
                "cannot start task in state {}",
                inner.state
            )));
        }
        inner.state = TaskState::Running;
        inner.worker_active = true;
        self.notify(&inner, MonitorEvent::Start);
        info!(task_id = %self.id(), url = %self.url(), "download started");

        let worker = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("fetchpool-task-{}", self.id().simple()))
            .spawn(move || worker.run());
        if let Err(err) = spawned {
            let error = CoreError::transfer(format!("spawn worker: {}", err));
            warn!(task_id = %self.id(), error = %error, "download failed");
            inner.worker_active = false;
            inner.state = TaskState::Failed;
            inner.error = Some(error.clone());
            self.notify(&inner, MonitorEvent::Failure(error));
            drop(inner);
            self.core.settled.notify_all();
        }
        Ok(())
    }

    /// Cancels the task. A no-op once the task is terminal.
    ///
    /// A running task is marked `Cancelled` immediately. The transport aborts
    /// whatever it is waiting on, and the worker then discards partial output
    /// and returns the connection.
    /// Use [`TaskHandle::wait`] to block until that cleanup is done.
    pub fn cancel(&self) -> CoreResult<()> {
        self.core.cancel.store(true, Ordering::SeqCst);
        let mut inner = self.lock();
        match inner.state {
            TaskState::Created | TaskState::Running => {
                self.settle_cancelled(&mut inner);
                let idle = !inner.worker_active;
                drop(inner);
                if idle {
                    self.core.settled.notify_all();
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Blocks until the task is terminal and its worker released everything.
    /// Returns immediately for a task that was never started.
    pub fn wait(&self) -> TaskState {
        let mut inner = self.lock();
        while inner.state != TaskState::Created && !Self::settled(&inner) {
            inner = self
                .core
                .settled
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        inner.state
    }

    /// Like [`TaskHandle::wait`], but gives up after `timeout` and returns
    /// whatever state the task is in by then.
    pub fn wait_timeout(&self, timeout: Duration) -> TaskState {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while inner.state != TaskState::Created && !Self::settled(&inner) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            inner = self
                .core
                .settled
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        inner.state
    }

    pub(crate) fn progress_delivered(&self) {
        self.core.progress_queued.store(false, Ordering::SeqCst);
    }

    fn settled(inner: &TaskInner) -> bool {
        inner.state.is_terminal() && !inner.worker_active
    }

    fn lock(&self) -> MutexGuard<'_, TaskInner> {
        // the lock never wraps user code, so a poisoned guard still holds
        // consistent state
        self.core
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, inner: &TaskInner, event: MonitorEvent) {
        if let Some(monitor) = &inner.monitor {
            inner.notifier.send(Notification {
                monitor: Arc::clone(monitor),
                task: self.clone(),
                event,
            });
        }
    }

    fn settle_cancelled(&self, inner: &mut TaskInner) {
        inner.state = TaskState::Cancelled;
        inner.error = Some(CoreError::Cancelled);
        self.notify(inner, MonitorEvent::Cancel);
        info!(task_id = %self.id(), bytes = inner.bytes_transferred, "download cancelled");
    }

    fn is_cancelled(&self) -> bool {
        self.core.cancel.load(Ordering::SeqCst)
    }

    fn check_cancelled(&self) -> CoreResult<()> {
        if self.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_total(&self, total: Option<u64>) {
        self.lock().total_bytes = total;
    }

    fn record_progress(&self, bytes: u64) {
        let mut inner = self.lock();
        if inner.state != TaskState::Running {
            return;
        }
        inner.bytes_transferred += bytes;
        if inner.monitor.is_some() && !self.core.progress_queued.swap(true, Ordering::SeqCst) {
            let event = MonitorEvent::Progress {
                transferred: inner.bytes_transferred,
                total: inner.total_bytes,
            };
            self.notify(&inner, event);
        }
    }

    fn run(self) {
        let started = Instant::now();
        let result = self.transfer();

        let mut inner = self.lock();
        match result {
            Ok(output) if inner.state == TaskState::Running => {
                info!(
                    task_id = %self.id(),
                    bytes = inner.bytes_transferred,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "download finished"
                );
                inner.state = TaskState::Succeeded;
                inner.output = Some(output.clone());
                self.notify(&inner, MonitorEvent::Success(output));
            }
            Ok(output) => {
                // cancelled after the last chunk landed
                if let TaskOutput::File(path) = output {
                    if let Err(err) = std::fs::remove_file(&path) {
                        warn!(path = %path.display(), error = %err, "failed to remove cancelled download");
                    }
                }
            }
            Err(_) if inner.state != TaskState::Running => {}
            Err(CoreError::Cancelled) => self.settle_cancelled(&mut inner),
            Err(error) => {
                warn!(task_id = %self.id(), url = %self.url(), error = %error, "download failed");
                inner.state = TaskState::Failed;
                inner.error = Some(error.clone());
                self.notify(&inner, MonitorEvent::Failure(error));
            }
        }
        inner.worker_active = false;
        drop(inner);
        self.core.settled.notify_all();
    }

    /// Runs the transfer. The pool permit and the response body are dropped
    /// before this returns.
    fn transfer(&self) -> CoreResult<TaskOutput> {
        let context = Arc::clone(&self.core.context);
        let url = self.url().as_str();

        if let Some(hit) = context.cache.get(url) {
            debug!(task_id = %self.id(), url = %url, "served from cache");
            let mut body: &[u8] = &hit.body;
            return self.receive(
                &mut body,
                Some(hit.body.len() as u64),
                hit.content_type.as_deref(),
                None,
            );
        }

        let request =
            DownloadRequest::with_cancel(self.url().clone(), Arc::clone(&self.core.cancel));
        let _permit = context.pool.acquire(
            &request.host_key(),
            context.request.connect_timeout,
            &self.core.cancel,
        )?;
        self.check_cancelled()?;

        let response = context.net.get(&request)?;
        if !response.is_success() {
            return Err(CoreError::http_status(response.status_code));
        }
        let NetResponse {
            status_code,
            total_bytes,
            content_type,
            cache_control,
            mut body,
        } = response;

        let fill = freshness(cache_control.as_deref())
            .filter(|_| status_code == 200)
            .filter(|_| total_bytes.map_or(context.cache.admits(0), |len| context.cache.admits(len)))
            .map(|max_age| CacheFill {
                max_age,
                body: Vec::new(),
            });

        self.receive(body.as_mut(), total_bytes, content_type.as_deref(), fill)
    }

    /// Streams `body` into the task's target, reporting progress.
    fn receive(
        &self,
        body: &mut dyn Read,
        total_bytes: Option<u64>,
        content_type: Option<&str>,
        mut fill: Option<CacheFill>,
    ) -> CoreResult<TaskOutput> {
        self.set_total(total_bytes);
        let mut sink = self.core.target.open(total_bytes)?;
        if let Err(err) = self.pump(body, total_bytes, &mut sink, &mut fill) {
            sink.discard();
            return Err(err);
        }
        let output = sink.finish(content_type)?;

        if let Some(fill) = fill {
            let context = &self.core.context;
            context.cache.put(
                self.url().as_str(),
                fill.body,
                content_type.map(str::to_string),
                fill.max_age,
            );
        }
        Ok(output)
    }

    fn pump(
        &self,
        body: &mut dyn Read,
        total_bytes: Option<u64>,
        sink: &mut Sink,
        fill: &mut Option<CacheFill>,
    ) -> CoreResult<()> {
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut received = 0u64;
        loop {
            self.check_cancelled()?;
            let read = match body.read(&mut buffer) {
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                // the transport aborted the read because of the cancel flag
                Err(_) if self.is_cancelled() => return Err(CoreError::Cancelled),
                Err(err) => return Err(CoreError::from_io(&err)),
            };
            if read == 0 {
                break;
            }
            let chunk = &buffer[..read];
            sink.write_chunk(chunk)?;
            received += read as u64;

            let keep = match fill.as_mut() {
                Some(fill) => {
                    fill.body.extend_from_slice(chunk);
                    self.core.context.cache.admits(fill.body.len() as u64)
                }
                None => true,
            };
            if !keep {
                *fill = None;
            }
            self.record_progress(read as u64);
        }
        self.check_cancelled()?;

        if let Some(total) = total_bytes {
            if received != total {
                return Err(CoreError::transfer(format!(
                    "body ended after {} of {} bytes",
                    received, total
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.core.id)
            .field("url", &self.core.url.as_str())
            .field("target", &self.core.target)
            .field("state", &self.state())
            .finish()
    }
}

struct CacheFill {
    max_age: Duration,
    body: Vec<u8>,
}

/// Operations shared by both task variants.
pub trait DownloadTask {
    fn handle(&self) -> &TaskHandle;

    fn id(&self) -> TaskId {
        self.handle().id()
    }

    fn url(&self) -> &Url {
        self.handle().url()
    }

    fn state(&self) -> TaskState {
        self.handle().state()
    }

    fn start(&self) -> CoreResult<()> {
        self.handle().start()
    }

    fn cancel(&self) -> CoreResult<()> {
        self.handle().cancel()
    }

    fn wait(&self) -> TaskState {
        self.handle().wait()
    }

    fn wait_timeout(&self, timeout: Duration) -> TaskState {
        self.handle().wait_timeout(timeout)
    }

    fn bytes_transferred(&self) -> u64 {
        self.handle().bytes_transferred()
    }

    fn total_bytes(&self) -> Option<u64> {
        self.handle().total_bytes()
    }

    fn error(&self) -> Option<CoreError> {
        self.handle().error()
    }

    fn set_monitor(&self, monitor: Arc<dyn TaskMonitor>) -> CoreResult<()> {
        self.handle().set_monitor(monitor)
    }
}

/// Buffers the body in memory and decodes it to text.
#[derive(Debug, Clone)]
pub struct StringDownloadTask {
    handle: TaskHandle,
}

impl StringDownloadTask {
    pub(crate) fn new(handle: TaskHandle) -> Self {
        Self { handle }
    }

    /// Decoded body, once the task succeeded.
    pub fn result(&self) -> Option<Arc<str>> {
        match self.handle.output() {
            Some(TaskOutput::Text(text)) => Some(text),
            _ => None,
        }
    }
}

impl DownloadTask for StringDownloadTask {
    fn handle(&self) -> &TaskHandle {
        &self.handle
    }
}

/// Streams the body into a file. A failed or cancelled transfer leaves no
/// file behind.
#[derive(Debug, Clone)]
pub struct FileDownloadTask {
    handle: TaskHandle,
    destination: PathBuf,
}

impl FileDownloadTask {
    pub(crate) fn new(handle: TaskHandle, destination: PathBuf) -> Self {
        Self {
            handle,
            destination,
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Path of the written file, once the task succeeded.
    pub fn result(&self) -> Option<PathBuf> {
        match self.handle.output() {
            Some(TaskOutput::File(path)) => Some(path),
            _ => None,
        }
    }
}

impl DownloadTask for FileDownloadTask {
    fn handle(&self) -> &TaskHandle {
        &self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_round_trip() {
        for state in [
            TaskState::Created,
            TaskState::Running,
            TaskState::Succeeded,
            TaskState::Failed,
            TaskState::Cancelled,
        ] {
            assert_eq!(TaskState::from_str(state.as_str()), Some(state));
            assert_eq!(state.to_string(), state.as_str());
        }
        assert_eq!(TaskState::from_str("paused"), None);
    }

    #[test]
    fn only_final_states_are_terminal() {
        assert!(!TaskState::Created.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }

    #[test]
    fn output_accessors() {
        let text = TaskOutput::Text(Arc::from("hi"));
        assert_eq!(text.as_text(), Some("hi"));
        assert_eq!(text.as_path(), None);
        let file = TaskOutput::File(PathBuf::from("/tmp/x"));
        assert_eq!(file.as_path(), Some(Path::new("/tmp/x")));
    }
}
