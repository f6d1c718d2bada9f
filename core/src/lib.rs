pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod net;
pub mod pool;
pub mod sink;
pub mod task;


pub use crate::engine::DownloadEngine;
pub use crate::error::{CoreError, CoreResult};
pub use crate::monitor::{MonitorEvent, TaskMonitor};
pub use crate::task::{
    DownloadTask, FileDownloadTask, StringDownloadTask, TaskHandle, TaskId, TaskOutput, TaskState,
};
