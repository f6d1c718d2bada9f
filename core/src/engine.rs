use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};
use url::Url;

use crate::cache::ResponseCache;
use crate::config::{CacheConfig, EngineConfig, PoolConfig, RequestConfig};
use crate::error::{CoreError, CoreResult};
use crate::monitor::{Notifier, TaskMonitor};
use crate::net::{NetClient, ReqwestNetClient};
use crate::pool::ConnectionPool;
use crate::sink::TaskTarget;
use crate::task::{FileDownloadTask, StringDownloadTask, TaskContext, TaskHandle};

/// Entry point that owns the shared transport, pool and cache and hands out
/// download tasks bound to them.
///
/// Pool bounds may change at any time. Cache and request settings are frozen
/// once the first task has been created.
pub struct DownloadEngine {
    pool: Arc<ConnectionPool>,
    settings: Mutex<EngineSettings>,
}

struct EngineSettings {
    cache_config: CacheConfig,
    request: RequestConfig,
    net: Arc<dyn NetClient>,
    custom_net: bool,
    cache: Arc<ResponseCache>,
    notifier: Notifier,
    // built on first task creation; from then on the settings above are fixed
    context: Option<Arc<TaskContext>>,
}

impl EngineSettings {
    fn context(&mut self, pool: &Arc<ConnectionPool>) -> Arc<TaskContext> {
        let context = self.context.get_or_insert_with(|| {
            Arc::new(TaskContext {
                pool: Arc::clone(pool),
                net: Arc::clone(&self.net),
                cache: Arc::clone(&self.cache),
                request: self.request.clone(),
            })
        });
        Arc::clone(context)
    }
}

impl DownloadEngine {
    pub fn new(config: EngineConfig) -> CoreResult<Self> {
        config.validate()?;
        let pool = Arc::new(ConnectionPool::new(&config.pool)?);
        let net = ReqwestNetClient::new(&config.request, &config.pool)?;
        let notifier = Notifier::spawn()?;
        info!(
            max_total = config.pool.max_total,
            max_per_host = config.pool.default_max_per_host,
            cache_entries = config.cache.max_entries,
            "download engine ready"
        );
        Ok(Self {
            pool,
            settings: Mutex::new(EngineSettings {
                cache: Arc::new(ResponseCache::new(config.cache.clone())),
                cache_config: config.cache,
                request: config.request,
                net: Arc::new(net),
                custom_net: false,
                notifier,
                context: None,
            }),
        })
    }

    /// Swaps the HTTP transport. Must happen before the first task is created
    /// to affect every task.
    pub fn with_net_client(mut self, net: Box<dyn NetClient>) -> Self {
        if let Ok(settings) = self.settings.get_mut() {
            settings.net = Arc::from(net);
            settings.custom_net = true;
            settings.context = None;
        }
        self
    }

    /// Applies a full configuration.
    ///
    /// Pool bounds are always applied. Cache and request settings can only
    /// change until the first task is created; after that a differing value
    /// fails with [`CoreError::AlreadyInitialized`].
    pub fn configure(
        &self,
        pool: PoolConfig,
        cache: CacheConfig,
        request: RequestConfig,
    ) -> CoreResult<()> {
        pool.validate()?;
        request.validate()?;
        let mut settings = self.lock()?;
        if settings.context.is_some() {
            if cache != settings.cache_config || request != settings.request {
                return Err(CoreError::AlreadyInitialized);
            }
        } else {
            if request != settings.request && !settings.custom_net {
                settings.net = Arc::new(ReqwestNetClient::new(&request, &pool)?);
            }
            if cache != settings.cache_config {
                settings.cache = Arc::new(ResponseCache::new(cache.clone()));
            }
            settings.cache_config = cache;
            settings.request = request;
        }
        self.pool.apply(&pool)?;
        debug!(max_total = pool.max_total, "engine reconfigured");
        Ok(())
    }

    /// Request settings new tasks use. Fixed once the first task exists.
    pub fn request_config(&self) -> CoreResult<RequestConfig> {
        Ok(self.lock()?.request.clone())
    }

    pub fn set_max_total_connections(&self, max_total: usize) -> CoreResult<()> {
        self.pool.set_max_total(max_total)
    }

    pub fn max_total_connections(&self) -> CoreResult<usize> {
        self.pool.max_total()
    }

    pub fn set_max_per_host(&self, host: &str, max: usize) -> CoreResult<()> {
        self.pool.set_max_per_host(host, max)
    }

    pub fn max_per_host(&self, host: &str) -> CoreResult<usize> {
        self.pool.max_per_host(host)
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn cache_len(&self) -> usize {
        self.lock().map(|settings| settings.cache.len()).unwrap_or(0)
    }

    pub fn clear_cache(&self) {
        if let Ok(settings) = self.lock() {
            settings.cache.clear();
        }
    }

    /// Creates an unstarted task that downloads `url` into memory as text.
    pub fn download_string(&self, url: &str) -> CoreResult<StringDownloadTask> {
        let handle = self.create_task(url, TaskTarget::Memory, None)?;
        Ok(StringDownloadTask::new(handle))
    }

    pub fn download_string_with_monitor(
        &self,
        url: &str,
        monitor: Arc<dyn TaskMonitor>,
    ) -> CoreResult<StringDownloadTask> {
        let handle = self.create_task(url, TaskTarget::Memory, Some(monitor))?;
        Ok(StringDownloadTask::new(handle))
    }

    /// Creates an unstarted task that downloads `url` into `destination`.
    ///
    /// The destination's parent directory must already exist.
    pub fn download_file(
        &self,
        url: &str,
        destination: impl AsRef<Path>,
    ) -> CoreResult<FileDownloadTask> {
        self.file_task(url, destination.as_ref(), None)
    }

    pub fn download_file_with_monitor(
        &self,
        url: &str,
        destination: impl AsRef<Path>,
        monitor: Arc<dyn TaskMonitor>,
    ) -> CoreResult<FileDownloadTask> {
        self.file_task(url, destination.as_ref(), Some(monitor))
    }

    fn file_task(
        &self,
        url: &str,
        destination: &Path,
        monitor: Option<Arc<dyn TaskMonitor>>,
    ) -> CoreResult<FileDownloadTask> {
        check_destination(destination)?;
        let target = TaskTarget::File(destination.to_path_buf());
        let handle = self.create_task(url, target, monitor)?;
        Ok(FileDownloadTask::new(handle, destination.to_path_buf()))
    }

    fn create_task(
        &self,
        url: &str,
        target: TaskTarget,
        monitor: Option<Arc<dyn TaskMonitor>>,
    ) -> CoreResult<TaskHandle> {
        let url = parse_url(url)?;
        let mut settings = self.lock()?;
        let context = settings.context(&self.pool);
        let handle = TaskHandle::new(url, target, monitor, context, settings.notifier.clone());
        debug!(task_id = %handle.id(), url = %handle.url(), "task created");
        Ok(handle)
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, EngineSettings>> {
        self.settings
            .lock()
            .map_err(|_| CoreError::InvalidState("engine settings lock poisoned".to_string()))
    }
}

fn parse_url(value: &str) -> CoreResult<Url> {
    let url = Url::parse(value.trim())
        .map_err(|err| CoreError::InvalidArgument(format!("invalid url {:?}: {}", value, err)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(CoreError::InvalidArgument(format!(
            "unsupported scheme {:?} in {}",
            url.scheme(),
            url
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(CoreError::InvalidArgument(format!("url {} has no host", url)));
    }
    Ok(url)
}

fn check_destination(path: &Path) -> CoreResult<()> {
    if path.as_os_str().is_empty() {
        return Err(CoreError::InvalidArgument(
            "destination path is empty".to_string(),
        ));
    }
    if path.is_dir() {
        return Err(CoreError::InvalidArgument(format!(
            "destination {} is a directory",
            path.display()
        )));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            return Err(CoreError::InvalidArgument(format!(
                "parent directory {} does not exist",
                parent.display()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_http_and_https_urls() {
        assert!(parse_url("http://example.com/a").is_ok());
        assert!(parse_url(" https://example.com ").is_ok());
    }

    #[test]
    fn rejects_malformed_and_foreign_urls() {
        for bad in ["", "example.com/file", "not a url", "ftp://example.com/f", "file:///etc/hosts"] {
            assert!(
                matches!(parse_url(bad), Err(CoreError::InvalidArgument(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn destination_rules() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_destination(&dir.path().join("out.bin")).is_ok());
        assert!(check_destination(Path::new("relative.bin")).is_ok());
        assert!(check_destination(dir.path()).is_err());
        assert!(check_destination(&dir.path().join("missing").join("out.bin")).is_err());
        assert!(check_destination(Path::new("")).is_err());
    }
}
