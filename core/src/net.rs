use std::fmt;
use std::future::Future;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE};
use reqwest::redirect::Policy;
use reqwest::{Client, Response};
use tokio::runtime::{Builder, Handle, Runtime};
use url::Url;

use crate::config::{CookiePolicy, PoolConfig, RequestConfig};
use crate::error::{CoreError, CoreResult};

const CANCEL_POLL: Duration = Duration::from_millis(20);

/// One GET plus the flag that aborts it.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: Url,
    cancel: Arc<AtomicBool>,
}

impl DownloadRequest {
    pub fn new(url: Url) -> Self {
        Self::with_cancel(url, Arc::new(AtomicBool::new(false)))
    }

    pub fn with_cancel(url: Url, cancel: Arc<AtomicBool>) -> Self {
        Self { url, cancel }
    }

    /// Key the connection pool bounds this request under.
    pub fn host_key(&self) -> String {
        host_key(&self.url)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }
}

pub fn host_key(url: &Url) -> String {
    url.host_str().unwrap_or_default().to_ascii_lowercase()
}

/// Status line and headers of a response, plus its unread body.
pub struct NetResponse {
    pub status_code: u16,
    pub total_bytes: Option<u64>,
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub body: Box<dyn Read + Send>,
}

impl NetResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

impl fmt::Debug for NetResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetResponse")
            .field("status_code", &self.status_code)
            .field("total_bytes", &self.total_bytes)
            .field("content_type", &self.content_type)
            .field("cache_control", &self.cache_control)
            .finish_non_exhaustive()
    }
}

/// Transport seam: performs one GET and hands back a streaming body.
///
/// Implementations must give up promptly once the request's cancel flag is
/// set, both while waiting for headers (`Err(CoreError::Cancelled)`) and
/// inside `body.read` (any error). Dropping the body closes the connection.
pub trait NetClient: Send + Sync {
    fn get(&self, req: &DownloadRequest) -> CoreResult<NetResponse>;
}

/// reqwest's async client driven from worker threads on a small private
/// runtime, so every await can be raced against cancellation.
pub struct ReqwestNetClient {
    client: Client,
    read_timeout: Duration,
    handle: Handle,
    runtime: Arc<IoRuntime>,
}

/// Shuts down without blocking, so the last owner may be dropped anywhere,
/// including from inside another runtime.
struct IoRuntime(Option<Runtime>);

impl Drop for IoRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

impl ReqwestNetClient {
    pub fn new(request: &RequestConfig, pool: &PoolConfig) -> CoreResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("fetchpool-io")
            .enable_all()
            .build()
            .map_err(|err| CoreError::InvalidState(format!("start io runtime: {}", err)))?;
        let guard = runtime.enter();
        let client = Client::builder()
            .user_agent(request.user_agent.as_str())
            .connect_timeout(request.connect_timeout)
            .cookie_store(request.cookie_policy == CookiePolicy::Standard)
            .redirect(Policy::limited(request.max_redirects))
            .pool_max_idle_per_host(pool.max_total)
            .build()
            .map_err(|err| CoreError::InvalidArgument(err.to_string()))?;
        drop(guard);
        Ok(Self {
            client,
            read_timeout: request.read_timeout,
            handle: runtime.handle().clone(),
            runtime: Arc::new(IoRuntime(Some(runtime))),
        })
    }
}

impl NetClient for ReqwestNetClient {
    fn get(&self, req: &DownloadRequest) -> CoreResult<NetResponse> {
        let io = Io {
            handle: self.handle.clone(),
            _runtime: Arc::clone(&self.runtime),
            cancel: req.cancel_flag(),
            read_timeout: self.read_timeout,
        };
        let resp = io
            .run(self.client.get(req.url.clone()).send())?
            .map_err(|err| map_reqwest_error(&err))?;
        let headers = resp.headers();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        let cache_control = headers
            .get(CACHE_CONTROL)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        Ok(NetResponse {
            status_code: resp.status().as_u16(),
            total_bytes: resp.content_length(),
            content_type,
            cache_control,
            body: Box::new(ReqwestBody {
                response: Some(resp),
                pending: Vec::new(),
                offset: 0,
                io,
            }),
        })
    }
}

struct Io {
    handle: Handle,
    _runtime: Arc<IoRuntime>,
    cancel: Arc<AtomicBool>,
    read_timeout: Duration,
}

impl Io {
    /// Runs `fut` to completion unless it stalls past the read timeout or
    /// the request is cancelled. Either way the future is dropped, which
    /// tears down its connection.
    fn run<F: Future>(&self, fut: F) -> CoreResult<F::Output> {
        let cancel = &self.cancel;
        let read_timeout = self.read_timeout;
        self.handle.block_on(async move {
            tokio::select! {
                biased;
                () = async {
                    while !cancel.load(Ordering::SeqCst) {
                        tokio::time::sleep(CANCEL_POLL).await;
                    }
                } => Err(CoreError::Cancelled),
                out = tokio::time::timeout(read_timeout, fut) => out.map_err(|_| {
                    CoreError::Timeout(format!("no data for {} ms", read_timeout.as_millis()))
                }),
            }
        })
    }
}

struct ReqwestBody {
    response: Option<Response>,
    pending: Vec<u8>,
    offset: usize,
    io: Io,
}

impl Read for ReqwestBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.offset >= self.pending.len() {
            let Some(response) = self.response.as_mut() else {
                return Ok(0);
            };
            let chunk = match self.io.run(response.chunk()) {
                Ok(Ok(Some(chunk))) => chunk,
                Ok(Ok(None)) => {
                    self.response = None;
                    return Ok(0);
                }
                Ok(Err(err)) if err.is_timeout() => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, err))
                }
                Ok(Err(err)) => return Err(io::Error::new(io::ErrorKind::Other, err)),
                Err(CoreError::Timeout(message)) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, message))
                }
                Err(err) => return Err(io::Error::new(io::ErrorKind::Other, err)),
            };
            self.pending.clear();
            self.pending.extend_from_slice(&chunk);
            self.offset = 0;
        }
        let n = buf.len().min(self.pending.len() - self.offset);
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

impl Drop for ReqwestBody {
    fn drop(&mut self) {
        // an unfinished body closes its socket, which deregisters from the
        // runtime's reactor
        let _guard = self.io.handle.enter();
        self.response.take();
    }
}

fn map_reqwest_error(err: &reqwest::Error) -> CoreError {
    if err.is_timeout() {
        CoreError::Timeout(err.to_string())
    } else {
        CoreError::TransferFailed {
            status: err.status().map(|status| status.as_u16()),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_ignores_port_and_case() {
        let url = Url::parse("http://Example.COM:8080/file").unwrap();
        assert_eq!(host_key(&url), "example.com");
        assert_eq!(DownloadRequest::new(url).host_key(), "example.com");
    }

    #[test]
    fn cancel_flag_is_shared() {
        let url = Url::parse("http://example.com/").unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let req = DownloadRequest::with_cancel(url, Arc::clone(&flag));
        assert!(!req.is_cancelled());
        flag.store(true, Ordering::SeqCst);
        assert!(req.is_cancelled());
    }

    #[test]
    fn builds_client_from_defaults() {
        let client = ReqwestNetClient::new(&RequestConfig::default(), &PoolConfig::default());
        assert!(client.is_ok());
    }
}
