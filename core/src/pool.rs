use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::{check_bound, PoolConfig};
use crate::error::{CoreError, CoreResult};

/// How often a waiting acquirer wakes up to look at its cancel flag.
const CANCEL_POLL: Duration = Duration::from_millis(20);

/// Bounds concurrent transfers globally and per host.
///
/// The pool hands out [`PoolPermit`]s; a permit stands for one connection in
/// use and goes back to the pool when dropped. Limit changes only affect
/// later acquisitions, leases already handed out are never revoked.
#[derive(Debug)]
pub struct ConnectionPool {
    state: Mutex<PoolState>,
    released: Condvar,
}

#[derive(Debug)]
struct PoolState {
    max_total: usize,
    default_max_per_host: usize,
    per_host: HashMap<String, usize>,
    leased_total: usize,
    leased_by_host: HashMap<String, usize>,
}

impl PoolState {
    fn limit_for(&self, host: &str) -> usize {
        self.per_host
            .get(host)
            .copied()
            .unwrap_or(self.default_max_per_host)
    }

    fn leased_for(&self, host: &str) -> usize {
        self.leased_by_host.get(host).copied().unwrap_or(0)
    }

    fn has_room(&self, host: &str) -> bool {
        self.leased_total < self.max_total && self.leased_for(host) < self.limit_for(host)
    }

    fn lease(&mut self, host: &str) {
        self.leased_total += 1;
        *self.leased_by_host.entry(host.to_string()).or_insert(0) += 1;
    }

    fn release(&mut self, host: &str) {
        self.leased_total = self.leased_total.saturating_sub(1);
        if let Some(count) = self.leased_by_host.get_mut(host) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.leased_by_host.remove(host);
            }
        }
    }
}

impl ConnectionPool {
    pub fn new(config: &PoolConfig) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(PoolState {
                max_total: config.max_total,
                default_max_per_host: config.default_max_per_host,
                per_host: normalize_hosts(&config.per_host),
                leased_total: 0,
                leased_by_host: HashMap::new(),
            }),
            released: Condvar::new(),
        })
    }

    /// Replaces every bound at once.
    pub fn apply(&self, config: &PoolConfig) -> CoreResult<()> {
        config.validate()?;
        let mut state = self.lock()?;
        state.max_total = config.max_total;
        state.default_max_per_host = config.default_max_per_host;
        state.per_host = normalize_hosts(&config.per_host);
        drop(state);
        self.released.notify_all();
        Ok(())
    }

    pub fn set_max_total(&self, max_total: usize) -> CoreResult<()> {
        check_bound("max_total", max_total)?;
        self.lock()?.max_total = max_total;
        self.released.notify_all();
        Ok(())
    }

    pub fn set_max_per_host(&self, host: &str, max: usize) -> CoreResult<()> {
        let host = normalize_host(host)?;
        check_bound(&host, max)?;
        self.lock()?.per_host.insert(host, max);
        self.released.notify_all();
        Ok(())
    }

    pub fn max_total(&self) -> CoreResult<usize> {
        Ok(self.lock()?.max_total)
    }

    pub fn max_per_host(&self, host: &str) -> CoreResult<usize> {
        let host = normalize_host(host)?;
        Ok(self.lock()?.limit_for(&host))
    }

    /// Number of permits currently leased across all hosts.
    pub fn in_flight(&self) -> usize {
        self.lock().map(|state| state.leased_total).unwrap_or(0)
    }

    pub fn in_flight_for(&self, host: &str) -> usize {
        let host = host.trim().to_ascii_lowercase();
        self.lock().map(|state| state.leased_for(&host)).unwrap_or(0)
    }

    /// Waits for a free slot for `host`.
    ///
    /// Fails with [`CoreError::Timeout`] when no slot frees up within
    /// `timeout`, and with [`CoreError::Cancelled`] as soon as `cancel` is set.
    pub fn acquire(
        self: &Arc<Self>,
        host: &str,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> CoreResult<PoolPermit> {
        let host = host.to_ascii_lowercase();
        let deadline = Instant::now() + timeout;
        let mut state = self.lock()?;
        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(CoreError::Cancelled);
            }
            if state.has_room(&host) {
                state.lease(&host);
                debug!(
                    host = %host,
                    in_flight = state.leased_total,
                    "connection permit acquired"
                );
                return Ok(PoolPermit {
                    pool: Arc::clone(self),
                    host,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CoreError::Timeout(format!(
                    "no connection to {} available within {:?}",
                    host, timeout
                )));
            }
            let wait = (deadline - now).min(CANCEL_POLL);
            state = self
                .released
                .wait_timeout(state, wait)
                .map_err(|_| poisoned())?
                .0;
        }
    }

    fn release(&self, host: &str) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.release(host);
        debug!(host = %host, in_flight = state.leased_total, "connection permit released");
        drop(state);
        self.released.notify_all();
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, PoolState>> {
        self.state.lock().map_err(|_| poisoned())
    }
}

/// A leased connection slot. Dropping it returns the slot to the pool.
#[derive(Debug)]
pub struct PoolPermit {
    pool: Arc<ConnectionPool>,
    host: String,
}

impl PoolPermit {
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.pool.release(&self.host);
    }
}

fn poisoned() -> CoreError {
    CoreError::InvalidState("connection pool lock poisoned".to_string())
}

fn normalize_host(host: &str) -> CoreResult<String> {
    let host = host.trim().to_ascii_lowercase();
    if host.is_empty() {
        return Err(CoreError::InvalidArgument("host must not be empty".to_string()));
    }
    Ok(host)
}

fn normalize_hosts(per_host: &HashMap<String, usize>) -> HashMap<String, usize> {
    per_host
        .iter()
        .map(|(host, limit)| (host.trim().to_ascii_lowercase(), *limit))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pool(max_total: usize, per_host: usize) -> Arc<ConnectionPool> {
        let config = PoolConfig {
            max_total,
            default_max_per_host: per_host,
            per_host: HashMap::new(),
        };
        Arc::new(ConnectionPool::new(&config).expect("valid pool config"))
    }

    #[test]
    fn permits_are_counted_and_returned() {
        let pool = pool(4, 4);
        let never = AtomicBool::new(false);
        let a = pool.acquire("a.test", Duration::from_secs(1), &never).unwrap();
        let b = pool.acquire("b.test", Duration::from_secs(1), &never).unwrap();
        assert_eq!(pool.in_flight(), 2);
        assert_eq!(pool.in_flight_for("a.test"), 1);
        drop(a);
        assert_eq!(pool.in_flight(), 1);
        assert_eq!(pool.in_flight_for("a.test"), 0);
        drop(b);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn per_host_bound_times_out() {
        let pool = pool(10, 1);
        let never = AtomicBool::new(false);
        let _held = pool.acquire("a.test", Duration::from_secs(1), &never).unwrap();
        let started = Instant::now();
        let err = pool
            .acquire("a.test", Duration::from_millis(80), &never)
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(80));
        // another host is unaffected
        assert!(pool.acquire("b.test", Duration::from_millis(80), &never).is_ok());
    }

    #[test]
    fn explicit_host_limit_overrides_default() {
        let pool = pool(10, 1);
        pool.set_max_per_host("A.Test", 3).unwrap();
        assert_eq!(pool.max_per_host("a.test").unwrap(), 3);
        let never = AtomicBool::new(false);
        let permits: Vec<_> = (0..3)
            .map(|_| pool.acquire("a.test", Duration::from_millis(50), &never).unwrap())
            .collect();
        assert_eq!(pool.in_flight_for("a.test"), 3);
        drop(permits);
    }

    #[test]
    fn waiter_wakes_when_permit_released() {
        let pool = pool(1, 1);
        let never = AtomicBool::new(false);
        let held = pool.acquire("a.test", Duration::from_secs(1), &never).unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let never = AtomicBool::new(false);
                pool.acquire("a.test", Duration::from_secs(5), &never)
                    .map(|permit| permit.host().to_string())
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.in_flight(), 1);
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), "a.test");
    }

    #[test]
    fn raising_total_bound_admits_waiter() {
        let pool = pool(1, 5);
        let never = AtomicBool::new(false);
        let _held = pool.acquire("a.test", Duration::from_secs(1), &never).unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let never = AtomicBool::new(false);
                pool.acquire("b.test", Duration::from_secs(5), &never).is_ok()
            })
        };
        thread::sleep(Duration::from_millis(30));
        pool.set_max_total(2).unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn cancelled_waiter_gives_up() {
        let pool = pool(1, 1);
        let never = AtomicBool::new(false);
        let _held = pool.acquire("a.test", Duration::from_secs(1), &never).unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let waiter = {
            let pool = Arc::clone(&pool);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || pool.acquire("a.test", Duration::from_secs(10), &cancel))
        };
        thread::sleep(Duration::from_millis(30));
        cancel.store(true, Ordering::SeqCst);
        assert!(matches!(waiter.join().unwrap(), Err(CoreError::Cancelled)));
        assert_eq!(pool.in_flight(), 1);
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        let pool = pool(2, 2);
        assert!(matches!(pool.set_max_total(0), Err(CoreError::InvalidArgument(_))));
        assert!(matches!(
            pool.set_max_per_host("a.test", 0),
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            pool.set_max_per_host("  ", 1),
            Err(CoreError::InvalidArgument(_))
        ));
        assert_eq!(pool.max_total().unwrap(), 2);
    }
}
