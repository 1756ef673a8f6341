//! Resource limits that turn into a graceful shutdown

use crate::control::Control;
use nix::sys::resource::{getrusage, UsageWho};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

type MemoryProbe = Box<dyn Fn() -> u64 + Send + Sync>;

/// Checks job count, uptime and memory after each cycle.
///
/// Every limit is optional. The first one to trip requests a graceful
/// shutdown; later trips are no-ops because shutdown is already pending.
pub struct ResourceLimiter {
    control: Arc<Control>,
    started: Instant,
    jobs: u64,
    max_jobs: Option<u64>,
    time_limit: Option<Duration>,
    memory_limit: Option<u64>,
    memory_probe: MemoryProbe,
}

impl ResourceLimiter {
    pub fn new(control: Arc<Control>) -> Self {
        Self {
            control,
            started: Instant::now(),
            jobs: 0,
            max_jobs: None,
            time_limit: None,
            memory_limit: None,
            memory_probe: Box::new(resident_bytes),
        }
    }

    pub fn set_max_jobs(&mut self, max_jobs: Option<u64>) {
        self.max_jobs = max_jobs;
    }

    pub fn set_time_limit(&mut self, seconds: Option<u64>) {
        self.time_limit = seconds.map(Duration::from_secs);
    }

    pub fn set_memory_limit(&mut self, bytes: Option<u64>) {
        self.memory_limit = bytes;
    }

    /// Replace the resident-memory probe, which defaults to [`resident_bytes`]
    pub fn with_memory_probe(mut self, probe: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.memory_probe = Box::new(probe);
        self
    }

    /// Count one finished cycle
    pub fn record_job(&mut self) {
        self.jobs += 1;
    }

    pub fn jobs(&self) -> u64 {
        self.jobs
    }

    pub fn check_job_count(&self) -> bool {
        match self.max_jobs {
            Some(max) if self.jobs >= max => {
                self.trip(format!("processed {} jobs (limit {})", self.jobs, max))
            }
            _ => false,
        }
    }

    pub fn check_time_limit(&self) -> bool {
        let elapsed = self.started.elapsed();
        match self.time_limit {
            Some(limit) if elapsed >= limit => self.trip(format!(
                "ran for {}s (limit {}s)",
                elapsed.as_secs(),
                limit.as_secs()
            )),
            _ => false,
        }
    }

    pub fn check_memory(&self) -> bool {
        let Some(limit) = self.memory_limit else {
            return false;
        };
        let used = (self.memory_probe)();
        if used > limit {
            self.trip(format!("using {} bytes of memory (limit {})", used, limit))
        } else {
            false
        }
    }

    /// Run every check
    pub fn check_all(&self) {
        self.check_job_count();
        self.check_time_limit();
        self.check_memory();
    }

    /// Returns true when this call requested the shutdown
    fn trip(&self, reason: String) -> bool {
        if self.control.is_shutdown() {
            return false;
        }
        info!("Resource limit reached: {}; shutting down", reason);
        self.control.shutdown();
        true
    }
}

/// Current resident set size of this process.
///
/// Read from `/proc/self/statm` on Linux. Elsewhere this falls back to the
/// peak from getrusage, which never goes down.
pub fn resident_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        match statm_resident_bytes() {
            Ok(bytes) => return bytes,
            Err(e) => warn!("Reading /proc/self/statm failed: {}", e),
        }
    }
    max_rss_bytes()
}

#[cfg(target_os = "linux")]
fn statm_resident_bytes() -> std::io::Result<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm")?;
    let pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|field| field.parse().ok())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, statm.clone()))?;
    // SAFETY: sysconf only reads a configuration value.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    Ok(pages.saturating_mul(page_size.max(0) as u64))
}

/// Peak resident set size of this process
pub fn max_rss_bytes() -> u64 {
    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let raw = usage.max_rss().max(0) as u64;
            // Linux and the BSDs report KiB, macOS reports bytes.
            if cfg!(target_os = "macos") {
                raw
            } else {
                raw.saturating_mul(1024)
            }
        }
        Err(e) => {
            warn!("getrusage failed: {}", e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> (Arc<Control>, ResourceLimiter) {
        let control = Arc::new(Control::new());
        (Arc::clone(&control), ResourceLimiter::new(control))
    }

    #[test]
    fn test_no_limits_never_trip() {
        let (control, mut limiter) = limiter();
        for _ in 0..100 {
            limiter.record_job();
        }
        limiter.check_all();
        assert!(!control.is_shutdown());
    }

    #[test]
    fn test_job_count_limit() {
        let (control, mut limiter) = limiter();
        limiter.set_max_jobs(Some(2));

        limiter.record_job();
        assert!(!limiter.check_job_count());
        assert!(!control.is_shutdown());

        limiter.record_job();
        assert!(limiter.check_job_count());
        assert!(control.is_shutdown());

        // Already shutting down: no second request.
        assert!(!limiter.check_job_count());
    }

    #[test]
    fn test_zero_time_limit_trips_immediately() {
        let (control, mut limiter) = limiter();
        limiter.set_time_limit(Some(0));
        assert!(limiter.check_time_limit());
        assert!(control.is_shutdown());
    }

    #[test]
    fn test_time_limit_not_reached() {
        let (control, mut limiter) = limiter();
        limiter.set_time_limit(Some(3600));
        assert!(!limiter.check_time_limit());
        assert!(!control.is_shutdown());
    }

    #[test]
    fn test_memory_limit_uses_probe() {
        let (control, limiter) = limiter();
        let mut limiter = limiter.with_memory_probe(|| 10_000);

        limiter.set_memory_limit(Some(20_000));
        assert!(!limiter.check_memory());

        limiter.set_memory_limit(Some(5_000));
        assert!(limiter.check_memory());
        assert!(control.is_shutdown());
    }

    #[test]
    fn test_multiple_limits_fire_without_conflict() {
        let (control, limiter) = limiter();
        let mut limiter = limiter.with_memory_probe(|| u64::MAX);
        limiter.set_max_jobs(Some(0));
        limiter.set_time_limit(Some(0));
        limiter.set_memory_limit(Some(1));
        limiter.check_all();
        assert!(control.is_shutdown());
    }

    #[test]
    fn test_max_rss_is_reported() {
        assert!(max_rss_bytes() > 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resident_memory_drops_after_release() {
        let before = resident_bytes();
        assert!(before > 0);

        let block = vec![1u8; 64 * 1024 * 1024];
        let during = resident_bytes();
        assert!(during >= before + 32 * 1024 * 1024);
        drop(std::hint::black_box(block));

        // The peak keeps the block, the live figure does not.
        assert!(max_rss_bytes() >= during);
        assert!(resident_bytes() < during);
    }
}
