//! Supervisor behavior when the process is out of file descriptors
//!
//! Lowering `RLIMIT_NOFILE` affects every thread, so this runs in its own
//! test binary.

use kestrel_backend::{Client, MemoryClient, Queue};
use kestrel_core::JobState;
use kestrel_tests::common::{init, process_lock, ScriptLauncher};
use kestrel_worker::{OrderedReserver, WorkerSupervisor};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use serde_json::json;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

fn supervisor(client: &MemoryClient) -> WorkerSupervisor<MemoryClient, ScriptLauncher> {
    let queues: Vec<Arc<dyn Queue>> = vec![client.queue("a")];
    let reserver = OrderedReserver::new(queues).expect("valid reserver");
    let mut supervisor =
        WorkerSupervisor::new(client.clone(), ScriptLauncher::new("exit 0"), Box::new(reserver), "test-worker");
    supervisor.set_interval(Duration::ZERO);
    supervisor
}

/// Test that cycles skipped for want of an IPC channel do not count as jobs
#[tokio::test]
async fn test_skipped_cycles_do_not_count_toward_max_jobs() {
    init();
    let _lock = process_lock();

    // Signal registration may open descriptors the first time round.
    let warmup = MemoryClient::new();
    supervisor(&warmup)
        .run()
        .await
        .expect("warm-up supervisor should exit cleanly");

    let client = MemoryClient::new();
    let first = client.put_job("a", "echo", json!(1));
    let second = client.put_job("a", "echo", json!(2));
    let mut supervisor = supervisor(&client);
    supervisor.limiter_mut().set_max_jobs(Some(1));

    // Every descriptor below the lowest free one is in use, so capping there
    // makes the next socket pair fail.
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).expect("getrlimit");
    let lowest_free = std::fs::File::open("/dev/null").expect("open /dev/null").as_raw_fd();
    setrlimit(Resource::RLIMIT_NOFILE, lowest_free as u64, hard).expect("lower RLIMIT_NOFILE");
    let result = supervisor.run().await;
    setrlimit(Resource::RLIMIT_NOFILE, soft, hard).expect("restore RLIMIT_NOFILE");
    result.expect("supervisor should exit cleanly");

    // Both jobs were claimed even though the limit is one job.
    assert_eq!(client.pop_log(), vec!["a", "a", "a"]);
    assert_eq!(client.state(&first), Some(JobState::Running));
    assert_eq!(client.state(&second), Some(JobState::Running));
    assert!(client.failure(&first).is_none());
    assert_eq!(client.reconnect_count(), 0);
}
