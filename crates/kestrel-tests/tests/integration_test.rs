//! Integration tests for Kestrel
//!
//! The Redis tests require a running Redis instance and the qless-core script.
//! Run with: KESTREL_QLESS_SCRIPT=path/to/qless.lua cargo test -p kestrel-tests -- --ignored

use kestrel_core::KestrelConfig;

fn redis_config() -> KestrelConfig {
    KestrelConfig::from_env().expect("valid KESTREL_* environment")
}

/// Test that the Redis client can connect and read an empty queue
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_client_connection() {
    use kestrel_backend::{Client, Queue, RedisClient};
    use kestrel_tests::common::{init, redis_available, unique_queue};

    init();
    assert!(redis_available().await, "Redis should be reachable on localhost:6379");

    let client = RedisClient::connect(&redis_config().backend)
        .await
        .expect("Failed to connect to Redis");

    let queue = client.queue(&unique_queue("empty"));
    assert!(queue.pop("nobody").await.expect("pop").is_none());
    assert_eq!(queue.length().await.expect("length"), 0);

    client.reconnect().await.expect("reconnect");
    client
        .deregister_worker("nobody")
        .await
        .expect("Failed to deregister worker");

    println!("Redis client connection test passed!");
}

/// Test that a supervisor on Redis drains an empty queue and exits
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_supervisor_drains_empty_queue() {
    use kestrel_backend::{Client, RedisClient};
    use kestrel_tests::common::{init, process_lock, unique_queue};
    use kestrel_worker::{reserver, SelfExecLauncher, WorkerSupervisor};

    init();
    let _lock = process_lock();

    let mut config = redis_config();
    config.worker.name = Some("kestrel-tests".to_string());
    config.worker.queues = vec![unique_queue("drain")];
    config.worker.interval = 0;

    let client = RedisClient::connect(&config.backend)
        .await
        .expect("Failed to connect to Redis");
    let reserver = reserver::build(&client, &config.worker).expect("reserver");
    let launcher = SelfExecLauncher::new(&config).expect("launcher");

    let mut supervisor = WorkerSupervisor::new(client, launcher, reserver, "kestrel-tests");
    supervisor.configure(&config.worker);
    supervisor.run().await.expect("supervisor should exit cleanly");

    println!("Redis supervisor test passed!");
}

/// Test that a configuration file drives reserver construction
#[test]
fn test_config_file_builds_reserver() {
    use kestrel_backend::MemoryClient;
    use kestrel_core::ReserverKind;
    use kestrel_worker::reserver;
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(
        file,
        r#"
[worker]
name = "w1"
queues = ["low", "high", "mid"]
reserver = "priority"
interval = 0

[worker.priorities]
high = 9
low = 1
"#
    )
    .expect("write config");

    let config = KestrelConfig::from_file(file.path()).expect("Failed to load config");
    assert_eq!(config.worker.reserver, ReserverKind::Priority);
    assert_eq!(config.worker.get_name(), "w1");

    let client = MemoryClient::new();
    let reserver = reserver::build(&client, &config.worker).expect("reserver");
    assert_eq!(reserver.queue_names(), vec!["high", "mid", "low"]);

    println!("Config file test passed!");
}

/// Test the job-child runtime end to end against the in-memory backend
#[tokio::test]
async fn test_job_child_runtime() {
    use kestrel_backend::{Client, MemoryClient, Queue};
    use kestrel_core::JobState;
    use kestrel_worker::builtin_registry;
    use kestrel_worker::child::perform_job;
    use serde_json::json;

    let client = MemoryClient::new();
    let registry = builtin_registry();

    let ok = client.put_job("q", "echo", json!({"x": 1}));
    let bad = client.put_job("q", "fail", json!({"message": "bad input"}));
    let queue = client.queue("q");
    queue.pop("w1").await.unwrap();
    queue.pop("w1").await.unwrap();

    perform_job(&client, &registry, &ok, "w1").await.expect("echo");
    perform_job(&client, &registry, &bad, "w1").await.expect("fail");

    assert_eq!(client.state(&ok), Some(JobState::Complete));
    assert_eq!(client.state(&bad), Some(JobState::Failed));

    println!("Job-child runtime test passed!");
}
