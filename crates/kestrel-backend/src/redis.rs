//! Redis backend driving the qless-core Lua engine
//!
//! Every operation is a single `EVALSHA` of the qless-core script with the
//! arguments `[command, now, args...]`. The engine owns all atomicity: leases,
//! retries and event publication happen inside the script. Lifecycle events
//! are read from the `ql:log` pub/sub channel.

use crate::traits::{BackendError, BackendResult, Client, EventStream, Queue};
use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use futures::StreamExt;
use kestrel_core::{BackendConfig, Jid, Job, JobEvent, JobState};
use redis::FromRedisValue;
use serde::Deserialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// Redis client implementation
#[derive(Clone)]
pub struct RedisClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: BackendConfig,
    pool: RwLock<Pool>,
    script: redis::Script,
    pubsub: redis::Client,
}

impl RedisClient {
    /// Get a connection from the current pool
    async fn get_conn(&self) -> BackendResult<Connection> {
        let pool = self
            .inner
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        pool.get()
            .await
            .map_err(|e| BackendError::Pool(e.to_string()))
    }

    /// Invoke a qless-core command
    async fn call<T: FromRedisValue>(&self, command: &str, args: &[String]) -> BackendResult<T> {
        let mut conn = self.get_conn().await?;
        let mut invocation = self.inner.script.prepare_invoke();
        invocation.arg(command).arg(now());
        for arg in args {
            invocation.arg(arg);
        }
        invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| BackendError::Command {
                command: command.to_string(),
                message: e.to_string(),
            })
    }

    /// Enqueue `job` on `queue`, keeping its jid, class, data, priority,
    /// tags and retry budget
    pub async fn put(&self, queue: &str, job: &Job) -> BackendResult<Jid> {
        let args = [
            String::new(),
            queue.to_string(),
            job.jid.to_string(),
            job.klass.clone(),
            serde_json::to_string(&job.data)?,
            "0".to_string(),
            "priority".to_string(),
            job.priority.to_string(),
            "tags".to_string(),
            serde_json::to_string(&job.tags)?,
            "retries".to_string(),
            job.retries.to_string(),
        ];
        let jid: String = self.call("put", &args).await?;
        debug!("Put job {} on {}", jid, queue);
        Ok(Jid::from(jid))
    }

    /// Fetch the config this client was built from
    pub fn config(&self) -> &BackendConfig {
        &self.inner.config
    }
}

fn build_pool(config: &BackendConfig) -> BackendResult<Pool> {
    Config::from_url(&config.url)
        .builder()
        .map_err(|e| BackendError::Connection(e.to_string()))?
        .max_size(config.pool_size)
        .wait_timeout(Some(Duration::from_secs(config.connection_timeout)))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| BackendError::Connection(e.to_string()))
}

async fn ping(pool: &Pool) -> BackendResult<()> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| BackendError::Connection(e.to_string()))?;

    let _: String = redis::cmd("PING")
        .query_async(&mut *conn)
        .await
        .map_err(|e| BackendError::Connection(e.to_string()))?;
    Ok(())
}

/// Seconds since the epoch, as the engine expects its clock argument
fn now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Job as the engine encodes it: `data` is a JSON string, and an empty
/// `tags` array comes back as `{}`.
#[derive(Debug, Deserialize)]
struct RawJob {
    jid: String,
    klass: String,
    queue: String,
    state: JobState,
    #[serde(default)]
    worker: String,
    #[serde(default)]
    expires: Option<f64>,
    #[serde(default)]
    retries: u32,
    #[serde(default)]
    remaining: i64,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    tags: serde_json::Value,
    #[serde(default)]
    data: String,
}

impl RawJob {
    fn into_job(self) -> BackendResult<Job> {
        let data = if self.data.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&self.data)?
        };
        let tags = match self.tags {
            serde_json::Value::Array(items) => items
                .into_iter()
                .filter_map(|t| t.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        };
        Ok(Job {
            jid: Jid::from(self.jid),
            klass: self.klass,
            queue: self.queue,
            state: self.state,
            worker: (!self.worker.is_empty()).then_some(self.worker),
            expires: self.expires.filter(|e| *e > 0.0),
            retries: self.retries,
            remaining: self.remaining,
            priority: self.priority,
            tags,
            data,
        })
    }
}

fn parse_job(raw: &str) -> BackendResult<Job> {
    serde_json::from_str::<RawJob>(raw)?.into_job()
}

fn parse_jobs(raw: &str) -> BackendResult<Vec<Job>> {
    // The engine's JSON encoder turns an empty array into an empty object.
    if raw.trim() == "{}" {
        return Ok(Vec::new());
    }
    serde_json::from_str::<Vec<RawJob>>(raw)?
        .into_iter()
        .map(RawJob::into_job)
        .collect()
}

fn require_worker(job: &Job) -> BackendResult<&str> {
    job.worker
        .as_deref()
        .ok_or_else(|| BackendError::LeaseLost(job.jid.clone()))
}

#[async_trait]
impl Client for RedisClient {
    async fn connect(config: &BackendConfig) -> BackendResult<Self> {
        let source = tokio::fs::read_to_string(&config.script_path)
            .await
            .map_err(|e| {
                BackendError::Connection(format!(
                    "failed to read qless script at {}: {}",
                    config.script_path.display(),
                    e
                ))
            })?;

        let pool = build_pool(config)?;
        ping(&pool).await?;

        let pubsub = redis::Client::open(config.url.as_str())
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        info!("Connected to Redis backend at {}", config.url);

        Ok(Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                pool: RwLock::new(pool),
                script: redis::Script::new(&source),
                pubsub,
            }),
        })
    }

    async fn reconnect(&self) -> BackendResult<()> {
        let pool = build_pool(&self.inner.config)?;
        // A fresh pool may report a stale socket from the previous one on its
        // first ping; that is expected and the pool recovers on next use.
        if let Err(e) = ping(&pool).await {
            debug!("Ignoring error while reconnecting: {}", e);
        }
        *self
            .inner
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner) = pool;
        Ok(())
    }

    fn queue(&self, name: &str) -> Arc<dyn Queue> {
        Arc::new(RedisQueue {
            name: name.to_string(),
            client: self.clone(),
        })
    }

    async fn get_job(&self, jid: &Jid) -> BackendResult<Option<Job>> {
        let raw: Option<String> = self.call("get", &[jid.to_string()]).await?;
        raw.as_deref().map(parse_job).transpose()
    }

    async fn complete(&self, job: &Job, data: Option<&serde_json::Value>) -> BackendResult<()> {
        let worker = require_worker(job)?;
        let data = serde_json::to_string(data.unwrap_or(&job.data))?;
        let _: redis::Value = self
            .call(
                "complete",
                &[job.jid.to_string(), worker.to_string(), job.queue.clone(), data],
            )
            .await?;
        debug!("Completed job {}", job.jid);
        Ok(())
    }

    async fn fail(&self, job: &Job, group: &str, message: &str) -> BackendResult<()> {
        let worker = require_worker(job)?;
        let data = serde_json::to_string(&job.data)?;
        let _: redis::Value = self
            .call(
                "fail",
                &[
                    job.jid.to_string(),
                    worker.to_string(),
                    group.to_string(),
                    message.to_string(),
                    data,
                ],
            )
            .await?;
        debug!("Failed job {} in group {}", job.jid, group);
        Ok(())
    }

    async fn retry(
        &self,
        job: &Job,
        group: &str,
        message: &str,
        delay: Duration,
    ) -> BackendResult<()> {
        let worker = require_worker(job)?;
        let _: redis::Value = self
            .call(
                "retry",
                &[
                    job.jid.to_string(),
                    job.queue.clone(),
                    worker.to_string(),
                    delay.as_secs().to_string(),
                    group.to_string(),
                    message.to_string(),
                ],
            )
            .await?;
        debug!("Retrying job {} in {:?}", job.jid, delay);
        Ok(())
    }

    async fn heartbeat(&self, job: &Job) -> BackendResult<()> {
        let worker = require_worker(job)?;
        let _: redis::Value = self
            .call("heartbeat", &[job.jid.to_string(), worker.to_string()])
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> BackendResult<EventStream> {
        let conn = self
            .inner
            .pubsub
            .get_async_connection()
            .await
            .map_err(|e| BackendError::Subscription(e.to_string()))?;
        let mut pubsub = conn.into_pubsub();
        for channel in channels {
            pubsub
                .subscribe(*channel)
                .await
                .map_err(|e| BackendError::Subscription(e.to_string()))?;
        }
        debug!("Subscribed to {:?}", channels);

        let events = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            match JobEvent::parse(&payload) {
                Ok(event) => Some(event),
                Err(e) => {
                    debug!("Skipping unparseable event {:?}: {}", payload, e);
                    None
                }
            }
        });
        Ok(Box::pin(events))
    }

    async fn deregister_worker(&self, name: &str) -> BackendResult<()> {
        let _: redis::Value = self.call("worker.deregister", &[name.to_string()]).await?;
        info!("Deregistered worker {}", name);
        Ok(())
    }
}

/// Queue handle bound to a [`RedisClient`]
pub struct RedisQueue {
    name: String,
    client: RedisClient,
}

#[derive(Debug, Deserialize)]
struct QueueCounts {
    #[serde(default)]
    paused: bool,
}

#[async_trait]
impl Queue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pop(&self, worker: &str) -> BackendResult<Option<Job>> {
        let raw: String = self
            .client
            .call("pop", &[self.name.clone(), worker.to_string(), "1".to_string()])
            .await?;
        Ok(parse_jobs(&raw)?.into_iter().next())
    }

    async fn length(&self) -> BackendResult<u64> {
        self.client.call("length", &[self.name.clone()]).await
    }

    async fn is_paused(&self) -> BackendResult<bool> {
        let raw: String = self.client.call("queues", &[self.name.clone()]).await?;
        let counts: QueueCounts = serde_json::from_str(&raw)?;
        Ok(counts.paused)
    }
}
