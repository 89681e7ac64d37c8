use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::streams::{StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Script};
use repobox_common::{JobRecord, JobStatus, JobUpdate, OutputLine, SessionState, SessionStatus};

use super::{
    Delivery, JobQueue, JobStore, OUTPUT_TTL, StartOutcome, job_key, output_key, provider_key, running_key,
    session_key,
};

const ACQUIRE_SLOT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
  return 0
end
redis.call('INCR', KEYS[1])
return 1
"#;

const RELEASE_SLOT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current <= 0 then
  redis.call('SET', KEYS[1], 0)
  return 0
end
return redis.call('DECR', KEYS[1])
"#;

// Keep in step with `may_start`. Returns '' when the job was started,
// otherwise the status that blocked it.
const START_JOB: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if (not status) or status == '' or status == 'pending'
    or (status == 'running' and ARGV[2] == '1') then
  redis.call('HSET', KEYS[1], 'status', 'running', 'started_at', ARGV[1])
  return ''
end
return status
"#;

// ARGV is the flattened field/value list of the terminal update.
const FINISH_JOB: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'running' then
  return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV))
return 1
"#;

pub async fn connect(url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(url).context("Invalid Redis URL")?;
    client
        .get_connection_manager()
        .await
        .context("Failed to connect to Redis")
}

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    acquire: Script,
    release: Script,
    start: Script,
    finish: Script,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            acquire: Script::new(ACQUIRE_SLOT),
            release: Script::new(RELEASE_SLOT),
            start: Script::new(START_JOB),
            finish: Script::new(FINISH_JOB),
        }
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn job_record(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(job_key(job_id))
            .await
            .with_context(|| format!("Failed to read job {}", job_id))?;
        Ok(JobRecord::from_fields(&fields))
    }

    async fn start_job(
        &self,
        job_id: &str,
        at: DateTime<Utc>,
        restart: bool,
    ) -> Result<StartOutcome> {
        let mut conn = self.conn.clone();
        let found: String = self
            .start
            .key(job_key(job_id))
            .arg(at.to_rfc3339())
            .arg(if restart { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Failed to start job {}", job_id))?;
        if found.is_empty() {
            return Ok(StartOutcome::Started);
        }
        found
            .parse::<JobStatus>()
            .map(StartOutcome::Rejected)
            .map_err(|e| anyhow!("Job {} has an unreadable status: {}", job_id, e))
    }

    async fn finish_job(&self, job_id: &str, update: &JobUpdate) -> Result<bool> {
        let fields = update.to_fields();
        if fields.is_empty() {
            return Ok(false);
        }
        let mut invocation = self.finish.prepare_invoke();
        invocation.key(job_key(job_id));
        for (field, value) in &fields {
            invocation.arg(*field).arg(value);
        }
        let mut conn = self.conn.clone();
        let written: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Failed to finish job {}", job_id))?;
        Ok(written == 1)
    }

    async fn append_output(&self, job_id: &str, lines: &[OutputLine]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let encoded = lines
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to encode output line")?;
        let key = output_key(job_id);
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .rpush(&key, encoded)
            .ignore()
            .expire(&key, OUTPUT_TTL.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Failed to append output for job {}", job_id))?;
        Ok(())
    }

    async fn provider_token(&self, user_id: &str, provider_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(provider_key(provider_id))
            .await
            .with_context(|| format!("Failed to read provider {}", provider_id))?;
        if fields.get("user_id").map(String::as_str) != Some(user_id) {
            return Ok(None);
        }
        Ok(fields.get("token").filter(|t| !t.is_empty()).cloned())
    }

    async fn try_acquire_slot(&self, user_id: &str, limit: u32) -> Result<bool> {
        let mut conn = self.conn.clone();
        let taken: i64 = self
            .acquire
            .key(running_key(user_id))
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Failed to acquire slot for user {}", user_id))?;
        Ok(taken == 1)
    }

    async fn release_slot(&self, user_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .release
            .key(running_key(user_id))
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Failed to release slot for user {}", user_id))?;
        Ok(())
    }

    async fn session_state(&self, session_id: &str) -> Result<Option<SessionState>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(session_key(session_id)).await?;
        let Some(status) = fields.get("status").filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let updated_at = fields
            .get("updated_at")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc));
        Ok(Some(SessionState {
            status: status.clone(),
            updated_at,
        }))
    }

    async fn set_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let mut conn = self.conn.clone();
        let fields = [
            ("status", status.as_str().to_string()),
            ("updated_at", Utc::now().to_rfc3339()),
        ];
        let _: () = conn.hset_multiple(session_key(session_id), &fields).await?;
        Ok(())
    }
}

/// Consumer-group reader over one stream.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager, stream: &str, group: &str, consumer: &str) -> Self {
        Self {
            conn,
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
        }
    }
}

fn to_delivery(entry: StreamId) -> Delivery {
    let fields = entry
        .map
        .iter()
        .filter_map(|(k, v)| {
            redis::from_redis_value::<String>(v)
                .ok()
                .map(|s| (k.clone(), s))
        })
        .collect();
    Delivery {
        id: entry.id,
        fields,
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&self.stream, &self.group, "0")
            .await;
        match created {
            Ok(()) => {
                tracing::info!(stream = %self.stream, group = %self.group, "created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e).context("Failed to create consumer group"),
        }
    }

    async fn read(&self, count: usize, block: Duration) -> Result<Vec<Delivery>> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &[">"], &opts)
            .await
            .context("XREADGROUP failed")?;
        Ok(reply
            .map(|r| {
                r.keys
                    .into_iter()
                    .flat_map(|k| k.ids)
                    .map(to_delivery)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn reclaim(&self, min_idle: Duration, count: usize) -> Result<Vec<Delivery>> {
        let mut conn = self.conn.clone();
        let reply: StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .context("XAUTOCLAIM failed")?;
        Ok(reply.claimed.into_iter().map(to_delivery).collect())
    }

    async fn touch(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: Vec<String> = redis::cmd("XCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(0)
            .arg(ids)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await
            .context("XCLAIM failed")?;
        Ok(())
    }

    async fn ack(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(&self.stream, &self.group, &[id])
            .await
            .with_context(|| format!("Failed to ack message {}", id))?;
        Ok(())
    }
}
