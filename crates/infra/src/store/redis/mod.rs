//! Redis-backed stores.
//!
//! Key layout under `{ns}`:
//! - `{ns}:job:{id}`: hash holding the job record
//! - `{ns}:ready:{level}`: eligible Pending jobs per tier, scored by sequence
//! - `{ns}:delayed`: Pending jobs in backoff, scored by eligibility (ms)
//! - `{ns}:inflight`: claimed jobs, scored by lease expiry (ms)
//! - `{ns}:dead`: dead-lettered jobs, scored by dead-letter time (ms)
//! - `{ns}:idem`: idempotency key → job id for resident jobs
//! - `{ns}:seq`, `{ns}:counters`: sequence allocator and outcome counters
//! - `{ns}:limiter`, `{ns}:breaker`: admission state, see [`RedisAdmissionStore`]
//!
//! Every transition is a single Lua script, so claims and settlements are
//! atomic across processes. Scripts reply with a table whose first element is
//! a status word.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError, Script};
use secrecy::ExposeSecret;
use tracing::{info, instrument};

use admitq_core::{
    DeadLetterEntry, Job, JobId, JobStatus, Lease, LeaseId, Priority, QueueError, QueueResult,
    Submission,
};

use super::{CancelOutcome, JobStore, QueueStats, RequeueOutcome};
use crate::config::{StoreAddress, StoreConfig};

mod admission;

pub use admission::RedisAdmissionStore;

/// Maximum delayed jobs promoted or leases reclaimed per script call.
const BATCH: usize = 256;

/// Owned handle to the store, shared by every component that needs it.
#[derive(Clone)]
pub struct StoreClient {
    conn: ConnectionManager,
    namespace: Arc<str>,
    location: Arc<str>,
}

impl core::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StoreClient")
            .field("location", &self.location)
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl StoreClient {
    /// Connect and ping. Failure here is fatal to the caller.
    pub async fn connect(config: &StoreConfig) -> QueueResult<Self> {
        let location = config.address.redacted();
        let client = match &config.address {
            StoreAddress::Url(url) => redis::Client::open(url.expose_secret().as_str()),
            StoreAddress::Discrete {
                host,
                port,
                username,
                password,
                db,
            } => redis::Client::open(redis::ConnectionInfo {
                addr: redis::ConnectionAddr::Tcp(host.clone(), *port),
                redis: redis::RedisConnectionInfo {
                    db: *db,
                    username: username.clone(),
                    password: password.as_ref().map(|p| p.expose_secret().clone()),
                    ..Default::default()
                },
            }),
        }
        .map_err(store_error)?;

        let conn = ConnectionManager::new(client).await.map_err(store_error)?;
        let store = Self {
            conn,
            namespace: Arc::from(config.namespace.as_str()),
            location: Arc::from(location.as_str()),
        };
        store.ping().await?;
        info!(store = %store.location, namespace = %store.namespace, "connected to store");
        Ok(store)
    }

    pub async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.namespace)
    }
}

fn store_error(e: RedisError) -> QueueError {
    match e.kind() {
        ErrorKind::TypeError => QueueError::serialization(e.to_string()),
        _ => QueueError::store_unavailable(e.to_string()),
    }
}

const INSERT: &str = r#"
local ns, id, level, idem, capacity = ARGV[1], ARGV[2], ARGV[3], ARGV[4], tonumber(ARGV[5])
if idem ~= '' then
  local existing = redis.call('HGET', ns .. ':idem', idem)
  if existing then return {'duplicate', existing} end
end
local resident = redis.call('ZCARD', ns .. ':delayed') + redis.call('ZCARD', ns .. ':inflight')
for l = 0, 2 do resident = resident + redis.call('ZCARD', ns .. ':ready:' .. l) end
if resident >= capacity then return {'full'} end
local seq = redis.call('INCR', ns .. ':seq')
local key = ns .. ':job:' .. id
redis.call('HSET', key, unpack(ARGV, 6))
redis.call('HSET', key, 'sequence', seq)
redis.call('ZADD', ns .. ':ready:' .. level, seq, id)
if idem ~= '' then redis.call('HSET', ns .. ':idem', idem, id) end
return {'created', id}
"#;

const CLAIM: &str = r#"
local ns, now, lease, expires, batch = ARGV[1], ARGV[2], ARGV[3], ARGV[4], ARGV[5]
local due = redis.call('ZRANGEBYSCORE', ns .. ':delayed', '-inf', now, 'LIMIT', 0, batch)
for _, id in ipairs(due) do
  local key = ns .. ':job:' .. id
  redis.call('ZREM', ns .. ':delayed', id)
  local fields = redis.call('HMGET', key, 'priority', 'sequence')
  if fields[1] and fields[2] then
    redis.call('ZADD', ns .. ':ready:' .. fields[1], fields[2], id)
  end
end
for level = 2, 0, -1 do
  local head = redis.call('ZRANGE', ns .. ':ready:' .. level, 0, 0)
  if head[1] then
    local id = head[1]
    local key = ns .. ':job:' .. id
    redis.call('ZREM', ns .. ':ready:' .. level, id)
    redis.call('ZADD', ns .. ':inflight', expires, id)
    redis.call('HSET', key, 'status', 'in_flight', 'lease_id', lease,
      'lease_expires_ms', expires, 'updated_ms', now)
    local out = redis.call('HGETALL', key)
    table.insert(out, 1, 'claimed')
    return out
  end
end
return {'empty'}
"#;

/// Shared prelude: resolve the job and check the caller still holds its lease.
macro_rules! lease_guarded {
    ($body:literal) => {
        concat!(
            r#"
local ns, id, lease = ARGV[1], ARGV[2], ARGV[3]
local key = ns .. ':job:' .. id
local fields = redis.call('HMGET', key, 'status', 'lease_id')
if not fields[1] then return {'not_found'} end
if fields[1] ~= 'in_flight' or fields[2] ~= lease then return {'lease_mismatch'} end
local function forget_idempotency()
  local idem = redis.call('HGET', key, 'idempotency_key')
  if idem and idem ~= '' and redis.call('HGET', ns .. ':idem', idem) == id then
    redis.call('HDEL', ns .. ':idem', idem)
  end
end
redis.call('ZREM', ns .. ':inflight', id)
"#,
            $body
        )
    };
}

const ACK: &str = lease_guarded!(
    r#"
forget_idempotency()
redis.call('DEL', key)
redis.call('HINCRBY', ns .. ':counters', 'succeeded', 1)
return {'ok'}
"#
);

const RELEASE: &str = lease_guarded!(
    r#"
local now = ARGV[4]
local meta = redis.call('HMGET', key, 'priority', 'sequence')
redis.call('HSET', key, 'status', 'pending', 'lease_id', '', 'lease_expires_ms', '', 'updated_ms', now)
redis.call('ZADD', ns .. ':ready:' .. meta[1], meta[2], id)
return {'ok'}
"#
);

const REQUEUE: &str = lease_guarded!(
    r#"
local now, eligible, err = ARGV[4], ARGV[5], ARGV[6]
if redis.call('HGET', key, 'cancel_requested') == '1' then
  local attempt = redis.call('HGET', key, 'attempt')
  forget_idempotency()
  redis.call('DEL', key)
  redis.call('HINCRBY', ns .. ':counters', 'cancelled', 1)
  return {'cancelled', attempt}
end
local attempt = redis.call('HINCRBY', key, 'attempt', 1)
redis.call('HSET', key, 'status', 'pending', 'lease_id', '', 'lease_expires_ms', '',
  'eligible_ms', eligible, 'last_error', err, 'updated_ms', now)
local meta = redis.call('HMGET', key, 'priority', 'sequence')
if tonumber(eligible) <= tonumber(now) then
  redis.call('ZADD', ns .. ':ready:' .. meta[1], meta[2], id)
else
  redis.call('ZADD', ns .. ':delayed', eligible, id)
end
return {'requeued', tostring(attempt)}
"#
);

const DEAD_LETTER: &str = lease_guarded!(
    r#"
local now, reason, charge = ARGV[4], ARGV[5], ARGV[6]
if charge == '1' then redis.call('HINCRBY', key, 'attempt', 1) end
forget_idempotency()
redis.call('HSET', key, 'status', 'dead_lettered', 'lease_id', '', 'lease_expires_ms', '',
  'last_error', reason, 'dead_letter_reason', reason, 'dead_lettered_ms', now, 'updated_ms', now)
redis.call('ZADD', ns .. ':dead', now, id)
local out = redis.call('HGETALL', key)
table.insert(out, 1, 'ok')
return out
"#
);

const CANCEL: &str = r#"
local ns, id, now = ARGV[1], ARGV[2], ARGV[3]
local key = ns .. ':job:' .. id
local fields = redis.call('HMGET', key, 'status', 'priority', 'idempotency_key')
local status = fields[1]
if not status then return {'not_found'} end
if status == 'in_flight' then
  redis.call('HSET', key, 'cancel_requested', '1', 'updated_ms', now)
  return {'requested'}
end
if status ~= 'pending' then return {'invalid', status} end
redis.call('ZREM', ns .. ':ready:' .. fields[2], id)
redis.call('ZREM', ns .. ':delayed', id)
local idem = fields[3]
if idem and idem ~= '' and redis.call('HGET', ns .. ':idem', idem) == id then
  redis.call('HDEL', ns .. ':idem', idem)
end
redis.call('DEL', key)
redis.call('HINCRBY', ns .. ':counters', 'cancelled', 1)
return {'cancelled'}
"#;

const RECLAIM: &str = r#"
local ns, now, batch = ARGV[1], ARGV[2], ARGV[3]
local expired = redis.call('ZRANGEBYSCORE', ns .. ':inflight', '-inf', now, 'LIMIT', 0, batch)
local reclaimed = {}
for _, id in ipairs(expired) do
  local key = ns .. ':job:' .. id
  redis.call('ZREM', ns .. ':inflight', id)
  local fields = redis.call('HMGET', key, 'status', 'priority', 'sequence', 'cancel_requested', 'idempotency_key')
  if fields[1] == 'in_flight' then
    if fields[4] == '1' then
      local idem = fields[5]
      if idem and idem ~= '' and redis.call('HGET', ns .. ':idem', idem) == id then
        redis.call('HDEL', ns .. ':idem', idem)
      end
      redis.call('DEL', key)
      redis.call('HINCRBY', ns .. ':counters', 'cancelled', 1)
    else
      redis.call('HSET', key, 'status', 'pending', 'lease_id', '', 'lease_expires_ms', '', 'updated_ms', now)
      redis.call('ZADD', ns .. ':ready:' .. fields[2], fields[3], id)
      table.insert(reclaimed, id)
    end
  end
end
return reclaimed
"#;

const REPLAY: &str = r#"
local ns, id, capacity, now = ARGV[1], ARGV[2], tonumber(ARGV[3]), ARGV[4]
local key = ns .. ':job:' .. id
if not redis.call('ZSCORE', ns .. ':dead', id) then return {'not_found'} end
local resident = redis.call('ZCARD', ns .. ':delayed') + redis.call('ZCARD', ns .. ':inflight')
for l = 0, 2 do resident = resident + redis.call('ZCARD', ns .. ':ready:' .. l) end
if resident >= capacity then return {'full'} end
local seq = redis.call('INCR', ns .. ':seq')
redis.call('ZREM', ns .. ':dead', id)
redis.call('HSET', key, 'status', 'pending', 'attempt', '0', 'sequence', seq, 'eligible_ms', now,
  'lease_id', '', 'lease_expires_ms', '', 'cancel_requested', '0', 'dead_letter_reason', '',
  'dead_lettered_ms', '', 'updated_ms', now)
local fields = redis.call('HMGET', key, 'priority', 'idempotency_key')
redis.call('ZADD', ns .. ':ready:' .. fields[1], seq, id)
if fields[2] and fields[2] ~= '' then redis.call('HSETNX', ns .. ':idem', fields[2], id) end
local out = redis.call('HGETALL', key)
table.insert(out, 1, 'ok')
return out
"#;

const DELETE_DEAD: &str = r#"
local ns, id = ARGV[1], ARGV[2]
if redis.call('ZREM', ns .. ':dead', id) == 0 then return {'not_found'} end
redis.call('DEL', ns .. ':job:' .. id)
return {'ok'}
"#;

/// Job store over Redis. Clones share the underlying connection.
#[derive(Debug, Clone)]
pub struct RedisJobStore {
    client: StoreClient,
    scripts: Arc<Scripts>,
}

#[derive(Debug)]
struct Scripts {
    insert: Script,
    claim: Script,
    ack: Script,
    release: Script,
    requeue: Script,
    dead_letter: Script,
    cancel: Script,
    reclaim: Script,
    replay: Script,
    delete_dead: Script,
}

impl RedisJobStore {
    pub fn new(client: StoreClient) -> Self {
        Self {
            client,
            scripts: Arc::new(Scripts {
                insert: Script::new(INSERT),
                claim: Script::new(CLAIM),
                ack: Script::new(ACK),
                release: Script::new(RELEASE),
                requeue: Script::new(REQUEUE),
                dead_letter: Script::new(DEAD_LETTER),
                cancel: Script::new(CANCEL),
                reclaim: Script::new(RECLAIM),
                replay: Script::new(REPLAY),
                delete_dead: Script::new(DELETE_DEAD),
            }),
        }
    }

    pub async fn connect(config: &StoreConfig) -> QueueResult<Self> {
        Ok(Self::new(StoreClient::connect(config).await?))
    }

    pub fn client(&self) -> &StoreClient {
        &self.client
    }

    fn ns(&self) -> &str {
        &self.client.namespace
    }

    fn conn(&self) -> ConnectionManager {
        self.client.conn.clone()
    }

    async fn load_many(&self, ids: &[String]) -> QueueResult<Vec<HashMap<String, String>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for id in ids {
            pipe.hgetall(self.client.key(&format!("job:{id}")));
        }
        let records: Vec<HashMap<String, String>> =
            pipe.query_async(&mut self.conn()).await.map_err(store_error)?;
        Ok(records)
    }
}

/// Split a `{status, k1, v1, ...}` reply into its status and record.
fn split_reply(mut reply: Vec<String>) -> QueueResult<(String, Vec<String>)> {
    if reply.is_empty() {
        return Err(QueueError::serialization("empty script reply"));
    }
    let status = reply.remove(0);
    Ok((status, reply))
}

fn guard_failure(status: &str, job_id: JobId) -> QueueError {
    match status {
        "not_found" => QueueError::NotFound(job_id),
        "lease_mismatch" => QueueError::LeaseMismatch(job_id),
        other => QueueError::serialization(format!("unexpected script reply '{other}'")),
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(field: &str, raw: &str) -> QueueResult<DateTime<Utc>> {
    let ms: i64 = parse_field(field, raw)?;
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::serialization(format!("{field} out of range: {ms}")))
}

fn parse_field<T: core::str::FromStr>(field: &str, raw: &str) -> QueueResult<T> {
    raw.parse()
        .map_err(|_| QueueError::serialization(format!("invalid {field}: '{raw}'")))
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.is_empty())
}

fn encode(job: &Job) -> QueueResult<Vec<(&'static str, String)>> {
    let payload =
        serde_json::to_string(&job.payload).map_err(|e| QueueError::serialization(e.to_string()))?;
    Ok(vec![
        ("id", job.id.to_string()),
        ("priority", job.priority.level().to_string()),
        ("payload", payload),
        ("estimated_tokens", job.estimated_tokens.to_string()),
        ("idempotency_key", job.idempotency_key.clone().unwrap_or_default()),
        ("attempt", job.attempt.to_string()),
        ("enqueued_ms", millis(job.enqueued_at).to_string()),
        ("eligible_ms", millis(job.next_eligible_at).to_string()),
        ("updated_ms", millis(job.updated_at).to_string()),
        ("status", job.status.as_str().to_string()),
        ("cancel_requested", if job.cancel_requested { "1" } else { "0" }.to_string()),
        ("last_error", job.last_error.clone().unwrap_or_default()),
    ])
}

fn decode(record: &HashMap<String, String>) -> QueueResult<Job> {
    let field = |name: &str| {
        record
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| QueueError::serialization(format!("job record missing '{name}'")))
    };

    let level: u8 = parse_field("priority", field("priority")?)?;
    let priority = Priority::from_level(level)
        .ok_or_else(|| QueueError::serialization(format!("unknown priority level {level}")))?;
    let payload = serde_json::from_str(field("payload")?)
        .map_err(|e| QueueError::serialization(e.to_string()))?;

    let lease = match (
        non_empty(record.get("lease_id")),
        non_empty(record.get("lease_expires_ms")),
    ) {
        (Some(id), Some(expires)) => Some(Lease {
            id: id.parse::<LeaseId>()?,
            expires_at: from_millis("lease_expires_ms", expires)?,
        }),
        _ => None,
    };

    Ok(Job {
        id: field("id")?.parse()?,
        priority,
        payload,
        estimated_tokens: parse_field("estimated_tokens", field("estimated_tokens")?)?,
        idempotency_key: non_empty(record.get("idempotency_key")).map(str::to_string),
        attempt: parse_field("attempt", field("attempt")?)?,
        sequence: parse_field("sequence", field("sequence")?)?,
        enqueued_at: from_millis("enqueued_ms", field("enqueued_ms")?)?,
        next_eligible_at: from_millis("eligible_ms", field("eligible_ms")?)?,
        updated_at: from_millis("updated_ms", field("updated_ms")?)?,
        status: field("status")?.parse::<JobStatus>()?,
        lease,
        cancel_requested: record.get("cancel_requested").is_some_and(|v| v == "1"),
        last_error: non_empty(record.get("last_error")).map(str::to_string),
    })
}

fn decode_pairs(flat: Vec<String>) -> HashMap<String, String> {
    let mut record = HashMap::with_capacity(flat.len() / 2);
    let mut iter = flat.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        record.insert(k, v);
    }
    record
}

fn decode_dead_letter(record: &HashMap<String, String>) -> QueueResult<DeadLetterEntry> {
    let job = decode(record)?;
    let reason = record.get("dead_letter_reason").cloned().unwrap_or_default();
    let dead_lettered_at = match non_empty(record.get("dead_lettered_ms")) {
        Some(ms) => from_millis("dead_lettered_ms", ms)?,
        None => job.updated_at,
    };
    Ok(DeadLetterEntry {
        job,
        reason,
        dead_lettered_at,
    })
}

#[async_trait]
impl JobStore for RedisJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, priority = %job.priority))]
    async fn insert(&self, job: Job, capacity: usize) -> QueueResult<Submission> {
        let mut invocation = self.scripts.insert.prepare_invoke();
        invocation
            .arg(self.ns())
            .arg(job.id.to_string())
            .arg(job.priority.level())
            .arg(job.idempotency_key.as_deref().unwrap_or(""))
            .arg(capacity);
        for (name, value) in encode(&job)? {
            invocation.arg(name).arg(value);
        }
        let reply: Vec<String> = invocation
            .invoke_async(&mut self.conn())
            .await
            .map_err(store_error)?;

        let (status, rest) = split_reply(reply)?;
        let id = |rest: &[String]| -> QueueResult<JobId> {
            rest.first()
                .ok_or_else(|| QueueError::serialization("missing job id in reply"))?
                .parse()
        };
        match status.as_str() {
            "created" => Ok(Submission::Created(id(&rest)?)),
            "duplicate" => Ok(Submission::Duplicate(id(&rest)?)),
            "full" => Err(QueueError::QueueFull { capacity }),
            other => Err(guard_failure(other, job.id)),
        }
    }

    #[instrument(skip(self))]
    async fn claim(&self, now: DateTime<Utc>, lease_ttl: Duration) -> QueueResult<Option<Job>> {
        let lease = Lease::new(now, lease_ttl);
        let reply: Vec<String> = self
            .scripts
            .claim
            .arg(self.ns())
            .arg(millis(now))
            .arg(lease.id.to_string())
            .arg(millis(lease.expires_at))
            .arg(BATCH)
            .invoke_async(&mut self.conn())
            .await
            .map_err(store_error)?;

        let (status, rest) = split_reply(reply)?;
        match status.as_str() {
            "claimed" => decode(&decode_pairs(rest)).map(Some),
            _ => Ok(None),
        }
    }

    async fn get(&self, job_id: JobId) -> QueueResult<Option<Job>> {
        let record: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.client.key(&format!("job:{job_id}")))
            .query_async(&mut self.conn())
            .await
            .map_err(store_error)?;
        if record.is_empty() {
            return Ok(None);
        }
        decode(&record).map(Some)
    }

    #[instrument(skip(self))]
    async fn ack(&self, job_id: JobId, lease: LeaseId) -> QueueResult<()> {
        let reply: Vec<String> = self
            .scripts
            .ack
            .arg(self.ns())
            .arg(job_id.to_string())
            .arg(lease.to_string())
            .invoke_async(&mut self.conn())
            .await
            .map_err(store_error)?;
        match split_reply(reply)?.0.as_str() {
            "ok" => Ok(()),
            other => Err(guard_failure(other, job_id)),
        }
    }

    #[instrument(skip(self))]
    async fn release(&self, job_id: JobId, lease: LeaseId, now: DateTime<Utc>) -> QueueResult<()> {
        let reply: Vec<String> = self
            .scripts
            .release
            .arg(self.ns())
            .arg(job_id.to_string())
            .arg(lease.to_string())
            .arg(millis(now))
            .invoke_async(&mut self.conn())
            .await
            .map_err(store_error)?;
        match split_reply(reply)?.0.as_str() {
            "ok" => Ok(()),
            other => Err(guard_failure(other, job_id)),
        }
    }

    #[instrument(skip(self, error))]
    async fn requeue(
        &self,
        job_id: JobId,
        lease: LeaseId,
        eligible_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<RequeueOutcome> {
        let reply: Vec<String> = self
            .scripts
            .requeue
            .arg(self.ns())
            .arg(job_id.to_string())
            .arg(lease.to_string())
            .arg(millis(now))
            .arg(millis(eligible_at))
            .arg(error)
            .invoke_async(&mut self.conn())
            .await
            .map_err(store_error)?;

        let (status, rest) = split_reply(reply)?;
        let attempt = |rest: &[String]| -> QueueResult<u32> {
            parse_field("attempt", rest.first().map(String::as_str).unwrap_or("0"))
        };
        match status.as_str() {
            "requeued" => Ok(RequeueOutcome::Requeued {
                attempt: attempt(&rest)?,
                eligible_at,
            }),
            "cancelled" => Ok(RequeueOutcome::Cancelled {
                attempt: attempt(&rest)?,
            }),
            other => Err(guard_failure(other, job_id)),
        }
    }

    #[instrument(skip(self, reason))]
    async fn dead_letter(
        &self,
        job_id: JobId,
        lease: LeaseId,
        reason: &str,
        charge_attempt: bool,
        now: DateTime<Utc>,
    ) -> QueueResult<DeadLetterEntry> {
        let reply: Vec<String> = self
            .scripts
            .dead_letter
            .arg(self.ns())
            .arg(job_id.to_string())
            .arg(lease.to_string())
            .arg(millis(now))
            .arg(reason)
            .arg(if charge_attempt { "1" } else { "0" })
            .invoke_async(&mut self.conn())
            .await
            .map_err(store_error)?;

        let (status, rest) = split_reply(reply)?;
        match status.as_str() {
            "ok" => decode_dead_letter(&decode_pairs(rest)),
            other => Err(guard_failure(other, job_id)),
        }
    }

    #[instrument(skip(self))]
    async fn cancel(&self, job_id: JobId, now: DateTime<Utc>) -> QueueResult<CancelOutcome> {
        let reply: Vec<String> = self
            .scripts
            .cancel
            .arg(self.ns())
            .arg(job_id.to_string())
            .arg(millis(now))
            .invoke_async(&mut self.conn())
            .await
            .map_err(store_error)?;

        let (status, rest) = split_reply(reply)?;
        match status.as_str() {
            "cancelled" => Ok(CancelOutcome::Cancelled),
            "requested" => Ok(CancelOutcome::Requested),
            "invalid" => Err(QueueError::InvalidState {
                job_id,
                status: rest.into_iter().next().unwrap_or_default(),
                reason: "only pending or in-flight jobs can be cancelled",
            }),
            other => Err(guard_failure(other, job_id)),
        }
    }

    #[instrument(skip(self))]
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> QueueResult<Vec<JobId>> {
        let reply: Vec<String> = self
            .scripts
            .reclaim
            .arg(self.ns())
            .arg(millis(now))
            .arg(BATCH)
            .invoke_async(&mut self.conn())
            .await
            .map_err(store_error)?;
        reply.iter().map(|id| id.parse()).collect()
    }

    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetterEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.client.key("dead"))
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut self.conn())
            .await
            .map_err(store_error)?;
        self.load_many(&ids)
            .await?
            .iter()
            .filter(|record| !record.is_empty())
            .map(decode_dead_letter)
            .collect()
    }

    #[instrument(skip(self))]
    async fn replay_dead_letter(
        &self,
        job_id: JobId,
        capacity: usize,
        now: DateTime<Utc>,
    ) -> QueueResult<Job> {
        let reply: Vec<String> = self
            .scripts
            .replay
            .arg(self.ns())
            .arg(job_id.to_string())
            .arg(capacity)
            .arg(millis(now))
            .invoke_async(&mut self.conn())
            .await
            .map_err(store_error)?;

        let (status, rest) = split_reply(reply)?;
        match status.as_str() {
            "ok" => decode(&decode_pairs(rest)),
            "full" => Err(QueueError::QueueFull { capacity }),
            other => Err(guard_failure(other, job_id)),
        }
    }

    #[instrument(skip(self))]
    async fn delete_dead_letter(&self, job_id: JobId) -> QueueResult<()> {
        let reply: Vec<String> = self
            .scripts
            .delete_dead
            .arg(self.ns())
            .arg(job_id.to_string())
            .invoke_async(&mut self.conn())
            .await
            .map_err(store_error)?;
        match split_reply(reply)?.0.as_str() {
            "ok" => Ok(()),
            other => Err(guard_failure(other, job_id)),
        }
    }

    async fn stats(&self, now: DateTime<Utc>) -> QueueResult<QueueStats> {
        let now_ms = millis(now);
        let mut pipe = redis::pipe();
        for level in 0..3 {
            pipe.zcard(self.client.key(&format!("ready:{level}")));
        }
        pipe.zcount(self.client.key("delayed"), "-inf", now_ms)
            .zcount(self.client.key("delayed"), format!("({now_ms}"), "+inf")
            .zcard(self.client.key("inflight"))
            .zcard(self.client.key("dead"))
            .hget(self.client.key("counters"), "succeeded")
            .hget(self.client.key("counters"), "cancelled");

        let (low, medium, high, due, delayed, in_flight, dead, succeeded, cancelled): (
            usize,
            usize,
            usize,
            usize,
            usize,
            usize,
            usize,
            Option<u64>,
            Option<u64>,
        ) = pipe.query_async(&mut self.conn()).await.map_err(store_error)?;

        Ok(QueueStats {
            pending: low + medium + high + due,
            delayed,
            in_flight,
            dead_lettered: dead,
            succeeded: succeeded.unwrap_or(0),
            cancelled: cancelled.unwrap_or(0),
        })
    }

    async fn ping(&self) -> QueueResult<()> {
        self.client.ping().await
    }
}
