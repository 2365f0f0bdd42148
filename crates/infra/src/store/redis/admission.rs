//! Shared rate-limit window and circuit breaker over Redis.
//!
//! - `{ns}:limiter`: hash of `started_ms`, `requests`, `tokens`
//! - `{ns}:breaker`: hash of `state`, `failures`, `opened_ms`
//!
//! Time comes from the caller's clock in milliseconds, so the window and the
//! cooldown are judged on the same timeline as the job store's leases.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use tracing::instrument;

use admitq_core::{CircuitBreakerConfig, QueueError, QueueResult, RateLimitConfig};

use super::{from_millis, millis, parse_field, split_reply, store_error, StoreClient};
use crate::circuit_breaker::{CircuitEvent, CircuitSnapshot, CircuitState, CircuitTransition};
use crate::rate_limiter::{Acquire, Window, WINDOW};
use crate::store::AdmissionStore;

/// Shared prelude: load the live window, opening a fresh one when the last has elapsed.
macro_rules! windowed {
    ($body:literal) => {
        concat!(
            r#"
local ns, now, window_ms = ARGV[1], tonumber(ARGV[2]), tonumber(ARGV[3])
local key = ns .. ':limiter'
local fields = redis.call('HMGET', key, 'started_ms', 'requests', 'tokens')
local started, requests, tokens = tonumber(fields[1]), tonumber(fields[2]) or 0, tonumber(fields[3]) or 0
if not started or now - started >= window_ms then
  started, requests, tokens = now, 0, 0
  redis.call('HSET', key, 'started_ms', ARGV[2], 'requests', 0, 'tokens', 0)
end
local function reply(status)
  return {status, tostring(started), tostring(requests), tostring(tokens)}
end
"#,
            $body
        )
    };
}

const ACQUIRE: &str = windowed!(
    r#"
local max_requests, max_tokens, cost = tonumber(ARGV[4]), tonumber(ARGV[5]), tonumber(ARGV[6])
if requests + 1 > max_requests or tokens + cost > max_tokens then
  return reply('refused')
end
requests = redis.call('HINCRBY', key, 'requests', 1)
tokens = redis.call('HINCRBY', key, 'tokens', ARGV[6])
return reply('granted')
"#
);

const CHARGE: &str = windowed!(
    r#"
tokens = redis.call('HINCRBY', key, 'tokens', ARGV[4])
return reply('ok')
"#
);

const WINDOW_STATE: &str = windowed!(
    r#"
return reply('ok')
"#
);

const BREAKER: &str = r#"
local ns, event, now = ARGV[1], ARGV[2], tonumber(ARGV[3])
local threshold, timeout_ms = tonumber(ARGV[4]), tonumber(ARGV[5])
local key = ns .. ':breaker'
local fields = redis.call('HMGET', key, 'state', 'failures', 'opened_ms')
local state = fields[1] or 'closed'
local failures = tonumber(fields[2]) or 0
local opened = tonumber(fields[3])
local previous = state
if event == 'allow' then
  if state == 'open' and (not opened or now - opened >= timeout_ms) then state = 'half_open' end
elseif event == 'success' then
  failures = 0
  if state ~= 'open' then
    state = 'closed'
    opened = nil
  end
elseif event == 'failure' then
  failures = failures + 1
  if state == 'half_open' or (state == 'closed' and failures >= threshold) then
    state = 'open'
    opened = now
  end
elseif event == 'release_probe' then
  if state == 'half_open' then state = 'open' end
end
local opened_ms = ''
if opened then opened_ms = string.format('%d', opened) end
redis.call('HSET', key, 'state', state, 'failures', failures, 'opened_ms', opened_ms)
return {previous, state, tostring(failures), opened_ms}
"#;

#[derive(Debug)]
struct Scripts {
    acquire: Script,
    charge: Script,
    window: Script,
    breaker: Script,
}

/// Admission state over the same [`StoreClient`] as the job store, so every
/// worker process draws on one budget and observes one breaker.
#[derive(Debug, Clone)]
pub struct RedisAdmissionStore {
    client: StoreClient,
    scripts: Arc<Scripts>,
}

impl RedisAdmissionStore {
    pub fn new(client: StoreClient) -> Self {
        Self {
            client,
            scripts: Arc::new(Scripts {
                acquire: Script::new(ACQUIRE),
                charge: Script::new(CHARGE),
                window: Script::new(WINDOW_STATE),
                breaker: Script::new(BREAKER),
            }),
        }
    }

    pub fn arc(client: StoreClient) -> Arc<Self> {
        Arc::new(Self::new(client))
    }

    fn ns(&self) -> &str {
        &self.client.namespace
    }
}

fn window_ms() -> u64 {
    WINDOW.as_millis() as u64
}

/// Split a `{status, started_ms, requests, tokens}` reply.
fn decode_window(reply: Vec<String>) -> QueueResult<(String, Window)> {
    let (status, rest) = split_reply(reply)?;
    let [started, requests, tokens] = rest.as_slice() else {
        return Err(QueueError::serialization("malformed limiter reply"));
    };
    let window = Window {
        started_at: from_millis("started_ms", started)?,
        requests: parse_field("requests", requests)?,
        tokens: parse_field("tokens", tokens)?,
    };
    Ok((status, window))
}

fn decode_state(raw: &str) -> QueueResult<CircuitState> {
    CircuitState::parse(raw)
        .ok_or_else(|| QueueError::serialization(format!("unknown circuit state '{raw}'")))
}

fn decode_circuit(state: &str, failures: &str, opened_ms: &str) -> QueueResult<CircuitSnapshot> {
    let opened_at = match opened_ms {
        "" => None,
        ms => Some(from_millis("opened_ms", ms)?),
    };
    Ok(CircuitSnapshot {
        state: decode_state(state)?,
        consecutive_failures: parse_field("failures", failures)?,
        opened_at,
    })
}

#[async_trait]
impl AdmissionStore for RedisAdmissionStore {
    async fn acquire(
        &self,
        limits: RateLimitConfig,
        tokens: u64,
        now: DateTime<Utc>,
    ) -> QueueResult<Acquire> {
        let reply: Vec<String> = self
            .scripts
            .acquire
            .arg(self.ns())
            .arg(millis(now))
            .arg(window_ms())
            .arg(limits.requests_per_minute)
            .arg(limits.tokens_per_minute)
            .arg(tokens)
            .invoke_async(&mut self.client.conn.clone())
            .await
            .map_err(store_error)?;
        let (status, window) = decode_window(reply)?;
        Ok(Acquire {
            granted: status == "granted",
            window,
        })
    }

    async fn charge_tokens(&self, tokens: u64, now: DateTime<Utc>) -> QueueResult<Window> {
        let reply: Vec<String> = self
            .scripts
            .charge
            .arg(self.ns())
            .arg(millis(now))
            .arg(window_ms())
            .arg(tokens)
            .invoke_async(&mut self.client.conn.clone())
            .await
            .map_err(store_error)?;
        Ok(decode_window(reply)?.1)
    }

    async fn window(&self, now: DateTime<Utc>) -> QueueResult<Window> {
        let reply: Vec<String> = self
            .scripts
            .window
            .arg(self.ns())
            .arg(millis(now))
            .arg(window_ms())
            .invoke_async(&mut self.client.conn.clone())
            .await
            .map_err(store_error)?;
        Ok(decode_window(reply)?.1)
    }

    #[instrument(skip(self, config, event), fields(event = event.as_str()))]
    async fn circuit_event(
        &self,
        event: CircuitEvent,
        config: CircuitBreakerConfig,
        now: DateTime<Utc>,
    ) -> QueueResult<CircuitTransition> {
        let reply: Vec<String> = self
            .scripts
            .breaker
            .arg(self.ns())
            .arg(event.as_str())
            .arg(millis(now))
            .arg(config.failure_threshold)
            .arg(config.reset_timeout.as_millis() as u64)
            .invoke_async(&mut self.client.conn.clone())
            .await
            .map_err(store_error)?;
        let [previous, state, failures, opened_ms] = reply.as_slice() else {
            return Err(QueueError::serialization("malformed breaker reply"));
        };
        Ok(CircuitTransition {
            previous: decode_state(previous)?,
            current: decode_circuit(state, failures, opened_ms)?,
        })
    }

    async fn circuit(&self) -> QueueResult<CircuitSnapshot> {
        let (state, failures, opened_ms): (Option<String>, Option<String>, Option<String>) =
            redis::cmd("HMGET")
                .arg(self.client.key("breaker"))
                .arg("state")
                .arg("failures")
                .arg("opened_ms")
                .query_async(&mut self.client.conn.clone())
                .await
                .map_err(store_error)?;
        match state {
            None => Ok(CircuitSnapshot::default()),
            Some(state) => decode_circuit(
                &state,
                failures.as_deref().unwrap_or("0"),
                opened_ms.as_deref().unwrap_or(""),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_reply_decodes() {
        let (status, window) = decode_window(vec![
            "granted".into(),
            "1700000000000".into(),
            "3".into(),
            "1500".into(),
        ])
        .unwrap();
        assert_eq!(status, "granted");
        assert_eq!(window.started_at.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(window.requests, 3);
        assert_eq!(window.tokens, 1_500);
    }

    #[test]
    fn short_window_reply_is_rejected() {
        assert!(decode_window(vec!["ok".into(), "1".into()]).is_err());
    }

    #[test]
    fn circuit_fields_decode() {
        let closed = decode_circuit("closed", "2", "").unwrap();
        assert_eq!(closed.state, CircuitState::Closed);
        assert_eq!(closed.consecutive_failures, 2);
        assert_eq!(closed.opened_at, None);

        let open = decode_circuit("open", "5", "1700000000000").unwrap();
        assert_eq!(open.state, CircuitState::Open);
        assert_eq!(open.opened_at.map(|at| at.timestamp_millis()), Some(1_700_000_000_000));

        assert!(decode_circuit("ajar", "0", "").is_err());
    }
}
