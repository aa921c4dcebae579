//! Redis counter store.
//!
//! Issuance and restore run as Lua scripts. Redis executes one script at
//! a time, so the per-actor check, the capacity check and both writes are
//! a single indivisible step with no read-then-write window.

use async_trait::async_trait;
use common::ActorId;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};

use crate::counter::{CounterKeys, CounterStore, IssueOutcome, IssueRequest};
use crate::error::{IssuerError, Result};

/// KEYS[1] stock, KEYS[2] holders hash.
/// ARGV[1] actor, ARGV[2] quantity, ARGV[3] per-actor limit, ARGV[4] capacity.
/// Returns -1 when the actor is at its limit, 0 when exhausted, otherwise
/// the issued count.
const ISSUE_SCRIPT: &str = r#"
local held = tonumber(redis.call('HGET', KEYS[2], ARGV[1]) or '0')
local qty = tonumber(ARGV[2])
if held + qty > tonumber(ARGV[3]) then
    return -1
end
local remaining = tonumber(redis.call('GET', KEYS[1]) or '0')
if remaining < qty then
    return 0
end
remaining = redis.call('DECRBY', KEYS[1], qty)
redis.call('HINCRBY', KEYS[2], ARGV[1], qty)
return tonumber(ARGV[4]) - remaining
"#;

/// KEYS[1] stock, KEYS[2] holders hash. ARGV[1] actor, ARGV[2] quantity.
/// Returns -1 when the actor holds less than the quantity, otherwise 1.
const RESTORE_SCRIPT: &str = r#"
local held = tonumber(redis.call('HGET', KEYS[2], ARGV[1]) or '0')
local qty = tonumber(ARGV[2])
if held < qty then
    return -1
end
if held == qty then
    redis.call('HDEL', KEYS[2], ARGV[1])
else
    redis.call('HINCRBY', KEYS[2], ARGV[1], -qty)
end
redis.call('INCRBY', KEYS[1], qty)
return 1
"#;

/// Counter store backed by Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn_manager: ConnectionManager,
    issue_script: Script,
    restore_script: Script,
}

impl RedisCounterStore {
    /// Connects to Redis at `redis_url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await?;
        Ok(Self::new(conn_manager))
    }

    pub fn new(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            issue_script: Script::new(ISSUE_SCRIPT),
            restore_script: Script::new(RESTORE_SCRIPT),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn seed(&self, keys: &CounterKeys, remaining: i64) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn.set(&keys.stock, remaining).await?;
        Ok(())
    }

    async fn try_issue(&self, keys: &CounterKeys, request: &IssueRequest) -> Result<IssueOutcome> {
        let mut conn = self.conn_manager.clone();
        let reply: i64 = self
            .issue_script
            .key(&keys.stock)
            .key(&keys.holders)
            .arg(request.actor.as_str())
            .arg(request.quantity)
            .arg(request.per_actor_limit)
            .arg(request.capacity)
            .invoke_async(&mut conn)
            .await?;
        IssueOutcome::from_reply(reply)
    }

    async fn restore(&self, keys: &CounterKeys, actor: &ActorId, quantity: i64) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let reply: i64 = self
            .restore_script
            .key(&keys.stock)
            .key(&keys.holders)
            .arg(actor.as_str())
            .arg(quantity)
            .invoke_async(&mut conn)
            .await?;
        if reply < 0 {
            return Err(IssuerError::NothingToRestore {
                key: keys.holders.clone(),
                actor: actor.to_string(),
            });
        }
        Ok(())
    }

    async fn remaining(&self, keys: &CounterKeys) -> Result<Option<i64>> {
        let mut conn = self.conn_manager.clone();
        Ok(conn.get(&keys.stock).await?)
    }

    async fn clear(&self, keys: &CounterKeys) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .del(vec![keys.stock.as_str(), keys.holders.as_str()])
            .await?;
        Ok(())
    }
}
