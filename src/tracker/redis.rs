//! Redis-backed connection store shared by every instance.
//!
//! Check-and-add runs as one Lua script so two instances admitting the last
//! free slot at the same time cannot both succeed. The script also drops
//! members whose marker expired before it counts the set.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use std::time::Duration;

use super::cache::{ConnectionCache, TrackOutcome, active_connections_key, connection_key};
use crate::error::CacheError;

const TRACK_SCRIPT: &str = r#"
local set_key = KEYS[1]
local marker_key = KEYS[2]
local user = ARGV[1]
local capacity = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local now = ARGV[4]
local marker_prefix = ARGV[5]
if capacity > 0 and redis.call('SISMEMBER', set_key, user) == 0 then
  for _, member in ipairs(redis.call('SMEMBERS', set_key)) do
    if redis.call('EXISTS', marker_prefix .. member) == 0 then
      redis.call('SREM', set_key, member)
    end
  end
  local active = redis.call('SCARD', set_key)
  if active >= capacity then
    return {0, active}
  end
end
redis.call('SADD', set_key, user)
redis.call('EXPIRE', set_key, ttl)
redis.call('SET', marker_key, now, 'EX', ttl)
return {1, redis.call('SCARD', set_key)}
"#;

pub struct RedisConnectionCache {
    conn: MultiplexedConnection,
    track: redis::Script,
    ttl_secs: u64,
}

impl RedisConnectionCache {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        Ok(Self {
            conn,
            track: redis::Script::new(TRACK_SCRIPT),
            ttl_secs: ttl.as_secs().max(1),
        })
    }
}

fn unavailable(err: redis::RedisError) -> CacheError {
    CacheError::Unavailable(err.to_string())
}

#[async_trait]
impl ConnectionCache for RedisConnectionCache {
    async fn track(
        &self,
        room_id: &str,
        user_id: &str,
        capacity: u32,
    ) -> Result<TrackOutcome, CacheError> {
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .track
            .key(active_connections_key(room_id))
            .key(connection_key(room_id, user_id))
            .arg(user_id)
            .arg(capacity)
            .arg(self.ttl_secs)
            .arg(chrono::Utc::now().timestamp())
            .arg(connection_key(room_id, ""))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        match reply.as_slice() {
            [1, active] => Ok(TrackOutcome::Tracked {
                active: *active as u64,
            }),
            [0, active] => Ok(TrackOutcome::Full {
                active: *active as u64,
            }),
            other => Err(CacheError::Protocol(format!("track script returned {other:?}"))),
        }
    }

    async fn remove(&self, room_id: &str, user_id: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .srem(active_connections_key(room_id), user_id)
            .ignore()
            .del(connection_key(room_id, user_id))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn count(&self, room_id: &str) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        conn.scard(active_connections_key(room_id))
            .await
            .map_err(unavailable)
    }

    async fn members(&self, room_id: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        conn.smembers(active_connections_key(room_id))
            .await
            .map_err(unavailable)
    }

    async fn contains(&self, room_id: &str, user_id: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        conn.sismember(active_connections_key(room_id), user_id)
            .await
            .map_err(unavailable)
    }

    async fn refresh(&self, room_id: &str, user_id: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let (set_alive, marker_alive): (bool, bool) = redis::pipe()
            .expire(active_connections_key(room_id), self.ttl_secs as i64)
            .expire(connection_key(room_id, user_id), self.ttl_secs as i64)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(set_alive && marker_alive)
    }

    async fn cleanup(&self, room_id: &str) -> Result<usize, CacheError> {
        let members = self.members(room_id).await?;
        if members.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let mut exists = redis::pipe();
        for user in &members {
            exists.exists(connection_key(room_id, user));
        }
        let alive: Vec<bool> = exists.query_async(&mut conn).await.map_err(unavailable)?;

        let stale: Vec<&String> = members
            .iter()
            .zip(alive)
            .filter_map(|(user, alive)| (!alive).then_some(user))
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }
        let _: () = conn
            .srem(active_connections_key(room_id), &stale)
            .await
            .map_err(unavailable)?;
        Ok(stale.len())
    }
}
