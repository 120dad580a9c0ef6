//! Redis-backed limiter. Counts are hash fields keyed by server id under
//! one hash per address / per room; the acquire script sums only fields
//! whose server still has a liveness key and sweeps the rest while it is
//! there.

use std::net::IpAddr;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Script};
use tracing::warn;

use super::{
    ConnectionGuard, Limits, RateLimiter, ROOMS_CREATED_EXPIRATION, SERVER_LIVENESS_EXPIRATION,
};
use crate::{Error, Result};

const CONNECTIONS_PREFIX: &str = "rate-limit:connections:";
const OCCUPANCY_PREFIX: &str = "rate-limit:occupancy:";
const ROOMS_CREATED_PREFIX: &str = "rate-limit:rooms-created:";
const LIVENESS_PREFIX: &str = "rate-limit:server-liveness:";

const ACQUIRE_SCRIPT: &str = r"
local function live_total(hash)
    local total = 0
    local fields = redis.call('HGETALL', hash)
    for i = 1, #fields, 2 do
        if redis.call('EXISTS', ARGV[1] .. fields[i]) == 1 then
            total = total + tonumber(fields[i + 1])
        else
            redis.call('HDEL', hash, fields[i])
        end
    end
    return total
end

if live_total(KEYS[1]) >= tonumber(ARGV[3]) then
    return 'ip'
end
if live_total(KEYS[2]) >= tonumber(ARGV[4]) then
    return 'room'
end
redis.call('HINCRBY', KEYS[1], ARGV[2], 1)
redis.call('HINCRBY', KEYS[2], ARGV[2], 1)
return 'ok'
";

const RELEASE_SCRIPT: &str = r"
for i = 1, #KEYS do
    local count = tonumber(redis.call('HGET', KEYS[i], ARGV[1]) or '0')
    if count > 1 then
        redis.call('HSET', KEYS[i], ARGV[1], count - 1)
    else
        redis.call('HDEL', KEYS[i], ARGV[1])
    end
end
return 0
";

const NEW_ROOM_SCRIPT: &str = r"
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
if count >= tonumber(ARGV[1]) then
    return 0
end
count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return 1
";

pub struct RedisRateLimiter {
    server_id: String,
    limits: Limits,
    manager: ConnectionManager,
    acquire: Script,
    release: Script,
    new_room: Script,
}

impl RedisRateLimiter {
    pub fn new(server_id: &str, limits: Limits, manager: ConnectionManager) -> Self {
        Self {
            server_id: server_id.to_owned(),
            limits,
            manager,
            acquire: Script::new(ACQUIRE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            new_room: Script::new(NEW_ROOM_SCRIPT),
        }
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn acquire_new_room(&self, ip: IpAddr) -> Result<()> {
        let mut conn = self.manager.clone();
        let allowed: i64 = self
            .new_room
            .key(format!("{ROOMS_CREATED_PREFIX}{ip}"))
            .arg(self.limits.max_rooms_per_day)
            .arg(ROOMS_CREATED_EXPIRATION.as_secs())
            .invoke_async(&mut conn)
            .await?;
        if allowed == 0 {
            return Err(Error::TooManyRoomsCreated);
        }
        Ok(())
    }

    async fn acquire_connection(&self, ip: IpAddr, room_id: &str) -> Result<ConnectionGuard> {
        let connections_key = format!("{CONNECTIONS_PREFIX}{ip}");
        let occupancy_key = format!("{OCCUPANCY_PREFIX}{room_id}");

        let mut conn = self.manager.clone();
        let outcome: String = self
            .acquire
            .key(&connections_key)
            .key(&occupancy_key)
            .arg(LIVENESS_PREFIX)
            .arg(&self.server_id)
            .arg(self.limits.max_connections_per_ip)
            .arg(self.limits.max_users_per_room)
            .invoke_async(&mut conn)
            .await?;
        match outcome.as_str() {
            "ok" => {}
            "ip" => return Err(Error::TooManyConnections),
            "room" => return Err(Error::RoomFull),
            other => {
                warn!(outcome = other, "Unexpected acquire script result");
                return Err(Error::bad_store("unexpected acquire script result"));
            }
        }

        // The release has to happen even when the owning task is cancelled,
        // so the guard hands it off to a fresh task.
        let release = self.release.clone();
        let server_id = self.server_id.clone();
        let manager = self.manager.clone();
        Ok(ConnectionGuard::new(move || {
            tokio::spawn(async move {
                let mut conn = manager;
                if let Err(e) = release
                    .key(&connections_key)
                    .key(&occupancy_key)
                    .arg(&server_id)
                    .invoke_async::<_, i64>(&mut conn)
                    .await
                {
                    warn!(error = %e, "Failed to release connection slots");
                }
            });
        }))
    }

    async fn refresh_server_liveness(&self, ips: &[IpAddr]) -> Result<()> {
        let key = format!("{LIVENESS_PREFIX}{}", self.server_id);
        let mut pipe = redis::pipe();
        pipe.atomic().del(&key).ignore();
        // The server id itself keeps the set non-empty so the key always
        // exists while we are alive.
        let mut sadd = pipe.cmd("SADD");
        sadd.arg(&key).arg(&self.server_id);
        for ip in ips {
            sadd.arg(ip.to_string());
        }
        sadd.ignore()
            .expire(&key, SERVER_LIVENESS_EXPIRATION.as_secs() as i64)
            .ignore();

        let mut conn = self.manager.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}
