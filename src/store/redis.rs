//! Redis backend. The entity list lives under one key per room, the
//! advisory lock is a `SET NX PX` key holding the lease token, and the
//! change feed is a capped per-room stream every node tails.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use redis::{
    aio::ConnectionManager,
    streams::{StreamRangeReply, StreamReadOptions, StreamReadReply},
    AsyncCommands, Script,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::{Lease, MutateFn, Mutation, RoomStore, LOCK_EXPIRATION};
use crate::{game::components::Entity, Error, Result};

const ROOM_PREFIX: &str = "room:";
const LOCK_PREFIX: &str = "room-lock:";
const CHANGES_PREFIX: &str = "room-changes:";

/// Feed entries older than this many commits may be trimmed away. Only
/// subscribers lagging behind a trim can lose data, which surfaces as a
/// stream error.
const CHANGES_MAXLEN: usize = 4096;

/// How long a single blocking feed read waits before cycling.
const CHANGES_BLOCK: Duration = Duration::from_secs(5);

/// Commit is atomic: it only goes through while the lock still carries our
/// lease token, and the value write, the feed append and the lock release
/// happen together or not at all.
const COMMIT_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[2], ARGV[2])
redis.call('XADD', KEYS[3], 'MAXLEN', '~', ARGV[4], '*', 'mutation', ARGV[3])
redis.call('DEL', KEYS[1])
return 1
";

/// Check-and-delete so we never release a lock a later writer re-acquired.
const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('DEL', KEYS[1])
end
return 0
";

pub struct RedisRoomStore {
    manager: ConnectionManager,
    commit: Script,
    release: Script,
}

impl RedisRoomStore {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            commit: Script::new(COMMIT_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    async fn release_lock(&self, lock_key: &str, lease: &Lease) {
        let mut conn = self.manager.clone();
        if let Err(e) = self
            .release
            .key(lock_key)
            .arg(lease.token())
            .invoke_async::<_, ()>(&mut conn)
            .await
        {
            warn!(error = %e, "Failed to release a room lock, letting it expire");
        }
    }
}

fn room_key(room_id: &str) -> String {
    format!("{ROOM_PREFIX}{room_id}")
}

fn lock_key(room_id: &str) -> String {
    format!("{LOCK_PREFIX}{room_id}")
}

fn changes_key(room_id: &str) -> String {
    format!("{CHANGES_PREFIX}{room_id}")
}

#[async_trait]
impl RoomStore for RedisRoomStore {
    async fn read(&self, room_id: &str) -> Result<Option<Vec<Entity>>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(room_key(room_id)).await?;
        raw.map(|value| serde_json::from_str(&value).map_err(Error::from))
            .transpose()
    }

    fn room_ids(&self) -> BoxStream<'static, Result<String>> {
        let mut conn = self.manager.clone();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut iter = match conn.scan_match::<_, String>(format!("{ROOM_PREFIX}*")).await {
                Ok(iter) => iter,
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            };
            while let Some(key) = iter.next_item().await {
                let id = key.trim_start_matches(ROOM_PREFIX).to_owned();
                if tx.send(Ok(id)).await.is_err() {
                    return;
                }
            }
        });
        ReceiverStream::new(rx).boxed()
    }

    async fn apply_mutation(&self, room_id: &str, mutate: MutateFn) -> Result<Mutation> {
        let lease = Lease::begin();
        let lock_key = lock_key(room_id);
        let mut conn = self.manager.clone();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&lock_key)
            .arg(lease.token())
            .arg("NX")
            .arg("PX")
            .arg(LOCK_EXPIRATION.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        if acquired.is_none() {
            return Err(Error::TransactionFailed(
                "another writer holds the room lock",
            ));
        }

        let raw: Option<String> = match conn.get(room_key(room_id)).await {
            Ok(raw) => raw,
            Err(e) => {
                self.release_lock(&lock_key, &lease).await;
                return Err(e.into());
            }
        };
        let current = match raw
            .map(|value| serde_json::from_str(&value).map_err(Error::from))
            .transpose()
        {
            Ok(current) => current,
            Err(e) => {
                self.release_lock(&lock_key, &lease).await;
                return Err(e);
            }
        };

        let result = match mutate(current).await {
            Ok(result) => result,
            Err(e) => {
                self.release_lock(&lock_key, &lease).await;
                return Err(e);
            }
        };

        if lease.expired() {
            self.release_lock(&lock_key, &lease).await;
            return Err(Error::TransactionFailed(
                "the lock lease expired before commit",
            ));
        }

        let entities = serde_json::to_string(&result.entities)?;
        let mutation = serde_json::to_string(&result)?;
        let committed: i64 = self
            .commit
            .key(&lock_key)
            .key(room_key(room_id))
            .key(changes_key(room_id))
            .arg(lease.token())
            .arg(entities)
            .arg(mutation)
            .arg(CHANGES_MAXLEN)
            .invoke_async(&mut conn)
            .await?;
        if committed == 0 {
            return Err(Error::TransactionFailed(
                "the lock lease expired before commit",
            ));
        }

        Ok(result)
    }

    async fn changes(&self, room_id: &str) -> Result<BoxStream<'static, Result<Mutation>>> {
        let stream_key = changes_key(room_id);
        let mut conn = self.manager.clone();

        // Start from the current tail so reconnects can resume from a
        // concrete id instead of skipping to "whatever comes next".
        let tail: StreamRangeReply = conn.xrevrange_count(&stream_key, "+", "-", 1).await?;
        let mut last_id = tail
            .ids
            .first()
            .map_or_else(|| "0-0".to_owned(), |entry| entry.id.clone());

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let options = StreamReadOptions::default()
                .block(CHANGES_BLOCK.as_millis() as usize)
                .count(64);
            loop {
                if tx.is_closed() {
                    return;
                }
                let reply: Result<Option<StreamReadReply>, redis::RedisError> = conn
                    .xread_options(&[&stream_key], &[&last_id], &options)
                    .await;
                let reply = match reply {
                    Ok(reply) => reply,
                    Err(e) => {
                        // The connection manager reconnects on its own; keep
                        // the cursor and try again.
                        warn!(error = %e, "Change feed read failed, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let Some(reply) = reply else {
                    continue;
                };
                for key in reply.keys {
                    for entry in key.ids {
                        last_id = entry.id.clone();
                        let item = entry
                            .map
                            .get("mutation")
                            .ok_or_else(|| Error::bad_store("change feed entry has no payload"))
                            .and_then(|value| {
                                redis::from_redis_value::<String>(value).map_err(Error::from)
                            })
                            .and_then(|payload| {
                                serde_json::from_str::<Mutation>(&payload).map_err(Error::from)
                            });
                        let failed = item.is_err();
                        if tx.send(item).await.is_err() || failed {
                            return;
                        }
                    }
                }
            }
        });
        debug!(%room_id, "Tailing room change feed");
        Ok(ReceiverStream::new(rx).boxed())
    }
}
