//! Cross-node connection and room-creation limits. Every increment is
//! tagged with the incrementing server's id; totals only count servers
//! still present in the TTL'd liveness set, so counters stranded by a dead
//! node read as zero instead of leaking capacity forever.

use std::{
    collections::HashMap,
    fmt,
    net::IpAddr,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{Config, Error, Result};

#[cfg(feature = "backend_redis")]
mod redis;
#[cfg(feature = "backend_redis")]
pub use self::redis::RedisRateLimiter;

/// TTL on a server's liveness entry. The connection manager refreshes at a
/// third of this, with jitter, so only a dead node ever expires.
pub const SERVER_LIVENESS_EXPIRATION: Duration = Duration::from_secs(600);

/// How long a rooms-created counter lives after its first increment.
pub const ROOMS_CREATED_EXPIRATION: Duration = Duration::from_secs(60 * 60 * 24);

#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub max_users_per_room: u32,
    pub max_connections_per_ip: u32,
    pub max_rooms_per_day: u32,
}

impl Limits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_users_per_room: config.max_users_per_room,
            max_connections_per_ip: config.max_connections_per_ip,
            max_rooms_per_day: config.max_rooms_per_day,
        }
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Counts a room creation against the address, failing with
    /// `TooManyRoomsCreated` over the daily cap.
    async fn acquire_new_room(&self, ip: IpAddr) -> Result<()>;

    /// Reserves one connection slot for the address and one for the room,
    /// or fails with `TooManyConnections` / `RoomFull`. Dropping the guard
    /// releases both slots on every exit path.
    async fn acquire_connection(&self, ip: IpAddr, room_id: &str) -> Result<ConnectionGuard>;

    /// Marks this server and its connected addresses as alive for another
    /// `SERVER_LIVENESS_EXPIRATION`.
    async fn refresh_server_liveness(&self, ips: &[IpAddr]) -> Result<()>;
}

/// Releases the reserved connection slots when dropped.
pub struct ConnectionGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ConnectionGuard {
    pub(crate) fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGuard").finish_non_exhaustive()
    }
}

#[derive(Default)]
struct StorageInner {
    /// server id -> liveness deadline
    liveness: HashMap<String, Instant>,
    /// ip -> server id -> live connection count
    connections: HashMap<IpAddr, HashMap<String, u32>>,
    /// room id -> server id -> live connection count
    occupancy: HashMap<String, HashMap<String, u32>>,
    /// ip -> (rooms created, counter expiry)
    rooms_created: HashMap<IpAddr, (u32, Instant)>,
}

/// Shared by every [`MemoryRateLimiter`] of one simulated cluster.
#[derive(Default)]
pub struct MemoryRateLimiterStorage {
    inner: StdMutex<StorageInner>,
}

fn live_total(counts: Option<&HashMap<String, u32>>, liveness: &HashMap<String, Instant>) -> u32 {
    let now = Instant::now();
    counts.map_or(0, |counts| {
        counts
            .iter()
            .filter(|(server_id, _)| liveness.get(*server_id).is_some_and(|expiry| *expiry > now))
            .map(|(_, count)| count)
            .sum()
    })
}

fn decrement<K: std::hash::Hash + Eq>(
    counts: &mut HashMap<K, HashMap<String, u32>>,
    key: &K,
    server_id: &str,
) {
    if let Some(per_server) = counts.get_mut(key) {
        if let Some(count) = per_server.get_mut(server_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_server.remove(server_id);
            }
        }
        if per_server.is_empty() {
            counts.remove(key);
        }
    }
}

pub struct MemoryRateLimiter {
    server_id: String,
    limits: Limits,
    storage: Arc<MemoryRateLimiterStorage>,
}

impl MemoryRateLimiter {
    pub fn new(server_id: &str, limits: Limits, storage: Arc<MemoryRateLimiterStorage>) -> Self {
        // Count ourselves as alive right away; the refresh loop extends it.
        storage.inner.lock().unwrap().liveness.insert(
            server_id.to_owned(),
            Instant::now() + SERVER_LIVENESS_EXPIRATION,
        );
        Self {
            server_id: server_id.to_owned(),
            limits,
            storage,
        }
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn acquire_new_room(&self, ip: IpAddr) -> Result<()> {
        let mut inner = self.storage.inner.lock().unwrap();
        let now = Instant::now();
        match inner.rooms_created.get_mut(&ip) {
            Some((count, expiry)) if *expiry > now => {
                if *count >= self.limits.max_rooms_per_day {
                    return Err(Error::TooManyRoomsCreated);
                }
                *count += 1;
            }
            _ => {
                inner
                    .rooms_created
                    .insert(ip, (1, now + ROOMS_CREATED_EXPIRATION));
            }
        }
        Ok(())
    }

    async fn acquire_connection(&self, ip: IpAddr, room_id: &str) -> Result<ConnectionGuard> {
        let mut inner = self.storage.inner.lock().unwrap();
        let inner = &mut *inner;

        if live_total(inner.connections.get(&ip), &inner.liveness)
            >= self.limits.max_connections_per_ip
        {
            return Err(Error::TooManyConnections);
        }
        if live_total(inner.occupancy.get(room_id), &inner.liveness)
            >= self.limits.max_users_per_room
        {
            return Err(Error::RoomFull);
        }

        *inner
            .connections
            .entry(ip)
            .or_default()
            .entry(self.server_id.clone())
            .or_insert(0) += 1;
        *inner
            .occupancy
            .entry(room_id.to_owned())
            .or_default()
            .entry(self.server_id.clone())
            .or_insert(0) += 1;

        let storage = Arc::clone(&self.storage);
        let server_id = self.server_id.clone();
        let room_id = room_id.to_owned();
        Ok(ConnectionGuard::new(move || {
            let mut inner = storage.inner.lock().unwrap();
            let inner = &mut *inner;
            decrement(&mut inner.connections, &ip, &server_id);
            decrement(&mut inner.occupancy, &room_id, &server_id);
        }))
    }

    async fn refresh_server_liveness(&self, _ips: &[IpAddr]) -> Result<()> {
        self.storage.inner.lock().unwrap().liveness.insert(
            self.server_id.clone(),
            Instant::now() + SERVER_LIVENESS_EXPIRATION,
        );
        Ok(())
    }
}
