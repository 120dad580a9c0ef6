//! Durable per-room entity storage with single-writer transactional
//! mutation and a change feed every node tails to converge its local room
//! copies.

pub mod memory;
pub mod migration;
#[cfg(feature = "backend_redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{future::BoxFuture, stream::BoxStream};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{api::protocol::Response, game::components::Entity, utils, Result};

/// How long a writer may hold a room's advisory lock. A mutation that is
/// still running when the lease runs out is aborted at commit.
pub const LOCK_EXPIRATION: Duration = Duration::from_secs(10);

/// One committed rewrite of a room: the new entity list plus the responses
/// the mutation produced. Committed mutations are exactly what the change
/// feed carries.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Mutation {
    pub entities: Vec<Entity>,
    pub responses: Vec<Response>,
}

/// Applied to the current entity list (None for a room never written) under
/// the room's lock. An error aborts the transaction without a write.
pub type MutateFn =
    Box<dyn FnOnce(Option<Vec<Entity>>) -> BoxFuture<'static, Result<Mutation>> + Send>;

/// Boxes an async closure into a [`MutateFn`].
pub fn mutate_fn<F, Fut>(f: F) -> MutateFn
where
    F: FnOnce(Option<Vec<Entity>>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<Mutation>> + Send + 'static,
{
    Box::new(move |entities| -> BoxFuture<'static, Result<Mutation>> { Box::pin(f(entities)) })
}

#[async_trait]
pub trait RoomStore: Send + Sync {
    /// The last committed entity list, or None if the room was never
    /// written. Reads are unsynchronized and may be stale; the change feed
    /// is the consistency backbone.
    async fn read(&self, room_id: &str) -> Result<Option<Vec<Entity>>>;

    /// Ids of every stored room. Lazy; restart the call to restart the
    /// listing.
    fn room_ids(&self) -> BoxStream<'static, Result<String>>;

    /// Runs `mutate` against the current entity list under the room's
    /// advisory lock and atomically persists + publishes the result.
    ///
    /// Fails with [`Error::TransactionFailed`](crate::Error) and writes
    /// nothing when another writer holds the lock or the lease expired
    /// before commit. Contention is not retried here; callers decide.
    async fn apply_mutation(&self, room_id: &str, mutate: MutateFn) -> Result<Mutation>;

    /// Every mutation committed for the room by any node, in commit order,
    /// starting from now or shortly before. The stream survives transient
    /// backend disconnects; unrecoverable loss surfaces as an error item.
    async fn changes(&self, room_id: &str) -> Result<BoxStream<'static, Result<Mutation>>>;
}

/// The lock half of the commit protocol, shared by every backend: a random
/// holder token plus the instant the lease runs out. Backends acquire with
/// the token, run the mutate function, and must verify `expired()` is false
/// (and the token still theirs) before committing.
pub(crate) struct Lease {
    token: String,
    deadline: Instant,
}

impl Lease {
    pub fn begin() -> Self {
        Self {
            token: utils::random_string(16),
            deadline: Instant::now() + LOCK_EXPIRATION,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn expired(&self) -> bool {
        Instant::now() > self.deadline
    }
}
