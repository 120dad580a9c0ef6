//! In-memory backend for tests and single-process deployments. A shared
//! [`MemoryRoomStorage`] can back several stores to simulate several nodes.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tokio::{sync::broadcast, time::Instant};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use super::{Lease, MutateFn, Mutation, RoomStore};
use crate::{game::components::Entity, Error, Result};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

struct MemoryRoom {
    entities: Option<Vec<Entity>>,
    lock: Option<(String, Instant)>,
    changes: broadcast::Sender<Mutation>,
}

impl Default for MemoryRoom {
    fn default() -> Self {
        Self {
            entities: None,
            lock: None,
            changes: broadcast::channel(CHANGE_CHANNEL_CAPACITY).0,
        }
    }
}

#[derive(Default)]
pub struct MemoryRoomStorage {
    rooms: StdMutex<HashMap<String, MemoryRoom>>,
}

pub struct MemoryRoomStore {
    storage: Arc<MemoryRoomStorage>,
}

impl MemoryRoomStore {
    pub fn new(storage: Arc<MemoryRoomStorage>) -> Self {
        Self { storage }
    }

    fn release_if_held(&self, room_id: &str, lease: &Lease) {
        let mut rooms = self.storage.rooms.lock().unwrap();
        if let Some(room) = rooms.get_mut(room_id) {
            if room
                .lock
                .as_ref()
                .is_some_and(|(token, _)| token == lease.token())
            {
                room.lock = None;
            }
        }
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn read(&self, room_id: &str) -> Result<Option<Vec<Entity>>> {
        let rooms = self.storage.rooms.lock().unwrap();
        Ok(rooms.get(room_id).and_then(|room| room.entities.clone()))
    }

    fn room_ids(&self) -> futures_util::stream::BoxStream<'static, Result<String>> {
        let ids: Vec<String> = {
            let rooms = self.storage.rooms.lock().unwrap();
            rooms
                .iter()
                .filter(|(_, room)| room.entities.is_some())
                .map(|(id, _)| id.clone())
                .collect()
        };
        stream::iter(ids.into_iter().map(Ok)).boxed()
    }

    async fn apply_mutation(&self, room_id: &str, mutate: MutateFn) -> Result<Mutation> {
        let lease = Lease::begin();

        let current = {
            let mut rooms = self.storage.rooms.lock().unwrap();
            let room = rooms.entry(room_id.to_owned()).or_default();
            if room
                .lock
                .as_ref()
                .is_some_and(|(_, deadline)| Instant::now() <= *deadline)
            {
                return Err(Error::TransactionFailed(
                    "another writer holds the room lock",
                ));
            }
            room.lock = Some((lease.token().to_owned(), lease.deadline()));
            room.entities.clone()
        };

        let result = match mutate(current).await {
            Ok(result) => result,
            Err(e) => {
                self.release_if_held(room_id, &lease);
                return Err(e);
            }
        };

        let mut rooms = self.storage.rooms.lock().unwrap();
        let room = rooms
            .get_mut(room_id)
            .expect("room entry created at acquisition");
        let still_ours = room
            .lock
            .as_ref()
            .is_some_and(|(token, _)| token == lease.token());
        if !still_ours || lease.expired() {
            if still_ours {
                room.lock = None;
            }
            return Err(Error::TransactionFailed(
                "the lock lease expired before commit",
            ));
        }

        room.entities = Some(result.entities.clone());
        room.lock = None;
        let _ = room.changes.send(result.clone());
        Ok(result)
    }

    async fn changes(
        &self,
        room_id: &str,
    ) -> Result<futures_util::stream::BoxStream<'static, Result<Mutation>>> {
        let receiver = {
            let mut rooms = self.storage.rooms.lock().unwrap();
            rooms
                .entry(room_id.to_owned())
                .or_default()
                .changes
                .subscribe()
        };
        Ok(BroadcastStream::new(receiver)
            .map(|item| {
                item.map_err(|BroadcastStreamRecvError::Lagged(skipped)| {
                    Error::ChangeFeedLost(skipped)
                })
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;
    use tokio::sync::oneshot;

    use super::*;
    use crate::{
        api::protocol::Response,
        game::components::{Entity, Ping},
        store::{mutate_fn, LOCK_EXPIRATION},
    };

    fn ping(id: &str) -> Entity {
        Entity::Ping(Ping {
            id: id.to_owned(),
            x: 0,
            y: 0,
        })
    }

    fn mutate_to(entities: Vec<Entity>) -> MutateFn {
        mutate_fn(move |_| async move {
            Ok(Mutation {
                entities,
                responses: Vec::new(),
            })
        })
    }

    /// A mutate function that parks until the returned sender fires.
    fn mutate_when(entities: Vec<Entity>) -> (oneshot::Sender<()>, MutateFn) {
        let (tx, rx) = oneshot::channel();
        let mutate = mutate_fn(move |_| async move {
            let _ = rx.await;
            Ok(Mutation {
                entities,
                responses: Vec::new(),
            })
        });
        (tx, mutate)
    }

    #[tokio::test]
    async fn mutate_and_read() {
        let store = MemoryRoomStore::new(Arc::new(MemoryRoomStorage::default()));

        assert_eq!(store.read("room-id").await.unwrap(), None);

        let result = store
            .apply_mutation("room-id", mutate_to(vec![ping("p1")]))
            .await
            .unwrap();
        assert_eq!(result.entities, vec![ping("p1")]);
        assert_eq!(store.read("room-id").await.unwrap(), Some(vec![ping("p1")]));
    }

    #[tokio::test]
    async fn lists_written_rooms() {
        let store = MemoryRoomStore::new(Arc::new(MemoryRoomStorage::default()));
        store
            .apply_mutation("room-id-1", mutate_to(Vec::new()))
            .await
            .unwrap();
        store
            .apply_mutation("room-id-2", mutate_to(Vec::new()))
            .await
            .unwrap();

        let mut ids: Vec<String> = store
            .room_ids()
            .map(|id| id.unwrap())
            .collect::<Vec<_>>()
            .await;
        ids.sort();
        assert_eq!(ids, vec!["room-id-1", "room-id-2"]);
    }

    #[tokio::test]
    async fn concurrent_writers_fail_fast() {
        let storage = Arc::new(MemoryRoomStorage::default());
        let store_1 = MemoryRoomStore::new(Arc::clone(&storage));
        let store_2 = MemoryRoomStore::new(Arc::clone(&storage));

        let (finish, mutate) = mutate_when(vec![ping("p1")]);
        let first = tokio::spawn(async move { store_1.apply_mutation("room-id", mutate).await });
        tokio::task::yield_now().await;

        // The first writer holds the lock while parked in its mutate
        // function, so a second writer must fail without retrying.
        let second = store_2
            .apply_mutation("room-id", mutate_to(vec![ping("p2")]))
            .await;
        assert!(matches!(second, Err(Error::TransactionFailed(_))));

        finish.send(()).unwrap();
        first.await.unwrap().unwrap();
        assert_eq!(
            store_2.read("room-id").await.unwrap(),
            Some(vec![ping("p1")])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_mutations_lose_their_lease() {
        let store = Arc::new(MemoryRoomStore::new(Arc::new(MemoryRoomStorage::default())));

        let (finish, mutate) = mutate_when(vec![ping("p1")]);
        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.apply_mutation("room-id", mutate).await })
        };
        tokio::task::yield_now().await;

        tokio::time::advance(LOCK_EXPIRATION + Duration::from_secs(1)).await;
        finish.send(()).unwrap();

        let result = writer.await.unwrap();
        assert!(matches!(result, Err(Error::TransactionFailed(_))));
        // The failed mutation left no trace
        assert_eq!(store.read("room-id").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_locks_are_reclaimed() {
        let storage = Arc::new(MemoryRoomStorage::default());
        let store = MemoryRoomStore::new(Arc::clone(&storage));

        let (_parked_forever, mutate) = mutate_when(vec![ping("p1")]);
        let stalled = tokio::spawn({
            let store = MemoryRoomStore::new(Arc::clone(&storage));
            async move { store.apply_mutation("room-id", mutate).await }
        });
        tokio::task::yield_now().await;

        tokio::time::advance(LOCK_EXPIRATION + Duration::from_secs(1)).await;

        // The stalled writer's lease is gone, so a fresh writer gets in.
        let result = store
            .apply_mutation("room-id", mutate_to(vec![ping("p2")]))
            .await
            .unwrap();
        assert_eq!(result.entities, vec![ping("p2")]);
        stalled.abort();
    }

    #[tokio::test]
    async fn mutate_errors_release_the_lock() {
        let store = MemoryRoomStore::new(Arc::new(MemoryRoomStorage::default()));

        let failed = store
            .apply_mutation(
                "room-id",
                mutate_fn(|_| async { Err(Error::InvalidRequest("mutate failed")) }),
            )
            .await;
        assert!(matches!(failed, Err(Error::InvalidRequest(_))));

        // Lock is free again and nothing was written
        assert_eq!(store.read("room-id").await.unwrap(), None);
        store
            .apply_mutation("room-id", mutate_to(vec![ping("p1")]))
            .await
            .unwrap();
        assert_eq!(store.read("room-id").await.unwrap(), Some(vec![ping("p1")]));
    }

    #[tokio::test]
    async fn subscribers_see_every_commit_in_order() {
        let storage = Arc::new(MemoryRoomStorage::default());
        let store = MemoryRoomStore::new(Arc::clone(&storage));
        let peer = MemoryRoomStore::new(Arc::clone(&storage));

        let mut changes = peer.changes("room-id").await.unwrap();

        for id in ["p1", "p2", "p3"] {
            store
                .apply_mutation(
                    "room-id",
                    mutate_fn(move |current| async move {
                        let mut entities = current.unwrap_or_default();
                        entities.push(ping(id));
                        Ok(Mutation {
                            entities,
                            responses: vec![Response::State {
                                data: Vec::new(),
                                request_id: id.to_owned(),
                            }],
                        })
                    }),
                )
                .await
                .unwrap();
        }

        for expected in [1, 2, 3] {
            let mutation = changes.next().await.unwrap().unwrap();
            assert_eq!(mutation.entities.len(), expected);
        }
    }

    #[tokio::test]
    async fn failed_mutations_do_not_reach_the_feed() {
        let storage = Arc::new(MemoryRoomStorage::default());
        let store = MemoryRoomStore::new(Arc::clone(&storage));

        let mut changes = store.changes("room-id").await.unwrap();
        let _ = store
            .apply_mutation(
                "room-id",
                mutate_fn(|_| async { Err(Error::InvalidRequest("mutate failed")) }),
            )
            .await;
        store
            .apply_mutation("room-id", mutate_to(vec![ping("p1")]))
            .await
            .unwrap();

        let mutation = changes.next().await.unwrap().unwrap();
        assert_eq!(mutation.entities, vec![ping("p1")]);
    }
}
