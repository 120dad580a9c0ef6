pub mod api;
mod config;
mod service;
mod store;
mod utils;

// Not async due to services() being used in many closures, and async closures are not stable
// as of writing
use std::sync::RwLock;

pub use config::Config;
pub use service::{game, globals, rate_limiting, Services};
pub use store::{
    memory::{MemoryRoomStorage, MemoryRoomStore},
    migration, mutate_fn, Mutation, RoomStore, LOCK_EXPIRATION,
};
pub use utils::error::{Error, Result};

#[cfg(feature = "backend_redis")]
pub use store::redis::RedisRoomStore;

pub static SERVICES: RwLock<Option<&'static Services>> = RwLock::new(None);

pub fn services() -> &'static Services {
    SERVICES
        .read()
        .unwrap()
        .expect("SERVICES should be initialized when this is called")
}
