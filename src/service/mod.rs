use std::sync::Arc;

use crate::{Config, Error, Result};

pub mod game;
pub mod globals;
pub mod rate_limiting;

use rate_limiting::{Limits, MemoryRateLimiter, MemoryRateLimiterStorage, RateLimiter};

use crate::store::{
    memory::{MemoryRoomStorage, MemoryRoomStore},
    RoomStore,
};

pub struct Services {
    pub globals: globals::Service,
    pub rate_limiting: Arc<dyn RateLimiter>,
    pub game: Arc<game::Service>,
}

impl Services {
    /// Builds every service on top of the storage backend the config picks.
    pub async fn build(config: Config) -> Result<Self> {
        let globals = globals::Service::load(config)?;
        let limits = Limits::from_config(&globals.config);

        let (room_store, rate_limiting): (Arc<dyn RoomStore>, Arc<dyn RateLimiter>) =
            match &*globals.config.storage_backend {
                "memory" => (
                    Arc::new(MemoryRoomStore::new(Arc::new(MemoryRoomStorage::default()))),
                    Arc::new(MemoryRateLimiter::new(
                        globals.server_id(),
                        limits,
                        Arc::new(MemoryRateLimiterStorage::default()),
                    )),
                ),
                #[cfg(feature = "backend_redis")]
                "redis" => {
                    let url = globals
                        .config
                        .redis_url
                        .as_deref()
                        .ok_or(Error::BadConfig("The redis backend needs a redis_url."))?;
                    let client = redis::Client::open(url)
                        .map_err(|_| Error::BadConfig("The redis_url is not valid."))?;
                    let manager = redis::aio::ConnectionManager::new(client).await?;
                    (
                        Arc::new(crate::store::redis::RedisRoomStore::new(manager.clone())),
                        Arc::new(rate_limiting::RedisRateLimiter::new(
                            globals.server_id(),
                            limits,
                            manager,
                        )),
                    )
                }
                _ => {
                    return Err(Error::BadConfig("Storage backend not found."));
                }
            };

        Ok(Self {
            game: game::Service::build(room_store, Arc::clone(&rate_limiting)),
            rate_limiting,
            globals,
        })
    }
}
