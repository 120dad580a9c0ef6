//! One-shot migration of stored rooms from the legacy token shape to the
//! current one. Run it with the server stopped; it rewrites every room key
//! in place and skips rooms that are already current.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use futures_util::StreamExt;
use tokenboard::{migration, mutate_fn, Config, Mutation, RedisRoomStore, RoomStore};
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    let raw_config = Figment::new()
        .merge(
            Toml::file(
                Env::var("TOKENBOARD_CONFIG").unwrap_or_else(|| "tokenboard.toml".to_owned()),
            )
            .nested(),
        )
        .merge(Env::prefixed("TOKENBOARD_").global());

    let config = match raw_config.extract::<Config>() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("It looks like your config is invalid. The following error occurred: {e}");
            std::process::exit(1);
        }
    };

    let registry = tracing_subscriber::Registry::default();
    let filter_layer = EnvFilter::try_new(&config.log).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = registry
        .with(filter_layer)
        .with(tracing_subscriber::fmt::Layer::new());
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let Some(redis_url) = config.redis_url.as_deref() else {
        eprintln!("Migration only applies to the redis backend; set redis_url.");
        std::process::exit(1);
    };
    let client = redis::Client::open(redis_url).expect("redis_url should be a valid url");
    let manager = redis::aio::ConnectionManager::new(client)
        .await
        .expect("redis should be reachable");
    let store = RedisRoomStore::new(manager.clone());

    let mut migrated = 0usize;
    let mut room_ids = store.room_ids();
    while let Some(room_id) = room_ids.next().await {
        let room_id = match room_id {
            Ok(room_id) => room_id,
            Err(e) => {
                warn!(error = %e, "Failed to list rooms, aborting");
                std::process::exit(1);
            }
        };

        let mut conn = manager.clone();
        let raw: Option<String> = redis::AsyncCommands::get(&mut conn, format!("room:{room_id}"))
            .await
            .expect("redis should be reachable");
        let Some(raw) = raw else { continue };
        let value: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(%room_id, error = %e, "Skipping room with unparseable contents");
                continue;
            }
        };

        match migration::upgrade_room(&value) {
            Ok(Some(entities)) => {
                store
                    .apply_mutation(
                        &room_id,
                        mutate_fn(move |_| async move {
                            Ok(Mutation {
                                entities,
                                responses: Vec::new(),
                            })
                        }),
                    )
                    .await
                    .expect("migration write should succeed");
                migrated += 1;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(%room_id, error = %e, "Skipping room that matches neither shape");
            }
        }
    }

    info!("Migration finished, {migrated} rooms rewritten");
}
