use std::{io, net::SocketAddr, time::Duration};

use axum::{
    extract::MatchedPath,
    routing::get,
    Router,
};
use axum_server::{bind, bind_rustls, tls_rustls::RustlsConfig, Handle as ServerHandle};
use clap::Parser;
use figment::{
    providers::{Env, Format, Toml},
    value::Uncased,
    Figment,
};
use tokio::signal;
use tokenboard::api::ws;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

pub use tokenboard::*; // Re-export everything from the library crate

#[cfg(all(not(target_env = "msvc"), feature = "jemalloc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(all(not(target_env = "msvc"), feature = "jemalloc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

static SUB_TABLES: [&str; 1] = ["tls"]; // Tables whose keys arrive flattened through env vars

/// Command line arguments. Everything is configured through the config
/// file and `TOKENBOARD_*` environment variables, so only the version
/// surface lives here.
#[derive(Parser)]
#[clap(about, version)]
struct Args {}

#[tokio::main]
async fn main() {
    Args::parse();

    // Initialize config
    let raw_config = Figment::new()
        .merge(
            Toml::file(
                Env::var("TOKENBOARD_CONFIG").unwrap_or_else(|| "tokenboard.toml".to_owned()),
            )
            .nested(),
        )
        .merge(Env::prefixed("TOKENBOARD_").global().map(|k| {
            let mut key: Uncased = k.into();

            for table in SUB_TABLES {
                if k.starts_with(&(table.to_owned() + "_")) {
                    key = Uncased::from(
                        table.to_owned() + "." + k[table.len() + 1..k.len()].as_str(),
                    );
                    break;
                }
            }

            key
        }));

    let config = match raw_config.extract::<Config>() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("It looks like your config is invalid. The following error occurred: {e}");
            std::process::exit(1);
        }
    };

    config.warn_deprecated();

    let registry = tracing_subscriber::Registry::default();
    let fmt_layer = tracing_subscriber::fmt::Layer::new();
    let filter_layer = match EnvFilter::try_new(&config.log) {
        Ok(s) => s,
        Err(e) => {
            eprintln!(
                "It looks like your log config is invalid. The following error occurred: {e}"
            );
            EnvFilter::try_new("warn").unwrap()
        }
    };

    let subscriber = registry.with(filter_layer).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).unwrap();

    // The soft fd limit is usually 1024, which a busy node with one socket
    // per client can exhaust.
    #[cfg(unix)]
    maximize_fd_limit().expect("should be able to increase the soft limit to the hard limit");

    info!("Connecting to the room store");
    let services_raw = match Services::build(config).await {
        Ok(services) => Box::new(services),
        Err(error) => {
            error!(%error, "The room store couldn't be reached");
            std::process::exit(1);
        }
    };

    *SERVICES.write().unwrap() = Some(Box::leak(services_raw));

    info!("Starting server");
    run_server().await.unwrap();
}

async fn run_server() -> io::Result<()> {
    let config = &services().globals.config;
    let addr = SocketAddr::from((config.address, config.port));

    let middlewares = ServiceBuilder::new().layer(
        TraceLayer::new_for_http().make_span_with(|request: &http::Request<_>| {
            let path = if let Some(path) = request.extensions().get::<MatchedPath>() {
                path.as_str()
            } else {
                request.uri().path()
            };

            tracing::info_span!("ws_connection", %path)
        }),
    );

    let app = routes()
        .layer(middlewares)
        .into_make_service_with_connect_info::<SocketAddr>();
    let handle = ServerHandle::new();

    tokio::spawn(shutdown_signal(handle.clone()));
    tokio::spawn(ws::maintain_liveness());

    match &config.tls {
        Some(tls) => {
            let conf = RustlsConfig::from_pem_file(&tls.certs, &tls.key).await?;
            let server = bind_rustls(addr, conf).handle(handle).serve(app);

            #[cfg(feature = "systemd")]
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

            server.await?
        }
        None => {
            let server = bind(addr).handle(handle).serve(app);

            #[cfg(feature = "systemd")]
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

            server.await?
        }
    }

    Ok(())
}

fn routes() -> Router {
    Router::new().route("/:room_id", get(ws::ws_handler))
}

async fn shutdown_signal(handle: ServerHandle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let sig: &str;

    tokio::select! {
        _ = ctrl_c => { sig = "Ctrl+C"; },
        _ = terminate => { sig = "SIGTERM"; },
    }

    warn!("Received {}, shutting down...", sig);
    handle.graceful_shutdown(Some(Duration::from_secs(30)));

    services().globals.shutdown();

    #[cfg(feature = "systemd")]
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
}

#[cfg(unix)]
fn maximize_fd_limit() -> Result<(), nix::errno::Errno> {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    let res = Resource::RLIMIT_NOFILE;

    let (soft_limit, hard_limit) = getrlimit(res)?;

    debug!("Current nofile soft limit: {soft_limit}");

    setrlimit(res, hard_limit, hard_limit)?;

    debug!("Increased nofile soft limit to {hard_limit}");

    Ok(())
}
