use std::{
    collections::BTreeMap,
    fmt,
    net::{IpAddr, Ipv4Addr},
};

use serde::{de::IgnoredAny, Deserialize};
use tracing::warn;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_address")]
    pub address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    pub tls: Option<TlsConfig>,

    #[serde(default = "default_storage_backend")]
    pub storage_backend: String,
    /// Connection string for the redis backend, e.g. `redis://127.0.0.1/`.
    pub redis_url: Option<String>,

    #[serde(default = "default_max_users_per_room")]
    pub max_users_per_room: u32,
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: u32,
    #[serde(default = "default_max_rooms_per_day")]
    pub max_rooms_per_day: u32,

    #[serde(default = "default_log")]
    pub log: String,

    #[serde(flatten)]
    pub catchall: BTreeMap<String, IgnoredAny>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TlsConfig {
    pub certs: String,
    pub key: String,
}

const DEPRECATED_KEYS: &[&str] = &["room_store_dir"];

impl Config {
    pub fn warn_deprecated(&self) {
        let mut was_deprecated = false;
        for key in self
            .catchall
            .keys()
            .filter(|key| DEPRECATED_KEYS.iter().any(|s| s == key))
        {
            warn!("Config parameter {} is deprecated", key);
            was_deprecated = true;
        }

        if was_deprecated {
            warn!("Check your configuration if any new configuration parameters should be adjusted");
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redis_url_status: String = match self.redis_url {
            Some(_) => "set".to_owned(),
            None => "not set".to_owned(),
        };
        let lines = [
            ("Address", &self.address.to_string()),
            ("Port", &self.port.to_string()),
            ("Storage backend", &self.storage_backend),
            ("Redis URL", &redis_url_status),
            (
                "Maximum users per room",
                &self.max_users_per_room.to_string(),
            ),
            (
                "Maximum connections per address",
                &self.max_connections_per_ip.to_string(),
            ),
            (
                "Maximum rooms created per day",
                &self.max_rooms_per_day.to_string(),
            ),
        ];

        let mut msg: String = "Active config values:\n\n".to_owned();

        for line in lines.into_iter().enumerate() {
            msg += &format!("{}: {}\n", line.1 .0, line.1 .1);
        }

        write!(f, "{msg}")
    }
}

fn default_address() -> IpAddr {
    Ipv4Addr::LOCALHOST.into()
}

fn default_port() -> u16 {
    8000
}

fn default_storage_backend() -> String {
    "memory".to_owned()
}

fn default_max_users_per_room() -> u32 {
    20
}

fn default_max_connections_per_ip() -> u32 {
    6
}

fn default_max_rooms_per_day() -> u32 {
    25
}

fn default_log() -> String {
    "info,tower_http=warn".to_owned()
}
