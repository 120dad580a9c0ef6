use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex as StdMutex,
    },
};

use crate::{utils, Config, Result};

pub struct Service {
    pub config: Config,
    server_id: String,
    /// Addresses with at least one open connection on this node, reported
    /// to the rate limiter's liveness refresh.
    connected: StdMutex<HashMap<IpAddr, usize>>,

    pub shutdown: AtomicBool,
}

impl Service {
    pub fn load(config: Config) -> Result<Self> {
        Ok(Self {
            config,
            server_id: utils::random_string(16),
            connected: StdMutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// This node's identity in the cross-node rate-limit counters. Fresh on
    /// every boot; counters tied to previous incarnations expire with their
    /// liveness keys.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn register_client(&self, ip: IpAddr) {
        *self.connected.lock().unwrap().entry(ip).or_insert(0) += 1;
    }

    pub fn unregister_client(&self, ip: IpAddr) {
        let mut connected = self.connected.lock().unwrap();
        if let Some(count) = connected.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                connected.remove(&ip);
            }
        }
    }

    pub fn connected_ips(&self) -> Vec<IpAddr> {
        self.connected.lock().unwrap().keys().copied().collect()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
