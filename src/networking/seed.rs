use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use rand::seq::SliceRandom;

use crate::time::create_timestamp;

pub const DEFAULT_PORT: u16 = 41412;

pub const DEFAULT_SEEDS: [&str; 5] = [
    "node-0.cloudchainsinc.com",
    "node-1.cloudchainsinc.com",
    "node-2.cloudchainsinc.com",
    "node-3.cloudchainsinc.com",
    "node-4.cloudchainsinc.com",
];

/// A known remote node. Seeds outlive the connections made to them and carry
/// the failure history the reconnect scheduler works from.
#[derive(Debug)]
pub struct Seed {
    host: String,
    port: u16,
    fail_count: AtomicU32,
    last_fail: AtomicU64,
    active: AtomicBool,
}

impl Seed {
    pub fn new(host: &str, port: u16) -> Seed {
        Seed {
            host: host.to_string(),
            port,
            fail_count: AtomicU32::new(0),
            last_fail: AtomicU64::new(0),
            active: AtomicBool::new(false),
        }
    }

    /// Accepts `host` or `host:port`.
    pub fn parse(address: &str, default_port: u16) -> Seed {
        match address.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => Seed::new(host, port),
                Err(_) => Seed::new(address, default_port),
            },
            None => Seed::new(address, default_port),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn fail_count(&self) -> u32 {
        self.fail_count.load(Ordering::SeqCst)
    }

    pub fn last_fail(&self) -> u64 {
        self.last_fail.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        self.record_failure_at(create_timestamp());
    }

    pub fn record_failure_at(&self, timestamp: u64) {
        self.fail_count.fetch_add(1, Ordering::SeqCst);
        self.last_fail.store(timestamp, Ordering::SeqCst);
        self.set_active(false);
    }

    pub fn reset_counters(&self) {
        self.fail_count.store(0, Ordering::SeqCst);
        self.last_fail.store(0, Ordering::SeqCst);
    }

    /// Milliseconds since the last failure, measured from `now`.
    pub fn since_last_fail(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_fail())
    }
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Build the seed list, shuffled once so load spreads across nodes.
pub fn shuffled_seeds(addresses: &[String], default_port: u16) -> Vec<Seed> {
    let mut seeds: Vec<Seed> = addresses
        .iter()
        .map(|address| Seed::parse(address, default_port))
        .collect();
    seeds.shuffle(&mut rand::thread_rng());
    seeds
}

pub fn default_seed_addresses() -> Vec<String> {
    DEFAULT_SEEDS.iter().map(|host| host.to_string()).collect()
}
