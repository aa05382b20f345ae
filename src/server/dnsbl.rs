//! DNS blocklist checks for connected addresses
//!
//! Lookups run off the tick thread and report back over a channel; the
//! server polls each pending lookup once per loop iteration.

use std::net::Ipv4Addr;

use crossbeam_channel::{bounded, Receiver, TryRecvError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsblState {
    None,
    Pending,
    Blacklisted,
    Whitelisted,
}

impl DnsblState {
    pub fn name(&self) -> &'static str {
        match self {
            DnsblState::None => "none",
            DnsblState::Pending => "pending",
            DnsblState::Blacklisted => "black",
            DnsblState::Whitelisted => "white",
        }
    }
}

/// Handle to an in-flight lookup
#[derive(Debug)]
pub struct DnsblLookup {
    result: Receiver<bool>,
}

impl DnsblLookup {
    /// Lookup whose result is already known
    pub fn ready(listed: bool) -> Self {
        let (tx, rx) = bounded(1);
        let _ = tx.send(listed);
        Self { result: rx }
    }

    /// A lookup and the sender that completes it
    pub fn channel() -> (crossbeam_channel::Sender<bool>, Self) {
        let (tx, rx) = bounded(1);
        (tx, Self { result: rx })
    }

    /// `Some(true)` if the address is listed, `None` while still running.
    /// A lookup that died without answering counts as not listed.
    pub fn poll(&self) -> Option<bool> {
        match self.result.try_recv() {
            Ok(listed) => Some(listed),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(false),
        }
    }
}

pub trait DnsblResolver: Send {
    fn lookup(&self, ip: Ipv4Addr) -> DnsblLookup;
}

/// Query name for `ip`: reversed octets under the blocklist zone, prefixed
/// by the access key when one is configured.
pub fn query_name(ip: Ipv4Addr, zone: &str, key: Option<&str>) -> String {
    let [a, b, c, d] = ip.octets();
    match key {
        Some(key) if !key.is_empty() => format!("{}.{}.{}.{}.{}.{}", key, d, c, b, a, zone),
        _ => format!("{}.{}.{}.{}.{}", d, c, b, a, zone),
    }
}

/// Resolves query names with the system resolver on a short-lived thread
#[cfg(feature = "dnsbl")]
#[derive(Debug, Clone)]
pub struct HostLookupResolver {
    zone: String,
    key: Option<String>,
}

#[cfg(feature = "dnsbl")]
impl HostLookupResolver {
    pub fn new(zone: impl Into<String>, key: Option<String>) -> Self {
        Self {
            zone: zone.into(),
            key,
        }
    }
}

#[cfg(feature = "dnsbl")]
impl DnsblResolver for HostLookupResolver {
    fn lookup(&self, ip: Ipv4Addr) -> DnsblLookup {
        use std::net::ToSocketAddrs;

        let query = query_name(ip, &self.zone, self.key.as_deref());
        let (tx, lookup) = DnsblLookup::channel();
        let spawned = std::thread::Builder::new()
            .name("dnsbl".into())
            .spawn(move || {
                let listed = (query.as_str(), 0)
                    .to_socket_addrs()
                    .map(|mut addrs| addrs.next().is_some())
                    .unwrap_or(false);
                let _ = tx.send(listed);
            });
        if let Err(e) = spawned {
            tracing::warn!("failed to start dnsbl lookup: {}", e);
        }
        lookup
    }
}
