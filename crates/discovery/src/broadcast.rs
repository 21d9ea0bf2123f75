//! LAN discovery over UDP multicast.
//!
//! Every participant joins one multicast group. A service that has set a
//! local record announces it on a fixed interval and answers queries for its
//! name; everyone caches what they hear. Looking a name up returns a fresh
//! cache entry or sends a query and waits for the answer.
//!
//! Messages are JSON:
//!
//! ```json
//! {"type": "announce", "service": {"name": "billing-api", "host": "10.0.0.4", "port": 8081}, "timestamp": "2026-01-01T00:00:00Z"}
//! ```

use crate::resolver::Resolver;
use async_trait::async_trait;
use common::{Error, Result};
use dashmap::DashMap;
use registry::{Protocol, ServiceRecord};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol as IpProtocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Multicast group used unless configured otherwise
pub const DEFAULT_MULTICAST_GROUP: &str = "239.255.0.1:7001";

/// Announcements missed before a cached entry expires
const EXPIRY_INTERVALS: u32 = 3;

const MAX_DATAGRAM: usize = 65_536;

/// Broadcast discovery configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Group every message is sent to. A unicast address turns the service
    /// into a point-to-point peer, which is handy on networks without
    /// multicast routing.
    pub group: SocketAddr,

    /// Local address to listen on; its port normally matches the group's
    pub bind: SocketAddr,

    /// Interval between announcements of the local service
    #[serde(with = "humantime_serde")]
    pub announce_interval: Duration,

    /// How long a lookup waits for a response to its query
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,

    /// Multicast hop limit; 1 keeps traffic on the local segment
    pub multicast_ttl: u32,

    /// Messages stamped earlier than this are ignored
    #[serde(with = "humantime_serde")]
    pub max_message_age: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            group: SocketAddr::from(([239, 255, 0, 1], 7001)),
            bind: SocketAddr::from(([0, 0, 0, 0], 7001)),
            announce_interval: Duration::from_secs(5),
            query_timeout: Duration::from_secs(3),
            multicast_ttl: 2,
            max_message_age: Duration::from_secs(60),
        }
    }
}

impl BroadcastConfig {
    /// Age after which a cached entry is dropped
    pub fn expiry(&self) -> Duration {
        self.announce_interval * EXPIRY_INTERVALS
    }

    pub fn validate(&self) -> Result<()> {
        if self.announce_interval.is_zero() {
            return Err(Error::config("broadcast announce_interval must be non-zero"));
        }
        if self.query_timeout.is_zero() {
            return Err(Error::config("broadcast query_timeout must be non-zero"));
        }
        if self.multicast_ttl == 0 || self.multicast_ttl > 255 {
            return Err(Error::config("broadcast multicast_ttl must be 1-255"));
        }
        if self.group.port() == 0 {
            return Err(Error::config("broadcast group needs a port"));
        }
        Ok(())
    }
}

/// Message type on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Periodic advertisement of a local service
    Announce,
    /// Request for the named service to announce itself
    Query,
    /// Answer to a query
    Response,
}

/// Service description carried by a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub name: String,

    /// Empty or unspecified hosts are replaced by the sender's address
    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Announcement {
    pub fn to_record(&self) -> ServiceRecord {
        let mut record = ServiceRecord::new(self.name.clone(), self.host.clone(), self.port)
            .with_protocol(self.protocol)
            .with_version(self.version.clone());
        record.metadata = self.metadata.clone();
        record
    }
}

impl From<&ServiceRecord> for Announcement {
    fn from(record: &ServiceRecord) -> Self {
        Self {
            name: record.name.clone(),
            host: record.host.clone(),
            port: record.port,
            protocol: record.protocol,
            version: record.version.clone(),
            metadata: record.metadata.clone(),
        }
    }
}

/// One datagram
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,

    pub service: Announcement,

    #[serde(with = "humantime_serde")]
    pub timestamp: SystemTime,
}

impl BroadcastMessage {
    pub fn new(kind: MessageKind, service: Announcement) -> Self {
        Self {
            kind,
            service,
            timestamp: SystemTime::now(),
        }
    }

    /// Query for `name`
    pub fn query(name: &str) -> Self {
        Self::new(
            MessageKind::Query,
            Announcement {
                name: name.to_string(),
                host: String::new(),
                port: 0,
                protocol: Protocol::default(),
                version: String::new(),
                metadata: HashMap::new(),
            },
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::InvalidMessage(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::InvalidMessage(e.to_string()))
    }

    /// True when the timestamp is older than `max_age`; future stamps are accepted
    pub fn is_stale(&self, max_age: Duration) -> bool {
        SystemTime::now()
            .duration_since(self.timestamp)
            .is_ok_and(|age| age > max_age)
    }
}

#[derive(Debug, Clone)]
struct Heard {
    service: Announcement,
    seen_at: Instant,
}

struct Running {
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// UDP multicast announcer, responder and cache
pub struct BroadcastService {
    config: BroadcastConfig,
    local: RwLock<Option<Announcement>>,
    heard: DashMap<String, Heard>,
    arrivals: Notify,
    running: Mutex<Option<Running>>,
}

impl BroadcastService {
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            config,
            local: RwLock::new(None),
            heard: DashMap::new(),
            arrivals: Notify::new(),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    /// Join the group and start the listener and announcer tasks
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.config.validate()?;

        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::AlreadyRunning("broadcast discovery"));
        }

        let socket = Arc::new(UdpSocket::from_std(bind_socket(&self.config)?)?);
        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(Self::listen_loop(
                Arc::downgrade(self),
                socket.clone(),
                cancel.clone(),
            )),
            tokio::spawn(Self::announce_loop(Arc::downgrade(self), cancel.clone())),
        ];

        info!(
            group = %self.config.group,
            bind = %socket.local_addr()?,
            "Broadcast discovery started"
        );
        *running = Some(Running {
            socket,
            cancel,
            tasks,
        });
        Ok(())
    }

    /// Leave the group and wait for the background tasks to end
    pub async fn stop(&self) -> Result<()> {
        let running = self
            .running
            .lock()
            .await
            .take()
            .ok_or(Error::NotRunning("broadcast discovery"))?;

        running.cancel.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Broadcast task ended abnormally");
            }
        }
        info!("Broadcast discovery stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Address the socket is bound to, while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let running = self.running.lock().await;
        running.as_ref().and_then(|r| r.socket.local_addr().ok())
    }

    /// Announce `record` from now on and answer queries for its name.
    /// When running, the first announcement goes out immediately.
    pub async fn set_local_service(&self, record: &ServiceRecord) -> Result<()> {
        let announcement = Announcement::from(record);
        *self.local.write().await = Some(announcement.clone());
        debug!(service = %announcement.name, "Broadcast local service set");

        if self.is_running().await {
            self.send(&BroadcastMessage::new(MessageKind::Announce, announcement))
                .await?;
        }
        Ok(())
    }

    pub async fn clear_local_service(&self) {
        *self.local.write().await = None;
    }

    /// Fresh cache entry for `name`, else query the group and wait up to
    /// `query_timeout` for an answer
    pub async fn discover(&self, name: &str) -> Result<ServiceRecord> {
        if let Some(found) = self.lookup(name) {
            return Ok(found);
        }
        if !self.is_running().await {
            return Err(Error::NotRunning("broadcast discovery"));
        }

        let deadline = Instant::now() + self.config.query_timeout;
        self.send(&BroadcastMessage::query(name)).await?;

        loop {
            // Created before the check so an arrival in between is not missed
            let arrival = self.arrivals.notified();
            if let Some(found) = self.lookup(name) {
                return Ok(found);
            }
            if timeout_at(deadline, arrival).await.is_err() {
                debug!(service = name, "No broadcast answer before query timeout");
                return Err(Error::service_not_found(name));
            }
        }
    }

    /// Fresh cached services, sorted by name
    pub fn list(&self) -> Vec<Announcement> {
        let expiry = self.config.expiry();
        let mut services: Vec<Announcement> = self
            .heard
            .iter()
            .filter(|entry| entry.seen_at.elapsed() <= expiry)
            .map(|entry| entry.service.clone())
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    /// Drop cache entries not heard from for three announce intervals
    pub fn clean_expired(&self) -> usize {
        let expiry = self.config.expiry();
        let before = self.heard.len();
        self.heard.retain(|_, heard| heard.seen_at.elapsed() <= expiry);
        let dropped = before - self.heard.len();
        if dropped > 0 {
            debug!(dropped, "Expired broadcast cache entries");
        }
        dropped
    }

    /// Apply one received datagram
    pub async fn handle_message(&self, message: BroadcastMessage, from: SocketAddr) {
        if message.is_stale(self.config.max_message_age) {
            debug!(from = %from, service = %message.service.name, "Ignoring stale broadcast message");
            return;
        }

        match message.kind {
            MessageKind::Announce | MessageKind::Response => {
                let mut service = message.service;
                if service.host.is_empty() || service.host == "0.0.0.0" || service.host == "::" {
                    service.host = from.ip().to_string();
                }
                debug!(service = %service.name, from = %from, kind = ?message.kind, "Heard service");
                self.heard.insert(
                    service.name.clone(),
                    Heard {
                        service,
                        seen_at: Instant::now(),
                    },
                );
                self.arrivals.notify_waiters();
            }
            MessageKind::Query => {
                let local = self.local.read().await.clone();
                if let Some(local) = local.filter(|local| local.name == message.service.name) {
                    debug!(service = %local.name, from = %from, "Answering broadcast query");
                    let response = BroadcastMessage::new(MessageKind::Response, local);
                    if let Err(e) = self.send(&response).await {
                        warn!(error = %e, "Failed to answer broadcast query");
                    }
                }
            }
        }
    }

    fn lookup(&self, name: &str) -> Option<ServiceRecord> {
        self.heard
            .get(name)
            .filter(|heard| heard.seen_at.elapsed() <= self.config.expiry())
            .map(|heard| heard.service.to_record())
    }

    async fn send(&self, message: &BroadcastMessage) -> Result<()> {
        let socket = match self.running.lock().await.as_ref() {
            Some(running) => running.socket.clone(),
            None => return Err(Error::NotRunning("broadcast discovery")),
        };
        let bytes = message.encode()?;
        socket.send_to(&bytes, self.config.group).await?;
        Ok(())
    }

    async fn listen_loop(service: Weak<Self>, socket: Arc<UdpSocket>, cancel: CancellationToken) {
        let mut buffer = vec![0u8; MAX_DATAGRAM];

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buffer) => received,
            };

            let (len, from) = match received {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "Broadcast receive failed");
                    continue;
                }
            };
            let Some(service) = service.upgrade() else {
                break;
            };

            match BroadcastMessage::decode(&buffer[..len]) {
                Ok(message) => service.handle_message(message, from).await,
                Err(e) => debug!(from = %from, error = %e, "Skipping malformed datagram"),
            }
        }
    }

    async fn announce_loop(service: Weak<Self>, cancel: CancellationToken) {
        let period = match service.upgrade() {
            Some(service) => service.config.announce_interval,
            None => return,
        };
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(service) = service.upgrade() else {
                        break;
                    };
                    service.clean_expired();

                    let local = service.local.read().await.clone();
                    if let Some(local) = local {
                        let announce = BroadcastMessage::new(MessageKind::Announce, local);
                        if let Err(e) = service.send(&announce).await {
                            warn!(error = %e, "Broadcast announcement failed");
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Resolver for BroadcastService {
    async fn resolve(&self, name: &str) -> Result<(String, u16)> {
        let record = self.discover(name).await?;
        Ok((record.host, record.port))
    }
}

/// UDP socket bound with address reuse, joined to the group when it is a
/// multicast address
fn bind_socket(config: &BroadcastConfig) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(
        Domain::for_address(config.bind),
        Type::DGRAM,
        Some(IpProtocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&config.bind.into())?;

    match config.group.ip() {
        IpAddr::V4(group) if group.is_multicast() => {
            let interface = match config.bind.ip() {
                IpAddr::V4(ip) => ip,
                IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            };
            socket.join_multicast_v4(&group, &interface)?;
            socket.set_multicast_ttl_v4(config.multicast_ttl)?;
            socket.set_multicast_loop_v4(true)?;
        }
        IpAddr::V6(group) if group.is_multicast() => {
            socket.join_multicast_v6(&group, 0)?;
            socket.set_multicast_hops_v6(config.multicast_ttl)?;
            socket.set_multicast_loop_v6(true)?;
        }
        _ => {}
    }

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_format() {
        let message = BroadcastMessage::query("billing-api");
        let json: serde_json::Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "query");
        assert_eq!(json["service"]["name"], "billing-api");

        let decoded = BroadcastMessage::decode(
            br#"{"type":"announce","service":{"name":"db","host":"10.0.0.9","port":5433},"timestamp":"2030-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(decoded.kind, MessageKind::Announce);
        assert_eq!(decoded.service.port, 5433);
        assert_eq!(decoded.service.protocol, Protocol::Tcp);
        assert!(!decoded.is_stale(Duration::from_secs(60)));

        assert!(matches!(
            BroadcastMessage::decode(b"not json"),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_stale_message() {
        let mut message = BroadcastMessage::query("x");
        message.timestamp = SystemTime::now() - Duration::from_secs(120);
        assert!(message.is_stale(Duration::from_secs(60)));
    }

    #[test]
    fn test_config_validation() {
        assert!(BroadcastConfig::default().validate().is_ok());
        assert_eq!(BroadcastConfig::default().expiry(), Duration::from_secs(15));

        let config = BroadcastConfig {
            multicast_ttl: 0,
            ..BroadcastConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_announcements_fill_and_expire_cache() {
        let service = BroadcastService::new(BroadcastConfig {
            announce_interval: Duration::from_millis(100),
            ..BroadcastConfig::default()
        });
        let from: SocketAddr = "10.0.0.7:7001".parse().unwrap();

        let mut announced = Announcement::from(&ServiceRecord::new("cache", "", 6380));
        announced.version = "7.2".to_string();
        service
            .handle_message(BroadcastMessage::new(MessageKind::Announce, announced), from)
            .await;

        let found = service.discover("cache").await.unwrap();
        assert_eq!(found.address(), "10.0.0.7:6380");
        assert_eq!(found.version, "7.2");
        assert_eq!(service.list().len(), 1);

        tokio::time::advance(Duration::from_millis(301)).await;
        assert!(service.list().is_empty());
        assert_eq!(service.clean_expired(), 1);
        // Not running, so no query can be sent
        assert!(matches!(
            service.discover("cache").await,
            Err(Error::NotRunning(_))
        ));
    }
}
