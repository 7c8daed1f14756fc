//! Node discovery.
//!
//! A client that knows no node address sends a `REQ` datagram to a multicast
//! group, a set of broadcast addresses or explicit addresses, and connects
//! to the first node whose `ACK` passes the configured filters.
//!
//! ```text
//! REQ <nodeID> <destination> [ACCESS_CLUSTERS='<clusters>'] [CONNECTION_STRATEGY='<strategy>']
//! ACK <recipientNodeID> <senderNodeID> <user> <scrambledPassword> [<version>]
//! X<originatorIP> <message>
//! ```
mod filter;
mod message;
mod socket;
mod target;

use std::{
    error::Error as StdError,
    fmt::Write as _,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    config::DiscoveryConfig,
    protocol::{DatagramChannel, is_timeout},
};

pub use filter::{AckFilter, MIN_CLUSTER_VERSION};
pub use message::{Acknowledgement, Discard, DiscoveryRequest};
pub use socket::{
    DEFAULT_MULTICAST_GROUP, DEFAULT_MULTICAST_TTL, MulticastSocket, broadcast_addresses,
    default_local_ip, local_ipv4s, multicast_interfaces, resolve_destinations,
};
pub use target::{
    ConnectionOpener, ConnectionStrategy, ConnectionTarget, CredentialScrambler, Credentials,
    DEFAULT_NODE_PORT, DiscoveredNode, SHARED_DATABASE_NAME,
};

pub const DEFAULT_DISCOVERY_PORT: u16 = 7777;
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_millis(5000);

const ACK_BUFFER_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no network connectivity: {0}")]
    Connectivity(#[source] io::Error),

    #[error("error sending discovery request to {destination}: {source}")]
    Send {
        destination: SocketAddr,
        source: io::Error,
    },

    #[error("{}", no_nodes_report(.broadcast_addresses))]
    NoNodes { broadcast_addresses: Vec<Ipv4Addr> },

    #[error("node {node_id} advertises an invalid port")]
    InvalidNodeId { node_id: String },

    #[error("could not connect to {target}: {source}")]
    Connect {
        target: String,
        source: Box<dyn StdError + Send + Sync>,
    },
}

fn no_nodes_report(broadcast_addresses: &[Ipv4Addr]) -> String {
    let mut report = String::from(
        "unable to discover any nodes\n\
         Try adjusting discovery_ip to a valid address (or list of addresses), \
         and access_clusters to a valid cluster name.\n\n",
    );
    let available = if broadcast_addresses.is_empty() {
        "None".to_string()
    } else {
        broadcast_addresses
            .iter()
            .map(Ipv4Addr::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    let _ = write!(
        report,
        "Broadcast addresses currently available on this client: {available}\n\
         (Set discovery_ip to one or more of the above, or to {}, \
         or leave it unset to target the default multicast group {DEFAULT_MULTICAST_GROUP})",
        socket::BROADCAST_ALL,
    );
    report
}

/// Runs discovery attempts with one configuration.
#[derive(Debug, Clone)]
pub struct Discoverer {
    config: DiscoveryConfig,
    filter: AckFilter,
}

impl Discoverer {
    pub fn new(config: DiscoveryConfig) -> Self {
        let filter = AckFilter::new(
            config.access_clusters.as_deref(),
            config.hosts_permitted.as_deref(),
            config.hosts_denied.as_deref(),
        );
        Self { config, filter }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn request<'a>(&'a self, destination: IpAddr, user: Option<&'a str>) -> DiscoveryRequest<'a> {
        DiscoveryRequest {
            node_id: &self.config.node_id,
            destination,
            access_clusters: self.config.access_clusters.as_deref(),
            strategy: self.config.connection_strategy,
            user,
        }
    }

    /// Finds a node on the network, waiting at most the configured timeout.
    pub fn discover(&self, user: Option<&str>) -> Result<DiscoveredNode, DiscoveryError> {
        let interfaces = multicast_interfaces(self.config.multicast_interfaces.as_deref())
            .unwrap_or_else(|e| {
                warn!("no multicast interface available: {e}");
                Vec::new()
            });
        let socket = MulticastSocket::open(DEFAULT_MULTICAST_GROUP, interfaces, self.config.ttl)
            .map_err(DiscoveryError::Connectivity)?;

        let destinations = resolve_destinations(
            self.config.discovery_ip.as_deref(),
            self.config.discovery_port,
        );
        let deadline = Instant::now() + self.config.timeout();
        self.discover_with(&socket, &destinations, user, deadline)
    }

    /// Sends one request per destination over `channel` and returns the first
    /// acceptable acknowledgement received before `deadline`.
    pub fn discover_with<C: DatagramChannel>(
        &self,
        channel: &C,
        destinations: &[SocketAddr],
        user: Option<&str>,
        deadline: Instant,
    ) -> Result<DiscoveredNode, DiscoveryError> {
        for destination in destinations {
            let request = self.request(destination.ip(), user).to_string();
            debug!("sending {request:?} to {destination}");
            channel
                .send_datagram(request.as_bytes(), *destination)
                .map_err(|source| DiscoveryError::Send {
                    destination: *destination,
                    source,
                })?;
        }

        let mut buf = [0u8; ACK_BUFFER_SIZE];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let (len, from) = match channel.recv_datagram(&mut buf, Some(remaining)) {
                Ok(received) => received,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => {
                    debug!("discovery receive failed: {e}");
                    continue;
                }
            };

            let text = String::from_utf8_lossy(&buf[..len]);
            let ack = match Acknowledgement::parse(&text, from.ip()) {
                Ok(ack) => ack,
                Err(reason) => {
                    debug!("ignoring datagram from {from}: {reason}");
                    continue;
                }
            };
            if let Err(reason) = self.filter.check(&ack) {
                debug!("ignoring ACK from {}: {reason}", ack.node_id);
                continue;
            }

            info!("discovered node {} at {}", ack.node_id, ack.sender);
            return Ok(ack.into());
        }

        Err(DiscoveryError::NoNodes {
            broadcast_addresses: broadcast_addresses().unwrap_or_default(),
        })
    }

    /// Discovers a node and opens a connection to it.
    pub fn connect<O: ConnectionOpener>(
        &self,
        credentials: &Credentials,
        scrambler: &dyn CredentialScrambler,
        opener: &O,
    ) -> Result<(ConnectionTarget, O::Connection), DiscoveryError> {
        let node = self.discover(credentials.user.as_deref())?;
        self.connect_to(&node, credentials, scrambler, opener)
    }

    pub fn connect_to<O: ConnectionOpener>(
        &self,
        node: &DiscoveredNode,
        credentials: &Credentials,
        scrambler: &dyn CredentialScrambler,
        opener: &O,
    ) -> Result<(ConnectionTarget, O::Connection), DiscoveryError> {
        let target = ConnectionTarget::derive(
            node,
            self.config.connection_strategy,
            credentials,
            scrambler,
        )?;
        info!("connecting to discovered node at {target}");
        let connection = opener.open(&target).map_err(|e| DiscoveryError::Connect {
            target: target.to_string(),
            source: Box::new(e),
        })?;
        Ok((target, connection))
    }
}
