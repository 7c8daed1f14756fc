use std::{fmt, net::IpAddr};

use thiserror::Error;

use super::target::ConnectionStrategy;

pub const REQUEST_PREFIX: &str = "REQ";
pub const ACK_PREFIX: &str = "ACK";
pub const REBROADCAST_MARKER: char = 'X';

pub const ACCESS_CLUSTERS_KEY: &str = "ACCESS_CLUSTERS";
pub const CONNECTION_STRATEGY_KEY: &str = "CONNECTION_STRATEGY";

/// Why a received datagram did not yield a node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Discard {
    #[error("unable to resolve the original sender of a rebroadcast message")]
    UnknownOriginator,

    #[error("too few tokens")]
    TooFewTokens,

    #[error("not an acknowledgement: {0}")]
    NotAck(String),

    #[error("node {0} runs a version that cannot match cluster membership")]
    Version(String),

    #[error("host {0} is denied")]
    Denied(String),

    #[error("host {0} is not permitted")]
    NotPermitted(String),

    #[error("node {0} advertises an invalid port")]
    InvalidPort(String),
}

/// `REQ <nodeID> <destination> [ACCESS_CLUSTERS='..'] [CONNECTION_STRATEGY='..']`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRequest<'a> {
    pub node_id: &'a str,
    pub destination: IpAddr,
    pub access_clusters: Option<&'a str>,
    pub strategy: ConnectionStrategy,
    pub user: Option<&'a str>,
}

impl fmt::Display for DiscoveryRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{REQUEST_PREFIX} {} {}", self.node_id, self.destination)?;
        if let Some(clusters) = self.access_clusters {
            write!(f, " {ACCESS_CLUSTERS_KEY}='{clusters}'")?;
        }
        write!(
            f,
            " {CONNECTION_STRATEGY_KEY}='{}'",
            self.strategy.request_value(self.user)
        )
    }
}

/// An offer from a node willing to accept our connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    /// Source of the datagram, or the originator named by a rebroadcast.
    pub sender: IpAddr,
    pub recipient: String,
    pub node_id: String,
    pub user: String,
    pub scrambled_password: String,
    pub version: Option<String>,
}

impl Acknowledgement {
    /// Parses one received datagram. `source` is where it came from.
    pub fn parse(text: &str, source: IpAddr) -> Result<Self, Discard> {
        let mut text = text.trim();
        let mut sender = source;

        if let Some(rest) = text.strip_prefix(REBROADCAST_MARKER) {
            let (origin, message) = rest
                .split_once(' ')
                .filter(|(_, message)| !message.is_empty())
                .ok_or(Discard::UnknownOriginator)?;
            sender = origin.parse().map_err(|_| Discard::UnknownOriginator)?;
            text = message;
        }

        let tokens: Vec<&str> = text.split(' ').collect();
        if tokens.len() < 2 {
            return Err(Discard::TooFewTokens);
        }
        if tokens[0].trim() != ACK_PREFIX {
            return Err(Discard::NotAck(tokens[0].trim().to_string()));
        }
        if tokens.len() < 5 {
            return Err(Discard::TooFewTokens);
        }

        Ok(Self {
            sender,
            recipient: tokens[1].trim().to_string(),
            node_id: tokens[2].trim().to_string(),
            user: tokens[3].trim().to_string(),
            scrambled_password: tokens[4].trim().to_string(),
            version: tokens.get(5).map(|v| v.trim().to_string()),
        })
    }

    /// Host part of the node ID, upper-cased.
    pub fn host(&self) -> String {
        node_host(&self.node_id).to_uppercase()
    }
}

pub(crate) fn node_host(node_id: &str) -> &str {
    node_id
        .rsplit_once(':')
        .map_or(node_id, |(host, _)| host)
}

/// Port advertised in the node ID, if any.
pub(crate) fn node_port(node_id: &str) -> Result<Option<u16>, Discard> {
    match node_id.rsplit_once(':') {
        Some((_, port)) => port
            .parse()
            .map(Some)
            .map_err(|_| Discard::InvalidPort(node_id.to_string())),
        None => Ok(None),
    }
}
