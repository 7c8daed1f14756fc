use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use serde::{Deserialize, Serialize};

use super::{
    DiscoveryError,
    message::{Acknowledgement, node_port},
};

/// Port a node listens on when its ID does not carry one.
pub const DEFAULT_NODE_PORT: u16 = 6414;
pub const SHARED_DATABASE_NAME: &str = "gaiandb";

/// How the discovered node should place this client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStrategy {
    #[default]
    #[serde(rename = "ATTACHMENT_RANDOM")]
    AttachmentRandom,
    /// Attach to a database named after the connecting user.
    #[serde(rename = "ATTACHMENT_TO_USER_DB_NODE")]
    AttachmentToUserDbNode,
}

impl ConnectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AttachmentRandom => "ATTACHMENT_RANDOM",
            Self::AttachmentToUserDbNode => "ATTACHMENT_TO_USER_DB_NODE",
        }
    }

    /// Value sent in a discovery request.
    pub fn request_value(&self, user: Option<&str>) -> String {
        match (self, user) {
            (Self::AttachmentToUserDbNode, Some(user)) => format!("{}:{user}", self.as_str()),
            _ => self.as_str().to_string(),
        }
    }
}

impl fmt::Display for ConnectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The node that answered a discovery request first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredNode {
    pub node_id: String,
    pub address: IpAddr,
    pub user: String,
    pub scrambled_password: String,
}

impl From<Acknowledgement> for DiscoveredNode {
    fn from(ack: Acknowledgement) -> Self {
        Self {
            node_id: ack.node_id,
            address: ack.sender,
            user: ack.user,
            scrambled_password: ack.scrambled_password,
        }
    }
}

/// User and password supplied by the caller, overriding what the node offers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Reverses the scrambling a node applies to the password it offers.
pub trait CredentialScrambler {
    fn unscramble(&self, scrambled: &str, node_id: &str) -> String;
}

/// Opens a standard connection once a node has been found.
pub trait ConnectionOpener {
    type Connection;
    type Error: std::error::Error + Send + Sync + 'static;

    fn open(&self, target: &ConnectionTarget) -> Result<Self::Connection, Self::Error>;
}

/// Everything needed to open a connection to a discovered node.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub address: IpAddr,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.endpoint(), self.database)
    }
}

impl ConnectionTarget {
    pub fn derive(
        node: &DiscoveredNode,
        strategy: ConnectionStrategy,
        credentials: &Credentials,
        scrambler: &dyn CredentialScrambler,
    ) -> Result<Self, DiscoveryError> {
        let advertised = node_port(&node.node_id).map_err(|_| DiscoveryError::InvalidNodeId {
            node_id: node.node_id.clone(),
        })?;
        let port = advertised.unwrap_or(DEFAULT_NODE_PORT);

        let user = credentials.user.clone().unwrap_or_else(|| node.user.clone());
        let database = match strategy {
            ConnectionStrategy::AttachmentToUserDbNode => user
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
                .collect(),
            ConnectionStrategy::AttachmentRandom => match advertised {
                Some(port) => format!("{SHARED_DATABASE_NAME}{port}"),
                None => SHARED_DATABASE_NAME.to_string(),
            },
        };
        let password = match &credentials.password {
            Some(password) => password.clone(),
            None => scrambler.unscramble(&node.scrambled_password, &node.node_id),
        };

        Ok(Self {
            address: node.address,
            port,
            database,
            user,
            password,
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}
