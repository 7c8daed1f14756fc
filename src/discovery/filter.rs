use std::collections::HashSet;

use super::message::{Acknowledgement, Discard, node_port};

/// Oldest version able to honour access cluster membership.
pub const MIN_CLUSTER_VERSION: &str = "1.04";

/// Decides which acknowledgements are acceptable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckFilter {
    require_cluster_support: bool,
    permitted: Option<HashSet<String>>,
    denied: HashSet<String>,
}

fn host_set(list: &str) -> HashSet<String> {
    split_list(list).map(str::to_uppercase).collect()
}

pub(crate) fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

impl AckFilter {
    pub fn new(
        access_clusters: Option<&str>,
        hosts_permitted: Option<&str>,
        hosts_denied: Option<&str>,
    ) -> Self {
        Self {
            require_cluster_support: access_clusters.is_some_and(|c| split_list(c).next().is_some()),
            permitted: hosts_permitted.map(host_set).filter(|hosts| !hosts.is_empty()),
            denied: hosts_denied.map(host_set).unwrap_or_default(),
        }
    }

    pub fn check(&self, ack: &Acknowledgement) -> Result<(), Discard> {
        if self.require_cluster_support
            && ack
                .version
                .as_deref()
                .is_none_or(|version| version < MIN_CLUSTER_VERSION)
        {
            return Err(Discard::Version(ack.node_id.clone()));
        }

        let host = ack.host();
        if self.denied.contains(&host) {
            return Err(Discard::Denied(host));
        }
        if self.permitted.as_ref().is_some_and(|hosts| !hosts.contains(&host)) {
            return Err(Discard::NotPermitted(host));
        }

        node_port(&ack.node_id).map(|_| ())
    }
}
