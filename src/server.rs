// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::{Arc, OnceLock},
};

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum FailoverError {
    #[error("no failover server matches {0:?}")]
    NoMatch(Vec<String>),
    #[error("ambiguous failover target: servers {0:?} all match")]
    Ambiguous(Vec<String>),
}

/// A node of the cluster on which components can run.
///
/// Two Servers are the same server if they have the same hostname; the NIDs are only carried
/// along so that clients can be told where to find the management server.
#[derive(Debug, Clone)]
pub struct Server {
    hostname: String,
    nids: Vec<String>,
}

impl Server {
    pub fn new(hostname: &str, nids: Vec<String>) -> Self {
        Server {
            hostname: hostname.to_string(),
            nids,
        }
    }

    /// Create a Server object from a given config::Server object.
    pub fn from_config(server: &crate::config::Server) -> Self {
        Server::new(&server.hostname, server.nids.clone())
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn nids(&self) -> &[String] {
        &self.nids
    }

    /// Whether this server is the machine the current process is running on.
    pub fn is_local(&self) -> bool {
        local_identity().matches(&self.hostname)
    }
}

impl PartialEq for Server {
    fn eq(&self, other: &Self) -> bool {
        self.hostname == other.hostname
    }
}

impl Eq for Server {}

impl Hash for Server {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hostname.hash(state);
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hostname)
    }
}

/// The hostname of the current process, resolved once.
#[derive(Debug)]
struct LocalIdentity {
    fqdn: String,
    short: String,
}

impl LocalIdentity {
    fn matches(&self, name: &str) -> bool {
        name == "localhost" || name == self.fqdn || short_name(name) == self.short
    }
}

static LOCAL_IDENTITY: OnceLock<LocalIdentity> = OnceLock::new();

fn local_identity() -> &'static LocalIdentity {
    LOCAL_IDENTITY.get_or_init(|| {
        let fqdn = match nix::unistd::gethostname() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(e) => {
                log::warn!("could not determine local hostname: {e}");
                String::new()
            }
        };
        let short = short_name(&fqdn).to_string();
        LocalIdentity { fqdn, short }
    })
}

/// The short hostname of the machine this process runs on.
pub fn local_hostname() -> &'static str {
    &local_identity().short
}

fn short_name(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

/// An ordered set of candidate servers. Insertion order is priority order.
#[derive(Debug, Clone, Default)]
pub struct ServerGroup {
    servers: Vec<Arc<Server>>,
}

impl ServerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a server to the group. Returns false, leaving the group unchanged, if a server with
    /// the same hostname is already a member.
    pub fn push(&mut self, server: Arc<Server>) -> bool {
        if self.contains(server.hostname()) {
            return false;
        }
        self.servers.push(server);
        true
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.servers.iter().any(|s| s.hostname() == hostname)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Server>> {
        self.servers.iter()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Select the single member whose hostname is one of `names`.
    ///
    /// Picking "the first match" would hide misconfiguration in clusters with several standby
    /// servers, so more than one match is an error just like no match at all.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Arc<Server>, FailoverError> {
        let matches: Vec<&Arc<Server>> = self
            .servers
            .iter()
            .filter(|s| names.iter().any(|n| n.as_ref() == s.hostname()))
            .collect();

        match matches.as_slice() {
            [one] => Ok(Arc::clone(one)),
            [] => Err(FailoverError::NoMatch(
                names.iter().map(|n| n.as_ref().to_string()).collect(),
            )),
            many => Err(FailoverError::Ambiguous(
                many.iter().map(|s| s.hostname().to_string()).collect(),
            )),
        }
    }
}

impl FromIterator<Arc<Server>> for ServerGroup {
    fn from_iter<I: IntoIterator<Item = Arc<Server>>>(iter: I) -> Self {
        let mut group = ServerGroup::new();
        for server in iter {
            group.push(server);
        }
        group
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(names: &[&str]) -> ServerGroup {
        names
            .iter()
            .map(|n| Arc::new(Server::new(n, vec![])))
            .collect()
    }

    #[test]
    fn select_requires_exactly_one_match() {
        let g = group(&["foo1", "foo2", "foo3"]);

        assert_eq!(g.select(&["foo2"]).unwrap().hostname(), "foo2");
        assert_eq!(g.select(&["bar", "foo3"]).unwrap().hostname(), "foo3");
        assert!(matches!(g.select(&["bar"]), Err(FailoverError::NoMatch(_))));
        assert_eq!(
            g.select(&["foo1", "foo3"]),
            Err(FailoverError::Ambiguous(vec![
                "foo1".to_string(),
                "foo3".to_string()
            ]))
        );
        let empty: [&str; 0] = [];
        assert!(g.select(&empty).is_err());
    }

    #[test]
    fn duplicates_are_ignored() {
        let mut g = group(&["foo1"]);
        assert!(!g.push(Arc::new(Server::new("foo1", vec!["1@tcp".to_string()]))));
        assert!(g.push(Arc::new(Server::new("foo2", vec![]))));
        assert_eq!(g.len(), 2);
        assert!(g.contains("foo2"));
    }

    #[test]
    fn localhost_is_local() {
        assert!(Server::new("localhost", vec![]).is_local());
        assert!(Server::new(local_hostname(), vec![]).is_local());
        assert!(!Server::new("no-such-node.invalid", vec![]).is_local());
    }
}
