use std::{
    collections::HashMap,
    net::{SocketAddr, ToSocketAddrs as _},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use tracing::debug;

use crate::builder::BuildError;

use super::{ClientConnection, ClusterStats, ConnectionProvider, TcpConnection};

struct StaticCluster {
    hosts: Vec<SocketAddr>,
    next_host: AtomicUsize,
    stats: Arc<ClusterStats>,
}

/// A connection provider over a fixed set of named clusters.
///
/// Hosts within a cluster are picked in round-robin order. Connections are [`TcpConnection`]s.
#[derive(Default)]
pub struct StaticClusterManager {
    clusters: HashMap<String, StaticCluster>,
}

impl StaticClusterManager {
    /// Creates an empty `StaticClusterManager`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a cluster with the given hosts, replacing any existing cluster of the same name.
    ///
    /// A cluster with no hosts is known, but never yields a connection.
    #[must_use]
    pub fn with_cluster<N, I>(mut self, name: N, hosts: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = SocketAddr>,
    {
        let cluster = StaticCluster {
            hosts: hosts.into_iter().collect(),
            next_host: AtomicUsize::new(0),
            stats: Arc::new(ClusterStats::new()),
        };
        self.clusters.insert(name.into(), cluster);
        self
    }

    /// Adds a cluster whose hosts are resolved from `addr`, in the format of `<host>:<port>`.
    ///
    /// # Errors
    ///
    /// If the address cannot be resolved, an error will be returned indicating the reason.
    pub fn with_cluster_address<N, A>(self, name: N, addr: A) -> Result<Self, BuildError>
    where
        N: Into<String>,
        A: AsRef<str>,
    {
        let hosts = addr
            .as_ref()
            .to_socket_addrs()
            .map_err(|e| BuildError::InvalidRemoteAddress { reason: e.to_string() })?;
        Ok(self.with_cluster(name, hosts))
    }

    fn pick_host(&self, cluster: &str) -> Option<(SocketAddr, &ClusterStats)> {
        let cluster_state = self.clusters.get(cluster)?;
        if cluster_state.hosts.is_empty() {
            debug!(cluster, "No hosts available.");
            return None;
        }

        let idx = cluster_state.next_host.fetch_add(1, Ordering::Relaxed) % cluster_state.hosts.len();
        Some((cluster_state.hosts[idx], &cluster_state.stats))
    }
}

impl ConnectionProvider for StaticClusterManager {
    fn cluster_stats(&self, cluster: &str) -> Option<Arc<ClusterStats>> {
        self.clusters.get(cluster).map(|c| Arc::clone(&c.stats))
    }

    fn tcp_conn_for_cluster(&self, cluster: &str) -> Option<Box<dyn ClientConnection>> {
        let (host, stats) = self.pick_host(cluster)?;
        stats.inc_cx_total();
        debug!(cluster, %host, "Creating connection.");

        Some(Box::new(TcpConnection::new(host)))
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use crate::upstream::{ConnectionProvider, ConnectionState};

    use super::StaticClusterManager;

    #[test]
    fn unknown_and_empty_clusters() {
        let manager = StaticClusterManager::new().with_cluster("empty", []);

        assert!(manager.cluster_stats("missing").is_none());
        assert!(manager.tcp_conn_for_cluster("missing").is_none());

        let stats = manager.cluster_stats("empty").expect("cluster should exist");
        assert!(manager.tcp_conn_for_cluster("empty").is_none());
        assert_eq!(stats.cx_total(), 0);
    }

    #[test]
    fn hosts_are_picked_round_robin() {
        let hosts: Vec<SocketAddr> = vec![
            "127.0.0.1:8125".parse().expect("valid address"),
            "127.0.0.2:8125".parse().expect("valid address"),
        ];
        let manager = StaticClusterManager::new().with_cluster("statsd", hosts.clone());

        let picked: Vec<SocketAddr> =
            (0..4).filter_map(|_| manager.pick_host("statsd").map(|(host, _)| host)).collect();
        assert_eq!(picked, vec![hosts[0], hosts[1], hosts[0], hosts[1]]);

        for _ in 0..4 {
            let conn = manager.tcp_conn_for_cluster("statsd").expect("connection expected");
            assert_eq!(conn.state(), ConnectionState::Connecting);
        }

        let stats = manager.cluster_stats("statsd").expect("cluster should exist");
        assert_eq!(stats.cx_total(), 4);
    }

    #[test]
    fn cluster_from_address() {
        let manager = StaticClusterManager::new()
            .with_cluster_address("statsd", "127.0.0.1:8125")
            .expect("address should resolve");
        assert!(manager.tcp_conn_for_cluster("statsd").is_some());

        assert!(StaticClusterManager::new().with_cluster_address("statsd", "not an address").is_err());
    }
}
