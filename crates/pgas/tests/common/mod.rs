//! Shared fixtures for the runtime integration tests
//!
//! Multi-node tests run every node of the ensemble inside this process,
//! each with its own runtime, region, and listener on a loopback port.

#![allow(dead_code)]

use pgas::config::NodeConfig;
use pgas::{ClusterConfig, Runtime};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

/// Region size used by most tests (16 MiB)
pub const TEST_REGION_SIZE: u64 = 1 << 24;

/// Reserve distinct free loopback ports
///
/// All listeners are held open until every port is known, so the ports are
/// pairwise distinct.
pub fn free_ports(count: usize) -> Vec<u16> {
    let listeners: Vec<TcpListener> = (0..count)
        .map(|_| TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port"))
        .collect();
    listeners
        .iter()
        .map(|l| l.local_addr().unwrap().port())
        .collect()
}

pub fn free_port() -> u16 {
    free_ports(1)[0]
}

/// Build a loopback ensemble configuration
pub fn cluster_config(local_node_id: u16, ports: &[u16], region_size: u64) -> ClusterConfig {
    ClusterConfig {
        local_node_id,
        num_nodes: ports.len() as u16,
        nodes: ports
            .iter()
            .enumerate()
            .map(|(node_id, &port)| NodeConfig {
                node_id: node_id as u16,
                hostname: "127.0.0.1".to_string(),
                port,
                region_base: 0,
                region_size,
            })
            .collect(),
        connect_retries: 15,
        connect_timeout: Duration::from_millis(500),
    }
}

/// Bring up a two-node ensemble on loopback
///
/// Both runtimes are constructed concurrently because each blocks until it
/// can reach the other's listener.
pub fn start_pair(region_size: u64) -> (Arc<Runtime>, Arc<Runtime>) {
    let ports = free_ports(2);
    let config0 = cluster_config(0, &ports, region_size);
    let config1 = cluster_config(1, &ports, region_size);

    let node0 = std::thread::spawn(move || Runtime::new(config0).expect("node 0 bring-up"));
    let node1 = std::thread::spawn(move || Runtime::new(config1).expect("node 1 bring-up"));

    (
        Arc::new(node0.join().expect("node 0 thread")),
        Arc::new(node1.join().expect("node 1 thread")),
    )
}

/// Poll until `predicate` holds or the deadline passes
pub fn wait_until<F: FnMut() -> bool>(mut predicate: F, deadline: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}
