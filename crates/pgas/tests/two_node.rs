//! Two-node ensemble tests over loopback
//!
//! Both nodes run inside this process, each with its own runtime, region,
//! and listener. Remote traffic crosses real TCP sockets.

mod common;

use common::{cluster_config, free_ports, start_pair, wait_until, TEST_REGION_SIZE};
use pgas::{Affinity, GlobalPtr, PgasError, Runtime};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// Remote put then owner-side read returns the bytes verbatim
#[test]
fn test_remote_put_get_roundtrip() {
    let (node0, node1) = start_pair(TEST_REGION_SIZE);

    let ptr = node0.alloc_on_node(64, 1).unwrap();
    assert_eq!(ptr.node(), 1);
    assert!(!node0.is_local(ptr));
    assert!(node1.is_local(ptr));

    let data: Vec<u8> = (1..=64).collect();
    node0.put(ptr, &data).unwrap();

    // The owner sees the bytes through its own mapping
    let host = node1.local_ptr(ptr).unwrap();
    let view = unsafe { std::slice::from_raw_parts(host, 64) };
    assert_eq!(view, &data[..]);

    // And the writer reads them back over the wire
    let mut readback = vec![0u8; 64];
    node0.get(&mut readback, ptr).unwrap();
    assert_eq!(readback, data);

    let snap = node0.stats();
    assert_eq!(snap.remote_writes, 1);
    assert_eq!(snap.remote_reads, 1);
    assert_eq!(snap.bytes_transferred, 128);
    assert!(snap.avg_latency_us > 0.0);

    node0.free(ptr).unwrap();
    node0.finalize();
    node1.finalize();
}

/// 10 000 remote fetch-adds sum exactly, with pairwise-distinct priors
#[test]
fn test_remote_fetch_add() {
    let (node0, node1) = start_pair(TEST_REGION_SIZE);

    let counter = node0.alloc_on_node(8, 1).unwrap();
    node0.put(counter, &0u64.to_le_bytes()).unwrap();

    let rounds: u64 = 10_000;
    let mut priors = Vec::with_capacity(rounds as usize);
    for _ in 0..rounds {
        priors.push(node0.atomic_fetch_add(counter, 1).unwrap());
    }

    let mut sorted = priors.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), rounds as usize);
    assert_eq!(*sorted.last().unwrap(), rounds - 1);

    // The owner observes the final count directly
    let host = node1.local_ptr(counter).unwrap();
    let value = unsafe { (host as *const u64).read_volatile() };
    assert_eq!(value, rounds);

    node0.finalize();
    node1.finalize();
}

/// Remote CAS agrees with local CAS on the same word
#[test]
fn test_remote_cas() {
    let (node0, node1) = start_pair(TEST_REGION_SIZE);

    let word = node0.alloc_on_node(8, 1).unwrap();
    node0.put(word, &10u64.to_le_bytes()).unwrap();

    // Mismatched expectation fails and reports the current value
    assert_eq!(node0.atomic_cas(word, 99, 11).unwrap(), 10);
    // Matching expectation swaps
    assert_eq!(node0.atomic_cas(word, 10, 11).unwrap(), 10);
    // The owner sees the new value
    assert_eq!(node1.atomic_fetch_add(word, 0).unwrap(), 11);

    node0.finalize();
    node1.finalize();
}

/// Ping-pong: alternating counters never observed out of sequence
#[test]
fn test_ping_pong_sequence() {
    let (node0, node1) = start_pair(TEST_REGION_SIZE);
    let rounds: u64 = 10_000;

    let counter0 = node0.alloc(8, Affinity::Local).unwrap();
    let counter1 = node1.alloc(8, Affinity::Local).unwrap();
    node0.put(counter0, &0u64.to_le_bytes()).unwrap();
    node1.put(counter1, &0u64.to_le_bytes()).unwrap();

    let spin = |runtime: &Runtime, ptr: GlobalPtr, expect: u64| {
        let host = runtime.local_ptr(ptr).unwrap() as *const u64;
        loop {
            let seen = unsafe { host.read_volatile() };
            assert!(seen <= expect, "observed {} ahead of {}", seen, expect);
            if seen == expect {
                return;
            }
            std::hint::spin_loop();
        }
    };

    let n0 = Arc::clone(&node0);
    let n1 = Arc::clone(&node1);
    let pinger = std::thread::spawn(move || {
        for i in 0..rounds {
            n0.put(counter1, &(i + 1).to_le_bytes()).unwrap();
            spin(&n0, counter0, i + 1);
        }
    });
    let ponger = std::thread::spawn(move || {
        for i in 0..rounds {
            spin(&n1, counter1, i + 1);
            n1.put(counter0, &(i + 1).to_le_bytes()).unwrap();
        }
    });

    pinger.join().unwrap();
    ponger.join().unwrap();

    node0.finalize();
    node1.finalize();
}

/// A value stored before the barrier is visible to the peer after it
#[test]
fn test_barrier_release_visibility() {
    let (node0, node1) = start_pair(TEST_REGION_SIZE);

    let flag = node0.alloc(8, Affinity::Local).unwrap();
    let (ptr_tx, ptr_rx) = mpsc::channel::<GlobalPtr>();

    let n0 = Arc::clone(&node0);
    let writer = std::thread::spawn(move || {
        n0.put(flag, &0xDEADu64.to_le_bytes()).unwrap();
        ptr_tx.send(flag).unwrap();
        n0.barrier().unwrap();
    });

    let n1 = Arc::clone(&node1);
    let reader = std::thread::spawn(move || {
        let flag = ptr_rx.recv().unwrap();
        n1.barrier().unwrap();

        let mut bytes = [0u8; 8];
        n1.get(&mut bytes, flag).unwrap();
        assert_eq!(u64::from_le_bytes(bytes), 0xDEAD);
    });

    writer.join().unwrap();
    reader.join().unwrap();

    assert_eq!(node0.stats().barriers, 1);
    assert_eq!(node1.stats().barriers, 1);

    node0.finalize();
    node1.finalize();
}

/// Both directions carry traffic concurrently on their own socket pairs
#[test]
fn test_concurrent_bidirectional_traffic() {
    let (node0, node1) = start_pair(TEST_REGION_SIZE);

    let on1 = node0.alloc_on_node(4096, 1).unwrap();
    let on0 = node1.alloc_on_node(4096, 0).unwrap();

    let n0 = Arc::clone(&node0);
    let forward = std::thread::spawn(move || {
        for i in 0..500u32 {
            let fill = (i % 256) as u8;
            n0.put(on1, &[fill; 4096]).unwrap();
            let mut buf = vec![0u8; 4096];
            n0.get(&mut buf, on1).unwrap();
            assert!(buf.iter().all(|&b| b == fill));
        }
    });

    let n1 = Arc::clone(&node1);
    let backward = std::thread::spawn(move || {
        for i in 0..500u32 {
            let fill = ((i + 7) % 256) as u8;
            n1.put(on0, &[fill; 4096]).unwrap();
            let mut buf = vec![0u8; 4096];
            n1.get(&mut buf, on0).unwrap();
            assert!(buf.iter().all(|&b| b == fill));
        }
    });

    forward.join().unwrap();
    backward.join().unwrap();

    node0.finalize();
    node1.finalize();
}

/// Remote frees reach the owner's allocator
#[test]
fn test_remote_free() {
    let (node0, node1) = start_pair(TEST_REGION_SIZE);

    let ptr = node0.alloc_on_node(128, 1).unwrap();
    assert_eq!(node1.allocator_stats().allocations, 1);

    node0.free(ptr).unwrap();
    assert!(
        wait_until(
            || node1.allocator_stats().deallocations == 1,
            Duration::from_secs(5)
        ),
        "remote free never reached the owner"
    );

    node0.finalize();
    node1.finalize();
}

/// Remote allocation failure surfaces as out-of-memory, not a crash
#[test]
fn test_remote_alloc_oom() {
    let (node0, node1) = start_pair(1 << 20);

    let err = node0.alloc_on_node(8 << 20, 1).unwrap_err();
    assert!(matches!(err, PgasError::OutOfMemory { .. }));

    node0.finalize();
    node1.finalize();
}

/// Freeing the null pointer is a no-op everywhere
#[test]
fn test_free_null_noop() {
    let (node0, node1) = start_pair(TEST_REGION_SIZE);
    node0.free(GlobalPtr::null()).unwrap();
    assert_eq!(node1.allocator_stats().deallocations, 0);
    node0.finalize();
    node1.finalize();
}

/// Bring-up with zero reachable peers fails
#[test]
fn test_bringup_zero_peers_fails() {
    let ports = free_ports(2);
    let mut config = cluster_config(0, &ports, 1 << 20);
    config.connect_retries = 1;
    config.connect_timeout = Duration::from_millis(200);

    let err = Runtime::new(config).unwrap_err();
    assert!(matches!(
        err,
        PgasError::ConnectIncomplete {
            connected: 0,
            expected: 1
        }
    ));
}

/// With some but not all peers reachable, bring-up degrades instead of failing
#[test]
fn test_bringup_degraded_mode() {
    let ports = free_ports(3);

    let mut config0 = cluster_config(0, &ports, 1 << 20);
    let mut config1 = cluster_config(1, &ports, 1 << 20);
    for config in [&mut config0, &mut config1] {
        config.connect_retries = 3;
        config.connect_timeout = Duration::from_millis(200);
    }

    // Node 2 never starts
    let node0 = std::thread::spawn(move || Runtime::new(config0).expect("node 0"));
    let node1 = std::thread::spawn(move || Runtime::new(config1).expect("node 1"));
    let node0 = Arc::new(node0.join().unwrap());
    let node1 = node1.join().unwrap();

    assert!(node0.node_info(1).unwrap().is_active);
    assert!(!node0.node_info(2).unwrap().is_active);

    // The live pair still works
    let ptr = node0.alloc_on_node(64, 1).unwrap();
    node0.put(ptr, &[3u8; 64]).unwrap();

    // Operations on the missing peer fail without retry
    let mut buf = [0u8; 8];
    let err = node0.get(&mut buf, GlobalPtr::new(2, 0)).unwrap_err();
    assert!(matches!(err, PgasError::Communication { node_id: 2, .. }));
    assert!(node0.stats().comm_failures > 0);

    // Barriers cover only the active membership
    let n0 = Arc::clone(&node0);
    let barrier0 = std::thread::spawn(move || n0.barrier().unwrap());
    node1.barrier().unwrap();
    barrier0.join().unwrap();

    node0.finalize();
    node1.finalize();
}
