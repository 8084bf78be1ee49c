//! Command implementations for pgasctl

use anyhow::Context;
use pgas::{Affinity, ClusterConfig, Profile, Tuning};
use std::path::PathBuf;
use tracing::info;

/// Parse and validate the configuration, printing the node table
pub fn run_info(config_path: PathBuf) -> anyhow::Result<()> {
    let config = ClusterConfig::from_file(&config_path)?;
    config.validate()?;

    println!(
        "local node {} of {} ({})",
        config.local_node_id,
        config.num_nodes,
        config_path.display()
    );
    println!(
        "{:<6} {:<24} {:>7} {:>18} {:>14}",
        "node", "endpoint", "local", "region_base", "region_size"
    );
    for node in &config.nodes {
        println!(
            "{:<6} {:<24} {:>7} {:>18} {:>14}",
            node.node_id,
            node.endpoint(),
            if node.node_id == config.local_node_id {
                "yes"
            } else {
                ""
            },
            format!("{:#x}", node.region_base),
            node.region_size
        );
    }
    Ok(())
}

/// Bring up the node, round-trip a local allocation, and dump statistics
pub fn run_selftest(config_path: PathBuf, size: usize, barrier: bool) -> anyhow::Result<()> {
    let runtime = pgas::init(&config_path)?;
    info!(
        "node {} of {} up, region {} bytes",
        runtime.my_node(),
        runtime.num_nodes(),
        runtime.region().len()
    );

    let ptr = runtime.alloc(size, Affinity::Local)?;
    let pattern = vec![0xAAu8; size];
    runtime.put(ptr, &pattern)?;

    let mut readback = vec![0u8; size];
    runtime.get(&mut readback, ptr)?;
    if readback != pattern {
        anyhow::bail!("self-test pattern mismatch over {} bytes", size);
    }
    runtime.free(ptr)?;
    info!("local round-trip of {} bytes ok", size);

    if barrier {
        runtime.barrier()?;
        info!("barrier complete");
    }

    let stats = runtime.stats();
    println!(
        "{}",
        serde_json::to_string_pretty(&stats).context("serialize statistics")?
    );

    runtime.finalize();
    Ok(())
}

/// Bring up the node and run one ensemble barrier
pub fn run_barrier(config_path: PathBuf) -> anyhow::Result<()> {
    let runtime = pgas::init(&config_path)?;
    runtime.barrier()?;
    info!("barrier complete on node {}", runtime.my_node());

    println!(
        "{}",
        serde_json::to_string_pretty(&runtime.stats()).context("serialize statistics")?
    );
    runtime.finalize();
    Ok(())
}

/// Sequential bandwidth and small-op latency against the local partition
///
/// Transfers `size_mb` megabytes in chunks of the installed tuning
/// profile's transfer size, then times `iterations` 8-byte put/get pairs.
pub fn run_bench(
    config_path: PathBuf,
    profile: Option<Profile>,
    size_mb: usize,
    iterations: usize,
) -> anyhow::Result<()> {
    let runtime = pgas::init(&config_path)?;
    if let Some(profile) = profile {
        runtime.load_profile(profile);
    }

    let tuning = runtime.tuning();
    let chunk_size = tuning.transfer_size.clamp(64, 8 << 20);
    let total = size_mb << 20;

    let region = runtime.alloc(total, Affinity::Local)?;
    let chunk = vec![0x5Au8; chunk_size];

    let started = std::time::Instant::now();
    let mut offset = 0usize;
    while offset < total {
        let len = chunk_size.min(total - offset);
        runtime.put(region.add(offset as u64), &chunk[..len])?;
        offset += len;
    }
    let write_secs = started.elapsed().as_secs_f64();

    let mut readback = vec![0u8; chunk_size];
    let started = std::time::Instant::now();
    let mut offset = 0usize;
    while offset < total {
        let len = chunk_size.min(total - offset);
        runtime.get(&mut readback[..len], region.add(offset as u64))?;
        offset += len;
    }
    let read_secs = started.elapsed().as_secs_f64();

    if readback.iter().take(64).any(|&b| b != 0x5A) {
        anyhow::bail!("bench readback mismatch");
    }
    runtime.free(region)?;

    let word = runtime.alloc(8, Affinity::Local)?;
    let mut put_ns = Vec::with_capacity(iterations);
    let mut get_ns = Vec::with_capacity(iterations);
    let mut bytes = [0u8; 8];
    for i in 0..iterations {
        let started = std::time::Instant::now();
        runtime.put(word, &(i as u64).to_le_bytes())?;
        put_ns.push(started.elapsed().as_nanos() as u64);

        let started = std::time::Instant::now();
        runtime.get(&mut bytes, word)?;
        get_ns.push(started.elapsed().as_nanos() as u64);
    }
    runtime.free(word)?;

    let mb = total as f64 / (1024.0 * 1024.0);
    println!("profile:        {}", profile.map_or("current", |p| p.name()));
    println!("chunk size:     {} bytes", chunk_size);
    println!("write:          {:.1} MB/s", mb / write_secs);
    println!("read:           {:.1} MB/s", mb / read_secs);
    println!("put 8B:         {}", summarize_ns(&put_ns));
    println!("get 8B:         {}", summarize_ns(&get_ns));

    runtime.finalize();
    Ok(())
}

fn summarize_ns(samples: &[u64]) -> String {
    if samples.is_empty() {
        return "no samples".to_string();
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
    let p99 = sorted[(sorted.len() * 99) / 100..][0];
    format!(
        "avg {:.2} us, min {:.2} us, p99 {:.2} us",
        avg / 1000.0,
        sorted[0] as f64 / 1000.0,
        p99 as f64 / 1000.0
    )
}

/// Print the named tuning profiles
pub fn run_profiles(json: bool) -> anyhow::Result<()> {
    if json {
        let table: Vec<(&str, Tuning)> = Profile::ALL
            .iter()
            .map(|&profile| (profile.name(), Tuning::preset(profile)))
            .collect();
        let map: serde_json::Map<String, serde_json::Value> = table
            .into_iter()
            .map(|(name, tuning)| {
                (
                    name.to_string(),
                    serde_json::to_value(tuning).expect("tuning serializes"),
                )
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&map)?);
        return Ok(());
    }

    println!(
        "{:<10} {:<12} {:>9} {:>13} {:<14} {:>7} {:>6}",
        "profile", "affinity", "batch", "transfer", "prefetch", "bw", "async"
    );
    for &profile in &Profile::ALL {
        let tuning = Tuning::preset(profile);
        println!(
            "{:<10} {:<12} {:>9} {:>13} {:<14} {:>7} {:>6}",
            profile.name(),
            format!("{:?}", tuning.affinity),
            tuning.batch_size,
            tuning.transfer_size,
            format!("{:?}", tuning.prefetch_mode),
            if tuning.bandwidth_priority { "yes" } else { "no" },
            if tuning.async_transfer { "yes" } else { "no" }
        );
    }
    Ok(())
}
