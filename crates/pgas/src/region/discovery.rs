//! Backing-Device Discovery
//!
//! Enumerates byte-addressable memory devices the region provider can map:
//! device-DAX character devices under `/dev`, with size and NUMA binding
//! read from `/sys/bus/dax/devices`, and memory devices on the CXL bus.

use std::path::{Path, PathBuf};

/// A device-DAX entry found under `/dev`
#[derive(Debug, Clone)]
pub struct DaxDevice {
    /// Character device path, e.g. `/dev/dax0.0`
    pub path: PathBuf,
    /// Size reported by sysfs, or a 1 GiB default when sysfs is absent
    pub size: u64,
    /// NUMA node binding, 0 when unknown
    pub numa_node: i32,
}

/// Enumerate device-DAX entries, sorted by device name
pub fn enumerate_dax() -> Vec<DaxDevice> {
    enumerate_dax_in(Path::new("/dev"), Path::new("/sys/bus/dax/devices"))
}

fn enumerate_dax_in(dev_dir: &Path, sysfs_dir: &Path) -> Vec<DaxDevice> {
    let mut devices = Vec::new();

    let entries = match std::fs::read_dir(dev_dir) {
        Ok(entries) => entries,
        Err(_) => return devices,
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("dax") {
            continue;
        }

        let sys = sysfs_dir.join(name.as_ref());
        let size = read_sysfs_u64(&sys.join("size")).unwrap_or(1 << 30);
        let numa_node = read_sysfs_u64(&sys.join("numa_node"))
            .map(|n| n as i32)
            .unwrap_or(0);

        devices.push(DaxDevice {
            path: entry.path(),
            size,
            numa_node,
        });
    }

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    devices
}

/// Total size of the first memory device on the CXL bus, if any
pub fn cxl_bus_size() -> Option<u64> {
    cxl_bus_size_in(Path::new("/sys/bus/cxl/devices"))
}

fn cxl_bus_size_in(bus_dir: &Path) -> Option<u64> {
    let entries = std::fs::read_dir(bus_dir).ok()?;

    let mut mems: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("mem"))
        .map(|e| e.path())
        .collect();
    mems.sort();

    mems.first()
        .and_then(|path| read_sysfs_u64(&path.join("size")))
}

fn read_sysfs_u64(path: &Path) -> Option<u64> {
    let text = std::fs::read_to_string(path).ok()?;
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}
