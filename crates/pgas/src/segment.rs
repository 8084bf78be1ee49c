//! Segments - Per-Node Region Metadata and Address Translation
//!
//! Every process instantiates one segment per ensemble member. Only the
//! segment owned by the local node is mapped and therefore translatable in
//! this process; remote segments exist as routing metadata.

use crate::config::ClusterConfig;
use crate::error::{PgasError, Result};
use crate::ptr::GlobalPtr;
use crate::region::SharedRegion;
use crate::tuning::Affinity;

/// One node's share of the global address space as seen by this process
#[derive(Debug, Clone)]
pub struct Segment {
    /// Base address: the local mapping's base for the owned segment, the
    /// configured advertised base for remote ones
    pub base_addr: u64,
    pub size: u64,
    pub owner_node: u16,
    pub affinity: Affinity,
    pub is_mapped: bool,
    pub is_shared: bool,
}

/// The per-process segment table
#[derive(Debug)]
pub struct SegmentTable {
    segments: Vec<Segment>,
    local_node: u16,
}

impl SegmentTable {
    /// Build the table from the ensemble configuration and the local region
    ///
    /// The local entry takes its base from the region actually mapped in
    /// this process rather than the advertised configuration value.
    pub fn new(config: &ClusterConfig, region: &SharedRegion) -> Self {
        let segments = config
            .nodes
            .iter()
            .map(|node| {
                let local = node.node_id == config.local_node_id;
                Segment {
                    base_addr: if local {
                        region.base() as u64
                    } else {
                        node.region_base
                    },
                    size: if local {
                        region.len() as u64
                    } else {
                        node.region_size
                    },
                    owner_node: node.node_id,
                    affinity: Affinity::Local,
                    is_mapped: local,
                    is_shared: true,
                }
            })
            .collect();

        Self {
            segments,
            local_node: config.local_node_id,
        }
    }

    pub fn get(&self, node_id: u16) -> Option<&Segment> {
        self.segments.get(node_id as usize)
    }

    pub fn local(&self) -> &Segment {
        &self.segments[self.local_node as usize]
    }

    /// Check whether a pointer belongs to the local node
    pub fn is_local(&self, ptr: GlobalPtr) -> bool {
        ptr.node_id == self.local_node
    }

    /// Translate a local pointer to a host address
    ///
    /// Returns an error for remote pointers and for offsets that fall
    /// outside the mapped region; callers never forward the remote case
    /// here.
    pub fn translate(&self, ptr: GlobalPtr) -> Result<usize> {
        self.translate_range(ptr, 0)
    }

    /// Translate a local pointer, additionally bounds-checking `len` bytes
    pub fn translate_range(&self, ptr: GlobalPtr, len: usize) -> Result<usize> {
        if ptr.is_null() || !self.is_local(ptr) {
            return Err(PgasError::Translate {
                node_id: ptr.node_id,
                offset: ptr.offset,
            });
        }

        let segment = self.local();
        let end = ptr
            .offset
            .checked_add(len as u64)
            .ok_or(PgasError::Translate {
                node_id: ptr.node_id,
                offset: ptr.offset,
            })?;
        if end > segment.size || ptr.offset >= segment.size {
            return Err(PgasError::Translate {
                node_id: ptr.node_id,
                offset: ptr.offset,
            });
        }

        Ok(segment.base_addr as usize + ptr.offset as usize)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use std::sync::Arc;

    fn table() -> (SegmentTable, Arc<SharedRegion>) {
        let region = Arc::new(SharedRegion::open(1 << 16).unwrap());
        let config = ClusterConfig {
            local_node_id: 0,
            num_nodes: 2,
            nodes: vec![
                NodeConfig {
                    node_id: 0,
                    hostname: "127.0.0.1".to_string(),
                    port: 9000,
                    region_base: 0,
                    region_size: 1 << 16,
                },
                NodeConfig {
                    node_id: 1,
                    hostname: "127.0.0.1".to_string(),
                    port: 9001,
                    region_base: 0x4000_0000,
                    region_size: 1 << 20,
                },
            ],
            connect_retries: 1,
            connect_timeout: std::time::Duration::from_millis(100),
        };
        (SegmentTable::new(&config, &region), region)
    }

    #[test]
    fn test_only_local_segment_mapped() {
        let (table, region) = table();
        assert_eq!(table.len(), 2);
        assert!(table.get(0).unwrap().is_mapped);
        assert!(!table.get(1).unwrap().is_mapped);
        assert_eq!(table.local().base_addr, region.base() as u64);
        assert_eq!(table.get(1).unwrap().base_addr, 0x4000_0000);
    }

    #[test]
    fn test_translate_local() {
        let (table, region) = table();
        let ptr = GlobalPtr::new(0, 128);
        assert_eq!(table.translate(ptr).unwrap(), region.base() + 128);
    }

    #[test]
    fn test_translate_rejects_remote_and_null() {
        let (table, _region) = table();
        assert!(table.translate(GlobalPtr::new(1, 0)).is_err());
        assert!(table.translate(GlobalPtr::null()).is_err());
        assert!(!table.is_local(GlobalPtr::new(1, 0)));
    }

    #[test]
    fn test_translate_bounds() {
        let (table, _region) = table();
        let size = table.local().size;
        assert!(table.translate_range(GlobalPtr::new(0, size - 8), 8).is_ok());
        assert!(table.translate_range(GlobalPtr::new(0, size - 8), 9).is_err());
        assert!(table.translate(GlobalPtr::new(0, size)).is_err());
        assert!(table
            .translate_range(GlobalPtr::new(0, u64::MAX), 16)
            .is_err());
    }
}
