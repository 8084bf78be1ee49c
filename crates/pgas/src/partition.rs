//! Partition Helpers - Element-to-Node Placement Math
//!
//! Owner and offset calculators for distributing a global array or key
//! space across ensemble members. Collaborators use these to place data so
//! peers can address it without an exchange step.

/// Number of elements node `node_id` holds in a block distribution of
/// `total` elements over `num_nodes` nodes
pub fn local_portion(total: usize, num_nodes: u16, node_id: u16) -> usize {
    let nodes = num_nodes as usize;
    let base = total / nodes;
    let remainder = total % nodes;
    base + usize::from((node_id as usize) < remainder)
}

/// First global index of node `node_id`'s portion in a block distribution
pub fn block_offset(total: usize, num_nodes: u16, node_id: u16) -> usize {
    let nodes = num_nodes as usize;
    let node = node_id as usize;
    let base = total / nodes;
    let remainder = total % nodes;
    if node < remainder {
        node * (base + 1)
    } else {
        remainder * (base + 1) + (node - remainder) * base
    }
}

/// Owning node of global index `index` in a block distribution
pub fn block_owner(index: usize, total: usize, num_nodes: u16) -> u16 {
    let nodes = num_nodes as usize;
    let base = total / nodes;
    let remainder = total % nodes;
    let threshold = remainder * (base + 1);

    if index < threshold {
        (index / (base + 1)) as u16
    } else if base == 0 {
        // Fewer elements than nodes: everything past the populated prefix
        // belongs to the last populated node
        remainder.saturating_sub(1) as u16
    } else {
        (remainder + (index - threshold) / base) as u16
    }
}

/// Owning node of global index `index` in a cyclic distribution
pub fn cyclic_owner(index: usize, num_nodes: u16) -> u16 {
    (index % num_nodes as usize) as u16
}

/// Owning node of a key in a hash distribution (FNV-1a)
pub fn hash_owner(key: &[u8], num_nodes: u16) -> u16 {
    const FNV_OFFSET: u64 = 14_695_981_039_346_656_037;
    const FNV_PRIME: u64 = 1_099_511_628_211;

    let mut hash = FNV_OFFSET;
    for &byte in key {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % u64::from(num_nodes)) as u16
}
