//! Global Pointer - Ensemble-Wide Addressing
//!
//! A [`GlobalPtr`] names a byte in the partitioned address space: the owning
//! node, a segment on that node, access flags, and a byte offset within the
//! segment. It is a plain 16-byte value, freely copyable, and holds no
//! resource; the bytes it names live as long as the owning allocation on the
//! owning node.
//!
//! The distinguished null value has `node_id == segment_id == 0xFFFF`.

/// Node id used by the null pointer sentinel
pub const NULL_NODE: u16 = 0xFFFF;

/// A location in the ensemble-wide address space
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalPtr {
    /// Owning node
    pub node_id: u16,
    /// Segment within the owning node
    pub segment_id: u16,
    /// Access flags (reserved, carried verbatim on the wire)
    pub flags: u32,
    /// Byte offset within the segment
    pub offset: u64,
}

impl GlobalPtr {
    /// The null pointer
    pub const NULL: GlobalPtr = GlobalPtr {
        node_id: NULL_NODE,
        segment_id: NULL_NODE,
        flags: 0,
        offset: 0,
    };

    /// Construct a pointer into a node's default segment
    pub fn new(node_id: u16, offset: u64) -> Self {
        Self {
            node_id,
            segment_id: 0,
            flags: 0,
            offset,
        }
    }

    /// The null pointer
    pub fn null() -> Self {
        Self::NULL
    }

    /// Check for the null sentinel
    pub fn is_null(&self) -> bool {
        self.node_id == NULL_NODE && self.segment_id == NULL_NODE
    }

    /// Owning node id
    pub fn node(&self) -> u16 {
        self.node_id
    }

    /// Pointer arithmetic: advance the offset, leaving all other fields intact
    #[must_use]
    pub fn add(&self, bytes: u64) -> Self {
        Self {
            offset: self.offset + bytes,
            ..*self
        }
    }
}

impl Default for GlobalPtr {
    fn default() -> Self {
        Self::NULL
    }
}

impl std::fmt::Display for GlobalPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "<null>")
        } else {
            write!(f, "{}:{}+{:#x}", self.node_id, self.segment_id, self.offset)
        }
    }
}
