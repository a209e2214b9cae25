//! Hash slot primitives: CRC16 key hashing, per-node slot bitmaps, and the
//! cluster-wide slot assignment table.
//!
//! Keys map onto 16384 slots via CRC16 (XMODEM polynomial) of the key, or of
//! the hash tag between the first `{` and the following `}` when present and
//! non-empty.

use crate::NodeId;

/// Total number of hash slots in the cluster.
pub const SLOT_COUNT: u16 = 16384;

/// Bytes in a slot bitmap (one bit per slot).
pub const SLOT_BITMAP_LEN: usize = SLOT_COUNT as usize / 8;

/// CRC16 lookup table (CCITT/XMODEM polynomial).
#[rustfmt::skip]
static CRC16_TABLE: [u16; 256] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50a5, 0x60c6, 0x70e7,
    0x8108, 0x9129, 0xa14a, 0xb16b, 0xc18c, 0xd1ad, 0xe1ce, 0xf1ef,
    0x1231, 0x0210, 0x3273, 0x2252, 0x52b5, 0x4294, 0x72f7, 0x62d6,
    0x9339, 0x8318, 0xb37b, 0xa35a, 0xd3bd, 0xc39c, 0xf3ff, 0xe3de,
    0x2462, 0x3443, 0x0420, 0x1401, 0x64e6, 0x74c7, 0x44a4, 0x5485,
    0xa56a, 0xb54b, 0x8528, 0x9509, 0xe5ee, 0xf5cf, 0xc5ac, 0xd58d,
    0x3653, 0x2672, 0x1611, 0x0630, 0x76d7, 0x66f6, 0x5695, 0x46b4,
    0xb75b, 0xa77a, 0x9719, 0x8738, 0xf7df, 0xe7fe, 0xd79d, 0xc7bc,
    0x48c4, 0x58e5, 0x6886, 0x78a7, 0x0840, 0x1861, 0x2802, 0x3823,
    0xc9cc, 0xd9ed, 0xe98e, 0xf9af, 0x8948, 0x9969, 0xa90a, 0xb92b,
    0x5af5, 0x4ad4, 0x7ab7, 0x6a96, 0x1a71, 0x0a50, 0x3a33, 0x2a12,
    0xdbfd, 0xcbdc, 0xfbbf, 0xeb9e, 0x9b79, 0x8b58, 0xbb3b, 0xab1a,
    0x6ca6, 0x7c87, 0x4ce4, 0x5cc5, 0x2c22, 0x3c03, 0x0c60, 0x1c41,
    0xedae, 0xfd8f, 0xcdec, 0xddcd, 0xad2a, 0xbd0b, 0x8d68, 0x9d49,
    0x7e97, 0x6eb6, 0x5ed5, 0x4ef4, 0x3e13, 0x2e32, 0x1e51, 0x0e70,
    0xff9f, 0xefbe, 0xdfdd, 0xcffc, 0xbf1b, 0xaf3a, 0x9f59, 0x8f78,
    0x9188, 0x81a9, 0xb1ca, 0xa1eb, 0xd10c, 0xc12d, 0xf14e, 0xe16f,
    0x1080, 0x00a1, 0x30c2, 0x20e3, 0x5004, 0x4025, 0x7046, 0x6067,
    0x83b9, 0x9398, 0xa3fb, 0xb3da, 0xc33d, 0xd31c, 0xe37f, 0xf35e,
    0x02b1, 0x1290, 0x22f3, 0x32d2, 0x4235, 0x5214, 0x6277, 0x7256,
    0xb5ea, 0xa5cb, 0x95a8, 0x8589, 0xf56e, 0xe54f, 0xd52c, 0xc50d,
    0x34e2, 0x24c3, 0x14a0, 0x0481, 0x7466, 0x6447, 0x5424, 0x4405,
    0xa7db, 0xb7fa, 0x8799, 0x97b8, 0xe75f, 0xf77e, 0xc71d, 0xd73c,
    0x26d3, 0x36f2, 0x0691, 0x16b0, 0x6657, 0x7676, 0x4615, 0x5634,
    0xd94c, 0xc96d, 0xf90e, 0xe92f, 0x99c8, 0x89e9, 0xb98a, 0xa9ab,
    0x5844, 0x4865, 0x7806, 0x6827, 0x18c0, 0x08e1, 0x3882, 0x28a3,
    0xcb7d, 0xdb5c, 0xeb3f, 0xfb1e, 0x8bf9, 0x9bd8, 0xabbb, 0xbb9a,
    0x4a75, 0x5a54, 0x6a37, 0x7a16, 0x0af1, 0x1ad0, 0x2ab3, 0x3a92,
    0xfd2e, 0xed0f, 0xdd6c, 0xcd4d, 0xbdaa, 0xad8b, 0x9de8, 0x8dc9,
    0x7c26, 0x6c07, 0x5c64, 0x4c45, 0x3ca2, 0x2c83, 0x1ce0, 0x0cc1,
    0xef1f, 0xff3e, 0xcf5d, 0xdf7c, 0xaf9b, 0xbfba, 0x8fd9, 0x9ff8,
    0x6e17, 0x7e36, 0x4e55, 0x5e74, 0x2e93, 0x3eb2, 0x0ed1, 0x1ef0,
];

fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        let idx = ((crc >> 8) ^ (byte as u16)) as usize;
        crc = (crc << 8) ^ CRC16_TABLE[idx];
    }
    crc
}

/// Extracts the hashable portion of a key, honoring hash tags.
///
/// The tag is the content between the first `{` and the first `}` after it.
/// An empty tag (`foo{}bar`) or a missing closing brace means the whole key
/// is hashed, so related keys can be pinned to one slot with e.g.
/// `user:{42}:name` / `user:{42}:email`.
fn effective_key(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    let after_open = &key[open + 1..];
    let Some(close) = after_open.iter().position(|&b| b == b'}') else {
        return key;
    };
    if close == 0 {
        return key;
    }
    &after_open[..close]
}

/// Computes the hash slot for a key. Result is in `[0, 16383]`.
pub fn key_slot(key: &[u8]) -> u16 {
    crc16(effective_key(key)) % SLOT_COUNT
}

/// A contiguous inclusive range of slots, used for compact display and for
/// the persisted snapshot format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    /// Creates a range with runtime validation, for untrusted input.
    pub fn try_new(start: u16, end: u16) -> Result<Self, std::io::Error> {
        if start > end {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("slot range requires start <= end, got {start}..{end}"),
            ));
        }
        if end >= SLOT_COUNT {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("slot {end} out of range (max {})", SLOT_COUNT - 1),
            ));
        }
        Ok(Self { start, end })
    }

    /// Returns an iterator over all slots in this range.
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// The set of slots a node claims to serve: 16384 bits plus a cached
/// popcount so quorum math never rescans the bitmap.
#[derive(Clone, PartialEq, Eq)]
pub struct SlotBitmap {
    bits: Box<[u8; SLOT_BITMAP_LEN]>,
    count: u16,
}

impl Default for SlotBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotBitmap {
    /// Creates an empty bitmap.
    pub fn new() -> Self {
        Self {
            bits: Box::new([0u8; SLOT_BITMAP_LEN]),
            count: 0,
        }
    }

    /// Reconstructs a bitmap from raw wire bytes, recomputing the popcount.
    pub fn from_raw(raw: [u8; SLOT_BITMAP_LEN]) -> Self {
        let count = raw.iter().map(|b| b.count_ones() as u16).sum();
        Self {
            bits: Box::new(raw),
            count,
        }
    }

    /// The raw bitmap bytes, as carried in every bus header.
    pub fn as_raw(&self) -> &[u8; SLOT_BITMAP_LEN] {
        &self.bits
    }

    /// Tests a slot bit.
    pub fn get(&self, slot: u16) -> bool {
        let (byte, bit) = (slot as usize / 8, slot & 7);
        self.bits[byte] & (1 << bit) != 0
    }

    /// Sets a slot bit, returning the previous value.
    pub fn set(&mut self, slot: u16) -> bool {
        let old = self.get(slot);
        let (byte, bit) = (slot as usize / 8, slot & 7);
        self.bits[byte] |= 1 << bit;
        if !old {
            self.count += 1;
        }
        old
    }

    /// Clears a slot bit, returning the previous value.
    pub fn clear(&mut self, slot: u16) -> bool {
        let old = self.get(slot);
        let (byte, bit) = (slot as usize / 8, slot & 7);
        self.bits[byte] &= !(1 << bit);
        if old {
            self.count -= 1;
        }
        old
    }

    /// Number of slots set. Kept in lockstep with the bits.
    pub fn count(&self) -> u16 {
        self.count
    }

    /// True when no slot is set.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Iterates over the set slots in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..SLOT_COUNT).filter(|&s| self.get(s))
    }

    /// Compacts the set slots into inclusive ranges for display and the
    /// persisted snapshot.
    pub fn ranges(&self) -> Vec<SlotRange> {
        let mut ranges = Vec::new();
        let mut start: Option<u16> = None;
        for slot in 0..SLOT_COUNT {
            match (self.get(slot), start) {
                (true, None) => start = Some(slot),
                (false, Some(s)) => {
                    ranges.push(SlotRange { start: s, end: slot - 1 });
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            ranges.push(SlotRange {
                start: s,
                end: SLOT_COUNT - 1,
            });
        }
        ranges
    }
}

impl std::fmt::Debug for SlotBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SlotBitmap({} slots)", self.count)
    }
}

/// The cluster-wide slot assignment table: for every slot, the owning node
/// plus the resharding pointers.
///
/// `migrating_to[s]` is only ever set on the node that owns `s`;
/// `importing_from[s]` only on the node receiving it. At most one of the two
/// is set per slot on any given node.
pub struct SlotMap {
    owner: Box<[Option<NodeId>]>,
    migrating_to: Box<[Option<NodeId>]>,
    importing_from: Box<[Option<NodeId>]>,
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotMap {
    /// Creates an empty table with no assignments.
    pub fn new() -> Self {
        Self {
            owner: vec![None; SLOT_COUNT as usize].into_boxed_slice(),
            migrating_to: vec![None; SLOT_COUNT as usize].into_boxed_slice(),
            importing_from: vec![None; SLOT_COUNT as usize].into_boxed_slice(),
        }
    }

    pub fn owner(&self, slot: u16) -> Option<NodeId> {
        self.owner[slot as usize]
    }

    pub fn set_owner(&mut self, slot: u16, node: Option<NodeId>) {
        self.owner[slot as usize] = node;
    }

    pub fn migrating_to(&self, slot: u16) -> Option<NodeId> {
        self.migrating_to[slot as usize]
    }

    pub fn set_migrating_to(&mut self, slot: u16, node: Option<NodeId>) {
        self.migrating_to[slot as usize] = node;
    }

    pub fn importing_from(&self, slot: u16) -> Option<NodeId> {
        self.importing_from[slot as usize]
    }

    pub fn set_importing_from(&mut self, slot: u16, node: Option<NodeId>) {
        self.importing_from[slot as usize] = node;
    }

    /// Clears every migrating/importing pointer. Used at init, on reset and
    /// when a master demotes to replica.
    pub fn close_all(&mut self) {
        self.migrating_to.fill(None);
        self.importing_from.fill(None);
    }

    /// Drops every reference to `node` from the table, unassigning its
    /// owned slots and clearing any reshard pointers at it.
    pub fn purge_node(&mut self, node: NodeId) {
        for slot in 0..SLOT_COUNT as usize {
            if self.owner[slot] == Some(node) {
                self.owner[slot] = None;
            }
            if self.migrating_to[slot] == Some(node) {
                self.migrating_to[slot] = None;
            }
            if self.importing_from[slot] == Some(node) {
                self.importing_from[slot] = None;
            }
        }
    }
}
