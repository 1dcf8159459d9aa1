//! Fragmentation and reassembly
//!
//! Packets larger than the MTU are split into fragments:
//!
//! ```text
//! [message_id:u32][index:u16][count:u16][len:u16][payload...]
//! ```
//!
//! The [`Defragmenter`] keeps one partial assembly per message id. Fragments
//! may arrive in any order and more than once. Once a message completes or is
//! evicted its id is retired, and any later fragment for it is dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Read;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::config::NetConfig;

/// Encoded size of a fragment header
pub const FRAGMENT_HEADER_SIZE: usize = 10;

/// Number of completed or evicted message ids remembered
const RETIRED_ID_CAPACITY: usize = 1024;

/// Fragmentation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("cannot fragment an empty payload")]
    EmptyPayload,

    #[error("payload of {size} bytes needs more than {max_fragments} fragments")]
    TooLarge { size: usize, max_fragments: u16 },

    #[error("fragment truncated")]
    Truncated,

    #[error("fragment declares a count of zero")]
    ZeroCount,

    #[error("fragment index {index} out of range for count {count}")]
    IndexOutOfRange { index: u16, count: u16 },

    #[error("fragment count {count} exceeds limit {max}")]
    TooManyFragments { count: u16, max: u16 },

    #[error("message {message_id} announced {expected} fragments, got a fragment claiming {got}")]
    CountMismatch { message_id: u32, expected: u16, got: u16 },

    #[error("message {message_id} exceeds {max} bytes")]
    MessageTooLarge { message_id: u32, max: usize },
}

/// One slice of a fragmented packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub message_id: u32,
    pub index: u16,
    pub count: u16,
    pub payload: Vec<u8>,
}

impl Fragment {
    /// Append the wire form to `out`
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.reserve(FRAGMENT_HEADER_SIZE + self.payload.len());
        // Writing into a Vec cannot fail
        let _ = out.write_u32::<LittleEndian>(self.message_id);
        let _ = out.write_u16::<LittleEndian>(self.index);
        let _ = out.write_u16::<LittleEndian>(self.count);
        let _ = out.write_u16::<LittleEndian>(self.payload.len() as u16);
        out.extend_from_slice(&self.payload);
    }

    /// Decode the wire form. Trailing bytes after the payload are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, FragmentError> {
        let mut cursor = bytes;
        let message_id = cursor.read_u32::<LittleEndian>().map_err(|_| FragmentError::Truncated)?;
        let index = cursor.read_u16::<LittleEndian>().map_err(|_| FragmentError::Truncated)?;
        let count = cursor.read_u16::<LittleEndian>().map_err(|_| FragmentError::Truncated)?;
        let len = cursor.read_u16::<LittleEndian>().map_err(|_| FragmentError::Truncated)? as usize;

        if cursor.len() != len {
            return Err(FragmentError::Truncated);
        }
        let mut payload = vec![0u8; len];
        cursor.read_exact(&mut payload).map_err(|_| FragmentError::Truncated)?;

        Ok(Self {
            message_id,
            index,
            count,
            payload,
        })
    }
}

/// Splits outgoing buffers into fragments with per-connection message ids
#[derive(Debug)]
pub struct Fragmenter {
    max_payload: usize,
    max_fragments: u16,
    next_message_id: u32,
}

impl Fragmenter {
    /// `max_payload` is the largest fragment payload; it is clamped to what
    /// the u16 length field can carry.
    pub fn new(max_payload: usize, max_fragments: u16) -> Self {
        Self {
            max_payload: max_payload.clamp(1, u16::MAX as usize),
            max_fragments,
            next_message_id: 0,
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Split `data` into ordered fragments under a fresh message id
    pub fn fragment(&mut self, data: &[u8]) -> Result<Vec<Fragment>, FragmentError> {
        if data.is_empty() {
            return Err(FragmentError::EmptyPayload);
        }

        let count = data.len().div_ceil(self.max_payload);
        if count > self.max_fragments as usize {
            return Err(FragmentError::TooLarge {
                size: data.len(),
                max_fragments: self.max_fragments,
            });
        }

        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);

        let fragments = data
            .chunks(self.max_payload)
            .enumerate()
            .map(|(index, chunk)| Fragment {
                message_id,
                index: index as u16,
                count: count as u16,
                payload: chunk.to_vec(),
            })
            .collect();

        Ok(fragments)
    }
}

/// Bounds applied by a [`Defragmenter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentLimits {
    pub max_fragments: u16,
    pub max_message_size: usize,
    pub max_pending: usize,
    pub assembly_timeout: Duration,
}

impl FragmentLimits {
    pub fn from_config(config: &NetConfig) -> Self {
        Self {
            max_fragments: config.packet.max_fragments,
            max_message_size: config.packet.max_message_size,
            max_pending: config.packet.max_pending_assemblies,
            assembly_timeout: config.timing.fragment_assembly_timeout(),
        }
    }
}

/// Partially received message
#[derive(Debug)]
struct PendingAssembly {
    slots: Vec<Option<Vec<u8>>>,
    received: u16,
    bytes: usize,
    started_at: Duration,
}

/// Ids that must not start a new assembly
#[derive(Debug, Default)]
struct RetiredIds {
    order: VecDeque<u32>,
    set: HashSet<u32>,
}

impl RetiredIds {
    fn insert(&mut self, id: u32) {
        if !self.set.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > RETIRED_ID_CAPACITY
            && let Some(oldest) = self.order.pop_front()
        {
            self.set.remove(&oldest);
        }
    }

    fn contains(&self, id: u32) -> bool {
        self.set.contains(&id)
    }
}

/// Reassembles fragments from a single sender
#[derive(Debug)]
pub struct Defragmenter {
    limits: FragmentLimits,
    pending: HashMap<u32, PendingAssembly>,
    retired: RetiredIds,
    clock: Duration,
}

impl Defragmenter {
    pub fn new(limits: FragmentLimits) -> Self {
        Self {
            limits,
            pending: HashMap::new(),
            retired: RetiredIds::default(),
            clock: Duration::ZERO,
        }
    }

    /// Number of partially received messages
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Feed one fragment. Returns the complete buffer once every index of its
    /// message has been seen.
    pub fn process(&mut self, fragment: Fragment) -> Result<Option<Vec<u8>>, FragmentError> {
        let Fragment {
            message_id,
            index,
            count,
            payload,
        } = fragment;

        if count == 0 {
            return Err(FragmentError::ZeroCount);
        }
        if index >= count {
            return Err(FragmentError::IndexOutOfRange { index, count });
        }
        if count > self.limits.max_fragments {
            return Err(FragmentError::TooManyFragments {
                count,
                max: self.limits.max_fragments,
            });
        }

        if self.retired.contains(message_id) {
            tracing::trace!(message_id, index, "Dropping fragment for retired message");
            return Ok(None);
        }

        if !self.pending.contains_key(&message_id) {
            self.make_room();
            self.pending.insert(
                message_id,
                PendingAssembly {
                    slots: vec![None; count as usize],
                    received: 0,
                    bytes: 0,
                    started_at: self.clock,
                },
            );
        }

        let Some(assembly) = self.pending.get_mut(&message_id) else {
            return Ok(None);
        };

        if assembly.slots.len() != count as usize {
            let expected = assembly.slots.len() as u16;
            self.retire(message_id);
            return Err(FragmentError::CountMismatch {
                message_id,
                expected,
                got: count,
            });
        }

        let slot = &mut assembly.slots[index as usize];
        if slot.is_some() {
            tracing::trace!(message_id, index, "Duplicate fragment ignored");
            return Ok(None);
        }

        assembly.bytes += payload.len();
        *slot = Some(payload);
        assembly.received += 1;

        if assembly.bytes > self.limits.max_message_size {
            self.retire(message_id);
            return Err(FragmentError::MessageTooLarge {
                message_id,
                max: self.limits.max_message_size,
            });
        }

        if assembly.received < count {
            return Ok(None);
        }

        let Some(assembly) = self.pending.remove(&message_id) else {
            return Ok(None);
        };
        self.retired.insert(message_id);

        let mut data = Vec::with_capacity(assembly.bytes);
        for part in assembly.slots.into_iter().flatten() {
            data.extend_from_slice(&part);
        }
        Ok(Some(data))
    }

    /// Advance the clock and evict assemblies older than the timeout
    pub fn update(&mut self, dt: Duration) {
        self.clock += dt;
        let timeout = self.limits.assembly_timeout;
        let clock = self.clock;

        let stale: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, a)| clock.saturating_sub(a.started_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        for message_id in stale {
            tracing::warn!(message_id, "Evicting stale fragment assembly");
            self.retire(message_id);
        }
    }

    /// Drop all partial assemblies
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn retire(&mut self, message_id: u32) {
        self.pending.remove(&message_id);
        self.retired.insert(message_id);
    }

    /// Evict the oldest assembly when at capacity
    fn make_room(&mut self) {
        if self.pending.len() < self.limits.max_pending {
            return;
        }
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(id, a)| (a.started_at, **id))
            .map(|(id, _)| *id);
        if let Some(message_id) = oldest {
            tracing::warn!(message_id, "Too many pending fragment assemblies, evicting oldest");
            self.retire(message_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> FragmentLimits {
        FragmentLimits {
            max_fragments: 64,
            max_message_size: 64 * 1024,
            max_pending: 4,
            assembly_timeout: Duration::from_secs(10),
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_2000_bytes_at_512_gives_four_fragments() {
        let data = payload(2000);
        let mut fragmenter = Fragmenter::new(512, 64);
        let fragments = fragmenter.fragment(&data).unwrap();

        assert_eq!(fragments.len(), 4);
        assert!(fragments.iter().all(|f| f.count == 4 && f.message_id == 0));
        assert_eq!(fragments[3].payload.len(), 2000 - 3 * 512);

        let mut defrag = Defragmenter::new(limits());
        let mut result = None;
        for fragment in fragments {
            result = defrag.process(fragment).unwrap();
        }
        assert_eq!(result, Some(data));
        assert_eq!(defrag.pending_count(), 0);
    }

    #[test]
    fn test_reassembly_any_order() {
        let data = payload(1000);
        let mut fragmenter = Fragmenter::new(100, 64);
        let fragments = fragmenter.fragment(&data).unwrap();
        assert_eq!(fragments.len(), 10);

        // Reversed, and an interleaved order
        let orders: [Vec<usize>; 3] = [
            (0..10).rev().collect(),
            vec![5, 0, 9, 1, 8, 2, 7, 3, 6, 4],
            vec![9, 8, 0, 1, 2, 3, 4, 5, 6, 7],
        ];

        for order in orders {
            let mut defrag = Defragmenter::new(limits());
            let mut completed = Vec::new();
            for &i in &order {
                if let Some(out) = defrag.process(fragments[i].clone()).unwrap() {
                    completed.push(out);
                }
            }
            assert_eq!(completed, vec![data.clone()], "order {:?}", order);
        }
    }

    #[test]
    fn test_duplicate_fragments_are_idempotent() {
        let data = payload(300);
        let mut fragmenter = Fragmenter::new(100, 64);
        let fragments = fragmenter.fragment(&data).unwrap();

        let mut defrag = Defragmenter::new(limits());
        assert_eq!(defrag.process(fragments[0].clone()).unwrap(), None);
        assert_eq!(defrag.process(fragments[0].clone()).unwrap(), None);
        assert_eq!(defrag.process(fragments[1].clone()).unwrap(), None);
        assert_eq!(defrag.process(fragments[2].clone()).unwrap(), Some(data));

        // Late duplicates of a completed message are dropped
        for fragment in fragments {
            assert_eq!(defrag.process(fragment).unwrap(), None);
        }
        assert_eq!(defrag.pending_count(), 0);
    }

    #[test]
    fn test_message_ids_are_monotonic() {
        let mut fragmenter = Fragmenter::new(10, 64);
        let a = fragmenter.fragment(&payload(25)).unwrap();
        let b = fragmenter.fragment(&payload(5)).unwrap();
        assert_eq!(a[0].message_id, 0);
        assert_eq!(b[0].message_id, 1);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_fragment_cap() {
        let mut fragmenter = Fragmenter::new(10, 4);
        assert!(fragmenter.fragment(&payload(40)).is_ok());
        assert_eq!(
            fragmenter.fragment(&payload(41)),
            Err(FragmentError::TooLarge {
                size: 41,
                max_fragments: 4
            })
        );
        assert_eq!(fragmenter.fragment(&[]), Err(FragmentError::EmptyPayload));
    }

    #[test]
    fn test_malformed_fragments() {
        let mut defrag = Defragmenter::new(limits());
        let frag = |index, count| Fragment {
            message_id: 7,
            index,
            count,
            payload: vec![1, 2, 3],
        };

        assert_eq!(defrag.process(frag(0, 0)), Err(FragmentError::ZeroCount));
        assert_eq!(
            defrag.process(frag(3, 3)),
            Err(FragmentError::IndexOutOfRange { index: 3, count: 3 })
        );
        assert_eq!(
            defrag.process(frag(0, 65)),
            Err(FragmentError::TooManyFragments { count: 65, max: 64 })
        );

        assert_eq!(defrag.process(frag(0, 3)).unwrap(), None);
        assert_eq!(
            defrag.process(frag(1, 4)),
            Err(FragmentError::CountMismatch {
                message_id: 7,
                expected: 3,
                got: 4
            })
        );
        assert_eq!(defrag.pending_count(), 0);
    }

    #[test]
    fn test_message_size_limit() {
        let mut defrag = Defragmenter::new(FragmentLimits {
            max_message_size: 150,
            ..limits()
        });
        let mut fragmenter = Fragmenter::new(100, 64);
        let fragments = fragmenter.fragment(&payload(200)).unwrap();

        assert_eq!(defrag.process(fragments[0].clone()).unwrap(), None);
        assert!(matches!(
            defrag.process(fragments[1].clone()),
            Err(FragmentError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_stale_assembly_eviction() {
        let mut defrag = Defragmenter::new(limits());
        let mut fragmenter = Fragmenter::new(10, 64);
        let fragments = fragmenter.fragment(&payload(20)).unwrap();

        defrag.process(fragments[0].clone()).unwrap();
        defrag.update(Duration::from_secs(9));
        assert_eq!(defrag.pending_count(), 1);

        defrag.update(Duration::from_secs(1));
        assert_eq!(defrag.pending_count(), 0);

        // The missing half arriving late does not resurrect the message
        assert_eq!(defrag.process(fragments[1].clone()).unwrap(), None);
        assert_eq!(defrag.pending_count(), 0);
    }

    #[test]
    fn test_pending_cap_evicts_oldest() {
        let mut defrag = Defragmenter::new(limits());
        for message_id in 0..5u32 {
            defrag
                .process(Fragment {
                    message_id,
                    index: 0,
                    count: 2,
                    payload: vec![0; 4],
                })
                .unwrap();
            defrag.update(Duration::from_millis(1));
        }
        assert_eq!(defrag.pending_count(), 4);

        // Message 0 was evicted, its second half is ignored
        let late = Fragment {
            message_id: 0,
            index: 1,
            count: 2,
            payload: vec![0; 4],
        };
        assert_eq!(defrag.process(late).unwrap(), None);
    }

    #[test]
    fn test_fragment_wire_format() {
        let fragment = Fragment {
            message_id: 0x01020304,
            index: 2,
            count: 5,
            payload: vec![0xAA, 0xBB],
        };
        let mut bytes = Vec::new();
        fragment.encode(&mut bytes);
        assert_eq!(bytes, vec![4, 3, 2, 1, 2, 0, 5, 0, 2, 0, 0xAA, 0xBB]);
        assert_eq!(Fragment::decode(&bytes).unwrap(), fragment);

        assert_eq!(Fragment::decode(&bytes[..5]), Err(FragmentError::Truncated));
        assert_eq!(Fragment::decode(&bytes[..11]), Err(FragmentError::Truncated));
    }
}
