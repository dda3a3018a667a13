// Split/reassemble payloads larger than the MTU budget (spec §4.4).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::wire::{
    encode_header, MessageHeader, FRAGMENT_EXTRA_LEN, MSG_FRAGMENT,
};

/// Splits an already-encoded (unfragmented) message into fragment
/// datagrams, each carrying the original header plus `update_number` and
/// `updates` (reused as fragment count), per §4.4.
pub fn split(header: &MessageHeader, body: &[u8], max_fragment_size: usize) -> Vec<Vec<u8>> {
    let base_len = header.header_len();
    let budget = max_fragment_size.saturating_sub(base_len + FRAGMENT_EXTRA_LEN).max(1);
    let chunks: Vec<&[u8]> = body.chunks(budget).collect();
    let count = chunks.len().max(1) as u32;

    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut h = header.clone();
            h.msg_type |= MSG_FRAGMENT;
            h.fragment_index = i as u32;
            h.fragment_count = count;
            h.size = (base_len + FRAGMENT_EXTRA_LEN + chunk.len()) as u64;
            let mut buf = encode_header(&h);
            buf.extend_from_slice(chunk);
            buf
        })
        .collect()
}

/// Identifies a single logical message being reassembled: fragments share
/// (originator, clock, timestamp) per §4.4.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ReassemblyKey {
    pub originator: String,
    pub clock: u64,
    pub timestamp: u64,
}

struct PendingMessage {
    total: u32,
    parts: HashMap<u32, Vec<u8>>,
    header: MessageHeader,
    first_seen: Instant,
}

/// Accumulates fragments until a message is complete or its reassembly
/// window expires (Open Question Q3: default window is `2 *
/// max_round_trip`, capped at 10s; we take `max_round_trip` as a
/// caller-supplied estimate and fall back to a flat 10s when none is
/// given, since the spec names only the cap as a concrete number).
pub struct Reassembler {
    window: Duration,
    pending: HashMap<ReassemblyKey, PendingMessage>,
}

impl Reassembler {
    pub fn new(window: Duration) -> Self {
        Reassembler {
            window,
            pending: HashMap::new(),
        }
    }

    pub fn with_default_window() -> Self {
        Reassembler::new(Duration::from_secs(10))
    }

    fn evict_expired(&mut self) {
        let window = self.window;
        let now = Instant::now();
        self.pending.retain(|_, m| now.duration_since(m.first_seen) <= window);
    }

    /// Feeds one fragment in. Returns `Some((header, reassembled_payload))`
    /// once every fragment for its key has arrived; duplicate fragments
    /// are idempotent (re-inserting the same index is a no-op on the
    /// resulting bytes).
    pub fn insert(
        &mut self,
        header: MessageHeader,
        payload: Vec<u8>,
    ) -> Option<(MessageHeader, Vec<u8>)> {
        self.evict_expired();
        let key = ReassemblyKey {
            originator: header.originator.clone(),
            clock: header.clock,
            timestamp: header.timestamp,
        };
        let entry = self.pending.entry(key.clone()).or_insert_with(|| PendingMessage {
            total: header.fragment_count,
            parts: HashMap::new(),
            header: header.clone(),
            first_seen: Instant::now(),
        });
        entry.parts.entry(header.fragment_index).or_insert(payload);

        if entry.parts.len() as u32 >= entry.total {
            let mut out = Vec::new();
            for i in 0..entry.total {
                out.extend_from_slice(entry.parts.get(&i)?);
            }
            let header = entry.header.clone();
            self.pending.remove(&key);
            Some((header, out))
        } else {
            None
        }
    }

    /// Number of messages still awaiting completion; exposed for tests
    /// and diagnostics.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::decode_header;

    fn header() -> MessageHeader {
        MessageHeader {
            size: 0,
            domain: "realm".into(),
            originator: "host:1".into(),
            msg_type: 0,
            updates: 0,
            quality: 0,
            clock: 5,
            timestamp: 99,
            ttl: 1,
            reduced: false,
            fragment_index: 0,
            fragment_count: 0,
        }
    }

    #[test]
    fn s3_splits_4096_bytes_at_1000_into_five_fragments() {
        let body = vec![b'x'; 4096];
        let datagrams = split(&header(), &body, 1000);
        assert_eq!(datagrams.len(), 5);

        let mut reassembler = Reassembler::with_default_window();
        let mut result = None;
        for datagram in &datagrams {
            let (h, consumed) = decode_header(datagram, "realm").unwrap();
            let payload = datagram[consumed..].to_vec();
            result = reassembler.insert(h, payload);
        }
        let (_, payload) = result.unwrap();
        assert_eq!(payload, body);
    }

    #[test]
    fn duplicate_fragment_is_idempotent() {
        let body = vec![1u8, 2, 3, 4, 5, 6];
        let datagrams = split(&header(), &body, 4 + FRAGMENT_EXTRA_LEN + header().header_len());
        assert!(datagrams.len() >= 2);
        let mut reassembler = Reassembler::with_default_window();
        let (h0, off0) = decode_header(&datagrams[0], "realm").unwrap();
        let payload0 = datagrams[0][off0..].to_vec();
        assert!(reassembler.insert(h0.clone(), payload0.clone()).is_none());
        assert!(reassembler.insert(h0, payload0).is_none()); // duplicate, still incomplete
        assert_eq!(reassembler.pending_count(), 1);
    }

    #[test]
    fn expired_window_drops_partial_set() {
        let mut reassembler = Reassembler::new(Duration::from_millis(1));
        let body = vec![0u8; 10];
        let datagrams = split(&header(), &body, 4 + FRAGMENT_EXTRA_LEN + header().header_len());
        let (h0, off0) = decode_header(&datagrams[0], "realm").unwrap();
        reassembler.insert(h0, datagrams[0][off0..].to_vec());
        std::thread::sleep(Duration::from_millis(5));
        reassembler.evict_expired();
        assert_eq!(reassembler.pending_count(), 0);
    }
}
