// Binary framing for the replication wire protocol (spec §4.4). All
// integers are big-endian regardless of host byte order.

use std::sync::Arc;

use madara_base::{err, Result};
use madara_lang::{FileType, Record, RecordTypeTag, RecordValue};

pub const MADARA_MAGIC: [u8; 8] = *b"KaRL1.3\0";
pub const DOMAIN_LEN: usize = 32;
pub const ORIGINATOR_LEN: usize = 64;

pub const MSG_MULTIASSIGN: u32 = 2;
pub const MSG_REGISTER: u32 = 8;
pub const MSG_FRAGMENT: u32 = 16;
pub const MSG_REFRAGMENT: u32 = 32;

/// Full header: `size + madara_id + domain + originator + type + updates +
/// quality + clock + timestamp + ttl`.
pub const FULL_HEADER_LEN: usize = 8 + 8 + DOMAIN_LEN + ORIGINATOR_LEN + 4 + 4 + 4 + 8 + 8 + 1;
/// Reduced header: `size + madara_id + type + updates + quality + clock +
/// timestamp + ttl` (domain/originator omitted, spec §4.4).
pub const REDUCED_HEADER_LEN: usize = 8 + 8 + 4 + 4 + 4 + 8 + 8 + 1;
/// Two extra `u32` fields precede the payload on a fragment: `update_number`
/// and `updates` (reused as total fragment count).
pub const FRAGMENT_EXTRA_LEN: usize = 4 + 4;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageHeader {
    pub size: u64,
    pub domain: String,
    pub originator: String,
    pub msg_type: u32,
    pub updates: u32,
    pub quality: u32,
    pub clock: u64,
    pub timestamp: u64,
    pub ttl: u8,
    pub reduced: bool,
    /// Only meaningful when `msg_type & MSG_FRAGMENT != 0`.
    pub fragment_index: u32,
    pub fragment_count: u32,
}

impl MessageHeader {
    pub fn is_fragment(&self) -> bool {
        self.msg_type & MSG_FRAGMENT != 0
    }

    pub fn header_len(&self) -> usize {
        let base = if self.reduced {
            REDUCED_HEADER_LEN
        } else {
            FULL_HEADER_LEN
        };
        if self.is_fragment() {
            base + FRAGMENT_EXTRA_LEN
        } else {
            base
        }
    }
}

fn write_fixed(buf: &mut Vec<u8>, s: &str, len: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    buf.extend_from_slice(&bytes[..n]);
    buf.resize(buf.len() + (len - n), 0);
}

fn read_fixed(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Encodes the message header. `header.size` is expected to already be the
/// final total message length (header + all records); callers compute it
/// before calling this.
pub fn encode_header(header: &MessageHeader) -> Vec<u8> {
    let mut buf = Vec::with_capacity(header.header_len());
    buf.extend_from_slice(&header.size.to_be_bytes());
    buf.extend_from_slice(&MADARA_MAGIC);
    if !header.reduced {
        write_fixed(&mut buf, &header.domain, DOMAIN_LEN);
        write_fixed(&mut buf, &header.originator, ORIGINATOR_LEN);
    }
    buf.extend_from_slice(&header.msg_type.to_be_bytes());
    buf.extend_from_slice(&header.updates.to_be_bytes());
    buf.extend_from_slice(&header.quality.to_be_bytes());
    buf.extend_from_slice(&header.clock.to_be_bytes());
    buf.extend_from_slice(&header.timestamp.to_be_bytes());
    buf.push(header.ttl);
    if header.is_fragment() {
        buf.extend_from_slice(&header.fragment_index.to_be_bytes());
        buf.extend_from_slice(&header.fragment_count.to_be_bytes());
    }
    buf
}

/// Decodes a header, auto-detecting full vs. reduced form from the
/// position of the `madara_id` magic. Returns the header and the number of
/// bytes it consumed. Callers must check `madara_id`/`domain` match
/// expectations themselves and drop the datagram otherwise (spec §4.5
/// receive pipeline step 2).
pub fn decode_header(buf: &[u8], expected_domain: &str) -> Result<(MessageHeader, usize)> {
    if buf.len() < 16 {
        return Err(err("datagram shorter than size+magic"));
    }
    let size = u64::from_be_bytes(buf[0..8].try_into().unwrap());
    let magic: [u8; 8] = buf[8..16].try_into().unwrap();
    if magic != MADARA_MAGIC {
        return Err(err("madara_id magic mismatch"));
    }

    // Try full header first; if the domain field, once read, doesn't match
    // and the buffer is also long enough to be a reduced header whose
    // would-be type field looks sane, prefer whichever layout the caller's
    // expected_domain confirms. In practice callers configure a transport
    // for one layout; we decide by length plus a domain-match heuristic.
    let try_full = |buf: &[u8]| -> Option<(MessageHeader, usize)> {
        if buf.len() < FULL_HEADER_LEN {
            return None;
        }
        let domain = read_fixed(&buf[16..16 + DOMAIN_LEN]);
        let originator = read_fixed(&buf[16 + DOMAIN_LEN..16 + DOMAIN_LEN + ORIGINATOR_LEN]);
        let mut off = 16 + DOMAIN_LEN + ORIGINATOR_LEN;
        let msg_type = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let updates = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let quality = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let clock = u64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let timestamp = u64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let ttl = buf[off];
        off += 1;
        let mut header = MessageHeader {
            size,
            domain,
            originator,
            msg_type,
            updates,
            quality,
            clock,
            timestamp,
            ttl,
            reduced: false,
            fragment_index: 0,
            fragment_count: 0,
        };
        if header.is_fragment() {
            if buf.len() < off + FRAGMENT_EXTRA_LEN {
                return None;
            }
            header.fragment_index = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
            off += 4;
            header.fragment_count = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
            off += 4;
        }
        Some((header, off))
    };

    if let Some((header, consumed)) = try_full(buf) {
        if header.domain == expected_domain || expected_domain.is_empty() {
            return Ok((header, consumed));
        }
    }

    // Fall back to the reduced layout.
    if buf.len() < REDUCED_HEADER_LEN {
        return Err(err("datagram too short for any known header layout"));
    }
    let mut off = 16;
    let msg_type = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
    off += 4;
    let updates = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
    off += 4;
    let quality = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
    off += 4;
    let clock = u64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
    off += 8;
    let timestamp = u64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
    off += 8;
    let ttl = buf[off];
    off += 1;
    let mut header = MessageHeader {
        size,
        domain: expected_domain.to_string(),
        originator: String::new(),
        msg_type,
        updates,
        quality,
        clock,
        timestamp,
        ttl,
        reduced: true,
        fragment_index: 0,
        fragment_count: 0,
    };
    if header.is_fragment() {
        if buf.len() < off + FRAGMENT_EXTRA_LEN {
            return Err(err("truncated fragment header"));
        }
        header.fragment_index = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        header.fragment_count = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
    }
    Ok((header, off))
}

/// Per-record framing: `key_length:u32, key:utf8[key_length]
/// (NUL-terminated), type:u32, value_size:u32, payload`.
pub fn encode_record(key: &str, record: &Record) -> Vec<u8> {
    let mut buf = Vec::new();
    let key_bytes = key.as_bytes();
    let key_len = (key_bytes.len() + 1) as u32; // counts the NUL terminator
    buf.extend_from_slice(&key_len.to_be_bytes());
    buf.extend_from_slice(key_bytes);
    buf.push(0);
    buf.extend_from_slice(&(record.value.type_tag() as u32).to_be_bytes());

    match &record.value {
        RecordValue::Integer(i) => {
            buf.extend_from_slice(&1u32.to_be_bytes());
            buf.extend_from_slice(&i.to_be_bytes());
        }
        RecordValue::Double(d) => {
            buf.extend_from_slice(&1u32.to_be_bytes());
            buf.extend_from_slice(&d.0.to_bits().to_be_bytes());
        }
        RecordValue::Text(s) => {
            let bytes = s.as_bytes();
            buf.extend_from_slice(&((bytes.len() + 1) as u32).to_be_bytes());
            buf.extend_from_slice(bytes);
            buf.push(0);
        }
        RecordValue::IntegerArray(a) => {
            buf.extend_from_slice(&(a.len() as u32).to_be_bytes());
            for i in a.iter() {
                buf.extend_from_slice(&i.to_be_bytes());
            }
        }
        RecordValue::DoubleArray(a) => {
            buf.extend_from_slice(&(a.len() as u32).to_be_bytes());
            for d in a.iter() {
                buf.extend_from_slice(&d.0.to_bits().to_be_bytes());
            }
        }
        RecordValue::Blob(b) => {
            buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
            buf.extend_from_slice(b);
        }
        RecordValue::File(_, b) => {
            buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
            buf.extend_from_slice(b);
        }
        RecordValue::Any(tag, b) => {
            let tag_bytes = tag.as_bytes();
            let mut payload = Vec::with_capacity(4 + tag_bytes.len() + 4 + b.len());
            payload.extend_from_slice(&(tag_bytes.len() as u32).to_be_bytes());
            payload.extend_from_slice(tag_bytes);
            payload.extend_from_slice(&(b.len() as u32).to_be_bytes());
            payload.extend_from_slice(b);
            buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            buf.extend_from_slice(&payload);
        }
    }
    buf
}

/// A decoded record plus the replication metadata carried at the message
/// level (clock/quality are per-message in `spec.md` §4.4; individual
/// per-record clocks piggyback on the message's unless a filter overrides
/// them before send, per §4.5 step 5 "snapshot per-record clocks").
#[derive(Clone, Debug)]
pub struct DecodedRecord {
    pub key: String,
    pub value: RecordValue,
}

pub fn decode_record(buf: &[u8]) -> Result<(DecodedRecord, usize)> {
    if buf.len() < 4 {
        return Err(err("truncated record: missing key_length"));
    }
    let key_len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
    let mut off = 4;
    if buf.len() < off + key_len {
        return Err(err("truncated record: key"));
    }
    let key_bytes = &buf[off..off + key_len - 1]; // drop the NUL
    let key = String::from_utf8(key_bytes.to_vec()).map_err(|e| err(e.to_string()))?;
    off += key_len;

    if buf.len() < off + 8 {
        return Err(err("truncated record: type/value_size"));
    }
    let type_tag = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
    off += 4;
    let value_size = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
    off += 4;

    let tag = RecordTypeTag::from_u32(type_tag).ok_or_else(|| err("unknown record type tag"))?;
    let value = match tag {
        RecordTypeTag::Integer => {
            let v = i64::from_be_bytes(buf[off..off + 8].try_into().map_err(|_| err("short int"))?);
            off += 8;
            RecordValue::Integer(v)
        }
        RecordTypeTag::Double => {
            let bits = u64::from_be_bytes(buf[off..off + 8].try_into().map_err(|_| err("short double"))?);
            off += 8;
            RecordValue::from(f64::from_bits(bits))
        }
        RecordTypeTag::String => {
            if buf.len() < off + value_size {
                return Err(err("truncated record: string"));
            }
            let bytes = &buf[off..off + value_size.saturating_sub(1)];
            let s = String::from_utf8(bytes.to_vec()).map_err(|e| err(e.to_string()))?;
            off += value_size;
            RecordValue::from(s)
        }
        RecordTypeTag::IntegerArray => {
            let mut v = Vec::with_capacity(value_size);
            for _ in 0..value_size {
                v.push(i64::from_be_bytes(buf[off..off + 8].try_into().map_err(|_| err("short int elem"))?));
                off += 8;
            }
            RecordValue::from(v)
        }
        RecordTypeTag::DoubleArray => {
            let mut v = Vec::with_capacity(value_size);
            for _ in 0..value_size {
                let bits = u64::from_be_bytes(buf[off..off + 8].try_into().map_err(|_| err("short double elem"))?);
                v.push(f64::from_bits(bits));
                off += 8;
            }
            RecordValue::from(v)
        }
        RecordTypeTag::Blob => {
            if buf.len() < off + value_size {
                return Err(err("truncated record: blob"));
            }
            let b = buf[off..off + value_size].to_vec();
            off += value_size;
            RecordValue::Blob(Arc::new(b))
        }
        RecordTypeTag::FileText | RecordTypeTag::FileXml | RecordTypeTag::FileJpeg => {
            let file_type = match tag {
                RecordTypeTag::FileText => FileType::Text,
                RecordTypeTag::FileXml => FileType::Xml,
                RecordTypeTag::FileJpeg => FileType::Jpeg,
                _ => unreachable!(),
            };
            if buf.len() < off + value_size {
                return Err(err("truncated record: file"));
            }
            let b = buf[off..off + value_size].to_vec();
            off += value_size;
            RecordValue::File(file_type, Arc::new(b))
        }
        RecordTypeTag::Any => {
            if buf.len() < off + value_size {
                return Err(err("truncated record: any"));
            }
            let payload = &buf[off..off + value_size];
            off += value_size;
            if payload.len() < 4 {
                return Err(err("truncated record: any tag_len"));
            }
            let tag_len = u32::from_be_bytes(payload[0..4].try_into().unwrap()) as usize;
            if payload.len() < 4 + tag_len {
                return Err(err("truncated record: any tag"));
            }
            let tag_str = String::from_utf8(payload[4..4 + tag_len].to_vec()).map_err(|e| err(e.to_string()))?;
            let data_off = 4 + tag_len;
            if payload.len() < data_off + 4 {
                return Err(err("truncated record: any data_len"));
            }
            let data_len = u32::from_be_bytes(payload[data_off..data_off + 4].try_into().unwrap()) as usize;
            if payload.len() < data_off + 4 + data_len {
                return Err(err("truncated record: any data"));
            }
            let data = payload[data_off + 4..data_off + 4 + data_len].to_vec();
            RecordValue::Any(Arc::from(tag_str.as_str()), Arc::new(data))
        }
    };

    Ok((DecodedRecord { key, value }, off))
}

/// Encodes a complete message: header followed by every record, with
/// `header.size`/`header.updates` filled in automatically.
pub fn encode_message(mut header: MessageHeader, records: &[(String, Record)]) -> Vec<u8> {
    header.updates = records.len() as u32;
    header.quality = records.iter().map(|(_, r)| r.quality).max().unwrap_or(0);
    let mut body = Vec::new();
    for (key, record) in records {
        body.extend_from_slice(&encode_record(key, record));
    }
    header.size = (header.header_len() + body.len()) as u64;
    let mut buf = encode_header(&header);
    buf.extend_from_slice(&body);
    buf
}

pub fn decode_message(buf: &[u8], expected_domain: &str) -> Result<(MessageHeader, Vec<DecodedRecord>)> {
    let (header, mut off) = decode_header(buf, expected_domain)?;
    let mut records = Vec::with_capacity(header.updates as usize);
    for _ in 0..header.updates {
        let (rec, consumed) = decode_record(&buf[off..])?;
        off += consumed;
        records.push(rec);
    }
    Ok((header, records))
}

#[cfg(test)]
mod test {
    use super::*;
    use madara_lang::Status;

    fn sample_header(msg_type: u32) -> MessageHeader {
        MessageHeader {
            size: 0,
            domain: "realm".to_string(),
            originator: "host:9000".to_string(),
            msg_type,
            updates: 0,
            quality: 0,
            clock: 42,
            timestamp: 123456,
            ttl: 3,
            reduced: false,
            fragment_index: 0,
            fragment_count: 0,
        }
    }

    #[test]
    fn p4_header_round_trips() {
        let header = sample_header(MSG_MULTIASSIGN);
        let mut h = header.clone();
        h.size = h.header_len() as u64;
        let bytes = encode_header(&h);
        let (decoded, consumed) = decode_header(&bytes, "realm").unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, h);
    }

    #[test]
    fn reduced_header_round_trips_without_domain_originator() {
        let mut h = sample_header(MSG_MULTIASSIGN);
        h.reduced = true;
        h.size = h.header_len() as u64;
        let bytes = encode_header(&h);
        assert_eq!(bytes.len(), REDUCED_HEADER_LEN);
        let (decoded, _) = decode_header(&bytes, "realm").unwrap();
        assert_eq!(decoded.clock, 42);
        assert_eq!(decoded.domain, "realm"); // supplied by caller, not on wire
    }

    #[test]
    fn record_round_trips_each_type() {
        let mut record = Record::new(RecordValue::from(7i64));
        record.status = Status::Modified;
        let bytes = encode_record("x", &record);
        let (decoded, consumed) = decode_record(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.key, "x");
        assert_eq!(decoded.value, RecordValue::Integer(7));

        let mut text_record = Record::new(RecordValue::from("hello"));
        text_record.status = Status::Modified;
        let bytes = encode_record("greeting", &text_record);
        let (decoded, _) = decode_record(&bytes).unwrap();
        assert_eq!(decoded.value, RecordValue::from("hello"));

        let mut arr_record = Record::new(RecordValue::from(vec![1i64, 2, 3]));
        arr_record.status = Status::Modified;
        let bytes = encode_record("arr", &arr_record);
        let (decoded, _) = decode_record(&bytes).unwrap();
        assert_eq!(decoded.value, RecordValue::from(vec![1i64, 2, 3]));
    }

    #[test]
    fn message_round_trips() {
        let header = MessageHeader {
            size: 0,
            domain: "realm".into(),
            originator: "a:1".into(),
            msg_type: MSG_MULTIASSIGN,
            updates: 0,
            quality: 0,
            clock: 1,
            timestamp: 1,
            ttl: 1,
            reduced: false,
            fragment_index: 0,
            fragment_count: 0,
        };
        let mut r1 = Record::new(RecordValue::from(1i64));
        r1.status = Status::Modified;
        r1.quality = 5;
        let mut r2 = Record::new(RecordValue::from("s"));
        r2.status = Status::Modified;
        r2.quality = 9;
        let records = vec![("a".to_string(), r1), ("b".to_string(), r2)];
        let bytes = encode_message(header, &records);
        let (decoded_header, decoded_records) = decode_message(&bytes, "realm").unwrap();
        assert_eq!(decoded_header.updates, 2);
        assert_eq!(decoded_header.quality, 9);
        assert_eq!(decoded_header.size, bytes.len() as u64);
        assert_eq!(decoded_records.len(), 2);
        assert_eq!(decoded_records[0].key, "a");
        assert_eq!(decoded_records[1].key, "b");
    }

    #[test]
    fn domain_mismatch_is_detected_by_caller() {
        let mut h = sample_header(MSG_MULTIASSIGN);
        h.size = h.header_len() as u64;
        let bytes = encode_header(&h);
        let (decoded, _) = decode_header(&bytes, "realm").unwrap();
        assert_ne!(decoded.domain, "other-realm");
    }
}
