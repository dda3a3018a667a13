mod bandwidth;
mod filter;
mod fragment;
mod scheduler;
mod transport;
mod wire;

pub use bandwidth::BandwidthMonitor;
pub use filter::{FilterKind, FilterPipeline, TransportContext};
pub use fragment::{Reassembler, ReassemblyKey};
pub use scheduler::{PacketScheduler, SchedulerState};
pub use transport::{Diagnostics, Transport, TransportKind, TransportSettings};
pub use wire::{
    decode_header, decode_message, decode_record, encode_header, encode_message, encode_record,
    DecodedRecord, MessageHeader, DOMAIN_LEN, FRAGMENT_EXTRA_LEN, FULL_HEADER_LEN, MADARA_MAGIC,
    MSG_FRAGMENT, MSG_MULTIASSIGN, MSG_REFRAGMENT, MSG_REGISTER, ORIGINATOR_LEN, REDUCED_HEADER_LEN,
};
