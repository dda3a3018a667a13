// Owns sockets, threads, bandwidth/scheduling policy and the filter
// pipeline; drives the send and receive pipelines of spec §4.5.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, trace, warn};

use madara_base::{err, Result};
use madara_context::{Context, ModifiedSink};
use madara_lang::{Record, WriterId};

use crate::bandwidth::BandwidthMonitor;
use crate::filter::{FilterPipeline, TransportContext};
use crate::fragment::Reassembler;
use crate::scheduler::{PacketScheduler, SchedulerState};
use crate::wire::{encode_message, MessageHeader, MSG_MULTIASSIGN, REDUCED_HEADER_LEN};

/// The subset of `TransportSettings` (spec §6) this implementation
/// recognizes. `transport_type`, `registry_server/client`, ZMQ/SPLICE/NDDS
/// backends, and TCP are intentionally unimplemented: this Transport
/// speaks plain UDP unicast/broadcast/multicast only (see DESIGN.md).
#[derive(Clone, Debug)]
pub struct TransportSettings {
    pub hosts: Vec<SocketAddr>,
    pub kind: TransportKind,
    pub domain: String,
    pub queue_length: usize,
    pub max_fragment_size: usize,
    pub read_threads: usize,
    pub resend_attempts: u32,
    pub slack_time: Duration,
    pub send_bandwidth_limit: i64,
    pub total_bandwidth_limit: i64,
    pub deadline: Option<Duration>,
    pub send_reduced_message_header: bool,
    pub never_exit: bool,
    pub reassembly_window: Duration,
    /// Hop count stamped on batches this node originates (spec §4.4's
    /// `ttl` field); a send filter can still override it per-batch via
    /// `TransportContext::set_ttl`.
    pub ttl: u8,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportKind {
    None,
    Broadcast,
    Multicast,
    Udp,
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings {
            hosts: Vec::new(),
            kind: TransportKind::Udp,
            domain: "madara".to_string(),
            queue_length: 64 * 1024,
            max_fragment_size: 64 * 1024,
            read_threads: 1,
            resend_attempts: 3,
            slack_time: Duration::from_millis(0),
            send_bandwidth_limit: -1,
            total_bandwidth_limit: -1,
            deadline: None,
            send_reduced_message_header: false,
            never_exit: false,
            // Q3: no explicit default in the source; 2 * max_round_trip
            // bounded at 10s. We have no round-trip estimator, so we take
            // the bound itself as the default (see DESIGN.md).
            reassembly_window: Duration::from_secs(10),
            // Mirrors the multicast join's own TTL=1 default (spec §6):
            // one hop of rebroadcast unless a filter or caller overrides it.
            ttl: 1,
        }
    }
}

struct Endpoints {
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
}

fn bind_socket(settings: &TransportSettings) -> Result<Endpoints> {
    let local = *settings
        .hosts
        .first()
        .ok_or_else(|| err("TransportSettings.hosts must name a local bind at index 0"))?;
    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| err(format!("socket create failed: {e}")))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| err(format!("SO_REUSEADDR failed: {e}")))?;

    match settings.kind {
        TransportKind::Broadcast => {
            socket
                .set_broadcast(true)
                .map_err(|e| err(format!("SO_BROADCAST failed: {e}")))?;
        }
        TransportKind::Multicast => {
            socket
                .set_multicast_ttl_v4(1)
                .map_err(|e| err(format!("multicast TTL failed: {e}")))?;
            if let SocketAddr::V4(addr) = local {
                socket
                    .join_multicast_v4(addr.ip(), &std::net::Ipv4Addr::UNSPECIFIED)
                    .map_err(|e| err(format!("join_multicast_v4 failed: {e}")))?;
            }
        }
        TransportKind::Udp | TransportKind::None => {}
    }

    socket
        .bind(&local.into())
        .map_err(|e| err(format!("bind {local} failed: {e}")))?;

    // Configuration (TTL, broadcast, multicast membership) happens through
    // socket2; actual I/O goes through the std socket it converts into.
    let socket: UdpSocket = socket.into();
    socket
        .set_nonblocking(false)
        .map_err(|e| err(format!("set_nonblocking failed: {e}")))?;

    let peers = settings.hosts.iter().skip(1).copied().collect();
    Ok(Endpoints { socket, peers })
}

/// Diagnostic counters surfaced to callers instead of a live metrics
/// system (spec §7 data-plane anomalies: "counted in per-transport
/// diagnostic records").
#[derive(Default)]
pub struct Diagnostics {
    pub dropped_by_scheduler: AtomicU64,
    pub dropped_by_bandwidth: AtomicU64,
    pub malformed_datagrams: AtomicU64,
    pub domain_mismatches: AtomicU64,
    pub stale_fragments_discarded: AtomicU64,
}

struct Shared {
    context: Context,
    settings: TransportSettings,
    filters: FilterPipeline,
    send_bandwidth: Mutex<BandwidthMonitor>,
    recv_bandwidth: Mutex<BandwidthMonitor>,
    scheduler: Mutex<SchedulerState>,
    reassembler: Mutex<Reassembler>,
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
    diagnostics: Diagnostics,
    closed: AtomicBool,
}

/// A Replication Transport: Context reference, settings, bandwidth
/// monitors, packet scheduler, filter pipeline, and datagram endpoints
/// (spec §4.5).
#[derive(Clone)]
pub struct Transport(Arc<Shared>);

impl Transport {
    pub fn new(context: Context, settings: TransportSettings, filters: FilterPipeline) -> Result<Self> {
        let endpoints = bind_socket(&settings)?;
        let transport = Transport(Arc::new(Shared {
            context,
            send_bandwidth: Mutex::new(BandwidthMonitor::new(10)),
            recv_bandwidth: Mutex::new(BandwidthMonitor::new(10)),
            scheduler: Mutex::new(SchedulerState::new(PacketScheduler::None)),
            reassembler: Mutex::new(Reassembler::new(settings.reassembly_window)),
            socket: endpoints.socket,
            peers: endpoints.peers,
            filters,
            diagnostics: Diagnostics::default(),
            closed: AtomicBool::new(false),
            settings,
        }));
        Ok(transport)
    }

    pub fn with_scheduler(self, kind: PacketScheduler) -> Self {
        *self.0.scheduler.lock().unwrap() = SchedulerState::new(kind);
        self
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.0.diagnostics
    }

    /// Launches `settings.read_threads` blocking receive loops. Returns
    /// their join handles; `close()` signals them to stop.
    pub fn spawn_read_threads(&self) -> Vec<JoinHandle<()>> {
        (0..self.0.settings.read_threads.max(1))
            .map(|i| {
                let transport = self.clone();
                std::thread::Builder::new()
                    .name(format!("madara-net-read-{i}"))
                    .spawn(move || transport.receive_loop())
                    .expect("failed to spawn transport read thread")
            })
            .collect()
    }

    pub fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
        // Nudge any blocked recv() so the thread observes `closed` promptly.
        if let Ok(addr) = self.0.socket.local_addr() {
            let _ = UdpSocket::bind("0.0.0.0:0").and_then(|s| s.send_to(&[], addr));
        }
    }

    fn receive_loop(&self) {
        let mut buf = vec![0u8; self.0.settings.queue_length.max(65536)];
        loop {
            if self.0.closed.load(Ordering::SeqCst) {
                return;
            }
            let n = match self.0.socket.recv(&mut buf) {
                Ok(n) => n,
                Err(e) => {
                    if self.0.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    warn!(target: "madara::net", error = %e, "recv failed");
                    continue;
                }
            };
            if let Err(e) = self.handle_datagram(&buf[..n]) {
                trace!(target: "madara::net", error = %e, "dropped malformed datagram");
                self.0.diagnostics.malformed_datagrams.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Receive pipeline, spec §4.5 steps 1-7.
    fn handle_datagram(&self, datagram: &[u8]) -> Result<()> {
        if self.0.scheduler.lock().unwrap().should_drop() {
            self.0.diagnostics.dropped_by_scheduler.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let header_len = if self.0.settings.send_reduced_message_header {
            REDUCED_HEADER_LEN
        } else {
            crate::wire::FULL_HEADER_LEN
        };
        if datagram.len() < header_len.min(16) {
            self.0.diagnostics.malformed_datagrams.fetch_add(1, Ordering::Relaxed);
            return Err(err("datagram shorter than minimal header"));
        }

        let (header, consumed) = match crate::wire::decode_header(datagram, &self.0.settings.domain) {
            Ok(v) => v,
            Err(e) => {
                self.0.diagnostics.malformed_datagrams.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        if header.domain != self.0.settings.domain {
            self.0.diagnostics.domain_mismatches.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let payload = datagram[consumed..].to_vec();
        let (header, decoded) = if header.is_fragment() {
            match self.0.reassembler.lock().unwrap().insert(header, payload) {
                Some((header, full_body)) => {
                    let mut decoded = Vec::new();
                    let mut off = 0;
                    while off < full_body.len() {
                        let (rec, consumed) = crate::wire::decode_record(&full_body[off..])?;
                        off += consumed;
                        decoded.push(rec);
                    }
                    (header, decoded)
                }
                None => return Ok(()),
            }
        } else {
            let mut decoded = Vec::with_capacity(header.updates as usize);
            let mut off = consumed;
            for _ in 0..header.updates {
                let (rec, advance) = crate::wire::decode_record(&datagram[off..])?;
                off += advance;
                decoded.push(rec);
            }
            (header, decoded)
        };

        if let Some(deadline) = self.0.settings.deadline {
            let now = now_micros();
            let cutoff = now.saturating_sub(deadline.as_micros() as u64);
            if header.timestamp != 0 && header.timestamp < cutoff {
                self.0.diagnostics.stale_fragments_discarded.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        let records: Vec<(String, Record)> = decoded
            .into_iter()
            .map(|d| {
                let mut r = Record::new(d.value);
                r.quality = header.quality;
                r.clock = header.clock;
                r.writer = WriterId::from(header.originator.as_str());
                r.toi = header.timestamp;
                (d.key, r)
            })
            .collect();

        let tctx = TransportContext::new(
            WriterId::from(header.originator.as_str()),
            header.domain.clone(),
            header.clock,
        )
        .with_header(header.clone());
        let filtered = self.0.filters.run_receive(records, &tctx);

        let settings = madara_context::UpdateSettings::always_overwriting();
        let mut accepted_any = false;
        for (key, record) in &filtered {
            let result = self.0.context.apply_remote_write(
                key,
                record.value.clone(),
                record.clock,
                record.quality,
                record.writer.clone(),
                record.toi,
                &settings,
            );
            if result.is_accepted() {
                accepted_any = true;
            }
        }

        self.0.recv_bandwidth.lock().unwrap().add(datagram.len() as u64);
        debug!(target: "madara::net", records = filtered.len(), "received batch");

        if header.ttl > 0 && accepted_any {
            let rebroadcast = self.0.filters.run_rebroadcast(filtered, &tctx);
            if !rebroadcast.is_empty() {
                let mut h = header.clone();
                h.ttl = tctx.ttl_override().unwrap_or(h.ttl - 1);
                let _ = self.send_records(h, rebroadcast);
            }
        }
        Ok(())
    }

    /// Send pipeline, spec §4.5 steps 1-9. Drains the global-modified set.
    fn send_modifieds_inner(&self) -> Result<()> {
        let modifieds = self.0.context.get_modifieds();
        if modifieds.is_empty() {
            return Ok(());
        }

        if self.0.scheduler.lock().unwrap().should_drop() {
            self.0.diagnostics.dropped_by_scheduler.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let tctx = TransportContext::new(self.0.context.writer().clone(), self.0.settings.domain.clone(), self.0.context.clock());
        let filtered = self.0.filters.run_send(modifieds, &tctx);
        if filtered.is_empty() {
            self.0.context.reset_modified_all();
            return Ok(());
        }

        let sent_keys: Vec<String> = filtered.iter().map(|(k, _)| k.clone()).collect();
        let clock = self.0.context.inc_clock();
        let header = MessageHeader {
            size: 0,
            domain: self.0.settings.domain.clone(),
            originator: self.0.context.writer().to_string(),
            msg_type: MSG_MULTIASSIGN,
            updates: 0,
            quality: 0,
            clock,
            timestamp: now_micros(),
            ttl: tctx.ttl_override().unwrap_or(self.0.settings.ttl),
            reduced: self.0.settings.send_reduced_message_header,
            fragment_index: 0,
            fragment_count: 0,
        };

        self.send_records(header, filtered)?;
        self.0.context.reset_modified_all();
        for key in sent_keys {
            self.0.context.reset_modified(&key);
        }
        Ok(())
    }

    fn send_records(&self, header: MessageHeader, records: Vec<(String, Record)>) -> Result<()> {
        let buf = encode_message(header.clone(), &records);
        let datagrams: Vec<Vec<u8>> = if buf.len() > self.0.settings.max_fragment_size {
            let header_len = header.header_len();
            crate::fragment::split(&header, &buf[header_len..], self.0.settings.max_fragment_size)
        } else {
            vec![buf]
        };

        for datagram in datagrams {
            for peer in &self.0.peers {
                let mut bandwidth = self.0.send_bandwidth.lock().unwrap();
                if bandwidth.is_bandwidth_violated(self.0.settings.send_bandwidth_limit) {
                    self.0.diagnostics.dropped_by_bandwidth.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                drop(bandwidth);

                let mut attempts = 0;
                loop {
                    match self.0.socket.send_to(&datagram, peer) {
                        Ok(written) => {
                            self.0.send_bandwidth.lock().unwrap().add(written as u64);
                            break;
                        }
                        Err(e) if would_block(&e) && attempts < self.0.settings.resend_attempts => {
                            attempts += 1;
                            continue;
                        }
                        Err(e) => {
                            error!(target: "madara::net", error = %e, peer = %peer, "send failed");
                            break;
                        }
                    }
                }
            }
            if !self.0.settings.slack_time.is_zero() {
                std::thread::sleep(self.0.settings.slack_time);
            }
        }
        Ok(())
    }
}

impl ModifiedSink for Transport {
    fn send_modifieds(&self) -> Result<()> {
        self.send_modifieds_inner()
    }
}

fn would_block(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::WouldBlock)
}

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;
    use madara_context::UpdateSettings;

    fn loopback_settings(port: u16) -> TransportSettings {
        let mut s = TransportSettings::default();
        s.hosts = vec![format!("127.0.0.1:{port}").parse().unwrap()];
        s.domain = "test-realm".to_string();
        s
    }

    #[test]
    fn bind_and_close_roundtrip() {
        let ctx = Context::new("self", 1);
        let transport = Transport::new(ctx, loopback_settings(0), FilterPipeline::new()).unwrap();
        transport.close();
    }

    #[test]
    fn send_modifieds_with_no_peers_is_a_noop() {
        let ctx = Context::new("self", 1);
        let settings = UpdateSettings::new();
        ctx.set("x", 1i64, &settings);
        let transport = Transport::new(ctx.clone(), loopback_settings(0), FilterPipeline::new()).unwrap();
        transport.send_modifieds().unwrap();
        // Nothing to assert on the wire (no peers configured), but the
        // modified set still drains as the pipeline completed locally.
        assert!(ctx.get_modifieds().is_empty());
    }
}
