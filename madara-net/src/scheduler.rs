// Loss/reordering emulation applied before encoding on send and after
// decoding on receive (spec §4.5 "Policies").

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Box-Muller sample from `N(mean, stddev)`, avoiding a dependency on
/// `rand_distr` for a single call site.
fn sample_normal(rng: &mut StdRng, mean: f64, stddev: f64) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
    mean + stddev * z
}

#[derive(Clone, Debug)]
pub enum PacketScheduler {
    /// Never drops or reorders.
    None,
    /// Drops `n` out of every `m` packets, deterministically.
    DropDeterministic { n: u32, m: u32 },
    /// Drops each packet independently with probability `p`.
    DropProbabilistic { p: f64 },
    /// Drops packets in bursts whose length is drawn from a normal
    /// distribution with the given mean/stddev.
    DropBursty { mean: f64, stddev: f64 },
    /// Reorders by buffering up to `window` packets and releasing them out
    /// of arrival order.
    Reordering { window: usize },
}

/// Per-scheduler mutable state (deterministic counters, RNG, reorder
/// buffer). Kept separate from the `PacketScheduler` config enum so the
/// config itself stays `Clone`.
pub struct SchedulerState {
    kind: PacketScheduler,
    rng: StdRng,
    det_counter: u32,
    burst_remaining: u32,
    reorder_buf: Vec<Vec<u8>>,
}

impl SchedulerState {
    pub fn new(kind: PacketScheduler) -> Self {
        SchedulerState {
            kind,
            rng: StdRng::from_entropy(),
            det_counter: 0,
            burst_remaining: 0,
            reorder_buf: Vec::new(),
        }
    }

    pub fn with_seed(kind: PacketScheduler, seed: u64) -> Self {
        SchedulerState {
            kind,
            rng: StdRng::seed_from_u64(seed),
            det_counter: 0,
            burst_remaining: 0,
            reorder_buf: Vec::new(),
        }
    }

    /// Returns `true` if this packet should be dropped before it is ever
    /// sent/processed.
    pub fn should_drop(&mut self) -> bool {
        match self.kind.clone() {
            PacketScheduler::None => false,
            PacketScheduler::DropDeterministic { n, m } => {
                let m = m.max(1);
                let drop = (self.det_counter % m) < n;
                self.det_counter = self.det_counter.wrapping_add(1);
                drop
            }
            PacketScheduler::DropProbabilistic { p } => self.rng.gen::<f64>() < p,
            PacketScheduler::DropBursty { mean, stddev } => {
                if self.burst_remaining > 0 {
                    self.burst_remaining -= 1;
                    return true;
                }
                let sample = sample_normal(&mut self.rng, mean, stddev.max(0.001));
                if sample > 0.0 {
                    self.burst_remaining = sample.round().max(0.0) as u32;
                    if self.burst_remaining > 0 {
                        self.burst_remaining -= 1;
                        return true;
                    }
                }
                false
            }
            PacketScheduler::Reordering { .. } => false,
        }
    }

    /// Feeds a ready-to-send datagram through the reordering buffer.
    /// Returns the datagrams that should actually be emitted now (zero or
    /// more, in emission order). Non-reordering schedulers pass the
    /// datagram through unchanged.
    pub fn reorder(&mut self, datagram: Vec<u8>) -> Vec<Vec<u8>> {
        if let PacketScheduler::Reordering { window } = self.kind {
            self.reorder_buf.push(datagram);
            if self.reorder_buf.len() >= window.max(1) {
                let idx = self.rng.gen_range(0..self.reorder_buf.len());
                return vec![self.reorder_buf.remove(idx)];
            }
            Vec::new()
        } else {
            vec![datagram]
        }
    }

    /// Flushes any datagrams still held in the reorder buffer, in
    /// arrival order. Called on transport shutdown so nothing is lost.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.reorder_buf)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn drop_deterministic_drops_exact_ratio() {
        let mut s = SchedulerState::new(PacketScheduler::DropDeterministic { n: 1, m: 4 });
        let drops = (0..8).filter(|_| s.should_drop()).count();
        assert_eq!(drops, 2);
    }

    #[test]
    fn drop_none_never_drops() {
        let mut s = SchedulerState::new(PacketScheduler::None);
        assert!((0..100).all(|_| !s.should_drop()));
    }

    #[test]
    fn reordering_eventually_releases_every_packet() {
        let mut s = SchedulerState::with_seed(PacketScheduler::Reordering { window: 3 }, 7);
        let mut released = Vec::new();
        for i in 0..9u8 {
            released.extend(s.reorder(vec![i]));
        }
        released.extend(s.drain());
        released.sort();
        assert_eq!(released, (0..9u8).map(|i| vec![i]).collect::<Vec<_>>());
    }
}
