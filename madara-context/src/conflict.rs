use madara_lang::WriterId;

/// Outcome of applying the spec §4.1 conflict rule.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Accept { clock: u64, quality: u32 },
    Reject,
}

/// The spec I2/§4.1 conflict-resolution rule, applied identically to local
/// and remote-origin writes (a process's own `write_quality` can still lose
/// to an already-accepted higher-quality remote write). Pure and
/// deterministic so it can be property-tested independent of `Context`
/// (spec P3).
#[allow(clippy::too_many_arguments)]
pub fn resolve_write(
    current_clock: u64,
    current_quality: u32,
    current_writer: &WriterId,
    incoming_clock: u64,
    incoming_quality: u32,
    incoming_writer: &WriterId,
    always_overwrite: bool,
) -> Outcome {
    if always_overwrite {
        return Outcome::Accept {
            clock: current_clock.max(incoming_clock),
            quality: incoming_quality,
        };
    }
    if incoming_quality < current_quality {
        return Outcome::Reject;
    }
    if incoming_quality > current_quality {
        return Outcome::Accept {
            clock: incoming_clock,
            quality: incoming_quality,
        };
    }
    // incoming_quality == current_quality
    if incoming_clock > current_clock {
        Outcome::Accept {
            clock: incoming_clock,
            quality: incoming_quality,
        }
    } else if incoming_clock < current_clock {
        Outcome::Reject
    } else if incoming_writer.as_str() > current_writer.as_str() {
        Outcome::Accept {
            clock: incoming_clock,
            quality: incoming_quality,
        }
    } else {
        Outcome::Reject
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn w(s: &str) -> WriterId {
        WriterId::from(s)
    }

    #[test]
    fn s1_quality_demotion_rejected() {
        // x: clock=5, quality=3 ; incoming clock=6 quality=2
        let outcome = resolve_write(5, 3, &w("self"), 6, 2, &w("other"), false);
        assert_eq!(outcome, Outcome::Reject);
    }

    #[test]
    fn s2_clock_tie_breaks_on_writer_id() {
        // x: clock=10 quality=1 originator=bob ; incoming clock=10 quality=1 originator=alice
        let outcome = resolve_write(10, 1, &w("bob"), 10, 1, &w("alice"), false);
        assert_eq!(outcome, Outcome::Reject, "bob > alice, bob's write stands");
    }

    #[test]
    fn higher_writer_id_wins_tie() {
        let outcome = resolve_write(10, 1, &w("alice"), 10, 1, &w("bob"), false);
        assert_eq!(
            outcome,
            Outcome::Accept {
                clock: 10,
                quality: 1
            }
        );
    }

    #[test]
    fn higher_quality_always_wins_regardless_of_clock() {
        let outcome = resolve_write(100, 1, &w("a"), 1, 2, &w("z"), false);
        assert_eq!(
            outcome,
            Outcome::Accept {
                clock: 1,
                quality: 2
            }
        );
    }

    #[test]
    fn always_overwrite_bypasses_everything() {
        let outcome = resolve_write(100, 9, &w("a"), 1, 0, &w("z"), true);
        assert_eq!(
            outcome,
            Outcome::Accept {
                clock: 100,
                quality: 0
            }
        );
    }

    #[test]
    fn p3_order_independence_of_delivery() {
        // Two writes v1=(c1=5,q1=2) and v2=(c2=6,q2=2) should converge to
        // the same final quality/clock regardless of arrival order.
        let v1 = (5u64, 2u32, w("alice"));
        let v2 = (6u64, 2u32, w("bob"));

        // Deliver v1 then v2.
        let after_v1 = resolve_write(0, 0, &w("x"), v1.0, v1.1, &v1.2, false);
        let (c, q) = match after_v1 {
            Outcome::Accept { clock, quality } => (clock, quality),
            Outcome::Reject => (0, 0),
        };
        let after_v2 = resolve_write(c, q, &v1.2, v2.0, v2.1, &v2.2, false);
        let order_a = match after_v2 {
            Outcome::Accept { clock, quality } => (clock, quality),
            Outcome::Reject => (c, q),
        };

        // Deliver v2 then v1.
        let after_v2_first = resolve_write(0, 0, &w("x"), v2.0, v2.1, &v2.2, false);
        let (c2, q2) = match after_v2_first {
            Outcome::Accept { clock, quality } => (clock, quality),
            Outcome::Reject => (0, 0),
        };
        let after_v1_second = resolve_write(c2, q2, &v2.2, v1.0, v1.1, &v1.2, false);
        let order_b = match after_v1_second {
            Outcome::Accept { clock, quality } => (clock, quality),
            Outcome::Reject => (c2, q2),
        };

        assert_eq!(order_a, order_b);
    }
}
