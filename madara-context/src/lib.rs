mod conflict;
mod context;
mod registry;
mod settings;

pub use conflict::{resolve_write, Outcome};
pub use context::{Context, ModifiedSink, VariableReference};
pub use registry::RegisteredFunction;
pub use settings::{SetResult, UpdateSettings};

#[cfg(test)]
mod test {
    use super::*;
    use madara_lang::RecordValue;

    #[test]
    fn p1_clock_never_decreases_under_repeated_local_writes() {
        let ctx = Context::new("self", 5);
        let settings = UpdateSettings::new();
        let mut last_clock = 0;
        for i in 0..10 {
            ctx.set("x", i as i64, &settings);
            let r = ctx.get("x");
            assert!(r.clock >= last_clock);
            last_clock = r.clock;
        }
    }

    #[test]
    fn p2_modified_tracking_round_trip() {
        let ctx = Context::new("self", 1);
        let settings = UpdateSettings::new();
        assert_eq!(ctx.set("global.x", 1i64, &settings), SetResult::Accepted);
        assert!(ctx
            .get_modifieds()
            .iter()
            .any(|(k, _)| k == "global.x"));
        ctx.reset_modified_all();
        assert!(ctx.get_modifieds().is_empty());
    }

    #[test]
    fn local_keys_never_enter_global_modified() {
        let ctx = Context::new("self", 1);
        let settings = UpdateSettings::new();
        ctx.set(".private", 1i64, &settings);
        assert!(ctx.get_modifieds().is_empty());
        assert!(ctx.exists(".private"));
    }

    #[test]
    fn s1_quality_based_rejection_via_apply_write() {
        let ctx = Context::new("self", 3);
        let settings = UpdateSettings::new();
        ctx.set("x", 7i64, &settings);
        // Simulate a remote write with lower quality directly through the
        // same path Transport uses.
        let result = ctx.apply_remote_write("x", RecordValue::from(7i64), 6, 2, "remote".into(), 0, &settings);
        assert_eq!(result, SetResult::QualityRejected);
        assert!(!ctx.get_modifieds().iter().any(|(k, _)| k == "x"));
    }

    #[test]
    fn erase_invalidates_outstanding_reference() {
        let ctx = Context::new("self", 1);
        let settings = UpdateSettings::new();
        ctx.set("y", 42i64, &settings);
        let handle = ctx.get_ref("y");
        assert_eq!(handle.get().value, RecordValue::Integer(42));
        ctx.erase("y");
        assert_eq!(handle.get().value, RecordValue::Integer(0));
        assert!(!handle.get().exists());
    }

    #[test]
    fn checkpoint_round_trip_text_values() {
        let ctx = Context::new("self", 1);
        let settings = UpdateSettings::new();
        ctx.set_text("name", "hello", &settings);
        ctx.set("count", 3i64, &settings);
        let text = ctx.to_karl_text();

        let ctx2 = Context::new("other", 1);
        ctx2.from_karl_text(&text).unwrap();
        assert_eq!(ctx2.get("name").value, RecordValue::from("hello"));
        assert_eq!(ctx2.get("count").value, RecordValue::Integer(3));
    }
}
