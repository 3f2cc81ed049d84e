#![no_main]

use libfuzzer_sys::fuzz_target;
use xdd::replay::replay;
use xdd::types::{ChangelogEvent, Specification};

fuzz_target!(|data: &[u8]| {
    // Deserialize an arbitrary event list and replay it twice: whatever the
    // outcome, it must not panic and must be deterministic.
    if let Ok(events) = serde_yaml::from_slice::<Vec<ChangelogEvent>>(data) {
        let once = replay(Specification::empty(), &events);
        let twice = replay(Specification::empty(), &events);
        assert_eq!(once.is_ok(), twice.is_ok());
        if let (Ok(a), Ok(b)) = (once, twice) {
            assert_eq!(a, b);
        }
    }
});
