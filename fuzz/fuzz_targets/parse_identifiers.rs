#![no_main]

use libfuzzer_sys::fuzz_target;
use xdd::types::{CriterionId, EventId, RequirementId};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(id) = RequirementId::parse(s) {
            // Anything accepted must roundtrip and expose a category.
            assert!(!id.category().is_empty());
            assert_eq!(RequirementId::parse(id.as_str()).unwrap(), id);
        }
        let _ = CriterionId::parse(s);
        let _ = EventId::parse(s);
    }
});
