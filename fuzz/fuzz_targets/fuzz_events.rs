//! Fuzz target for wire-model deserialization.
//!
//! Tests that arbitrary bytes don't cause panics when parsed as the shared
//! event/task types we accept from the network.

#![no_main]

use atlas_bridge::event::StreamEvent;
use atlas_bridge::task::Task;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Try to parse as a stream event - should not panic
    let _ = serde_json::from_slice::<StreamEvent>(data);

    // Try to parse as a task (snapshot entries) - should not panic
    let _ = serde_json::from_slice::<Task>(data);

    // Try as string (like we read from the socket)
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = serde_json::from_str::<StreamEvent>(s);
        let _ = serde_json::from_str::<Task>(s);
    }
});
