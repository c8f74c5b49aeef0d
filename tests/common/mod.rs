//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

use ivbench::engine::{EngineEvent, EngineHandle};
use std::time::{Duration, Instant};

/// Sleep long enough for the worker loop to process a command
pub fn settle() {
    std::thread::sleep(Duration::from_millis(50));
}

/// Poll the handle until an event matches the predicate or the timeout
/// lapses, returning the matching event
pub fn wait_for_event<F>(
    handle: &EngineHandle,
    timeout: Duration,
    mut predicate: F,
) -> Option<EngineEvent>
where
    F: FnMut(&EngineEvent) -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        while let Some(event) = handle.try_recv() {
            if predicate(&event) {
                return Some(event);
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    None
}
