//! Test helper functions for API integration tests
//!
//! Provides utilities for waiting on asynchronous state and reading
//! light streams with bounded waits.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use futures_util::StreamExt;
use prysmalight_api::{LightEvent, LightStream};

/// How long a helper waits before failing the test
pub const WAIT: Duration = Duration::from_secs(2);

/// Poll `condition` until it holds, failing the test after [`WAIT`]
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(WAIT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not met within {:?}", WAIT);
}

/// Next event on `stream`, failing the test if none arrives in time
pub async fn next_event(stream: &mut LightStream) -> LightEvent {
    match tokio::time::timeout(WAIT, stream.next()).await {
        Ok(Some(event)) => event,
        Ok(None) => panic!("stream {:?} ended", stream),
        Err(_) => panic!("no event on {:?} within {:?}", stream, WAIT),
    }
}

/// Assert that `stream` stays quiet for `window`
pub async fn assert_quiet(stream: &mut LightStream, window: Duration) {
    if let Ok(event) = tokio::time::timeout(window, stream.next()).await {
        panic!("unexpected event on {:?}: {:?}", stream, event);
    }
}

/// Assert that a result contains a specific error message substring
#[macro_export]
macro_rules! assert_err_contains {
    ($result:expr, $substr:expr) => {
        match &$result {
            Ok(_) => panic!("Expected error but got Ok"),
            Err(e) => {
                let msg = e.to_string();
                assert!(
                    msg.contains($substr),
                    "Error message '{}' does not contain '{}'",
                    msg,
                    $substr
                );
            }
        }
    };
}
