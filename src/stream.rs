//! Lazy-sequence plumbing
//!
//! Every lazy sequence in the pipeline is a bounded crossbeam channel fed
//! by a dedicated producer thread. Producers must close their output on
//! success and on cancellation; this module holds the send loop that makes
//! a blocked producer notice a tripped token within bounded time.

use crate::types::CancelToken;
use crossbeam_channel::{SendTimeoutError, Sender};
use std::time::Duration;

/// How often a blocked send rechecks the cancellation token
const SEND_POLL: Duration = Duration::from_millis(50);

/// Send an item, polling `cancel` while the channel is full
///
/// Returns false when the consumer disconnected or the token tripped; the
/// producer should stop and drop its sender, closing the stream.
pub fn send_cancellable<T>(tx: &Sender<T>, item: T, cancel: &CancelToken) -> bool {
    let mut item = item;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        match tx.send_timeout(item, SEND_POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => item = returned,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}
