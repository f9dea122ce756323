//! Errors that reach the user. Skips, duplicates, and degraded context are not
//! errors and never get here.

use std::time::Duration;

use crate::channels::ChannelError;
use crate::task::FailureReason;

pub const TIMEOUT_MESSAGE: &str =
    "Sorry, that took too long and I had to stop. Try a simpler or smaller request.";
pub const FAILURE_MESSAGE: &str =
    "Sorry, something went wrong while working on that. Please try again in a moment.";
pub const DELIVERY_MESSAGE: &str =
    "Sorry, I had an answer but could not post all of it here.";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("external task timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("external task failed ({reason}): {detail}")]
    TaskFailed { reason: FailureReason, detail: String },
    #[error("delivery failed: {0}")]
    Delivery(#[from] ChannelError),
}

impl DispatchError {
    /// Text sent to the channel. Diagnostic detail stays in the logs.
    pub fn user_message(&self) -> &'static str {
        match self {
            DispatchError::Timeout(_) => TIMEOUT_MESSAGE,
            DispatchError::TaskFailed { .. } => FAILURE_MESSAGE,
            DispatchError::Delivery(_) => DELIVERY_MESSAGE,
        }
    }
}
