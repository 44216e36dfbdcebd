//! Completion polling of in-flight remote resources.
//!
//! Every in-flight stage moves through an explicit state machine
//! (issued, polling, terminal). Status reads are spaced by a bounded
//! exponential backoff and the worker suspends between them. Transient
//! client errors are retried up to a budget of consecutive failures.

mod backoff;
mod completion;

pub use backoff::{BackoffConfig, JitterStrategy};
pub use completion::{CompletionPoller, InFlight, PollOutcome, PollPolicy, PollState};
