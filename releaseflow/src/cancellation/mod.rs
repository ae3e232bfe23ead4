//! Cooperative cancellation.
//!
//! Each in-flight release job holds a [`CancellationToken`]. A newer trigger
//! for the same job cancels the token, which aborts any backoff sleep.

mod token;

pub use token::CancellationToken;
