//! Pre-trust evidence exchange and the attested channel built on top of it.

pub mod channel;
pub mod handshake;
pub mod retry;

pub use channel::{ChannelOptions, ChannelState, ConfidentialChannel};
pub use handshake::{fetch_evidence, PendingSession};
pub use retry::RetryPolicy;
