//! Token-bucket rate limiting with burst floors and fail modes.
//!
//! Requests pass a composite of three limiters in normative order: burst
//! (peak RPS) -> global (service-wide) -> per-agent. The remote variant
//! degrades per its configured fail mode when the shared backend is
//! unreachable.

mod bucket;
mod composite;
mod local;
mod remote;

pub use bucket::{RateLimitDecision, TokenBucket};
pub use composite::{CompositeDecision, CompositeRateLimiter, RejectingStage};
pub use local::{KeyStats, LocalRateLimiter};
pub use remote::{RateLimitBackend, RemoteRateLimiter, FAIL_CLOSED_RETRY_MS};
