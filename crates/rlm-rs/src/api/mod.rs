//! Model-call plumbing: retry, routing, and pricing.
//!
//! - [`retry`]: transient error detection (429, 5xx, network timeouts) with
//!   configurable exponential backoff and jitter. Never retries 400/401 errors.
//! - [`router`]: [`ModelRoute`] picks the primary model by recursion depth
//!   and lists the fallback chain to walk on transport faults.
//! - [`tracing`]: trace ids for the run tree and per-model pricing.

pub mod retry;
pub mod router;
pub mod tracing;

pub use retry::RetryConfig;
pub use router::ModelRoute;
pub use tracing::{ModelPricing, child_trace_id, generate_trace_id, pricing_for_model};
