//! # trustlink-core
//!
//! The TRUSTLINK dispatch pipeline.
//!
//! This crate contains:
//! - The core trait definitions (`IdentityProvider`, `PolicyDecider`,
//!   `Connector`, `Channel`, `AuditWriter`)
//! - The capability registry (`RegistryBuilder` / `CapabilityRegistry`)
//! - The per-destination circuit breaker and the connection manager
//! - The retry policy used for connects, identity refresh and probes
//! - The discovery document builder
//! - The `Dispatcher` that enforces the policy-gated call pipeline
//!
//! Nothing here speaks TLS or HTTP. Concrete identity, policy, transport and
//! audit implementations live in their own crates and plug in through the
//! traits.

pub mod breaker;
pub mod discovery;
pub mod dispatcher;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod traits;

pub use breaker::{BreakerConfig, BreakerState};
pub use discovery::build_discovery;
pub use dispatcher::{DispatchSettings, Dispatcher};
pub use pool::{Checkout, ConnectionManager, PoolConfig};
pub use registry::{handler_fn, Capability, CapabilityHandler, CapabilityRegistry, RegistryBuilder};
pub use retry::{retry_with_backoff, RetryPolicy};
