//! # trustlink-agent
//!
//! Runs one TRUSTLINK agent: loads its TOML configuration, assembles the
//! identity client, policy decider, capability registry and dispatcher, then
//! serves the mTLS listener and the unauthenticated discovery endpoint.
//!
//! - `config`: the TOML file and its validation
//! - `lifecycle`: `AgentRuntime` (assembly) and `RunningAgent` (serving)
//! - `discovery`: axum router for `/.well-known/agent.json`
//! - `builtin`: handlers shipped with the binary
//!
//! The binary in `main.rs` is a thin clap front end over these.

pub mod builtin;
pub mod config;
pub mod discovery;
pub mod lifecycle;

pub use builtin::{echo_handler, greet_handler, HandlerSet};
pub use config::{AgentConfig, PolicyMode};
pub use discovery::{router, DISCOVERY_PATH};
pub use lifecycle::{AgentRuntime, RunningAgent};
