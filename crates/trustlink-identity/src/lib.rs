//! # trustlink-identity
//!
//! Identity provider client for TRUSTLINK agents.
//!
//! An agent's identity is an X.509 SVID issued by an external provider. The
//! local helper keeps three PEM files current (certificate chain, private
//! key, trust bundle); `FileIdentityFetcher` reads them, and `IdentityClient`
//! holds the result, hands out the identity only while it is valid and
//! refreshes it at half its remaining lifetime.
//!
//! The identity itself is the single URI subject alternative name of the
//! leaf certificate (see `x509`).

pub mod client;
pub mod document;
pub mod fetcher;
pub mod x509;

pub use client::{IdentityClient, MIN_REFRESH_INTERVAL};
pub use document::IdentityDocument;
pub use fetcher::{FileIdentityFetcher, IdentityFetcher};
pub use x509::{identity_from_pem, leaf_identity, peer_identity, pem_certificates};

// ── Tests ─────────────────────────────────────────────────────────────────────
