//! Agent identity types.
//!
//! Every agent is named by a URI-form identity of the shape
//! `<scheme>://<trust-domain>/<path>` (e.g. `spiffe://example.org/agents/x`).
//! The identity is bound to a short-lived certificate issued by an external
//! identity provider; these types only carry the parsed form.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{TrustlinkError, TrustlinkResult};

/// A validated, URI-form agent identity.
///
/// Used as the key for policy queries, connection pools, circuit breakers and
/// audit records. Two identities are equal only if their full URIs are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId {
    uri: String,
    /// Byte offset of the trust domain inside `uri`.
    domain_start: usize,
    /// Byte offset of the `/` that begins the path.
    path_start: usize,
}

impl AgentId {
    /// Parse and validate an identity URI.
    ///
    /// Rejects an empty or non-alphanumeric scheme, an empty or malformed
    /// trust domain, a missing path, and any query, fragment, user-info or
    /// port component.
    pub fn parse(value: &str) -> TrustlinkResult<Self> {
        let invalid = |reason: &str| TrustlinkError::InvalidIdentity {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = value
            .split_once("://")
            .ok_or_else(|| invalid("missing '://' separator"))?;

        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        {
            return Err(invalid("scheme must be non-empty and alphanumeric"));
        }

        if rest.contains('?') || rest.contains('#') {
            return Err(invalid("query and fragment components are not allowed"));
        }

        let (domain, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => return Err(invalid("missing path component")),
        };

        if domain.is_empty() {
            return Err(invalid("trust domain is empty"));
        }
        if !domain
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-' || c == '_')
        {
            return Err(invalid(
                "trust domain may only contain lowercase letters, digits, '.', '-' and '_'",
            ));
        }

        if path.len() < 2 || path.ends_with('/') || path.contains("//") {
            return Err(invalid("path must be non-empty without empty segments"));
        }

        let domain_start = scheme.len() + 3;
        Ok(Self {
            uri: value.to_string(),
            domain_start,
            path_start: domain_start + domain.len(),
        })
    }

    /// The full identity URI.
    pub fn as_str(&self) -> &str {
        &self.uri
    }

    /// The trust domain the identity belongs to (e.g. `example.org`).
    pub fn trust_domain(&self) -> &str {
        &self.uri[self.domain_start..self.path_start]
    }

    /// The workload path, including the leading `/`.
    pub fn path(&self) -> &str {
        &self.uri[self.path_start..]
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

impl FromStr for AgentId {
    type Err = TrustlinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AgentId {
    type Error = TrustlinkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.uri
    }
}

/// The identity an agent currently holds, with its validity bound.
///
/// Owned by the identity provider client and handed out by value; readers
/// must not use it once `expires_at` has passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// The URI-form identity bound to the certificate.
    pub id: AgentId,
    /// The certificate's `notAfter`.
    pub expires_at: DateTime<Utc>,
}

impl AgentIdentity {
    /// Construct an identity valid until `expires_at`.
    pub fn new(id: AgentId, expires_at: DateTime<Utc>) -> Self {
        Self { id, expires_at }
    }

    /// The trust domain of the underlying identity.
    pub fn trust_domain(&self) -> &str {
        self.id.trust_domain()
    }

    /// True once `now` has reached the expiry instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
