//! Sender Policy Framework (RFC 7208) evaluator.
//!
//! Given an SMTP session's identities (client IP, HELO/EHLO name, MAIL FROM)
//! and a target domain, [`SpfVerifier::check_host`] resolves the domain's SPF
//! policy over DNS, evaluates it, and returns an [`SpfResult`].
//!
//! DNS caching is the caller's responsibility. This crate talks to DNS
//! through the [`dns::DnsResolver`] trait — implement it with caching at the
//! resolver layer.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod cidr;
pub mod dns;
pub mod domain;
pub mod eval;
pub mod lookup;
pub mod macros;
pub mod mechanism;
pub mod record;

pub use eval::SpfVerifier;
pub use mechanism::{Directive, DualCidr, Mechanism, Qualifier, SpfParseError};
pub use record::SpfRecord;

/// SPF evaluation outcome (RFC 7208 Section 2.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpfDisposition {
    /// No SPF record was published for the domain.
    None,
    /// The domain explicitly makes no assertion about the client.
    Neutral,
    /// The client is authorized to send for the domain.
    Pass,
    /// The client is not authorized to send for the domain.
    Fail,
    /// The client is probably not authorized; the domain declined to
    /// publish a stronger policy.
    SoftFail,
    /// A transient DNS failure interrupted the evaluation; retry later.
    TempError,
    /// The published record could not be interpreted, or an RFC-mandated
    /// processing limit was exceeded.
    PermError,
}

impl From<Qualifier> for SpfDisposition {
    fn from(qualifier: Qualifier) -> Self {
        match qualifier {
            Qualifier::Pass => Self::Pass,
            Qualifier::Fail => Self::Fail,
            Qualifier::SoftFail => Self::SoftFail,
            Qualifier::Neutral => Self::Neutral,
        }
    }
}

impl fmt::Display for SpfDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Neutral => write!(f, "neutral"),
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::SoftFail => write!(f, "softfail"),
            Self::TempError => write!(f, "temperror"),
            Self::PermError => write!(f, "permerror"),
        }
    }
}

/// Outcome of one SPF evaluation.
///
/// Immutable; carries enough context for a caller to render a
/// `Received-SPF` header (rendering itself is out of scope here).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpfResult {
    pub disposition: SpfDisposition,
    /// The directive that matched, rendered back to record syntax
    /// (e.g. `-all`, `ip4:192.0.2.0/24`). Absent when no directive matched.
    pub mechanism: Option<String>,
    /// One-line human-readable reason for the disposition.
    pub context: String,
    /// Explanation text resolved from the `exp=` modifier. Only ever set on
    /// `Fail`, and only when the explanation resolved cleanly.
    pub explanation: Option<String>,
}

impl SpfResult {
    pub(crate) fn none(context: impl Into<String>) -> Self {
        Self::undetermined(SpfDisposition::None, context)
    }

    pub(crate) fn neutral(context: impl Into<String>) -> Self {
        Self::undetermined(SpfDisposition::Neutral, context)
    }

    pub(crate) fn temperror(context: impl Into<String>) -> Self {
        Self::undetermined(SpfDisposition::TempError, context)
    }

    pub(crate) fn permerror(context: impl Into<String>) -> Self {
        Self::undetermined(SpfDisposition::PermError, context)
    }

    fn undetermined(disposition: SpfDisposition, context: impl Into<String>) -> Self {
        Self {
            disposition,
            mechanism: None,
            context: context.into(),
            explanation: None,
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self.disposition, SpfDisposition::Pass)
    }
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.disposition, self.context)
    }
}
