use crate::{SpfDisposition, SpfResult};
use thiserror::Error;

/// The three failure modes a [`crate::dns::Resolver`] may raise.
///
/// NXDOMAIN is deliberately distinct from an error: a resolver that finds no
/// records for a name it could otherwise resolve returns `Ok(vec![])`, not
/// `Err(DnsError::NotFound(..))`. `NotFound` is reserved for the case where
/// the resolver itself determined the name doesn't exist (NXDOMAIN), which
/// the evaluator still treats as an empty answer wherever the specification
/// calls for void-lookup accounting, but which is surfaced distinctly so a
/// production resolver can tell it apart from a transient failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    #[error("DNS record {0} not found")]
    NotFound(String),
    #[error("invalid DNS name: {0}")]
    InvalidName(String),
    #[error("DNS lookup failed: {0}")]
    TempFail(String),
}

/// The abort channel threaded through mechanism/record evaluation in place
/// of exceptions. An `Abort` unwinds the current `check_host` recursion
/// level (and any levels above it, via `?`) and is materialized into an
/// [`SpfResult`] exactly once, at the point a result is required. RFC 7208's
/// "none" disposition is never produced mid-evaluation (only by domain
/// validation and by a missing SPF record, both handled directly in
/// `check_host`), so this channel carries only the two abort kinds that can
/// actually arise from inside mechanism/record evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Abort {
    PermError(String),
    TempError(String),
}

impl Abort {
    pub(crate) fn perm(msg: impl Into<String>) -> Self {
        Self::PermError(msg.into())
    }

    pub(crate) fn temp(msg: impl Into<String>) -> Self {
        Self::TempError(msg.into())
    }
}

impl From<Abort> for SpfResult {
    fn from(abort: Abort) -> Self {
        match abort {
            Abort::PermError(context) => SpfResult {
                disposition: SpfDisposition::PermError,
                context,
            },
            Abort::TempError(context) => SpfResult {
                disposition: SpfDisposition::TempError,
                context,
            },
        }
    }
}
