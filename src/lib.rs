//! A Sender Policy Framework (RFC 7208) `check_host()` evaluator.
//!
//! The crate owns the policy parser, the macro-expansion language, the
//! mechanism evaluators, and the recursive `check_host` orchestrator. It
//! performs no DNS I/O of its own: callers inject a [`dns::Resolver`]
//! (a production implementation over `hickory-resolver` is included).

pub mod config;
pub mod context;
pub mod dns;
pub mod error;
pub mod macros;
mod record;
#[cfg(test)]
mod tests;

pub use config::SpfConfig;
pub use context::SpfContext;
pub use dns::{HickoryResolver, Resolver};
pub use error::DnsError;

use context::validate_domain;
use record::Record;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpfDisposition {
    /// A result of "none" means either (a) no syntactically valid DNS
    /// domain name was extracted from the SMTP session that could be used
    /// as the one to be authorized, or (b) no SPF records were retrieved
    /// from the DNS.
    None,

    /// A "neutral" result means the ADMD has explicitly stated that it is
    /// not asserting whether the IP address is authorized.
    Neutral,

    /// A "pass" result is an explicit statement that the client is
    /// authorized to inject mail with the given identity.
    Pass,

    /// A "fail" result is an explicit statement that the client is not
    /// authorized to use the domain in the given identity.
    Fail,

    /// A "softfail" result is a weak statement by the publishing ADMD that
    /// the host is probably not authorized. It has not published a
    /// stronger, more definitive policy that results in a "fail".
    SoftFail,

    /// A "temperror" result means the SPF verifier encountered a transient
    /// (generally DNS) error while performing the check. A later retry
    /// may succeed without further DNS operator action.
    TempError,

    /// A "permerror" result means the domain's published records could
    /// not be correctly interpreted. This signals an error condition that
    /// definitely requires DNS operator intervention to be resolved.
    PermError,
}

impl fmt::Display for SpfDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Neutral => "neutral",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::SoftFail => "softfail",
            Self::TempError => "temperror",
            Self::PermError => "permerror",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpfResult {
    pub disposition: SpfDisposition,
    pub context: String,
}

/// Caller-supplied parameters for one top-level `check_host()` evaluation.
/// `ehlo_domain` and `relaying_host_name` are borrowed from the caller for
/// the lifetime of the check; `domain` and `sender` are owned so callers
/// can build this from transient SMTP session state.
pub struct CheckHostParams<'a> {
    /// The SMTP client's IP address.
    pub client_ip: IpAddr,
    /// The domain seeking authorization: the domain portion of "MAIL
    /// FROM", or the EHLO/HELO parameter when there is no MAIL FROM.
    pub domain: String,
    /// The full "MAIL FROM" (or HELO) mailbox identity. `None`, empty,
    /// whitespace-only, and `<>` are all treated as a null reverse-path.
    pub sender: Option<String>,
    /// The EHLO/HELO parameter presented by the client, if known. Fills
    /// the `%{h}` macro.
    pub ehlo_domain: Option<&'a str>,
    /// This host's own name, used to fill `%{r}` in explanation text. When
    /// `None`, falls back to [`SpfConfig::host_domain`]; if that is also
    /// unset, `%{r}` expands to the empty string.
    pub relaying_host_name: Option<&'a str>,
}

impl<'a> CheckHostParams<'a> {
    /// Runs `check_host()` with the default [`SpfConfig`] (10 DNS lookups,
    /// 2 void lookups).
    pub async fn check(&self, resolver: &dyn Resolver) -> SpfResult {
        self.check_with_config(resolver, &SpfConfig::default())
            .await
    }

    /// Runs `check_host()` with caller-supplied limits and explanation
    /// formatting. `config` is independent of `'a` (the struct's own
    /// lifetime, shared with `ehlo_domain`/`relaying_host_name`), so it may
    /// be as short-lived as a temporary built for this one call, e.g.
    /// `&SpfConfig::default()`.
    pub async fn check_with_config(
        &self,
        resolver: &dyn Resolver,
        config: &SpfConfig,
    ) -> SpfResult {
        let relaying_host_name = self
            .relaying_host_name
            .or(config.host_domain.as_deref())
            .unwrap_or("");
        let cx = SpfContext::new(
            self.sender.as_deref(),
            &self.domain,
            self.client_ip,
            self.ehlo_domain,
            relaying_host_name,
            config,
        );
        check_host(cx, resolver)
            .instrument(tracing::info_span!(
                "check_host",
                domain = %self.domain,
                client_ip = %self.client_ip,
            ))
            .await
    }
}

/// The recursive `check_host()` engine. Called by [`CheckHostParams::check`]
/// at the top level, and recursively by the `include` mechanism and the
/// `redirect` modifier — both reuse the caller's [`SpfContext`] (and its
/// shared lookup counters) with a new current domain.
pub(crate) async fn check_host(cx: SpfContext<'_, '_>, resolver: &dyn Resolver) -> SpfResult {
    if !validate_domain(&cx.domain) {
        return SpfResult {
            disposition: SpfDisposition::None,
            context: format!("'{}' is not a syntactically valid domain name", cx.domain),
        };
    }

    tracing::debug!(domain = %cx.domain, "fetching SPF record");
    let records = match resolver.resolve_txt(&cx.domain).await {
        Ok(records) => records,
        Err(DnsError::NotFound(_)) => Vec::new(),
        Err(DnsError::InvalidName(msg)) => {
            return SpfResult {
                disposition: SpfDisposition::None,
                context: msg,
            };
        }
        Err(DnsError::TempFail(msg)) => {
            return SpfResult {
                disposition: SpfDisposition::TempError,
                context: msg,
            };
        }
    };

    let mut spf_records = records.iter().filter(|r| is_spf_record(r));
    let text = match (spf_records.next(), spf_records.next()) {
        (None, _) => {
            return SpfResult {
                disposition: SpfDisposition::None,
                context: format!("'{}' has no SPF record", cx.domain),
            };
        }
        (Some(_), Some(_)) => {
            return SpfResult {
                disposition: SpfDisposition::PermError,
                context: format!("'{}' has more than one SPF record", cx.domain),
            };
        }
        (Some(only), None) => only,
    };

    let record = match Record::parse(text) {
        Ok(record) => record,
        Err(err) => {
            tracing::debug!(domain = %cx.domain, error = %err, "failed to parse SPF record");
            return SpfResult {
                disposition: SpfDisposition::PermError,
                context: "Invalid spf record syntax.".to_owned(),
            };
        }
    };

    match record.evaluate(&cx, resolver).await {
        Ok(result) => result,
        Err(abort) => abort.into(),
    }
}

/// `v=spf1`, matched case-insensitively, followed by end-of-string or a
/// space (RFC 7208 §4.5 — despite the RFC's "exactly" wording, real-world
/// publishers emit mixed-case version tokens and this check preserves
/// that leniency).
fn is_spf_record(s: &str) -> bool {
    s.eq_ignore_ascii_case("v=spf1") || s.get(..7).is_some_and(|p| p.eq_ignore_ascii_case("v=spf1 "))
}

