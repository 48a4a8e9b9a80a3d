//! The SPF policy grammar: qualifiers, mechanisms, modifiers, and the
//! directive loop that `check_host` drives. See RFC 7208 §4-6.

use crate::context::SpfContext;
use crate::dns::Resolver;
use crate::error::{Abort, DnsError};
use crate::macros::MacroString;
use crate::{SpfDisposition, SpfResult};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Qualifier {
    /// `+`
    #[default]
    Pass,
    /// `-`
    Fail,
    /// `~`
    SoftFail,
    /// `?`
    Neutral,
}

impl Qualifier {
    fn parse(c: char) -> Option<Self> {
        Some(match c {
            '+' => Self::Pass,
            '-' => Self::Fail,
            '~' => Self::SoftFail,
            '?' => Self::Neutral,
            _ => return None,
        })
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "+",
            Self::Fail => "-",
            Self::SoftFail => "~",
            Self::Neutral => "?",
        }
    }
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

/// The `["/" ip4-cidr] ["//" ip6-cidr]` suffix shared by the `a` and `mx`
/// mechanisms. Only one of the two fields is meaningful for any given
/// client IP family, but both are kept so `a`/`mx` can defer the family
/// choice to the resolved address.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DualCidrLength {
    pub v4: u8,
    pub v6: u8,
}

impl Default for DualCidrLength {
    fn default() -> Self {
        Self { v4: 32, v6: 128 }
    }
}

impl DualCidrLength {
    fn matches(&self, observed: IpAddr, candidate: IpAddr) -> bool {
        cidr_match(observed, candidate, self.v4, self.v6)
    }

    /// Splits a trailing `["/" v4][("//" | "/") v6]` suffix off `s`,
    /// defaulting to full-length masks when absent. PermErrors on an
    /// out-of-range length.
    fn parse_from_end(s: &str) -> Result<(&str, Self), String> {
        let Some((left, v6_part)) = s.split_once("//") else {
            return match s.rsplit_once('/') {
                Some((left, v4_part)) => {
                    let v4: u8 = v4_part
                        .parse()
                        .map_err(|err| format!("invalid cidr length '{v4_part}': {err}"))?;
                    if v4 > 32 {
                        return Err(format!("ip4 cidr length {v4} out of range"));
                    }
                    Ok((
                        left,
                        Self {
                            v4,
                            ..Self::default()
                        },
                    ))
                }
                None => Ok((s, Self::default())),
            };
        };

        let v6: u8 = v6_part
            .parse()
            .map_err(|err| format!("invalid cidr length '{v6_part}': {err}"))?;
        if v6 > 128 {
            return Err(format!("ip6 cidr length {v6} out of range"));
        }

        match left.rsplit_once('/') {
            Some((prefix, v4_part)) => {
                let v4: u8 = v4_part
                    .parse()
                    .map_err(|err| format!("invalid cidr length '{v4_part}': {err}"))?;
                if v4 > 32 {
                    return Err(format!("ip4 cidr length {v4} out of range"));
                }
                Ok((prefix, Self { v4, v6 }))
            }
            None => Ok((
                left,
                Self {
                    v6,
                    ..Self::default()
                },
            )),
        }
    }
}

impl fmt::Display for DualCidrLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.v4 != 32 {
            write!(f, "/{}", self.v4)?;
        }
        if self.v6 != 128 {
            write!(f, "//{}", self.v6)?;
        }
        Ok(())
    }
}

fn cidr_match(observed: IpAddr, candidate: IpAddr, v4_len: u8, v6_len: u8) -> bool {
    match (observed, candidate) {
        (IpAddr::V4(observed), IpAddr::V4(candidate)) => {
            let mask = (u32::MAX)
                .checked_shl(32 - v4_len as u32)
                .unwrap_or(0);
            u32::from(observed) & mask == u32::from(candidate) & mask
        }
        (IpAddr::V6(observed), IpAddr::V6(candidate)) => {
            let mask = (u128::MAX)
                .checked_shl(128 - v6_len as u32)
                .unwrap_or(0);
            u128::from(observed) & mask == u128::from(candidate) & mask
        }
        _ => false,
    }
}

#[derive(Debug)]
pub(crate) enum Mechanism {
    All,
    Include {
        domain: MacroString,
    },
    A {
        domain: Option<MacroString>,
        cidr: DualCidrLength,
    },
    Mx {
        domain: Option<MacroString>,
        cidr: DualCidrLength,
    },
    Ptr {
        domain: Option<MacroString>,
    },
    Ip4 {
        network: Ipv4Addr,
        cidr: u8,
    },
    Ip6 {
        network: Ipv6Addr,
        cidr: u8,
    },
    Exists {
        domain: MacroString,
    },
}

fn starts_with_ident<'a>(s: &'a str, ident: &str) -> Option<&'a str> {
    if s.len() < ident.len() || !s[..ident.len()].eq_ignore_ascii_case(ident) {
        return None;
    }
    Some(&s[ident.len()..])
}

fn parse_optional_domain(remain: &str, s: &str) -> Result<Option<MacroString>, String> {
    if let Some(spec) = remain.strip_prefix(':') {
        Ok(Some(
            MacroString::parse(spec, false).map_err(|err| format!("in '{s}': {err}"))?,
        ))
    } else if remain.is_empty() {
        Ok(None)
    } else {
        Err(format!("invalid mechanism '{s}'"))
    }
}

impl Mechanism {
    fn parse(s: &str) -> Result<Self, String> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        if let Some(spec) = starts_with_ident(s, "include:") {
            return Ok(Self::Include {
                domain: MacroString::parse(spec, false)?,
            });
        }
        if let Some(remain) = starts_with_ident(s, "a") {
            let (remain, cidr) = DualCidrLength::parse_from_end(remain)?;
            return Ok(Self::A {
                domain: parse_optional_domain(remain, s)?,
                cidr,
            });
        }
        if let Some(remain) = starts_with_ident(s, "mx") {
            let (remain, cidr) = DualCidrLength::parse_from_end(remain)?;
            return Ok(Self::Mx {
                domain: parse_optional_domain(remain, s)?,
                cidr,
            });
        }
        if let Some(remain) = starts_with_ident(s, "ptr") {
            return Ok(Self::Ptr {
                domain: parse_optional_domain(remain, s)?,
            });
        }
        if let Some(remain) = starts_with_ident(s, "ip4:") {
            let (addr, len) = remain
                .split_once('/')
                .ok_or_else(|| format!("invalid 'ip4' mechanism: {s}"))?;
            let network: Ipv4Addr = addr
                .parse()
                .map_err(|err| format!("invalid 'ip4' mechanism: {s}: {err}"))?;
            let cidr: u8 = len
                .parse()
                .map_err(|err| format!("invalid 'ip4' mechanism: {s}: {err}"))?;
            if cidr > 32 {
                return Err(format!("ip4 cidr length {cidr} out of range in '{s}'"));
            }
            return Ok(Self::Ip4 { network, cidr });
        }
        if let Some(remain) = starts_with_ident(s, "ip6:") {
            let (addr, len) = remain
                .split_once('/')
                .ok_or_else(|| format!("invalid 'ip6' mechanism: {s}"))?;
            let network: Ipv6Addr = addr
                .parse()
                .map_err(|err| format!("invalid 'ip6' mechanism: {s}: {err}"))?;
            let cidr: u8 = len
                .parse()
                .map_err(|err| format!("invalid 'ip6' mechanism: {s}: {err}"))?;
            if cidr > 128 {
                return Err(format!("ip6 cidr length {cidr} out of range in '{s}'"));
            }
            return Ok(Self::Ip6 { network, cidr });
        }
        if let Some(spec) = starts_with_ident(s, "exists:") {
            return Ok(Self::Exists {
                domain: MacroString::parse(spec, false)?,
            });
        }

        Err(format!("invalid mechanism '{s}'"))
    }

    /// Dispatches to the per-kind evaluator. Charges lookups/void-lookups
    /// against the shared counters per the accounting table in §4.4 of the
    /// specification; returns `Ok(true)` on match, `Ok(false)` on no-match,
    /// `Err(Abort)` when the mechanism (or the budget) aborts evaluation.
    async fn evaluate(&self, cx: &SpfContext<'_, '_>, resolver: &dyn Resolver) -> Result<bool, Abort> {
        match self {
            Self::All => Ok(true),
            Self::Ip4 { network, cidr } => {
                Ok(cidr_match(cx.client_ip, IpAddr::V4(*network), *cidr, 0))
            }
            Self::Ip6 { network, cidr } => {
                Ok(cidr_match(cx.client_ip, IpAddr::V6(*network), 0, *cidr))
            }
            Self::A { domain, cidr } => {
                cx.charge_lookup()?;
                let domain = cx.domain_spec(domain.as_ref(), resolver).await?;
                let addrs = resolve_own_address(cx, resolver, &domain).await?;
                Ok(addrs.iter().any(|ip| cidr.matches(cx.client_ip, *ip)))
            }
            Self::Mx { domain, cidr } => {
                cx.charge_lookup()?;
                let domain = cx.domain_spec(domain.as_ref(), resolver).await?;
                let exchanges = match resolver.resolve_mx(&domain).await {
                    Ok(exchanges) => {
                        if exchanges.is_empty() {
                            cx.charge_void()?;
                        }
                        exchanges
                    }
                    Err(DnsError::NotFound(_)) => {
                        cx.charge_void()?;
                        Vec::new()
                    }
                    Err(DnsError::InvalidName(msg)) => return Err(Abort::perm(msg)),
                    Err(DnsError::TempFail(msg)) => return Err(Abort::temp(msg)),
                };
                if exchanges.len() > 10 {
                    return Err(Abort::perm(format!(
                        "mx mechanism for '{domain}' returned more than 10 MX records"
                    )));
                }

                for exchange in exchanges {
                    let host = exchange.to_utf8();
                    let host = host.trim_end_matches('.');
                    if let Some(addrs) = resolve_mx_target(cx, resolver, host).await? {
                        if addrs.iter().any(|ip| cidr.matches(cx.client_ip, *ip)) {
                            return Ok(true);
                        }
                    }
                }
                Ok(false)
            }
            Self::Ptr { domain } => {
                let target = cx.domain_spec(domain.as_ref(), resolver).await?;
                let target = cx.parse_name(&target)?;
                let validated = cx.validated_ptr_names(resolver).await?;
                Ok(validated
                    .iter()
                    .any(|name| name == &target || target.zone_of(name)))
            }
            Self::Exists { domain } => {
                cx.charge_lookup()?;
                let domain = cx.domain_spec(Some(domain), resolver).await?;
                match resolver.resolve_a(&domain).await {
                    Ok(addrs) => {
                        if addrs.is_empty() {
                            cx.charge_void()?;
                        }
                        Ok(!addrs.is_empty())
                    }
                    Err(DnsError::NotFound(_)) => {
                        cx.charge_void()?;
                        Ok(false)
                    }
                    Err(DnsError::InvalidName(msg)) => Err(Abort::perm(msg)),
                    Err(DnsError::TempFail(msg)) => Err(Abort::temp(msg)),
                }
            }
            Self::Include { domain } => {
                cx.charge_lookup()?;
                let domain = cx.domain_spec(Some(domain), resolver).await?;
                let nested = cx.with_domain(domain.clone());
                let result = Box::pin(crate::check_host(nested, resolver)).await;
                match result.disposition {
                    SpfDisposition::Pass => Ok(true),
                    SpfDisposition::Fail | SpfDisposition::SoftFail | SpfDisposition::Neutral => {
                        Ok(false)
                    }
                    SpfDisposition::TempError => Err(Abort::temp(format!(
                        "temperror while evaluating include:{domain}: {}",
                        result.context
                    ))),
                    SpfDisposition::None => Err(Abort::perm(format!(
                        "included domain '{domain}' has no SPF record"
                    ))),
                    SpfDisposition::PermError => Err(Abort::perm(format!(
                        "permerror while evaluating include:{domain}: {}",
                        result.context
                    ))),
                }
            }
        }
    }
}

/// A/exists/mx's own domain query: empty or NXDOMAIN is a void lookup (not
/// a match), a malformed name is a PermError, and a transient failure is a
/// TempError. Used for `a` and (via the MX-target loop) `mx`'s exchanges.
async fn resolve_own_address(
    cx: &SpfContext<'_, '_>,
    resolver: &dyn Resolver,
    domain: &str,
) -> Result<Vec<IpAddr>, Abort> {
    if cx.client_ip.is_ipv4() {
        match resolver.resolve_a(domain).await {
            Ok(addrs) => {
                if addrs.is_empty() {
                    cx.charge_void()?;
                }
                Ok(addrs.into_iter().map(IpAddr::V4).collect())
            }
            Err(DnsError::NotFound(_)) => {
                cx.charge_void()?;
                Ok(Vec::new())
            }
            Err(DnsError::InvalidName(msg)) => Err(Abort::perm(msg)),
            Err(DnsError::TempFail(msg)) => Err(Abort::temp(msg)),
        }
    } else {
        match resolver.resolve_aaaa(domain).await {
            Ok(addrs) => {
                if addrs.is_empty() {
                    cx.charge_void()?;
                }
                Ok(addrs.into_iter().map(IpAddr::V6).collect())
            }
            Err(DnsError::NotFound(_)) => {
                cx.charge_void()?;
                Ok(Vec::new())
            }
            Err(DnsError::InvalidName(msg)) => Err(Abort::perm(msg)),
            Err(DnsError::TempFail(msg)) => Err(Abort::temp(msg)),
        }
    }
}

/// An MX exchange's A/AAAA sub-query. `NotFound`/empty charges a void
/// lookup and moves on to the next exchange (`Some(vec![])`), an
/// `InvalidName` sub-result skips this target without a void charge
/// (`None`), and a `TempFail` aborts the whole `mx` mechanism.
async fn resolve_mx_target(
    cx: &SpfContext<'_, '_>,
    resolver: &dyn Resolver,
    host: &str,
) -> Result<Option<Vec<IpAddr>>, Abort> {
    if cx.client_ip.is_ipv4() {
        match resolver.resolve_a(host).await {
            Ok(addrs) => {
                if addrs.is_empty() {
                    cx.charge_void()?;
                }
                Ok(Some(addrs.into_iter().map(IpAddr::V4).collect()))
            }
            Err(DnsError::NotFound(_)) => {
                cx.charge_void()?;
                Ok(Some(Vec::new()))
            }
            Err(DnsError::InvalidName(_)) => Ok(None),
            Err(DnsError::TempFail(msg)) => Err(Abort::temp(msg)),
        }
    } else {
        match resolver.resolve_aaaa(host).await {
            Ok(addrs) => {
                if addrs.is_empty() {
                    cx.charge_void()?;
                }
                Ok(Some(addrs.into_iter().map(IpAddr::V6).collect()))
            }
            Err(DnsError::NotFound(_)) => {
                cx.charge_void()?;
                Ok(Some(Vec::new()))
            }
            Err(DnsError::InvalidName(_)) => Ok(None),
            Err(DnsError::TempFail(msg)) => Err(Abort::temp(msg)),
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Include { domain } => write!(f, "include:{domain}"),
            Self::A { domain, cidr } => {
                write!(f, "a")?;
                if let Some(domain) = domain {
                    write!(f, ":{domain}")?;
                }
                write!(f, "{cidr}")
            }
            Self::Mx { domain, cidr } => {
                write!(f, "mx")?;
                if let Some(domain) = domain {
                    write!(f, ":{domain}")?;
                }
                write!(f, "{cidr}")
            }
            Self::Ptr { domain } => {
                write!(f, "ptr")?;
                if let Some(domain) = domain {
                    write!(f, ":{domain}")?;
                }
                Ok(())
            }
            Self::Ip4 { network, cidr } => write!(f, "ip4:{network}/{cidr}"),
            Self::Ip6 { network, cidr } => write!(f, "ip6:{network}/{cidr}"),
            Self::Exists { domain } => write!(f, "exists:{domain}"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Directive {
    qualifier: Qualifier,
    mechanism: Mechanism,
}

impl Directive {
    fn parse(s: &str) -> Result<Self, String> {
        let mut chars = s.chars();
        let (qualifier, rest) = match chars.next().and_then(Qualifier::parse) {
            Some(q) => (q, chars.as_str()),
            None => (Qualifier::default(), s),
        };

        Ok(Self {
            qualifier,
            mechanism: Mechanism::parse(rest)?,
        })
    }

    pub(crate) async fn evaluate(
        &self,
        cx: &SpfContext<'_, '_>,
        resolver: &dyn Resolver,
    ) -> Result<Option<SpfResult>, Abort> {
        Ok(self
            .mechanism
            .evaluate(cx, resolver)
            .await?
            .then(|| SpfResult {
                disposition: self.qualifier.into(),
                context: format!("matched '{self}' directive"),
            }))
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.qualifier != Qualifier::Pass {
            f.write_str(self.qualifier.as_str())?;
        }
        write!(f, "{}", self.mechanism)
    }
}

#[derive(Debug)]
enum Modifier {
    Redirect(MacroString),
    Explanation(MacroString),
    Unknown,
}

impl Modifier {
    fn parse(s: &str) -> Result<Self, String> {
        if let Some(spec) = starts_with_ident(s, "redirect=") {
            return Ok(Self::Redirect(MacroString::parse(spec, false)?));
        }
        if let Some(spec) = starts_with_ident(s, "exp=") {
            return Ok(Self::Explanation(MacroString::parse(spec, true)?));
        }

        let (name, value) = s
            .split_once('=')
            .ok_or_else(|| format!("invalid modifier '{s}'"))?;

        let valid = !name.is_empty()
            && name.starts_with(|c: char| c.is_ascii_alphabetic())
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(format!("modifier name '{name}' is invalid"));
        }

        // Unknown modifiers must still be syntactically valid macro strings,
        // but their value is discarded: RFC 7208 requires verifiers to
        // parse and ignore them, even when repeated.
        MacroString::parse(value, false)?;
        Ok(Self::Unknown)
    }
}

/// A parsed SPF policy: the `v=spf1` record minus its version term.
#[derive(Debug, Default)]
pub(crate) struct Record {
    directives: Vec<Directive>,
    redirect: Option<MacroString>,
    explanation: Option<MacroString>,
}

impl Record {
    pub(crate) fn parse(s: &str) -> Result<Self, String> {
        let mut tokens = s.split(' ').filter(|t| !t.is_empty());
        let version = tokens.next().ok_or("empty record")?;
        if !version.eq_ignore_ascii_case("v=spf1") {
            return Err(format!("expected 'v=spf1', found '{version}'"));
        }

        let mut record = Self::default();
        for token in tokens {
            if let Ok(directive) = Directive::parse(token) {
                record.directives.push(directive);
                continue;
            }

            match Modifier::parse(token)? {
                Modifier::Redirect(value) => {
                    if record.redirect.is_some() {
                        return Err("duplicate redirect modifier".to_owned());
                    }
                    record.redirect = Some(value);
                }
                Modifier::Explanation(value) => {
                    if record.explanation.is_some() {
                        return Err("duplicate exp modifier".to_owned());
                    }
                    record.explanation = Some(value);
                }
                Modifier::Unknown => {}
            }
        }

        Ok(record)
    }

    fn has_all(&self) -> bool {
        self.directives
            .iter()
            .any(|d| matches!(d.mechanism, Mechanism::All))
    }

    /// Drives the directive loop, `redirect`, and `exp` per §4.5 of the
    /// specification. Returns `Err(Abort)` only for conditions that should
    /// unwind past `include` recursion; everything else is collapsed into
    /// an `Ok(SpfResult)` by the caller at the top of `check_host`.
    pub(crate) async fn evaluate(
        &self,
        cx: &SpfContext<'_, '_>,
        resolver: &dyn Resolver,
    ) -> Result<SpfResult, Abort> {
        for directive in &self.directives {
            if let Some(mut result) = directive.evaluate(cx, resolver).await? {
                if result.disposition == SpfDisposition::Fail {
                    result.context = self.explain(cx, resolver, result.context).await;
                }
                return Ok(result);
            }
        }

        if !self.has_all() {
            if let Some(redirect) = &self.redirect {
                // The redirected domain's own `check_host` call applies its
                // own record's `exp`; this record's `exp` (if any) is
                // discarded once `redirect` is followed, per RFC 7208
                // §6.1.
                cx.charge_lookup()?;
                let domain = cx.expand(redirect, resolver).await?;
                let nested = cx.with_domain(domain.clone());
                let result = Box::pin(crate::check_host(nested, resolver)).await;
                return match result.disposition {
                    SpfDisposition::None => Err(Abort::perm(format!(
                        "redirected domain '{domain}' has no SPF record"
                    ))),
                    _ => Ok(result),
                };
            }
        }

        // `all` always matches, so reaching here means there was no `all`
        // and either there was no `redirect` or it was already handled
        // above.
        Ok(SpfResult {
            disposition: SpfDisposition::Neutral,
            context: "No directives matched.".to_owned(),
        })
    }

    /// Applies the `exp` modifier to a `Fail` result, per §4.5 step 6.
    /// Any failure along the way (DNS, multiple/zero TXT records,
    /// non-ASCII text, macro-expansion failure) keeps `default_context`.
    pub(crate) async fn explain(
        &self,
        cx: &SpfContext<'_, '_>,
        resolver: &dyn Resolver,
        default_context: String,
    ) -> String {
        let Some(explanation) = &self.explanation else {
            return default_context;
        };

        let domain = match cx.expand(explanation, resolver).await {
            Ok(domain) => domain,
            Err(_) => return default_context,
        };

        let records = match resolver.resolve_txt(&domain).await {
            Ok(records) if records.len() == 1 => records,
            _ => return default_context,
        };
        let text = &records[0];
        if !text.is_ascii() {
            return default_context;
        }

        let spec = match MacroString::parse(text, true) {
            Ok(spec) => spec,
            Err(_) => return default_context,
        };

        match cx.expand(&spec, resolver).await {
            Ok(expanded) => format!(
                "{}{expanded}",
                cx.config.explain_prefix.replace("{domain}", &cx.domain)
            ),
            Err(_) => default_context,
        }
    }
}
