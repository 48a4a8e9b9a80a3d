use crate::dns::{IpDisplay, Resolver};
use crate::error::{Abort, DnsError};
use crate::macros::{MacroElement, MacroName, MacroString};
use crate::config::SpfConfig;
use hickory_resolver::Name;
use std::cell::{Cell, RefCell};
use std::fmt::Write as _;
use std::net::IpAddr;
use std::rc::Rc;
use std::str::FromStr;
use std::time::SystemTime;

/// Per-top-level-`check_host`-call counters, shared (via `Rc`, not copied)
/// across every recursive `include`/`redirect` frame. See DESIGN.md for why
/// a `Cell`-based shared struct replaces the "exception unwinds past a
/// mutable counter" shape of a hand-translated port.
pub(crate) struct Counters {
    lookups_used: Cell<u32>,
    void_lookups_used: Cell<u32>,
    lookup_limit: u32,
    void_lookup_limit: u32,
    /// The RFC 7208 §5.5 "validated domain names" for the call tree's
    /// (invariant) client IP. Shared because both the `ptr` mechanism and
    /// the `%{p}` macro compute the same set and either may populate it
    /// first.
    validated_ptr_cache: RefCell<Option<Rc<[Name]>>>,
}

impl Counters {
    fn new(config: &SpfConfig) -> Self {
        Self {
            lookups_used: Cell::new(0),
            void_lookups_used: Cell::new(0),
            lookup_limit: config.lookup_limit,
            void_lookup_limit: config.void_lookup_limit,
            validated_ptr_cache: RefCell::new(None),
        }
    }

    pub(crate) fn charge_lookup(&self) -> Result<(), Abort> {
        let used = self.lookups_used.get() + 1;
        if used > self.lookup_limit {
            return Err(Abort::perm("Maximum total DNS lookups exceeded."));
        }
        self.lookups_used.set(used);
        Ok(())
    }

    pub(crate) fn charge_void(&self) -> Result<(), Abort> {
        let used = self.void_lookups_used.get() + 1;
        if used > self.void_lookup_limit {
            return Err(Abort::perm("Maximum void DNS lookups exceeded."));
        }
        self.void_lookups_used.set(used);
        Ok(())
    }
}

/// Validates a domain per RFC 7208 §4.3: non-empty, at most 255 octets,
/// at least two labels, each label 1-63 octets.
pub(crate) fn validate_domain(domain: &str) -> bool {
    let domain = domain.strip_suffix('.').unwrap_or(domain);
    if domain.is_empty() || domain.len() > 255 {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|label| (1..=63).contains(&label.len()))
}

/// Normalizes a "MAIL FROM"/"HELO" sender identity, treating a missing,
/// empty, whitespace-only, or `<>` sender identically: all degrade to an
/// empty local-part and domain, which later fall back to `postmaster` and
/// the current domain respectively when expanding macros.
fn split_sender(sender: Option<&str>) -> (String, String) {
    let trimmed = sender.unwrap_or("").trim();
    if trimmed.is_empty() || trimmed == "<>" {
        return (String::new(), String::new());
    }
    match trimmed.split_once('@') {
        Some((local, domain)) => (local.to_string(), domain.to_string()),
        None => (trimmed.to_string(), String::new()),
    }
}

pub struct SpfContext<'a, 'cfg> {
    sender: String,
    local_part: String,
    sender_domain: String,
    pub(crate) domain: String,
    pub(crate) client_ip: IpAddr,
    ehlo_domain: Option<&'a str>,
    relaying_host_name: &'a str,
    now: SystemTime,
    pub(crate) config: &'cfg SpfConfig,
    counters: Rc<Counters>,
}

impl<'a, 'cfg> SpfContext<'a, 'cfg> {
    /// Creates a new, top-level evaluation context. `sender` is the "MAIL
    /// FROM" (or HELO, if MAIL FROM is unavailable) identity; `domain` is
    /// the domain seeking authorization (initially the domain portion of
    /// that identity); `client_ip` is the SMTP client's address. `config` is
    /// independent of `'a`: callers may evaluate against a short-lived
    /// (even temporary, e.g. `&SpfConfig::default()`) configuration value
    /// that doesn't live as long as `ehlo_domain`/`relaying_host_name`.
    pub fn new(
        sender: Option<&str>,
        domain: &str,
        client_ip: IpAddr,
        ehlo_domain: Option<&'a str>,
        relaying_host_name: &'a str,
        config: &'cfg SpfConfig,
    ) -> Self {
        let (local_part, sender_domain) = split_sender(sender);
        let sender = sender.unwrap_or("").trim().to_string();
        Self {
            sender,
            local_part,
            sender_domain,
            domain: domain.to_string(),
            client_ip,
            ehlo_domain,
            relaying_host_name,
            now: SystemTime::now(),
            config,
            counters: Rc::new(Counters::new(config)),
        }
    }

    /// Creates a context for a recursive `include`/`redirect` evaluation:
    /// same sender/IP/EHLO, shared counters, a new current domain. The new
    /// domain is always a freshly expanded `MacroString`, so it's owned
    /// rather than borrowed from the top-level caller's inputs.
    pub(crate) fn with_domain(&self, domain: String) -> Self {
        Self {
            sender: self.sender.clone(),
            local_part: self.local_part.clone(),
            sender_domain: self.sender_domain.clone(),
            domain,
            client_ip: self.client_ip,
            ehlo_domain: self.ehlo_domain,
            relaying_host_name: self.relaying_host_name,
            now: self.now,
            config: self.config,
            counters: Rc::clone(&self.counters),
        }
    }

    pub(crate) fn charge_lookup(&self) -> Result<(), Abort> {
        self.counters.charge_lookup()
    }

    pub(crate) fn charge_void(&self) -> Result<(), Abort> {
        self.counters.charge_void()
    }

    /// Expands a domain-spec, defaulting to the current domain when absent.
    pub(crate) async fn domain_spec(
        &self,
        spec: Option<&MacroString>,
        resolver: &dyn Resolver,
    ) -> Result<String, Abort> {
        match spec {
            Some(spec) => self.expand(spec, resolver).await,
            None => Ok(self.domain.to_owned()),
        }
    }

    /// Computes (and caches) the RFC 7208 §5.5 validated PTR name set for
    /// `client_ip`: up to 10 PTR-returned names, each forward-confirmed by
    /// an A/AAAA lookup that must include `client_ip`.
    pub(crate) async fn validated_ptr_names(
        &self,
        resolver: &dyn Resolver,
    ) -> Result<Rc<[Name]>, Abort> {
        if let Some(cached) = self.counters.validated_ptr_cache.borrow().as_ref() {
            return Ok(Rc::clone(cached));
        }

        self.charge_lookup()?;
        let candidates = match resolver.resolve_ptr(self.client_ip).await {
            Ok(names) if names.is_empty() => {
                self.charge_void()?;
                Vec::new()
            }
            Ok(names) => names,
            Err(DnsError::NotFound(_)) => {
                self.charge_void()?;
                Vec::new()
            }
            // RFC 7208 §5.5: any DNS error on the PTR query itself means
            // this client simply has no validated names; it never aborts.
            Err(DnsError::InvalidName(_)) | Err(DnsError::TempFail(_)) => Vec::new(),
        };

        let mut validated = Vec::new();
        for name in candidates.into_iter().take(10) {
            let host = name.to_utf8();
            let found = match self.client_ip {
                IpAddr::V4(_) => match resolver.resolve_a(&host).await {
                    Ok(addrs) if addrs.is_empty() => {
                        self.charge_void()?;
                        false
                    }
                    Ok(addrs) => addrs.iter().any(|a| IpAddr::V4(*a) == self.client_ip),
                    Err(DnsError::NotFound(_)) => {
                        self.charge_void()?;
                        false
                    }
                    Err(DnsError::InvalidName(_)) | Err(DnsError::TempFail(_)) => false,
                },
                IpAddr::V6(_) => match resolver.resolve_aaaa(&host).await {
                    Ok(addrs) if addrs.is_empty() => {
                        self.charge_void()?;
                        false
                    }
                    Ok(addrs) => addrs.iter().any(|a| IpAddr::V6(*a) == self.client_ip),
                    Err(DnsError::NotFound(_)) => {
                        self.charge_void()?;
                        false
                    }
                    Err(DnsError::InvalidName(_)) | Err(DnsError::TempFail(_)) => false,
                },
            };
            if found {
                validated.push(name);
            }
        }

        let validated: Rc<[Name]> = validated.into();
        *self.counters.validated_ptr_cache.borrow_mut() = Some(Rc::clone(&validated));
        Ok(validated)
    }

    /// Expands a macro string against this context. `%{p}` triggers the
    /// validated-PTR-name computation (an extra, budget-charged DNS lookup
    /// the first time it's needed in this call tree).
    pub(crate) async fn expand(
        &self,
        macro_string: &MacroString,
        resolver: &dyn Resolver,
    ) -> Result<String, Abort> {
        let (mut result, mut buf) = (String::new(), String::new());

        for element in &macro_string.elements {
            let term = match element {
                MacroElement::Literal(t) => {
                    result.push_str(t);
                    continue;
                }
                MacroElement::Macro(term) => term,
            };

            buf.clear();
            match term.name {
                MacroName::Sender => buf.push_str(&self.sender),
                MacroName::LocalPart => buf.push_str(if self.local_part.is_empty() {
                    "postmaster"
                } else {
                    &self.local_part
                }),
                MacroName::SenderDomain => buf.push_str(if self.sender_domain.is_empty() {
                    &self.domain
                } else {
                    &self.sender_domain
                }),
                MacroName::Domain => buf.push_str(&self.domain),
                MacroName::ReverseDns => buf.push_str(if self.client_ip.is_ipv4() {
                    "in-addr"
                } else {
                    "ip6"
                }),
                MacroName::ClientIp => {
                    write!(buf, "{}", self.client_ip).unwrap();
                }
                MacroName::Ip => write!(
                    buf,
                    "{}",
                    IpDisplay {
                        ip: self.client_ip,
                        reverse: false,
                    }
                )
                .unwrap(),
                MacroName::CurrentUnixTimeStamp => write!(
                    buf,
                    "{}",
                    self.now
                        .duration_since(SystemTime::UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0)
                )
                .unwrap(),
                MacroName::HeloDomain => buf.push_str(self.ehlo_domain.unwrap_or("")),
                MacroName::RelayingHostName => buf.push_str(self.relaying_host_name),
                MacroName::ValidatedDomainName => {
                    let names = self.validated_ptr_names(resolver).await?;
                    buf.push_str(match names.first() {
                        Some(name) => name.to_utf8(),
                        None => "unknown".to_string(),
                    }
                    .trim_end_matches('.'));
                }
            };

            let delimiters = if term.delimiters.is_empty() {
                "."
            } else {
                &term.delimiters
            };

            let mut tokens: Vec<&str> = buf.split(|c| delimiters.contains(c)).collect();

            if term.reverse {
                tokens.reverse();
            }

            if let Some(n) = term.transformer_digits {
                let n = n as usize;
                while tokens.len() > n {
                    tokens.remove(0);
                }
            }

            let output = tokens.join(".");

            if term.url_escape {
                // RFC 7208 §7.3: uppercase macros expand like their
                // lowercase equivalent, then get URL-escaped.
                // RFC 3986 §2.3: unreserved = ALPHA / DIGIT / "-" / "." / "_" / "~"
                for c in output.chars() {
                    if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~') {
                        result.push(c);
                    } else {
                        let mut bytes = [0u8; 4];
                        for b in c.encode_utf8(&mut bytes).bytes() {
                            let _ = write!(result, "%{b:02x}");
                        }
                    }
                }
            } else {
                result.push_str(&output);
            }
        }

        Ok(result)
    }

    /// Parses an expanded domain-spec into a DNS `Name`, mapping a
    /// malformed result to a PermError (an oversized or otherwise invalid
    /// expansion is a policy-authoring mistake, not a transient failure).
    pub(crate) fn parse_name(&self, domain: &str) -> Result<Name, Abort> {
        Name::from_str(domain)
            .map_err(|err| Abort::perm(format!("invalid domain name '{domain}': {err}")))
    }
}
