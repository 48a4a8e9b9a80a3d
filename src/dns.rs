use crate::error::DnsError;
use async_trait::async_trait;
use hickory_resolver::proto::ResolveError;
use hickory_resolver::Name;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Abstract DNS façade consumed by the evaluator. Implementations report
/// three distinct failure modes (see [`DnsError`]); everything else flows
/// back as a plain, possibly-empty, `Vec`.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve_txt(&self, name: &str) -> Result<Vec<String>, DnsError>;
    async fn resolve_a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError>;
    async fn resolve_aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError>;
    async fn resolve_mx(&self, name: &str) -> Result<Vec<Name>, DnsError>;
    async fn resolve_ptr(&self, ip: IpAddr) -> Result<Vec<Name>, DnsError>;
}

fn parse_name(name: &str) -> Result<Name, DnsError> {
    Name::from_str(name).map_err(|err| DnsError::InvalidName(format!("{name}: {err}")))
}

fn from_resolve_error(name: &impl fmt::Display, err: ResolveError) -> DnsError {
    use hickory_resolver::proto::ProtoErrorKind;
    match err.proto().map(|proto| proto.kind()) {
        Some(ProtoErrorKind::NoRecordsFound { .. }) => DnsError::NotFound(name.to_string()),
        _ => DnsError::TempFail(format!("failed to query DNS for {name}: {err}")),
    }
}

/// Production resolver backed by `hickory-resolver`'s Tokio runtime
/// integration.
pub struct HickoryResolver {
    inner: hickory_resolver::TokioResolver,
}

impl HickoryResolver {
    pub fn new() -> Result<Self, ResolveError> {
        Ok(Self {
            inner: hickory_resolver::TokioResolver::builder_tokio()?.build(),
        })
    }
}

impl From<hickory_resolver::TokioResolver> for HickoryResolver {
    fn from(inner: hickory_resolver::TokioResolver) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Resolver for HickoryResolver {
    async fn resolve_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let parsed = parse_name(name)?;
        self.inner
            .txt_lookup(parsed)
            .await
            .map_err(|err| from_resolve_error(&name, err))?
            .into_iter()
            .map(|txt| {
                Ok(txt
                    .iter()
                    .map(|data| String::from_utf8_lossy(data))
                    .collect())
            })
            .collect()
    }

    async fn resolve_a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        let parsed = parse_name(name)?;
        self.inner
            .ipv4_lookup(parsed)
            .await
            .map_err(|err| from_resolve_error(&name, err))?
            .into_iter()
            .map(|a| Ok(a.0))
            .collect()
    }

    async fn resolve_aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        let parsed = parse_name(name)?;
        self.inner
            .ipv6_lookup(parsed)
            .await
            .map_err(|err| from_resolve_error(&name, err))?
            .into_iter()
            .map(|a| Ok(a.0))
            .collect()
    }

    async fn resolve_mx(&self, name: &str) -> Result<Vec<Name>, DnsError> {
        let parsed = parse_name(name)?;
        self.inner
            .mx_lookup(parsed)
            .await
            .map_err(|err| from_resolve_error(&name, err))?
            .into_iter()
            .map(|mx| Ok(mx.exchange().clone()))
            .collect()
    }

    async fn resolve_ptr(&self, ip: IpAddr) -> Result<Vec<Name>, DnsError> {
        self.inner
            .reverse_lookup(ip)
            .await
            .map_err(|err| from_resolve_error(&ip, err))?
            .into_iter()
            .map(|ptr| Ok(ptr.0))
            .collect()
    }
}

/// Formats an IP address in SPF's `%{i}`/PTR-reverse-name conventions: v4 is
/// rendered as dotted octets (optionally reversed), v6 as dot-separated
/// nibbles (optionally reversed, with each byte's nibbles swapped too so the
/// overall nibble order comes out right for `*.ip6.arpa`).
pub(crate) struct IpDisplay {
    pub ip: IpAddr,
    pub reverse: bool,
}

impl fmt::Display for IpDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(v4) => {
                let mut bytes = v4.octets();
                if self.reverse {
                    bytes.reverse();
                }
                let mut first = true;
                for byte in bytes {
                    if !first {
                        f.write_str(".")?;
                    }
                    write!(f, "{byte}")?;
                    first = false;
                }
                Ok(())
            }
            IpAddr::V6(v6) => {
                let mut bytes = v6.octets();
                if self.reverse {
                    bytes.reverse();
                }
                let mut first = true;
                for byte in bytes {
                    if !first {
                        f.write_str(".")?;
                    }
                    let (upper, lower) = (byte >> 4, byte & 0xf);
                    if self.reverse {
                        write!(f, "{lower:x}.{upper:x}")?;
                    } else {
                        write!(f, "{upper:x}.{lower:x}")?;
                    }
                    first = false;
                }
                Ok(())
            }
        }
    }
}

/// The reverse-DNS query name for `ip`: `a.b.c.d.in-addr.arpa` for v4,
/// nibble-reversed `*.ip6.arpa` for v6.
pub(crate) fn reverse_name(ip: IpAddr) -> String {
    let mut out = IpDisplay { ip, reverse: true }.to_string();
    out.push_str(match ip {
        IpAddr::V4(_) => ".in-addr.arpa",
        IpAddr::V6(_) => ".ip6.arpa",
    });
    out
}
