use crate::dns::Resolver;
use crate::error::DnsError;
use crate::{CheckHostParams, SpfDisposition, SpfResult};
use async_trait::async_trait;
use hickory_resolver::Name;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An in-memory zone file, fluent-built per test. A name absent from every
/// map resolves as `NotFound` (NXDOMAIN), matching how real authoritative
/// answers come back for names nobody published.
#[derive(Default)]
struct TestResolver {
    txt: HashMap<String, Vec<String>>,
    a: HashMap<String, Vec<Ipv4Addr>>,
    aaaa: HashMap<String, Vec<Ipv6Addr>>,
    mx: HashMap<String, Vec<Name>>,
    ptr: HashMap<IpAddr, Vec<Name>>,
    tempfail: HashSet<String>,
}

impl TestResolver {
    fn with_txt(mut self, name: &str, value: &str) -> Self {
        self.txt
            .entry(name.to_owned())
            .or_default()
            .push(value.to_owned());
        self
    }

    fn with_a(mut self, name: &str, ip: Ipv4Addr) -> Self {
        self.a.entry(name.to_owned()).or_default().push(ip);
        self
    }

    fn with_aaaa(mut self, name: &str, ip: Ipv6Addr) -> Self {
        self.aaaa.entry(name.to_owned()).or_default().push(ip);
        self
    }

    fn with_mx(mut self, name: &str, exchange: &str) -> Self {
        self.mx
            .entry(name.to_owned())
            .or_default()
            .push(Name::from_str(exchange).unwrap());
        self
    }

    fn with_ptr(mut self, ip: IpAddr, name: &str) -> Self {
        self.ptr
            .entry(ip)
            .or_default()
            .push(Name::from_str(name).unwrap());
        self
    }

    fn with_tempfail(mut self, name: &str) -> Self {
        self.tempfail.insert(name.to_owned());
        self
    }
}

#[async_trait]
impl Resolver for TestResolver {
    async fn resolve_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        if self.tempfail.contains(name) {
            return Err(DnsError::TempFail(format!("simulated failure for {name}")));
        }
        self.txt
            .get(name)
            .cloned()
            .ok_or_else(|| DnsError::NotFound(name.to_owned()))
    }

    async fn resolve_a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        if self.tempfail.contains(name) {
            return Err(DnsError::TempFail(format!("simulated failure for {name}")));
        }
        self.a
            .get(name)
            .cloned()
            .ok_or_else(|| DnsError::NotFound(name.to_owned()))
    }

    async fn resolve_aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        if self.tempfail.contains(name) {
            return Err(DnsError::TempFail(format!("simulated failure for {name}")));
        }
        self.aaaa
            .get(name)
            .cloned()
            .ok_or_else(|| DnsError::NotFound(name.to_owned()))
    }

    async fn resolve_mx(&self, name: &str) -> Result<Vec<Name>, DnsError> {
        if self.tempfail.contains(name) {
            return Err(DnsError::TempFail(format!("simulated failure for {name}")));
        }
        self.mx
            .get(name)
            .cloned()
            .ok_or_else(|| DnsError::NotFound(name.to_owned()))
    }

    async fn resolve_ptr(&self, ip: IpAddr) -> Result<Vec<Name>, DnsError> {
        self.ptr
            .get(&ip)
            .cloned()
            .ok_or_else(|| DnsError::NotFound(ip.to_string()))
    }
}

fn params(client_ip: IpAddr, domain: &str, sender: Option<&str>) -> CheckHostParams<'static> {
    CheckHostParams {
        client_ip,
        domain: domain.to_owned(),
        sender: sender.map(str::to_owned),
        ehlo_domain: None,
        relaying_host_name: Some("mx.example.net"),
    }
}

/// https://www.rfc-editor.org/rfc/rfc7208#appendix-A.1
#[tokio::test]
async fn pass_via_all() {
    let resolver = TestResolver::default().with_txt("example.com", "v=spf1 +all");

    let result = params(
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        "example.com",
        Some("sender@example.com"),
    )
    .check(&resolver)
    .await;

    k9::assert_equal!(
        result,
        SpfResult {
            disposition: SpfDisposition::Pass,
            context: "matched 'all' directive".to_owned(),
        }
    );
}

#[tokio::test]
async fn permerror_on_eleventh_lookup() {
    let mut spf = "v=spf1".to_owned();
    for n in 1..=11 {
        spf.push_str(&format!(" a:x{n}.foo.bar"));
    }
    spf.push_str(" -all");

    let mut resolver = TestResolver::default().with_txt("foo.bar", &spf);
    for n in 1..=10 {
        resolver = resolver.with_a(&format!("x{n}.foo.bar"), Ipv4Addr::new(10, 0, 0, n));
    }

    let result = params(
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        "foo.bar",
        Some("sender@foo.bar"),
    )
    .check(&resolver)
    .await;

    k9::assert_equal!(
        result,
        SpfResult {
            disposition: SpfDisposition::PermError,
            context: "Maximum total DNS lookups exceeded.".to_owned(),
        }
    );
}

#[tokio::test]
async fn ten_lookups_is_allowed() {
    let mut spf = "v=spf1".to_owned();
    for n in 1..=10 {
        spf.push_str(&format!(" a:x{n}.foo.bar"));
    }
    spf.push_str(" -all");

    let mut resolver = TestResolver::default().with_txt("foo.bar", &spf);
    for n in 1..=10 {
        resolver = resolver.with_a(&format!("x{n}.foo.bar"), Ipv4Addr::new(10, 0, 0, n));
    }

    let result = params(
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        "foo.bar",
        Some("sender@foo.bar"),
    )
    .check(&resolver)
    .await;

    k9::assert_equal!(
        result,
        SpfResult {
            disposition: SpfDisposition::Fail,
            context: "matched '-all' directive".to_owned(),
        }
    );
}

#[tokio::test]
async fn temperror_bubbles_through_nested_include_and_redirect() {
    let resolver = TestResolver::default()
        .with_txt("a.example.com", "v=spf1 include:b.example.com -all")
        .with_txt("b.example.com", "v=spf1 include:c.example.com -all")
        .with_txt("c.example.com", "v=spf1 redirect=d.example.com")
        .with_tempfail("d.example.com");

    let result = params(
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        "a.example.com",
        Some("sender@a.example.com"),
    )
    .check(&resolver)
    .await;

    k9::assert_equal!(result.disposition, SpfDisposition::TempError);
    assert!(
        result.context.contains("d.example.com"),
        "context should mention the failing domain: {}",
        result.context
    );
}

#[tokio::test]
async fn redirect_is_ignored_when_all_is_present() {
    let resolver =
        TestResolver::default().with_txt("example.com", "v=spf1 +all redirect=redirect.example.com");

    let result = params(
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        "example.com",
        Some("sender@example.com"),
    )
    .check(&resolver)
    .await;

    k9::assert_equal!(
        result,
        SpfResult {
            disposition: SpfDisposition::Pass,
            context: "matched 'all' directive".to_owned(),
        }
    );
}

#[tokio::test]
async fn include_fail_does_not_abort_evaluation() {
    let resolver = TestResolver::default()
        .with_txt(
            "example.com",
            "v=spf1 include:fail.example.com ip4:203.0.113.0/24 -all",
        )
        .with_txt("fail.example.com", "v=spf1 -all");

    let result = params(
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)),
        "example.com",
        Some("sender@example.com"),
    )
    .check(&resolver)
    .await;

    k9::assert_equal!(
        result,
        SpfResult {
            disposition: SpfDisposition::Pass,
            context: "matched 'ip4:203.0.113.0/24' directive".to_owned(),
        }
    );
}

#[tokio::test]
async fn explanation_is_fetched_and_expanded_on_fail() {
    let resolver = TestResolver::default()
        .with_txt("example.com", "v=spf1 -all exp=explain.example.com")
        .with_txt("explain.example.com", "Access denied for %{i}");

    let result = params(
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)),
        "example.com",
        Some("sender@example.com"),
    )
    .check(&resolver)
    .await;

    k9::assert_equal!(
        result,
        SpfResult {
            disposition: SpfDisposition::Fail,
            context: "example.com explained: Access denied for 203.0.113.5".to_owned(),
        }
    );
}

/// Only the first 10 PTR-returned names are forward-confirmed (RFC 7208
/// §5.5); an 11th candidate whose forward lookup would otherwise match is
/// never even considered.
#[tokio::test]
async fn ptr_mechanism_ignores_candidates_past_the_tenth() {
    let client_ip = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7));
    let mut resolver = TestResolver::default().with_txt("example.com", "v=spf1 ptr -all");

    for n in 1..=10 {
        let host = format!("host{n}.example.com");
        resolver = resolver
            .with_ptr(client_ip, &host)
            .with_a(&host, Ipv4Addr::new(10, 0, 0, n));
    }
    resolver = resolver
        .with_ptr(client_ip, "host11.example.com")
        .with_a("host11.example.com", Ipv4Addr::new(198, 51, 100, 7));

    let result = params(client_ip, "example.com", Some("sender@example.com"))
        .check(&resolver)
        .await;

    k9::assert_equal!(
        result,
        SpfResult {
            disposition: SpfDisposition::Fail,
            context: "matched '-all' directive".to_owned(),
        }
    );
}

#[tokio::test]
async fn ptr_mechanism_matches_within_the_first_ten_candidates() {
    let client_ip = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7));
    let mut resolver = TestResolver::default().with_txt("example.com", "v=spf1 ptr -all");

    for n in 1..=9 {
        let host = format!("host{n}.example.com");
        resolver = resolver
            .with_ptr(client_ip, &host)
            .with_a(&host, Ipv4Addr::new(10, 0, 0, n));
    }
    resolver = resolver
        .with_ptr(client_ip, "host10.example.com")
        .with_a("host10.example.com", Ipv4Addr::new(198, 51, 100, 7));

    let result = params(client_ip, "example.com", Some("sender@example.com"))
        .check(&resolver)
        .await;

    k9::assert_equal!(
        result,
        SpfResult {
            disposition: SpfDisposition::Pass,
            context: "matched 'ptr' directive".to_owned(),
        }
    );
}

#[tokio::test]
async fn third_void_lookup_is_a_permerror() {
    let resolver = TestResolver::default()
        .with_txt("foo.bar", "v=spf1 a:v1.foo.bar a:v2.foo.bar a:v3.foo.bar -all");

    let result = params(
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        "foo.bar",
        Some("sender@foo.bar"),
    )
    .check(&resolver)
    .await;

    k9::assert_equal!(
        result,
        SpfResult {
            disposition: SpfDisposition::PermError,
            context: "Maximum void DNS lookups exceeded.".to_owned(),
        }
    );
}

#[tokio::test]
async fn ip4_zero_length_cidr_matches_anything() {
    let resolver = TestResolver::default().with_txt("example.com", "v=spf1 ip4:0.0.0.0/0 -all");

    let result = params(
        IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
        "example.com",
        Some("sender@example.com"),
    )
    .check(&resolver)
    .await;

    k9::assert_equal!(result.disposition, SpfDisposition::Pass);
}

#[tokio::test]
async fn ip6_full_length_cidr_requires_exact_match() {
    let resolver =
        TestResolver::default().with_txt("example.com", "v=spf1 ip6:2001:db8::1/128 -all");

    let hit = params(
        IpAddr::V6("2001:db8::1".parse().unwrap()),
        "example.com",
        Some("sender@example.com"),
    )
    .check(&resolver)
    .await;
    k9::assert_equal!(hit.disposition, SpfDisposition::Pass);

    let miss = params(
        IpAddr::V6("2001:db8::2".parse().unwrap()),
        "example.com",
        Some("sender@example.com"),
    )
    .check(&resolver)
    .await;
    k9::assert_equal!(miss.disposition, SpfDisposition::Fail);
}

#[tokio::test]
async fn empty_sender_local_part_defaults_to_postmaster() {
    let resolver = TestResolver::default()
        .with_txt("example.com", "v=spf1 exists:%{l}.%{d} -all")
        .with_a("postmaster.example.com", Ipv4Addr::new(127, 0, 0, 1));

    let result = params(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), "example.com", None)
        .check(&resolver)
        .await;

    k9::assert_equal!(
        result,
        SpfResult {
            disposition: SpfDisposition::Pass,
            context: "matched 'exists:%{l}.%{d}' directive".to_owned(),
        }
    );
}

#[tokio::test]
async fn no_spf_record_is_none() {
    let resolver = TestResolver::default();

    let result = params(
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        "example.com",
        Some("sender@example.com"),
    )
    .check(&resolver)
    .await;

    k9::assert_equal!(result.disposition, SpfDisposition::None);
}

#[tokio::test]
async fn duplicate_redirect_modifier_is_permerror() {
    let resolver = TestResolver::default()
        .with_txt("example.com", "v=spf1 redirect=a.example.com redirect=b.example.com");

    let result = params(
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        "example.com",
        Some("sender@example.com"),
    )
    .check(&resolver)
    .await;

    k9::assert_equal!(
        result,
        SpfResult {
            disposition: SpfDisposition::PermError,
            context: "Invalid spf record syntax.".to_owned(),
        }
    );
}

#[tokio::test]
async fn duplicate_exp_modifier_is_permerror() {
    let resolver = TestResolver::default()
        .with_txt("example.com", "v=spf1 exp=a.example.com exp=b.example.com -all");

    let result = params(
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        "example.com",
        Some("sender@example.com"),
    )
    .check(&resolver)
    .await;

    k9::assert_equal!(result.disposition, SpfDisposition::PermError);
}

/// Unknown modifiers are parsed and ignored, even when repeated.
#[tokio::test]
async fn unknown_modifiers_are_ignored_even_when_repeated() {
    let resolver = TestResolver::default()
        .with_txt("example.com", "v=spf1 op1=foo op1=bar -all");

    let result = params(
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        "example.com",
        Some("sender@example.com"),
    )
    .check(&resolver)
    .await;

    k9::assert_equal!(
        result,
        SpfResult {
            disposition: SpfDisposition::Fail,
            context: "matched '-all' directive".to_owned(),
        }
    );
}

#[tokio::test]
async fn mx_with_more_than_ten_targets_is_permerror() {
    let mut resolver = TestResolver::default().with_txt("foo.bar", "v=spf1 mx -all");
    for n in 1..=11 {
        let host = format!("mx{n}.foo.bar");
        resolver = resolver
            .with_mx("foo.bar", &host)
            .with_a(&host, Ipv4Addr::new(10, 0, 0, n));
    }

    let result = params(
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        "foo.bar",
        Some("sender@foo.bar"),
    )
    .check(&resolver)
    .await;

    k9::assert_equal!(result.disposition, SpfDisposition::PermError);
}

#[tokio::test]
async fn mx_ten_targets_is_allowed() {
    let mut resolver = TestResolver::default().with_txt("foo.bar", "v=spf1 mx -all");
    for n in 1..=10 {
        let host = format!("mx{n}.foo.bar");
        resolver = resolver
            .with_mx("foo.bar", &host)
            .with_a(&host, Ipv4Addr::new(10, 0, 0, n));
    }

    let result = params(
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)),
        "foo.bar",
        Some("sender@foo.bar"),
    )
    .check(&resolver)
    .await;

    k9::assert_equal!(result.disposition, SpfDisposition::Pass);
}

/// An MX query that itself comes back NXDOMAIN charges exactly one void
/// lookup, not two: two such `mx` directives in a row stay within the
/// default void-lookup budget of 2.
#[tokio::test]
async fn mx_notfound_charges_a_single_void_lookup() {
    let resolver = TestResolver::default()
        .with_txt("foo.bar", "v=spf1 mx:nx1.foo.bar mx:nx2.foo.bar -all");

    let result = params(
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        "foo.bar",
        Some("sender@foo.bar"),
    )
    .check(&resolver)
    .await;

    k9::assert_equal!(
        result,
        SpfResult {
            disposition: SpfDisposition::Fail,
            context: "matched '-all' directive".to_owned(),
        }
    );
}

/// A TempFail on an MX exchange's own A/AAAA sub-query aborts the whole
/// mechanism rather than silently skipping that exchange.
#[tokio::test]
async fn mx_sub_query_tempfail_propagates() {
    let resolver = TestResolver::default()
        .with_txt("foo.bar", "v=spf1 mx -all")
        .with_mx("foo.bar", "mx1.foo.bar")
        .with_tempfail("mx1.foo.bar");

    let result = params(
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        "foo.bar",
        Some("sender@foo.bar"),
    )
    .check(&resolver)
    .await;

    k9::assert_equal!(result.disposition, SpfDisposition::TempError);
}

/// A blank reverse-path (`<>`, whitespace, or absent) all degrade to
/// `postmaster@<domain>` identically.
#[tokio::test]
async fn angle_bracket_sender_behaves_like_absent_sender() {
    let resolver = TestResolver::default()
        .with_txt("example.com", "v=spf1 exists:%{l}.%{d} -all")
        .with_a("postmaster.example.com", Ipv4Addr::new(127, 0, 0, 1));

    let result = params(
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        "example.com",
        Some("<>"),
    )
    .check(&resolver)
    .await;

    k9::assert_equal!(result.disposition, SpfDisposition::Pass);
}

#[tokio::test]
async fn invalid_domain_is_none() {
    let resolver = TestResolver::default();

    let result = params(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), "not-a-fqdn", None)
        .check(&resolver)
        .await;

    k9::assert_equal!(result.disposition, SpfDisposition::None);
}

#[tokio::test]
async fn malformed_record_is_permerror() {
    let resolver = TestResolver::default().with_txt("example.com", "v=spf1 this-is-not-valid");

    let result = params(
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        "example.com",
        Some("sender@example.com"),
    )
    .check(&resolver)
    .await;

    k9::assert_equal!(
        result,
        SpfResult {
            disposition: SpfDisposition::PermError,
            context: "Invalid spf record syntax.".to_owned(),
        }
    );
}
