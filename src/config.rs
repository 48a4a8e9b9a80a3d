/// Injection-time configuration for the evaluator. There is no dynamic
/// reload: construct one of these (or use [`SpfConfig::default`]) and pass
/// it to [`crate::CheckHostParams::check`].
#[derive(Debug, Clone)]
pub struct SpfConfig {
    /// Maximum number of DNS lookups chargeable across one `check_host`
    /// call tree (RFC 7208 §4.6.4 default: 10).
    pub lookup_limit: u32,
    /// Maximum number of "void" lookups (NXDOMAIN or empty answers) across
    /// one call tree (RFC 7208 §4.6.4 default: 2).
    pub void_lookup_limit: u32,
    /// This host's own domain name, used to fill `%{r}` in explanation text
    /// when the caller doesn't supply a more specific relaying host name.
    pub host_domain: Option<String>,
    /// Prefix applied to an expanded `exp` explanation. `{domain}` is
    /// substituted with the domain that was being evaluated when the
    /// `Fail` occurred.
    pub explain_prefix: String,
}

impl Default for SpfConfig {
    fn default() -> Self {
        Self {
            lookup_limit: 10,
            void_lookup_limit: 2,
            host_domain: None,
            explain_prefix: "{domain} explained: ".to_string(),
        }
    }
}
