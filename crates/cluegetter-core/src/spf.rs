//! SPF lookups for the greylisting whitelist
//!
//! Greylisting uses SPF as a whitelist signal only: a peer IP that a
//! configured domain's SPF record authorizes skips greylisting. The
//! evaluator covers the mechanisms seen in practice for that purpose
//! (ip4/ip6, a, mx, include, redirect, all).

use async_trait::async_trait;
use cluegetter_common::{Error, Result};
use ipnet::{Ipv4Net, Ipv6Net};
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

/// SPF evaluation result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfResult {
    /// The IP is authorized
    Pass,
    /// The IP is explicitly not authorized
    Fail,
    /// The IP is probably not authorized
    SoftFail,
    /// The domain owner has no opinion
    Neutral,
    /// No SPF record found
    None,
    /// Temporary error (DNS timeout, etc.)
    TempError,
    /// Permanent error (invalid SPF record, lookup limit)
    PermError,
}

impl SpfResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::SoftFail => "softfail",
            SpfResult::Neutral => "neutral",
            SpfResult::None => "none",
            SpfResult::TempError => "temperror",
            SpfResult::PermError => "permerror",
        }
    }
}

/// Asks whether `domain`'s SPF policy authorizes `ip`
#[async_trait]
pub trait SpfResolver: Send + Sync {
    async fn query(&self, domain: &str, ip: IpAddr) -> Result<SpfResult>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SpfQualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

impl SpfQualifier {
    fn to_result(self) -> SpfResult {
        match self {
            SpfQualifier::Pass => SpfResult::Pass,
            SpfQualifier::Fail => SpfResult::Fail,
            SpfQualifier::SoftFail => SpfResult::SoftFail,
            SpfQualifier::Neutral => SpfResult::Neutral,
        }
    }
}

#[derive(Debug, Clone)]
enum SpfMechanism {
    All,
    A(Option<String>),
    Mx(Option<String>),
    Ip4(Ipv4Net),
    Ip6(Ipv6Net),
    Include(String),
    /// ptr / exists; deprecated or macro-dependent, never matched here
    Ignored,
}

#[derive(Debug, Clone)]
struct SpfDirective {
    qualifier: SpfQualifier,
    mechanism: SpfMechanism,
}

/// SPF evaluator backed by live DNS
pub struct DnsSpfResolver {
    resolver: TokioAsyncResolver,
    max_dns_lookups: usize,
}

impl DnsSpfResolver {
    /// Create an evaluator using the system's default resolver config
    pub fn new() -> Self {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self {
            resolver,
            // RFC 7208 limit
            max_dns_lookups: 10,
        }
    }

    pub fn with_resolver(resolver: TokioAsyncResolver) -> Self {
        Self {
            resolver,
            max_dns_lookups: 10,
        }
    }

    fn check_host<'a>(
        &'a self,
        domain: &'a str,
        ip: IpAddr,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<SpfResult>> + Send + 'a>> {
        Box::pin(async move {
            if depth >= self.max_dns_lookups {
                return Ok(SpfResult::PermError);
            }

            let record = match self.spf_record(domain).await? {
                Some(record) => record,
                None => return Ok(SpfResult::None),
            };

            debug!(domain, record = %record, "evaluating SPF record");

            let directives = match parse_spf_record(&record) {
                Ok(directives) => directives,
                Err(e) => {
                    warn!(domain, "unparsable SPF record: {}", e);
                    return Ok(SpfResult::PermError);
                }
            };

            for directive in directives {
                let matches = match &directive.mechanism {
                    SpfMechanism::All => true,

                    SpfMechanism::Ip4(network) => match ip {
                        IpAddr::V4(v4) => network.contains(&v4),
                        IpAddr::V6(_) => false,
                    },

                    SpfMechanism::Ip6(network) => match ip {
                        IpAddr::V6(v6) => network.contains(&v6),
                        IpAddr::V4(_) => false,
                    },

                    SpfMechanism::A(target) => {
                        let target = target.as_deref().unwrap_or(domain);
                        self.ip_matches_host(target, ip).await
                    }

                    SpfMechanism::Mx(target) => {
                        let target = target.as_deref().unwrap_or(domain);
                        self.ip_matches_mx(target, ip).await
                    }

                    SpfMechanism::Include(included) => {
                        self.check_host(included, ip, depth + 1).await? == SpfResult::Pass
                    }

                    SpfMechanism::Ignored => false,
                };

                if matches {
                    return Ok(directive.qualifier.to_result());
                }
            }

            Ok(SpfResult::Neutral)
        })
    }

    async fn spf_record(&self, domain: &str) -> Result<Option<String>> {
        let lookup = match self.resolver.txt_lookup(domain).await {
            Ok(lookup) => lookup,
            Err(e) => {
                return match e.kind() {
                    ResolveErrorKind::NoRecordsFound { .. } => Ok(None),
                    _ => Err(Error::Resolver(format!("TXT lookup for {}: {}", domain, e))),
                }
            }
        };

        for record in lookup.iter() {
            let txt = record
                .txt_data()
                .iter()
                .map(|d| String::from_utf8_lossy(d))
                .collect::<String>();

            if txt.starts_with("v=spf1 ") || txt == "v=spf1" {
                return Ok(Some(txt));
            }
        }

        Ok(None)
    }

    async fn ip_matches_host(&self, host: &str, ip: IpAddr) -> bool {
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => lookup.iter().any(|addr| addr == ip),
            Err(_) => false,
        }
    }

    async fn ip_matches_mx(&self, domain: &str, ip: IpAddr) -> bool {
        let mx_lookup = match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => lookup,
            Err(_) => return false,
        };

        for mx in mx_lookup.iter() {
            if self.ip_matches_host(&mx.exchange().to_utf8(), ip).await {
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl SpfResolver for DnsSpfResolver {
    async fn query(&self, domain: &str, ip: IpAddr) -> Result<SpfResult> {
        self.check_host(domain, ip, 0).await
    }
}

fn parse_spf_record(record: &str) -> Result<Vec<SpfDirective>> {
    let terms = record
        .strip_prefix("v=spf1")
        .ok_or_else(|| Error::Resolver("missing v=spf1 prefix".to_string()))?
        .trim();

    let mut directives = Vec::new();
    for term in terms.split_whitespace() {
        if term.contains('=') {
            // redirect= evaluates like include; other modifiers (exp=) are
            // irrelevant to a whitelist lookup
            if let Some(domain) = term.strip_prefix("redirect=") {
                directives.push(SpfDirective {
                    qualifier: SpfQualifier::Pass,
                    mechanism: SpfMechanism::Include(domain.to_string()),
                });
            }
            continue;
        }

        let (qualifier, mechanism) = match term.chars().next() {
            Some('+') => (SpfQualifier::Pass, &term[1..]),
            Some('-') => (SpfQualifier::Fail, &term[1..]),
            Some('~') => (SpfQualifier::SoftFail, &term[1..]),
            Some('?') => (SpfQualifier::Neutral, &term[1..]),
            _ => (SpfQualifier::Pass, term),
        };

        directives.push(SpfDirective {
            qualifier,
            mechanism: parse_mechanism(mechanism)?,
        });
    }

    Ok(directives)
}

fn parse_mechanism(s: &str) -> Result<SpfMechanism> {
    if s == "all" {
        return Ok(SpfMechanism::All);
    }
    if s == "a" {
        return Ok(SpfMechanism::A(None));
    }
    if let Some(domain) = s.strip_prefix("a:") {
        return Ok(SpfMechanism::A(Some(domain.to_string())));
    }
    if s == "mx" {
        return Ok(SpfMechanism::Mx(None));
    }
    if let Some(domain) = s.strip_prefix("mx:") {
        return Ok(SpfMechanism::Mx(Some(domain.to_string())));
    }
    if let Some(network) = s.strip_prefix("ip4:") {
        let net = if network.contains('/') {
            network.parse()
        } else {
            format!("{}/32", network).parse()
        }
        .map_err(|e| Error::Resolver(format!("bad ip4 network {}: {}", network, e)))?;
        return Ok(SpfMechanism::Ip4(net));
    }
    if let Some(network) = s.strip_prefix("ip6:") {
        let net = if network.contains('/') {
            network.parse()
        } else {
            format!("{}/128", network).parse()
        }
        .map_err(|e| Error::Resolver(format!("bad ip6 network {}: {}", network, e)))?;
        return Ok(SpfMechanism::Ip6(net));
    }
    if let Some(domain) = s.strip_prefix("include:") {
        return Ok(SpfMechanism::Include(domain.to_string()));
    }
    if s == "ptr" || s.starts_with("ptr:") || s.starts_with("exists:") {
        return Ok(SpfMechanism::Ignored);
    }

    Err(Error::Resolver(format!("unknown SPF mechanism: {}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spf_record() {
        let record = "v=spf1 ip4:192.168.1.0/24 include:_spf.example.com -all";
        let directives = parse_spf_record(record).unwrap();

        assert_eq!(directives.len(), 3);
        assert!(matches!(directives[0].mechanism, SpfMechanism::Ip4(_)));
        assert!(matches!(directives[1].mechanism, SpfMechanism::Include(_)));
        assert!(matches!(directives[2].mechanism, SpfMechanism::All));
        assert_eq!(directives[2].qualifier, SpfQualifier::Fail);
    }

    #[test]
    fn test_parse_bare_ip() {
        let directives = parse_spf_record("v=spf1 ip4:203.0.113.7 ~all").unwrap();
        match &directives[0].mechanism {
            SpfMechanism::Ip4(net) => assert_eq!(net.prefix_len(), 32),
            other => panic!("expected ip4, got {:?}", other),
        }
        assert_eq!(directives[1].qualifier, SpfQualifier::SoftFail);
    }

    #[test]
    fn test_parse_redirect_modifier() {
        let directives = parse_spf_record("v=spf1 redirect=_spf.example.com").unwrap();
        assert_eq!(directives.len(), 1);
        assert!(matches!(directives[0].mechanism, SpfMechanism::Include(_)));
    }

    #[test]
    fn test_rejects_record_without_prefix() {
        assert!(parse_spf_record("spf2.0/pra include:example.com").is_err());
    }
}
