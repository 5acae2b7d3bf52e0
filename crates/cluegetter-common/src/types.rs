//! Common types for ClueGetter

use serde::{Deserialize, Serialize};
use std::fmt;

/// A mail address split into local part and domain.
///
/// The local part is preserved verbatim; domains compare
/// case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    local: String,
    domain: String,
}

impl Address {
    /// Create a new address from its parts
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an address string.
    ///
    /// A token without an `@` is interpreted as a bare local part when
    /// `single_is_local` is set, and as a bare domain otherwise. This
    /// mirrors how MTAs hand over envelope addresses.
    pub fn parse(address: &str, single_is_local: bool) -> Self {
        match address.split_once('@') {
            Some((local, domain)) => Self::new(local, domain),
            None if single_is_local => Self::new(address, ""),
            None => Self::new("", address),
        }
    }

    /// The local part, verbatim
    pub fn local(&self) -> &str {
        &self.local
    }

    /// The domain part
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Effective second-level domain, per the public suffix list
    pub fn sld(&self) -> Option<&str> {
        psl::domain_str(&self.domain)
    }

    /// Case-insensitive domain comparison
    pub fn domain_matches(&self, other: &str) -> bool {
        self.domain.eq_ignore_ascii_case(other)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.domain.is_empty() {
            write!(f, "{}", self.local)
        } else {
            write!(f, "{}@{}", self.local, self.domain)
        }
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.local == other.local && self.domain.eq_ignore_ascii_case(&other.domain)
    }
}

impl Eq for Address {}

/// Final or suggested disposition of a message.
///
/// `Error` is internal: modules report it, the reduction folds it into
/// one of the other three, and it never reaches the MTA. The ordering
/// reflects severity and is relied upon when folding recipient checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Permit,
    TempFail,
    Reject,
    Error,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Permit => "permit",
            Verdict::TempFail => "tempfail",
            Verdict::Reject => "reject",
            Verdict::Error => "error",
        }
    }

    /// Stable index used for per-action accumulators
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_address() {
        let addr = Address::parse("Bob.Smith@Example.COM", true);
        assert_eq!(addr.local(), "Bob.Smith");
        assert_eq!(addr.domain(), "Example.COM");
        assert_eq!(addr.to_string(), "Bob.Smith@Example.COM");
    }

    #[test]
    fn test_parse_bare_token() {
        let local = Address::parse("postmaster", true);
        assert_eq!(local.local(), "postmaster");
        assert_eq!(local.domain(), "");

        let domain = Address::parse("example.com", false);
        assert_eq!(domain.local(), "");
        assert_eq!(domain.domain(), "example.com");
    }

    #[test]
    fn test_domain_compares_case_insensitively() {
        let a = Address::new("bob", "Example.com");
        let b = Address::new("bob", "example.COM");
        assert_eq!(a, b);
        assert!(a.domain_matches("EXAMPLE.COM"));

        // local part is case-sensitive
        let c = Address::new("Bob", "example.com");
        assert_ne!(a, c);
    }

    #[test]
    fn test_sld() {
        let addr = Address::new("bob", "mail.corp.example.co.uk");
        assert_eq!(addr.sld(), Some("example.co.uk"));
    }

    #[test]
    fn test_verdict_ordering() {
        assert!(Verdict::Permit < Verdict::TempFail);
        assert!(Verdict::TempFail < Verdict::Reject);
        assert!(Verdict::Reject < Verdict::Error);
    }
}
