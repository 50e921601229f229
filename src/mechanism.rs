//! SPF mechanism, directive, and qualifier types (RFC 7208 Sections 4.6.2
//! and 5), plus the term-level parser.
//!
//! Domain-spec arguments are stored verbatim; macro expansion happens at
//! match time.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Error type for SPF record parsing. All parse failures map to PermError
/// during evaluation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpfParseError {
    #[error("invalid SPF version: expected 'v=spf1'")]
    InvalidVersion,
    #[error("unknown mechanism: {0}")]
    UnknownMechanism(String),
    #[error("invalid mechanism argument: {0}")]
    InvalidArgument(String),
    #[error("missing required argument for {0}")]
    MissingArgument(String),
    #[error("invalid CIDR prefix: {0}")]
    InvalidCidr(String),
    #[error("duplicate modifier: {0}")]
    DuplicateModifier(String),
    #[error("missing value for modifier: {0}")]
    EmptyModifier(String),
}

/// Qualifier prefix on a directive. Defaults to Pass when omitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    Pass,     // +
    Fail,     // -
    SoftFail, // ~
    Neutral,  // ?
}

impl Qualifier {
    /// Peel an optional qualifier sigil off a term.
    pub fn parse_prefix(s: &str) -> (Qualifier, &str) {
        match s.as_bytes().first() {
            Some(b'+') => (Qualifier::Pass, &s[1..]),
            Some(b'-') => (Qualifier::Fail, &s[1..]),
            Some(b'~') => (Qualifier::SoftFail, &s[1..]),
            Some(b'?') => (Qualifier::Neutral, &s[1..]),
            _ => (Qualifier::Pass, s),
        }
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Qualifier::Pass => write!(f, "+"),
            Qualifier::Fail => write!(f, "-"),
            Qualifier::SoftFail => write!(f, "~"),
            Qualifier::Neutral => write!(f, "?"),
        }
    }
}

/// CIDR prefix pair for the `a` and `mx` mechanisms.
/// `v4` defaults to 32 and `v6` to 128 when not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DualCidr {
    pub v4: u8,
    pub v6: u8,
}

impl Default for DualCidr {
    fn default() -> Self {
        Self { v4: 32, v6: 128 }
    }
}

/// SPF mechanism (RFC 7208 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mechanism {
    /// `all`
    All,
    /// `include:<domain-spec>`
    Include(String),
    /// `a[:<domain-spec>][/cidr4][//cidr6]`
    A {
        domain: Option<String>,
        cidr: DualCidr,
    },
    /// `mx[:<domain-spec>][/cidr4][//cidr6]`
    Mx {
        domain: Option<String>,
        cidr: DualCidr,
    },
    /// `ptr[:<domain-spec>]`
    Ptr(Option<String>),
    /// `ip4:<network>[/cidr]`
    Ip4 { addr: Ipv4Addr, prefix_len: u8 },
    /// `ip6:<network>[/cidr]`
    Ip6 { addr: Ipv6Addr, prefix_len: u8 },
    /// `exists:<domain-spec>`
    Exists(String),
}

/// A directive = optional qualifier + mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub qualifier: Qualifier,
    pub mechanism: Mechanism,
}

impl Directive {
    /// Parse a whitespace-delimited directive term, qualifier included.
    pub fn parse(term: &str) -> Result<Self, SpfParseError> {
        let (qualifier, rest) = Qualifier::parse_prefix(term);
        let mechanism = parse_mechanism(rest)?;
        Ok(Directive {
            qualifier,
            mechanism,
        })
    }
}

/// Split a term into its mechanism name and argument. A `:` introduces a
/// value argument; a `/` with no preceding `:` introduces a bare CIDR
/// (as in `a/24`), kept in the argument with its slash.
fn split_name_arg(term: &str) -> (&str, Option<&str>) {
    match term.find([':', '/']) {
        Some(pos) if term.as_bytes()[pos] == b':' => (&term[..pos], Some(&term[pos + 1..])),
        Some(pos) => (&term[..pos], Some(&term[pos..])),
        None => (term, None),
    }
}

/// Strip a trailing `[/cidr4][//cidr6]` suffix, returning what precedes it.
fn parse_dual_cidr(s: &str) -> Result<(&str, DualCidr), SpfParseError> {
    let mut cidr = DualCidr::default();
    let mut rest = s;

    if let Some(pos) = rest.find("//") {
        let v6_str = &rest[pos + 2..];
        cidr.v6 = v6_str
            .parse::<u8>()
            .map_err(|_| SpfParseError::InvalidCidr(format!("invalid IPv6 CIDR: {v6_str:?}")))?;
        if cidr.v6 > 128 {
            return Err(SpfParseError::InvalidCidr(format!(
                "IPv6 CIDR {} exceeds 128",
                cidr.v6
            )));
        }
        rest = &rest[..pos];
    }

    if let Some(pos) = rest.rfind('/') {
        let v4_str = &rest[pos + 1..];
        cidr.v4 = v4_str
            .parse::<u8>()
            .map_err(|_| SpfParseError::InvalidCidr(format!("invalid IPv4 CIDR: {v4_str:?}")))?;
        if cidr.v4 > 32 {
            return Err(SpfParseError::InvalidCidr(format!(
                "IPv4 CIDR {} exceeds 32",
                cidr.v4
            )));
        }
        rest = &rest[..pos];
    }

    Ok((rest, cidr))
}

fn parse_prefix_len(raw: &str, max: u8, what: &str) -> Result<u8, SpfParseError> {
    let prefix = raw
        .parse::<u8>()
        .map_err(|_| SpfParseError::InvalidCidr(format!("invalid {what} CIDR: {raw:?}")))?;
    if prefix > max {
        return Err(SpfParseError::InvalidCidr(format!(
            "{what} CIDR {prefix} exceeds {max}"
        )));
    }
    Ok(prefix)
}

/// Parse a mechanism term (without qualifier prefix). Mechanism names are
/// case-insensitive.
pub fn parse_mechanism(term: &str) -> Result<Mechanism, SpfParseError> {
    let (name, arg) = split_name_arg(term);
    let required = |mech: &str| {
        arg.filter(|a| !a.is_empty())
            .ok_or_else(|| SpfParseError::MissingArgument(mech.into()))
    };

    match name.to_ascii_lowercase().as_str() {
        "all" => {
            if arg.is_some() {
                return Err(SpfParseError::InvalidArgument(
                    "all takes no argument".into(),
                ));
            }
            Ok(Mechanism::All)
        }
        "include" => Ok(Mechanism::Include(required("include")?.to_string())),
        "a" => {
            let (domain, cidr) = parse_dual_cidr(arg.unwrap_or(""))?;
            Ok(Mechanism::A {
                domain: (!domain.is_empty()).then(|| domain.to_string()),
                cidr,
            })
        }
        "mx" => {
            let (domain, cidr) = parse_dual_cidr(arg.unwrap_or(""))?;
            Ok(Mechanism::Mx {
                domain: (!domain.is_empty()).then(|| domain.to_string()),
                cidr,
            })
        }
        "ptr" => Ok(Mechanism::Ptr(
            arg.filter(|a| !a.is_empty()).map(|a| a.to_string()),
        )),
        "ip4" => {
            let raw = required("ip4")?;
            let (addr_str, prefix_len) = match raw.split_once('/') {
                Some((addr, prefix)) => (addr, parse_prefix_len(prefix, 32, "IPv4")?),
                None => (raw, 32),
            };
            let addr: Ipv4Addr = addr_str.parse().map_err(|_| {
                SpfParseError::InvalidArgument(format!("invalid IPv4 address: {addr_str:?}"))
            })?;
            Ok(Mechanism::Ip4 { addr, prefix_len })
        }
        "ip6" => {
            let raw = required("ip6")?;
            // rsplit: the address itself contains colons, and `::1/64`-style
            // arguments keep the slash at the end.
            let (addr_str, prefix_len) = match raw.rsplit_once('/') {
                Some((addr, prefix)) => (addr, parse_prefix_len(prefix, 128, "IPv6")?),
                None => (raw, 128),
            };
            let addr: Ipv6Addr = addr_str.parse().map_err(|_| {
                SpfParseError::InvalidArgument(format!("invalid IPv6 address: {addr_str:?}"))
            })?;
            Ok(Mechanism::Ip6 { addr, prefix_len })
        }
        "exists" => Ok(Mechanism::Exists(required("exists")?.to_string())),
        other => Err(SpfParseError::UnknownMechanism(other.to_string())),
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn dual_cidr(f: &mut fmt::Formatter<'_>, cidr: &DualCidr) -> fmt::Result {
            if cidr.v4 != 32 {
                write!(f, "/{}", cidr.v4)?;
            }
            if cidr.v6 != 128 {
                write!(f, "//{}", cidr.v6)?;
            }
            Ok(())
        }

        match self {
            Mechanism::All => write!(f, "all"),
            Mechanism::Include(d) => write!(f, "include:{d}"),
            Mechanism::A { domain, cidr } => {
                write!(f, "a")?;
                if let Some(d) = domain {
                    write!(f, ":{d}")?;
                }
                dual_cidr(f, cidr)
            }
            Mechanism::Mx { domain, cidr } => {
                write!(f, "mx")?;
                if let Some(d) = domain {
                    write!(f, ":{d}")?;
                }
                dual_cidr(f, cidr)
            }
            Mechanism::Ptr(domain) => {
                write!(f, "ptr")?;
                if let Some(d) = domain {
                    write!(f, ":{d}")?;
                }
                Ok(())
            }
            Mechanism::Ip4 { addr, prefix_len } => {
                write!(f, "ip4:{addr}")?;
                if *prefix_len != 32 {
                    write!(f, "/{prefix_len}")?;
                }
                Ok(())
            }
            Mechanism::Ip6 { addr, prefix_len } => {
                write!(f, "ip6:{addr}")?;
                if *prefix_len != 128 {
                    write!(f, "/{prefix_len}")?;
                }
                Ok(())
            }
            Mechanism::Exists(d) => write!(f, "exists:{d}"),
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The Pass qualifier is the default and is not printed.
        if self.qualifier != Qualifier::Pass {
            write!(f, "{}", self.qualifier)?;
        }
        write!(f, "{}", self.mechanism)
    }
}
