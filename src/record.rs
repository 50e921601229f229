//! SPF record decoding (RFC 7208 Sections 4.5 and 4.6).
//!
//! A record is the TXT text starting with `v=spf1`, split into
//! whitespace-separated terms. Each term is either a directive
//! (optional qualifier sigil + mechanism) or a `name=value` modifier.
//! Only syntactic validity of domain-specs is enforced here; macros are
//! expanded at match time.

use crate::mechanism::{Directive, SpfParseError};

/// Parsed SPF record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfRecord {
    pub directives: Vec<Directive>,
    /// `redirect=` target, if present.
    pub redirect: Option<String>,
    /// `exp=` target, if present.
    pub exp: Option<String>,
    /// The record text as published.
    pub raw: String,
}

impl SpfRecord {
    /// Parse a TXT record value. The input must carry the `v=spf1` version
    /// tag; use [`crate::lookup::lookup_spf`] to select the record first.
    pub fn parse(txt: &str) -> Result<Self, SpfParseError> {
        let txt = txt.trim();
        let lower = txt.to_ascii_lowercase();
        let body = if lower == "v=spf1" {
            ""
        } else if lower.starts_with("v=spf1 ") {
            &txt[7..]
        } else {
            return Err(SpfParseError::InvalidVersion);
        };

        let mut directives = Vec::new();
        let mut redirect = None;
        let mut exp = None;

        for term in body.split_whitespace() {
            match classify_term(term) {
                Term::Modifier(name, value) => {
                    let name = name.to_ascii_lowercase();
                    match name.as_str() {
                        "redirect" => set_modifier(&mut redirect, &name, value)?,
                        "exp" => set_modifier(&mut exp, &name, value)?,
                        // Unknown modifiers are ignored for forward
                        // compatibility (RFC 7208 Section 6).
                        _ => {}
                    }
                }
                Term::Directive(term) => directives.push(Directive::parse(term)?),
            }
        }

        Ok(SpfRecord {
            directives,
            redirect,
            exp,
            raw: txt.to_string(),
        })
    }
}

fn set_modifier(
    slot: &mut Option<String>,
    name: &str,
    value: &str,
) -> Result<(), SpfParseError> {
    if value.is_empty() {
        return Err(SpfParseError::EmptyModifier(name.to_string()));
    }
    if slot.is_some() {
        return Err(SpfParseError::DuplicateModifier(name.to_string()));
    }
    *slot = Some(value.to_string());
    Ok(())
}

enum Term<'a> {
    Directive(&'a str),
    Modifier(&'a str, &'a str),
}

/// Decide whether a term is a directive or a modifier.
///
/// A leading qualifier sigil always marks a directive. Otherwise a term
/// whose first `=` comes before any `:` is a modifier, provided the name
/// matches the RFC 7208 Section 12 `name` production
/// (`ALPHA *( ALPHA / DIGIT / "-" / "_" / "." )`). Anything else is handed
/// to the directive parser, which rejects what it does not know.
fn classify_term(term: &str) -> Term<'_> {
    if matches!(term.as_bytes().first(), Some(b'+' | b'-' | b'~' | b'?')) {
        return Term::Directive(term);
    }

    let eq = term.find('=');
    let colon = term.find(':');
    match (eq, colon) {
        (Some(eq), colon) if colon.map_or(true, |c| eq < c) => {
            let (name, value) = (&term[..eq], &term[eq + 1..]);
            if is_modifier_name(name) {
                Term::Modifier(name, value)
            } else {
                Term::Directive(term)
            }
        }
        _ => Term::Directive(term),
    }
}

fn is_modifier_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanism::{Mechanism, Qualifier};
    use std::net::Ipv4Addr;

    #[test]
    fn minimal_record() {
        let record = SpfRecord::parse("v=spf1 -all").unwrap();
        assert_eq!(record.directives.len(), 1);
        assert_eq!(record.directives[0].qualifier, Qualifier::Fail);
        assert_eq!(record.directives[0].mechanism, Mechanism::All);
        assert_eq!(record.redirect, None);
        assert_eq!(record.exp, None);
    }

    #[test]
    fn version_only_record_is_valid() {
        let record = SpfRecord::parse("v=spf1").unwrap();
        assert!(record.directives.is_empty());
    }

    #[test]
    fn version_is_case_insensitive() {
        let record = SpfRecord::parse("V=SPF1 IP4:192.0.2.1 -ALL").unwrap();
        assert_eq!(record.directives.len(), 2);
    }

    #[test]
    fn wrong_version_is_rejected() {
        assert!(SpfRecord::parse("v=spf2 -all").is_err());
        assert!(SpfRecord::parse("v=spf10 -all").is_err());
        assert!(SpfRecord::parse("spf1 -all").is_err());
    }

    #[test]
    fn directives_keep_declared_order() {
        let record = SpfRecord::parse("v=spf1 ip4:192.0.2.0/24 mx -all").unwrap();
        assert!(matches!(
            record.directives[0].mechanism,
            Mechanism::Ip4 { .. }
        ));
        assert!(matches!(record.directives[1].mechanism, Mechanism::Mx { .. }));
        assert_eq!(record.directives[2].mechanism, Mechanism::All);
    }

    #[test]
    fn redirect_modifier() {
        let record = SpfRecord::parse("v=spf1 redirect=_spf.example.com").unwrap();
        assert_eq!(record.redirect.as_deref(), Some("_spf.example.com"));
        assert!(record.directives.is_empty());
    }

    #[test]
    fn exp_modifier() {
        let record = SpfRecord::parse("v=spf1 -all exp=explain.example.com").unwrap();
        assert_eq!(record.exp.as_deref(), Some("explain.example.com"));
    }

    #[test]
    fn duplicate_modifiers_rejected() {
        assert_eq!(
            SpfRecord::parse("v=spf1 redirect=a.example redirect=b.example").unwrap_err(),
            SpfParseError::DuplicateModifier("redirect".into())
        );
        assert_eq!(
            SpfRecord::parse("v=spf1 exp=a.example exp=b.example -all").unwrap_err(),
            SpfParseError::DuplicateModifier("exp".into())
        );
    }

    #[test]
    fn empty_modifier_value_rejected() {
        assert!(SpfRecord::parse("v=spf1 redirect=").is_err());
        assert!(SpfRecord::parse("v=spf1 exp= -all").is_err());
    }

    #[test]
    fn unknown_modifiers_ignored() {
        let record =
            SpfRecord::parse("v=spf1 tracking-id=abc123 os.build=7 -all").unwrap();
        assert_eq!(record.directives.len(), 1);
        assert_eq!(record.directives[0].mechanism, Mechanism::All);
    }

    #[test]
    fn modifier_with_macro_value() {
        let record = SpfRecord::parse("v=spf1 exp=%{d}.explain.example -all").unwrap();
        assert_eq!(record.exp.as_deref(), Some("%{d}.explain.example"));
    }

    #[test]
    fn colon_before_equals_is_a_directive() {
        // The '=' inside the macro delimiter set must not demote this
        // directive to a modifier.
        let record = SpfRecord::parse("v=spf1 exists:%{l=}.example.com -all").unwrap();
        assert_eq!(
            record.directives[0].mechanism,
            Mechanism::Exists("%{l=}.example.com".into())
        );
    }

    #[test]
    fn sigil_term_is_always_a_directive() {
        // "-all=x" is a malformed directive, not an ignorable modifier.
        assert!(SpfRecord::parse("v=spf1 -all=x").is_err());
    }

    #[test]
    fn unknown_mechanism_is_rejected() {
        assert!(SpfRecord::parse("v=spf1 badmech:foo -all").is_err());
    }

    #[test]
    fn collapses_whitespace_runs() {
        let record = SpfRecord::parse("v=spf1   ip4:192.0.2.7    -all").unwrap();
        assert_eq!(record.directives.len(), 2);
        assert_eq!(
            record.directives[0].mechanism,
            Mechanism::Ip4 {
                addr: Ipv4Addr::new(192, 0, 2, 7),
                prefix_len: 32,
            }
        );
    }

    #[test]
    fn raw_text_is_preserved() {
        let text = "v=spf1 ip4:192.0.2.0/24 -all";
        assert_eq!(SpfRecord::parse(text).unwrap().raw, text);
    }
}
