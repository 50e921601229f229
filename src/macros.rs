//! SPF macro expansion (RFC 7208 Section 7).
//!
//! Domain-specs keep their macros through record decoding; expansion happens
//! at match time so per-mechanism values such as `%{i}` reflect the session
//! being evaluated.

use std::net::IpAddr;

/// Delimiter characters accepted inside a macro expression.
const DELIMITERS: &[char] = &['.', '-', '+', ',', '/', '_', '='];

/// Session values a macro expression can reference.
///
/// One context exists per evaluation frame; `domain` tracks the domain
/// currently under evaluation and changes across include/redirect, while the
/// sender identities stay fixed.
#[derive(Debug, Clone)]
pub struct MacroContext {
    /// Full sender address (local-part@domain, or postmaster@helo).
    pub sender: String,
    /// Local-part of the sender.
    pub local_part: String,
    /// Domain part of the sender.
    pub sender_domain: String,
    /// Connecting client address.
    pub client_ip: IpAddr,
    /// HELO/EHLO identity.
    pub helo: String,
    /// Domain currently being evaluated.
    pub domain: String,
    /// Receiving MTA's own name (for `%{r}`, exp-only).
    pub receiver: String,
    /// Seconds since epoch, captured once at evaluation start (for `%{t}`).
    pub timestamp: u64,
}

/// Expand SPF macros in a string.
///
/// `exp_context` permits the explanation-only macros `%{c}`, `%{r}` and
/// `%{t}`. Any syntax violation (unknown letter, the deprecated `%{p}`,
/// unterminated expression, stray `%`) is an error; the engine surfaces it
/// as PermError.
pub fn expand(input: &str, ctx: &MacroContext, exp_context: bool) -> Result<String, String> {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => result.push('%'),
            Some('_') => result.push(' '),
            Some('-') => result.push_str("%20"),
            Some('{') => {
                let mut body = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => body.push(ch),
                        None => return Err("unterminated macro expression".into()),
                    }
                }
                result.push_str(&expand_macro_body(&body, ctx, exp_context)?);
            }
            Some(other) => return Err(format!("invalid character after %: {other:?}")),
            None => return Err("trailing % in macro string".into()),
        }
    }

    Ok(result)
}

/// Expand one `%{...}` body: `<letter>[<digits>][r][<delimiters>]`.
fn expand_macro_body(body: &str, ctx: &MacroContext, exp_context: bool) -> Result<String, String> {
    let mut chars = body.chars();
    let letter = chars
        .next()
        .ok_or_else(|| "empty macro expression".to_string())?;
    let rest: String = chars.collect();

    let url_encode = letter.is_ascii_uppercase();
    let raw_value = macro_value(letter.to_ascii_lowercase(), ctx, exp_context)?;
    let (digits, reverse, delimiters) = parse_transformers(&rest)?;
    let transformed = apply_transformers(&raw_value, digits, reverse, &delimiters);

    if url_encode {
        Ok(url_encode_str(&transformed))
    } else {
        Ok(transformed)
    }
}

fn macro_value(letter: char, ctx: &MacroContext, exp_context: bool) -> Result<String, String> {
    let exp_only = |value: String| {
        if exp_context {
            Ok(value)
        } else {
            Err(format!(
                "macro %{{{letter}}} is only allowed in exp= context"
            ))
        }
    };

    match letter {
        's' => Ok(ctx.sender.clone()),
        'l' => Ok(ctx.local_part.clone()),
        'o' => Ok(ctx.sender_domain.clone()),
        'd' => Ok(ctx.domain.clone()),
        'i' => Ok(format_ip(ctx.client_ip)),
        'v' => Ok(match ctx.client_ip {
            IpAddr::V4(_) => "in-addr".into(),
            IpAddr::V6(_) => "ip6".into(),
        }),
        'h' => Ok(ctx.helo.clone()),
        'c' => exp_only(ctx.client_ip.to_string()),
        'r' => exp_only(ctx.receiver.clone()),
        't' => exp_only(ctx.timestamp.to_string()),
        // RFC 7208 Section 7.2 deprecates %{p}; publishing or evaluating it
        // is a syntax error here rather than a costly validated PTR walk.
        'p' => Err("the p macro is not supported".into()),
        _ => Err(format!("unknown macro letter: {letter}")),
    }
}

/// `%{i}`: dotted quads for IPv4, dot-separated nibbles for IPv6
/// (RFC 7208 Section 7.3).
fn format_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            let mut nibbles = Vec::with_capacity(32);
            for seg in v6.segments() {
                for shift in [12u32, 8, 4, 0] {
                    nibbles.push(format!("{:x}", (seg >> shift) & 0xf));
                }
            }
            nibbles.join(".")
        }
    }
}

/// Parse `[<digits>][r][<delimiters>]` following the macro letter.
fn parse_transformers(s: &str) -> Result<(usize, bool, Vec<char>), String> {
    let mut chars = s.chars().peekable();

    let mut digit_str = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            digit_str.push(c);
            chars.next();
        } else {
            break;
        }
    }
    let digits = if digit_str.is_empty() {
        0
    } else {
        digit_str
            .parse()
            .map_err(|_| format!("invalid digit count in macro: {digit_str}"))?
    };

    let reverse = chars.peek() == Some(&'r');
    if reverse {
        chars.next();
    }

    let mut delimiters = Vec::new();
    for c in chars {
        if DELIMITERS.contains(&c) {
            delimiters.push(c);
        } else {
            return Err(format!("invalid macro delimiter: {c:?}"));
        }
    }

    Ok((digits, reverse, delimiters))
}

/// Split on `.` plus any specified delimiters, optionally reverse, keep the
/// rightmost N parts when N > 0, and rejoin with the first specified
/// delimiter (or `.` when none was given).
fn apply_transformers(value: &str, digits: usize, reverse: bool, delimiters: &[char]) -> String {
    let split_set: Vec<char> = std::iter::once('.')
        .chain(delimiters.iter().copied().filter(|&c| c != '.'))
        .collect();

    let mut parts: Vec<&str> = value.split(|c| split_set.contains(&c)).collect();

    if reverse {
        parts.reverse();
    }

    if digits > 0 && parts.len() > digits {
        parts = parts.split_off(parts.len() - digits);
    }

    let join = delimiters.first().copied().unwrap_or('.');
    parts.join(&join.to_string())
}

fn url_encode_str(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(b as char);
            }
            _ => result.push_str(&format!("%{b:02X}")),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    /// RFC 7208 Section 7.4's example session.
    fn test_ctx() -> MacroContext {
        MacroContext {
            sender: "strong-bad@email.example.com".into(),
            local_part: "strong-bad".into(),
            sender_domain: "email.example.com".into(),
            client_ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 3)),
            helo: "mx.example.org".into(),
            domain: "email.example.com".into(),
            receiver: "receiver.example.net".into(),
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn sender_macros() {
        let ctx = test_ctx();
        assert_eq!(
            expand("%{s}", &ctx, false).unwrap(),
            "strong-bad@email.example.com"
        );
        assert_eq!(expand("%{l}", &ctx, false).unwrap(), "strong-bad");
        assert_eq!(expand("%{o}", &ctx, false).unwrap(), "email.example.com");
        assert_eq!(expand("%{h}", &ctx, false).unwrap(), "mx.example.org");
    }

    #[test]
    fn domain_truncation_and_reversal() {
        let ctx = test_ctx();
        assert_eq!(expand("%{d}", &ctx, false).unwrap(), "email.example.com");
        assert_eq!(expand("%{d4}", &ctx, false).unwrap(), "email.example.com");
        assert_eq!(expand("%{d2}", &ctx, false).unwrap(), "example.com");
        assert_eq!(expand("%{d1}", &ctx, false).unwrap(), "com");
        assert_eq!(expand("%{dr}", &ctx, false).unwrap(), "com.example.email");
        assert_eq!(expand("%{d2r}", &ctx, false).unwrap(), "example.email");
    }

    #[test]
    fn local_part_with_hyphen_delimiter() {
        let ctx = test_ctx();
        assert_eq!(expand("%{l-}", &ctx, false).unwrap(), "strong-bad");
        assert_eq!(expand("%{lr-}", &ctx, false).unwrap(), "bad-strong");
        assert_eq!(expand("%{l1r-}", &ctx, false).unwrap(), "strong");
    }

    #[test]
    fn digit_count_zero_keeps_all() {
        let ctx = test_ctx();
        assert_eq!(expand("%{d0}", &ctx, false).unwrap(), "email.example.com");
    }

    #[test]
    fn client_ip_v4() {
        let ctx = test_ctx();
        assert_eq!(expand("%{i}", &ctx, false).unwrap(), "192.0.2.3");
        assert_eq!(
            expand("%{ir}.origin.example.com", &ctx, false).unwrap(),
            "3.2.0.192.origin.example.com"
        );
        assert_eq!(expand("%{v}", &ctx, false).unwrap(), "in-addr");
    }

    #[test]
    fn client_ip_v6_nibbles() {
        let ctx = MacroContext {
            client_ip: IpAddr::V6("2001:db8::cb01".parse::<Ipv6Addr>().unwrap()),
            ..test_ctx()
        };
        assert_eq!(
            expand("%{i}", &ctx, false).unwrap(),
            "2.0.0.1.0.d.b.8.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.c.b.0.1"
        );
        assert_eq!(expand("%{v}", &ctx, false).unwrap(), "ip6");
    }

    #[test]
    fn escape_sequences() {
        let ctx = test_ctx();
        assert_eq!(expand("%%", &ctx, false).unwrap(), "%");
        assert_eq!(expand("%_", &ctx, false).unwrap(), " ");
        assert_eq!(expand("%-", &ctx, false).unwrap(), "%20");
        assert_eq!(
            expand("%{s} %% %_ %-", &ctx, false).unwrap(),
            "strong-bad@email.example.com %   %20"
        );
    }

    #[test]
    fn exp_only_macros() {
        let ctx = test_ctx();
        assert_eq!(expand("%{c}", &ctx, true).unwrap(), "192.0.2.3");
        assert_eq!(expand("%{r}", &ctx, true).unwrap(), "receiver.example.net");
        assert_eq!(expand("%{t}", &ctx, true).unwrap(), "1700000000");

        assert!(expand("%{c}", &ctx, false).is_err());
        assert!(expand("%{r}", &ctx, false).is_err());
        assert!(expand("%{t}", &ctx, false).is_err());
    }

    #[test]
    fn p_macro_is_rejected() {
        let ctx = test_ctx();
        assert!(expand("%{p}", &ctx, false).is_err());
        assert!(expand("%{p}", &ctx, true).is_err());
        assert!(expand("a.%{p}.b", &ctx, false).is_err());
    }

    #[test]
    fn syntax_errors() {
        let ctx = test_ctx();
        assert!(expand("%{x}", &ctx, false).is_err());
        assert!(expand("%{d", &ctx, false).is_err());
        assert!(expand("%{}", &ctx, false).is_err());
        assert!(expand("%", &ctx, false).is_err());
        assert!(expand("% ", &ctx, false).is_err());
        assert!(expand("%{d2*}", &ctx, false).is_err());
    }

    #[test]
    fn uppercase_url_encodes() {
        let ctx = test_ctx();
        assert_eq!(
            expand("%{S}", &ctx, false).unwrap(),
            "strong-bad%40email.example.com"
        );
    }
}
