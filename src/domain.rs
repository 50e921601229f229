//! Domain name helpers used across record decoding and mechanism matching.

/// Canonical form for comparisons: ASCII-lowercased, root dot removed.
pub fn normalize(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

/// True when `name` is `apex` itself or any name underneath it, ignoring
/// case and trailing dots. Used for PTR target checks, where both cases
/// count as a hit (RFC 7208 Section 5.5).
pub fn within_domain(name: &str, apex: &str) -> bool {
    let name = normalize(name);
    let apex = normalize(apex);
    match name.len().checked_sub(apex.len()) {
        None => false,
        Some(0) => name == apex,
        // A strict subdomain must have a label boundary right before the
        // apex suffix.
        Some(cut) => name.ends_with(&apex) && name.as_bytes()[cut - 1] == b'.',
    }
}

/// Split an address into `(local-part, domain)` at its last `@`.
/// Returns `None` for a bare string with no `@`.
pub fn split_address(addr: &str) -> Option<(&str, &str)> {
    addr.rsplit_once('@')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_canonicalizes() {
        assert_eq!(normalize("Mail.EXAMPLE.COM."), "mail.example.com");
        assert_eq!(normalize("example.com"), "example.com");
        assert_eq!(normalize("example.com.."), "example.com");
    }

    #[test]
    fn within_domain_accepts_self() {
        assert!(within_domain("example.com", "example.com"));
        assert!(within_domain("Example.COM.", "example.com"));
    }

    #[test]
    fn within_domain_accepts_subdomains() {
        assert!(within_domain("mail.example.com", "example.com"));
        assert!(within_domain("a.b.c.example.com", "EXAMPLE.com"));
    }

    #[test]
    fn within_domain_respects_label_boundaries() {
        assert!(!within_domain("notexample.com", "example.com"));
        assert!(!within_domain("example.com.evil.net", "example.com"));
    }

    #[test]
    fn within_domain_rejects_shorter_names() {
        assert!(!within_domain("com", "example.com"));
        assert!(!within_domain("example.org", "example.com"));
    }

    #[test]
    fn split_address_at_last_at_sign() {
        assert_eq!(
            split_address("user@example.com"),
            Some(("user", "example.com"))
        );
        assert_eq!(
            split_address("odd@user@example.com"),
            Some(("odd@user", "example.com"))
        );
        assert_eq!(split_address("@example.com"), Some(("", "example.com")));
        assert_eq!(split_address("nodomain"), None);
    }
}
