//! SPF record discovery: TXT query, `v=spf1` selection, single-record rule.

use crate::dns::{DnsError, DnsResolver};
use crate::record::SpfRecord;
use crate::SpfResult;

/// Query TXT records for `domain`, select the one SPF record among them,
/// and parse it.
///
/// The selection rules of RFC 7208 Section 4.5 are folded into a single
/// pass: the scan aborts with `PermError` the moment a second version tag
/// shows up, `None` covers both a missing domain and an answer with no
/// tagged record, and anything transient becomes `TempError`.
pub async fn lookup_spf<R: DnsResolver>(
    resolver: &R,
    domain: &str,
) -> Result<SpfRecord, SpfResult> {
    let answers = resolver.query_txt(domain).await.map_err(|e| match e {
        DnsError::NxDomain | DnsError::NoRecords => {
            SpfResult::none(format!("no SPF record found for {domain}"))
        }
        e => SpfResult::temperror(format!("TXT query for {domain} failed: {e}")),
    })?;

    let mut selected = None;
    for txt in answers.iter().filter(|txt| has_spf_version_tag(txt)) {
        if selected.replace(txt.as_str()).is_some() {
            return Err(SpfResult::permerror(format!(
                "multiple SPF records published for {domain}"
            )));
        }
    }

    let txt = selected
        .ok_or_else(|| SpfResult::none(format!("no SPF record found for {domain}")))?;
    SpfRecord::parse(txt)
        .map_err(|e| SpfResult::permerror(format!("invalid SPF record for {domain}: {e}")))
}

/// The version tag is `v=spf1` as the whole text or followed by a space
/// (RFC 7208 Section 4.5), compared without regard to case.
fn has_spf_version_tag(txt: &str) -> bool {
    match txt.get(..6) {
        Some(tag) if tag.eq_ignore_ascii_case("v=spf1") => {
            matches!(txt.as_bytes().get(6), None | Some(b' '))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::MockResolver;
    use crate::mechanism::Mechanism;
    use crate::SpfDisposition;

    #[test]
    fn version_tag_rules() {
        assert!(has_spf_version_tag("v=spf1"));
        assert!(has_spf_version_tag("v=spf1 -all"));
        assert!(has_spf_version_tag("V=SPF1 ~all"));

        assert!(!has_spf_version_tag(""));
        assert!(!has_spf_version_tag("v=spf"));
        assert!(!has_spf_version_tag("v=spf10 -all"));
        assert!(!has_spf_version_tag("v=spf1-all"));
        assert!(!has_spf_version_tag("prefix v=spf1 -all"));
    }

    #[tokio::test]
    async fn selects_the_tagged_record_among_noise() {
        let resolver = MockResolver::new();
        resolver.add_txt(
            "example.com",
            vec![
                "google-site-verification=8FmdPey4".into(),
                "unrelated text".into(),
                "v=spf1 ip4:192.0.2.0/24 mx -all".into(),
                "spf2.0/pra +all".into(),
            ],
        );

        let record = lookup_spf(&resolver, "example.com").await.unwrap();
        assert_eq!(record.directives.len(), 3);
        assert!(matches!(
            record.directives[0].mechanism,
            Mechanism::Ip4 { .. }
        ));
        assert_eq!(record.directives[2].mechanism, Mechanism::All);
    }

    #[tokio::test]
    async fn modifiers_survive_selection() {
        let resolver = MockResolver::new();
        resolver.add_txt(
            "example.com",
            vec!["v=spf1 redirect=%{d2}.backup.example".into()],
        );

        let record = lookup_spf(&resolver, "example.com").await.unwrap();
        assert!(record.directives.is_empty());
        assert_eq!(record.redirect.as_deref(), Some("%{d2}.backup.example"));
    }

    #[tokio::test]
    async fn second_version_tag_aborts_with_permerror() {
        // Case differences don't make the records distinct.
        let resolver = MockResolver::new();
        resolver.add_txt(
            "example.com",
            vec![
                "V=SPF1 +all".into(),
                "not spf".into(),
                "v=spf1 -all".into(),
            ],
        );

        let err = lookup_spf(&resolver, "example.com").await.unwrap_err();
        assert_eq!(err.disposition, SpfDisposition::PermError);
        assert!(err.context.contains("multiple"), "context: {}", err.context);
    }

    #[tokio::test]
    async fn absence_in_all_its_forms_is_none() {
        // NXDOMAIN, a NoRecords answer, an empty answer, and an answer with
        // only untagged TXT records all land on None.
        let nxdomain = MockResolver::new();

        let no_records = MockResolver::new();
        no_records.add_txt_err("example.com", DnsError::NoRecords);

        let empty = MockResolver::new();
        empty.add_txt("example.com", vec![]);

        let untagged = MockResolver::new();
        untagged.add_txt("example.com", vec!["v=spf10 -all".into()]);

        for resolver in [nxdomain, no_records, empty, untagged] {
            let err = lookup_spf(&resolver, "example.com").await.unwrap_err();
            assert_eq!(err.disposition, SpfDisposition::None);
        }
    }

    #[tokio::test]
    async fn transient_failures_are_temperror() {
        for failure in [DnsError::Timeout, DnsError::Other("servfail".into())] {
            let resolver = MockResolver::new();
            resolver.add_txt_err("example.com", failure);
            let err = lookup_spf(&resolver, "example.com").await.unwrap_err();
            assert_eq!(err.disposition, SpfDisposition::TempError);
        }
    }

    #[tokio::test]
    async fn syntax_error_becomes_permerror_with_context() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", vec!["v=spf1 ip4:999.0.0.1 -all".into()]);

        let err = lookup_spf(&resolver, "example.com").await.unwrap_err();
        assert_eq!(err.disposition, SpfDisposition::PermError);
        assert!(
            err.context.contains("example.com"),
            "context: {}",
            err.context
        );
    }
}
