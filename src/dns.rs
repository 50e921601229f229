//! DNS resolver abstraction.
//!
//! The evaluator only ever talks to DNS through [`DnsResolver`], so callers
//! can plug in caching, rate limiting, or a test double. A production
//! implementation over hickory-resolver and an in-memory [`MockResolver`]
//! are provided.

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{ResolveError, TokioResolver};

/// Classified DNS failure.
///
/// `NxDomain` and `NoRecords` behave like an empty answer at the evaluation
/// layer (and count toward the void-lookup budget where applicable);
/// `Timeout` and `Other` surface as `TempError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// The queried name does not exist.
    NxDomain,
    /// The name exists but has no records of the requested type.
    NoRecords,
    /// The query did not complete before the evaluation deadline.
    Timeout,
    /// Any other resolver failure (SERVFAIL, malformed response, transport).
    Other(String),
}

impl DnsError {
    /// True for failures that behave like an empty answer rather than a
    /// transient error.
    pub fn is_empty_answer(&self) -> bool {
        matches!(self, DnsError::NxDomain | DnsError::NoRecords)
    }
}

impl std::fmt::Display for DnsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsError::NxDomain => write!(f, "NXDOMAIN"),
            DnsError::NoRecords => write!(f, "no records"),
            DnsError::Timeout => write!(f, "timeout"),
            DnsError::Other(e) => write!(f, "{e}"),
        }
    }
}

/// Typed DNS lookups used by SPF evaluation.
///
/// `query_txt` returns one string per TXT record, with the record's
/// character-strings concatenated in order with no separator (RFC 7208
/// Section 3.3).
pub trait DnsResolver: Send + Sync {
    fn query_txt(&self, name: &str) -> impl Future<Output = Result<Vec<String>, DnsError>> + Send;
    fn query_a(&self, name: &str) -> impl Future<Output = Result<Vec<IpAddr>, DnsError>> + Send;
    fn query_aaaa(&self, name: &str) -> impl Future<Output = Result<Vec<IpAddr>, DnsError>> + Send;
    fn query_mx(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Vec<(u16, String)>, DnsError>> + Send;
    fn query_ptr(&self, ip: IpAddr) -> impl Future<Output = Result<Vec<String>, DnsError>> + Send;
}

/// [`DnsResolver`] backed by hickory-resolver's Tokio runtime.
#[derive(Clone)]
pub struct HickoryResolver {
    resolver: Arc<TokioResolver>,
}

impl HickoryResolver {
    /// Resolver using the Cloudflare public servers.
    pub fn new() -> Self {
        Self::with_config(ResolverConfig::cloudflare())
    }

    pub fn with_config(config: ResolverConfig) -> Self {
        let resolver =
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default()).build();
        Self {
            resolver: Arc::new(resolver),
        }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(e: ResolveError) -> DnsError {
    if e.is_nx_domain() {
        DnsError::NxDomain
    } else if e.is_no_records_found() {
        DnsError::NoRecords
    } else {
        DnsError::Other(e.to_string())
    }
}

impl DnsResolver for HickoryResolver {
    async fn query_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let lookup = self.resolver.txt_lookup(name).await.map_err(classify)?;
        Ok(lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                    .collect::<String>()
            })
            .collect())
    }

    async fn query_a(&self, name: &str) -> Result<Vec<IpAddr>, DnsError> {
        let lookup = self.resolver.ipv4_lookup(name).await.map_err(classify)?;
        Ok(lookup.iter().map(|a| IpAddr::V4(a.0)).collect())
    }

    async fn query_aaaa(&self, name: &str) -> Result<Vec<IpAddr>, DnsError> {
        let lookup = self.resolver.ipv6_lookup(name).await.map_err(classify)?;
        Ok(lookup.iter().map(|aaaa| IpAddr::V6(aaaa.0)).collect())
    }

    async fn query_mx(&self, name: &str) -> Result<Vec<(u16, String)>, DnsError> {
        let lookup = self.resolver.mx_lookup(name).await.map_err(classify)?;
        Ok(lookup
            .iter()
            .map(|mx| (mx.preference(), mx.exchange().to_string()))
            .collect())
    }

    async fn query_ptr(&self, ip: IpAddr) -> Result<Vec<String>, DnsError> {
        let lookup = self.resolver.reverse_lookup(ip).await.map_err(classify)?;
        Ok(lookup.iter().map(|ptr| ptr.to_string()).collect())
    }
}

type Table<T> = Arc<RwLock<HashMap<String, Result<T, DnsError>>>>;

/// In-memory resolver for tests.
///
/// Names without a registered answer resolve as `NxDomain`. Every query is
/// appended to an internal log so tests can assert which names were (or were
/// not) consulted.
#[derive(Clone, Default)]
pub struct MockResolver {
    txt: Table<Vec<String>>,
    a: Table<Vec<IpAddr>>,
    aaaa: Table<Vec<IpAddr>>,
    mx: Table<Vec<(u16, String)>>,
    ptr: Table<Vec<String>>,
    queries: Arc<RwLock<Vec<String>>>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_txt(&self, name: &str, records: Vec<String>) {
        self.txt
            .write()
            .unwrap()
            .insert(name.to_lowercase(), Ok(records));
    }

    pub fn add_txt_err(&self, name: &str, err: DnsError) {
        self.txt
            .write()
            .unwrap()
            .insert(name.to_lowercase(), Err(err));
    }

    pub fn add_a(&self, name: &str, addrs: Vec<IpAddr>) {
        self.a.write().unwrap().insert(name.to_lowercase(), Ok(addrs));
    }

    pub fn add_a_err(&self, name: &str, err: DnsError) {
        self.a.write().unwrap().insert(name.to_lowercase(), Err(err));
    }

    pub fn add_aaaa(&self, name: &str, addrs: Vec<IpAddr>) {
        self.aaaa
            .write()
            .unwrap()
            .insert(name.to_lowercase(), Ok(addrs));
    }

    pub fn add_mx(&self, name: &str, exchanges: Vec<(u16, String)>) {
        self.mx
            .write()
            .unwrap()
            .insert(name.to_lowercase(), Ok(exchanges));
    }

    pub fn add_ptr(&self, ip: IpAddr, names: Vec<String>) {
        self.ptr.write().unwrap().insert(ip.to_string(), Ok(names));
    }

    /// All queries issued so far, as `"TYPE name"` strings in order.
    pub fn queries(&self) -> Vec<String> {
        self.queries.read().unwrap().clone()
    }

    fn log(&self, rtype: &str, name: &str) {
        self.queries
            .write()
            .unwrap()
            .push(format!("{rtype} {}", name.to_lowercase()));
    }

    fn fetch<T: Clone>(table: &Table<T>, key: &str) -> Result<T, DnsError> {
        table
            .read()
            .unwrap()
            .get(&key.to_lowercase())
            .cloned()
            .unwrap_or(Err(DnsError::NxDomain))
    }
}

impl DnsResolver for MockResolver {
    async fn query_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        self.log("TXT", name);
        Self::fetch(&self.txt, name)
    }

    async fn query_a(&self, name: &str) -> Result<Vec<IpAddr>, DnsError> {
        self.log("A", name);
        Self::fetch(&self.a, name)
    }

    async fn query_aaaa(&self, name: &str) -> Result<Vec<IpAddr>, DnsError> {
        self.log("AAAA", name);
        Self::fetch(&self.aaaa, name)
    }

    async fn query_mx(&self, name: &str) -> Result<Vec<(u16, String)>, DnsError> {
        self.log("MX", name);
        Self::fetch(&self.mx, name)
    }

    async fn query_ptr(&self, ip: IpAddr) -> Result<Vec<String>, DnsError> {
        let key = ip.to_string();
        self.log("PTR", &key);
        Self::fetch(&self.ptr, &key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_unknown_name_is_nxdomain() {
        let resolver = MockResolver::new();
        assert_eq!(
            resolver.query_txt("missing.example").await,
            Err(DnsError::NxDomain)
        );
    }

    #[tokio::test]
    async fn mock_lookup_is_case_insensitive() {
        let resolver = MockResolver::new();
        resolver.add_txt("Example.COM", vec!["v=spf1 -all".into()]);
        assert_eq!(
            resolver.query_txt("example.com").await,
            Ok(vec!["v=spf1 -all".to_string()])
        );
    }

    #[tokio::test]
    async fn mock_injected_error_is_returned() {
        let resolver = MockResolver::new();
        resolver.add_txt_err("example.com", DnsError::Other("servfail".into()));
        assert_eq!(
            resolver.query_txt("example.com").await,
            Err(DnsError::Other("servfail".into()))
        );
    }

    #[tokio::test]
    async fn mock_records_query_log() {
        let resolver = MockResolver::new();
        resolver.add_a("mail.example.com", vec!["192.0.2.1".parse().unwrap()]);
        let _ = resolver.query_a("MAIL.example.com").await;
        let _ = resolver.query_txt("other.example").await;
        assert_eq!(
            resolver.queries(),
            vec!["A mail.example.com", "TXT other.example"]
        );
    }

    #[test]
    fn empty_answer_classification() {
        assert!(DnsError::NxDomain.is_empty_answer());
        assert!(DnsError::NoRecords.is_empty_answer());
        assert!(!DnsError::Timeout.is_empty_answer());
        assert!(!DnsError::Other("x".into()).is_empty_answer());
    }
}
