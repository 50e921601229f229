//! The SPF evaluation engine (RFC 7208 Sections 4 and 5).
//!
//! [`SpfVerifier::check_host`] is the `check_host()` function of RFC 7208
//! Section 4: it discovers the domain's record, walks its directives in
//! declared order, short-circuits on the first match, and falls back to
//! `redirect=` when nothing matched. Include and redirect evaluations are
//! strictly nested and share one set of counters, so the RFC's processing
//! limits hold across the whole evaluation.

use std::collections::HashSet;
use std::future::Future;
use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::cidr::{ip4_in_network, ip6_in_network};
use crate::dns::{DnsError, DnsResolver};
use crate::domain::{self, within_domain};
use crate::lookup::lookup_spf;
use crate::macros::{expand, MacroContext};
use crate::mechanism::{DualCidr, Mechanism};
use crate::{SpfDisposition, SpfResult};

/// RFC 7208 Section 4.6.4: mechanism/modifier DNS lookups per evaluation.
const MAX_DNS_LOOKUPS: usize = 10;
/// RFC 7208 Section 4.6.4: lookups returning NXDOMAIN or no answers.
const MAX_VOID_LOOKUPS: usize = 2;
/// Nesting limit for include/redirect, on top of loop detection.
const MAX_RECURSION_DEPTH: usize = 10;
/// RFC 7208 Section 4.6.4: an `mx` target with more MX records is an error.
const MAX_MX_RECORDS: usize = 10;
/// RFC 7208 Section 4.6.4: `ptr` examines at most this many names.
const MAX_PTR_NAMES: usize = 10;

/// SPF policy evaluator over a [`DnsResolver`].
///
/// The verifier holds no per-evaluation state and can be shared across
/// concurrent evaluations.
pub struct SpfVerifier<R> {
    resolver: R,
    receiver: String,
    timeout: Option<Duration>,
}

impl<R: DnsResolver> SpfVerifier<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            resolver,
            receiver: "unknown".into(),
            timeout: None,
        }
    }

    /// Set the receiving MTA's own name, used by the exp-only `%{r}` macro.
    pub fn receiver(mut self, hostname: impl Into<String>) -> Self {
        self.receiver = hostname.into();
        self
    }

    /// Bound the whole evaluation by a deadline. Resolver calls that do not
    /// complete in time surface as `TempError`.
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// RFC 7208 `check_host()`: evaluate `domain`'s SPF policy against the
    /// connecting client.
    ///
    /// `mail_from` is the envelope sender; when empty, `postmaster@<helo>`
    /// is substituted per RFC 7208 Section 4.3. `domain` is the target
    /// domain, normally the MAIL FROM domain (or the HELO identity when
    /// checking that).
    pub async fn check_host(
        &self,
        client_ip: IpAddr,
        helo: &str,
        mail_from: &str,
        domain: &str,
    ) -> SpfResult {
        let session = Session::new(client_ip, helo, mail_from, &self.receiver);
        let deadline = self.timeout.map(|limit| Instant::now() + limit);
        let mut state = EvalState::default();

        debug!(%client_ip, %domain, sender = %session.sender, "SPF check_host");
        let result = self
            .evaluate(&session, deadline, domain, &mut state, 0)
            .await;
        debug!(disposition = %result.disposition, context = %result.context, "SPF result");
        result
    }

    /// One evaluation frame; recursion enters here for include and redirect.
    async fn evaluate(
        &self,
        session: &Session,
        deadline: Option<Instant>,
        target_domain: &str,
        state: &mut EvalState,
        depth: usize,
    ) -> SpfResult {
        match self
            .evaluate_inner(session, deadline, target_domain, state, depth)
            .await
        {
            Ok(result) => result,
            Err(EvalError::Temp(context)) => SpfResult::temperror(context),
            Err(EvalError::Perm(context)) => SpfResult::permerror(context),
        }
    }

    async fn evaluate_inner(
        &self,
        session: &Session,
        deadline: Option<Instant>,
        target_domain: &str,
        state: &mut EvalState,
        depth: usize,
    ) -> Result<SpfResult, EvalError> {
        if depth > MAX_RECURSION_DEPTH {
            return Err(EvalError::Perm(format!(
                "include/redirect nesting exceeds {MAX_RECURSION_DEPTH} at {target_domain}"
            )));
        }
        let current = domain::normalize(target_domain);
        if !state.visited.insert(current.clone()) {
            return Err(EvalError::Perm(format!(
                "include/redirect loop detected at {current}"
            )));
        }

        let record = match bounded(deadline, lookup_spf(&self.resolver, &current)).await {
            Some(Ok(record)) => record,
            Some(Err(result)) => return Ok(result),
            None => {
                return Err(EvalError::Temp(format!(
                    "deadline exceeded querying TXT for {current}"
                )))
            }
        };
        trace!(record = %record.raw, domain = %current, "decoded SPF record");

        for directive in &record.directives {
            let outcome = self
                .match_mechanism(session, deadline, &current, &directive.mechanism, state, depth)
                .await?;
            let Some(reason) = outcome else {
                continue;
            };

            let disposition = SpfDisposition::from(directive.qualifier);
            debug!(directive = %directive, %disposition, "directive matched");

            let explanation = match (&record.exp, disposition) {
                (Some(spec), SpfDisposition::Fail) => {
                    self.resolve_explanation(session, deadline, &current, spec).await
                }
                _ => None,
            };

            return Ok(SpfResult {
                disposition,
                mechanism: Some(directive.to_string()),
                context: reason,
                explanation,
            });
        }

        if let Some(spec) = &record.redirect {
            let ctx = session.macro_ctx(&current);
            let target = expand(spec, &ctx, false)
                .map_err(|e| EvalError::Perm(format!("invalid redirect target: {e}")))?;
            state.charge_lookup(&target)?;
            debug!(%target, "following redirect");

            let result =
                Box::pin(self.evaluate(session, deadline, &target, state, depth + 1)).await;
            // RFC 7208 Section 6.1: None from the redirect target is PermError.
            if result.disposition == SpfDisposition::None {
                return Err(EvalError::Perm(format!(
                    "redirect target {target} has no SPF record"
                )));
            }
            return Ok(result);
        }

        // RFC 7208 Section 4.7: fell off the end of the record.
        Ok(SpfResult::neutral(format!(
            "no mechanism matched for {current} and no redirect given"
        )))
    }

    /// Match one mechanism. `Ok(Some(reason))` is a match; errors abort the
    /// evaluation with the corresponding disposition.
    async fn match_mechanism(
        &self,
        session: &Session,
        deadline: Option<Instant>,
        current: &str,
        mechanism: &Mechanism,
        state: &mut EvalState,
        depth: usize,
    ) -> Result<Option<String>, EvalError> {
        match mechanism {
            Mechanism::All => Ok(Some("all matches any client".into())),

            Mechanism::Include(spec) => {
                let target = self.expand_target(session, current, Some(spec))?;
                state.charge_lookup(&target)?;

                let sub =
                    Box::pin(self.evaluate(session, deadline, &target, state, depth + 1)).await;
                // RFC 7208 Section 5.2's recursion table.
                match sub.disposition {
                    SpfDisposition::Pass => {
                        Ok(Some(format!("include target {target} returned pass")))
                    }
                    SpfDisposition::Fail
                    | SpfDisposition::SoftFail
                    | SpfDisposition::Neutral => Ok(None),
                    SpfDisposition::TempError => Err(EvalError::Temp(format!(
                        "include target {target}: {}",
                        sub.context
                    ))),
                    SpfDisposition::PermError => Err(EvalError::Perm(format!(
                        "include target {target}: {}",
                        sub.context
                    ))),
                    SpfDisposition::None => Err(EvalError::Perm(format!(
                        "include target {target} has no SPF record"
                    ))),
                }
            }

            Mechanism::A { domain: spec, cidr } => {
                let target = self.expand_target(session, current, spec.as_deref())?;
                state.charge_lookup(&target)?;
                Ok(self
                    .match_address_records(deadline, &target, session.client_ip, *cidr, state)
                    .await?
                    .map(|reason| format!("{reason} (A record of {target})")))
            }

            Mechanism::Mx { domain: spec, cidr } => {
                let target = self.expand_target(session, current, spec.as_deref())?;
                state.charge_lookup(&target)?;

                let exchanges =
                    match bounded_dns(deadline, self.resolver.query_mx(&target)).await {
                        Ok(mx) => mx,
                        Err(e) if e.is_empty_answer() => {
                            state.charge_void(&target)?;
                            return Ok(None);
                        }
                        Err(e) => {
                            return Err(EvalError::Temp(format!(
                                "DNS failure resolving MX for {target}: {e}"
                            )))
                        }
                    };
                if exchanges.is_empty() {
                    state.charge_void(&target)?;
                    return Ok(None);
                }
                if exchanges.len() > MAX_MX_RECORDS {
                    return Err(EvalError::Perm(format!(
                        "{target} has {} MX records, more than the limit of {MAX_MX_RECORDS}",
                        exchanges.len()
                    )));
                }

                // The exchange address resolutions are not charged against
                // the lookup budget; only empty answers count as voids.
                for (_, exchange) in exchanges {
                    let matched = self
                        .match_address_records(
                            deadline,
                            &exchange,
                            session.client_ip,
                            *cidr,
                            state,
                        )
                        .await?;
                    if let Some(reason) = matched {
                        return Ok(Some(format!("{reason} (MX {exchange} of {target})")));
                    }
                }
                Ok(None)
            }

            Mechanism::Ptr(spec) => {
                let target = self.expand_target(session, current, spec.as_deref())?;
                state.charge_lookup(&target)?;

                let names =
                    match bounded_dns(deadline, self.resolver.query_ptr(session.client_ip)).await
                    {
                        Ok(names) => names,
                        Err(e) if e.is_empty_answer() => {
                            state.charge_void(&target)?;
                            return Ok(None);
                        }
                        Err(e) => {
                            return Err(EvalError::Temp(format!(
                                "DNS failure on reverse lookup of {}: {e}",
                                session.client_ip
                            )))
                        }
                    };
                if names.is_empty() {
                    state.charge_void(&target)?;
                    return Ok(None);
                }

                for name in names.iter().take(MAX_PTR_NAMES) {
                    if !within_domain(name, &target) {
                        continue;
                    }
                    // RFC 7208 Section 5.5: only forward-confirmed names
                    // count; a name that fails to validate is skipped.
                    let forward = match session.client_ip {
                        IpAddr::V4(_) => bounded_dns(deadline, self.resolver.query_a(name)).await,
                        IpAddr::V6(_) => {
                            bounded_dns(deadline, self.resolver.query_aaaa(name)).await
                        }
                    };
                    match forward {
                        Ok(addrs) if addrs.contains(&session.client_ip) => {
                            return Ok(Some(format!(
                                "validated PTR name {} is within {target}",
                                domain::normalize(name)
                            )));
                        }
                        Ok(_) | Err(_) => continue,
                    }
                }
                Ok(None)
            }

            Mechanism::Ip4 { addr, prefix_len } => Ok(match session.client_ip {
                IpAddr::V4(client) if ip4_in_network(client, *addr, *prefix_len) => {
                    Some(format!("client {client} in CIDR {addr}/{prefix_len}"))
                }
                _ => None,
            }),

            Mechanism::Ip6 { addr, prefix_len } => Ok(match session.client_ip {
                IpAddr::V6(client) if ip6_in_network(client, *addr, *prefix_len) => {
                    Some(format!("client {client} in CIDR {addr}/{prefix_len}"))
                }
                _ => None,
            }),

            Mechanism::Exists(spec) => {
                let target = self.expand_target(session, current, Some(spec))?;
                state.charge_lookup(&target)?;

                // RFC 7208 Section 5.7: always an A query, even for an
                // IPv6 client.
                match bounded_dns(deadline, self.resolver.query_a(&target)).await {
                    Ok(addrs) if !addrs.is_empty() => {
                        Ok(Some(format!("{target} resolved to at least one address")))
                    }
                    Ok(_) => {
                        state.charge_void(&target)?;
                        Ok(None)
                    }
                    Err(e) if e.is_empty_answer() => {
                        state.charge_void(&target)?;
                        Ok(None)
                    }
                    Err(e) => Err(EvalError::Temp(format!(
                        "DNS failure resolving {target}: {e}"
                    ))),
                }
            }
        }
    }

    /// Resolve the A/AAAA records of `target` per the client family and
    /// CIDR-match the client against them.
    async fn match_address_records(
        &self,
        deadline: Option<Instant>,
        target: &str,
        client_ip: IpAddr,
        cidr: DualCidr,
        state: &mut EvalState,
    ) -> Result<Option<String>, EvalError> {
        let addrs = match client_ip {
            IpAddr::V4(_) => bounded_dns(deadline, self.resolver.query_a(target)).await,
            IpAddr::V6(_) => bounded_dns(deadline, self.resolver.query_aaaa(target)).await,
        };
        let addrs = match addrs {
            Ok(addrs) => addrs,
            Err(e) if e.is_empty_answer() => {
                state.charge_void(target)?;
                return Ok(None);
            }
            Err(e) => {
                return Err(EvalError::Temp(format!(
                    "DNS failure resolving {target}: {e}"
                )))
            }
        };
        if addrs.is_empty() {
            state.charge_void(target)?;
            return Ok(None);
        }

        for addr in addrs {
            let (matched, prefix) = match (client_ip, addr) {
                (IpAddr::V4(client), IpAddr::V4(net)) => {
                    (ip4_in_network(client, net, cidr.v4), cidr.v4)
                }
                (IpAddr::V6(client), IpAddr::V6(net)) => {
                    (ip6_in_network(client, net, cidr.v6), cidr.v6)
                }
                _ => (false, 0),
            };
            if matched {
                return Ok(Some(format!("client {client_ip} in CIDR {addr}/{prefix}")));
            }
        }
        Ok(None)
    }

    /// Expand a domain-spec, or fall back to the domain under evaluation.
    fn expand_target(
        &self,
        session: &Session,
        current: &str,
        spec: Option<&str>,
    ) -> Result<String, EvalError> {
        match spec {
            Some(spec) => {
                let ctx = session.macro_ctx(current);
                expand(spec, &ctx, false)
                    .map_err(|e| EvalError::Perm(format!("invalid domain-spec {spec:?}: {e}")))
            }
            None => Ok(current.to_string()),
        }
    }

    /// Best-effort `exp=` resolution (RFC 7208 Section 6.2). Never charges
    /// the DNS budget and never changes the Fail outcome: any failure here
    /// simply drops the explanation.
    async fn resolve_explanation(
        &self,
        session: &Session,
        deadline: Option<Instant>,
        current: &str,
        spec: &str,
    ) -> Option<String> {
        let ctx = session.macro_ctx(current);
        let target = expand(spec, &ctx, false).ok()?;
        let records = bounded_dns(deadline, self.resolver.query_txt(&target))
            .await
            .ok()?;
        if records.len() != 1 {
            debug!(%target, count = records.len(), "exp target must have exactly one TXT record");
            return None;
        }
        expand(&records[0], &ctx, true).ok()
    }
}

/// Counters shared by every frame of one evaluation.
#[derive(Default)]
struct EvalState {
    dns_lookups: usize,
    void_lookups: usize,
    visited: HashSet<String>,
}

impl EvalState {
    /// Charge one mechanism DNS lookup; the check happens before dispatch.
    fn charge_lookup(&mut self, target: &str) -> Result<(), EvalError> {
        if self.dns_lookups >= MAX_DNS_LOOKUPS {
            return Err(EvalError::Perm(format!(
                "DNS lookup limit of {MAX_DNS_LOOKUPS} reached before resolving {target}"
            )));
        }
        self.dns_lookups += 1;
        Ok(())
    }

    /// Charge one lookup that produced NXDOMAIN or no answers.
    fn charge_void(&mut self, target: &str) -> Result<(), EvalError> {
        self.void_lookups += 1;
        if self.void_lookups > MAX_VOID_LOOKUPS {
            return Err(EvalError::Perm(format!(
                "void lookup limit of {MAX_VOID_LOOKUPS} exceeded at {target}"
            )));
        }
        Ok(())
    }
}

enum EvalError {
    Temp(String),
    Perm(String),
}

/// Immutable session identities, fixed for the whole evaluation.
struct Session {
    sender: String,
    local_part: String,
    sender_domain: String,
    helo: String,
    client_ip: IpAddr,
    receiver: String,
    timestamp: u64,
}

impl Session {
    fn new(client_ip: IpAddr, helo: &str, mail_from: &str, receiver: &str) -> Self {
        // RFC 7208 Section 4.3: an empty MAIL FROM becomes
        // postmaster@<helo>; a missing local-part becomes postmaster.
        let (local_part, sender_domain) = if mail_from.is_empty() {
            ("postmaster".to_string(), helo.to_string())
        } else {
            match domain::split_address(mail_from) {
                Some((local, dom)) => {
                    let local = if local.is_empty() { "postmaster" } else { local };
                    (local.to_string(), dom.to_string())
                }
                None => ("postmaster".to_string(), mail_from.to_string()),
            }
        };
        let sender = format!("{local_part}@{sender_domain}");
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            sender,
            local_part,
            sender_domain,
            helo: helo.to_string(),
            client_ip,
            receiver: receiver.to_string(),
            timestamp,
        }
    }

    fn macro_ctx(&self, current_domain: &str) -> MacroContext {
        MacroContext {
            sender: self.sender.clone(),
            local_part: self.local_part.clone(),
            sender_domain: self.sender_domain.clone(),
            client_ip: self.client_ip,
            helo: self.helo.clone(),
            domain: current_domain.to_string(),
            receiver: self.receiver.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Race a resolver call against the evaluation deadline.
async fn bounded_dns<T>(
    deadline: Option<Instant>,
    fut: impl Future<Output = Result<T, DnsError>>,
) -> Result<T, DnsError> {
    match deadline {
        Some(at) => timeout_at(at, fut).await.unwrap_or(Err(DnsError::Timeout)),
        None => fut.await,
    }
}

/// Like [`bounded_dns`] for futures without a `DnsError` channel;
/// `None` means the deadline fired.
async fn bounded<T>(deadline: Option<Instant>, fut: impl Future<Output = T>) -> Option<T> {
    match deadline {
        Some(at) => timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}
