//! Policy gate: decides whether a link may be resolved at all.
//!
//! The gate is a pure function of a [`PolicySource`] snapshot. It looks at the
//! host of the link exactly as the caller submitted it, never at the
//! normalised key, and runs before any cache or strategy interaction.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use url::Url;

use crate::core::parse_link;

/// Reason attached to links that cannot be parsed into an http(s) URL.
pub const MALFORMED_URL: &str = "malformed url";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny { reason: String },
}

impl PolicyDecision {
    pub fn deny(reason: impl Into<String>) -> Self {
        PolicyDecision::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }
}

/// What to do with hosts present on neither list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyMode {
    #[default]
    Open,
    AllowListOnly,
}

/// Allow/block list provider. The lists themselves are managed elsewhere.
pub trait PolicySource: Send + Sync {
    fn is_blocked(&self, host: &str) -> bool;
    fn is_allowed(&self, host: &str) -> bool;
    fn mode(&self) -> PolicyMode {
        PolicyMode::Open
    }
}

/// Gate in front of the manager.
#[derive(Clone)]
pub struct PolicyGate {
    source: Arc<dyn PolicySource>,
}

impl PolicyGate {
    pub fn new(source: Arc<dyn PolicySource>) -> Self {
        Self { source }
    }

    /// Gate that lets every well-formed link through.
    pub fn open() -> Self {
        Self::new(Arc::new(DomainListPolicy::default()))
    }

    pub fn evaluate(&self, raw_url: &str) -> PolicyDecision {
        match parse_link(raw_url) {
            Ok(url) => self.evaluate_url(&url),
            Err(_) => PolicyDecision::deny(MALFORMED_URL),
        }
    }

    pub fn evaluate_url(&self, url: &Url) -> PolicyDecision {
        let Some(host) = url.host_str().map(|h| h.trim_end_matches('.').to_ascii_lowercase())
        else {
            return PolicyDecision::deny(MALFORMED_URL);
        };

        if self.source.is_blocked(&host) {
            return PolicyDecision::deny(format!("domain {host} is blocked"));
        }
        if self.source.is_allowed(&host) {
            return PolicyDecision::Allow;
        }
        match self.source.mode() {
            PolicyMode::Open => PolicyDecision::Allow,
            PolicyMode::AllowListOnly => {
                PolicyDecision::deny(format!("domain {host} is not a supported shortener"))
            }
        }
    }
}

impl std::fmt::Debug for PolicyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyGate")
            .field("mode", &self.source.mode())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
struct DomainLists {
    allowed: BTreeSet<String>,
    blocked: BTreeSet<String>,
}

/// In-memory domain lists, swapped atomically on [`refresh`](Self::refresh).
///
/// Entries match the host itself and any subdomain of it: `bit.ly` covers
/// `www.bit.ly` but not `notbit.ly`.
#[derive(Debug, Default)]
pub struct DomainListPolicy {
    lists: RwLock<Arc<DomainLists>>,
    mode: PolicyMode,
}

impl DomainListPolicy {
    pub fn new<A, B, S>(allowed: A, blocked: B) -> Self
    where
        A: IntoIterator<Item = S>,
        B: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            lists: RwLock::new(Arc::new(build_lists(allowed, blocked))),
            mode: PolicyMode::Open,
        }
    }

    /// Shortener hosts the resolver is known to handle, and hosts that must
    /// never be fetched.
    pub fn with_default_lists() -> Self {
        Self::new(DEFAULT_ALLOWED.iter().copied(), DEFAULT_BLOCKED.iter().copied())
    }

    pub fn with_mode(mut self, mode: PolicyMode) -> Self {
        self.mode = mode;
        self
    }

    /// Replace both lists with a new snapshot.
    pub fn refresh<A, B, S>(&self, allowed: A, blocked: B)
    where
        A: IntoIterator<Item = S>,
        B: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let next = Arc::new(build_lists(allowed, blocked));
        match self.lists.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    fn snapshot(&self) -> Arc<DomainLists> {
        match self.lists.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }
}

impl PolicySource for DomainListPolicy {
    fn is_blocked(&self, host: &str) -> bool {
        matches_any(&self.snapshot().blocked, host)
    }

    fn is_allowed(&self, host: &str) -> bool {
        matches_any(&self.snapshot().allowed, host)
    }

    fn mode(&self) -> PolicyMode {
        self.mode
    }
}

fn build_lists<A, B, S>(allowed: A, blocked: B) -> DomainLists
where
    A: IntoIterator<Item = S>,
    B: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let clean = |s: S| {
        let domain = s.as_ref().trim().trim_end_matches('.').to_ascii_lowercase();
        (!domain.is_empty()).then_some(domain)
    };
    DomainLists {
        allowed: allowed.into_iter().filter_map(clean).collect(),
        blocked: blocked.into_iter().filter_map(clean).collect(),
    }
}

fn matches_any(list: &BTreeSet<String>, host: &str) -> bool {
    let mut candidate = host;
    loop {
        if list.contains(candidate) {
            return true;
        }
        match candidate.split_once('.') {
            Some((_, parent)) if !parent.is_empty() => candidate = parent,
            _ => return false,
        }
    }
}

const DEFAULT_ALLOWED: &[&str] = &[
    "bit.ly",
    "tinyurl.com",
    "t.co",
    "goo.gl",
    "ow.ly",
    "is.gd",
    "buff.ly",
    "adf.ly",
    "bc.vc",
    "ouo.io",
    "ouo.press",
    "linkvertise.com",
    "shorte.st",
    "sh.st",
    "gplinks.co",
    "droplink.co",
    "earnl.xyz",
    "cutt.ly",
    "rb.gy",
    "shrinkme.io",
    "exe.io",
];

const DEFAULT_BLOCKED: &[&str] = &["malware.com", "phishing.com", "virus.com"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_list_wins_over_allow_list() {
        let policy = DomainListPolicy::new(["evil.example"], ["evil.example"]);
        let gate = PolicyGate::new(Arc::new(policy));
        assert_eq!(
            gate.evaluate("https://evil.example/x"),
            PolicyDecision::deny("domain evil.example is blocked")
        );
    }

    #[test]
    fn subdomains_match_but_lookalikes_do_not() {
        let policy = DomainListPolicy::new(Vec::<&str>::new(), vec!["bad.com"]);
        let gate = PolicyGate::new(Arc::new(policy));
        assert!(!gate.evaluate("http://www.bad.com/a").is_allowed());
        assert!(!gate.evaluate("http://BAD.com./a").is_allowed());
        assert!(gate.evaluate("http://notbad.com/a").is_allowed());
    }

    #[test]
    fn allow_list_only_mode_denies_unknown_hosts() {
        let policy =
            DomainListPolicy::with_default_lists().with_mode(PolicyMode::AllowListOnly);
        let gate = PolicyGate::new(Arc::new(policy));
        assert!(gate.evaluate("https://bit.ly/abc").is_allowed());
        assert!(!gate.evaluate("https://random.example/abc").is_allowed());
        assert!(!gate.evaluate("https://malware.com/abc").is_allowed());
    }

    #[test]
    fn malformed_links_are_denied() {
        let gate = PolicyGate::open();
        assert_eq!(gate.evaluate("not a link"), PolicyDecision::deny(MALFORMED_URL));
        assert_eq!(gate.evaluate("ftp://bit.ly/x"), PolicyDecision::deny(MALFORMED_URL));
        assert!(gate.evaluate("https://anything.example").is_allowed());
    }

    #[test]
    fn refresh_swaps_the_lists() {
        let policy = Arc::new(DomainListPolicy::new(Vec::<&str>::new(), vec!["a.com"]));
        let gate = PolicyGate::new(policy.clone());
        assert!(!gate.evaluate("https://a.com").is_allowed());

        policy.refresh(Vec::<&str>::new(), vec!["b.com"]);
        assert!(gate.evaluate("https://a.com").is_allowed());
        assert!(!gate.evaluate("https://b.com").is_allowed());
    }
}
