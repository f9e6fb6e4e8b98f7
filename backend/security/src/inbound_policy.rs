//! Inbound call acceptance: decides whether an unknown caller may reach us.
//!
//! `allowlist` and `pairing` both match on the digit suffix of the caller
//! number, so `+1 (555) 000-0000` and `15550000000` are the same entry.

use callforge_core::{normalize_digits, InboundPolicy};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundAcceptance {
    pub policy: InboundPolicy,
    #[serde(default)]
    pub allow_from: Vec<String>,
}

impl InboundAcceptance {
    pub fn new(policy: InboundPolicy, allow_from: Vec<String>) -> Self {
        Self { policy, allow_from }
    }

    /// Returns `true` if a call from `caller` should get a record.
    pub fn is_allowed(&self, caller: Option<&str>) -> bool {
        match self.policy {
            InboundPolicy::Disabled => {
                warn!("[InboundPolicy] Inbound calls disabled, rejecting caller");
                false
            }
            InboundPolicy::Open => true,
            InboundPolicy::Allowlist | InboundPolicy::Pairing => {
                let allowed = caller.is_some_and(|c| self.matches_allow_entry(c));
                if allowed {
                    debug!("[InboundPolicy] Caller matched allowlist");
                } else {
                    warn!("[InboundPolicy] Caller not in allowlist");
                }
                allowed
            }
        }
    }

    fn matches_allow_entry(&self, caller: &str) -> bool {
        let caller = normalize_digits(caller);
        if caller.is_empty() {
            return false;
        }
        self.allow_from.iter().any(|entry| {
            let entry = normalize_digits(entry);
            !entry.is_empty() && caller.ends_with(&entry)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_by_default() {
        assert!(!InboundAcceptance::default().is_allowed(Some("+15550000000")));
    }

    #[test]
    fn open_accepts_anyone() {
        let policy = InboundAcceptance::new(InboundPolicy::Open, vec![]);
        assert!(policy.is_allowed(Some("+19995551111")));
        assert!(policy.is_allowed(None));
    }

    #[test]
    fn allowlist_matches_on_digit_suffix() {
        let policy = InboundAcceptance::new(InboundPolicy::Allowlist, vec!["+15550000000".into()]);
        assert!(policy.is_allowed(Some("+15550000000")));
        assert!(policy.is_allowed(Some("+1 (555) 000-0000")));
        assert!(!policy.is_allowed(Some("5550000000")));
        assert!(!policy.is_allowed(Some("+19995551111")));
        assert!(!policy.is_allowed(None));
        assert!(!policy.is_allowed(Some("anonymous")));
    }

    #[test]
    fn pairing_uses_the_same_match() {
        let policy = InboundAcceptance::new(InboundPolicy::Pairing, vec!["5550000000".into()]);
        assert!(policy.is_allowed(Some("+15550000000")));
        assert!(!policy.is_allowed(Some("+15550000001")));
    }
}
