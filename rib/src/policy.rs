// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::types::{Path, Prefix};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The action a matched policy takes on a path.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize, JsonSchema,
)]
pub enum PolicyDisposition {
    Accept,
    Reject,
}

/// The verdict applied when policies are configured but none matched.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize, JsonSchema,
)]
pub enum DefaultPolicy {
    AcceptRoute,
    RejectRoute,
}

/// Result of evaluating one policy against one path. A rejecting match
/// carries no path; an accepting match may carry a rewritten path.
#[derive(Debug, Clone)]
pub enum PolicyOutcome {
    NoMatch,
    Matched {
        disposition: PolicyDisposition,
        path: Option<Path>,
    },
}

/// A named route policy. Expression syntax and matching semantics beyond
/// this interface belong to the policy engine, not to the session core.
pub trait Policy: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, path: &Path) -> PolicyOutcome;
}

/// One prefix rule: matches any path whose NLRI is equal to or more specific
/// than `prefix`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PrefixRule {
    pub prefix: Prefix,
    pub disposition: PolicyDisposition,
}

impl PrefixRule {
    fn matches(&self, path: &Path) -> bool {
        self.prefix.covers(&path.nlri)
    }
}

/// An ordered prefix-list policy. The first matching rule decides.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PrefixPolicy {
    name: String,
    rules: Vec<PrefixRule>,
}

impl PrefixPolicy {
    pub fn new(name: &str, rules: Vec<PrefixRule>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }
}

impl Policy for PrefixPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, path: &Path) -> PolicyOutcome {
        for rule in &self.rules {
            if rule.matches(path) {
                return match rule.disposition {
                    PolicyDisposition::Reject => PolicyOutcome::Matched {
                        disposition: PolicyDisposition::Reject,
                        path: None,
                    },
                    PolicyDisposition::Accept => PolicyOutcome::Matched {
                        disposition: PolicyDisposition::Accept,
                        path: Some(path.clone()),
                    },
                };
            }
        }
        PolicyOutcome::NoMatch
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{PeerInfo, RouteFamily};

    fn path(prefix: &str) -> Path {
        let source = PeerInfo {
            asn: 65001,
            id: 1,
            address: "192.0.2.1".parse().unwrap(),
        };
        let nlri: Prefix = prefix.parse().unwrap();
        Path::new(RouteFamily::IPV4_UNICAST, nlri, source)
    }

    fn rule(prefix: &str, disposition: PolicyDisposition) -> PrefixRule {
        PrefixRule {
            prefix: prefix.parse().unwrap(),
            disposition,
        }
    }

    #[test]
    fn first_rule_decides() {
        let policy = PrefixPolicy::new(
            "filter-ten",
            vec![
                rule("10.0.0.0/8", PolicyDisposition::Reject),
                rule("0.0.0.0/0", PolicyDisposition::Accept),
            ],
        );

        match policy.apply(&path("10.1.0.0/16")) {
            PolicyOutcome::Matched { disposition, path } => {
                assert_eq!(disposition, PolicyDisposition::Reject);
                assert!(path.is_none());
            }
            PolicyOutcome::NoMatch => panic!("expected a match"),
        }

        match policy.apply(&path("192.168.0.0/16")) {
            PolicyOutcome::Matched { disposition, path } => {
                assert_eq!(disposition, PolicyDisposition::Accept);
                assert!(path.is_some());
            }
            PolicyOutcome::NoMatch => panic!("expected a match"),
        }
    }

    #[test]
    fn no_rule_matches() {
        let policy = PrefixPolicy::new(
            "narrow",
            vec![rule("203.0.113.0/24", PolicyDisposition::Reject)],
        );
        assert!(matches!(
            policy.apply(&path("10.0.0.0/24")),
            PolicyOutcome::NoMatch
        ));
        // A less specific path does not match a more specific rule.
        assert!(matches!(
            policy.apply(&path("203.0.0.0/8")),
            PolicyOutcome::NoMatch
        ));
    }
}
