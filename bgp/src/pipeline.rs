// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The route-processing pipeline shared by peer sessions and the
//! global-RIB actor: policy application, import/export filtering, export
//! attribute rewriting, and conversion between paths and UPDATE messages.

use crate::config::{PeerConfig, RouterConfig};
use crate::messages::{
    AsPathSegment, AsPathType, Message, PathAttribute, UpdateMessage,
};
use rib::{DefaultPolicy, Path, PeerInfo, Policy, PolicyOutcome};
use std::sync::Arc;

/// Local-pref assigned to internal paths that arrive without one.
pub const DEFAULT_LOCAL_PREF: u32 = 100;

/// The per-session policy chains with their no-match verdicts. Swapped
/// atomically (under the supervisor's single thread) when policy
/// configuration changes.
#[derive(Clone)]
pub struct PolicyChains {
    pub import: Vec<Arc<dyn Policy>>,
    pub export: Vec<Arc<dyn Policy>>,
    pub default_import: DefaultPolicy,
    pub default_export: DefaultPolicy,
}

impl PolicyChains {
    pub fn new(
        default_import: DefaultPolicy,
        default_export: DefaultPolicy,
    ) -> Self {
        Self {
            import: Vec::new(),
            export: Vec::new(),
            default_import,
            default_export,
        }
    }
}

/// Run a path through a policy chain in order. The first matching policy
/// decides: a reject match returns `(true, None)`, any other match returns
/// `(true, new_path)` without consulting downstream policies. If nothing
/// matches, `(false, original)`.
pub fn apply_policies(
    chain: &[Arc<dyn Policy>],
    path: &Path,
) -> (bool, Option<Path>) {
    for policy in chain {
        match policy.apply(path) {
            PolicyOutcome::Matched { path: new_path, .. } => {
                return (true, new_path);
            }
            PolicyOutcome::NoMatch => continue,
        }
    }
    (false, Some(path.clone()))
}

/// Filter a path list through a chain. Withdrawals always pass. An empty
/// chain means no policies are configured and everything passes unchanged;
/// the default verdict only governs the policies-present-but-none-matched
/// case.
pub fn filter_paths(
    paths: Vec<Path>,
    chain: &[Arc<dyn Policy>],
    default: DefaultPolicy,
) -> Vec<Path> {
    if chain.is_empty() {
        return paths;
    }
    let mut kept = Vec::new();
    for path in paths {
        if path.withdraw {
            kept.push(path);
            continue;
        }
        let (applied, new_path) = apply_policies(chain, &path);
        if applied {
            if let Some(p) = new_path {
                kept.push(p);
            }
        } else if default == DefaultPolicy::AcceptRoute {
            kept.push(path);
        }
    }
    kept
}

/// Clone paths and rewrite their attributes for emission to this neighbor.
/// Route-server clients see attributes untouched; eBGP peers get the local
/// AS prepended and local-pref stripped, iBGP peers get a default
/// local-pref. Nexthops pass through; egress filtering drops any that
/// point back at the neighbor.
pub fn prepare_export(
    paths: &[Path],
    router: &RouterConfig,
    config: &PeerConfig,
) -> Vec<Path> {
    paths
        .iter()
        .map(|path| {
            let mut p = path.clone();
            if p.withdraw || config.route_server_client {
                return p;
            }
            let ebgp = config.remote_asn != router.asn.as_u32();
            if ebgp {
                p.as_path.insert(0, router.asn.as_u32());
                p.local_pref = None;
            } else if p.local_pref.is_none() {
                p.local_pref = Some(DEFAULT_LOCAL_PREF);
            }
            p
        })
        .collect()
}

/// Convert a received UPDATE into a path list tagged with the receiving
/// peer's identity.
pub fn paths_from_update(
    update: &UpdateMessage,
    source: PeerInfo,
) -> Vec<Path> {
    let mut origin = rib::PathOrigin::Incomplete;
    let mut as_path = Vec::new();
    let mut nexthop = None;
    let mut med = None;
    let mut local_pref = None;
    let mut communities = Vec::new();
    for attr in &update.path_attributes {
        match attr {
            PathAttribute::Origin(o) => origin = *o,
            PathAttribute::AsPath(segments) => {
                as_path = segments
                    .iter()
                    .flat_map(|s| s.value.iter().copied())
                    .collect();
            }
            PathAttribute::NextHop(addr) => nexthop = Some(*addr),
            PathAttribute::MultiExitDisc(value) => med = Some(*value),
            PathAttribute::LocalPref(value) => local_pref = Some(*value),
            PathAttribute::Communities(value) => {
                communities = value.clone();
            }
            PathAttribute::As4Path(_) => {}
        }
    }

    let mut paths = Vec::new();
    for nlri in &update.nlri {
        let mut p = Path::new(nlri.family(), *nlri, source);
        p.origin = origin;
        p.as_path = as_path.clone();
        p.nexthop = nexthop;
        p.med = med;
        p.local_pref = local_pref;
        p.communities = communities.clone();
        paths.push(p);
    }
    for withdrawn in &update.withdrawn {
        paths.push(Path::new(withdrawn.family(), *withdrawn, source).withdrawn());
    }
    paths
}

/// Build UPDATE messages from a path list, one per path.
pub fn updates_from_paths(paths: &[Path]) -> Vec<Message> {
    paths
        .iter()
        .map(|path| {
            let mut update = UpdateMessage::default();
            if path.withdraw {
                update.withdrawn.push(path.nlri);
                return Message::Update(update);
            }
            update.nlri.push(path.nlri);
            update
                .path_attributes
                .push(PathAttribute::Origin(path.origin));
            let segments = if path.as_path.is_empty() {
                Vec::new()
            } else {
                vec![AsPathSegment {
                    typ: AsPathType::AsSequence,
                    value: path.as_path.clone(),
                }]
            };
            update.path_attributes.push(PathAttribute::AsPath(segments));
            if let Some(addr) = path.nexthop {
                update.path_attributes.push(PathAttribute::NextHop(addr));
            }
            if let Some(med) = path.med {
                update
                    .path_attributes
                    .push(PathAttribute::MultiExitDisc(med));
            }
            if let Some(pref) = path.local_pref {
                update.path_attributes.push(PathAttribute::LocalPref(pref));
            }
            if !path.communities.is_empty() {
                update
                    .path_attributes
                    .push(PathAttribute::Communities(path.communities.clone()));
            }
            Message::Update(update)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use rib::{
        PolicyDisposition, Prefix, PrefixPolicy, PrefixRule, RouteFamily,
    };

    fn source() -> PeerInfo {
        PeerInfo {
            asn: 65002,
            id: 2,
            address: "192.0.2.2".parse().unwrap(),
        }
    }

    fn path(prefix: &str) -> Path {
        let nlri: Prefix = prefix.parse().unwrap();
        let mut p = Path::new(RouteFamily::IPV4_UNICAST, nlri, source());
        p.as_path = vec![65002];
        p.nexthop = Some("192.0.2.2".parse().unwrap());
        p
    }

    fn reject(name: &str, prefix: &str) -> Arc<dyn Policy> {
        Arc::new(PrefixPolicy::new(
            name,
            vec![PrefixRule {
                prefix: prefix.parse().unwrap(),
                disposition: PolicyDisposition::Reject,
            }],
        ))
    }

    fn accept(name: &str, prefix: &str) -> Arc<dyn Policy> {
        Arc::new(PrefixPolicy::new(
            name,
            vec![PrefixRule {
                prefix: prefix.parse().unwrap(),
                disposition: PolicyDisposition::Accept,
            }],
        ))
    }

    #[test]
    fn reject_short_circuits() {
        let chain =
            vec![reject("deny-ten", "10.0.0.0/8"), accept("allow-all", "0.0.0.0/0")];
        let (applied, out) = apply_policies(&chain, &path("10.1.0.0/16"));
        assert!(applied);
        assert!(out.is_none());
    }

    #[test]
    fn first_match_wins() {
        let chain =
            vec![accept("allow-all", "0.0.0.0/0"), reject("deny-ten", "10.0.0.0/8")];
        let (applied, out) = apply_policies(&chain, &path("10.1.0.0/16"));
        assert!(applied);
        assert!(out.is_some());
    }

    #[test]
    fn no_match_returns_original() {
        let chain = vec![reject("deny-doc", "203.0.113.0/24")];
        let p = path("10.1.0.0/16");
        let (applied, out) = apply_policies(&chain, &p);
        assert!(!applied);
        assert_eq!(out.unwrap(), p);
    }

    #[test]
    fn empty_chain_passes_regardless_of_default() {
        let paths = vec![path("10.1.0.0/16")];
        let kept =
            filter_paths(paths.clone(), &[], DefaultPolicy::RejectRoute);
        assert_eq!(kept, paths);
    }

    #[test]
    fn unmatched_follows_default() {
        let chain = vec![reject("deny-doc", "203.0.113.0/24")];
        let paths = vec![path("10.1.0.0/16")];
        let kept = filter_paths(
            paths.clone(),
            &chain,
            DefaultPolicy::RejectRoute,
        );
        assert!(kept.is_empty());
        let kept = filter_paths(paths, &chain, DefaultPolicy::AcceptRoute);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn withdrawals_always_kept() {
        let chain = vec![reject("deny-all", "0.0.0.0/0")];
        let kept = filter_paths(
            vec![path("10.1.0.0/16").withdrawn()],
            &chain,
            DefaultPolicy::RejectRoute,
        );
        assert_eq!(kept.len(), 1);
        assert!(kept[0].withdraw);
    }

    #[test]
    fn export_rewrites_for_ebgp() {
        let router = RouterConfig {
            asn: rib::Asn::FourOctet(65001),
            id: 1,
        };
        let config = PeerConfig::new(
            "r2",
            "192.0.2.2:179".parse().unwrap(),
            65002,
        );
        let mut p = path("10.1.0.0/16");
        p.local_pref = Some(200);
        let nexthop = p.nexthop;
        let out = prepare_export(&[p], &router, &config);
        assert_eq!(out[0].as_path, vec![65001, 65002]);
        assert_eq!(out[0].local_pref, None);
        assert_eq!(out[0].nexthop, nexthop);
    }

    #[test]
    fn export_defaults_local_pref_for_ibgp() {
        let router = RouterConfig {
            asn: rib::Asn::FourOctet(65002),
            id: 1,
        };
        let config = PeerConfig::new(
            "r2",
            "192.0.2.2:179".parse().unwrap(),
            65002,
        );
        let out = prepare_export(&[path("10.1.0.0/16")], &router, &config);
        assert_eq!(out[0].local_pref, Some(DEFAULT_LOCAL_PREF));
        assert_eq!(out[0].as_path, vec![65002]);
    }

    #[test]
    fn export_untouched_for_route_server_client() {
        let router = RouterConfig {
            asn: rib::Asn::FourOctet(65001),
            id: 1,
        };
        let mut config = PeerConfig::new(
            "r2",
            "192.0.2.2:179".parse().unwrap(),
            65002,
        );
        config.route_server_client = true;
        let p = path("10.1.0.0/16");
        let out = prepare_export(&[p.clone()], &router, &config);
        assert_eq!(out[0], p);
    }

    #[test]
    fn update_path_round_trip() {
        let p = path("10.7.0.0/24");
        let msgs = updates_from_paths(&[p.clone()]);
        assert_eq!(msgs.len(), 1);
        let Message::Update(ref update) = msgs[0] else {
            panic!("expected update");
        };
        let back = paths_from_update(update, source());
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].nlri, p.nlri);
        assert_eq!(back[0].as_path, p.as_path);
        assert_eq!(back[0].nexthop, p.nexthop);
        assert!(!back[0].withdraw);
    }

    #[test]
    fn withdraw_becomes_withdrawn_nlri() {
        let msgs = updates_from_paths(&[path("10.7.0.0/24").withdrawn()]);
        let Message::Update(ref update) = msgs[0] else {
            panic!("expected update");
        };
        assert_eq!(update.withdrawn.len(), 1);
        assert!(update.nlri.is_empty());
        assert!(update.path_attributes.is_empty());
    }
}
