// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::types::{Path, PeerInfo, Prefix, RouteFamily};
use rsd_common::lock;
use slog::{warn, Logger};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// All candidate paths for one destination plus the current selection.
#[derive(Debug, Default)]
struct Destination {
    known: Vec<Path>,
    best: Option<Path>,
}

impl Destination {
    /// Recompute the selected path. Returns the change to advertise: the new
    /// best path if the selection moved, a synthesized withdraw if the last
    /// path went away, nothing if the selection is unchanged.
    fn select(&mut self) -> Option<Path> {
        let mut candidates: Vec<&Path> = self.known.iter().collect();
        candidates.sort_by(|a, b| a.cmp_preference(b));
        let new_best = candidates.first().map(|p| (*p).clone());
        match (self.best.take(), new_best) {
            (Some(old), None) => Some(old.withdrawn()),
            (old, Some(new)) => {
                self.best = Some(new.clone());
                if old.as_ref() != Some(&new) {
                    Some(new)
                } else {
                    None
                }
            }
            (None, None) => None,
        }
    }
}

#[derive(Debug, Default)]
struct RibInner {
    tables: BTreeMap<RouteFamily, BTreeMap<Prefix, Destination>>,
}

/// The shared decision-process table. One instance is shared by every
/// session that performs best-path selection (route-server clients through
/// their sessions, and the global-RIB actor); all access is serialized
/// internally, so concurrent callers see a self-consistent view per call.
#[derive(Clone)]
pub struct Rib {
    inner: Arc<Mutex<RibInner>>,
    log: Logger,
}

impl Rib {
    pub fn new(families: &[RouteFamily], log: Logger) -> Self {
        let mut tables = BTreeMap::new();
        for family in families {
            tables.insert(*family, BTreeMap::new());
        }
        Self {
            inner: Arc::new(Mutex::new(RibInner { tables })),
            log,
        }
    }

    /// Apply a batch of announcements and withdraws, returning the resulting
    /// best-path changes in input order of destination.
    pub fn process_paths(&self, paths: Vec<Path>) -> Vec<Path> {
        let mut inner = lock!(self.inner);
        let mut changes = Vec::new();
        for path in paths {
            let Some(table) = inner.tables.get_mut(&path.family) else {
                warn!(self.log, "path for unknown route family dropped";
                    "family" => %path.family);
                continue;
            };
            let dest = table.entry(path.nlri).or_default();
            if path.withdraw {
                dest.known.retain(|k| k.source != path.source);
            } else {
                dest.known.retain(|k| k.source != path.source);
                dest.known.push(path.clone());
            }
            if let Some(change) = dest.select() {
                changes.push(change);
            }
            if dest.known.is_empty() {
                table.remove(&path.nlri);
            }
        }
        changes
    }

    /// Drop every path originated by `peer` for `family`, returning the
    /// resulting best-path changes.
    pub fn delete_paths_for_peer(
        &self,
        peer: &PeerInfo,
        family: RouteFamily,
    ) -> Vec<Path> {
        let mut inner = lock!(self.inner);
        let mut changes = Vec::new();
        let Some(table) = inner.tables.get_mut(&family) else {
            return changes;
        };
        let mut empty = Vec::new();
        for (prefix, dest) in table.iter_mut() {
            let before = dest.known.len();
            dest.known.retain(|k| k.source != *peer);
            if dest.known.len() != before {
                if let Some(change) = dest.select() {
                    changes.push(change);
                }
            }
            if dest.known.is_empty() {
                empty.push(*prefix);
            }
        }
        for prefix in empty {
            table.remove(&prefix);
        }
        changes
    }

    /// Current best paths for a family.
    pub fn get_path_list(&self, family: RouteFamily) -> Vec<Path> {
        let inner = lock!(self.inner);
        inner
            .tables
            .get(&family)
            .map(|t| t.values().filter_map(|d| d.best.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_family(&self, family: RouteFamily) -> bool {
        lock!(self.inner).tables.contains_key(&family)
    }

    /// Serializable snapshot of one family's table: every known path keyed
    /// by prefix.
    pub fn table(&self, family: RouteFamily) -> BTreeMap<String, Vec<Path>> {
        let inner = lock!(self.inner);
        inner
            .tables
            .get(&family)
            .map(|t| {
                t.iter()
                    .map(|(p, d)| (p.to_string(), d.known.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::RouteFamily;

    fn source(addr: &str) -> PeerInfo {
        PeerInfo {
            asn: 65001,
            id: 1,
            address: addr.parse().unwrap(),
        }
    }

    fn path(prefix: &str, from: &str) -> Path {
        let nlri: Prefix = prefix.parse().unwrap();
        let mut p = Path::new(nlri.family(), nlri, source(from));
        p.as_path = vec![65001];
        p.nexthop = Some(from.parse().unwrap());
        p
    }

    fn rib() -> Rib {
        Rib::new(
            &[RouteFamily::IPV4_UNICAST],
            rsd_common::log::test_logger(),
        )
    }

    #[test]
    fn add_then_withdraw() {
        let rib = rib();
        let changes = rib.process_paths(vec![path("10.0.0.0/24", "192.0.2.1")]);
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].withdraw);

        let changes = rib
            .process_paths(vec![path("10.0.0.0/24", "192.0.2.1").withdrawn()]);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].withdraw);
        assert!(rib.get_path_list(RouteFamily::IPV4_UNICAST).is_empty());
    }

    #[test]
    fn better_path_wins() {
        let rib = rib();
        let mut worse = path("10.0.0.0/24", "192.0.2.1");
        worse.as_path = vec![65001, 65002];
        rib.process_paths(vec![worse]);

        let better = path("10.0.0.0/24", "192.0.2.2");
        let changes = rib.process_paths(vec![better.clone()]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].source, better.source);

        // Re-announcing the loser changes nothing.
        let mut still_worse = path("10.0.0.0/24", "192.0.2.1");
        still_worse.as_path = vec![65001, 65002, 65003];
        let changes = rib.process_paths(vec![still_worse]);
        assert!(changes.is_empty());
    }

    #[test]
    fn withdraw_falls_back_to_second_best() {
        let rib = rib();
        let mut worse = path("10.0.0.0/24", "192.0.2.1");
        worse.as_path = vec![65001, 65002];
        rib.process_paths(vec![worse.clone()]);
        let better = path("10.0.0.0/24", "192.0.2.2");
        rib.process_paths(vec![better.clone()]);

        let changes = rib.process_paths(vec![better.withdrawn()]);
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].withdraw);
        assert_eq!(changes[0].source, worse.source);
    }

    #[test]
    fn delete_for_peer() {
        let rib = rib();
        rib.process_paths(vec![
            path("10.0.0.0/24", "192.0.2.1"),
            path("10.0.1.0/24", "192.0.2.1"),
            path("10.0.2.0/24", "192.0.2.2"),
        ]);
        let changes = rib.delete_paths_for_peer(
            &source("192.0.2.1"),
            RouteFamily::IPV4_UNICAST,
        );
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.withdraw));
        assert_eq!(rib.get_path_list(RouteFamily::IPV4_UNICAST).len(), 1);
    }

    #[test]
    fn empty_input_no_changes() {
        let rib = rib();
        assert!(rib.process_paths(Vec::new()).is_empty());
    }
}
