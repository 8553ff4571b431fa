// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::types::{Path, Prefix, RouteFamily};
use std::collections::BTreeMap;

/// The per-peer adjacency tables: what was last received from the peer
/// (post-parse, pre-policy) and what has been or will be sent to the peer
/// (post-policy). One ordered table per configured route family; operations
/// on unconfigured families are no-ops.
#[derive(Debug, Default)]
pub struct AdjRib {
    rib_in: BTreeMap<RouteFamily, BTreeMap<Prefix, Path>>,
    rib_out: BTreeMap<RouteFamily, BTreeMap<Prefix, Path>>,
}

impl AdjRib {
    pub fn new(families: &[RouteFamily]) -> Self {
        let mut rib_in = BTreeMap::new();
        let mut rib_out = BTreeMap::new();
        for family in families {
            rib_in.insert(*family, BTreeMap::new());
            rib_out.insert(*family, BTreeMap::new());
        }
        Self { rib_in, rib_out }
    }

    pub fn update_in(&mut self, paths: &[Path]) {
        Self::update(&mut self.rib_in, paths)
    }

    pub fn update_out(&mut self, paths: &[Path]) {
        Self::update(&mut self.rib_out, paths)
    }

    fn update(
        tables: &mut BTreeMap<RouteFamily, BTreeMap<Prefix, Path>>,
        paths: &[Path],
    ) {
        for path in paths {
            let Some(table) = tables.get_mut(&path.family) else {
                continue;
            };
            if path.withdraw {
                table.remove(&path.nlri);
            } else {
                table.insert(path.nlri, path.clone());
            }
        }
    }

    pub fn get_in_path_list(&self, family: RouteFamily) -> Vec<Path> {
        Self::path_list(&self.rib_in, family)
    }

    pub fn get_out_path_list(&self, family: RouteFamily) -> Vec<Path> {
        Self::path_list(&self.rib_out, family)
    }

    fn path_list(
        tables: &BTreeMap<RouteFamily, BTreeMap<Prefix, Path>>,
        family: RouteFamily,
    ) -> Vec<Path> {
        tables
            .get(&family)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn drop_all_in(&mut self, family: RouteFamily) {
        if let Some(table) = self.rib_in.get_mut(&family) {
            table.clear();
        }
    }

    pub fn in_count(&self, family: RouteFamily) -> usize {
        self.rib_in.get(&family).map(|t| t.len()).unwrap_or(0)
    }

    pub fn out_count(&self, family: RouteFamily) -> usize {
        self.rib_out.get(&family).map(|t| t.len()).unwrap_or(0)
    }

    /// Serializable view of one direction keyed by prefix string.
    pub fn snapshot_in(&self, family: RouteFamily) -> BTreeMap<String, Path> {
        Self::snapshot(&self.rib_in, family)
    }

    pub fn snapshot_out(&self, family: RouteFamily) -> BTreeMap<String, Path> {
        Self::snapshot(&self.rib_out, family)
    }

    fn snapshot(
        tables: &BTreeMap<RouteFamily, BTreeMap<Prefix, Path>>,
        family: RouteFamily,
    ) -> BTreeMap<String, Path> {
        tables
            .get(&family)
            .map(|t| {
                t.iter().map(|(p, path)| (p.to_string(), path.clone())).collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{PeerInfo, RouteFamily};

    fn path(prefix: &str) -> Path {
        let source = PeerInfo {
            asn: 65001,
            id: 0x0a000001,
            address: "192.0.2.1".parse().unwrap(),
        };
        let nlri: Prefix = prefix.parse().unwrap();
        Path::new(nlri.family(), nlri, source)
    }

    #[test]
    fn in_out_independent() {
        let mut adj = AdjRib::new(&[RouteFamily::IPV4_UNICAST]);
        adj.update_in(&[path("10.0.0.0/24")]);
        assert_eq!(adj.in_count(RouteFamily::IPV4_UNICAST), 1);
        assert_eq!(adj.out_count(RouteFamily::IPV4_UNICAST), 0);
    }

    #[test]
    fn withdraw_removes() {
        let mut adj = AdjRib::new(&[RouteFamily::IPV4_UNICAST]);
        adj.update_in(&[path("10.0.0.0/24"), path("10.0.1.0/24")]);
        adj.update_in(&[path("10.0.0.0/24").withdrawn()]);
        let paths = adj.get_in_path_list(RouteFamily::IPV4_UNICAST);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].nlri.to_string(), "10.0.1.0/24");
    }

    #[test]
    fn replace_same_prefix() {
        let mut adj = AdjRib::new(&[RouteFamily::IPV4_UNICAST]);
        adj.update_in(&[path("10.0.0.0/24")]);
        let mut newer = path("10.0.0.0/24");
        newer.med = Some(50);
        adj.update_in(&[newer]);
        let paths = adj.get_in_path_list(RouteFamily::IPV4_UNICAST);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].med, Some(50));
    }

    #[test]
    fn unconfigured_family_ignored() {
        let mut adj = AdjRib::new(&[RouteFamily::IPV4_UNICAST]);
        adj.update_in(&[path("fd00::/64")]);
        assert_eq!(adj.in_count(RouteFamily::IPV6_UNICAST), 0);
        assert!(adj.get_in_path_list(RouteFamily::IPV6_UNICAST).is_empty());
    }

    #[test]
    fn drop_all_in_clears_only_in() {
        let mut adj = AdjRib::new(&[RouteFamily::IPV4_UNICAST]);
        adj.update_in(&[path("10.0.0.0/24")]);
        adj.update_out(&[path("10.0.1.0/24")]);
        adj.drop_all_in(RouteFamily::IPV4_UNICAST);
        assert_eq!(adj.in_count(RouteFamily::IPV4_UNICAST), 0);
        assert_eq!(adj.out_count(RouteFamily::IPV4_UNICAST), 1);
    }
}
