//! Commutativity analysis.
//!
//! Logical changes are the capsule's executions, each restricted to the
//! paths it wrote that survive in the final change-set. Two changes conflict
//! when they touch the same path, or when one touches a directory the other
//! writes beneath. Connected components of the conflict graph are the
//! independent sets.

use crate::config::types::ChangeSet;
use crate::registry::ExecRecord;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A unit of change that could be applied on its own
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalChange {
    pub id: String,
    pub paths: Vec<String>,
}

/// Two changes contending for the same paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictPair {
    pub first: String,
    pub second: String,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommutativityReport {
    /// Disjoint groups of paths, each safe to apply independently
    pub independent_sets: Vec<Vec<String>>,
    pub conflicts: Vec<ConflictPair>,
    pub changes: Vec<LogicalChange>,
}

/// Split a final change-set into logical changes using execution history.
/// Paths no recorded execution accounts for become single-path changes.
pub fn changes_from_history(history: &[ExecRecord], changes: &ChangeSet) -> Vec<LogicalChange> {
    let surviving: BTreeSet<&str> = changes.iter().map(|r| r.path.as_str()).collect();
    let mut attributed = BTreeSet::new();
    let mut logical = Vec::new();

    for record in history {
        let paths: Vec<String> = record
            .written
            .iter()
            .filter(|p| surviving.contains(p.as_str()))
            .cloned()
            .collect();
        if paths.is_empty() {
            continue;
        }
        attributed.extend(paths.iter().cloned());
        logical.push(LogicalChange {
            id: format!("exec-{}", record.index),
            paths,
        });
    }

    for path in surviving {
        if !attributed.contains(path) {
            logical.push(LogicalChange {
                id: format!("path:{}", path),
                paths: vec![path.to_string()],
            });
        }
    }
    logical
}

/// One logical change per record
pub fn analyze_change_set(changes: &ChangeSet) -> CommutativityReport {
    analyze(changes_from_history(&[], changes))
}

pub fn analyze(changes: Vec<LogicalChange>) -> CommutativityReport {
    let mut owners: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, change) in changes.iter().enumerate() {
        for path in &change.paths {
            let list = owners.entry(path.as_str()).or_default();
            if list.last() != Some(&idx) {
                list.push(idx);
            }
        }
    }

    let mut sets = DisjointSets::new(changes.len());
    let mut contended: BTreeMap<(usize, usize), Vec<String>> = BTreeMap::new();

    for (path, list) in &owners {
        for (i, &a) in list.iter().enumerate() {
            for &b in &list[i + 1..] {
                sets.union(a, b);
                contended.entry((a, b)).or_default().push(path.to_string());
            }
        }
        // A path nested under another touched path depends on it
        for ancestor in ancestors(path) {
            if let Some(above) = owners.get(ancestor) {
                for &a in above {
                    for &b in list {
                        sets.union(a, b);
                    }
                }
            }
        }
    }

    let mut groups: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
    for (path, list) in &owners {
        if let Some(&first) = list.first() {
            groups
                .entry(sets.find(first))
                .or_default()
                .insert(path.to_string());
        }
    }
    let mut independent_sets: Vec<Vec<String>> = groups
        .into_values()
        .map(|set| set.into_iter().collect())
        .collect();
    independent_sets.sort();

    let conflicts = contended
        .into_iter()
        .map(|((a, b), paths)| ConflictPair {
            first: changes[a].id.clone(),
            second: changes[b].id.clone(),
            paths,
        })
        .collect::<Vec<_>>();

    debug!(
        "{} logical changes form {} independent sets with {} conflicts",
        changes.len(),
        independent_sets.len(),
        conflicts.len()
    );
    CommutativityReport {
        independent_sets,
        conflicts,
        changes,
    }
}

/// Proper ancestors of a `/`-separated relative path, nearest last
fn ancestors<'a>(path: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    path.match_indices('/').map(move |(idx, _)| &path[..idx])
}

struct DisjointSets {
    parent: Vec<usize>,
}

impl DisjointSets {
    fn new(len: usize) -> Self {
        DisjointSets {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}
