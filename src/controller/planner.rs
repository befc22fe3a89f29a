//! Rebalance layout planning.
//!
//! Starting from the polled layout, the planner first repairs replication
//! (every file on exactly R nodes), then moves single copies from the most
//! loaded node to the least loaded one until loads differ by at most one.
//! Each move goes from load `a` to load `b <= a - 2`, which strictly lowers
//! the sum of squared loads, so the loop terminates. Whenever the max load
//! exceeds the min load, the max node holds some file the min node lacks.

use std::collections::{BTreeMap, BTreeSet};

use crate::protocol::{NodeId, RebalanceInstr};

/// Per-node file sets.
pub(crate) type Layout = BTreeMap<NodeId, BTreeSet<String>>;

/// Outcome of planning one rebalance cycle.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) struct RebalancePlan {
    /// Layout after every instruction succeeds.
    pub(crate) target: Layout,

    /// Non-empty instructions only, keyed by the node that runs them.
    pub(crate) instrs: BTreeMap<NodeId, RebalanceInstr>,
}

impl RebalancePlan {
    /// Best-known layout after a partially completed cycle: nodes in
    /// `completed` have shipped their copies and dropped their deletes,
    /// everybody else is assumed unchanged.
    pub(crate) fn surviving_layout(
        &self,
        current: &Layout,
        completed: &BTreeSet<NodeId>,
    ) -> Layout {
        let mut layout = current.clone();
        for (src, instr) in &self.instrs {
            if !completed.contains(src) {
                continue;
            }
            for (name, dests) in &instr.sends {
                for dest in dests {
                    if let Some(held) = layout.get_mut(dest) {
                        held.insert(name.clone());
                    }
                }
            }
            if let Some(held) = layout.get_mut(src) {
                for name in &instr.deletes {
                    held.remove(name);
                }
            }
        }
        layout
    }
}

fn load_of(layout: &Layout, id: &NodeId) -> usize {
    layout.get(id).map(|held| held.len()).unwrap_or(0)
}

/// Node with the highest load, ties broken by lowest NodeId.
fn most_loaded<'a>(
    layout: &Layout,
    candidates: impl Iterator<Item = &'a NodeId>,
) -> Option<NodeId> {
    candidates
        .copied()
        .min_by_key(|id| (std::cmp::Reverse(load_of(layout, id)), *id))
}

/// Node with the lowest load, ties broken by lowest NodeId.
fn least_loaded<'a>(
    layout: &Layout,
    candidates: impl Iterator<Item = &'a NodeId>,
) -> Option<NodeId> {
    candidates
        .copied()
        .min_by_key(|id| (load_of(layout, id), *id))
}

/// Brings every file to exactly `r` holders.
fn repair_replication(layout: &mut Layout, files: &BTreeSet<String>, r: usize) {
    let nodes: Vec<NodeId> = layout.keys().copied().collect();
    for name in files {
        loop {
            let holders: Vec<NodeId> = nodes
                .iter()
                .copied()
                .filter(|id| layout[id].contains(name))
                .collect();
            if holders.len() > r {
                // trim from the busiest holder; highest NodeId among equals
                let victim = holders
                    .iter()
                    .copied()
                    .max_by_key(|id| (load_of(layout, id), *id));
                match victim.and_then(|id| layout.get_mut(&id)) {
                    Some(held) => held.remove(name),
                    None => break,
                };
            } else if holders.len() < r {
                let dest = least_loaded(
                    layout,
                    nodes.iter().filter(|id| !holders.contains(id)),
                );
                match dest.and_then(|id| layout.get_mut(&id)) {
                    Some(held) => held.insert(name.clone()),
                    None => break,
                };
            } else {
                break;
            }
        }
    }
}

/// Moves copies from the most to the least loaded node until all loads are
/// within one of each other.
fn even_out(layout: &mut Layout) {
    loop {
        let (src, dest) = match (
            most_loaded(layout, layout.keys()),
            least_loaded(layout, layout.keys()),
        ) {
            (Some(src), Some(dest)) => (src, dest),
            _ => return,
        };
        if load_of(layout, &src) <= load_of(layout, &dest) + 1 {
            return;
        }

        let movable = layout[&src]
            .iter()
            .find(|name| !layout[&dest].contains(*name))
            .cloned();
        match movable {
            Some(name) => {
                if let Some(held) = layout.get_mut(&src) {
                    held.remove(&name);
                }
                if let Some(held) = layout.get_mut(&dest) {
                    held.insert(name);
                }
            }
            None => return, // unreachable while src load > dest load
        }
    }
}

/// Plans one rebalance cycle. `actual` holds every live node's inventory
/// (orphans already cleaned), `files` the StoreComplete names to place on
/// `r` nodes each. Names in `actual` outside `files` are left alone.
pub(crate) fn plan_rebalance(
    actual: &Layout,
    files: &BTreeSet<String>,
    r: usize,
) -> RebalancePlan {
    let r = r.min(actual.len());
    let current: Layout = actual
        .iter()
        .map(|(id, held)| (*id, held.intersection(files).cloned().collect()))
        .collect();

    let mut target = current.clone();
    repair_replication(&mut target, files, r);
    even_out(&mut target);

    let mut instrs: BTreeMap<NodeId, RebalanceInstr> = BTreeMap::new();
    let mut sends: BTreeMap<NodeId, BTreeMap<String, Vec<NodeId>>> =
        BTreeMap::new();
    for (dest, held) in &target {
        for name in held.difference(&current[dest]) {
            // a file in `files` always has at least one current holder
            let src = current
                .iter()
                .find(|(_, had)| had.contains(name))
                .map(|(id, _)| *id);
            if let Some(src) = src {
                sends
                    .entry(src)
                    .or_default()
                    .entry(name.clone())
                    .or_default()
                    .push(*dest);
            }
        }
    }
    for (src, by_name) in sends {
        instrs.entry(src).or_default().sends = by_name.into_iter().collect();
    }
    for (id, had) in &current {
        let deletes: Vec<String> =
            had.difference(&target[id]).cloned().collect();
        if !deletes.is_empty() {
            instrs.entry(*id).or_default().deletes = deletes;
        }
    }
    instrs.retain(|_, instr| !instr.is_empty());

    RebalancePlan { target, instrs }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout_of(entries: &[(u16, &[&str])]) -> Layout {
        entries
            .iter()
            .map(|(id, names)| {
                (NodeId(*id), names.iter().map(|n| n.to_string()).collect())
            })
            .collect()
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|n| n.to_string()).collect()
    }

    fn assert_converged(target: &Layout, files: &BTreeSet<String>, r: usize) {
        for name in files {
            let holders = target.values().filter(|h| h.contains(name)).count();
            assert_eq!(holders, r, "file {} on {} nodes", name, holders);
        }
        let loads: Vec<usize> = target.values().map(|h| h.len()).collect();
        let max = loads.iter().max().copied().unwrap_or(0);
        let min = loads.iter().min().copied().unwrap_or(0);
        assert!(max <= min + 1, "loads {:?} not even", loads);
    }

    #[test]
    fn disjoint_files_replicated() {
        let actual = layout_of(&[(7001, &["a"]), (7002, &["b"]), (7003, &["c"])]);
        let files = names(&["a", "b", "c"]);
        let plan = plan_rebalance(&actual, &files, 2);
        assert_converged(&plan.target, &files, 2);
        assert_eq!(
            plan.target,
            layout_of(&[
                (7001, &["b", "c"]),
                (7002, &["a", "b"]),
                (7003, &["a", "c"]),
            ])
        );
        assert_eq!(
            plan.instrs[&NodeId(7001)],
            RebalanceInstr {
                sends: vec![("a".into(), vec![NodeId(7002), NodeId(7003)])],
                deletes: vec!["a".into()],
            }
        );
        assert_eq!(
            plan.instrs[&NodeId(7002)].sends,
            vec![("b".to_string(), vec![NodeId(7001)])]
        );
        assert_eq!(
            plan.instrs[&NodeId(7003)].sends,
            vec![("c".to_string(), vec![NodeId(7001)])]
        );
    }

    #[test]
    fn balanced_layout_untouched() {
        let actual = layout_of(&[(7001, &["a", "b"]), (7002, &["a", "b"])]);
        let files = names(&["a", "b"]);
        let plan = plan_rebalance(&actual, &files, 2);
        assert!(plan.instrs.is_empty());
        assert_eq!(plan.target, actual);
    }

    #[test]
    fn new_node_receives_share() {
        let actual = layout_of(&[
            (7001, &["a", "b", "c", "d"]),
            (7002, &["a", "b", "c", "d"]),
            (7003, &[]),
        ]);
        let files = names(&["a", "b", "c", "d"]);
        let plan = plan_rebalance(&actual, &files, 2);
        assert_converged(&plan.target, &files, 2);
        assert!(plan.target[&NodeId(7003)].len() >= 2);
        // transfers only go to the new node
        for instr in plan.instrs.values() {
            for (_, dests) in &instr.sends {
                assert_eq!(dests, &vec![NodeId(7003)]);
            }
        }
    }

    #[test]
    fn over_replication_trimmed() {
        let actual = layout_of(&[
            (7001, &["a"]),
            (7002, &["a"]),
            (7003, &["a"]),
        ]);
        let files = names(&["a"]);
        let plan = plan_rebalance(&actual, &files, 2);
        assert_converged(&plan.target, &files, 2);
        assert_eq!(
            plan.instrs,
            BTreeMap::from([(
                NodeId(7003),
                RebalanceInstr {
                    sends: vec![],
                    deletes: vec!["a".into()],
                }
            )])
        );
    }

    #[test]
    fn unknown_names_left_alone() {
        // "busy" is mid-store or mid-remove, not ours to move
        let actual = layout_of(&[(7001, &["a", "busy"]), (7002, &[])]);
        let files = names(&["a"]);
        let plan = plan_rebalance(&actual, &files, 1);
        assert!(plan.instrs.values().all(|i| !i.deletes.contains(&"busy".to_string())));
        assert!(plan.target.values().all(|held| !held.contains("busy")));
    }

    #[test]
    fn many_files_converge() {
        let mut entries: Vec<(u16, Vec<String>)> = vec![];
        let all: Vec<String> = (0..23).map(|i| format!("f{:02}", i)).collect();
        // everything piled on the first node, partly on the second
        entries.push((7001, all.clone()));
        entries.push((7002, all[..5].to_vec()));
        for id in 7003..7007 {
            entries.push((id, vec![]));
        }
        let actual: Layout = entries
            .into_iter()
            .map(|(id, held)| (NodeId(id), held.into_iter().collect()))
            .collect();
        let files: BTreeSet<String> = all.into_iter().collect();
        let plan = plan_rebalance(&actual, &files, 3);
        assert_converged(&plan.target, &files, 3);

        // applying every instruction reproduces the target
        let completed: BTreeSet<NodeId> = plan.instrs.keys().copied().collect();
        assert_eq!(plan.surviving_layout(&actual, &completed), plan.target);
    }

    #[test]
    fn replication_capped_by_node_count() {
        let actual = layout_of(&[(7001, &["a"]), (7002, &[])]);
        let files = names(&["a"]);
        let plan = plan_rebalance(&actual, &files, 3);
        assert_converged(&plan.target, &files, 2);
    }

    #[test]
    fn surviving_layout_partial() {
        let actual = layout_of(&[(7001, &["a"]), (7002, &["b"]), (7003, &["c"])]);
        let files = names(&["a", "b", "c"]);
        let plan = plan_rebalance(&actual, &files, 2);
        let completed = BTreeSet::from([NodeId(7002)]);
        assert_eq!(
            plan.surviving_layout(&actual, &completed),
            layout_of(&[(7001, &["a", "b"]), (7002, &["b"]), (7003, &["c"])])
        );
    }
}
