//! Backdoor identification.
//!
//! A set `Z` satisfies the backdoor criterion for `(T, Y)` when no member of
//! `Z` is a descendant of `T` and `Z` d-separates `T` from `Y` in the graph
//! with every edge out of `T` removed. Every candidate set is checked with an
//! explicit reachability (Bayes-ball) pass rather than assumed valid from the
//! graph's shape.

use std::collections::{BTreeSet, VecDeque};

use lc_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::graph::CausalGraph;

/// Ordered set of variable names to adjust for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdjustmentSet(BTreeSet<String>);

impl AdjustmentSet {
    /// Build from names.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    /// Names in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Membership test.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` for the empty set (no confounding paths to block).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Which search stage produced the adjustment set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentStrategy {
    /// Observed variables with edges into both treatment and outcome.
    CommonCauses,
    /// Observed parents of the treatment.
    TreatmentParents,
    /// Pruned set of observed pre-treatment ancestors of treatment and outcome.
    PrunedAncestors,
}

/// Identification result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identification {
    /// Valid backdoor adjustment set.
    pub adjustment_set: AdjustmentSet,
    /// Search stage that produced it.
    pub strategy: AdjustmentStrategy,
    /// `false` when the treatment has no directed path to the outcome, in
    /// which case the identified effect is zero.
    pub has_causal_path: bool,
}

/// Is every path between `x` and `y` blocked by `z`?
///
/// Unknown variable names are a [`Error::Graph`].
pub fn is_d_separated<S: AsRef<str>>(
    graph: &CausalGraph,
    x: &str,
    y: &str,
    z: &[S],
) -> Result<bool> {
    let xi = lookup(graph, x)?;
    let yi = lookup(graph, y)?;
    let zi: BTreeSet<usize> = z.iter().map(|n| lookup(graph, n.as_ref())).collect::<Result<_>>()?;
    Ok(!reachable(graph, xi, &zi, None).contains(&yi))
}

/// Does `z` satisfy the backdoor criterion relative to the graph's treatment
/// and outcome?
pub fn satisfies_backdoor<S: AsRef<str>>(graph: &CausalGraph, z: &[S]) -> Result<bool> {
    let zi: BTreeSet<usize> = z.iter().map(|n| lookup(graph, n.as_ref())).collect::<Result<_>>()?;
    Ok(backdoor_valid(graph, &zi))
}

/// Derive an adjustment set for the graph's `treatment -> outcome` effect.
///
/// Candidates are tried in order (common causes, treatment parents, pruned
/// ancestors), keeping the first that passes explicit path-blocking
/// verification. Latent variables are never used. Fails with
/// [`Error::Identification`] when no observed set blocks every backdoor path.
pub fn identify_adjustment_set(graph: &CausalGraph) -> Result<Identification> {
    let t = graph.treatment();
    let y = graph.outcome();
    let forbidden = graph.descendants_of(t);
    let eligible = |i: &usize| graph.observed(*i) && !forbidden.contains(i) && *i != y;

    let has_causal_path = forbidden.contains(&y);
    if !has_causal_path {
        tracing::warn!(
            treatment = graph.treatment_name(),
            outcome = graph.outcome_name(),
            "no directed path from treatment to outcome; identified effect is zero"
        );
    }

    let t_parents: BTreeSet<usize> = graph.parent_indices(t).iter().copied().collect();
    let common: BTreeSet<usize> = graph
        .parent_indices(y)
        .iter()
        .copied()
        .filter(|i| t_parents.contains(i) && eligible(i))
        .collect();
    if backdoor_valid(graph, &common) {
        return Ok(finish(graph, common, AdjustmentStrategy::CommonCauses, has_causal_path));
    }
    tracing::debug!("common causes do not block every backdoor path");

    let parents: BTreeSet<usize> = t_parents.iter().copied().filter(eligible).collect();
    if parents.len() == t_parents.len() && backdoor_valid(graph, &parents) {
        return Ok(finish(graph, parents, AdjustmentStrategy::TreatmentParents, has_causal_path));
    }
    tracing::debug!("treatment parents are latent or insufficient; trying ancestors");

    let ancestors: BTreeSet<usize> =
        graph.ancestors_of(&[t, y]).into_iter().filter(eligible).collect();
    if backdoor_valid(graph, &ancestors) {
        let mut pruned = ancestors.clone();
        for &v in &ancestors {
            pruned.remove(&v);
            if !backdoor_valid(graph, &pruned) {
                pruned.insert(v);
            }
        }
        return Ok(finish(graph, pruned, AdjustmentStrategy::PrunedAncestors, has_causal_path));
    }

    Err(Error::Identification(format!(
        "no observed set blocks every backdoor path from '{}' to '{}'",
        graph.treatment_name(),
        graph.outcome_name()
    )))
}

fn finish(
    graph: &CausalGraph,
    set: BTreeSet<usize>,
    strategy: AdjustmentStrategy,
    has_causal_path: bool,
) -> Identification {
    let adjustment_set = AdjustmentSet::new(set.into_iter().map(|i| graph.name(i).to_string()));
    tracing::info!(
        adjustment = ?adjustment_set.iter().collect::<Vec<_>>(),
        ?strategy,
        "backdoor adjustment set identified"
    );
    Identification { adjustment_set, strategy, has_causal_path }
}

fn lookup(graph: &CausalGraph, name: &str) -> Result<usize> {
    graph.index(name).ok_or_else(|| Error::Graph(format!("unknown variable '{name}'")))
}

fn backdoor_valid(graph: &CausalGraph, z: &BTreeSet<usize>) -> bool {
    let t = graph.treatment();
    let y = graph.outcome();
    if z.contains(&t) || z.contains(&y) {
        return false;
    }
    let descendants = graph.descendants_of(t);
    if z.iter().any(|i| descendants.contains(i)) {
        return false;
    }
    !reachable(graph, t, z, Some(t)).contains(&y)
}

fn children_of(graph: &CausalGraph, v: usize, cut: Option<usize>) -> &[usize] {
    if Some(v) == cut { &[] } else { graph.child_indices(v) }
}

/// Nodes reachable from `source` along active trails given conditioning set
/// `z` (Koller & Friedman, Alg. 3.1). Edges out of `cut` are ignored.
fn reachable(
    graph: &CausalGraph,
    source: usize,
    z: &BTreeSet<usize>,
    cut: Option<usize>,
) -> BTreeSet<usize> {
    let z_ancestors = graph.ancestors_of(&z.iter().copied().collect::<Vec<_>>());
    let children = |v: usize| children_of(graph, v, cut);
    let parents =
        |v: usize| graph.parent_indices(v).iter().copied().filter(move |&p| Some(p) != cut);

    // (node, arrived_from_child)
    let mut queue: VecDeque<(usize, bool)> = VecDeque::from([(source, true)]);
    let mut visited: BTreeSet<(usize, bool)> = BTreeSet::new();
    let mut reached = BTreeSet::new();

    while let Some((v, up)) = queue.pop_front() {
        if !visited.insert((v, up)) {
            continue;
        }
        let conditioned = z.contains(&v);
        if !conditioned {
            reached.insert(v);
        }
        if up && !conditioned {
            for p in parents(v) {
                queue.push_back((p, true));
            }
            for &c in children(v) {
                queue.push_back((c, false));
            }
        } else if !up {
            if !conditioned {
                for &c in children(v) {
                    queue.push_back((c, false));
                }
            }
            if z_ancestors.contains(&v) {
                for p in parents(v) {
                    queue.push_back((p, true));
                }
            }
        }
    }
    reached
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::loyalty_graph;

    fn names(id: &Identification) -> Vec<&str> {
        id.adjustment_set.iter().collect()
    }

    #[test]
    fn loyalty_graph_adjusts_for_pre_spend() {
        let g = loyalty_graph().unwrap();
        let id = identify_adjustment_set(&g).unwrap();
        assert_eq!(names(&id), vec!["pre_spend"]);
        assert_eq!(id.strategy, AdjustmentStrategy::CommonCauses);
        assert!(id.has_causal_path);
    }

    #[test]
    fn d_separation_basics() {
        // chain a -> b -> c, fork b <- d -> e, collider a -> f <- e
        let g = CausalGraph::build(
            &[("a", "b"), ("b", "c"), ("d", "b"), ("d", "e"), ("a", "f"), ("e", "f")],
            "a",
            "c",
        )
        .unwrap();
        assert!(!is_d_separated(&g, "a", "c", &[] as &[&str]).unwrap());
        assert!(is_d_separated(&g, "a", "c", &["b"]).unwrap());
        // collider f closed unless conditioned on
        assert!(is_d_separated(&g, "a", "e", &[] as &[&str]).unwrap());
        assert!(!is_d_separated(&g, "a", "e", &["f"]).unwrap());
        // conditioning on b (collider a -> b <- d) opens a - d
        assert!(!is_d_separated(&g, "a", "d", &["b"]).unwrap());
        assert!(is_d_separated(&g, "a", "z", &["b"]).is_err());
    }

    #[test]
    fn confounding_chain_needs_explicit_blocking() {
        // w -> c -> t, w -> y, t -> y: no direct common cause, parents of t block.
        let g = CausalGraph::build(&[("w", "c"), ("c", "t"), ("w", "y"), ("t", "y")], "t", "y")
            .unwrap();
        let id = identify_adjustment_set(&g).unwrap();
        assert_eq!(names(&id), vec!["c"]);
        assert_eq!(id.strategy, AdjustmentStrategy::TreatmentParents);
    }

    #[test]
    fn latent_parent_falls_back_to_pruned_ancestors() {
        // u (latent) -> t, w -> u, w -> y, t -> m -> y
        let edges = [("u", "t"), ("w", "u"), ("w", "y"), ("t", "m"), ("m", "y")];
        let g = CausalGraph::build(&edges, "t", "y")
            .unwrap()
            .with_latent(&["u"])
            .unwrap();
        let id = identify_adjustment_set(&g).unwrap();
        assert_eq!(names(&id), vec!["w"]);
        assert_eq!(id.strategy, AdjustmentStrategy::PrunedAncestors);
        assert!(!id.adjustment_set.contains("m"), "mediators must never be adjusted for");
    }

    #[test]
    fn latent_confounder_is_unidentifiable() {
        let g = CausalGraph::build(&[("u", "t"), ("u", "y"), ("t", "y")], "t", "y")
            .unwrap()
            .with_latent(&["u"])
            .unwrap();
        assert!(matches!(identify_adjustment_set(&g), Err(Error::Identification(_))));
    }

    #[test]
    fn no_backdoor_paths_gives_empty_set() {
        let g = CausalGraph::build(&[("t", "y"), ("y", "k")], "t", "y").unwrap();
        let id = identify_adjustment_set(&g).unwrap();
        assert!(id.adjustment_set.is_empty());
    }

    #[test]
    fn backdoor_rejects_descendants() {
        let edges = [("w", "t"), ("w", "y"), ("t", "m"), ("m", "y")];
        let g = CausalGraph::build(&edges, "t", "y").unwrap();
        assert!(satisfies_backdoor(&g, &["w"]).unwrap());
        assert!(!satisfies_backdoor(&g, &["w", "m"]).unwrap());
        assert!(!satisfies_backdoor(&g, &[] as &[&str]).unwrap());
    }

    #[test]
    fn missing_causal_path_still_identifies() {
        let g = CausalGraph::build(&[("w", "t"), ("w", "y")], "t", "y").unwrap();
        let id = identify_adjustment_set(&g).unwrap();
        assert!(!id.has_causal_path);
        assert_eq!(names(&id), vec!["w"]);
    }
}
