//! Causal DAG over named variables.
//!
//! The graph is a fixed structure: a sorted list of variables (each observed
//! or latent), a deduplicated edge list, and one designated treatment and
//! outcome node. Every constructor validates acyclicity and treatment/outcome
//! membership, so a `CausalGraph` value is always a well-formed DAG.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use lc_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Treatment node of the loyalty graph.
pub const LOYALTY_TREATMENT: &str = "treatment";
/// Outcome node of the loyalty graph.
pub const LOYALTY_OUTCOME: &str = "post_spend";

/// A graph variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    /// Variable name (unique).
    pub name: String,
    /// `false` for latent variables that are absent from the data.
    pub observed: bool,
}

/// Plain serializable form of a [`CausalGraph`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphSpec {
    /// Variables, sorted by name.
    pub variables: Vec<Variable>,
    /// Directed edges `(from, to)`.
    pub edges: Vec<(String, String)>,
    /// Treatment node.
    pub treatment: String,
    /// Outcome node.
    pub outcome: String,
}

/// Validated causal DAG with a designated treatment and outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "GraphSpec", try_from = "GraphSpec")]
pub struct CausalGraph {
    variables: Vec<Variable>,
    edges: Vec<(usize, usize)>,
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    treatment: usize,
    outcome: usize,
}

impl From<CausalGraph> for GraphSpec {
    fn from(g: CausalGraph) -> Self {
        g.to_spec()
    }
}

impl TryFrom<GraphSpec> for CausalGraph {
    type Error = Error;

    fn try_from(spec: GraphSpec) -> Result<Self> {
        let nodes = spec.variables.into_iter().map(|v| (v.name, v.observed)).collect();
        CausalGraph::from_parts(nodes, spec.edges, &spec.treatment, &spec.outcome)
    }
}

impl CausalGraph {
    /// Build a graph from `(from, to)` edges. Nodes are the edge endpoints; all
    /// start out observed.
    ///
    /// Fails with [`Error::Graph`] on a cycle, a self-loop, an empty name, or
    /// when the treatment or outcome is not among the nodes.
    pub fn build<S: AsRef<str>>(edges: &[(S, S)], treatment: &str, outcome: &str) -> Result<Self> {
        let edges: Vec<(String, String)> = edges
            .iter()
            .map(|(a, b)| (a.as_ref().to_string(), b.as_ref().to_string()))
            .collect();
        Self::from_parts(Vec::new(), edges, treatment, outcome)
    }

    /// Assemble from explicit nodes (name, observed) plus edges. Edge endpoints
    /// not listed in `nodes` are added as observed variables.
    pub(crate) fn from_parts(
        nodes: Vec<(String, bool)>,
        edges: Vec<(String, String)>,
        treatment: &str,
        outcome: &str,
    ) -> Result<Self> {
        let mut observed: BTreeMap<String, bool> = BTreeMap::new();
        for (name, obs) in nodes {
            check_name(&name)?;
            let slot = observed.entry(name).or_insert(obs);
            *slot = *slot && obs;
        }
        for (a, b) in &edges {
            check_name(a)?;
            check_name(b)?;
            if a == b {
                return Err(Error::Graph(format!("self-loop on '{a}'")));
            }
            observed.entry(a.clone()).or_insert(true);
            observed.entry(b.clone()).or_insert(true);
        }

        let variables: Vec<Variable> =
            observed.into_iter().map(|(name, observed)| Variable { name, observed }).collect();
        let index: BTreeMap<&str, usize> =
            variables.iter().enumerate().map(|(i, v)| (v.name.as_str(), i)).collect();

        let treatment_idx = *index
            .get(treatment)
            .ok_or_else(|| Error::Graph(format!("treatment '{treatment}' is not a graph node")))?;
        let outcome_idx = *index
            .get(outcome)
            .ok_or_else(|| Error::Graph(format!("outcome '{outcome}' is not a graph node")))?;
        if treatment_idx == outcome_idx {
            return Err(Error::Graph("treatment and outcome must be distinct nodes".to_string()));
        }
        if !variables[treatment_idx].observed || !variables[outcome_idx].observed {
            return Err(Error::Graph("treatment and outcome must be observed".to_string()));
        }

        let mut edge_idx: Vec<(usize, usize)> =
            edges.iter().map(|(a, b)| (index[a.as_str()], index[b.as_str()])).collect();
        edge_idx.sort_unstable();
        edge_idx.dedup();

        let n = variables.len();
        let mut parents = vec![Vec::new(); n];
        let mut children = vec![Vec::new(); n];
        for &(a, b) in &edge_idx {
            children[a].push(b);
            parents[b].push(a);
        }

        let graph = Self {
            variables,
            edges: edge_idx,
            parents,
            children,
            treatment: treatment_idx,
            outcome: outcome_idx,
        };
        graph.topological_indices()?;
        Ok(graph)
    }

    /// Mark variables as latent (unobserved). Latent variables are never
    /// eligible for adjustment.
    pub fn with_latent<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        let mut g = self.clone();
        for name in names {
            let name = name.as_ref();
            let i = g
                .index(name)
                .ok_or_else(|| {
                    Error::Graph(format!("cannot mark unknown variable '{name}' latent"))
                })?;
            if i == g.treatment || i == g.outcome {
                return Err(Error::Graph(format!("'{name}' is the treatment or outcome")));
            }
            g.variables[i].observed = false;
        }
        Ok(g)
    }

    /// New graph with an extra observed variable pointing into both the
    /// treatment and the outcome.
    pub fn with_common_cause(&self, name: &str) -> Result<Self> {
        if self.index(name).is_some() {
            return Err(Error::Graph(format!("variable '{name}' already exists")));
        }
        let mut spec = self.to_spec();
        spec.variables.push(Variable { name: name.to_string(), observed: true });
        spec.edges.push((name.to_string(), spec.treatment.clone()));
        spec.edges.push((name.to_string(), spec.outcome.clone()));
        Self::try_from(spec)
    }

    /// Serializable form.
    pub fn to_spec(&self) -> GraphSpec {
        GraphSpec {
            variables: self.variables.clone(),
            edges: self
                .edges
                .iter()
                .map(|&(a, b)| (self.name(a).to_string(), self.name(b).to_string()))
                .collect(),
            treatment: self.treatment_name().to_string(),
            outcome: self.outcome_name().to_string(),
        }
    }

    /// Variables sorted by name.
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Edges as name pairs, sorted.
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.edges.iter().map(|&(a, b)| (self.name(a), self.name(b))).collect()
    }

    /// Treatment variable name.
    pub fn treatment_name(&self) -> &str {
        self.name(self.treatment)
    }

    /// Outcome variable name.
    pub fn outcome_name(&self) -> &str {
        self.name(self.outcome)
    }

    /// `true` if the variable exists and is observed.
    pub fn is_observed(&self, name: &str) -> bool {
        self.index(name).is_some_and(|i| self.variables[i].observed)
    }

    /// Direct parents of a variable (empty for unknown names).
    pub fn parents(&self, name: &str) -> Vec<&str> {
        self.index(name).map(|i| self.names(&self.parents[i])).unwrap_or_default()
    }

    /// Direct children of a variable (empty for unknown names).
    pub fn children(&self, name: &str) -> Vec<&str> {
        self.index(name).map(|i| self.names(&self.children[i])).unwrap_or_default()
    }

    /// Proper ancestors of a variable.
    pub fn ancestors(&self, name: &str) -> BTreeSet<&str> {
        match self.index(name) {
            Some(i) => {
                let mut set = self.ancestors_of(&[i]);
                set.remove(&i);
                set.into_iter().map(|j| self.name(j)).collect()
            }
            None => BTreeSet::new(),
        }
    }

    /// Proper descendants of a variable.
    pub fn descendants(&self, name: &str) -> BTreeSet<&str> {
        match self.index(name) {
            Some(i) => {
                let mut set = self.descendants_of(i);
                set.remove(&i);
                set.into_iter().map(|j| self.name(j)).collect()
            }
            None => BTreeSet::new(),
        }
    }

    /// Variables in a topological order (ties broken by name).
    pub fn topological_order(&self) -> Vec<&str> {
        // Acyclicity is checked at construction.
        self.topological_indices().map(|order| self.names(&order)).unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Index-level helpers used by the identifier
    // -----------------------------------------------------------------------

    pub(crate) fn len(&self) -> usize {
        self.variables.len()
    }

    pub(crate) fn index(&self, name: &str) -> Option<usize> {
        self.variables.binary_search_by(|v| v.name.as_str().cmp(name)).ok()
    }

    pub(crate) fn name(&self, i: usize) -> &str {
        &self.variables[i].name
    }

    pub(crate) fn treatment(&self) -> usize {
        self.treatment
    }

    pub(crate) fn outcome(&self) -> usize {
        self.outcome
    }

    pub(crate) fn observed(&self, i: usize) -> bool {
        self.variables[i].observed
    }

    pub(crate) fn parent_indices(&self, i: usize) -> &[usize] {
        &self.parents[i]
    }

    pub(crate) fn child_indices(&self, i: usize) -> &[usize] {
        &self.children[i]
    }

    /// Ancestors of `nodes`, including the nodes themselves.
    pub(crate) fn ancestors_of(&self, nodes: &[usize]) -> BTreeSet<usize> {
        self.closure(nodes, |i| self.parents[i].as_slice())
    }

    /// Descendants of `node`, including the node itself.
    pub(crate) fn descendants_of(&self, node: usize) -> BTreeSet<usize> {
        self.closure(&[node], |i| self.children[i].as_slice())
    }

    fn closure<'a>(
        &'a self,
        start: &[usize],
        next: impl Fn(usize) -> &'a [usize],
    ) -> BTreeSet<usize> {
        let mut seen: BTreeSet<usize> = start.iter().copied().collect();
        let mut queue: VecDeque<usize> = start.iter().copied().collect();
        while let Some(v) = queue.pop_front() {
            for &w in next(v) {
                if seen.insert(w) {
                    queue.push_back(w);
                }
            }
        }
        seen
    }

    fn names(&self, idx: &[usize]) -> Vec<&str> {
        idx.iter().map(|&i| self.name(i)).collect()
    }

    /// Kahn's algorithm; lowest index first among ready nodes.
    fn topological_indices(&self) -> Result<Vec<usize>> {
        let n = self.len();
        let mut indegree: Vec<usize> = self.parents.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(v) = ready.pop_first() {
            order.push(v);
            for &w in &self.children[v] {
                indegree[w] -= 1;
                if indegree[w] == 0 {
                    ready.insert(w);
                }
            }
        }
        if order.len() != n {
            let stuck: Vec<&str> =
                (0..n).filter(|&i| indegree[i] > 0).map(|i| self.name(i)).collect();
            return Err(Error::Graph(format!("edges form a cycle through {}", stuck.join(", "))));
        }
        Ok(order)
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Graph("variable names must be non-empty".to_string()));
    }
    Ok(())
}

/// The loyalty-program graph for cohort data.
///
/// `pre_spend` confounds enrollment and post-period spend; `Z` stands for
/// unmeasured drivers of enrollment that do not touch spend.
pub fn loyalty_graph() -> Result<CausalGraph> {
    CausalGraph::build(
        &[
            ("Z", LOYALTY_TREATMENT),
            ("pre_spend", LOYALTY_TREATMENT),
            ("pre_spend", LOYALTY_OUTCOME),
            (LOYALTY_TREATMENT, LOYALTY_OUTCOME),
        ],
        LOYALTY_TREATMENT,
        LOYALTY_OUTCOME,
    )?
    .with_latent(&["Z"])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_sorts_variables_and_dedups_edges() {
        let g = CausalGraph::build(&[("w", "t"), ("w", "y"), ("t", "y"), ("w", "t")], "t", "y")
            .unwrap();
        let names: Vec<&str> = g.variables().iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["t", "w", "y"]);
        assert_eq!(g.edges().len(), 3);
        assert_eq!(g.parents("y"), vec!["t", "w"]);
        assert_eq!(g.children("w"), vec!["t", "y"]);
        assert_eq!(g.topological_order(), vec!["w", "t", "y"]);
    }

    #[test]
    fn rejects_cycles_and_missing_nodes() {
        let cyc = CausalGraph::build(&[("a", "b"), ("b", "c"), ("c", "a"), ("a", "y")], "a", "y");
        match cyc {
            Err(Error::Graph(msg)) => assert!(msg.contains("cycle"), "{msg}"),
            other => panic!("expected cycle error, got {other:?}"),
        }
        assert!(matches!(CausalGraph::build(&[("a", "b")], "t", "b"), Err(Error::Graph(_))));
        assert!(matches!(CausalGraph::build(&[("a", "b")], "a", "y"), Err(Error::Graph(_))));
        assert!(matches!(CausalGraph::build(&[("a", "a")], "a", "a"), Err(Error::Graph(_))));
        assert!(matches!(CausalGraph::build(&[("a", "b")], "a", "a"), Err(Error::Graph(_))));
    }

    #[test]
    fn ancestors_and_descendants_exclude_self() {
        let g = CausalGraph::build(&[("a", "t"), ("t", "m"), ("m", "y"), ("a", "y")], "t", "y")
            .unwrap();
        assert_eq!(g.ancestors("y").into_iter().collect::<Vec<_>>(), vec!["a", "m", "t"]);
        assert_eq!(g.descendants("t").into_iter().collect::<Vec<_>>(), vec!["m", "y"]);
        assert!(g.descendants("nope").is_empty());
    }

    #[test]
    fn latent_marking_and_common_cause() {
        let g = loyalty_graph().unwrap();
        assert!(!g.is_observed("Z"));
        assert!(g.is_observed("pre_spend"));
        assert!(g.with_latent(&["treatment"]).is_err());
        assert!(g.with_latent(&["missing"]).is_err());

        let g2 = g.with_common_cause("noise").unwrap();
        assert_eq!(g2.children("noise"), vec!["post_spend", "treatment"]);
        assert!(!g2.is_observed("Z"));
        assert!(g.index("noise").is_none());
        assert!(g2.with_common_cause("noise").is_err());
    }

    #[test]
    fn serde_round_trip_revalidates() {
        let g = loyalty_graph().unwrap();
        let json = serde_json::to_string(&g).unwrap();
        let back: CausalGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(g, back);

        let mut spec = g.to_spec();
        spec.edges.push(("post_spend".to_string(), "pre_spend".to_string()));
        let bad = serde_json::to_string(&spec).unwrap();
        assert!(serde_json::from_str::<CausalGraph>(&bad).is_err());
    }
}
