//! Dependency Resolver: parses inter-issue dependencies and orders issues
//! topologically.
//!
//! Grounded on `dag/builder.rs`'s `PhaseGraph`/`DagBuilder` (index map +
//! forward/reverse edge lists + Kahn's-algorithm cycle detection), adapted
//! from phase-to-phase dependencies to issue-to-issue dependencies parsed
//! from issue body text and labels.

use crate::model::Iid;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

fn depends_on_body_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)depends\s+on:?\s*#(\d+)").expect("valid regex"))
}

fn depends_on_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^depends-on[/-](\d+)$").expect("valid regex"))
}

/// Parse `Depends on: #n` references out of an issue body.
pub fn parse_body_dependencies(body: &str) -> Vec<Iid> {
    depends_on_body_re()
        .captures_iter(body)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

/// Parse `depends-on/<n>` or `depends-on-<n>` labels.
pub fn parse_label_dependencies(labels: &[String]) -> Vec<Iid> {
    labels
        .iter()
        .filter_map(|l| depends_on_label_re().captures(l))
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

/// One requested issue plus its (unfiltered) declared dependencies.
#[derive(Debug, Clone)]
pub struct IssueNode {
    pub number: Iid,
    pub depends_on: Vec<Iid>,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("dependency cycle detected among issues: {0:?}")]
    Cycle(Vec<Iid>),
}

/// Topologically sort `issues`, considering only dependency edges where
/// both ends are in the requested set (external dependencies are ignored).
/// Ties among ready issues are broken by ascending issue number.
pub fn topological_order(issues: &[IssueNode]) -> Result<Vec<Iid>, ResolveError> {
    let requested: HashSet<Iid> = issues.iter().map(|i| i.number).collect();
    let mut in_degree: HashMap<Iid, usize> = HashMap::new();
    let mut dependents: HashMap<Iid, Vec<Iid>> = HashMap::new();

    for issue in issues {
        in_degree.entry(issue.number).or_insert(0);
        for dep in &issue.depends_on {
            if !requested.contains(dep) {
                continue;
            }
            *in_degree.entry(issue.number).or_insert(0) += 1;
            dependents.entry(*dep).or_default().push(issue.number);
        }
    }

    let mut ready: Vec<Iid> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(iid, _)| *iid)
        .collect();
    ready.sort_unstable();

    let mut order = Vec::with_capacity(issues.len());
    let mut frontier = ready;
    while !frontier.is_empty() {
        frontier.sort_unstable();
        let node = frontier.remove(0);
        order.push(node);
        if let Some(deps) = dependents.get(&node) {
            for &dependent in deps {
                let entry = in_degree.get_mut(&dependent).expect("tracked in_degree");
                *entry -= 1;
                if *entry == 0 {
                    frontier.push(dependent);
                }
            }
        }
    }

    if order.len() != issues.len() {
        let cycle: Vec<Iid> = in_degree
            .iter()
            .filter(|(_, deg)| **deg > 0)
            .map(|(iid, _)| *iid)
            .collect();
        return Err(ResolveError::Cycle(cycle));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: Iid, deps: Vec<Iid>) -> IssueNode {
        IssueNode {
            number: n,
            depends_on: deps,
        }
    }

    #[test]
    fn parses_body_dependency_reference() {
        let body = "This fix depends on: #42 for the shared type.";
        assert_eq!(parse_body_dependencies(body), vec![42]);
    }

    #[test]
    fn parses_label_dependency_both_forms() {
        let labels = vec!["depends-on/7".to_string(), "depends-on-9".to_string()];
        let mut deps = parse_label_dependencies(&labels);
        deps.sort();
        assert_eq!(deps, vec![7, 9]);
    }

    #[test]
    fn topological_order_respects_linear_chain() {
        let issues = vec![node(1, vec![]), node(2, vec![1]), node(3, vec![2])];
        let order = topological_order(&issues).unwrap();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn topological_order_breaks_ties_ascending() {
        let issues = vec![node(5, vec![]), node(2, vec![]), node(8, vec![])];
        let order = topological_order(&issues).unwrap();
        assert_eq!(order, vec![2, 5, 8]);
    }

    #[test]
    fn topological_order_detects_cycle() {
        let issues = vec![node(1, vec![3]), node(2, vec![1]), node(3, vec![2])];
        let result = topological_order(&issues);
        assert!(matches!(result, Err(ResolveError::Cycle(_))));
    }

    #[test]
    fn external_dependency_outside_requested_set_is_ignored() {
        let issues = vec![node(1, vec![999])];
        let order = topological_order(&issues).unwrap();
        assert_eq!(order, vec![1]);
    }
}
