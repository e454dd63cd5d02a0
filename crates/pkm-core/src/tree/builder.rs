//! Navigation tree construction
//!
//! Given the persisted members of one tree, rebuild the rooted structure
//! deterministically. Parent edges come from referrer matching; visits whose
//! referrer matches no member become extra roots and are attached under the
//! earliest root, which is the tree's head.

use chrono::{DateTime, Utc};

use crate::model::{PageAnalysis, Visit};

// ============================================================================
// TYPES
// ============================================================================

/// One node of a built tree.
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub visit: Visit,
    pub analysis: Option<PageAnalysis>,
    /// Index of this visit in the tree's load-time order; stable across
    /// rebuilds as long as membership is unchanged.
    pub order_index: usize,
    pub children: Vec<TreeNode>,
}

/// A fully built navigation tree.
#[derive(Debug, Clone)]
pub struct NavigationTree {
    pub id: String,
    pub head: TreeNode,
    /// Number of member visits.
    pub size: usize,
}

impl NavigationTree {
    pub fn head_url(&self) -> &str {
        &self.head.visit.url
    }

    pub fn head_loaded_at(&self) -> DateTime<Utc> {
        self.head.visit.page_loaded_at
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Build the tree for a member list. Returns `None` for an empty list.
///
/// Parent rule: a visit's parent is the member whose url equals the visit's
/// referrer with the greatest load time not after the visit's referrer
/// timestamp (falling back to the visit's own load time when the referrer
/// timestamp is unknown). Ties prefer the larger timestamp, then the larger
/// id. A parent must strictly precede its child in (load time, id) order,
/// which rules out cycles.
pub fn build_tree(
    tree_id: &str,
    members: Vec<(Visit, Option<PageAnalysis>)>,
) -> Option<NavigationTree> {
    if members.is_empty() {
        return None;
    }

    // Load-time order defines the member indices used everywhere else
    // (tree intentions, the sequence view shown to the LLM).
    let mut ordered: Vec<(Visit, Option<PageAnalysis>)> = members;
    ordered.sort_by(|a, b| {
        a.0.page_loaded_at
            .cmp(&b.0.page_loaded_at)
            .then_with(|| a.0.id.cmp(&b.0.id))
    });

    let size = ordered.len();
    let mut parents: Vec<Option<usize>> = vec![None; size];

    for (child_idx, (child, _)) in ordered.iter().enumerate() {
        let Some(referrer) = child.referrer.as_deref() else {
            continue;
        };
        if referrer.is_empty() || referrer == "about:blank" {
            continue;
        }
        let bound = child.referrer_timestamp.unwrap_or(child.page_loaded_at);

        let mut best: Option<usize> = None;
        for (candidate_idx, (candidate, _)) in ordered.iter().enumerate() {
            if candidate_idx == child_idx || candidate.url != referrer {
                continue;
            }
            if candidate.page_loaded_at > bound {
                continue;
            }
            // Acyclicity: the parent must strictly precede the child.
            let precedes = (candidate.page_loaded_at, candidate.id.as_str())
                < (child.page_loaded_at, child.id.as_str());
            if !precedes {
                continue;
            }
            best = match best {
                None => Some(candidate_idx),
                Some(current) => {
                    let cur = &ordered[current].0;
                    let better = (candidate.page_loaded_at, candidate.id.as_str())
                        > (cur.page_loaded_at, cur.id.as_str());
                    Some(if better { candidate_idx } else { current })
                }
            };
        }
        parents[child_idx] = best;
    }

    // Children lists, kept in load-time order by construction.
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); size];
    let mut roots: Vec<usize> = Vec::new();
    for (idx, parent) in parents.iter().enumerate() {
        match parent {
            Some(p) => children[*p].push(idx),
            None => roots.push(idx),
        }
    }

    // The earliest root is the head; any other root hangs off it so the
    // forest serialises as one container.
    let head_idx = *roots.first()?;
    for extra_root in roots.iter().skip(1) {
        children[head_idx].push(*extra_root);
    }
    children[head_idx].sort_unstable();

    let head = assemble(head_idx, &ordered, &children);
    Some(NavigationTree {
        id: tree_id.to_string(),
        head,
        size,
    })
}

fn assemble(
    idx: usize,
    ordered: &[(Visit, Option<PageAnalysis>)],
    children: &[Vec<usize>],
) -> TreeNode {
    let (visit, analysis) = ordered[idx].clone();
    TreeNode {
        visit,
        analysis,
        order_index: idx,
        children: children[idx]
            .iter()
            .map(|child| assemble(*child, ordered, children))
            .collect(),
    }
}

// ============================================================================
// TESTS
// ============================================================================
