//! Platform-aware node resolution.
//!
//! Given the bootstrapped nodes of a builder and the platforms a build
//! requests, pick the smallest set of nodes that covers the request. The
//! algorithm is greedy and stable rather than an optimal set cover: each
//! requested platform independently picks its best node, and the picks are
//! coalesced per node.

use crate::errors::Error;
use crate::platform::{Matcher, Platform};

/// A node as seen by the resolver: its name and the platforms it covers.
#[derive(Debug, Clone)]
pub struct ResolverNode {
    /// Node name, used for diagnostics only.
    pub name: String,
    /// Platforms the node declares.
    pub platforms: Vec<Platform>,
}

/// One resolved unit of work: a node index and the requested platforms it
/// was picked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Index into the input node list.
    pub index: usize,
    /// Name of the selected node.
    pub node: String,
    /// Requested platforms assigned to this node, in request order. Empty
    /// when the request itself was empty.
    pub platforms: Vec<Platform>,
}

/// The outcome of a resolution pass.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Selections ordered by ascending node index.
    pub selections: Vec<Selection>,
    /// False when at least one requested platform had no matching node and
    /// fell back to the first node.
    pub perfect: bool,
}

/// Resolve `requested` platforms onto `nodes`.
///
/// `additional` can report extra platforms a node covers beyond its
/// declaration, such as platforms discovered at bootstrap. An empty request
/// resolves to the first node with no platform constraint. A platform no
/// node covers resolves to the first node and marks the result imperfect.
/// A builder with no nodes cannot resolve anything and fails validation.
///
/// Tie-breaking: a node declaring the platform exactly beats one matching
/// through variant fallback, regardless of position; among equals the
/// earlier node wins.
pub fn resolve(
    nodes: &[ResolverNode],
    requested: &[Platform],
    matcher: Matcher,
    additional: Option<&dyn Fn(usize, &ResolverNode) -> Vec<Platform>>,
) -> Result<Resolution, Error> {
    if nodes.is_empty() {
        return Err(Error::invalid("builder has no nodes to resolve on"));
    }

    if requested.is_empty() {
        return Ok(Resolution {
            selections: vec![Selection {
                index: 0,
                node: nodes[0].name.clone(),
                platforms: Vec::new(),
            }],
            perfect: true,
        });
    }

    let covered: Vec<Vec<Platform>> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| {
            let mut all = n.platforms.clone();
            if let Some(extra) = additional {
                all.extend(extra(i, n));
            }
            all
        })
        .collect();

    let mut perfect = true;
    let mut picks: Vec<(usize, &Platform)> = Vec::with_capacity(requested.len());
    for want in requested {
        let mut exact: Option<usize> = None;
        let mut fuzzy: Option<usize> = None;
        for (i, platforms) in covered.iter().enumerate() {
            if exact.is_none() && platforms.iter().any(|have| matcher.exact(have, want)) {
                exact = Some(i);
            }
            if fuzzy.is_none() && platforms.iter().any(|have| matcher.matches(have, want)) {
                fuzzy = Some(i);
            }
            if exact.is_some() {
                break;
            }
        }
        let index = match exact.or(fuzzy) {
            Some(i) => i,
            None => {
                perfect = false;
                0
            }
        };
        picks.push((index, want));
    }

    let mut selections: Vec<Selection> = Vec::new();
    for (index, want) in picks {
        match selections.iter_mut().find(|s| s.index == index) {
            Some(existing) => existing.platforms.push(want.clone()),
            None => selections.push(Selection {
                index,
                node: nodes[index].name.clone(),
                platforms: vec![want.clone()],
            }),
        }
    }
    selections.sort_by_key(|s| s.index);

    Ok(Resolution {
        selections,
        perfect,
    })
}
