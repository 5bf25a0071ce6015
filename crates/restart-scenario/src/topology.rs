//! Peer wiring for the supported cluster shapes.

use std::collections::BTreeSet;

use crate::config::TopologyShape;

/// Undirected peer links for `n` nodes, each edge as `(low, high)`.
pub fn edges(shape: TopologyShape, n: usize) -> Vec<(usize, usize)> {
    if n < 2 {
        return Vec::new();
    }
    let mut edges = BTreeSet::new();
    let mut link = |a: usize, b: usize| {
        if a != b {
            edges.insert((a.min(b), a.max(b)));
        }
    };

    match shape {
        TopologyShape::Mesh => {
            for a in 0..n {
                for b in (a + 1)..n {
                    link(a, b);
                }
            }
        }
        TopologyShape::Ring => {
            for a in 0..n {
                link(a, (a + 1) % n);
            }
        }
        TopologyShape::Star => {
            for b in 1..n {
                link(0, b);
            }
        }
        TopologyShape::Line => {
            for a in 0..n - 1 {
                link(a, a + 1);
            }
        }
        TopologyShape::Bridge => {
            // Two fully meshed halves; the last node of the first half is the
            // only link into the second half.
            let split = n.div_ceil(2);
            for a in 0..split {
                for b in (a + 1)..split {
                    link(a, b);
                }
            }
            for a in split..n {
                for b in (a + 1)..n {
                    link(a, b);
                }
            }
            if split < n {
                link(split - 1, split);
            }
        }
    }

    edges.into_iter().collect()
}

/// Per-node peer lists derived from [`edges`].
pub fn peers(shape: TopologyShape, n: usize) -> Vec<Vec<usize>> {
    let mut peers = vec![Vec::new(); n];
    for (a, b) in edges(shape, n) {
        peers[a].push(b);
        peers[b].push(a);
    }
    for list in &mut peers {
        list.sort_unstable();
    }
    peers
}

/// Whether every node can reach every other node over the peer graph.
pub fn is_connected(shape: TopologyShape, n: usize) -> bool {
    if n < 2 {
        return true;
    }
    let peers = peers(shape, n);
    let mut seen = vec![false; n];
    let mut stack = vec![0usize];
    seen[0] = true;
    while let Some(node) = stack.pop() {
        for &next in &peers[node] {
            if !seen[next] {
                seen[next] = true;
                stack.push(next);
            }
        }
    }
    seen.into_iter().all(|s| s)
}
