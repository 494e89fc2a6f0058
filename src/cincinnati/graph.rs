use super::{Update, Upgrades};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Update graph of a channel, or a union of channels
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<Node>,
    /// Upgrade edges as pairs of indices into `nodes`
    pub edges: Vec<(usize, usize)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub version: Version,
    pub payload: String,
}

impl From<&Node> for Update {
    fn from(node: &Node) -> Self {
        Update {
            version: node.version.clone(),
            image: node.payload.clone(),
        }
    }
}

impl Graph {
    fn index_of(&self, version: &Version) -> Option<usize> {
        self.nodes.iter().position(|node| &node.version == version)
    }

    /// Newest release in the graph
    pub fn latest(&self) -> Option<Update> {
        self.nodes
            .iter()
            .max_by(|a, b| a.version.cmp(&b.version))
            .map(Update::from)
    }

    /// Union of two graphs, nodes are identified by version
    pub fn union(mut self, other: Graph) -> Graph {
        let mut remap = Vec::with_capacity(other.nodes.len());
        for node in other.nodes {
            let index = match self.index_of(&node.version) {
                Some(index) => index,
                None => {
                    self.nodes.push(node);
                    self.nodes.len() - 1
                }
            };
            remap.push(index);
        }
        for (from, to) in other.edges {
            if let (Some(&from), Some(&to)) = (remap.get(from), remap.get(to)) {
                if !self.edges.contains(&(from, to)) {
                    self.edges.push((from, to));
                }
            }
        }
        self
    }

    /// Shortest upgrade walk by number of edges.
    ///
    /// Neighbours are visited in order of node index, so the walk is deterministic.
    pub fn upgrades(&self, start: &Version, target: &Version) -> Result<Upgrades, String> {
        let from = self
            .index_of(start)
            .ok_or_else(|| format!("version {} not found in graph", start))?;
        let to = self
            .index_of(target)
            .ok_or_else(|| format!("version {} not found in graph", target))?;
        let current = Update::from(&self.nodes[from]);
        let newest = Update::from(&self.nodes[to]);
        if from == to {
            return Ok(Upgrades {
                current,
                newest,
                updates: Vec::new(),
            });
        }

        let mut adjacency: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for &(a, b) in &self.edges {
            if a < self.nodes.len() && b < self.nodes.len() {
                adjacency.entry(a).or_default().push(b);
            }
        }
        for next in adjacency.values_mut() {
            next.sort_unstable();
            next.dedup();
        }

        let mut parent: Vec<Option<usize>> = vec![None; self.nodes.len()];
        let mut visited = vec![false; self.nodes.len()];
        let mut queue = VecDeque::from([from]);
        visited[from] = true;
        while let Some(node) = queue.pop_front() {
            if node == to {
                break;
            }
            for &next in adjacency.get(&node).into_iter().flatten() {
                if !visited[next] {
                    visited[next] = true;
                    parent[next] = Some(node);
                    queue.push_back(next);
                }
            }
        }
        if !visited[to] {
            return Err(format!("no upgrade path from {} to {}", start, target));
        }

        let mut updates = Vec::new();
        let mut node = parent[to];
        while let Some(index) = node {
            if index == from {
                break;
            }
            updates.push(Update::from(&self.nodes[index]));
            node = parent[index];
        }
        updates.reverse();
        Ok(Upgrades {
            current,
            newest,
            updates,
        })
    }
}
