//! Join graph over registered entities.
//!
//! One node per entity, one edge per declared join. Path finding treats the
//! graph as undirected; each step remembers whether it follows the declared
//! direction so fan-out can be detected.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::{EdgeIndex, NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use tracing::warn;

use super::error::DisconnectedGraphError;
use super::registry::{JoinDecl, SchemaRegistry};

/// One join in a resolved tree: `to` is joined onto the already-joined `from`.
#[derive(Debug, Clone)]
pub struct JoinStep {
    pub from: String,
    pub to: String,
    pub join: JoinDecl,
    /// Traversal follows the declared direction (declaring side -> target).
    pub forward: bool,
    /// Traversal multiplies rows of the already-joined side.
    pub fan_out: bool,
}

/// Spanning tree rooted at the entity supplying the most measures.
#[derive(Debug, Clone, Default)]
pub struct JoinTree {
    pub root: String,
    pub steps: Vec<JoinStep>,
}

impl JoinTree {
    /// Root first, then every joined entity in step order.
    pub fn entities(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.root.as_str()).chain(self.steps.iter().map(|s| s.to.as_str()))
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.entities().any(|e| e == entity)
    }

    pub fn has_fan_out(&self) -> bool {
        self.steps.iter().any(|s| s.fan_out)
    }
}

/// Undirected join graph, built once per registry.
#[derive(Debug, Clone)]
pub struct JoinGraph {
    graph: UnGraph<String, JoinDecl>,
    /// Index: entity name -> NodeIndex
    node_index: HashMap<String, NodeIndex>,
}

impl JoinGraph {
    pub fn build(registry: &SchemaRegistry) -> Self {
        let mut graph = UnGraph::new_undirected();
        let mut node_index = HashMap::new();

        // Insertion order is declaration order, so NodeIndex breaks root ties.
        for entity in registry.entities() {
            let idx = graph.add_node(entity.name.clone());
            node_index.insert(entity.name.clone(), idx);
        }
        for join in registry.joins() {
            if let (Some(&a), Some(&b)) = (node_index.get(&join.source), node_index.get(&join.target)) {
                graph.add_edge(a, b, join.clone());
            }
        }

        Self { graph, node_index }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Build the join tree covering `required`.
    ///
    /// `measure_counts` maps entity name to the number of requested measures it
    /// owns; the entity with the highest count becomes the root.
    pub fn resolve(
        &self,
        required: &[String],
        measure_counts: &HashMap<String, usize>,
    ) -> Result<JoinTree, DisconnectedGraphError> {
        let Some(root) = self.choose_root(required, measure_counts) else {
            return Ok(JoinTree::default());
        };
        let root_name = self.graph[root].clone();

        let (order, parent) = self.bfs(root);

        // Union of BFS paths from the root to every required entity.
        let mut needed: HashSet<NodeIndex> = HashSet::from([root]);
        for name in required {
            let disconnected = || DisconnectedGraphError {
                root: root_name.clone(),
                entity: name.clone(),
            };
            let mut current = *self.node_index.get(name).ok_or_else(disconnected)?;
            if current != root && !parent.contains_key(&current) {
                return Err(disconnected());
            }
            while let Some(&(prev, _)) = parent.get(&current) {
                if !needed.insert(current) {
                    break;
                }
                current = prev;
            }
        }

        let mut steps = Vec::new();
        for node in order {
            if node == root || !needed.contains(&node) {
                continue;
            }
            let Some(&(prev, edge)) = parent.get(&node) else {
                continue;
            };
            let join = self.graph[edge].clone();
            let from = self.graph[prev].clone();
            let to = self.graph[node].clone();
            let forward = join.source == from && join.target == to;
            let fan_out = join.relationship.fans_out(forward);
            if fan_out {
                warn!(
                    from = %from,
                    to = %to,
                    relationship = ?join.relationship,
                    "join.fan_out"
                );
            }
            steps.push(JoinStep {
                from,
                to,
                join,
                forward,
                fan_out,
            });
        }

        Ok(JoinTree {
            root: root_name,
            steps,
        })
    }

    fn choose_root(
        &self,
        required: &[String],
        measure_counts: &HashMap<String, usize>,
    ) -> Option<NodeIndex> {
        required
            .iter()
            .filter_map(|name| self.node_index.get(name).copied())
            .map(|idx| {
                let count = measure_counts.get(&self.graph[idx]).copied().unwrap_or(0);
                (idx, count)
            })
            // Highest count wins; on ties the earlier declaration (lower index).
            .max_by(|(a_idx, a_count), (b_idx, b_count)| {
                a_count.cmp(b_count).then_with(|| b_idx.cmp(a_idx))
            })
            .map(|(idx, _)| idx)
    }

    /// Breadth-first discovery order and parent links, visiting incident
    /// edges in declaration order.
    #[allow(clippy::type_complexity)]
    fn bfs(&self, root: NodeIndex) -> (Vec<NodeIndex>, HashMap<NodeIndex, (NodeIndex, EdgeIndex)>) {
        let mut queue = VecDeque::new();
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        let mut parent: HashMap<NodeIndex, (NodeIndex, EdgeIndex)> = HashMap::new();

        queue.push_back(root);
        visited.insert(root);

        while let Some(current) = queue.pop_front() {
            order.push(current);

            let mut edges: Vec<_> = self.graph.edges(current).collect();
            edges.sort_by_key(|e| e.weight().declaration_index);

            for edge in edges {
                let Some((a, b)) = self.graph.edge_endpoints(edge.id()) else {
                    continue;
                };
                let neighbor = if a == current { b } else { a };
                if visited.insert(neighbor) {
                    parent.insert(neighbor, (current, edge.id()));
                    queue.push_back(neighbor);
                }
            }
        }

        (order, parent)
    }
}
