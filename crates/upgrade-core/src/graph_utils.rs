//! Feeder topology graph.
//!
//! Buses are nodes; enabled lines and transformers are edges weighted by
//! physical length in meters (transformers weigh nothing). A shortest-path
//! tree rooted at the source bus gives every bus a unique path toward the
//! substation, which is what regulator placement walks.

use crate::equipment::{bus_name, LineRecord, TransformerRecord};
use crate::error::{UpgradeError, UpgradeResult};
use crate::units::Meters;
use petgraph::algo::{connected_components, dijkstra};
use petgraph::graph::{EdgeIndex, NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Line,
    Transformer,
}

#[derive(Debug, Clone)]
pub struct FeederEdge {
    pub kind: EdgeKind,
    pub name: String,
    pub length: Meters,
}

/// Summary used in run logs.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyStats {
    pub bus_count: usize,
    pub branch_count: usize,
    pub connected_components: usize,
}

/// Min-heap entry for the shortest-path tree.
#[derive(Copy, Clone, PartialEq)]
struct Scored {
    cost: f64,
    node: NodeIndex,
}

impl Eq for Scored {}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .partial_cmp(&self.cost)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
pub struct FeederGraph {
    graph: UnGraph<String, FeederEdge>,
    index: HashMap<String, NodeIndex>,
    source: NodeIndex,
    distance: HashMap<NodeIndex, f64>,
    parent: HashMap<NodeIndex, (NodeIndex, EdgeIndex)>,
}

impl FeederGraph {
    /// Build the graph from a snapshot and root it at `source`.
    pub fn build(
        source: &str,
        lines: &[LineRecord],
        transformers: &[TransformerRecord],
    ) -> UpgradeResult<Self> {
        let mut graph = UnGraph::new_undirected();
        let mut index: HashMap<String, NodeIndex> = HashMap::new();

        let mut node_for = |graph: &mut UnGraph<String, FeederEdge>, name: String| {
            *index
                .entry(name.clone())
                .or_insert_with(|| graph.add_node(name))
        };

        for line in lines.iter().filter(|l| l.enabled) {
            let a = node_for(&mut graph, bus_name(&line.bus1));
            let b = node_for(&mut graph, bus_name(&line.bus2));
            graph.add_edge(
                a,
                b,
                FeederEdge {
                    kind: EdgeKind::Line,
                    name: line.name.clone(),
                    length: line.length_m(),
                },
            );
        }
        for xfmr in transformers.iter().filter(|t| t.enabled) {
            let buses = xfmr.bus_names();
            let Some(primary) = buses.first() else {
                continue;
            };
            let a = node_for(&mut graph, primary.clone());
            for secondary in buses.iter().skip(1) {
                if secondary == primary {
                    continue;
                }
                let b = node_for(&mut graph, secondary.clone());
                graph.add_edge(
                    a,
                    b,
                    FeederEdge {
                        kind: EdgeKind::Transformer,
                        name: xfmr.name.clone(),
                        length: Meters(0.0),
                    },
                );
            }
        }

        let source_name = bus_name(source);
        let source = *index.get(&source_name).ok_or_else(|| {
            UpgradeError::Network(format!("source bus '{}' is not connected", source_name))
        })?;

        let mut feeder = Self {
            graph,
            index,
            source,
            distance: HashMap::new(),
            parent: HashMap::new(),
        };
        feeder.shortest_path_tree();
        Ok(feeder)
    }

    fn shortest_path_tree(&mut self) {
        let mut heap = BinaryHeap::new();
        self.distance.insert(self.source, 0.0);
        heap.push(Scored {
            cost: 0.0,
            node: self.source,
        });
        let mut settled = HashSet::new();
        while let Some(Scored { cost, node }) = heap.pop() {
            if !settled.insert(node) {
                continue;
            }
            for edge in self.graph.edges(node) {
                let next = if edge.source() == node {
                    edge.target()
                } else {
                    edge.source()
                };
                if settled.contains(&next) {
                    continue;
                }
                let candidate = cost + edge.weight().length.value();
                let better = self
                    .distance
                    .get(&next)
                    .map_or(true, |&current| candidate < current);
                if better {
                    self.distance.insert(next, candidate);
                    self.parent.insert(next, (node, edge.id()));
                    heap.push(Scored {
                        cost: candidate,
                        node: next,
                    });
                }
            }
        }
    }

    fn node(&self, bus: &str) -> UpgradeResult<NodeIndex> {
        self.index
            .get(&bus_name(bus))
            .copied()
            .ok_or_else(|| UpgradeError::Network(format!("unknown bus '{}'", bus)))
    }

    pub fn source_bus(&self) -> &str {
        &self.graph[self.source]
    }

    /// Bus names in sorted order.
    pub fn buses(&self) -> Vec<String> {
        let mut names: Vec<String> = self.index.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, bus: &str) -> bool {
        self.index.contains_key(&bus_name(bus))
    }

    pub fn stats(&self) -> TopologyStats {
        TopologyStats {
            bus_count: self.graph.node_count(),
            branch_count: self.graph.edge_count(),
            connected_components: connected_components(&self.graph),
        }
    }

    /// Electrical distance from the source along the shortest-path tree.
    pub fn distance_to_source(&self, bus: &str) -> UpgradeResult<Meters> {
        let node = self.node(bus)?;
        self.distance
            .get(&node)
            .map(|&d| Meters(d))
            .ok_or_else(|| UpgradeError::Network(format!("bus '{}' is not fed from the source", bus)))
    }

    /// Buses from `bus` up to and including the source.
    pub fn path_to_source(&self, bus: &str) -> UpgradeResult<Vec<String>> {
        let mut node = self.node(bus)?;
        if node != self.source && !self.parent.contains_key(&node) {
            return Err(UpgradeError::Network(format!(
                "bus '{}' is not fed from the source",
                bus
            )));
        }
        let mut path = vec![self.graph[node].clone()];
        while let Some(&(up, _)) = self.parent.get(&node) {
            path.push(self.graph[up].clone());
            node = up;
        }
        Ok(path)
    }

    /// Branch feeding `bus` from the source side.
    pub fn upstream_edge(&self, bus: &str) -> Option<&FeederEdge> {
        let node = self.node(bus).ok()?;
        self.parent
            .get(&node)
            .map(|&(_, edge)| &self.graph[edge])
    }

    /// Bus on the source side of `bus`.
    pub fn parent_bus(&self, bus: &str) -> Option<&str> {
        let node = self.node(bus).ok()?;
        self.parent
            .get(&node)
            .map(|&(up, _)| self.graph[up].as_str())
    }

    /// Buses shared by every path from `buses` to the source, nearest the
    /// cluster first. The source itself is never included.
    pub fn common_ancestors(&self, buses: &[String]) -> UpgradeResult<Vec<String>> {
        let Some((first, rest)) = buses.split_first() else {
            return Ok(Vec::new());
        };
        let mut shared: Vec<String> = self.path_to_source(first)?;
        for bus in rest {
            let path: HashSet<String> = self.path_to_source(bus)?.into_iter().collect();
            shared.retain(|b| path.contains(b));
        }
        let source = self.source_bus();
        shared.retain(|b| b != source);
        Ok(shared)
    }

    /// Every bus whose path to the source passes through `bus`, itself included.
    pub fn downstream_of(&self, bus: &str) -> UpgradeResult<HashSet<String>> {
        let target = self.node(bus)?;
        let mut out = HashSet::new();
        for node in self.graph.node_indices() {
            let mut cursor = node;
            loop {
                if cursor == target {
                    out.insert(self.graph[node].clone());
                    break;
                }
                match self.parent.get(&cursor) {
                    Some(&(up, _)) => cursor = up,
                    None => break,
                }
            }
        }
        Ok(out)
    }

    /// Symmetric matrix of shortest-path lengths between `buses`.
    ///
    /// Unreachable pairs are reported as a network error.
    pub fn distance_matrix(&self, buses: &[String]) -> UpgradeResult<Vec<Vec<f64>>> {
        let nodes = buses
            .iter()
            .map(|b| self.node(b))
            .collect::<UpgradeResult<Vec<_>>>()?;
        let n = nodes.len();
        let mut matrix = vec![vec![0.0; n]; n];
        for i in 0..n {
            let lengths = dijkstra(&self.graph, nodes[i], None, |e| e.weight().length.value());
            for j in (i + 1)..n {
                let d = lengths.get(&nodes[j]).copied().ok_or_else(|| {
                    UpgradeError::Network(format!(
                        "no path between '{}' and '{}'",
                        buses[i], buses[j]
                    ))
                })?;
                matrix[i][j] = d;
                matrix[j][i] = d;
            }
        }
        Ok(matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::LengthUnit;

    fn line(name: &str, a: &str, b: &str, length: f64) -> LineRecord {
        LineRecord {
            name: name.into(),
            bus1: a.into(),
            bus2: b.into(),
            length,
            length_units: LengthUnit::M,
            ..LineRecord::default()
        }
    }

    /// src - a - b - c
    ///           \
    ///            d - e
    fn feeder() -> FeederGraph {
        let lines = vec![
            line("l1", "src", "a", 100.0),
            line("l2", "a", "b", 100.0),
            line("l3", "b", "c", 50.0),
            line("l4", "b", "d", 80.0),
            line("l5", "d", "e", 20.0),
        ];
        FeederGraph::build("src", &lines, &[]).unwrap()
    }

    #[test]
    fn test_path_to_source() {
        let g = feeder();
        assert_eq!(g.path_to_source("e").unwrap(), vec!["e", "d", "b", "a", "src"]);
        assert_eq!(g.path_to_source("src").unwrap(), vec!["src"]);
        assert!(g.path_to_source("zz").is_err());
    }

    #[test]
    fn test_common_ancestors_exclude_source() {
        let g = feeder();
        let shared = g
            .common_ancestors(&["c".to_string(), "e".to_string()])
            .unwrap();
        assert_eq!(shared, vec!["b", "a"]);
        let single = g.common_ancestors(&["a".to_string()]).unwrap();
        assert_eq!(single, vec!["a"]);
    }

    #[test]
    fn test_distance_matrix_symmetric() {
        let g = feeder();
        let buses = vec!["c".to_string(), "e".to_string(), "a".to_string()];
        let m = g.distance_matrix(&buses).unwrap();
        assert_eq!(m[0][1], 150.0);
        assert_eq!(m[1][0], 150.0);
        assert_eq!(m[0][2], 150.0);
        assert_eq!(m[1][2], 200.0);
        assert_eq!(m[2][2], 0.0);
    }

    #[test]
    fn test_upstream_edge_and_downstream() {
        let g = feeder();
        assert_eq!(g.upstream_edge("d").map(|e| e.name.as_str()), Some("l4"));
        assert_eq!(g.parent_bus("d"), Some("b"));
        assert!(g.upstream_edge("src").is_none());
        let down = g.downstream_of("d").unwrap();
        assert_eq!(down.len(), 2);
        assert!(down.contains("e"));
    }

    #[test]
    fn test_transformer_edges_have_zero_length() {
        let lines = vec![line("l1", "src", "a", 100.0)];
        let xfmr = TransformerRecord {
            name: "t1".into(),
            buses: vec!["a.1.2.3".into(), "lv".into()],
            ..TransformerRecord::default()
        };
        let g = FeederGraph::build("src", &lines, &[xfmr]).unwrap();
        assert_eq!(g.distance_to_source("lv").unwrap(), Meters(100.0));
        assert_eq!(g.upstream_edge("lv").map(|e| e.kind), Some(EdgeKind::Transformer));
        assert_eq!(g.stats().connected_components, 1);
    }

    #[test]
    fn test_disabled_lines_are_skipped() {
        let mut lines = vec![line("l1", "src", "a", 100.0), line("l2", "a", "b", 10.0)];
        lines[1].enabled = false;
        let g = FeederGraph::build("src", &lines, &[]).unwrap();
        assert!(!g.contains("b"));
        assert!(FeederGraph::build("nowhere", &lines, &[]).is_err());
    }
}
