// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of GridFlow.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! The utility's model of the physical grid: nodes joined by relay-guarded
//! edges, fault-accounting zones, and the connected-component groups that
//! each clear at a single rate.

use tracing::debug;

/// An infrastructure relay. `closed` mirrors the last state read from the
/// PLC; the tag's electrical sense is inverted (writing `true` opens the
/// relay) because the NC side of the SPDT is wired to it.
#[derive(Debug, Clone)]
pub struct Relay {
    pub tag: String,
    pub closed: bool,
}

impl Relay {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            closed: true,
        }
    }
}

/// A directed edge between two nodes, carrying the relays that must all be
/// closed for the edge to conduct, and optionally a current measurement tag.
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: usize,
    pub to: usize,
    pub current_tag: Option<String>,
    /// Indices into the grid's relay list.
    pub relays: Vec<usize>,
}

/// A bus in the grid. Customers and resources are attached by name as they
/// enroll.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub customers: Vec<String>,
    pub resources: Vec<String>,
    /// Importance values of attached customers, summed into the isolation
    /// priority.
    pub customer_priority: f64,
    pub isolated: bool,
    pub voltage_low: bool,
    /// Load current tags measured at this node.
    pub load_current_tags: Vec<String>,
    /// Bus voltage measurement tag, where the node has one.
    pub voltage_tag: Option<String>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            customers: Vec::new(),
            resources: Vec::new(),
            customer_priority: 0.0,
            isolated: false,
            voltage_low: false,
            load_current_tags: Vec::new(),
            voltage_tag: None,
        }
    }
}

/// A fixed set of nodes treated as one current-balance accounting surface.
#[derive(Debug, Clone)]
pub struct Zone {
    pub name: String,
    pub nodes: Vec<usize>,
}

/// A connected component of the grid under the current relay configuration.
/// Rebuilt from scratch on every topology refresh; no group survives one.
#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub nodes: Vec<usize>,
    pub customers: Vec<String>,
    pub resources: Vec<String>,
    pub rate: Option<f64>,
}

/// The complete static grid model plus the live relay states.
#[derive(Debug, Clone, Default)]
pub struct GridModel {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub relays: Vec<Relay>,
    pub zones: Vec<Zone>,
}

impl GridModel {
    pub fn add_node(&mut self, name: impl Into<String>) -> usize {
        self.nodes.push(Node::new(name));
        self.nodes.len() - 1
    }

    pub fn add_relay(&mut self, tag: impl Into<String>) -> usize {
        self.relays.push(Relay::new(tag));
        self.relays.len() - 1
    }

    pub fn add_edge(
        &mut self,
        from: usize,
        to: usize,
        current_tag: Option<&str>,
        relays: Vec<usize>,
    ) {
        self.edges.push(Edge {
            from,
            to,
            current_tag: current_tag.map(str::to_owned),
            relays,
        });
    }

    pub fn add_zone(&mut self, name: impl Into<String>, nodes: Vec<usize>) {
        self.zones.push(Zone {
            name: name.into(),
            nodes,
        });
    }

    pub fn node_by_path(&self, path: &str) -> Option<usize> {
        self.nodes.iter().position(|node| node.name == path)
    }

    /// Update a relay's last-read state. Returns false for unknown tags.
    pub fn set_relay(&mut self, tag: &str, closed: bool) -> bool {
        match self.relays.iter_mut().find(|relay| relay.tag == tag) {
            Some(relay) => {
                relay.closed = closed;
                true
            }
            None => false,
        }
    }

    pub fn relay_tags(&self) -> Vec<String> {
        self.relays.iter().map(|relay| relay.tag.clone()).collect()
    }

    /// An edge conducts iff every relay on it reports closed.
    pub fn edge_closed(&self, edge: &Edge) -> bool {
        edge.relays.iter().all(|&idx| self.relays[idx].closed)
    }

    /// Rebuild the symmetric connectivity matrix from relay states. The
    /// diagonal carries no meaning.
    pub fn conn_matrix(&self) -> Vec<Vec<u8>> {
        let n = self.nodes.len();
        let mut matrix = vec![vec![0u8; n]; n];
        for edge in &self.edges {
            let bit = u8::from(self.edge_closed(edge));
            matrix[edge.from][edge.to] = bit;
            matrix[edge.to][edge.from] = bit;
        }
        matrix
    }

    /// Decompose the grid into groups, one per connected component of the
    /// connectivity matrix.
    pub fn rebuild_groups(&self) -> Vec<Group> {
        let matrix = self.conn_matrix();
        let components = find_disjoint_subgraphs(&matrix);
        debug!("topology refresh found {} group(s)", components.len());

        components
            .into_iter()
            .enumerate()
            .map(|(idx, nodes)| {
                let mut customers = Vec::new();
                let mut resources = Vec::new();
                for &node in &nodes {
                    customers.extend(self.nodes[node].customers.iter().cloned());
                    resources.extend(self.nodes[node].resources.iter().cloned());
                }
                Group {
                    name: format!("group{}", idx + 1),
                    nodes,
                    customers,
                    resources,
                    rate: None,
                }
            })
            .collect()
    }

    /// Net unaccounted current through a zone's boundary: edge currents are
    /// signed into the zone, measured loads inside the zone are subtracted.
    /// A residual beyond the detection threshold indicates a ground fault.
    pub fn zone_imbalance(&self, zone: &Zone, read: impl Fn(&str) -> Option<f64>) -> f64 {
        let mut total = 0.0;
        for edge in &self.edges {
            let Some(tag) = &edge.current_tag else {
                continue;
            };
            let from_inside = zone.nodes.contains(&edge.from);
            let to_inside = zone.nodes.contains(&edge.to);
            if from_inside == to_inside {
                continue;
            }
            let current = read(tag).unwrap_or(0.0);
            total += if to_inside { current } else { -current };
        }
        for &node in &zone.nodes {
            for tag in &self.nodes[node].load_current_tags {
                total -= read(tag).unwrap_or(0.0);
            }
        }
        total
    }

    /// Relay writes that isolate a node: open every relay on its edges.
    /// The inverted tag sense means `true` opens.
    pub fn isolation_writes(&self, node: usize, open: bool) -> Vec<(String, bool)> {
        let mut writes = Vec::new();
        for edge in &self.edges {
            if edge.from != node && edge.to != node {
                continue;
            }
            for &relay in &edge.relays {
                writes.push((self.relays[relay].tag.clone(), open));
            }
        }
        writes
    }

    /// Zone nodes ordered lowest importance first, the order in which the
    /// fault handler sacrifices them.
    pub fn node_priority_list(&self, zone: &Zone) -> Vec<usize> {
        let mut ordered = zone.nodes.clone();
        ordered.sort_by(|&a, &b| {
            let value_a = self.nodes[a].customer_priority + self.nodes[a].resources.len() as f64;
            let value_b = self.nodes[b].customer_priority + self.nodes[b].resources.len() as f64;
            value_a.total_cmp(&value_b)
        });
        ordered
    }
}

/// Connected components of a symmetric adjacency matrix, as lists of node
/// indices.
pub fn find_disjoint_subgraphs(matrix: &[Vec<u8>]) -> Vec<Vec<usize>> {
    let n = matrix.len();
    let mut visited = vec![false; n];
    let mut components = Vec::new();

    for start in 0..n {
        if visited[start] {
            continue;
        }
        let mut component = Vec::new();
        let mut queue = vec![start];
        visited[start] = true;
        while let Some(node) = queue.pop() {
            component.push(node);
            for (neighbour, &bit) in matrix[node].iter().enumerate() {
                if bit == 1 && neighbour != node && !visited[neighbour] {
                    visited[neighbour] = true;
                    queue.push(neighbour);
                }
            }
        }
        component.sort_unstable();
        components.push(component);
    }
    components
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two branch buses joined through an interconnect relay.
    fn create_test_grid() -> GridModel {
        let mut grid = GridModel::default();
        let main = grid.add_node("DC.MAIN.MAIN");
        let bus1 = grid.add_node("DC.BRANCH1.BUS1");
        let bus2 = grid.add_node("DC.BRANCH2.BUS1");

        let r1 = grid.add_relay("BRANCH_1_BUS_1_PROXIMAL_User");
        let r2 = grid.add_relay("BRANCH_2_BUS_1_PROXIMAL_User");
        let int1 = grid.add_relay("INTERCONNECT_1_User");

        grid.add_edge(main, bus1, Some("BRANCH_1_BUS_1_Current"), vec![r1]);
        grid.add_edge(main, bus2, Some("BRANCH_2_BUS_1_Current"), vec![r2]);
        grid.add_edge(bus1, bus2, Some("INTERCONNECT_1_Current"), vec![int1]);
        grid
    }

    #[test]
    fn test_conn_matrix_is_symmetric() {
        let mut grid = create_test_grid();
        grid.set_relay("INTERCONNECT_1_User", false);
        let matrix = grid.conn_matrix();
        for i in 0..matrix.len() {
            for j in 0..matrix.len() {
                assert_eq!(matrix[i][j], matrix[j][i]);
            }
        }
    }

    #[test]
    fn test_single_component_when_all_closed() {
        let grid = create_test_grid();
        let groups = grid.rebuild_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].nodes.len(), 3);
    }

    #[test]
    fn test_open_relays_split_groups() {
        let mut grid = create_test_grid();
        grid.nodes[1].customers.push("HOME1".to_owned());
        grid.nodes[2].customers.push("HOME2".to_owned());

        // cut bus2 off entirely
        grid.set_relay("BRANCH_2_BUS_1_PROXIMAL_User", false);
        grid.set_relay("INTERCONNECT_1_User", false);

        let groups = grid.rebuild_groups();
        assert_eq!(groups.len(), 2);
        let with_home2 = groups.iter().find(|g| g.customers.contains(&"HOME2".to_owned()));
        assert_eq!(with_home2.unwrap().nodes, vec![2]);
    }

    #[test]
    fn test_zone_imbalance_sums_boundary_currents() {
        let mut grid = create_test_grid();
        grid.add_zone("DC.BRANCH1.ZONE1", vec![1]);
        grid.nodes[1]
            .load_current_tags
            .push("BRANCH_1_BUS_1_LOAD_1_Current".to_owned());

        let zone = grid.zones[0].clone();
        // 2 A flows in, the load only accounts for 1.5 A
        let imbalance = grid.zone_imbalance(&zone, |tag| match tag {
            "BRANCH_1_BUS_1_Current" => Some(2.0),
            "INTERCONNECT_1_Current" => Some(0.0),
            "BRANCH_1_BUS_1_LOAD_1_Current" => Some(1.5),
            _ => None,
        });
        assert!((imbalance - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_priority_orders_by_importance() {
        let mut grid = create_test_grid();
        grid.add_zone("zone", vec![0, 1, 2]);
        grid.nodes[0].customer_priority = 5.0;
        grid.nodes[1].customer_priority = 0.0;
        grid.nodes[2].customer_priority = 2.0;

        let zone = grid.zones[0].clone();
        assert_eq!(grid.node_priority_list(&zone), vec![1, 2, 0]);
    }
}
