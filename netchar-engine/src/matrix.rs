//! Pairwise network characteristics between every two elements of a topology

use crate::topology::{ElementKind, NetChar, NetworkElement, Topology};
use std::collections::HashMap;
use std::sync::Arc;

/// A symmetric matrix of path characteristics, indexed by traversal order
///
/// The diagonal is unused and holds [`NetChar::UNBOUNDED`].
#[derive(Clone, Debug, Default)]
pub struct NetCharMatrix {
    names: Vec<Arc<str>>,
    index: HashMap<Arc<str>, usize>,
    cells: Vec<NetChar>,
}

impl NetCharMatrix {
    pub fn compute(topology: &Topology) -> Self {
        let elements = topology.elements();
        let n = elements.len();
        let mut matrix = NetCharMatrix {
            names: elements.iter().map(|e| e.name.clone()).collect(),
            index: elements
                .iter()
                .enumerate()
                .map(|(i, e)| (e.name.clone(), i))
                .collect(),
            cells: vec![NetChar::UNBOUNDED; n * n],
        };

        // Backbone: rows are filled in traversal order, so a parent's row is always complete by
        // the time one of its children needs it
        for i in 1..n {
            let src = &elements[i];
            for j in 0..i {
                let dst = &elements[j];
                let value = match Self::hop(src, dst) {
                    Hop::Direct(nc) => nc,
                    Hop::ViaParent(nc) => {
                        let parent = src.parent.as_deref().and_then(|p| matrix.index_of(p));
                        match parent {
                            Some(p) => nc.chain(matrix.get(p, j)),
                            None => {
                                tracing::warn!(element = %src.name, "element has no parent");
                                nc
                            }
                        }
                    }
                };
                matrix.set(i, j, value);
            }
        }

        // Node-local overhead of both endpoints
        let overhead: Vec<_> = elements.iter().map(NetworkElement::overhead).collect();
        for i in 1..n {
            for j in 0..i {
                let backbone = *matrix.get(i, j);
                let value = overhead[j].chain(&overhead[i].chain(&backbone));
                matrix.set(i, j, value);
            }
        }

        matrix
    }

    /// Picks the tier crossed between `src` and an element earlier in traversal order
    fn hop(src: &NetworkElement, dst: &NetworkElement) -> Hop {
        let same_domain = src.domain == dst.domain;
        let same_zone = same_domain && src.zone == dst.zone;

        match (src.kind, dst.kind) {
            (ElementKind::Dc, _) => Hop::Direct(src.inter_domain),
            (ElementKind::Edge, ElementKind::Edge) if same_zone => Hop::Direct(src.inter_edge),
            (ElementKind::Edge, ElementKind::Edge) if same_domain => Hop::Direct(src.inter_zone),
            (ElementKind::Edge, _) => Hop::Direct(src.inter_domain),
            (ElementKind::Fog, ElementKind::Fog) if same_zone => Hop::Direct(src.inter_fog),
            (ElementKind::Fog, ElementKind::Fog) => Hop::ViaParent(src.edge_fog),
            (ElementKind::Fog, _) if same_zone => Hop::Direct(src.edge_fog),
            (ElementKind::Fog, _) => Hop::ViaParent(src.edge_fog),
            (ElementKind::Ue, ElementKind::Fog) if same_zone => Hop::Direct(src.poa),
            (ElementKind::Ue, _) => Hop::ViaParent(src.poa),
        }
    }

    fn set(&mut self, i: usize, j: usize, value: NetChar) {
        let n = self.names.len();
        self.cells[i * n + j] = value;
        self.cells[j * n + i] = value;
    }

    pub fn size(&self) -> usize {
        self.names.len()
    }

    /// Element names, in matrix order
    pub fn names(&self) -> &[Arc<str>] {
        &self.names
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn get(&self, i: usize, j: usize) -> &NetChar {
        &self.cells[i * self.names.len() + j]
    }

    pub fn between(&self, a: &str, b: &str) -> Option<&NetChar> {
        Some(self.get(self.index_of(a)?, self.index_of(b)?))
    }

    pub fn is_symmetric(&self) -> bool {
        let n = self.size();
        (0..n).all(|i| (0..i).all(|j| self.get(i, j) == self.get(j, i)))
    }
}

enum Hop {
    Direct(NetChar),
    /// The tier up to the element's parent, followed by whatever lies beyond the parent
    ViaParent(NetChar),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::topology::test::scenario;

    #[test]
    fn edges_pick_inter_edge_or_inter_zone() {
        let scenario = scenario()
            .inter_edge_latency(5)
            .inter_edge_throughput(1000)
            .inter_zone_latency(15)
            .inter_zone_throughput(500)
            .zones(vec![
                (
                    "zoneX",
                    vec![("nlX", "a", "EDGE", "A"), ("nlX", "b", "EDGE", "B")],
                ),
                ("zoneY", vec![("nlY", "c", "EDGE", "C")]),
            ])
            .call();
        let topology = Topology::build(&scenario, None).unwrap();
        let matrix = NetCharMatrix::compute(&topology);

        let ab = matrix.between("A", "B").unwrap();
        assert_eq!(ab.latency, 5);
        assert_eq!(ab.throughput, 1_000_000_000);

        let ac = matrix.between("A", "C").unwrap();
        assert_eq!(ac.latency, 15);
        assert_eq!(ac.throughput, 500_000_000);

        assert!(matrix.is_symmetric());
    }

    #[test]
    fn children_build_on_their_parent_row() {
        let scenario = scenario()
            .edge_fog_latency(2)
            .inter_fog_latency(3)
            .inter_zone_latency(10)
            .inter_zone_throughput(500)
            .poa_latency(1)
            .poa_throughput(100)
            .zones(vec![
                (
                    "zone1",
                    vec![
                        ("z1-default", "edge1", "EDGE", "edge1-app"),
                        ("z1-poa1", "fog1", "FOG", "fog1-app"),
                        ("z1-poa1", "ue1", "UE", "ue1-app"),
                        ("z1-poa1", "ue2", "UE", "ue2-app"),
                    ],
                ),
                (
                    "zone2",
                    vec![
                        ("z2-default", "edge2", "EDGE", "edge2-app"),
                        ("z2-poa1", "fog2", "FOG", "fog2-app"),
                    ],
                ),
            ])
            .call();
        let topology = Topology::build(&scenario, None).unwrap();
        let matrix = NetCharMatrix::compute(&topology);
        assert!(matrix.is_symmetric());

        // Same zone: direct tiers
        assert_eq!(matrix.between("fog1-app", "edge1-app").unwrap().latency, 2);
        assert_eq!(matrix.between("ue1-app", "fog1-app").unwrap().latency, 1);

        // UE to UE goes up through the shared fog
        assert_eq!(matrix.between("ue1-app", "ue2-app").unwrap().latency, 2);

        // Fog to a remote edge: edge-fog, then the parent edge's inter-zone hop
        assert_eq!(matrix.between("fog1-app", "edge2-app").unwrap().latency, 2 + 10);

        // UE to a remote fog: poa, edge-fog, inter-zone, edge-fog
        let ue_fog2 = matrix.between("ue1-app", "fog2-app").unwrap();
        assert_eq!(ue_fog2.latency, 1 + 2 + 10 + 2);
        assert_eq!(ue_fog2.throughput, 100_000_000);
    }

    #[test]
    fn same_zone_neighbours_are_one_hop_away() {
        let scenario = scenario()
            .edge_fog_latency(2)
            .inter_fog_latency(3)
            .inter_edge_latency(4)
            .poa_latency(1)
            .zones(vec![(
                "zone1",
                vec![
                    ("z1-default", "edge1", "EDGE", "edge1-app"),
                    ("z1-default", "edge2", "EDGE", "edge2-app"),
                    ("z1-poa1", "fog1", "FOG", "fog1-app"),
                    ("z1-poa1", "ue1", "UE", "ue1-app"),
                    ("z1-poa2", "fog2", "FOG", "fog2-app"),
                ],
            )])
            .call();
        let topology = Topology::build(&scenario, None).unwrap();
        let matrix = NetCharMatrix::compute(&topology);

        // A fog reaches any edge of its zone over edge-fog, parent or not
        assert_eq!(matrix.between("fog1-app", "edge1-app").unwrap().latency, 2);
        assert_eq!(matrix.between("fog1-app", "edge2-app").unwrap().latency, 2);

        // A UE reaches any fog of its zone over its access link, without the inter-fog hop
        assert_eq!(matrix.between("ue1-app", "fog1-app").unwrap().latency, 1);
        assert_eq!(matrix.between("ue1-app", "fog2-app").unwrap().latency, 1);

        // Edges are still reached through the parent
        assert_eq!(matrix.between("ue1-app", "edge2-app").unwrap().latency, 1 + 2);
    }

    #[test]
    fn substitution_never_raises_throughput() {
        let scenario = scenario()
            .poa_throughput(20)
            .zones(vec![
                (
                    "zone1",
                    vec![
                        ("z1-default", "edge1", "EDGE", "edge1-app"),
                        ("z1-poa1", "ue1", "UE", "ue1-app"),
                    ],
                ),
                ("zone2", vec![("z2-default", "edge2", "EDGE", "edge2-app")]),
            ])
            .call();
        let topology = Topology::build(&scenario, None).unwrap();
        let matrix = NetCharMatrix::compute(&topology);

        let ue = topology.element("ue1-app").unwrap();
        let parent = matrix.index_of(ue.parent.as_deref().unwrap()).unwrap();
        let ue_index = matrix.index_of("ue1-app").unwrap();
        for j in 0..matrix.size() {
            if j == ue_index || j == parent {
                continue;
            }
            assert!(matrix.get(ue_index, j).throughput <= matrix.get(parent, j).throughput);
        }
    }

    #[test]
    fn packet_loss_accumulates_along_the_path() {
        let scenario = scenario()
            .poa_packet_loss(10.0)
            .zones(vec![(
                "zone1",
                vec![
                    ("z1-poa1", "ue1", "UE", "ue1-app"),
                    ("z1-poa2", "ue2", "UE", "ue2-app"),
                ],
            )])
            .call();
        let topology = Topology::build(&scenario, None).unwrap();
        let matrix = NetCharMatrix::compute(&topology);

        // Two 10% access links: 1 - 0.9 * 0.9 = 19%
        assert_eq!(matrix.between("ue1-app", "ue2-app").unwrap().packet_loss, 1900);
    }

    #[test]
    fn empty_topology_gives_empty_matrix() {
        let matrix = NetCharMatrix::compute(&Topology::default());
        assert_eq!(matrix.size(), 0);
        assert!(matrix.is_symmetric());
    }
}
