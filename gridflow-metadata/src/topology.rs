//! Topology view for placement and routing
//!
//! A read-only snapshot of storage elements, their protocols, and the
//! directed distance graph between them. The view is rebuilt from metadata
//! at the start of every evaluation pass; distances, quotas, and
//! availability change externally, so a view is never carried across
//! passes.
//!
//! Destination ordering is fully deterministic: ascending distance from the
//! nearest existing replica, ties broken by the distance edge's ranking
//! field, then by storage-element name.

use crate::models::{
    DistanceEdge, ElementProtocol, ProtocolDomain, ProtocolOperation, StorageElement,
};
use crate::postgres::{Database, Result};
use gridflow_core::Expression;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

/// A storage element as seen by the placement algorithm
#[derive(Debug, Clone)]
pub struct TopologyElement {
    pub id: Uuid,
    pub name: String,
    pub read_enabled: bool,
    pub write_enabled: bool,
    pub delete_enabled: bool,
    pub multihop_eligible: bool,
    pub blacklisted: bool,
    pub attributes: HashMap<String, String>,
    pub protocols: Vec<ElementProtocol>,
}

impl TopologyElement {
    /// Whether any protocol permits the operation in the given domain
    pub fn supports(&self, domain: ProtocolDomain, operation: ProtocolOperation) -> bool {
        self.protocols
            .iter()
            .any(|p| p.domain == domain && p.permits(operation))
    }

    /// Whether any protocol permits the operation in any domain
    pub fn supports_any(&self, operation: ProtocolOperation) -> bool {
        self.protocols.iter().any(|p| p.permits(operation))
    }

    fn usable_source(&self, domain: ProtocolDomain) -> bool {
        self.read_enabled
            && !self.blacklisted
            && (self.supports(domain, ProtocolOperation::Read)
                || self.supports(domain, ProtocolOperation::ThirdPartyCopy))
    }

    fn usable_target(&self, domain: ProtocolDomain) -> bool {
        self.write_enabled && !self.blacklisted && self.supports(domain, ProtocolOperation::Write)
    }
}

/// A directed edge weight in the distance graph
#[derive(Debug, Clone, Copy)]
pub struct Distance {
    pub cost: i64,
    pub ranking: i32,
}

/// Read-only topology snapshot for one evaluation pass
pub struct TopologyView {
    elements: HashMap<Uuid, TopologyElement>,
    edges: HashMap<(Uuid, Uuid), Distance>,
    /// Outgoing adjacency, neighbors sorted by element name
    adjacency: HashMap<Uuid, Vec<(Uuid, Distance)>>,
}

impl TopologyView {
    /// Build a fresh view from the metadata database
    pub async fn load(db: &Database) -> Result<Self> {
        let elements = db.list_storage_elements().await?;
        let protocols = db.list_element_protocols().await?;
        let distances = db.list_distances().await?;
        let view = Self::from_parts(elements, protocols, distances);
        debug!(
            elements = view.elements.len(),
            edges = view.edges.len(),
            "Topology view loaded"
        );
        Ok(view)
    }

    /// Build a view from already-fetched parts
    pub fn from_parts(
        elements: Vec<StorageElement>,
        protocols: Vec<ElementProtocol>,
        distances: Vec<DistanceEdge>,
    ) -> Self {
        let mut by_element: HashMap<Uuid, Vec<ElementProtocol>> = HashMap::new();
        for protocol in protocols {
            by_element.entry(protocol.element_id).or_default().push(protocol);
        }

        let elements: HashMap<Uuid, TopologyElement> = elements
            .into_iter()
            .map(|e| {
                let attributes = e.attribute_map();
                (
                    e.id,
                    TopologyElement {
                        id: e.id,
                        name: e.name,
                        read_enabled: e.read_enabled,
                        write_enabled: e.write_enabled,
                        delete_enabled: e.delete_enabled,
                        multihop_eligible: e.multihop_eligible,
                        blacklisted: e.blacklisted,
                        attributes,
                        protocols: by_element.remove(&e.id).unwrap_or_default(),
                    },
                )
            })
            .collect();

        let mut edges = HashMap::new();
        let mut adjacency: HashMap<Uuid, Vec<(Uuid, Distance)>> = HashMap::new();
        for edge in distances {
            let weight = Distance {
                cost: edge.distance,
                ranking: edge.ranking,
            };
            edges.insert((edge.src_id, edge.dst_id), weight);
            adjacency.entry(edge.src_id).or_default().push((edge.dst_id, weight));
        }
        for neighbors in adjacency.values_mut() {
            neighbors.sort_by(|a, b| {
                let name_a = elements.get(&a.0).map(|e| e.name.as_str()).unwrap_or("");
                let name_b = elements.get(&b.0).map(|e| e.name.as_str()).unwrap_or("");
                name_a.cmp(name_b)
            });
        }

        Self {
            elements,
            edges,
            adjacency,
        }
    }

    pub fn element(&self, id: Uuid) -> Option<&TopologyElement> {
        self.elements.get(&id)
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn distance(&self, src: Uuid, dst: Uuid) -> Option<Distance> {
        self.edges.get(&(src, dst)).copied()
    }

    /// Candidate destinations for one placement unit.
    ///
    /// Filters elements by the rule's selection expression, requires write
    /// availability and quota headroom for the unit's total volume, and
    /// excludes elements that already hold a copy. The result is ordered
    /// ascending by distance from the nearest existing replica, ties broken
    /// by ranking, then by element name.
    pub fn candidate_destinations(
        &self,
        expression: &Expression,
        existing: &HashSet<Uuid>,
        required_bytes: i64,
        quota: &HashMap<Uuid, i64>,
    ) -> Vec<&TopologyElement> {
        let mut candidates: Vec<&TopologyElement> = self
            .elements
            .values()
            .filter(|e| {
                !e.blacklisted
                    && e.write_enabled
                    && e.supports_any(ProtocolOperation::Write)
                    && !existing.contains(&e.id)
                    && expression.matches(&e.attributes)
                    && quota.get(&e.id).copied().unwrap_or(0) >= required_bytes
            })
            .collect();

        candidates.sort_by(|a, b| {
            let key_a = self.proximity_key(existing, a.id);
            let key_b = self.proximity_key(existing, b.id);
            key_a.cmp(&key_b).then_with(|| a.name.cmp(&b.name))
        });

        candidates
    }

    /// Distance from the nearest existing replica to a candidate, as a
    /// sortable (cost, ranking) key; candidates with no inbound edge from
    /// any existing replica sort last.
    fn proximity_key(&self, existing: &HashSet<Uuid>, candidate: Uuid) -> (i64, i32) {
        existing
            .iter()
            .filter_map(|src| self.edges.get(&(*src, candidate)))
            .map(|d| (d.cost, d.ranking))
            .min()
            .unwrap_or((i64::MAX, i32::MAX))
    }

    /// Minimum-total-distance path from source to destination.
    ///
    /// Prefers the direct edge when it is protocol-compatible in the
    /// required domain; otherwise searches paths through multihop-eligible
    /// elements. Ties are broken by fewest hops, then by the
    /// lexicographically smallest path of element names. Returns the full
    /// path including both endpoints, or `None` if no route exists.
    pub fn route(
        &self,
        source: Uuid,
        destination: Uuid,
        domain: ProtocolDomain,
    ) -> Option<Vec<Uuid>> {
        if source == destination {
            return None;
        }
        let src = self.elements.get(&source)?;
        let dst = self.elements.get(&destination)?;
        if !src.usable_source(domain) || !dst.usable_target(domain) {
            return None;
        }

        if self.edges.contains_key(&(source, destination)) {
            return Some(vec![source, destination]);
        }

        // Dijkstra over (cost, hops, name-path); the full tie-break lives in
        // the heap ordering, so the first pop of the destination is the
        // unique minimal path.
        let mut heap: BinaryHeap<Reverse<(i64, usize, Vec<String>, Vec<Uuid>)>> = BinaryHeap::new();
        let mut settled: HashSet<Uuid> = HashSet::new();

        heap.push(Reverse((0, 0, vec![src.name.clone()], vec![source])));

        while let Some(Reverse((cost, hops, names, path))) = heap.pop() {
            let current = *path.last().expect("path never empty");
            if current == destination {
                return Some(path);
            }
            if !settled.insert(current) {
                continue;
            }

            let Some(neighbors) = self.adjacency.get(&current) else {
                continue;
            };
            for (next, weight) in neighbors {
                if settled.contains(next) || path.contains(next) {
                    continue;
                }
                let Some(element) = self.elements.get(next) else {
                    continue;
                };
                if *next == destination {
                    if !element.usable_target(domain) {
                        continue;
                    }
                } else {
                    // Intermediate hops must relay: receive, then re-serve
                    if !element.multihop_eligible
                        || !element.usable_target(domain)
                        || !element.usable_source(domain)
                    {
                        continue;
                    }
                }

                let mut next_names = names.clone();
                next_names.push(element.name.clone());
                let mut next_path = path.clone();
                next_path.push(*next);
                heap.push(Reverse((cost + weight.cost, hops + 1, next_names, next_path)));
            }
        }

        None
    }
}
