//! Rule evaluator
//!
//! The algorithmic core: given one rule, the flattened file closure of its
//! data identifier, the current replica inventory, and a fresh topology
//! view, compute the minimal set of missing (file, destination) placements
//! and a transfer route for each.
//!
//! All placement decisions for a rule are computed before any request is
//! emitted. The evaluator itself performs no I/O; the scheduler loop feeds
//! it plain data and hands its decisions to the request emitter.

use gridflow_core::{DataIdentifier, Expression};
use gridflow_metadata::{ProtocolDomain, Replica, ReplicaState, Rule, RuleGrouping, TopologyView};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

/// One file in the closure of a rule's data identifier
#[derive(Debug, Clone)]
pub struct FileSpec {
    pub scope: String,
    pub name: String,
    pub bytes: i64,
    /// Parent dataset, when the file was reached through one
    pub dataset: Option<DataIdentifier>,
}

impl FileSpec {
    fn key(&self) -> (String, String) {
        (self.scope.clone(), self.name.clone())
    }
}

/// A single planned transfer hop: move one file onto one element
#[derive(Debug, Clone)]
pub struct HopPlacement {
    pub scope: String,
    pub name: String,
    pub bytes: i64,
    /// Ordered source candidates for this hop
    pub sources: Vec<Uuid>,
    /// Hop target element
    pub dest: Uuid,
    /// Full resolved path, endpoints included (context for the transfer
    /// subsystem; length > 2 means multihop)
    pub route: Vec<Uuid>,
}

/// A grouping unit that could not move forward this pass
#[derive(Debug, Clone)]
pub struct BlockedUnit {
    pub unit: String,
    pub reason: String,
}

/// Outcome of evaluating one rule against current inventory
#[derive(Debug, Default)]
pub struct RuleEvaluation {
    pub placements: Vec<HopPlacement>,
    pub blocked: Vec<BlockedUnit>,
    /// True when every unit already has the target number of AVAILABLE
    /// copies; the rule can move to OK.
    pub satisfied: bool,
}

impl RuleEvaluation {
    /// Whether this pass found anything to do or anything in flight
    pub fn made_progress(&self) -> bool {
        !self.placements.is_empty()
    }
}

/// Rule evaluator
pub struct RuleEvaluator {
    /// Cap on the ordered source-candidate list per request
    pub max_sources: usize,
}

struct Unit<'a> {
    label: String,
    files: Vec<&'a FileSpec>,
}

impl RuleEvaluator {
    pub fn new(max_sources: usize) -> Self {
        Self { max_sources }
    }

    /// Evaluate one rule. `pending` holds (destination, scope, name)
    /// triples already requested for this rule; `quota` holds remaining
    /// per-element headroom for the rule's account and is drawn down as
    /// placements are planned.
    pub fn evaluate(
        &self,
        rule: &Rule,
        files: &[FileSpec],
        replicas: &[Replica],
        pending: &HashSet<(Uuid, String, String)>,
        quota: &mut HashMap<Uuid, i64>,
        topology: &TopologyView,
    ) -> RuleEvaluation {
        let rule_label = format!("{}:{}", rule.scope, rule.name);
        let mut evaluation = RuleEvaluation::default();

        let expression = match Expression::parse(&rule.rse_expression) {
            Ok(expression) => expression,
            Err(e) => {
                evaluation.blocked.push(BlockedUnit {
                    unit: rule_label,
                    reason: format!(
                        "invalid selection expression '{}': {}",
                        rule.rse_expression, e
                    ),
                });
                return evaluation;
            }
        };

        // Replica index per file; only live states count as copies.
        let mut by_file: HashMap<(String, String), Vec<&Replica>> = HashMap::new();
        for replica in replicas {
            by_file
                .entry((replica.scope.clone(), replica.name.clone()))
                .or_default()
                .push(replica);
        }

        let units = group_units(rule, files);
        let copies = rule.copies.max(0) as usize;
        let mut satisfied_units = 0usize;
        // (destination, scope, name) planned during this evaluation; routes
        // of different destinations may share an intermediate hop.
        let mut planned: HashSet<(Uuid, String, String)> = HashSet::new();

        for unit in &units {
            let held = holding_elements(&unit.files, &by_file);
            let full = fully_available_elements(&unit.files, &by_file);

            if full.len() >= copies {
                satisfied_units += 1;
                continue;
            }

            let total_bytes: i64 = unit.files.iter().map(|f| f.bytes).sum();
            let needed = copies.saturating_sub(held.len());

            // Destination set: elements already holding part of the unit
            // (gap fill) plus newly chosen candidates.
            let mut targets: Vec<Uuid> = {
                let mut held_sorted: Vec<Uuid> = held.iter().copied().collect();
                held_sorted.sort_by_key(|id| {
                    topology
                        .element(*id)
                        .map(|e| e.name.clone())
                        .unwrap_or_default()
                });
                held_sorted
            };

            if needed > 0 {
                let candidates =
                    topology.candidate_destinations(&expression, &held, total_bytes, quota);
                if candidates.is_empty() {
                    evaluation.blocked.push(BlockedUnit {
                        unit: unit.label.clone(),
                        reason: format!(
                            "no storage element matches '{}' with write access and {} bytes of quota headroom",
                            rule.rse_expression, total_bytes
                        ),
                    });
                    if held.is_empty() {
                        continue;
                    }
                } else {
                    targets.extend(candidates.iter().take(needed).map(|e| e.id));
                }
            }

            let mut unit_blocked: Option<String> = None;

            for dest in targets {
                for file in &unit.files {
                    if has_live_replica(&by_file, file, dest) {
                        continue;
                    }
                    let key = (dest, file.scope.clone(), file.name.clone());
                    if pending.contains(&key) || planned.contains(&key) {
                        continue;
                    }

                    match self.plan_transfer(
                        file, dest, &by_file, topology, quota, pending, &mut planned,
                    ) {
                        Some(hops) => evaluation.placements.extend(hops),
                        None => {
                            let dest_name = topology
                                .element(dest)
                                .map(|e| e.name.clone())
                                .unwrap_or_else(|| dest.to_string());
                            unit_blocked = Some(format!(
                                "no source replica of {}:{} with a usable route to {}",
                                file.scope, file.name, dest_name
                            ));
                        }
                    }
                }
            }

            if let Some(reason) = unit_blocked {
                evaluation.blocked.push(BlockedUnit {
                    unit: unit.label.clone(),
                    reason,
                });
            }
        }

        // An empty closure has nothing to place and counts as satisfied.
        evaluation.satisfied = satisfied_units == units.len();

        debug!(
            rule_id = %rule.id,
            placements = evaluation.placements.len(),
            blocked = evaluation.blocked.len(),
            satisfied = evaluation.satisfied,
            "Rule evaluated"
        );

        evaluation
    }

    /// Resolve source and route for one (file, destination) need and expand
    /// the route into per-hop placements. Returns `None` when no source
    /// replica has a usable route.
    #[allow(clippy::too_many_arguments)]
    fn plan_transfer(
        &self,
        file: &FileSpec,
        dest: Uuid,
        by_file: &HashMap<(String, String), Vec<&Replica>>,
        topology: &TopologyView,
        quota: &mut HashMap<Uuid, i64>,
        pending: &HashSet<(Uuid, String, String)>,
        planned: &mut HashSet<(Uuid, String, String)>,
    ) -> Option<Vec<HopPlacement>> {
        // Source = existing AVAILABLE replica with the lowest route cost to
        // the destination; ties broken by element name.
        let mut routed: Vec<(i64, String, Uuid, Vec<Uuid>)> = Vec::new();
        for replica in by_file.get(&file.key()).into_iter().flatten() {
            if replica.state != ReplicaState::Available {
                continue;
            }
            let domain = transfer_domain(topology, replica.element_id, dest);
            let Some(path) = topology.route(replica.element_id, dest, domain) else {
                continue;
            };
            let cost = path_cost(topology, &path);
            let name = topology
                .element(replica.element_id)
                .map(|e| e.name.clone())
                .unwrap_or_default();
            routed.push((cost, name, replica.element_id, path));
        }
        routed.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        let (_, _, _, path) = routed.first()?.clone();
        let source_candidates: Vec<Uuid> = routed
            .iter()
            .map(|(_, _, id, _)| *id)
            .take(self.max_sources)
            .collect();

        let mut hops = Vec::new();
        for k in 1..path.len() {
            let hop_dest = path[k];
            if has_live_replica(by_file, file, hop_dest) {
                continue;
            }
            let key = (hop_dest, file.scope.clone(), file.name.clone());
            if pending.contains(&key) || planned.contains(&key) {
                continue;
            }

            let sources = if k == 1 {
                source_candidates.clone()
            } else {
                vec![path[k - 1]]
            };

            planned.insert(key);
            let headroom = quota.entry(hop_dest).or_insert(0);
            *headroom = headroom.saturating_sub(file.bytes);

            hops.push(HopPlacement {
                scope: file.scope.clone(),
                name: file.name.clone(),
                bytes: file.bytes,
                sources,
                dest: hop_dest,
                route: path.clone(),
            });
        }

        Some(hops)
    }
}

/// Pick the transfer domain for a hop: LAN when both endpoints declare the
/// same `site` attribute, WAN otherwise.
fn transfer_domain(topology: &TopologyView, src: Uuid, dst: Uuid) -> ProtocolDomain {
    let src_site = topology.element(src).and_then(|e| e.attributes.get("site"));
    let dst_site = topology.element(dst).and_then(|e| e.attributes.get("site"));
    match (src_site, dst_site) {
        (Some(a), Some(b)) if a == b => ProtocolDomain::Lan,
        _ => ProtocolDomain::Wan,
    }
}

fn path_cost(topology: &TopologyView, path: &[Uuid]) -> i64 {
    path.windows(2)
        .filter_map(|w| topology.distance(w[0], w[1]))
        .map(|d| d.cost)
        .sum()
}

/// Elements holding a live (AVAILABLE or COPYING) replica of the file
fn has_live_replica(
    by_file: &HashMap<(String, String), Vec<&Replica>>,
    file: &FileSpec,
    element: Uuid,
) -> bool {
    by_file
        .get(&file.key())
        .map(|replicas| {
            replicas.iter().any(|r| {
                r.element_id == element
                    && matches!(r.state, ReplicaState::Available | ReplicaState::Copying)
            })
        })
        .unwrap_or(false)
}

/// Distinct elements already holding a copy of any unit file
fn holding_elements(
    files: &[&FileSpec],
    by_file: &HashMap<(String, String), Vec<&Replica>>,
) -> HashSet<Uuid> {
    let mut held = HashSet::new();
    for file in files {
        for replica in by_file.get(&file.key()).into_iter().flatten() {
            if matches!(
                replica.state,
                ReplicaState::Available | ReplicaState::Copying
            ) {
                held.insert(replica.element_id);
            }
        }
    }
    held
}

/// Elements where every unit file is AVAILABLE
fn fully_available_elements(
    files: &[&FileSpec],
    by_file: &HashMap<(String, String), Vec<&Replica>>,
) -> HashSet<Uuid> {
    let mut counts: HashMap<Uuid, usize> = HashMap::new();
    for file in files {
        for replica in by_file.get(&file.key()).into_iter().flatten() {
            if replica.state == ReplicaState::Available {
                *counts.entry(replica.element_id).or_default() += 1;
            }
        }
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count == files.len())
        .map(|(id, _)| id)
        .collect()
}

/// Split the closure into grouping units, deterministically ordered
fn group_units<'a>(rule: &Rule, files: &'a [FileSpec]) -> Vec<Unit<'a>> {
    let mut units: BTreeMap<String, Vec<&'a FileSpec>> = BTreeMap::new();

    match rule.grouping {
        RuleGrouping::All => {
            if !files.is_empty() {
                units.insert(format!("{}:{}", rule.scope, rule.name), files.iter().collect());
            }
        }
        RuleGrouping::Dataset => {
            for file in files {
                let label = match &file.dataset {
                    Some(dataset) => dataset.to_string(),
                    None => format!("{}:{}", file.scope, file.name),
                };
                units.entry(label).or_default().push(file);
            }
        }
        RuleGrouping::None => {
            for file in files {
                units
                    .entry(format!("{}:{}", file.scope, file.name))
                    .or_default()
                    .push(file);
            }
        }
    }

    units
        .into_iter()
        .map(|(label, mut unit_files)| {
            unit_files.sort_by(|a, b| a.key().cmp(&b.key()));
            Unit {
                label,
                files: unit_files,
            }
        })
        .collect()
}
