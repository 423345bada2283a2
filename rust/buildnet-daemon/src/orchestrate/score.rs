//! Prepare and score phases
//!
//! Target-to-bundle derivation, dependency graph, critical path, and the
//! load-balanced worker assignment scoring.

use super::{BuildOptions, BuildScore, ChunkSpec, MicroBundle, PartAssignment};
use crate::registry::Resource;
use buildnet_config::BuildSection;
use std::collections::{BTreeMap, HashSet};

/// Priority lookup: shared > core > client > ui > api > frontend > others
pub fn target_priority(target: &str, config: &BuildSection) -> i32 {
    if let Some(priority) = config.target_priorities.get(target) {
        return *priority;
    }
    match target {
        "shared" => 100,
        "core" => 90,
        "client" => 80,
        "ui" => 70,
        "api" => 60,
        "frontend" => 50,
        _ => 10,
    }
}

/// Phase 1: one bundle per target, sorted by descending priority
pub fn prepare_bundles(targets: &[String], config: &BuildSection) -> Vec<MicroBundle> {
    let mut bundles: Vec<MicroBundle> = targets
        .iter()
        .map(|target| MicroBundle {
            id: format!("{}:main", target),
            package: target.clone(),
            entry: "src/index".to_string(),
            chunk: ChunkSpec {
                globs: vec![format!("packages/{}/**", target)],
                entry: true,
                critical_path: false,
            },
            dependencies: Vec::new(),
            estimated_size_kb: 256,
            estimated_time_ms: 1_000,
            priority: target_priority(target, config),
        })
        .collect();
    sort_by_priority(&mut bundles);
    bundles
}

/// Descending priority, ties by ascending bundle id
pub fn sort_by_priority(bundles: &mut [MicroBundle]) {
    bundles.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
}

/// Bundle id → required bundle ids
pub fn build_dependency_graph(bundles: &[MicroBundle]) -> BTreeMap<String, Vec<String>> {
    bundles
        .iter()
        .map(|b| (b.id.clone(), b.dependencies.clone()))
        .collect()
}

/// Longest chain under the DAG by cumulative estimated time
///
/// Ties break toward the lowest bundle id. Cycles contribute zero cost so
/// the walk terminates; the perform phase surfaces them as a deadlock.
pub fn critical_path(bundles: &[MicroBundle]) -> Vec<String> {
    let times: BTreeMap<&str, u64> = bundles
        .iter()
        .map(|b| (b.id.as_str(), b.estimated_time_ms))
        .collect();
    let graph: BTreeMap<&str, &[String]> = bundles
        .iter()
        .map(|b| (b.id.as_str(), b.dependencies.as_slice()))
        .collect();

    fn chain<'a>(
        id: &'a str,
        graph: &BTreeMap<&'a str, &'a [String]>,
        times: &BTreeMap<&'a str, u64>,
        memo: &mut BTreeMap<&'a str, (u64, Vec<String>)>,
        visiting: &mut HashSet<&'a str>,
    ) -> (u64, Vec<String>) {
        if let Some(found) = memo.get(id) {
            return found.clone();
        }
        if !visiting.insert(id) {
            return (0, Vec::new());
        }
        let mut best: (u64, Vec<String>) = (0, Vec::new());
        if let Some(deps) = graph.get(id) {
            // Dependency lists arrive in caller order; sort so the strict
            // comparison keeps the lowest id on equal-cost ties
            let mut deps: Vec<&String> = deps.iter().collect();
            deps.sort();
            for dep in deps {
                if !times.contains_key(dep.as_str()) {
                    continue;
                }
                let candidate = chain(dep.as_str(), graph, times, memo, visiting);
                if candidate.0 > best.0 {
                    best = candidate;
                }
            }
        }
        visiting.remove(id);
        let cost = best.0 + times.get(id).copied().unwrap_or(0);
        let mut path = best.1;
        path.push(id.to_string());
        memo.insert(id, (cost, path.clone()));
        (cost, path)
    }

    let mut memo = BTreeMap::new();
    let mut best: (u64, Vec<String>) = (0, Vec::new());
    let mut ids: Vec<&str> = bundles.iter().map(|b| b.id.as_str()).collect();
    ids.sort_unstable();
    for id in ids {
        let mut visiting = HashSet::new();
        let candidate = chain(id, &graph, &times, &mut memo, &mut visiting);
        if candidate.0 > best.0 {
            best = candidate;
        }
    }
    best.1
}

/// Phase 2 scoring: pick the best worker per bundle in priority order
///
/// Score = load headroom (×50) + bundler-capability bonus (+20)
/// + 5×cpu_cores + 2×memory_gb; ties break toward the lower worker id.
pub fn score_assignments(
    bundles: &[MicroBundle],
    workers: &[Resource],
    options: &BuildOptions,
    max_load_ms: u64,
) -> Vec<PartAssignment> {
    let max_load = max_load_ms.max(1) as f64;
    let mut load: BTreeMap<&str, u64> = workers.iter().map(|w| (w.id.as_str(), 0)).collect();
    let mut assignments = Vec::with_capacity(bundles.len());

    for bundle in bundles {
        let mut best: Option<(f64, &Resource)> = None;
        // Workers arrive sorted by id; strict comparison keeps the lowest on ties
        for worker in workers {
            let current = load.get(worker.id.as_str()).copied().unwrap_or(0) as f64;
            let mut score = (1.0 - (current / max_load).min(1.0)) * 50.0;
            if let Some(bundler) = &options.bundler {
                if worker.capabilities.get("bundler") == Some(bundler) {
                    score += 20.0;
                }
            }
            score += 5.0 * f64::from(worker.cpu_cores);
            score += 2.0 * f64::from(worker.memory_gb);
            if best.map_or(true, |(s, _)| score > s) {
                best = Some((score, worker));
            }
        }
        let Some((_, worker)) = best else { continue };
        let start = load.get(worker.id.as_str()).copied().unwrap_or(0);
        assignments.push(PartAssignment {
            bundle_id: bundle.id.clone(),
            worker_id: worker.id.clone(),
            estimated_start_ms: start,
            estimated_duration_ms: bundle.estimated_time_ms,
            dependencies: bundle.dependencies.clone(),
        });
        if let Some(slot) = load.get_mut(worker.id.as_str()) {
            *slot += bundle.estimated_time_ms;
        }
    }
    assignments
}

/// Assemble the full execution plan
pub fn plan(
    bundles: &[MicroBundle],
    workers: &[Resource],
    options: &BuildOptions,
    max_load_ms: u64,
) -> BuildScore {
    let assignments = score_assignments(bundles, workers, options, max_load_ms);
    let dependency_graph = build_dependency_graph(bundles);
    let critical = critical_path(bundles);
    let critical_cost: u64 = critical
        .iter()
        .filter_map(|id| bundles.iter().find(|b| &b.id == id))
        .map(|b| b.estimated_time_ms)
        .sum();
    let mut per_worker: BTreeMap<&str, u64> = BTreeMap::new();
    for assignment in &assignments {
        *per_worker.entry(assignment.worker_id.as_str()).or_insert(0) +=
            assignment.estimated_duration_ms;
    }
    let busiest = per_worker.values().copied().max().unwrap_or(0);
    BuildScore {
        bundles: bundles.to_vec(),
        assignments,
        dependency_graph,
        critical_path: critical,
        estimated_duration_ms: critical_cost.max(busiest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ResourceStatus, ResourceType};
    use std::collections::BTreeMap as Map;

    fn worker(id: &str, cpu: u32, mem: u32) -> Resource {
        Resource {
            id: id.to_string(),
            name: id.to_string(),
            resource_type: ResourceType::Worker,
            address: "10.0.0.1:9000".to_string(),
            cpu_cores: cpu,
            memory_gb: mem,
            capabilities: Map::new(),
            labels: Map::new(),
            status: ResourceStatus::Online,
            last_heartbeat: None,
            registered_at: chrono::Utc::now(),
        }
    }

    fn bundle(id: &str, deps: &[&str], time_ms: u64) -> MicroBundle {
        MicroBundle {
            id: id.to_string(),
            package: id.split(':').next().unwrap_or(id).to_string(),
            entry: "src/index".to_string(),
            chunk: ChunkSpec {
                globs: Vec::new(),
                entry: true,
                critical_path: false,
            },
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            estimated_size_kb: 128,
            estimated_time_ms: time_ms,
            priority: 10,
        }
    }

    #[test]
    fn targets_sort_by_priority_order() {
        let config = BuildSection::default();
        let targets = vec![
            "ui".to_string(),
            "core".to_string(),
            "docs".to_string(),
            "shared".to_string(),
        ];
        let bundles = prepare_bundles(&targets, &config);
        let ids: Vec<&str> = bundles.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["shared:main", "core:main", "ui:main", "docs:main"]);
    }

    #[test]
    fn critical_path_follows_longest_chain() {
        let bundles = vec![
            bundle("a", &[], 100),
            bundle("b", &["a"], 100),
            bundle("c", &["b"], 100),
            bundle("d", &[], 250),
        ];
        assert_eq!(critical_path(&bundles), vec!["a", "b", "c"]);
    }

    #[test]
    fn equal_cost_dependency_ties_pick_the_lowest_id() {
        // "c" lists its dependencies out of order; "a" and "b" tie on cost
        let bundles = vec![
            bundle("a", &[], 100),
            bundle("b", &[], 100),
            bundle("c", &["b", "a"], 100),
        ];
        assert_eq!(critical_path(&bundles), vec!["a", "c"]);
    }

    #[test]
    fn critical_path_survives_cycles() {
        let bundles = vec![bundle("a", &["b"], 100), bundle("b", &["a"], 100)];
        // Cycle contributes zero depth; the walk must terminate
        let path = critical_path(&bundles);
        assert!(!path.is_empty());
    }

    #[test]
    fn stronger_worker_wins_assignment() {
        let bundles = vec![bundle("core:main", &[], 1_000)];
        let workers = vec![worker("w1", 4, 8), worker("w2", 16, 32)];
        let assignments =
            score_assignments(&bundles, &workers, &BuildOptions::default(), 60_000);
        assert_eq!(assignments[0].worker_id, "w2");
    }

    #[test]
    fn equal_workers_tie_break_by_lower_id() {
        let bundles = vec![bundle("core:main", &[], 1_000)];
        let workers = vec![worker("w1", 8, 16), worker("w2", 8, 16)];
        let assignments =
            score_assignments(&bundles, &workers, &BuildOptions::default(), 60_000);
        assert_eq!(assignments[0].worker_id, "w1");
    }

    #[test]
    fn load_spreads_bundles_across_equal_workers() {
        let bundles = vec![
            bundle("a:main", &[], 10_000),
            bundle("b:main", &[], 10_000),
        ];
        let workers = vec![worker("w1", 8, 16), worker("w2", 8, 16)];
        let assignments =
            score_assignments(&bundles, &workers, &BuildOptions::default(), 60_000);
        assert_eq!(assignments[0].worker_id, "w1");
        assert_eq!(assignments[1].worker_id, "w2");
        assert_eq!(assignments[1].estimated_start_ms, 0);
    }

    #[test]
    fn bundler_capability_earns_bonus() {
        let bundles = vec![bundle("core:main", &[], 1_000)];
        let mut pinned = worker("w2", 8, 16);
        pinned
            .capabilities
            .insert("bundler".to_string(), "esbuild".to_string());
        let workers = vec![worker("w1", 8, 16), pinned];
        let options = BuildOptions {
            bundler: Some("esbuild".to_string()),
            ..Default::default()
        };
        let assignments = score_assignments(&bundles, &workers, &options, 60_000);
        assert_eq!(assignments[0].worker_id, "w2");
    }

    #[test]
    fn plan_estimates_duration_from_critical_path_and_load() {
        let bundles = vec![
            bundle("a", &[], 1_000),
            bundle("b", &["a"], 1_000),
        ];
        let workers = vec![worker("w1", 8, 16)];
        let score = plan(&bundles, &workers, &BuildOptions::default(), 60_000);
        assert_eq!(score.estimated_duration_ms, 2_000);
        assert_eq!(score.critical_path, vec!["a", "b"]);
        assert_eq!(score.assignments.len(), 2);
    }
}
