//! Message-update scheduling for loopy belief propagation.
//!
//! Three policies: `priority` pops the directed edge whose pending message
//! moved the most (L∞ against the last sent message), `fifo` sweeps all
//! directed edges round-robin, and `random_spanning_tree` runs exact
//! two-pass propagation along a freshly sampled spanning tree per
//! iteration. All policies dampen committed messages by
//! `λ·old + (1−λ)·new` and stop once every pending delta falls below the
//! convergence threshold, or the iteration budget runs out (non-fatal; the
//! engine proceeds with the current marginals).

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, GraphError};
use crate::graph::UnionFind;
use crate::inference::{DirEdge, EdgeIx, InferenceGraph};
use crate::pmf::Pmf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingType {
    Priority,
    Fifo,
    RandomSpanningTree,
}

impl Default for SchedulingType {
    fn default() -> Self {
        SchedulingType::Priority
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LbpSettings {
    #[serde(default)]
    pub scheduling_type: SchedulingType,
    /// A message with a pending delta below this is considered converged.
    #[serde(default = "default_convergence_threshold")]
    pub convergence_threshold: f64,
    /// 0 = new message overwrites the old completely; close to 1 = the old
    /// message barely moves. Prevents oscillation at the cost of speed.
    #[serde(default = "default_dampening_lambda")]
    pub dampening_lambda: f64,
    /// Budget before giving up on convergence: committed messages for the
    /// priority policy, full sweeps for the other two.
    #[serde(default = "default_max_nr_iterations")]
    pub max_nr_iterations: u64,
    /// Seed for the spanning-tree policy; runs are reproducible given the
    /// same seed.
    #[serde(default)]
    pub rng_seed: u64,
}

fn default_convergence_threshold() -> f64 {
    1e-5
}

fn default_dampening_lambda() -> f64 {
    1e-3
}

fn default_max_nr_iterations() -> u64 {
    1 << 32
}

impl Default for LbpSettings {
    fn default() -> Self {
        Self {
            scheduling_type: SchedulingType::default(),
            convergence_threshold: default_convergence_threshold(),
            dampening_lambda: default_dampening_lambda(),
            max_nr_iterations: default_max_nr_iterations(),
            rng_seed: 0,
        }
    }
}

impl LbpSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.convergence_threshold > 0.0) {
            return Err(ConfigError::NotPositive {
                name: "loopy_belief_propagation:convergence_threshold",
                value: self.convergence_threshold,
            });
        }
        if !(0.0..1.0).contains(&self.dampening_lambda) {
            return Err(ConfigError::OutOfRange {
                name: "loopy_belief_propagation:dampening_lambda",
                value: self.dampening_lambda,
                min: 0.0,
                max: 1.0,
            });
        }
        Ok(())
    }
}

/// Outcome of one scheduler run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerRun {
    pub converged: bool,
    pub iterations: u64,
    /// Largest pending delta at termination.
    pub residual: f64,
}

/// Run the configured policy to convergence on a seeded graph.
pub fn run_scheduler(
    graph: &mut InferenceGraph,
    settings: &LbpSettings,
    seed: u64,
) -> Result<SchedulerRun, GraphError> {
    graph.seed_messages();
    match settings.scheduling_type {
        SchedulingType::Priority => run_priority(graph, settings),
        SchedulingType::Fifo => run_fifo(graph, settings),
        SchedulingType::RandomSpanningTree => run_spanning_tree(graph, settings, seed),
    }
}

/// Max-heap entry ordered by pending delta, ties broken toward the lower
/// edge id for determinism.
#[derive(Debug, PartialEq)]
struct HeapEntry {
    delta: f64,
    dir: DirEdge,
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.delta
            .total_cmp(&other.delta)
            .then_with(|| other.dir.cmp(&self.dir))
    }
}

fn run_priority(
    graph: &mut InferenceGraph,
    settings: &LbpSettings,
) -> Result<SchedulerRun, GraphError> {
    let n = graph.num_directed_edges();
    let lambda = settings.dampening_lambda;
    let mut pending: Vec<Option<Pmf>> = vec![None; n];
    let mut priority = vec![0.0f64; n];
    let mut heap = BinaryHeap::with_capacity(n);

    for i in 0..n {
        let dir = DirEdge(i as u32);
        let raw = graph.compute_message(dir)?;
        let new = Pmf::dampen(graph.current(dir), &raw, lambda);
        let delta = new.linf_distance(graph.current(dir));
        pending[i] = Some(new);
        priority[i] = delta;
        heap.push(HeapEntry { delta, dir });
    }

    let mut iterations = 0u64;
    let mut deps = Vec::new();
    while let Some(HeapEntry { delta, dir }) = heap.pop() {
        let i = dir.0 as usize;
        // stale entry: the edge was updated again after this push
        if delta != priority[i] {
            continue;
        }
        if delta < settings.convergence_threshold {
            return Ok(SchedulerRun {
                converged: true,
                iterations,
                residual: delta,
            });
        }
        if iterations >= settings.max_nr_iterations {
            return Ok(SchedulerRun {
                converged: false,
                iterations,
                residual: delta,
            });
        }
        let Some(msg) = pending[i].take() else {
            continue;
        };
        graph.commit(dir, msg);
        priority[i] = 0.0;
        iterations += 1;

        graph.dependents(dir, &mut deps);
        for &dep in &deps {
            let raw = graph.compute_message(dep)?;
            let new = Pmf::dampen(graph.current(dep), &raw, lambda);
            let delta = new.linf_distance(graph.current(dep));
            let j = dep.0 as usize;
            pending[j] = Some(new);
            priority[j] = delta;
            heap.push(HeapEntry { delta, dir: dep });
        }
    }

    // heap drained: everything committed and nothing pending
    Ok(SchedulerRun {
        converged: true,
        iterations,
        residual: 0.0,
    })
}

fn run_fifo(
    graph: &mut InferenceGraph,
    settings: &LbpSettings,
) -> Result<SchedulerRun, GraphError> {
    let n = graph.num_directed_edges();
    let lambda = settings.dampening_lambda;
    let mut sweeps = 0u64;
    loop {
        let mut max_delta = 0.0f64;
        for i in 0..n {
            let dir = DirEdge(i as u32);
            let raw = graph.compute_message(dir)?;
            let new = Pmf::dampen(graph.current(dir), &raw, lambda);
            max_delta = max_delta.max(new.linf_distance(graph.current(dir)));
            graph.commit(dir, new);
        }
        sweeps += 1;
        if max_delta < settings.convergence_threshold {
            return Ok(SchedulerRun {
                converged: true,
                iterations: sweeps,
                residual: max_delta,
            });
        }
        if sweeps >= settings.max_nr_iterations {
            return Ok(SchedulerRun {
                converged: false,
                iterations: sweeps,
                residual: max_delta,
            });
        }
    }
}

/// Node ids for the spanning tree: variables first, then factors.
fn run_spanning_tree(
    graph: &mut InferenceGraph,
    settings: &LbpSettings,
    seed: u64,
) -> Result<SchedulerRun, GraphError> {
    let nv = graph.num_vars();
    let nodes = nv + graph.num_factors();
    let lambda = settings.dampening_lambda;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut edge_order: Vec<u32> = (0..graph.num_edges() as u32).collect();
    let mut sweeps = 0u64;

    loop {
        edge_order.shuffle(&mut rng);
        let mut uf = UnionFind::new(nodes);
        let mut tree: Vec<Vec<(usize, EdgeIx)>> = vec![Vec::new(); nodes];
        for &e in &edge_order {
            let edge = graph.edge(EdgeIx(e));
            let a = edge.var.0 as usize;
            let b = nv + edge.factor.0 as usize;
            if uf.union(a as u32, b as u32) {
                tree[a].push((b, EdgeIx(e)));
                tree[b].push((a, EdgeIx(e)));
            }
        }

        // BFS forest: parent pointers plus visit order
        let mut parent: Vec<Option<(usize, EdgeIx)>> = vec![None; nodes];
        let mut order = Vec::with_capacity(nodes);
        let mut visited = vec![false; nodes];
        for root in 0..nodes {
            if visited[root] {
                continue;
            }
            visited[root] = true;
            let mut queue = std::collections::VecDeque::from([root]);
            while let Some(u) = queue.pop_front() {
                order.push(u);
                for &(w, e) in &tree[u] {
                    if !visited[w] {
                        visited[w] = true;
                        parent[w] = Some((u, e));
                        queue.push_back(w);
                    }
                }
            }
        }

        let mut max_delta = 0.0f64;
        let send = |graph: &mut InferenceGraph,
                        from: usize,
                        e: EdgeIx,
                        max_delta: &mut f64|
         -> Result<(), GraphError> {
            let dir = if from < nv {
                DirEdge::var_to_factor(e)
            } else {
                DirEdge::factor_to_var(e)
            };
            let raw = graph.compute_message(dir)?;
            let new = Pmf::dampen(graph.current(dir), &raw, lambda);
            *max_delta = max_delta.max(new.linf_distance(graph.current(dir)));
            graph.commit(dir, new);
            Ok(())
        };

        // leaves to roots, then roots to leaves
        for &u in order.iter().rev() {
            if let Some((_, e)) = parent[u] {
                send(graph, u, e, &mut max_delta)?;
            }
        }
        for &u in &order {
            if let Some((p, e)) = parent[u] {
                send(graph, p, e, &mut max_delta)?;
            }
        }

        sweeps += 1;
        if max_delta < settings.convergence_threshold {
            return Ok(SchedulerRun {
                converged: true,
                iterations: sweeps,
                residual: max_delta,
            });
        }
        if sweeps >= settings.max_nr_iterations {
            return Ok(SchedulerRun {
                converged: false,
                iterations: sweeps,
                residual: max_delta,
            });
        }
    }
}
