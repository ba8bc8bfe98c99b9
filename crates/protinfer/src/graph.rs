//! The identification graph: proteins, indistinguishable groups, peptides
//! and PSMs connected by evidence edges, partitioned into connected
//! components.
//!
//! This is the bipartite-style structure described for EPIFANY-style
//! Bayesian protein inference (Pfeuffer et al. 2020,
//! https://pubmed.ncbi.nlm.nih.gov/31975601/): vertex kinds are ordered so
//! that kind codes strictly increase along any path from a protein to a
//! PSM, which is what the factor-graph construction relies on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fnv::FnvHashMap;
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Dense vertex id within one identification graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexIx(pub u32);

impl VertexIx {
    fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Vertex kinds, in the single enumeration whose integer codes order the
/// protein side below the PSM side. Codes 4 and 5 are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum VertexKind {
    Protein = 0,
    ProteinGroup = 1,
    PeptideGroup = 2,
    Peptide = 3,
    Psm = 6,
}

#[derive(Debug, Clone)]
pub enum Vertex {
    Protein {
        accession: Arc<String>,
        decoy: bool,
        /// Mutable slot the driver writes the posterior into.
        score: f64,
        /// Optional per-protein prior overriding the global gamma.
        prior: Option<f64>,
    },
    ProteinGroup,
    PeptideGroup,
    Peptide {
        sequence: Arc<String>,
    },
    Psm {
        /// Peptide-level probability in [0, 1].
        score: f64,
        /// Number of peptide-evidence entries backing this PSM.
        evidences: u32,
    },
}

impl Vertex {
    pub fn kind(&self) -> VertexKind {
        match self {
            Vertex::Protein { .. } => VertexKind::Protein,
            Vertex::ProteinGroup => VertexKind::ProteinGroup,
            Vertex::PeptideGroup => VertexKind::PeptideGroup,
            Vertex::Peptide { .. } => VertexKind::Peptide,
            Vertex::Psm { .. } => VertexKind::Psm,
        }
    }
}

/// A candidate protein of the search space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProteinHit {
    pub accession: String,
    #[serde(default)]
    pub decoy: bool,
    #[serde(default)]
    pub score: f64,
}

/// One peptide-spectrum match candidate: a peptide-level probability plus
/// the accessions of its parent-protein evidences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeptideHit {
    pub sequence: String,
    pub score: f64,
    pub proteins: Vec<String>,
}

/// All candidate matches of one spectrum, best first after ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeptideIdentification {
    pub spectrum_id: String,
    pub hits: Vec<PeptideHit>,
}

/// An annotated indistinguishable protein group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndistinguishableGroup {
    pub accessions: Vec<String>,
    pub probability: f64,
}

/// Cooperative cancellation flag, checked at connected-component
/// boundaries only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Disjoint-set forest with path compression, shared by the connected
/// component computation and the spanning-tree scheduler.
pub(crate) struct UnionFind {
    parent: Vec<u32>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            parent: (0..n as u32).collect(),
            rank: vec![0; n],
        }
    }

    pub(crate) fn find(&mut self, x: u32) -> u32 {
        let mut root = x;
        while self.parent[root as usize] != root {
            root = self.parent[root as usize];
        }
        let mut cur = x;
        while self.parent[cur as usize] != root {
            cur = std::mem::replace(&mut self.parent[cur as usize], root);
        }
        root
    }

    /// Returns true if the two elements were in different sets.
    pub(crate) fn union(&mut self, a: u32, b: u32) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        match self.rank[ra as usize].cmp(&self.rank[rb as usize]) {
            std::cmp::Ordering::Less => self.parent[ra as usize] = rb,
            std::cmp::Ordering::Greater => self.parent[rb as usize] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb as usize] = ra;
                self.rank[ra as usize] += 1;
            }
        }
        true
    }
}

/// A read-only view of one connected component, handed to [`CcFunctor`]s.
pub struct CcView<'a> {
    graph: &'a IdGraph,
    index: usize,
    members: &'a [VertexIx],
}

impl<'a> CcView<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn vertices(&self) -> impl Iterator<Item = VertexIx> + '_ {
        self.members.iter().copied()
    }

    pub fn vertex(&self, v: VertexIx) -> &Vertex {
        self.graph.vertex(v)
    }

    pub fn neighbors(&self, v: VertexIx) -> &[VertexIx] {
        self.graph.neighbors(v)
    }
}

/// An operation applied independently to every connected component.
pub trait CcFunctor: Sync {
    type Output: Send;

    fn run(&self, cc: CcView<'_>) -> Result<Self::Output, GraphError>;
}

#[derive(Debug, Default)]
pub struct IdGraph {
    vertices: Vec<Vertex>,
    adjacency: Vec<Vec<VertexIx>>,
    ccs: Vec<Vec<VertexIx>>,
}

impl IdGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertex(&self, v: VertexIx) -> &Vertex {
        &self.vertices[v.idx()]
    }

    pub fn neighbors(&self, v: VertexIx) -> &[VertexIx] {
        &self.adjacency[v.idx()]
    }

    pub fn add_vertex(&mut self, vertex: Vertex) -> VertexIx {
        let v = VertexIx(self.vertices.len() as u32);
        self.vertices.push(vertex);
        self.adjacency.push(Vec::new());
        v
    }

    pub fn add_edge(&mut self, a: VertexIx, b: VertexIx) {
        debug_assert_ne!(a, b);
        self.adjacency[a.idx()].push(b);
        self.adjacency[b.idx()].push(a);
    }

    /// Construct the graph from identification records. `top_psms` keeps
    /// the best-scoring hits per spectrum; 0 keeps all. Ranking ties are
    /// broken by input order.
    pub fn build(
        proteins: &[ProteinHit],
        peptides: &[PeptideIdentification],
        top_psms: usize,
    ) -> Result<Self, GraphError> {
        let mut graph = Self::default();
        let mut protein_ix: FnvHashMap<Arc<String>, VertexIx> = FnvHashMap::default();
        for hit in proteins {
            let accession = Arc::new(hit.accession.clone());
            if protein_ix.contains_key(&accession) {
                warn!("duplicate protein record `{}` ignored", hit.accession);
                continue;
            }
            let v = graph.add_vertex(Vertex::Protein {
                accession: accession.clone(),
                decoy: hit.decoy,
                score: hit.score,
                prior: None,
            });
            protein_ix.insert(accession, v);
        }

        let mut peptide_ix: FnvHashMap<Arc<String>, VertexIx> = FnvHashMap::default();
        let mut kept = 0usize;
        for id in peptides {
            let mut order: Vec<usize> = (0..id.hits.len()).collect();
            order.sort_by(|&a, &b| id.hits[b].score.total_cmp(&id.hits[a].score));
            let take = match top_psms {
                0 => order.len(),
                k => k.min(order.len()),
            };
            for &h in &order[..take] {
                let hit = &id.hits[h];
                if hit.proteins.is_empty() {
                    return Err(GraphError::Structural(format!(
                        "PSM for spectrum `{}` has no protein evidence",
                        id.spectrum_id
                    )));
                }
                if !(0.0..=1.0).contains(&hit.score) {
                    return Err(GraphError::Structural(format!(
                        "PSM score {} for spectrum `{}` outside [0, 1]",
                        hit.score, id.spectrum_id
                    )));
                }
                let sequence = Arc::new(hit.sequence.clone());
                let pep = match peptide_ix.get(&sequence) {
                    Some(&v) => v,
                    None => {
                        let v = graph.add_vertex(Vertex::Peptide {
                            sequence: sequence.clone(),
                        });
                        peptide_ix.insert(sequence, v);
                        v
                    }
                };
                let psm = graph.add_vertex(Vertex::Psm {
                    score: hit.score,
                    evidences: hit.proteins.len() as u32,
                });
                graph.add_edge(pep, psm);
                kept += 1;
                for acc in &hit.proteins {
                    let acc = Arc::new(acc.clone());
                    let prot = match protein_ix.get(&acc) {
                        Some(&v) => v,
                        None => {
                            warn!(
                                "peptide evidence references unknown protein `{}`; \
                                 adding it as a target",
                                acc
                            );
                            let v = graph.add_vertex(Vertex::Protein {
                                accession: acc.clone(),
                                decoy: false,
                                score: 0.0,
                                prior: None,
                            });
                            protein_ix.insert(acc, v);
                            v
                        }
                    };
                    if !graph.adjacency[prot.idx()].contains(&pep) {
                        graph.add_edge(prot, pep);
                    }
                }
            }
        }
        info!(
            "built identification graph: {} proteins, {} peptides, {} PSMs kept",
            protein_ix.len(),
            peptide_ix.len(),
            kept
        );
        Ok(graph)
    }

    /// Partition the vertex set into connected components, each materialized
    /// as a sorted vertex list for deterministic iteration.
    pub fn compute_connected_components(&mut self) {
        let n = self.vertices.len();
        let mut uf = UnionFind::new(n);
        for (v, neighbors) in self.adjacency.iter().enumerate() {
            for &w in neighbors {
                uf.union(v as u32, w.0);
            }
        }
        let mut by_root: FnvHashMap<u32, Vec<VertexIx>> = FnvHashMap::default();
        for v in 0..n as u32 {
            by_root.entry(uf.find(v)).or_default().push(VertexIx(v));
        }
        let mut ccs: Vec<Vec<VertexIx>> = by_root.into_values().collect();
        for cc in &mut ccs {
            cc.sort_unstable();
        }
        ccs.sort_unstable_by_key(|cc| cc[0]);
        info!("found {} connected components", ccs.len());
        self.ccs = ccs;
    }

    pub fn connected_components(&self) -> &[Vec<VertexIx>] {
        &self.ccs
    }

    /// Collapse indistinguishable proteins of each component (identical
    /// peptide neighbor sets, two or more members) under a ProteinGroup
    /// vertex. With `group_peptides`, additionally collapse peptides with
    /// identical lower-side parent sets under a PeptideGroup vertex.
    /// Single-member sets keep their direct edges.
    pub fn cluster_indist_proteins_and_peptides(&mut self, group_peptides: bool) {
        debug_assert!(!self.ccs.is_empty() || self.vertices.is_empty());
        let mut protein_groups = 0usize;
        let mut peptide_groups = 0usize;
        for cc in 0..self.ccs.len() {
            protein_groups += self.cluster_kind(cc, VertexKind::Protein, Vertex::ProteinGroup);
            if group_peptides {
                peptide_groups +=
                    self.cluster_kind(cc, VertexKind::Peptide, Vertex::PeptideGroup);
            }
            self.ccs[cc].sort_unstable();
        }
        info!(
            "clustered {} indistinguishable protein groups, {} peptide groups",
            protein_groups, peptide_groups
        );
    }

    /// Group vertices of `kind` within one component by their neighbor set
    /// on the opposite side, inserting `group_vertex` between members and
    /// shared neighbors. Returns the number of groups created.
    fn cluster_kind(&mut self, cc: usize, kind: VertexKind, group_vertex: Vertex) -> usize {
        let mut by_side: FnvHashMap<Vec<VertexIx>, Vec<VertexIx>> = FnvHashMap::default();
        for &v in &self.ccs[cc] {
            if self.vertices[v.idx()].kind() != kind {
                continue;
            }
            // proteins key on their peptide side, peptides on their
            // protein(-group) side
            let mut key: Vec<VertexIx> = self.adjacency[v.idx()]
                .iter()
                .copied()
                .filter(|&n| match kind {
                    VertexKind::Protein => {
                        self.vertices[n.idx()].kind() == VertexKind::Peptide
                    }
                    _ => self.vertices[n.idx()].kind() < kind,
                })
                .collect();
            key.sort_unstable();
            by_side.entry(key).or_default().push(v);
        }
        let mut groups: Vec<(Vec<VertexIx>, Vec<VertexIx>)> = by_side
            .into_iter()
            .filter(|(side, members)| !side.is_empty() && members.len() >= 2)
            .collect();
        groups.sort_unstable();
        let created = groups.len();
        for (side, members) in groups {
            let g = self.add_vertex(group_vertex.clone());
            for &m in &members {
                self.adjacency[m.idx()].retain(|x| !side.contains(x));
                for &s in &side {
                    self.adjacency[s.idx()].retain(|&x| x != m);
                }
                match kind {
                    // protein — group — peptides
                    VertexKind::Protein => self.add_edge(m, g),
                    // parents — group — peptides
                    _ => self.add_edge(g, m),
                }
            }
            for &s in &side {
                match kind {
                    VertexKind::Protein => self.add_edge(g, s),
                    _ => self.add_edge(s, g),
                }
            }
            self.ccs[cc].push(g);
        }
        created
    }

    /// Apply a functor to every connected component, in parallel.
    /// Components are disjoint so runs share no mutable state; results come
    /// back in component order. `None` marks components never started
    /// because of cancellation.
    pub fn apply_functor_on_ccs<F: CcFunctor>(
        &self,
        functor: &F,
        cancel: &CancelToken,
    ) -> Vec<Option<Result<F::Output, GraphError>>> {
        self.ccs
            .par_iter()
            .enumerate()
            .map(|(index, members)| {
                if cancel.is_cancelled() {
                    return None;
                }
                Some(functor.run(CcView {
                    graph: self,
                    index,
                    members,
                }))
            })
            .collect()
    }

    /// Posterior write-back, dispatched by vertex kind: proteins receive the
    /// presence probability in their score slot, every other kind ignores
    /// it.
    pub fn set_posterior(&mut self, v: VertexIx, posterior: f64) {
        if let Vertex::Protein { score, .. } = &mut self.vertices[v.idx()] {
            *score = posterior;
        }
    }

    /// Snapshot of the protein side, for the FDR objective and for output.
    pub fn protein_hits(&self) -> Vec<ProteinHit> {
        self.vertices
            .iter()
            .filter_map(|v| match v {
                Vertex::Protein {
                    accession,
                    decoy,
                    score,
                    ..
                } => Some(ProteinHit {
                    accession: accession.as_ref().clone(),
                    decoy: *decoy,
                    score: *score,
                }),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(spectrum: &str, hits: Vec<(&str, f64, Vec<&str>)>) -> PeptideIdentification {
        PeptideIdentification {
            spectrum_id: spectrum.into(),
            hits: hits
                .into_iter()
                .map(|(seq, score, prots)| PeptideHit {
                    sequence: seq.into(),
                    score,
                    proteins: prots.into_iter().map(String::from).collect(),
                })
                .collect(),
        }
    }

    fn proteins(accs: &[&str]) -> Vec<ProteinHit> {
        accs.iter()
            .map(|a| ProteinHit {
                accession: (*a).into(),
                decoy: false,
                score: 0.0,
            })
            .collect()
    }

    #[test]
    fn build_links_protein_peptide_psm() {
        let g = IdGraph::build(
            &proteins(&["P1"]),
            &[id("s1", vec![("PEPA", 0.9, vec!["P1"])])],
            1,
        )
        .unwrap();
        assert_eq!(g.num_vertices(), 3);
        let pep = VertexIx(1);
        assert_eq!(g.vertex(pep).kind(), VertexKind::Peptide);
        assert_eq!(g.neighbors(pep).len(), 2);
    }

    #[test]
    fn top_psms_keeps_best_hits() {
        let g = IdGraph::build(
            &proteins(&["P1", "P2"]),
            &[id(
                "s1",
                vec![("PEPA", 0.3, vec!["P1"]), ("PEPB", 0.8, vec!["P2"])],
            )],
            1,
        )
        .unwrap();
        // two proteins, one peptide, one PSM
        assert_eq!(g.num_vertices(), 4);
        assert_eq!(g.vertex(VertexIx(2)).kind(), VertexKind::Peptide);
        match g.vertex(VertexIx(3)) {
            Vertex::Psm { score, .. } => assert_eq!(*score, 0.8),
            other => panic!("expected PSM, got {:?}", other.kind()),
        }
    }

    #[test]
    fn zero_top_psms_keeps_all() {
        let g = IdGraph::build(
            &proteins(&["P1"]),
            &[id(
                "s1",
                vec![("PEPA", 0.3, vec!["P1"]), ("PEPB", 0.8, vec!["P1"])],
            )],
            0,
        )
        .unwrap();
        assert_eq!(g.num_vertices(), 5);
    }

    #[test]
    fn psm_without_evidence_is_structural() {
        let err = IdGraph::build(&[], &[id("s1", vec![("PEPA", 0.9, vec![])])], 0);
        assert!(matches!(err, Err(GraphError::Structural(_))));
    }

    #[test]
    fn components_partition_the_graph() {
        let mut g = IdGraph::build(
            &proteins(&["P1", "P2"]),
            &[
                id("s1", vec![("PEPA", 0.9, vec!["P1"])]),
                id("s2", vec![("PEPB", 0.8, vec!["P2"])]),
            ],
            1,
        )
        .unwrap();
        g.compute_connected_components();
        assert_eq!(g.connected_components().len(), 2);
        let total: usize = g.connected_components().iter().map(|cc| cc.len()).sum();
        assert_eq!(total, g.num_vertices());
    }

    #[test]
    fn indistinguishable_proteins_are_grouped() {
        let mut g = IdGraph::build(
            &proteins(&["P1", "P2"]),
            &[id("s1", vec![("PEPA", 0.9, vec!["P1", "P2"])])],
            1,
        )
        .unwrap();
        g.compute_connected_components();
        g.cluster_indist_proteins_and_peptides(false);
        let group = (0..g.num_vertices() as u32)
            .map(VertexIx)
            .find(|&v| g.vertex(v).kind() == VertexKind::ProteinGroup)
            .expect("a protein group");
        // both proteins hang off the group, and the peptide moved over
        let mut kinds: Vec<VertexKind> = g
            .neighbors(group)
            .iter()
            .map(|&n| g.vertex(n).kind())
            .collect();
        kinds.sort_unstable();
        assert_eq!(
            kinds,
            vec![
                VertexKind::Protein,
                VertexKind::Protein,
                VertexKind::Peptide
            ]
        );
        // direct protein-peptide edges are gone
        assert_eq!(g.neighbors(VertexIx(0)), &[group]);
    }

    #[test]
    fn distinguishable_proteins_stay_direct() {
        let mut g = IdGraph::build(
            &proteins(&["P1", "P2"]),
            &[
                id("s1", vec![("PEPA", 0.9, vec!["P1", "P2"])]),
                id("s2", vec![("PEPB", 0.8, vec!["P2"])]),
            ],
            1,
        )
        .unwrap();
        g.compute_connected_components();
        g.cluster_indist_proteins_and_peptides(false);
        assert!((0..g.num_vertices() as u32)
            .map(VertexIx)
            .all(|v| g.vertex(v).kind() != VertexKind::ProteinGroup));
    }

    #[test]
    fn extended_clustering_groups_peptides() {
        // two peptides under the same protein pair
        let mut g = IdGraph::build(
            &proteins(&["P1", "P2"]),
            &[
                id("s1", vec![("PEPA", 0.9, vec!["P1", "P2"])]),
                id("s2", vec![("PEPB", 0.8, vec!["P1", "P2"])]),
            ],
            1,
        )
        .unwrap();
        g.compute_connected_components();
        g.cluster_indist_proteins_and_peptides(true);
        let pg = (0..g.num_vertices() as u32)
            .map(VertexIx)
            .find(|&v| g.vertex(v).kind() == VertexKind::PeptideGroup)
            .expect("a peptide group");
        let mut kinds: Vec<VertexKind> = g
            .neighbors(pg)
            .iter()
            .map(|&n| g.vertex(n).kind())
            .collect();
        kinds.sort_unstable();
        assert_eq!(
            kinds,
            vec![
                VertexKind::ProteinGroup,
                VertexKind::Peptide,
                VertexKind::Peptide
            ]
        );
    }

    #[test]
    fn cancellation_skips_components() {
        struct Count;
        impl CcFunctor for Count {
            type Output = usize;
            fn run(&self, cc: CcView<'_>) -> Result<usize, GraphError> {
                Ok(cc.len())
            }
        }
        let mut g = IdGraph::build(
            &proteins(&["P1"]),
            &[id("s1", vec![("PEPA", 0.9, vec!["P1"])])],
            1,
        )
        .unwrap();
        g.compute_connected_components();
        let cancel = CancelToken::new();
        cancel.cancel();
        let runs = g.apply_functor_on_ccs(&Count, &cancel);
        assert!(runs.iter().all(Option::is_none));
    }

    #[test]
    fn posterior_write_back_is_kind_dispatched() {
        let mut g = IdGraph::build(
            &proteins(&["P1"]),
            &[id("s1", vec![("PEPA", 0.9, vec!["P1"])])],
            1,
        )
        .unwrap();
        g.set_posterior(VertexIx(0), 0.75);
        g.set_posterior(VertexIx(1), 0.5); // peptide: ignored
        let hits = g.protein_hits();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score, 0.75);
    }
}
