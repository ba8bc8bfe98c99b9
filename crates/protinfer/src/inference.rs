//! The per-component factor graph: variable nodes, factor nodes, and edges
//! carrying one message in each direction.
//!
//! Storage is arena-style with dense integer ids; messages live in an
//! edge-indexed vector so iteration order is deterministic and cache
//! friendly. Each variable keeps a back-reference to the identification
//! graph vertex it mirrors, for posterior write-back.

use fnv::FnvHashMap;

use crate::error::GraphError;
use crate::factor::{FactorKind, MessagePasserFactory};
use crate::graph::VertexIx;
use crate::pmf::Pmf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarIx(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FactorIx(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeIx(pub u32);

/// A directed message slot: `2·edge` is variable-to-factor, `2·edge + 1`
/// is factor-to-variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirEdge(pub u32);

impl DirEdge {
    pub fn var_to_factor(e: EdgeIx) -> Self {
        DirEdge(e.0 * 2)
    }

    pub fn factor_to_var(e: EdgeIx) -> Self {
        DirEdge(e.0 * 2 + 1)
    }

    pub fn edge(self) -> EdgeIx {
        EdgeIx(self.0 / 2)
    }

    pub fn is_var_to_factor(self) -> bool {
        self.0 % 2 == 0
    }
}

#[derive(Debug, Clone)]
pub struct VarNode {
    /// Identification-graph vertex this variable mirrors.
    pub vertex: VertexIx,
    pub first: i32,
    pub last: i32,
    pub edges: Vec<EdgeIx>,
}

#[derive(Debug, Clone)]
pub struct FactorNode {
    pub kind: FactorKind,
    /// Incident edges, in the factor's adjacent-variable order.
    pub edges: Vec<EdgeIx>,
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub var: VarIx,
    pub factor: FactorIx,
    /// Position of `var` in the factor's variable tuple.
    pub pos: usize,
    /// μ factor → variable.
    pub to_var: Pmf,
    /// μ variable → factor.
    pub from_var: Pmf,
}

#[derive(Debug, Clone)]
pub struct InferenceGraph {
    vars: Vec<VarNode>,
    factors: Vec<FactorNode>,
    edges: Vec<Edge>,
}

impl InferenceGraph {
    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    pub fn num_factors(&self) -> usize {
        self.factors.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn num_directed_edges(&self) -> usize {
        self.edges.len() * 2
    }

    pub fn var(&self, v: VarIx) -> &VarNode {
        &self.vars[v.0 as usize]
    }

    pub fn factor(&self, f: FactorIx) -> &FactorNode {
        &self.factors[f.0 as usize]
    }

    pub fn edge(&self, e: EdgeIx) -> &Edge {
        &self.edges[e.0 as usize]
    }

    /// Seed every directed message with the uniform distribution over the
    /// variable's support; unary factors seed their outgoing message from
    /// the factor table itself.
    pub fn seed_messages(&mut self) {
        for i in 0..self.edges.len() {
            let (var, factor) = (self.edges[i].var, self.edges[i].factor);
            let support = {
                let v = self.var(var);
                (v.first, v.last)
            };
            let uniform = Pmf::uniform(support.0, support.1);
            self.edges[i].from_var = uniform.clone();
            self.edges[i].to_var = match &self.factor(factor).kind {
                FactorKind::Prior { table } | FactorKind::Evidence { table } => {
                    Pmf::new(0, table.to_vec()).unwrap_or(uniform)
                }
                _ => uniform,
            };
        }
    }

    /// The message currently stored on a directed edge.
    pub fn current(&self, d: DirEdge) -> &Pmf {
        let e = &self.edges[d.edge().0 as usize];
        if d.is_var_to_factor() {
            &e.from_var
        } else {
            &e.to_var
        }
    }

    pub fn commit(&mut self, d: DirEdge, msg: Pmf) {
        let e = &mut self.edges[d.edge().0 as usize];
        if d.is_var_to_factor() {
            e.from_var = msg;
        } else {
            e.to_var = msg;
        }
    }

    /// Recompute the raw (undamped) message for a directed edge from the
    /// messages currently stored on its dependencies.
    pub fn compute_message(&self, d: DirEdge) -> Result<Pmf, GraphError> {
        let e = self.edge(d.edge());
        if d.is_var_to_factor() {
            // product of the other factors' messages into this variable
            let var = self.var(e.var);
            let mut acc: Option<Pmf> = None;
            for &other in &var.edges {
                if other == d.edge() {
                    continue;
                }
                let m = &self.edge(other).to_var;
                acc = Some(match acc {
                    None => m.clone(),
                    Some(p) => p.product(m)?,
                });
            }
            Ok(acc.unwrap_or_else(|| Pmf::uniform(var.first, var.last)))
        } else {
            let factor = self.factor(e.factor);
            let incoming: Vec<&Pmf> = factor
                .edges
                .iter()
                .map(|&fe| &self.edge(fe).from_var)
                .collect();
            let target = self.var(e.var);
            factor
                .kind
                .message_to(e.pos, &incoming, (target.first, target.last))
        }
    }

    /// Directed edges whose value depends on the message just committed on
    /// `d`: all edges leaving the head node, other than back along `d`.
    pub fn dependents(&self, d: DirEdge, out: &mut Vec<DirEdge>) {
        out.clear();
        let e = self.edge(d.edge());
        if d.is_var_to_factor() {
            // head is the factor: its outgoing messages to other variables
            for &fe in &self.factor(e.factor).edges {
                if fe != d.edge() {
                    out.push(DirEdge::factor_to_var(fe));
                }
            }
        } else {
            // head is the variable: its outgoing messages to other factors
            for &ve in &self.var(e.var).edges {
                if ve != d.edge() {
                    out.push(DirEdge::var_to_factor(ve));
                }
            }
        }
    }

    /// Normalized marginal belief of a variable: the product of all
    /// incoming factor messages.
    pub fn posterior(&self, v: VarIx) -> Result<Pmf, GraphError> {
        let var = self.var(v);
        let mut acc: Option<Pmf> = None;
        for &e in &var.edges {
            let m = &self.edge(e).to_var;
            acc = Some(match acc {
                None => m.clone(),
                Some(p) => p.product(m)?,
            });
        }
        acc.ok_or_else(|| {
            GraphError::Structural(format!(
                "variable for vertex {} has no incident factors",
                var.vertex.0
            ))
        })
    }
}

/// Assembles the factor graph of one connected component. Variables are
/// introduced lazily as factors reference their vertices; supports flow
/// bottom-up (an adder output's support is the sum of its parents').
pub struct InferenceGraphBuilder<'a> {
    factory: &'a MessagePasserFactory,
    vars: Vec<VarNode>,
    factors: Vec<FactorNode>,
    edges: Vec<Edge>,
    by_vertex: FnvHashMap<VertexIx, VarIx>,
    posterior_vars: Vec<VarIx>,
}

impl<'a> InferenceGraphBuilder<'a> {
    pub fn new(factory: &'a MessagePasserFactory) -> Self {
        Self {
            factory,
            vars: Vec::new(),
            factors: Vec::new(),
            edges: Vec::new(),
            by_vertex: FnvHashMap::default(),
            posterior_vars: Vec::new(),
        }
    }

    fn intro_var(&mut self, vertex: VertexIx, first: i32, last: i32) -> VarIx {
        if let Some(&v) = self.by_vertex.get(&vertex) {
            return v;
        }
        let v = VarIx(self.vars.len() as u32);
        self.vars.push(VarNode {
            vertex,
            first,
            last,
            edges: Vec::new(),
        });
        self.by_vertex.insert(vertex, v);
        v
    }

    fn existing_var(&self, vertex: VertexIx) -> Result<VarIx, GraphError> {
        self.by_vertex.get(&vertex).copied().ok_or_else(|| {
            GraphError::Structural(format!(
                "vertex {} referenced before its variable was introduced",
                vertex.0
            ))
        })
    }

    fn insert_factor(&mut self, kind: FactorKind, vars: &[VarIx]) {
        let f = FactorIx(self.factors.len() as u32);
        let mut fedges = Vec::with_capacity(vars.len());
        for (pos, &v) in vars.iter().enumerate() {
            let e = EdgeIx(self.edges.len() as u32);
            let node = &mut self.vars[v.0 as usize];
            let uniform = Pmf::uniform(node.first, node.last);
            node.edges.push(e);
            fedges.push(e);
            self.edges.push(Edge {
                var: v,
                factor: f,
                pos,
                to_var: uniform.clone(),
                from_var: uniform,
            });
        }
        self.factors.push(FactorNode { kind, edges: fedges });
    }

    /// Protein prior; the protein is recorded as a posterior-query variable.
    pub fn add_protein_prior(&mut self, vertex: VertexIx, prior: Option<f64>) {
        let v = self.intro_var(vertex, 0, 1);
        let kind = self.factory.protein_factor(prior);
        self.insert_factor(kind, &[v]);
        self.posterior_vars.push(v);
    }

    pub fn add_peptide_evidence(
        &mut self,
        vertex: VertexIx,
        score: f64,
    ) -> Result<(), GraphError> {
        let v = self.intro_var(vertex, 0, 1);
        let kind = self.factory.peptide_evidence_factor(score)?;
        self.insert_factor(kind, &[v]);
        Ok(())
    }

    pub fn add_sum_evidence(
        &mut self,
        evidences: usize,
        parent: VertexIx,
        child: VertexIx,
    ) -> Result<(), GraphError> {
        let parent = self.existing_var(parent)?;
        let child = self.intro_var(child, 0, 1);
        let kind = self.factory.sum_evidence_factor(evidences)?;
        self.insert_factor(kind, &[parent, child]);
        Ok(())
    }

    pub fn add_adder(&mut self, parents: &[VertexIx], out: VertexIx) -> Result<(), GraphError> {
        if parents.is_empty() {
            return Err(GraphError::Structural(format!(
                "adder for vertex {} has no parents",
                out.0
            )));
        }
        let mut vars = Vec::with_capacity(parents.len() + 1);
        let (mut first, mut last) = (0i32, 0i32);
        for &p in parents {
            let v = self.existing_var(p)?;
            first += self.vars[v.0 as usize].first;
            last += self.vars[v.0 as usize].last;
            vars.push(v);
        }
        vars.push(self.intro_var(out, first, last));
        self.insert_factor(FactorKind::Adder, &vars);
        Ok(())
    }

    pub fn build(self) -> (InferenceGraph, Vec<VarIx>) {
        (
            InferenceGraph {
                vars: self.vars,
                factors: self.factors,
                edges: self.edges,
            },
            self.posterior_vars,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factor::ModelParams;

    fn factory() -> MessagePasserFactory {
        MessagePasserFactory::new(&ModelParams {
            prot_prior: 0.5,
            pep_emission: 0.1,
            pep_spurious_emission: 0.001,
        })
    }

    /// protein — adder — peptide — sum evidence — psm, plus unary factors
    fn chain(factory: &MessagePasserFactory) -> (InferenceGraph, Vec<VarIx>) {
        let mut b = InferenceGraphBuilder::new(factory);
        b.add_protein_prior(VertexIx(0), None);
        b.add_adder(&[VertexIx(0)], VertexIx(1)).unwrap();
        b.add_sum_evidence(1, VertexIx(1), VertexIx(2)).unwrap();
        b.add_peptide_evidence(VertexIx(2), 0.9).unwrap();
        b.build()
    }

    #[test]
    fn builder_wires_supports_bottom_up() {
        let factory = factory();
        let mut b = InferenceGraphBuilder::new(&factory);
        b.add_protein_prior(VertexIx(0), None);
        b.add_protein_prior(VertexIx(1), None);
        b.add_adder(&[VertexIx(0), VertexIx(1)], VertexIx(2)).unwrap();
        let (g, posterior) = b.build();
        assert_eq!(posterior.len(), 2);
        let out = g
            .vars
            .iter()
            .find(|v| v.vertex == VertexIx(2))
            .expect("adder output variable");
        assert_eq!((out.first, out.last), (0, 2));
    }

    #[test]
    fn unknown_parent_is_structural() {
        let factory = factory();
        let mut b = InferenceGraphBuilder::new(&factory);
        assert!(matches!(
            b.add_adder(&[VertexIx(7)], VertexIx(8)),
            Err(GraphError::Structural(_))
        ));
    }

    #[test]
    fn seeded_messages_are_normalized() {
        let factory = factory();
        let (mut g, _) = chain(&factory);
        g.seed_messages();
        for e in &g.edges {
            let s: f64 = e.to_var.table().iter().sum();
            assert!((s - 1.0).abs() < 1e-12);
            let s: f64 = e.from_var.table().iter().sum();
            assert!((s - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn dependents_exclude_the_reverse_direction() {
        let factory = factory();
        let (g, _) = chain(&factory);
        // peptide variable sits between the adder and the sum evidence
        let pep = g
            .vars
            .iter()
            .position(|v| v.vertex == VertexIx(1))
            .unwrap();
        let pep = &g.vars[pep];
        assert_eq!(pep.edges.len(), 2);
        let d = DirEdge::factor_to_var(pep.edges[0]);
        let mut deps = Vec::new();
        g.dependents(d, &mut deps);
        assert_eq!(deps, vec![DirEdge::var_to_factor(pep.edges[1])]);
    }
}
