//! Belief propagation engine: drives a scheduler to its fixpoint and
//! extracts normalized posterior marginals for a requested variable set.

use crate::error::GraphError;
use crate::graph::VertexIx;
use crate::inference::{InferenceGraph, VarIx};
use crate::pmf::Pmf;
use crate::scheduler::{run_scheduler, LbpSettings, SchedulerRun};

/// Posterior marginal of one variable, addressed by the identification
/// graph vertex it mirrors.
#[derive(Debug, Clone)]
pub struct PosteriorEstimate {
    pub vertex: VertexIx,
    pub pmf: Pmf,
}

impl PosteriorEstimate {
    /// Presence probability: the mass at 1 when 1 lies within the support,
    /// zero otherwise.
    pub fn presence_probability(&self) -> f64 {
        if self.pmf.first_support() <= 1 && 1 <= self.pmf.last_support() {
            self.pmf.table()[(1 - self.pmf.first_support()) as usize]
        } else {
            0.0
        }
    }
}

pub struct BeliefPropagation<'a> {
    settings: &'a LbpSettings,
    seed: u64,
}

impl<'a> BeliefPropagation<'a> {
    pub fn new(settings: &'a LbpSettings, seed: u64) -> Self {
        Self { settings, seed }
    }

    /// Run the configured scheduler, then return the normalized marginal of
    /// every requested variable together with the scheduler outcome.
    pub fn estimate_posteriors(
        &self,
        graph: &mut InferenceGraph,
        vars: &[VarIx],
    ) -> Result<(Vec<PosteriorEstimate>, SchedulerRun), GraphError> {
        let run = run_scheduler(graph, self.settings, self.seed)?;
        let mut estimates = Vec::with_capacity(vars.len());
        for &v in vars {
            let pmf = graph.posterior(v)?;
            estimates.push(PosteriorEstimate {
                vertex: graph.var(v).vertex,
                pmf,
            });
        }
        Ok((estimates, run))
    }
}
