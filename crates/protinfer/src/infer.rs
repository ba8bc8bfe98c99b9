//! Inference over the identification graph: per-component factor-graph
//! construction, the connected-component driver, and the hyperparameter
//! grid search that wraps it.
//!
//! Components are mutually disjoint, so inference runs CC-parallel with no
//! shared mutable state; posterior write-back is serialized on the driver
//! thread. The grid search stays serial at the (α, β, γ) level to avoid
//! nesting parallelism without thread-count control.

use itertools::Itertools;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::engine::BeliefPropagation;
use crate::error::{CcFailure, ConfigError, ConvergenceWarning, DriverError, GraphError};
use crate::factor::{MessagePasserFactory, ModelParams};
use crate::fdr::ProteinScorer;
use crate::graph::{
    CancelToken, CcFunctor, CcView, IdGraph, IndistinguishableGroup, PeptideIdentification,
    ProteinHit, Vertex, VertexIx, VertexKind,
};
use crate::grid::{GridPoint, GridSearch};
use crate::inference::InferenceGraphBuilder;
use crate::scheduler::LbpSettings;

/// Full configuration of one inference run; field names mirror the
/// configuration file sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    /// Skip inference entirely and only annotate indistinguishable groups.
    pub annotate_groups_only: bool,
    /// Consider only the best X PSMs per spectrum; 0 considers all.
    pub top_psms: usize,
    /// Also collapse peptides with identical parent sets (the extended
    /// clustering variant).
    pub group_peptides: bool,
    pub model_parameters: ModelParams,
    pub loopy_belief_propagation: LbpSettings,
    pub param_optimize: ParamOptimize,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            annotate_groups_only: false,
            top_psms: 1,
            group_peptides: true,
            model_parameters: ModelParams::default(),
            loopy_belief_propagation: LbpSettings::default(),
            param_optimize: ParamOptimize::default(),
        }
    }
}

/// Grid-search settings for the hyperparameter scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamOptimize {
    /// Weight of ranking (AUC) against calibration in the FDR objective:
    /// 0 maximizes calibration only, 1 maximizes AUC only.
    pub aucweight: f64,
    pub alpha_grid: Vec<f64>,
    pub beta_grid: Vec<f64>,
    pub gamma_grid: Vec<f64>,
}

impl Default for ParamOptimize {
    fn default() -> Self {
        Self {
            aucweight: 0.2,
            alpha_grid: vec![0.1, 0.3, 0.5, 0.7, 0.9],
            beta_grid: vec![0.001],
            gamma_grid: vec![0.5],
        }
    }
}

impl InferenceSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.model_parameters.validate()?;
        self.loopy_belief_propagation.validate()?;
        if !(0.0..=1.0).contains(&self.param_optimize.aucweight) {
            return Err(ConfigError::OutOfRange {
                name: "param_optimize:aucweight",
                value: self.param_optimize.aucweight,
                min: 0.0,
                max: 1.0,
            });
        }
        for (name, grid) in [
            ("param_optimize:alpha_grid", &self.param_optimize.alpha_grid),
            ("param_optimize:beta_grid", &self.param_optimize.beta_grid),
            ("param_optimize:gamma_grid", &self.param_optimize.gamma_grid),
        ] {
            if grid.is_empty() {
                return Err(ConfigError::EmptyGrid { name });
            }
            for &value in grid {
                if !(0.0..=1.0).contains(&value) {
                    return Err(ConfigError::OutOfRange {
                        name,
                        value,
                        min: 0.0,
                        max: 1.0,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Construct the identification graph from records, compute its components
/// and collapse indistinguishable vertices, per the settings.
pub fn prepare_graph(
    proteins: &[ProteinHit],
    peptides: &[PeptideIdentification],
    settings: &InferenceSettings,
) -> Result<IdGraph, GraphError> {
    let mut graph = IdGraph::build(proteins, peptides, settings.top_psms)?;
    graph.compute_connected_components();
    graph.cluster_indist_proteins_and_peptides(settings.group_peptides);
    Ok(graph)
}

/// Posteriors of one component plus its convergence status.
#[derive(Debug, Clone)]
pub struct CcPosteriors {
    pub posteriors: Vec<(VertexIx, f64)>,
    pub warning: Option<ConvergenceWarning>,
}

/// Builds the factor graph of one component and runs belief propagation on
/// it. One functor serves both the plain and the extended (peptide-grouped)
/// graphs: factor insertion is driven by vertex kinds alone.
pub struct InferenceFunctor<'a> {
    pub model: &'a ModelParams,
    pub lbp: &'a LbpSettings,
}

impl<'a> CcFunctor for InferenceFunctor<'a> {
    /// `None` for degenerate components (fewer than two vertices).
    type Output = Option<CcPosteriors>;

    fn run(&self, cc: CcView<'_>) -> Result<Self::Output, GraphError> {
        if cc.len() < 2 {
            return Ok(None);
        }
        let factory = MessagePasserFactory::new(self.model);
        let mut builder = InferenceGraphBuilder::new(&factory);

        // kind-sorted so that every adder's parents exist before the adder
        let members: Vec<VertexIx> = cc
            .vertices()
            .sorted_by_key(|&v| (cc.vertex(v).kind(), v))
            .collect();

        for &u in &members {
            let kind = cc.vertex(u).kind();
            let mut lower: Vec<VertexIx> = cc
                .neighbors(u)
                .iter()
                .copied()
                .filter(|&n| cc.vertex(n).kind() < kind)
                .collect();
            lower.sort_unstable();
            match cc.vertex(u) {
                Vertex::Protein { prior, .. } => {
                    builder.add_protein_prior(u, *prior);
                }
                Vertex::ProteinGroup | Vertex::PeptideGroup | Vertex::Peptide { .. } => {
                    if lower.is_empty() {
                        return Err(GraphError::Structural(format!(
                            "{kind:?} vertex {} has no lower-kind neighbor",
                            u.0
                        )));
                    }
                    builder.add_adder(&lower, u)?;
                }
                Vertex::Psm { score, evidences } => {
                    if lower.len() != 1 {
                        return Err(GraphError::Structural(format!(
                            "PSM vertex {} has {} parents, expected one",
                            u.0,
                            lower.len()
                        )));
                    }
                    builder.add_sum_evidence(*evidences as usize, lower[0], u)?;
                    builder.add_peptide_evidence(u, *score)?;
                }
            }
        }

        let (mut graph, posterior_vars) = builder.build();
        let seed = self.lbp.rng_seed ^ cc.index() as u64;
        let engine = BeliefPropagation::new(self.lbp, seed);
        let (estimates, run) = engine.estimate_posteriors(&mut graph, &posterior_vars)?;

        let warning = if run.converged {
            None
        } else {
            warn!(
                "component {} did not converge within {} iterations (residual {:.3e})",
                cc.index(),
                run.iterations,
                run.residual
            );
            Some(ConvergenceWarning {
                cc: cc.index(),
                iterations: run.iterations,
                residual: run.residual,
            })
        };

        Ok(Some(CcPosteriors {
            posteriors: estimates
                .iter()
                .map(|e| (e.vertex, e.presence_probability()))
                .collect(),
            warning,
        }))
    }
}

/// Emits one group record per ProteinGroup vertex. All members of an
/// indistinguishable group share their posterior by construction; a
/// representative's score becomes the group probability.
pub struct AnnotateIndistGroupsFunctor;

impl CcFunctor for AnnotateIndistGroupsFunctor {
    type Output = Vec<IndistinguishableGroup>;

    fn run(&self, cc: CcView<'_>) -> Result<Self::Output, GraphError> {
        if cc.len() < 2 {
            return Ok(Vec::new());
        }
        let mut groups = Vec::new();
        for u in cc.vertices() {
            if cc.vertex(u).kind() != VertexKind::ProteinGroup {
                continue;
            }
            let mut members: Vec<(VertexIx, &str, f64)> = cc
                .neighbors(u)
                .iter()
                .filter_map(|&n| match cc.vertex(n) {
                    Vertex::Protein {
                        accession, score, ..
                    } => Some((n, accession.as_str(), *score)),
                    _ => None,
                })
                .collect();
            members.sort_unstable_by_key(|&(n, _, _)| n);
            let probability = members
                .last()
                .map(|&(_, _, score)| score)
                .ok_or_else(|| {
                    GraphError::Structural(format!(
                        "protein group vertex {} has no protein members",
                        u.0
                    ))
                })?;
            assert!(
                members
                    .iter()
                    .all(|&(_, _, score)| (score - probability).abs() < 1e-6),
                "indistinguishable group members must share a posterior"
            );
            groups.push(IndistinguishableGroup {
                accessions: members.iter().map(|&(_, acc, _)| acc.to_string()).collect(),
                probability,
            });
        }
        Ok(groups)
    }
}

/// Per-run diagnostics: non-fatal convergence warnings and the components
/// that failed. Failed components keep their previous scores.
#[derive(Debug, Clone, Default)]
pub struct InferenceOutcome {
    pub warnings: Vec<ConvergenceWarning>,
    pub failures: Vec<CcFailure>,
}

/// Run inference on every component at the given parameter point and write
/// protein posteriors back onto the identification graph.
pub fn run_inference(
    graph: &mut IdGraph,
    model: &ModelParams,
    lbp: &LbpSettings,
    cancel: &CancelToken,
) -> Result<InferenceOutcome, DriverError> {
    model.validate()?;
    lbp.validate()?;

    let functor = InferenceFunctor { model, lbp };
    let runs = graph.apply_functor_on_ccs(&functor, cancel);
    let total = runs.len();
    let mut outcome = InferenceOutcome::default();
    let mut completed = 0usize;
    let mut cancelled = false;

    for (cc, run) in runs.into_iter().enumerate() {
        match run {
            None => cancelled = true,
            Some(Ok(None)) => completed += 1,
            Some(Ok(Some(result))) => {
                completed += 1;
                for (vertex, posterior) in result.posteriors {
                    graph.set_posterior(vertex, posterior);
                }
                outcome.warnings.extend(result.warning);
            }
            Some(Err(error)) => {
                completed += 1;
                warn!("component {cc} failed: {error}");
                outcome.failures.push(CcFailure { cc, error });
            }
        }
    }

    if cancelled {
        return Err(DriverError::Cancelled {
            completed,
            total,
            outcome,
        });
    }
    Ok(outcome)
}

/// Collect indistinguishable group records across all components. Per-CC
/// failures are reported back, never aborting the remaining components.
pub fn annotate_indist_groups(
    graph: &IdGraph,
    cancel: &CancelToken,
) -> Result<(Vec<IndistinguishableGroup>, Vec<CcFailure>), DriverError> {
    let runs = graph.apply_functor_on_ccs(&AnnotateIndistGroupsFunctor, cancel);
    let total = runs.len();
    let mut groups = Vec::new();
    let mut failures = Vec::new();
    let mut completed = 0usize;
    let mut cancelled = false;
    for (cc, run) in runs.into_iter().enumerate() {
        match run {
            None => cancelled = true,
            Some(Ok(cc_groups)) => {
                completed += 1;
                groups.extend(cc_groups);
            }
            Some(Err(error)) => {
                completed += 1;
                warn!("group annotation failed on component {cc}: {error}");
                failures.push(CcFailure { cc, error });
            }
        }
    }
    if cancelled {
        return Err(DriverError::Cancelled {
            completed,
            total,
            outcome: InferenceOutcome {
                warnings: Vec::new(),
                failures,
            },
        });
    }
    Ok((groups, failures))
}

/// Result of the full pipeline: the chosen grid point, the diagnostics of
/// the final inference pass, and the annotated groups.
#[derive(Debug, Clone, Default)]
pub struct InferenceReport {
    pub best: Option<GridPoint>,
    pub outcome: InferenceOutcome,
    pub groups: Vec<IndistinguishableGroup>,
}

/// Grid-search the model hyperparameters against the FDR objective, re-run
/// inference at the argmax and annotate indistinguishable groups.
///
/// Expects a graph prepared by [`prepare_graph`] (components computed,
/// indistinguishable vertices clustered). Only configuration errors abort;
/// per-component failures are collected in the report.
pub fn infer_posterior_probabilities(
    graph: &mut IdGraph,
    settings: &InferenceSettings,
    scorer: &dyn ProteinScorer,
    cancel: &CancelToken,
) -> Result<InferenceReport, DriverError> {
    settings.validate()?;

    if settings.annotate_groups_only {
        let (groups, failures) = annotate_indist_groups(graph, cancel)?;
        return Ok(InferenceReport {
            best: None,
            outcome: InferenceOutcome {
                warnings: Vec::new(),
                failures,
            },
            groups,
        });
    }

    let grid = GridSearch::new(
        settings.param_optimize.alpha_grid.clone(),
        settings.param_optimize.beta_grid.clone(),
        settings.param_optimize.gamma_grid.clone(),
    );
    let lbp = settings.loopy_belief_propagation;
    let mut model = settings.model_parameters;

    let best = grid.evaluate(|alpha, beta, gamma| {
        model.pep_emission = alpha;
        model.pep_spurious_emission = beta;
        model.prot_prior = gamma;
        let outcome = run_inference(graph, &model, &lbp, cancel)?;
        if !outcome.failures.is_empty() {
            warn!(
                "{} components failed at (α={alpha}, β={beta}, γ={gamma})",
                outcome.failures.len()
            );
        }
        let objective = scorer.evaluate_protein_ids(&graph.protein_hits());
        info!("evaluated (α={alpha}, β={beta}, γ={gamma}): objective {objective:.6}");
        Ok::<f64, DriverError>(objective)
    })?;
    let best = best.expect("validated grids are non-empty");

    info!(
        "best parameters α={}, β={}, γ={} (objective {:.6}); running with best parameters again",
        best.alpha, best.beta, best.gamma, best.objective
    );
    model.pep_emission = best.alpha;
    model.pep_spurious_emission = best.beta;
    model.prot_prior = best.gamma;
    let mut outcome = run_inference(graph, &model, &lbp, cancel)?;
    let (groups, failures) = annotate_indist_groups(graph, cancel)?;
    outcome.failures.extend(failures);

    Ok(InferenceReport {
        best: Some(best),
        outcome,
        groups,
    })
}
