use anyhow::Context;
use log::{info, warn};
use serde::Deserialize;
use std::time::Instant;

use protinfer_core::fdr::DecoyRocScorer;
use protinfer_core::graph::{CancelToken, PeptideIdentification, ProteinHit};
use protinfer_core::infer::{infer_posterior_probabilities, prepare_graph};

use crate::input::Search;
use crate::Runner;

/// Identification records as produced by an upstream search engine export:
/// the candidate protein list plus per-spectrum peptide identifications.
#[derive(Deserialize)]
pub struct IdentificationRecords {
    #[serde(default)]
    pub proteins: Vec<ProteinHit>,
    pub peptides: Vec<PeptideIdentification>,
}

impl Runner {
    pub fn new(parameters: Search) -> anyhow::Result<Self> {
        Ok(Self {
            parameters,
            start: Instant::now(),
        })
    }

    pub fn run(self) -> anyhow::Result<()> {
        let path = &self.parameters.identifications;
        let records: IdentificationRecords = protinfer_core::read_json(path)
            .with_context(|| format!("failed to load identifications from `{path}`"))?;
        info!(
            "loaded {} proteins and {} identified spectra from `{}`",
            records.proteins.len(),
            records.peptides.len(),
            path
        );

        let time = Instant::now();
        let mut graph = prepare_graph(
            &records.proteins,
            &records.peptides,
            &self.parameters.settings,
        )
        .context("identification graph construction failed")?;
        info!(
            "prepared identification graph in {}ms",
            time.elapsed().as_millis()
        );

        let scorer = DecoyRocScorer::new(self.parameters.settings.param_optimize.aucweight);
        let report = infer_posterior_probabilities(
            &mut graph,
            &self.parameters.settings,
            &scorer,
            &CancelToken::new(),
        )?;

        if !report.outcome.warnings.is_empty() {
            warn!(
                "{} connected components did not converge; their last marginals were kept",
                report.outcome.warnings.len()
            );
        }
        for failure in &report.outcome.failures {
            warn!("component {} failed: {}", failure.cc, failure.error);
        }

        let paths = self.write_products(&graph, &report)?;
        for path in paths {
            info!("wrote {}", path);
        }

        info!("finished in {}s", self.start.elapsed().as_secs());
        Ok(())
    }
}
