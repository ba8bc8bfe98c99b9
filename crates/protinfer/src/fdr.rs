//! Scalar FDR objective driving the hyperparameter grid search.
//!
//! The default scorer blends two signals over the target/decoy protein
//! ranking: a partial ROC AUC (how well targets rank above decoys, counted
//! until a fixed number of decoys) and the calibration of the posteriors
//! (agreement of the estimated FDR, a running mean of 1 − posterior, with
//! the empirical decoy-based FDR).

use log::warn;

use crate::graph::ProteinHit;

/// Downstream collaborator consumed by the grid search: maps the current
/// protein scores to a scalar objective, larger is better.
pub trait ProteinScorer: Sync {
    fn evaluate_protein_ids(&self, proteins: &[ProteinHit]) -> f64;
}

/// Target/decoy ROC and calibration blend, weighted by `auc_weight`
/// (0 = calibration only, 1 = AUC only).
#[derive(Debug, Clone, Copy)]
pub struct DecoyRocScorer {
    pub auc_weight: f64,
    /// ROC is integrated until this many decoys have been seen.
    pub decoy_cutoff: usize,
}

impl DecoyRocScorer {
    pub fn new(auc_weight: f64) -> Self {
        Self {
            auc_weight,
            decoy_cutoff: 50,
        }
    }
}

impl Default for DecoyRocScorer {
    fn default() -> Self {
        Self::new(0.2)
    }
}

impl ProteinScorer for DecoyRocScorer {
    fn evaluate_protein_ids(&self, proteins: &[ProteinHit]) -> f64 {
        if proteins.is_empty() {
            return 0.0;
        }
        let mut order: Vec<usize> = (0..proteins.len()).collect();
        order.sort_by(|&a, &b| proteins[b].score.total_cmp(&proteins[a].score));

        let targets_total = proteins.iter().filter(|p| !p.decoy).count();
        if targets_total == 0 || targets_total == proteins.len() {
            warn!("protein list has no target/decoy contrast, objective is uninformative");
            return self.auc_weight;
        }

        let mut targets = 0usize;
        let mut decoys = 0usize;
        let mut pep_sum = 0.0f64;
        let mut auc_sum = 0.0f64;
        let mut calibration = 0.0f64;
        for (rank, &i) in order.iter().enumerate() {
            let hit = &proteins[i];
            pep_sum += 1.0 - hit.score;
            if hit.decoy {
                decoys += 1;
                if decoys <= self.decoy_cutoff {
                    auc_sum += targets as f64 / targets_total as f64;
                }
            } else {
                targets += 1;
            }
            // estimated FDR from posteriors vs empirical decoy-based FDR
            let estimated = pep_sum / (rank + 1) as f64;
            let empirical = decoys as f64 / (rank + 1) as f64;
            calibration += (estimated - empirical).abs();
        }

        let roc = auc_sum / self.decoy_cutoff.min(decoys).max(1) as f64;
        let calibration_error = (calibration / proteins.len() as f64).clamp(0.0, 1.0);
        self.auc_weight * roc + (1.0 - self.auc_weight) * (1.0 - calibration_error)
    }
}
