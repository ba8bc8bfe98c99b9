//! Factor kinds of the Bayesian protein inference model and the factory
//! that builds them.
//!
//! The model has four factor kinds: a protein prior, a PSM evidence factor,
//! a noisy-OR "sum evidence" factor linking the number of present parent
//! evidences to the observation of a PSM, and a deterministic probabilistic
//! adder whose output variable is the integer sum of its parents. Adders are
//! never materialized as tables (the table would be exponential in the
//! number of parents); they answer message queries by (de)convolution.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, GraphError};
use crate::pmf::{convolve_many, Pmf};

/// Model hyperparameters of the Bayesian network.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Protein prior probability (the gamma parameter).
    #[serde(default = "default_prot_prior")]
    pub prot_prior: f64,
    /// Peptide emission probability (the alpha parameter): chance that a
    /// present protein produces an observed peptide.
    #[serde(default = "default_pep_emission")]
    pub pep_emission: f64,
    /// Spurious emission probability (the beta parameter): chance that a
    /// peptide is observed with no present parent protein. Usually much
    /// smaller than the emission probability.
    #[serde(default = "default_pep_spurious_emission")]
    pub pep_spurious_emission: f64,
}

fn default_prot_prior() -> f64 {
    0.9
}

fn default_pep_emission() -> f64 {
    0.1
}

fn default_pep_spurious_emission() -> f64 {
    0.001
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            prot_prior: default_prot_prior(),
            pep_emission: default_pep_emission(),
            pep_spurious_emission: default_pep_spurious_emission(),
        }
    }
}

impl ModelParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("model_parameters:prot_prior", self.prot_prior),
            ("model_parameters:pep_emission", self.pep_emission),
            (
                "model_parameters:pep_spurious_emission",
                self.pep_spurious_emission,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange {
                    name,
                    value,
                    min: 0.0,
                    max: 1.0,
                });
            }
        }
        Ok(())
    }
}

/// Dense two-dimensional factor table: `rows × 2` (integer parent value by
/// binary child value).
#[derive(Debug, Clone, PartialEq)]
pub struct Table2 {
    rows: usize,
    data: Vec<f64>,
}

impl Table2 {
    fn from_rows(rows: Vec<[f64; 2]>) -> Self {
        Self {
            rows: rows.len(),
            data: rows.into_iter().flatten().collect(),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        debug_assert!(col < 2);
        self.data[row * 2 + col]
    }

    /// Sum out the given axis: axis 0 collapses the parent dimension
    /// (leaving a PMF over the child), axis 1 collapses the child.
    pub fn marginalize(&self, axis: usize) -> Result<Pmf, GraphError> {
        match axis {
            0 => Pmf::new(
                0,
                vec![
                    (0..self.rows).map(|r| self.get(r, 0)).sum(),
                    (0..self.rows).map(|r| self.get(r, 1)).sum(),
                ],
            ),
            1 => Pmf::new(
                0,
                (0..self.rows).map(|r| self.get(r, 0) + self.get(r, 1)).collect(),
            ),
            _ => Err(GraphError::Structural(format!(
                "cannot marginalize axis {axis} of a two-dimensional table"
            ))),
        }
    }
}

/// One factor of the inference graph. Adjacent-variable order is fixed by
/// the builder: `SumEvidence` is `[parent, child]`, `Adder` is
/// `[parents.., out]`.
#[derive(Debug, Clone, PartialEq)]
pub enum FactorKind {
    /// Unary prior on a binary protein variable.
    Prior { table: [f64; 2] },
    /// Unary evidence on a binary PSM variable from its search-engine score.
    Evidence { table: [f64; 2] },
    /// Noisy-OR over the integer evidence-sum parent of a PSM.
    SumEvidence { table: Table2 },
    /// Deterministic sum of the parent variables; parametric, never tabled.
    Adder,
}

impl FactorKind {
    /// Compute the factor-to-variable message toward the adjacent variable
    /// at position `target`, given the variable-to-factor messages of all
    /// adjacent variables (in adjacency order) and the target's support.
    pub fn message_to(
        &self,
        target: usize,
        incoming: &[&Pmf],
        support: (i32, i32),
    ) -> Result<Pmf, GraphError> {
        match self {
            FactorKind::Prior { table } | FactorKind::Evidence { table } => {
                debug_assert_eq!(target, 0);
                Pmf::new(0, table.to_vec())
            }
            FactorKind::SumEvidence { table } => {
                let n = table.rows() as i32 - 1;
                match target {
                    // toward the binary child: marginalize the parent
                    1 => {
                        let parent = incoming[0];
                        let child = |c: usize| {
                            (0..=n)
                                .map(|k| table.get(k as usize, c) * parent.get(k))
                                .sum()
                        };
                        Pmf::new(0, vec![child(0), child(1)])
                    }
                    // toward the evidence-sum parent: marginalize the child
                    0 => {
                        let child = incoming[1];
                        let rows = (0..=n)
                            .map(|k| {
                                table.get(k as usize, 0) * child.get(0)
                                    + table.get(k as usize, 1) * child.get(1)
                            })
                            .collect();
                        Pmf::new(0, rows)?.restrict(support.0, support.1)
                    }
                    _ => Err(GraphError::Structural(format!(
                        "sum-evidence factor has no variable at position {target}"
                    ))),
                }
            }
            FactorKind::Adder => {
                let out = incoming.len() - 1;
                if target == out {
                    // forward query: distribution of the parents' sum
                    convolve_many(&incoming[..out])?.restrict(support.0, support.1)
                } else {
                    // reverse query: subtract the siblings' sum from the
                    // output belief
                    let siblings: Vec<&Pmf> = incoming[..out]
                        .iter()
                        .enumerate()
                        .filter(|&(i, _)| i != target)
                        .map(|(_, p)| *p)
                        .collect();
                    let rest = convolve_many(&siblings)?;
                    incoming[out]
                        .correlate(&rest)?
                        .restrict(support.0, support.1)
                }
            }
        }
    }
}

/// Builds the factor kinds for the current hyperparameter point.
///
/// Holds the marginalization exponent as well: 1 selects sum-product
/// semantics, the limit toward infinity would select max-product, which is
/// reserved for future use.
#[derive(Debug, Clone)]
pub struct MessagePasserFactory {
    alpha: f64,
    beta: f64,
    gamma: f64,
    marginalization_power: f64,
}

impl MessagePasserFactory {
    pub fn new(params: &ModelParams) -> Self {
        Self {
            alpha: params.pep_emission,
            beta: params.pep_spurious_emission,
            gamma: params.prot_prior,
            marginalization_power: 1.0,
        }
    }

    pub fn marginalization_power(&self) -> f64 {
        self.marginalization_power
    }

    /// Unary prior on a protein variable. `prior` overrides the global
    /// gamma, the extension point for priors derived from missing
    /// theoretical peptides.
    pub fn protein_factor(&self, prior: Option<f64>) -> FactorKind {
        let gamma = prior.unwrap_or(self.gamma);
        FactorKind::Prior {
            table: [1.0 - gamma, gamma],
        }
    }

    /// Unary evidence on a PSM variable from its peptide-level probability.
    pub fn peptide_evidence_factor(&self, score: f64) -> Result<FactorKind, GraphError> {
        if !(0.0..=1.0).contains(&score) {
            return Err(GraphError::Structural(format!(
                "PSM score {score} outside [0, 1]"
            )));
        }
        Ok(FactorKind::Evidence {
            table: [1.0 - score, score],
        })
    }

    /// Noisy-OR linking the evidence-sum parent of a PSM to its binary
    /// observation: `P(psm = 1 | sum = k) = 1 − (1−α)^k · (1−β)`, which is
    /// the spurious emission β at `k = 0`.
    pub fn sum_evidence_factor(&self, evidences: usize) -> Result<FactorKind, GraphError> {
        if evidences == 0 {
            return Err(GraphError::Structural(
                "PSM with zero peptide evidences".into(),
            ));
        }
        let rows = (0..=evidences)
            .map(|k| {
                let silent = (1.0 - self.alpha).powi(k as i32) * (1.0 - self.beta);
                [silent, 1.0 - silent]
            })
            .collect();
        Ok(FactorKind::SumEvidence {
            table: Table2::from_rows(rows),
        })
    }

    /// Deterministic adder: the output variable equals the integer sum of
    /// its parents.
    pub fn probabilistic_adder_factor(&self) -> FactorKind {
        FactorKind::Adder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    fn factory() -> MessagePasserFactory {
        MessagePasserFactory::new(&ModelParams {
            prot_prior: 0.5,
            pep_emission: 0.1,
            pep_spurious_emission: 0.001,
        })
    }

    #[test]
    fn prior_table_holds_gamma() {
        let f = factory().protein_factor(None);
        match f {
            FactorKind::Prior { table } => {
                assert!((table[1] - 0.5).abs() < EPS);
                assert!((table[0] - 0.5).abs() < EPS);
            }
            _ => panic!("expected prior"),
        }
    }

    #[test]
    fn prior_override_wins() {
        match factory().protein_factor(Some(0.25)) {
            FactorKind::Prior { table } => assert!((table[1] - 0.25).abs() < EPS),
            _ => panic!("expected prior"),
        }
    }

    #[test]
    fn sum_evidence_rows_follow_noisy_or() {
        let f = factory().sum_evidence_factor(2).unwrap();
        match f {
            FactorKind::SumEvidence { table } => {
                assert_eq!(table.rows(), 3);
                // k = 0: spurious emission only
                assert!((table.get(0, 1) - 0.001).abs() < EPS);
                // k = 1: 1 − 0.9 · 0.999
                assert!((table.get(1, 1) - 0.1009).abs() < EPS);
                // k = 2: 1 − 0.81 · 0.999
                assert!((table.get(2, 1) - 0.19081).abs() < EPS);
            }
            _ => panic!("expected sum evidence"),
        }
    }

    #[test]
    fn zero_evidences_is_structural() {
        assert!(matches!(
            factory().sum_evidence_factor(0),
            Err(GraphError::Structural(_))
        ));
    }

    #[test]
    fn adder_forward_message_is_convolution() {
        let a = Pmf::new(0, vec![0.5, 0.5]).unwrap();
        let b = Pmf::new(0, vec![0.5, 0.5]).unwrap();
        let out = Pmf::uniform(0, 2);
        let msg = FactorKind::Adder
            .message_to(2, &[&a, &b, &out], (0, 2))
            .unwrap();
        assert!((msg.get(0) - 0.25).abs() < EPS);
        assert!((msg.get(1) - 0.5).abs() < EPS);
        assert!((msg.get(2) - 0.25).abs() < EPS);
    }

    #[test]
    fn adder_reverse_message_deconvolves() {
        // out is pinned to 1 and the sibling is pinned to 0, so the target
        // parent must be 1
        let sibling = Pmf::new(0, vec![1.0, 0.0]).unwrap();
        let target = Pmf::uniform(0, 1);
        let out = Pmf::new(0, vec![0.0, 1.0, 0.0]).unwrap();
        let msg = FactorKind::Adder
            .message_to(0, &[&target, &sibling, &out], (0, 1))
            .unwrap();
        assert!(msg.get(1) > 1.0 - 1e-9);
    }

    #[test]
    fn sum_evidence_child_message_mixes_rows() {
        let f = factory().sum_evidence_factor(1).unwrap();
        // parent known present
        let parent = Pmf::new(0, vec![0.0, 1.0]).unwrap();
        let child = Pmf::uniform(0, 1);
        let msg = f.message_to(1, &[&parent, &child], (0, 1)).unwrap();
        assert!((msg.get(1) - 0.1009).abs() < 1e-9);
    }

    #[test]
    fn table_marginalization_axes() {
        let f = factory().sum_evidence_factor(1).unwrap();
        let FactorKind::SumEvidence { table } = f else {
            panic!("expected sum evidence");
        };
        let over_child = table.marginalize(1).unwrap();
        assert_eq!(over_child.last_support(), 1);
        let over_parent = table.marginalize(0).unwrap();
        assert_eq!(over_parent.last_support(), 1);
    }
}
