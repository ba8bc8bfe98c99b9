//! Cartesian grid search over the three model hyperparameters.

use serde::Serialize;

/// The winning grid point and its objective value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GridPoint {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub objective: f64,
    /// Positions within the three candidate vectors.
    #[serde(skip_serializing)]
    pub indices: [usize; 3],
}

/// Scans `alpha × beta × gamma` in lexicographic order and keeps the
/// argmax; on ties the lexicographically smallest point wins.
#[derive(Debug, Clone)]
pub struct GridSearch {
    alpha: Vec<f64>,
    beta: Vec<f64>,
    gamma: Vec<f64>,
}

impl GridSearch {
    pub fn new(alpha: Vec<f64>, beta: Vec<f64>, gamma: Vec<f64>) -> Self {
        Self { alpha, beta, gamma }
    }

    pub fn len(&self) -> usize {
        self.alpha.len() * self.beta.len() * self.gamma.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluate the objective at every grid point. Larger is better; the
    /// evaluator's error aborts the scan.
    pub fn evaluate<E>(
        &self,
        mut objective: impl FnMut(f64, f64, f64) -> Result<f64, E>,
    ) -> Result<Option<GridPoint>, E> {
        let mut best: Option<GridPoint> = None;
        for (i, &alpha) in self.alpha.iter().enumerate() {
            for (j, &beta) in self.beta.iter().enumerate() {
                for (k, &gamma) in self.gamma.iter().enumerate() {
                    let value = objective(alpha, beta, gamma)?;
                    if best.map_or(true, |b| value > b.objective) {
                        best = Some(GridPoint {
                            alpha,
                            beta,
                            gamma,
                            objective: value,
                            indices: [i, j, k],
                        });
                    }
                }
            }
        }
        Ok(best)
    }
}
