use thiserror::Error;

/// A configuration parameter outside its declared range. Aborts the whole
/// run before any inference happens.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("parameter `{name}` = {value} outside [{min}, {max}]")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("parameter `{name}` must be strictly positive, got {value}")]
    NotPositive { name: &'static str, value: f64 },
    #[error("grid for `{name}` is empty")]
    EmptyGrid { name: &'static str },
}

/// Errors raised while processing a single connected component. These are
/// captured per component and never abort the driver.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    /// The identification graph violates a construction invariant
    /// (e.g. a PSM without peptide evidence, or an orphaned group vertex).
    #[error("structural error: {0}")]
    Structural(String),

    /// A message update assigned zero probability mass everywhere. The model
    /// is inconsistent for this component.
    #[error("numeric error: {0}")]
    Numeric(String),
}

/// Loopy belief propagation exhausted its iteration budget on one component
/// without meeting the convergence threshold. Non-fatal: the marginals at
/// the point of termination are used.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceWarning {
    /// Index of the connected component.
    pub cc: usize,
    /// Iterations spent before giving up.
    pub iterations: u64,
    /// Largest pending message delta at termination.
    pub residual: f64,
}

/// A connected component that could not be processed.
#[derive(Debug, Clone, PartialEq)]
pub struct CcFailure {
    pub cc: usize,
    pub error: GraphError,
}

/// Errors surfacing from the connected-component driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A cancel request arrived mid-run. Posteriors for the components that
    /// finished were already written back; the partial outcome is attached.
    #[error("inference cancelled after {completed} of {total} connected components")]
    Cancelled {
        completed: usize,
        total: usize,
        outcome: crate::infer::InferenceOutcome,
    },
}
