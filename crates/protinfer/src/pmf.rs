//! Finite-support probability mass functions over integer domains.
//!
//! Every message and marginal belief exchanged during belief propagation is a
//! [`Pmf`]: a contiguous probability table indexed by
//! `first_support..=last_support`, zero outside that window. All exported
//! operations leave the table normalized; a zero-mass normalization is a
//! model error and surfaces as [`GraphError::Numeric`].

use crate::error::GraphError;

/// Total mass below this is considered zero when normalizing.
const MIN_MASS: f64 = 1e-300;

/// Adders switch to log-space accumulation above this arity to avoid
/// underflow in long convolution chains.
pub(crate) const LOG_SPACE_ARITY: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct Pmf {
    first: i32,
    table: Vec<f64>,
}

impl Pmf {
    /// Build from a raw (non-negative) table, normalizing to sum 1.
    pub fn new(first: i32, table: Vec<f64>) -> Result<Self, GraphError> {
        debug_assert!(!table.is_empty());
        let mut pmf = Self { first, table };
        pmf.normalize()?;
        Ok(pmf)
    }

    /// Uniform distribution over `first..=last`.
    pub fn uniform(first: i32, last: i32) -> Self {
        debug_assert!(first <= last);
        let n = (last - first + 1) as usize;
        Self {
            first,
            table: vec![1.0 / n as f64; n],
        }
    }

    pub fn first_support(&self) -> i32 {
        self.first
    }

    pub fn last_support(&self) -> i32 {
        self.first + self.table.len() as i32 - 1
    }

    pub fn table(&self) -> &[f64] {
        &self.table
    }

    /// Probability at index `i`; zero outside the support window.
    pub fn get(&self, i: i32) -> f64 {
        if i < self.first {
            return 0.0;
        }
        self.table
            .get((i - self.first) as usize)
            .copied()
            .unwrap_or(0.0)
    }

    fn normalize(&mut self) -> Result<(), GraphError> {
        let sum: f64 = self.table.iter().sum();
        if !(sum > MIN_MASS && sum.is_finite()) {
            return Err(GraphError::Numeric(format!(
                "cannot normalize distribution over [{}, {}] with total mass {}",
                self.first,
                self.last_support(),
                sum
            )));
        }
        let inv = 1.0 / sum;
        for p in &mut self.table {
            *p *= inv;
        }
        Ok(())
    }

    /// Pointwise product over the intersection of supports, renormalized.
    /// Fails if the supports are disjoint or the product has no mass.
    pub fn product(&self, other: &Pmf) -> Result<Pmf, GraphError> {
        let first = self.first.max(other.first);
        let last = self.last_support().min(other.last_support());
        if first > last {
            return Err(GraphError::Numeric(format!(
                "pointwise product of disjoint supports [{}, {}] and [{}, {}]",
                self.first,
                self.last_support(),
                other.first,
                other.last_support()
            )));
        }
        let table = (first..=last).map(|i| self.get(i) * other.get(i)).collect();
        Pmf::new(first, table)
    }

    /// Discrete convolution: the distribution of the sum of two independent
    /// variables. Support is `[a.first + b.first, a.last + b.last]`.
    pub fn convolve(&self, other: &Pmf) -> Result<Pmf, GraphError> {
        let first = self.first + other.first;
        let mut table = vec![0.0; self.table.len() + other.table.len() - 1];
        for (i, a) in self.table.iter().enumerate() {
            for (j, b) in other.table.iter().enumerate() {
                table[i + j] += a * b;
            }
        }
        Pmf::new(first, table)
    }

    /// Cross-correlation `r(x) = Σ_y self(x + y) · other(y)`: the
    /// distribution of `X − Y`. This is the reverse query of [`convolve`]:
    /// subtracting the siblings' sum from an adder's output message.
    ///
    /// [`convolve`]: Pmf::convolve
    pub fn correlate(&self, other: &Pmf) -> Result<Pmf, GraphError> {
        let first = self.first - other.last_support();
        let last = self.last_support() - other.first;
        let table = (first..=last)
            .map(|x| {
                other
                    .table
                    .iter()
                    .enumerate()
                    .map(|(j, b)| self.get(x + other.first + j as i32) * b)
                    .sum()
            })
            .collect();
        Pmf::new(first, table)
    }

    /// Restrict to the window `[first, last]` and renormalize.
    pub fn restrict(&self, first: i32, last: i32) -> Result<Pmf, GraphError> {
        let f = self.first.max(first);
        let l = self.last_support().min(last);
        if f > l {
            return Err(GraphError::Numeric(format!(
                "support [{}, {}] does not intersect window [{}, {}]",
                self.first,
                self.last_support(),
                first,
                last
            )));
        }
        Pmf::new(f, (f..=l).map(|i| self.get(i)).collect())
    }

    /// L∞ distance over the union of supports. Drives both the priority
    /// scheduler and the convergence test.
    pub fn linf_distance(&self, other: &Pmf) -> f64 {
        let first = self.first.min(other.first);
        let last = self.last_support().max(other.last_support());
        (first..=last)
            .map(|i| (self.get(i) - other.get(i)).abs())
            .fold(0.0, f64::max)
    }

    /// Convex combination `λ·old + (1−λ)·new` over the union of supports.
    pub fn dampen(old: &Pmf, new: &Pmf, lambda: f64) -> Pmf {
        if lambda == 0.0 {
            return new.clone();
        }
        let first = old.first.min(new.first);
        let last = old.last_support().max(new.last_support());
        let mut table: Vec<f64> = (first..=last)
            .map(|i| lambda * old.get(i) + (1.0 - lambda) * new.get(i))
            .collect();
        // both inputs sum to one, so the combination does too up to rounding
        let sum: f64 = table.iter().sum();
        if sum > MIN_MASS && sum.is_finite() {
            let inv = 1.0 / sum;
            for p in &mut table {
                *p *= inv;
            }
        }
        Pmf { first, table }
    }
}

/// Convolution of a sequence of distributions. Beyond [`LOG_SPACE_ARITY`]
/// factors the accumulation runs in log space.
pub(crate) fn convolve_many(pmfs: &[&Pmf]) -> Result<Pmf, GraphError> {
    match pmfs {
        [] => Pmf::new(0, vec![1.0]),
        [one] => Ok((*one).clone()),
        _ if pmfs.len() <= LOG_SPACE_ARITY => {
            let mut acc = pmfs[0].clone();
            for p in &pmfs[1..] {
                acc = acc.convolve(p)?;
            }
            Ok(acc)
        }
        _ => convolve_many_ln(pmfs),
    }
}

fn convolve_many_ln(pmfs: &[&Pmf]) -> Result<Pmf, GraphError> {
    let mut first = 0i32;
    let mut acc: Vec<f64> = vec![0.0];
    for p in pmfs {
        let mut next = vec![f64::NEG_INFINITY; acc.len() + p.table().len() - 1];
        for (i, &la) in acc.iter().enumerate() {
            if la == f64::NEG_INFINITY {
                continue;
            }
            for (j, &b) in p.table().iter().enumerate() {
                if b <= 0.0 {
                    continue;
                }
                let cell = &mut next[i + j];
                *cell = logaddexp(*cell, la + b.ln());
            }
        }
        acc = next;
        first += p.first_support();
    }
    let max = acc.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return Err(GraphError::Numeric(
            "zero mass in adder convolution".into(),
        ));
    }
    Pmf::new(first, acc.iter().map(|&v| (v - max).exp()).collect())
}

fn logaddexp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}
