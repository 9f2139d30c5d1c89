//! Log-sum-exp helpers shared by the update kernels.
//!
//! Bias energies of different thermodynamic states can differ by hundreds of $k_B T$, so sums of
//! Boltzmann factors are always accumulated relative to the largest exponent seen so far.

/// $\ln \sum_i e^{x_i}$ of a slice; `-inf` for an empty slice or one that is all `-inf`
pub fn logsumexp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max == f64::INFINITY {
        return f64::INFINITY;
    }
    let sum: f64 = values.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

/// A streaming log-sum-exp
///
/// Stores the running maximum exponent and the sum of $e^{x - \max}$, so pushing a term never
/// exponentiates anything larger than one. Two accumulators over disjoint sets of terms can be
/// merged, which is how partial sums from parallel partitions of a trajectory are combined.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogSumExp {
    max: f64,
    scaled_sum: f64,
}

impl Default for LogSumExp {
    fn default() -> Self {
        Self {
            max: f64::NEG_INFINITY,
            scaled_sum: 0.0,
        }
    }
}

impl LogSumExp {
    /// An accumulator holding no terms; its value is `-inf`
    pub fn new() -> Self {
        Self::default()
    }

    /// Add $e^x$ to the sum
    pub fn push(&mut self, x: f64) {
        if x == f64::NEG_INFINITY {
            return;
        }
        if x > self.max {
            self.scaled_sum = self.scaled_sum * (self.max - x).exp() + 1.0;
            self.max = x;
        } else {
            self.scaled_sum += (x - self.max).exp();
        }
    }

    /// Add all terms of `other` to this sum
    pub fn merge(&mut self, other: &Self) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = *other;
            return;
        }
        if other.max > self.max {
            self.scaled_sum = self.scaled_sum * (self.max - other.max).exp() + other.scaled_sum;
            self.max = other.max;
        } else {
            self.scaled_sum += other.scaled_sum * (other.max - self.max).exp();
        }
    }

    /// True if nothing but `-inf` has been pushed
    pub fn is_empty(&self) -> bool {
        self.max == f64::NEG_INFINITY
    }

    /// $\ln \sum e^{x}$ over all pushed terms
    pub fn ln(&self) -> f64 {
        if self.is_empty() {
            f64::NEG_INFINITY
        } else {
            self.max + self.scaled_sum.ln()
        }
    }

    /// $\sum e^{x}$ over all pushed terms
    pub fn exp(&self) -> f64 {
        self.ln().exp()
    }
}

/// Merge a sequence of partial results pairwise
///
/// Neighbouring blocks are merged level by level, like a balanced binary tree whose leaves are in
/// the given order. The result only depends on the order of `blocks`, never on how they were
/// produced.
pub fn tree_merge<T, F>(mut blocks: Vec<T>, merge: F) -> Option<T>
where
    F: Fn(&mut T, T),
{
    while blocks.len() > 1 {
        let mut next = Vec::with_capacity((blocks.len() + 1) / 2);
        let mut iter = blocks.into_iter();
        while let Some(mut left) = iter.next() {
            if let Some(right) = iter.next() {
                merge(&mut left, right);
            }
            next.push(left);
        }
        blocks = next;
    }
    blocks.pop()
}
