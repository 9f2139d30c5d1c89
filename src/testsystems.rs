//! Synthetic multi-ensemble Markov chains with known answers.

use crate::errors::*;
use ndarray::{Array1, Array2, Array3, Axis};
use rand::Rng;

/// Test cases using Metropolis chains on a line of discrete states.
///
/// Every thermodynamic state `k` is a nearest-neighbour Metropolis-Hastings chain on the
/// configurational states `0..M` whose stationary distribution is proportional to
/// `exp(-energies[k, i])`. Thermodynamic state 0 is the unbiased reference; the bias of state `k`
/// is `energies[k, i] - energies[0, i]`.
///
/// # Examples
///
/// ```
/// use tram_rs::testsystems::*;
/// use ndarray::array;
/// use rand::{rngs::StdRng, SeedableRng};
///
/// let chain = MetropolisChain::builder()
///     .energies(array![[0.0, 1.0, 0.5], [0.5, 0.0, 1.5]])
///     .build()
///     .unwrap();
/// let mut rng = StdRng::seed_from_u64(7);
/// let Sample { count_matrices, state_counts, state_sequence, bias_sequence } =
///     chain.sample(100, 0, &mut rng).unwrap();
/// assert_eq!(state_sequence.len(), 2 * 101);
/// ```
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(validate = "Self::validate", name = "build_inner", private))]
pub struct MetropolisChain {
    /// `energies[k, i]` is the reduced energy of configurational state `i` in thermodynamic
    /// state `k`
    energies: Array2<f64>,
}

impl MetropolisChainBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(energies) = &self.energies {
            if energies.is_empty() {
                return Err(format!(
                    "energies must have at least one thermodynamic and one configurational state (not {:?})",
                    energies.shape()
                ));
            }
            if energies.iter().any(|e| !e.is_finite()) {
                return Err("energies must be finite".to_string());
            }
        }

        Ok(())
    }

    /// Build the test case
    pub fn build(&self) -> Result<MetropolisChain> {
        Ok(self.build_inner()?)
    }
}

impl MetropolisChain {
    /// Get a new builder for the `MetropolisChain` struct
    pub fn builder() -> MetropolisChainBuilder {
        MetropolisChainBuilder::default()
    }

    /// Draw random energies: `-ln u` with `u` uniform in (0, 1], plus a uniform random offset
    /// for every thermodynamic state but the first
    pub fn random<R: Rng + ?Sized>(
        n_therm_states: usize,
        n_conf_states: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let mut energies = Array2::zeros((n_therm_states, n_conf_states));
        for (k, mut row) in energies.axis_iter_mut(Axis(0)).enumerate() {
            let offset = if k > 0 { rng.gen::<f64>() } else { 0.0 };
            for e in row.iter_mut() {
                *e = -(1.0 - rng.gen::<f64>()).ln() + offset;
            }
        }
        Self::builder().energies(energies).build()
    }

    /// $K$, the number of thermodynamic states
    pub fn n_therm_states(&self) -> usize {
        self.energies.nrows()
    }

    /// $M$, the number of configurational states
    pub fn n_conf_states(&self) -> usize {
        self.energies.ncols()
    }

    /// `energies[k, i]` is the reduced energy of configurational state `i` in thermodynamic
    /// state `k`
    pub fn energies(&self) -> &Array2<f64> {
        &self.energies
    }

    /// `transition_matrices[k, i, j]` is the probability to hop from `i` to `j` in thermodynamic
    /// state `k`
    ///
    /// A move to either neighbour is proposed with probability 1/2 (at the ends of the line,
    /// proposing to stay takes the place of the missing neighbour) and accepted with probability
    /// `min(1, exp(-(E_j - E_i)))`.
    pub fn transition_matrices(&self) -> Array3<f64> {
        let (n_therm_states, n) = self.energies.dim();
        let mut transition_matrices = Array3::zeros((n_therm_states, n, n));
        for k in 0..n_therm_states {
            for i in 0..n {
                let mut off_diagonal = 0.0;
                for j in 0..n {
                    let proposed = i + 1 == j || j + 1 == i;
                    if !proposed {
                        continue;
                    }
                    let uphill = (self.energies[[k, j]] - self.energies[[k, i]]).max(0.0);
                    let p = 0.5 * (-uphill).exp();
                    transition_matrices[[k, i, j]] = p;
                    off_diagonal += p;
                }
                transition_matrices[[k, i, i]] = 1.0 - off_diagonal;
            }
        }
        transition_matrices
    }

    /// Run one chain of `n_samples` steps from `initial_state` in every thermodynamic state
    ///
    /// The chains are concatenated in thermodynamic state order, so the sample holds
    /// `K * (n_samples + 1)` frames.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        n_samples: usize,
        initial_state: usize,
        rng: &mut R,
    ) -> Result<Sample> {
        let (n_therm_states, n_conf_states) = self.energies.dim();
        if initial_state >= n_conf_states {
            return Err(TramError::StateOutOfRange {
                frame: 0,
                state: initial_state,
                n_conf_states,
            });
        }

        let transition_matrices = self.transition_matrices();
        let seq_length = n_therm_states * (n_samples + 1);
        let mut count_matrices = Array3::zeros((n_therm_states, n_conf_states, n_conf_states));
        let mut state_counts = Array2::zeros((n_therm_states, n_conf_states));
        let mut state_sequence = Vec::with_capacity(seq_length);

        for k in 0..n_therm_states {
            let mut x = initial_state;
            state_counts[[k, x]] += 1;
            state_sequence.push(x);
            for _ in 0..n_samples {
                let row = transition_matrices.slice(ndarray::s![k, x, ..]);
                let x_new = tower_sample(row.iter().copied(), rng);
                count_matrices[[k, x, x_new]] += 1;
                x = x_new;
                state_counts[[k, x]] += 1;
                state_sequence.push(x);
            }
        }

        let state_sequence = Array1::from(state_sequence);
        let bias_sequence = Array2::from_shape_fn((seq_length, n_therm_states), |(t, k)| {
            let i = state_sequence[t];
            self.energies[[k, i]] - self.energies[[0, i]]
        });

        Ok(Sample {
            count_matrices,
            state_counts,
            state_sequence,
            bias_sequence,
        })
    }
}

/// Draw an index with probability proportional to its weight
fn tower_sample<I, R>(weights: I, rng: &mut R) -> usize
where
    I: Iterator<Item = f64> + Clone,
    R: Rng + ?Sized,
{
    let total: f64 = weights.clone().sum();
    let target = rng.gen::<f64>() * total;
    let mut cumulative = 0.0;
    let mut last = 0;
    for (idx, weight) in weights.enumerate() {
        if weight <= 0.0 {
            continue;
        }
        cumulative += weight;
        last = idx;
        if target < cumulative {
            return idx;
        }
    }
    last
}

/// A sample from a test case
#[derive(Debug, Clone)]
pub struct Sample {
    /// `count_matrices[k, i, j]` is the number of `i -> j` transitions in thermodynamic state `k`
    pub count_matrices: Array3<usize>,
    /// `state_counts[k, i]` is the number of frames in `i` sampled in thermodynamic state `k`
    pub state_counts: Array2<usize>,
    /// `state_sequence[t]` is the configurational state of frame `t`
    pub state_sequence: Array1<usize>,
    /// `bias_sequence[t, k]` is the reduced bias energy of frame `t` in thermodynamic state `k`
    pub bias_sequence: Array2<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn build_chain() {
        let chain = MetropolisChain::builder()
            .energies(array![[0.0, 1.0], [1.0, 0.0]])
            .build()
            .unwrap();
        assert_eq!(chain.n_therm_states(), 2);
        assert_eq!(chain.n_conf_states(), 2);

        let err = MetropolisChain::builder()
            .energies(Array2::zeros((0, 3)))
            .build()
            .unwrap_err();
        assert!(matches!(err, TramError::BuilderError(_)));
    }

    #[test]
    fn transition_matrices_satisfy_detailed_balance() {
        let mut rng = StdRng::seed_from_u64(11);
        let chain = MetropolisChain::random(3, 5, &mut rng).unwrap();
        let t = chain.transition_matrices();
        let e = chain.energies();
        for k in 0..3 {
            for i in 0..5 {
                let row_sum: f64 = (0..5).map(|j| t[[k, i, j]]).sum();
                assert!((row_sum - 1.0).abs() < 1e-12);
                for j in 0..5 {
                    let forward = (-e[[k, i]]).exp() * t[[k, i, j]];
                    let backward = (-e[[k, j]]).exp() * t[[k, j, i]];
                    assert!((forward - backward).abs() < 1e-12);
                }
            }
        }
    }

    #[test]
    fn samples_are_self_consistent() {
        let mut rng = StdRng::seed_from_u64(3);
        let chain = MetropolisChain::random(2, 4, &mut rng).unwrap();
        let sample = chain.sample(500, 0, &mut rng).unwrap();

        assert_eq!(sample.state_sequence.len(), 2 * 501);
        assert_eq!(sample.bias_sequence.dim(), (2 * 501, 2));
        assert_eq!(sample.state_counts.sum(), 2 * 501);
        assert_eq!(sample.count_matrices.sum(), 2 * 500);
        assert!(sample.bias_sequence.column(0).iter().all(|&b| b == 0.0));
        for (t, &i) in sample.state_sequence.iter().enumerate() {
            let expected = chain.energies()[[1, i]] - chain.energies()[[0, i]];
            assert_eq!(sample.bias_sequence[[t, 1]], expected);
        }
    }
}
