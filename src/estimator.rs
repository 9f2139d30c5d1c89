//! Fixed-point driver alternating the two TRAM updates.

use crate::errors::*;
use crate::tram_direct::{
    estimate_free_energies, estimate_transition_matrices, init_lagrangian_mult,
    log_likelihood_lower_bound, update_biased_conf_weights_into, update_lagrangian_mult_into,
    FreeEnergies,
};
use ndarray::{Array1, Array2, Array3, Axis, Zip};
use tracing::{debug, info, warn};

/// Transition-based reweighting analysis method (TRAM), solved by direct-space fixed-point
/// iteration.
///
/// Alternates [`update_lagrangian_mult`](crate::update_lagrangian_mult) and
/// [`update_biased_conf_weights`](crate::update_biased_conf_weights) until the largest relative
/// change of any multiplier or weight drops below `tolerance`.
///
/// # Notes
///
/// Data from all thermodynamic states are expected to be discretised into the same
/// configurational states, and the count matrices should be connected over all thermodynamic
/// states; disconnected sets of states converge independently and their relative weights are
/// meaningless.
///
/// # References
///
/// 1. Wu H, Paul F, Wehmeyer C and Noé F. Multiensemble Markov models of molecular
/// thermodynamics and kinetics. PNAS 113:E3221, 2016 <http://dx.doi.org/10.1073/pnas.1525092113>
#[derive(Builder, Debug)]
#[builder(build_fn(validate = "Self::validate", name = "build_inner", private))]
pub struct TramDirect {
    /// `count_matrices[k, i, j]` is the number of `i -> j` transitions in thermodynamic state `k`
    count_matrices: Array3<usize>,

    /// `state_counts[k, i]` is the number of frames in `i` sampled in thermodynamic state `k`
    state_counts: Array2<usize>,

    /// `bias_sequence[t, k]` is the reduced bias energy of frame `t` in thermodynamic state `k`
    bias_sequence: Array2<f64>,

    /// `state_sequence[t]` is the configurational state of frame `t`
    state_sequence: Array1<usize>,

    /// Set to limit the maximum number of iterations performed
    #[builder(default = "10000")]
    maximum_iterations: usize,

    /// Iteration stops once no multiplier or weight changes by a larger factor than
    /// `exp(tolerance)`
    #[builder(default = "1.0e-8")]
    tolerance: f64,

    /// Record the log-likelihood every this many iterations, starting with the first; zero turns
    /// the record off
    #[builder(default = "10")]
    log_likelihood_interval: usize,

    /// Set to start from the given multipliers instead of half the symmetrised counts
    #[builder(setter(strip_option), default)]
    initial_lagrangian_mult: Option<Array2<f64>>,

    /// Set to start from the given weights instead of one for every visited state
    #[builder(setter(strip_option), default)]
    initial_biased_conf_weights: Option<Array2<f64>>,
}

fn shape_error(name: &str, actual: &[usize], expected: &[usize]) -> String {
    format!("{} has shape {:?}; shape should be {:?}", name, actual, expected)
}

impl TramDirectBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(tolerance) = self.tolerance {
            if !(tolerance > 0.0) {
                return Err(format!("tolerance must be positive (not {})", tolerance));
            }
        }

        if let (Some(count_matrices), Some(state_counts)) = (&self.count_matrices, &self.state_counts)
        {
            let (k, m) = state_counts.dim();
            if k == 0 || m == 0 {
                return Err(format!(
                    "at least one thermodynamic and one configurational state are required (state_counts has shape {:?})",
                    state_counts.shape()
                ));
            }
            if count_matrices.shape() != [k, m, m] {
                return Err(shape_error("count_matrices", count_matrices.shape(), &[k, m, m]));
            }

            if let (Some(bias_sequence), Some(state_sequence)) =
                (&self.bias_sequence, &self.state_sequence)
            {
                let t = state_sequence.len();
                if bias_sequence.shape() != [t, k] {
                    return Err(shape_error("bias_sequence", bias_sequence.shape(), &[t, k]));
                }
            }

            let initial_values = [
                ("initial_lagrangian_mult", &self.initial_lagrangian_mult),
                ("initial_biased_conf_weights", &self.initial_biased_conf_weights),
            ];
            for (name, initial) in initial_values.iter() {
                if let Some(Some(initial)) = initial {
                    if initial.shape() != [k, m] {
                        return Err(shape_error(name, initial.shape(), &[k, m]));
                    }
                }
            }
        }

        Ok(())
    }

    /// Build the estimator; no iteration is performed until [`TramDirect::estimate`] is called
    pub fn build(&self) -> Result<TramDirect> {
        Ok(self.build_inner()?)
    }
}

/// Result of a TRAM estimation
#[derive(Debug, Clone)]
pub struct Estimate {
    /// `lagrangian_mult[k, i]` is the converged multiplier $v_i^k$
    pub lagrangian_mult: Array2<f64>,
    /// `biased_conf_weights[k, i]` is the converged weight $\pi_i^k$, scaled so the largest
    /// weight is one
    pub biased_conf_weights: Array2<f64>,
    /// `r_k_i[k, i]` is the reweighting normalisation of the last iteration
    pub r_k_i: Array2<f64>,
    /// `conf_energies[i]` is the unbiased free energy of configurational state `i`, on the scale
    /// of [`Estimate::biased_conf_energies`]
    pub conf_energies: Array1<f64>,
    /// `therm_energies[k]` is the free energy of thermodynamic state `k`, on the same scale
    pub therm_energies: Array1<f64>,
    /// Largest relative change of each iteration
    pub error_history: Vec<f64>,
    /// [`log_likelihood_lower_bound`](crate::log_likelihood_lower_bound) after every
    /// `log_likelihood_interval`-th iteration
    pub log_likelihood_history: Vec<f64>,
    /// Number of iterations performed
    pub iterations: usize,
    /// Whether the tolerance was reached before the iteration limit
    pub converged: bool,
}

impl Estimate {
    /// Dimensionless biased configurational free energies $f_i^k = -\ln \pi_i^k$
    ///
    /// States never visited in a thermodynamic state have infinite free energy.
    pub fn biased_conf_energies(&self) -> Array2<f64> {
        self.biased_conf_weights.mapv(|w| -w.ln())
    }
}

/// Largest $|\ln x' - \ln x|$ over all cells; infinite if a cell moves between zero and a
/// positive value
fn max_log_change(old: &Array2<f64>, new: &Array2<f64>) -> f64 {
    let mut max: f64 = 0.0;
    Zip::from(old).and(new).apply(|&old, &new| {
        if old > 0.0 && new > 0.0 {
            max = max.max((new.ln() - old.ln()).abs());
        } else if (old > 0.0) != (new > 0.0) {
            max = f64::INFINITY;
        }
    });
    max
}

impl TramDirect {
    /// Get a new builder for the `TramDirect` struct. `TramDirect` can only be constructed via the
    /// builder.
    pub fn builder() -> TramDirectBuilder {
        TramDirectBuilder::default()
    }

    /// $K$, the number of thermodynamic states
    pub fn n_therm_states(&self) -> usize {
        self.state_counts.len_of(Axis(0))
    }

    /// $M$, the number of configurational states
    pub fn n_conf_states(&self) -> usize {
        self.state_counts.len_of(Axis(1))
    }

    /// $T$, the number of frames in the trajectory
    pub fn seq_length(&self) -> usize {
        self.state_sequence.len()
    }

    /// `count_matrices[k, i, j]` is the number of `i -> j` transitions in thermodynamic state `k`
    pub fn count_matrices(&self) -> &Array3<usize> {
        &self.count_matrices
    }

    /// `state_counts[k, i]` is the number of frames in `i` sampled in thermodynamic state `k`
    pub fn state_counts(&self) -> &Array2<usize> {
        &self.state_counts
    }

    /// Iterate the TRAM equations to self-consistency
    ///
    /// Each iteration first updates the multipliers from the previous weights, then the weights
    /// from the new multipliers and the previous weights. Both are written to separate buffers
    /// and swapped in afterwards, so every update reads a complete previous iterate. The
    /// unbiased free energies are evaluated once, for the final iterate.
    pub fn estimate(&self) -> Result<Estimate> {
        let dim = self.state_counts.dim();
        let mut lagrangian_mult = match &self.initial_lagrangian_mult {
            Some(initial) => initial.clone(),
            None => init_lagrangian_mult(self.count_matrices.view())?,
        };
        let mut biased_conf_weights = match &self.initial_biased_conf_weights {
            Some(initial) => initial.clone(),
            None => self
                .state_counts
                .mapv(|visits| if visits > 0 { 1.0 } else { 0.0 }),
        };
        let mut new_lagrangian_mult = Array2::zeros(dim);
        let mut new_biased_conf_weights = Array2::zeros(dim);
        let mut r_k_i = Array2::zeros(dim);

        let mut error_history = Vec::new();
        let mut log_likelihood_history = Vec::new();
        let mut converged = false;

        for iteration in 0..self.maximum_iterations {
            update_lagrangian_mult_into(
                lagrangian_mult.view(),
                biased_conf_weights.view(),
                self.count_matrices.view(),
                self.state_counts.view(),
                new_lagrangian_mult.view_mut(),
            )?;
            update_biased_conf_weights_into(
                new_lagrangian_mult.view(),
                biased_conf_weights.view(),
                self.count_matrices.view(),
                self.bias_sequence.view(),
                self.state_sequence.view(),
                self.state_counts.view(),
                r_k_i.view_mut(),
                new_biased_conf_weights.view_mut(),
            )?;

            let max_weight = new_biased_conf_weights.fold(0.0_f64, |max, &w| max.max(w));
            if max_weight > 0.0 {
                new_biased_conf_weights.mapv_inplace(|w| w / max_weight);
            }

            let error = max_log_change(&lagrangian_mult, &new_lagrangian_mult)
                .max(max_log_change(&biased_conf_weights, &new_biased_conf_weights));
            std::mem::swap(&mut lagrangian_mult, &mut new_lagrangian_mult);
            std::mem::swap(&mut biased_conf_weights, &mut new_biased_conf_weights);
            error_history.push(error);
            debug!(iteration, error, "TRAM iteration");

            if self.log_likelihood_interval > 0 && iteration % self.log_likelihood_interval == 0 {
                let log_likelihood = log_likelihood_lower_bound(
                    lagrangian_mult.view(),
                    biased_conf_weights.view(),
                    self.count_matrices.view(),
                    self.bias_sequence.view(),
                    self.state_sequence.view(),
                    self.state_counts.view(),
                )?;
                debug!(iteration, log_likelihood, "TRAM log-likelihood");
                log_likelihood_history.push(log_likelihood);
            }

            if error < self.tolerance {
                converged = true;
                break;
            }
        }

        let iterations = error_history.len();
        if converged {
            info!(iterations, "TRAM converged");
        } else {
            warn!(
                iterations,
                error = error_history.last().copied().unwrap_or(f64::INFINITY),
                tolerance = self.tolerance,
                "TRAM did not converge within the maximum number of iterations"
            );
        }

        let FreeEnergies {
            conf_energies,
            therm_energies,
        } = estimate_free_energies(
            lagrangian_mult.view(),
            biased_conf_weights.view(),
            self.count_matrices.view(),
            self.bias_sequence.view(),
            self.state_sequence.view(),
            self.state_counts.view(),
        )?;

        Ok(Estimate {
            lagrangian_mult,
            biased_conf_weights,
            r_k_i,
            conf_energies,
            therm_energies,
            error_history,
            log_likelihood_history,
            iterations,
            converged,
        })
    }

    /// Reversible transition matrices of every thermodynamic state for an estimate
    ///
    /// See [`estimate_transition_matrices`].
    pub fn transition_matrices(&self, estimate: &Estimate) -> Result<Array3<f64>> {
        estimate_transition_matrices(
            estimate.lagrangian_mult.view(),
            estimate.biased_conf_weights.view(),
            self.count_matrices.view(),
        )
    }
}
