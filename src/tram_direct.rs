//! Direct-space TRAM updates of the Lagrangian multipliers and the biased configurational
//! weights, plus the transition matrices, free energies and log-likelihood they imply.

use crate::errors::*;
use crate::lse::{logsumexp, tree_merge, LogSumExp};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayViewMut2};
use rayon::prelude::*;
use std::ops::Range;
use tracing::{debug, trace};

/// Upper bound on the number of trajectory partitions reduced in parallel
const MAX_PARTITIONS: usize = 64;

/// Partitions are only split further while each keeps at least this many frames
const MIN_PARTITION_FRAMES: usize = 4096;

/// Result of one weight update
#[derive(Debug, Clone, PartialEq)]
pub struct WeightUpdate {
    /// `biased_conf_weights[k, i]` is the new weight of configurational state `i` under the bias
    /// of thermodynamic state `k`; zero where `state_counts[k, i] == 0`
    pub biased_conf_weights: Array2<f64>,
    /// `r_k_i[k, i]` is the reweighting normalisation $R_i^k$ used for the trajectory scan
    pub r_k_i: Array2<f64>,
}

/// Unbiased free energies implied by an iterate
#[derive(Debug, Clone, PartialEq)]
pub struct FreeEnergies {
    /// `conf_energies[i]` is $-\ln \sum_{x \in i} \mu(x)$, the unbiased free energy of
    /// configurational state `i`; infinite for states no frame visits
    pub conf_energies: Array1<f64>,
    /// `therm_energies[k]` is $-\ln \sum_x \mu(x) e^{-b^k(x)}$, the free energy of
    /// thermodynamic state `k`
    pub therm_energies: Array1<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Extents {
    n_therm_states: usize,
    n_conf_states: usize,
}

impl Extents {
    fn square(&self) -> [usize; 2] {
        [self.n_therm_states, self.n_conf_states]
    }

    fn cube(&self) -> [usize; 3] {
        [self.n_therm_states, self.n_conf_states, self.n_conf_states]
    }
}

fn check_shape(name: &'static str, actual: &[usize], expected: &[usize]) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(TramError::ShapeMismatch {
            name,
            actual: actual.to_vec(),
            expected: expected.to_vec(),
        })
    }
}

fn check_iterate(name: &'static str, values: &ArrayView2<'_, f64>) -> Result<()> {
    match values
        .indexed_iter()
        .find(|(_, &value)| !(value.is_finite() && value >= 0.0))
    {
        Some(((therm_state, conf_state), &value)) => Err(TramError::InvalidIterate {
            name,
            therm_state,
            conf_state,
            value,
        }),
        None => Ok(()),
    }
}

/// The multipliers declare K and M; the weights must agree with them.
fn validate_iterates(
    lagrangian_mult: &ArrayView2<'_, f64>,
    biased_conf_weights: &ArrayView2<'_, f64>,
) -> Result<Extents> {
    let (n_therm_states, n_conf_states) = lagrangian_mult.dim();
    if n_therm_states == 0 || n_conf_states == 0 {
        return Err(TramError::EmptyExtent {
            name: "lagrangian_mult",
            shape: lagrangian_mult.shape().to_vec(),
        });
    }
    let extents = Extents {
        n_therm_states,
        n_conf_states,
    };
    check_shape(
        "biased_conf_weights",
        biased_conf_weights.shape(),
        &extents.square(),
    )?;
    check_iterate("lagrangian_mult", lagrangian_mult)?;
    check_iterate("biased_conf_weights", biased_conf_weights)?;
    Ok(extents)
}

fn validate_counts(
    extents: Extents,
    count_matrices: &ArrayView3<'_, usize>,
    state_counts: &ArrayView2<'_, usize>,
) -> Result<()> {
    check_shape("count_matrices", count_matrices.shape(), &extents.cube())?;
    check_shape("state_counts", state_counts.shape(), &extents.square())?;

    for k in 0..extents.n_therm_states {
        for i in 0..extents.n_conf_states {
            let visits = state_counts[[k, i]];
            let (mut out_of, mut into) = (0, 0);
            for j in 0..extents.n_conf_states {
                out_of += count_matrices[[k, i, j]];
                into += count_matrices[[k, j, i]];
            }
            for &(transitions, direction) in &[(out_of, "out of"), (into, "into")] {
                if transitions > visits {
                    return Err(TramError::InconsistentCounts {
                        therm_state: k,
                        conf_state: i,
                        visits,
                        transitions,
                        direction,
                    });
                }
            }
        }
    }
    Ok(())
}

fn validate_trajectory(
    extents: Extents,
    bias_sequence: &ArrayView2<'_, f64>,
    state_sequence: &ArrayView1<'_, usize>,
) -> Result<()> {
    let seq_length = state_sequence.len();
    check_shape(
        "bias_sequence",
        bias_sequence.shape(),
        &[seq_length, extents.n_therm_states],
    )?;

    if let Some((frame, &state)) = state_sequence
        .iter()
        .enumerate()
        .find(|(_, &state)| state >= extents.n_conf_states)
    {
        return Err(TramError::StateOutOfRange {
            frame,
            state,
            n_conf_states: extents.n_conf_states,
        });
    }

    if let Some(((frame, therm_state), &value)) = bias_sequence
        .indexed_iter()
        .find(|(_, &value)| value.is_nan() || value == f64::NEG_INFINITY)
    {
        return Err(TramError::InvalidBias {
            frame,
            therm_state,
            value,
        });
    }
    Ok(())
}

fn validate_scan_inputs(
    lagrangian_mult: &ArrayView2<'_, f64>,
    biased_conf_weights: &ArrayView2<'_, f64>,
    count_matrices: &ArrayView3<'_, usize>,
    bias_sequence: &ArrayView2<'_, f64>,
    state_sequence: &ArrayView1<'_, usize>,
    state_counts: &ArrayView2<'_, usize>,
) -> Result<Extents> {
    let extents = validate_iterates(lagrangian_mult, biased_conf_weights)?;
    validate_counts(extents, count_matrices, state_counts)?;
    validate_trajectory(extents, bias_sequence, state_sequence)?;
    Ok(extents)
}

/// Fill `out` cell by cell in parallel; each cell is computed independently, so the result does
/// not depend on scheduling.
fn par_fill<F>(mut out: ArrayViewMut2<'_, f64>, cell: F)
where
    F: Fn(usize, usize) -> f64 + Sync + Send,
{
    let (n_rows, n_cols) = out.dim();
    let values: Vec<f64> = (0..n_rows * n_cols)
        .into_par_iter()
        .map(|idx| cell(idx / n_cols, idx % n_cols))
        .collect();
    for (dst, value) in out.iter_mut().zip(values) {
        *dst = value;
    }
}

/// Which end of a symmetrised transition pair gets the flux
#[derive(Debug, Clone, Copy, PartialEq)]
enum FluxShare {
    /// $v_i^k \pi_j^k$ in the numerator: the share of state `i`'s multiplier
    Multiplier,
    /// $v_j^k \pi_i^k$ in the numerator: the share entering `i`'s normalisation
    Normalisation,
}

/// $\sum_{j \neq i} (c_{ij}^k + c_{ji}^k) \frac{x}{v_i^k \pi_j^k + v_j^k \pi_i^k}$ where $x$ is
/// chosen by `share`; pairs with a zero denominator contribute nothing.
fn partner_flux(
    lagrangian_mult: &ArrayView2<'_, f64>,
    biased_conf_weights: &ArrayView2<'_, f64>,
    count_matrices: &ArrayView3<'_, usize>,
    k: usize,
    i: usize,
    share: FluxShare,
) -> f64 {
    let v_i = lagrangian_mult[[k, i]];
    let w_i = biased_conf_weights[[k, i]];
    let mut flux = 0.0;
    for j in 0..lagrangian_mult.ncols() {
        if j == i {
            continue;
        }
        let counts = count_matrices[[k, i, j]] + count_matrices[[k, j, i]];
        if counts == 0 {
            continue;
        }
        let v_j = lagrangian_mult[[k, j]];
        let w_j = biased_conf_weights[[k, j]];
        let denominator = v_i * w_j + v_j * w_i;
        if denominator > 0.0 {
            let numerator = match share {
                FluxShare::Multiplier => v_i * w_j,
                FluxShare::Normalisation => v_j * w_i,
            };
            flux += counts as f64 * numerator / denominator;
        }
    }
    flux
}

/// Compute updated Lagrangian multipliers
///
/// One iterative-proportional-fitting step for the multipliers $v_i^k$ that enforce detailed
/// balance of the reversible transition matrices of each thermodynamic state:
///
/// $$
///     v_i^{k,\mathrm{new}} = c_{ii}^k + \sum_{j \neq i}
///         \frac{(c_{ij}^k + c_{ji}^k)\, v_i^k \pi_j^k}{v_i^k \pi_j^k + v_j^k \pi_i^k}
/// $$
///
/// where $\pi_i^k$ are the current biased configurational weights.
///
/// # Parameters
///
/// * `lagrangian_mult[k, i]` is the current multiplier; its shape declares the number of
///   thermodynamic states K and configurational states M
/// * `biased_conf_weights[k, i]` is the current weight of state `i` under bias `k` (K×M)
/// * `count_matrices[k, i, j]` is the number of `i -> j` transitions seen in thermodynamic
///   state `k` (K×M×M)
/// * `state_counts[k, i]` is the number of visits to `i` in thermodynamic state `k` (K×M)
///
/// # Notes
///
/// Pairs of states whose denominator vanishes (both multipliers or both weights zero) add
/// nothing, so states without any counts keep a multiplier of exactly zero.
pub fn update_lagrangian_mult(
    lagrangian_mult: ArrayView2<'_, f64>,
    biased_conf_weights: ArrayView2<'_, f64>,
    count_matrices: ArrayView3<'_, usize>,
    state_counts: ArrayView2<'_, usize>,
) -> Result<Array2<f64>> {
    let mut new_lagrangian_mult = Array2::zeros(lagrangian_mult.dim());
    update_lagrangian_mult_into(
        lagrangian_mult,
        biased_conf_weights,
        count_matrices,
        state_counts,
        new_lagrangian_mult.view_mut(),
    )?;
    Ok(new_lagrangian_mult)
}

/// Compute updated Lagrangian multipliers into a caller-owned buffer
///
/// See [`update_lagrangian_mult`]. `new_lagrangian_mult` must be K×M; it is overwritten
/// completely.
pub fn update_lagrangian_mult_into(
    lagrangian_mult: ArrayView2<'_, f64>,
    biased_conf_weights: ArrayView2<'_, f64>,
    count_matrices: ArrayView3<'_, usize>,
    state_counts: ArrayView2<'_, usize>,
    new_lagrangian_mult: ArrayViewMut2<'_, f64>,
) -> Result<()> {
    let extents = validate_iterates(&lagrangian_mult, &biased_conf_weights)?;
    validate_counts(extents, &count_matrices, &state_counts)?;
    check_shape(
        "new_lagrangian_mult",
        new_lagrangian_mult.shape(),
        &extents.square(),
    )?;
    trace!(
        n_therm_states = extents.n_therm_states,
        n_conf_states = extents.n_conf_states,
        "updating Lagrangian multipliers"
    );

    par_fill(new_lagrangian_mult, |k, i| {
        count_matrices[[k, i, i]] as f64
            + partner_flux(
                &lagrangian_mult,
                &biased_conf_weights,
                &count_matrices,
                k,
                i,
                FluxShare::Multiplier,
            )
    });
    Ok(())
}

/// Compute updated biased configurational weights
///
/// First the normalisation $R_i^k$ of every (thermodynamic, configurational) state pair is built
/// from the count matrices and the (already updated) multipliers:
///
/// $$
///     R_i^k = c_{ii}^k + \sum_{j \neq i}
///         \frac{(c_{ij}^k + c_{ji}^k)\, v_j^k \pi_i^k}{v_i^k \pi_j^k + v_j^k \pi_i^k}
///         + N_i^k - \sum_j c_{ji}^k
/// $$
///
/// Then every frame $x$ of the trajectory, in configurational state $i$, is shared among the
/// thermodynamic states by
///
/// $$
///     \pi_i^{k,\mathrm{new}} = \sum_{x \in i}
///         \frac{e^{-b^k(x)}}{\sum_l R_i^l e^{-b^l(x)} / \pi_i^l}
/// $$
///
/// with every sum over Boltzmann factors taken in the log domain.
///
/// # Parameters
///
/// * `lagrangian_mult[k, i]`: the multipliers returned by [`update_lagrangian_mult`] (K×M)
/// * `biased_conf_weights[k, i]`: the current weights (K×M)
/// * `count_matrices[k, i, j]`: transition counts (K×M×M)
/// * `bias_sequence[t, k]`: reduced bias energy of frame `t` evaluated in thermodynamic state
///   `k` (T×K)
/// * `state_sequence[t]`: configurational state of frame `t`, in `0..M`
/// * `state_counts[k, i]`: visits (K×M)
///
/// # Returns
///
/// The new weights together with the $R_i^k$ buffer. Weights of states never visited in a
/// thermodynamic state are exactly zero.
///
/// # Notes
///
/// Thermodynamic states with $R_i^l = 0$ or $\pi_i^l = 0$ are left out of a frame's
/// denominator. A frame with no thermodynamic state left in its denominator is skipped.
pub fn update_biased_conf_weights(
    lagrangian_mult: ArrayView2<'_, f64>,
    biased_conf_weights: ArrayView2<'_, f64>,
    count_matrices: ArrayView3<'_, usize>,
    bias_sequence: ArrayView2<'_, f64>,
    state_sequence: ArrayView1<'_, usize>,
    state_counts: ArrayView2<'_, usize>,
) -> Result<WeightUpdate> {
    let mut new_biased_conf_weights = Array2::zeros(biased_conf_weights.dim());
    let mut r_k_i = Array2::zeros(biased_conf_weights.dim());
    update_biased_conf_weights_into(
        lagrangian_mult,
        biased_conf_weights,
        count_matrices,
        bias_sequence,
        state_sequence,
        state_counts,
        r_k_i.view_mut(),
        new_biased_conf_weights.view_mut(),
    )?;
    Ok(WeightUpdate {
        biased_conf_weights: new_biased_conf_weights,
        r_k_i,
    })
}

/// Compute updated biased configurational weights into caller-owned buffers
///
/// See [`update_biased_conf_weights`]. `r_k_i` and `new_biased_conf_weights` must be K×M; both
/// are overwritten completely.
#[allow(clippy::too_many_arguments)]
pub fn update_biased_conf_weights_into(
    lagrangian_mult: ArrayView2<'_, f64>,
    biased_conf_weights: ArrayView2<'_, f64>,
    count_matrices: ArrayView3<'_, usize>,
    bias_sequence: ArrayView2<'_, f64>,
    state_sequence: ArrayView1<'_, usize>,
    state_counts: ArrayView2<'_, usize>,
    mut r_k_i: ArrayViewMut2<'_, f64>,
    mut new_biased_conf_weights: ArrayViewMut2<'_, f64>,
) -> Result<()> {
    let extents = validate_scan_inputs(
        &lagrangian_mult,
        &biased_conf_weights,
        &count_matrices,
        &bias_sequence,
        &state_sequence,
        &state_counts,
    )?;
    check_shape("r_k_i", r_k_i.shape(), &extents.square())?;
    check_shape(
        "new_biased_conf_weights",
        new_biased_conf_weights.shape(),
        &extents.square(),
    )?;

    let Extents {
        n_therm_states,
        n_conf_states,
    } = extents;
    trace!(
        n_therm_states,
        n_conf_states,
        seq_length = state_sequence.len(),
        "updating biased configurational weights"
    );

    fill_normalisation(
        &lagrangian_mult,
        &biased_conf_weights,
        &count_matrices,
        &state_counts,
        r_k_i.view_mut(),
    );
    let log_r_over_w = log_ratio(&r_k_i.view(), &biased_conf_weights);

    let totals = scan_trajectory(
        &log_r_over_w,
        &bias_sequence,
        &state_sequence,
        n_therm_states * n_conf_states,
        |t, i, log_divisor, cells| {
            for k in 0..n_therm_states {
                if state_counts[[k, i]] > 0 {
                    cells[k * n_conf_states + i].push(-bias_sequence[[t, k]] - log_divisor);
                }
            }
        },
    );
    for ((k, i), weight) in new_biased_conf_weights.indexed_iter_mut() {
        *weight = if state_counts[[k, i]] > 0 {
            totals.cells[k * n_conf_states + i].exp()
        } else {
            0.0
        };
    }
    Ok(())
}

/// `R[k, i]`, without validation
fn fill_normalisation(
    lagrangian_mult: &ArrayView2<'_, f64>,
    biased_conf_weights: &ArrayView2<'_, f64>,
    count_matrices: &ArrayView3<'_, usize>,
    state_counts: &ArrayView2<'_, usize>,
    r_k_i: ArrayViewMut2<'_, f64>,
) {
    let n_conf_states = lagrangian_mult.ncols();
    par_fill(r_k_i, |k, i| {
        // validated: arrivals never exceed visits
        let arrivals: usize = (0..n_conf_states).map(|j| count_matrices[[k, j, i]]).sum();
        let unpaired_visits = state_counts[[k, i]] - arrivals;
        count_matrices[[k, i, i]] as f64
            + partner_flux(
                lagrangian_mult,
                biased_conf_weights,
                count_matrices,
                k,
                i,
                FluxShare::Normalisation,
            )
            + unpaired_visits as f64
    });
}

/// $\ln R_i^k - \ln \pi_i^k$, or `-inf` where either vanishes
fn log_ratio(
    r_k_i: &ArrayView2<'_, f64>,
    biased_conf_weights: &ArrayView2<'_, f64>,
) -> Array2<f64> {
    Array2::from_shape_fn(r_k_i.dim(), |(k, i)| {
        let (r, w) = (r_k_i[[k, i]], biased_conf_weights[[k, i]]);
        if r > 0.0 && w > 0.0 {
            r.ln() - w.ln()
        } else {
            f64::NEG_INFINITY
        }
    })
}

/// Contiguous frame ranges of the trajectory scan
///
/// Depends on the trajectory length only, so the merge order of the partial sums is the same for
/// any number of threads. At most [`MAX_PARTITIONS`] partial sums exist at once.
fn partitions(seq_length: usize) -> Vec<Range<usize>> {
    let n_partitions =
        ((seq_length + MIN_PARTITION_FRAMES - 1) / MIN_PARTITION_FRAMES).min(MAX_PARTITIONS);
    if n_partitions == 0 {
        return Vec::new();
    }
    let len = (seq_length + n_partitions - 1) / n_partitions;
    (0..n_partitions)
        .map(|p| (p * len).min(seq_length)..((p + 1) * len).min(seq_length))
        .collect()
}

/// Sums collected over one or more partitions of the trajectory
#[derive(Debug, Clone)]
struct ScanTotals {
    cells: Vec<LogSumExp>,
    skipped: usize,
    sum_log_divisor: f64,
}

impl ScanTotals {
    fn new(n_cells: usize) -> Self {
        Self {
            cells: vec![LogSumExp::new(); n_cells],
            skipped: 0,
            sum_log_divisor: 0.0,
        }
    }

    fn merge(&mut self, other: Self) {
        for (cell, theirs) in self.cells.iter_mut().zip(other.cells.iter()) {
            cell.merge(theirs);
        }
        self.skipped += other.skipped;
        self.sum_log_divisor += other.sum_log_divisor;
    }
}

/// Compute $\ln D(x) = \ln \sum_l R_i^l e^{-b^l(x)} / \pi_i^l$ for every frame and hand it to
/// `visit` together with the frame index, its configurational state and the partition's cells
///
/// Frames with a non-finite $\ln D(x)$ are counted as skipped and not visited.
fn scan_trajectory<F>(
    log_r_over_w: &Array2<f64>,
    bias_sequence: &ArrayView2<'_, f64>,
    state_sequence: &ArrayView1<'_, usize>,
    n_cells: usize,
    visit: F,
) -> ScanTotals
where
    F: Fn(usize, usize, f64, &mut [LogSumExp]) + Sync,
{
    let n_therm_states = log_r_over_w.nrows();
    let seq_length = state_sequence.len();
    let partials: Vec<ScanTotals> = partitions(seq_length)
        .into_par_iter()
        .map(|frames| {
            let mut totals = ScanTotals::new(n_cells);
            let mut exponents = vec![0.0; n_therm_states];
            for t in frames {
                let i = state_sequence[t];
                for (l, exponent) in exponents.iter_mut().enumerate() {
                    *exponent = log_r_over_w[[l, i]] - bias_sequence[[t, l]];
                }
                let log_divisor = logsumexp(&exponents);
                if !log_divisor.is_finite() {
                    totals.skipped += 1;
                    continue;
                }
                totals.sum_log_divisor += log_divisor;
                visit(t, i, log_divisor, &mut totals.cells);
            }
            totals
        })
        .collect();

    let totals =
        tree_merge(partials, ScanTotals::merge).unwrap_or_else(|| ScanTotals::new(n_cells));
    if totals.skipped > 0 {
        debug!(
            skipped = totals.skipped,
            seq_length, "skipped frames that no thermodynamic state can account for"
        );
    }
    totals
}

/// Unbiased configurational and thermodynamic free energies
///
/// Every frame gets the unbiased weight $\mu(x) = 1 / D(x)$ with the divisor of
/// [`update_biased_conf_weights`]. Summing $\mu(x)$ over the frames of each configurational state
/// gives `conf_energies`; summing $\mu(x) e^{-b^k(x)}$ over all frames gives `therm_energies`. Both
/// are on the same scale as $-\ln \pi_i^k$ for the given weights.
///
/// Takes the same arguments as [`update_biased_conf_weights`] and validates them the same way.
pub fn estimate_free_energies(
    lagrangian_mult: ArrayView2<'_, f64>,
    biased_conf_weights: ArrayView2<'_, f64>,
    count_matrices: ArrayView3<'_, usize>,
    bias_sequence: ArrayView2<'_, f64>,
    state_sequence: ArrayView1<'_, usize>,
    state_counts: ArrayView2<'_, usize>,
) -> Result<FreeEnergies> {
    let extents = validate_scan_inputs(
        &lagrangian_mult,
        &biased_conf_weights,
        &count_matrices,
        &bias_sequence,
        &state_sequence,
        &state_counts,
    )?;
    let Extents {
        n_therm_states,
        n_conf_states,
    } = extents;

    let mut r_k_i = Array2::zeros(extents.square());
    fill_normalisation(
        &lagrangian_mult,
        &biased_conf_weights,
        &count_matrices,
        &state_counts,
        r_k_i.view_mut(),
    );
    let log_r_over_w = log_ratio(&r_k_i.view(), &biased_conf_weights);

    // cells 0..M hold the configurational sums, M..M+K the thermodynamic ones
    let totals = scan_trajectory(
        &log_r_over_w,
        &bias_sequence,
        &state_sequence,
        n_conf_states + n_therm_states,
        |t, i, log_divisor, cells| {
            cells[i].push(-log_divisor);
            for k in 0..n_therm_states {
                cells[n_conf_states + k].push(-bias_sequence[[t, k]] - log_divisor);
            }
        },
    );
    let (conf, therm) = totals.cells.split_at(n_conf_states);
    Ok(FreeEnergies {
        conf_energies: conf.iter().map(|cell| -cell.ln()).collect(),
        therm_energies: therm.iter().map(|cell| -cell.ln()).collect(),
    })
}

/// Log-likelihood lower bound of an iterate
///
/// $$
///     \ln L = \sum_k \sum_{i,j} c_{ij}^k \ln p_{ij}^k
///         - \sum_{k,i} N_i^k \ln \pi_i^k
///         - \sum_x \ln D(x)
/// $$
///
/// with $p_{ij}^k$ from [`estimate_transition_matrices`] and $D(x)$ the divisor of
/// [`update_biased_conf_weights`]. The value does not change when all weights are scaled by the
/// same factor. Skipped frames contribute nothing.
pub fn log_likelihood_lower_bound(
    lagrangian_mult: ArrayView2<'_, f64>,
    biased_conf_weights: ArrayView2<'_, f64>,
    count_matrices: ArrayView3<'_, usize>,
    bias_sequence: ArrayView2<'_, f64>,
    state_sequence: ArrayView1<'_, usize>,
    state_counts: ArrayView2<'_, usize>,
) -> Result<f64> {
    let extents = validate_scan_inputs(
        &lagrangian_mult,
        &biased_conf_weights,
        &count_matrices,
        &bias_sequence,
        &state_sequence,
        &state_counts,
    )?;

    let transition_matrices = transition_matrices(
        extents,
        &lagrangian_mult,
        &biased_conf_weights,
        &count_matrices,
    );
    let mut log_likelihood = 0.0;
    for (idx, &counts) in count_matrices.indexed_iter() {
        if counts > 0 {
            log_likelihood += counts as f64 * transition_matrices[idx].ln();
        }
    }
    for (idx, &visits) in state_counts.indexed_iter() {
        if visits > 0 {
            log_likelihood -= visits as f64 * biased_conf_weights[idx].ln();
        }
    }

    let mut r_k_i = Array2::zeros(extents.square());
    fill_normalisation(
        &lagrangian_mult,
        &biased_conf_weights,
        &count_matrices,
        &state_counts,
        r_k_i.view_mut(),
    );
    let log_r_over_w = log_ratio(&r_k_i.view(), &biased_conf_weights);
    let totals = scan_trajectory(
        &log_r_over_w,
        &bias_sequence,
        &state_sequence,
        0,
        |_, _, _, _| {},
    );
    Ok(log_likelihood - totals.sum_log_divisor)
}

/// Initial guess for the Lagrangian multipliers
///
/// $v_i^k = \frac{1}{2} \sum_j (c_{ij}^k + c_{ji}^k)$, i.e. the multipliers of a transition
/// matrix estimate whose weights are proportional to the symmetrised counts.
pub fn init_lagrangian_mult(count_matrices: ArrayView3<'_, usize>) -> Result<Array2<f64>> {
    let (n_therm_states, n_rows, _) = count_matrices.dim();
    if n_therm_states == 0 || n_rows == 0 {
        return Err(TramError::EmptyExtent {
            name: "count_matrices",
            shape: count_matrices.shape().to_vec(),
        });
    }
    check_shape(
        "count_matrices",
        count_matrices.shape(),
        &[n_therm_states, n_rows, n_rows],
    )?;

    Ok(Array2::from_shape_fn((n_therm_states, n_rows), |(k, i)| {
        (0..n_rows)
            .map(|j| (count_matrices[[k, i, j]] + count_matrices[[k, j, i]]) as f64)
            .sum::<f64>()
            * 0.5
    }))
}

/// Estimate the reversible transition matrix of each thermodynamic state
///
/// # Parameters
///
/// * `lagrangian_mult[k, i]`: converged multipliers (K×M)
/// * `biased_conf_weights[k, i]`: converged weights (K×M)
/// * `count_matrices[k, i, j]`: transition counts (K×M×M)
///
/// # Returns
///
/// `p[k, i, j]` is the probability to go from `i` to `j` in thermodynamic state `k`:
///
/// $$
///     p_{ij}^k = \frac{(c_{ij}^k + c_{ji}^k)\, \pi_j^k}{v_i^k \pi_j^k + v_j^k \pi_i^k}
/// $$
///
/// All rows of one thermodynamic state are divided by the largest row sum of that state, and
/// the diagonal then absorbs what is missing from one. Rows of states without counts are rows
/// of the identity.
pub fn estimate_transition_matrices(
    lagrangian_mult: ArrayView2<'_, f64>,
    biased_conf_weights: ArrayView2<'_, f64>,
    count_matrices: ArrayView3<'_, usize>,
) -> Result<Array3<f64>> {
    let extents = validate_iterates(&lagrangian_mult, &biased_conf_weights)?;
    check_shape("count_matrices", count_matrices.shape(), &extents.cube())?;
    Ok(transition_matrices(
        extents,
        &lagrangian_mult,
        &biased_conf_weights,
        &count_matrices,
    ))
}

fn transition_matrices(
    extents: Extents,
    lagrangian_mult: &ArrayView2<'_, f64>,
    biased_conf_weights: &ArrayView2<'_, f64>,
    count_matrices: &ArrayView3<'_, usize>,
) -> Array3<f64> {
    let n_conf_states = extents.n_conf_states;
    let mut transition_matrices = Array3::zeros(count_matrices.dim());
    for k in 0..extents.n_therm_states {
        let mut max_row_sum: f64 = 0.0;
        for i in 0..n_conf_states {
            let v_i = lagrangian_mult[[k, i]];
            let w_i = biased_conf_weights[[k, i]];
            let mut row_sum = 0.0;
            for j in 0..n_conf_states {
                let counts = count_matrices[[k, i, j]] + count_matrices[[k, j, i]];
                if counts == 0 {
                    continue;
                }
                let w_j = biased_conf_weights[[k, j]];
                let denominator = v_i * w_j + lagrangian_mult[[k, j]] * w_i;
                if denominator > 0.0 {
                    let p = counts as f64 * w_j / denominator;
                    transition_matrices[[k, i, j]] = p;
                    row_sum += p;
                }
            }
            max_row_sum = max_row_sum.max(row_sum);
        }

        for i in 0..n_conf_states {
            let mut off_diagonal = 0.0;
            for j in 0..n_conf_states {
                if max_row_sum > 0.0 {
                    transition_matrices[[k, i, j]] /= max_row_sum;
                }
                if i != j {
                    off_diagonal += transition_matrices[[k, i, j]];
                }
            }
            transition_matrices[[k, i, i]] = 1.0 - off_diagonal;
        }
    }
    transition_matrices
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    #[test]
    fn single_ensemble_keeps_uniform_weights() {
        let count_matrices = array![[[2, 1], [1, 2]]];
        let state_counts = array![[4, 4]];
        let lagrangian_mult = array![[1.0, 1.0]];
        let biased_conf_weights = array![[1.0, 1.0]];
        let state_sequence = array![0, 0, 0, 1, 1, 1, 0, 1];
        let bias_sequence = Array2::<f64>::zeros((8, 1));

        let new_lagrangian_mult = update_lagrangian_mult(
            lagrangian_mult.view(),
            biased_conf_weights.view(),
            count_matrices.view(),
            state_counts.view(),
        )
        .unwrap();
        assert_eq!(new_lagrangian_mult, array![[3.0, 3.0]]);

        let update = update_biased_conf_weights(
            new_lagrangian_mult.view(),
            biased_conf_weights.view(),
            count_matrices.view(),
            bias_sequence.view(),
            state_sequence.view(),
            state_counts.view(),
        )
        .unwrap();
        assert_eq!(update.r_k_i, array![[4.0, 4.0]]);
        for (new, old) in update.biased_conf_weights.iter().zip(biased_conf_weights.iter()) {
            assert!((new - old).abs() < 1e-12);
        }
    }

    #[test]
    fn two_ensembles_one_state_share_frames_by_visits() {
        let count_matrices = Array3::<usize>::zeros((2, 1, 1));
        let state_counts = array![[10], [5]];
        let lagrangian_mult = init_lagrangian_mult(count_matrices.view()).unwrap();
        let biased_conf_weights = array![[1.0], [1.0]];
        let state_sequence = Array1::<usize>::zeros(15);
        let bias_sequence = Array2::<f64>::zeros((15, 2));

        let update = update_biased_conf_weights(
            lagrangian_mult.view(),
            biased_conf_weights.view(),
            count_matrices.view(),
            bias_sequence.view(),
            state_sequence.view(),
            state_counts.view(),
        )
        .unwrap();

        assert_eq!(update.r_k_i, array![[10.0], [5.0]]);
        // no bias difference: both ensembles see the same unbiased weight
        let w = &update.biased_conf_weights;
        assert!((w[[0, 0]] - 1.0).abs() < 1e-12);
        assert!((w[[1, 0]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn unvisited_states_get_zero_weight() {
        let count_matrices = array![[[3, 1], [1, 3]], [[4, 0], [0, 0]]];
        let state_counts = array![[5, 4], [5, 0]];
        let lagrangian_mult = init_lagrangian_mult(count_matrices.view()).unwrap();
        let biased_conf_weights = array![[1.0, 1.0], [1.0, 1.0]];
        let state_sequence = array![0, 0, 0, 0, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0];
        let bias_sequence = Array2::from_shape_fn((14, 2), |(t, k)| 0.3 * (t % 3) as f64 * k as f64);

        let new_lagrangian_mult = update_lagrangian_mult(
            lagrangian_mult.view(),
            biased_conf_weights.view(),
            count_matrices.view(),
            state_counts.view(),
        )
        .unwrap();
        assert_eq!(new_lagrangian_mult[[1, 1]], 0.0);

        let update = update_biased_conf_weights(
            new_lagrangian_mult.view(),
            biased_conf_weights.view(),
            count_matrices.view(),
            bias_sequence.view(),
            state_sequence.view(),
            state_counts.view(),
        )
        .unwrap();
        let w = &update.biased_conf_weights;
        assert_eq!(w[[1, 1]], 0.0);
        assert!(w.iter().all(|x| x.is_finite()));
        assert!(w[[0, 0]] > 0.0 && w[[0, 1]] > 0.0 && w[[1, 0]] > 0.0);
    }

    #[test]
    fn equivalent_states_get_equal_multipliers() {
        let count_matrices = array![[[4, 1, 0], [1, 2, 1], [0, 1, 4]]];
        let state_counts = array![[5, 4, 5]];
        let lagrangian_mult = array![[2.0, 1.5, 2.0]];
        let biased_conf_weights = array![[0.7, 0.2, 0.7]];

        let new_lagrangian_mult = update_lagrangian_mult(
            lagrangian_mult.view(),
            biased_conf_weights.view(),
            count_matrices.view(),
            state_counts.view(),
        )
        .unwrap();
        assert_eq!(new_lagrangian_mult[[0, 0]], new_lagrangian_mult[[0, 2]]);
    }

    #[test]
    fn huge_biases_stay_finite() {
        let count_matrices = array![[[5, 2], [2, 5]], [[5, 2], [2, 5]]];
        let state_counts = array![[8, 8], [8, 8]];
        let lagrangian_mult = init_lagrangian_mult(count_matrices.view()).unwrap();
        let biased_conf_weights = array![[1.0, 1.0], [1.0, 1.0]];
        let state_sequence = Array1::from_shape_fn(32, |t| t % 2);
        let bias_sequence =
            Array2::from_shape_fn((32, 2), |(t, k)| if k == 0 { 0.0 } else { 1500.0 + t as f64 });

        let update = update_biased_conf_weights(
            lagrangian_mult.view(),
            biased_conf_weights.view(),
            count_matrices.view(),
            bias_sequence.view(),
            state_sequence.view(),
            state_counts.view(),
        )
        .unwrap();
        assert!(update.biased_conf_weights.iter().all(|w| w.is_finite()));
        assert!(update.biased_conf_weights[[0, 0]] > 0.0);
    }

    #[test]
    fn mismatched_weights_are_rejected_before_any_work() {
        let count_matrices = array![[[2, 1], [1, 2]]];
        let state_counts = array![[4, 4]];
        let err = update_lagrangian_mult(
            array![[1.0, 1.0]].view(),
            array![[1.0, 1.0, 1.0]].view(),
            count_matrices.view(),
            state_counts.view(),
        )
        .unwrap_err();
        match err {
            TramError::ShapeMismatch {
                name,
                actual,
                expected,
            } => {
                assert_eq!(name, "biased_conf_weights");
                assert_eq!(actual, vec![1, 3]);
                assert_eq!(expected, vec![1, 2]);
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[test]
    fn malformed_trajectories_are_rejected() {
        let count_matrices = array![[[2, 1], [1, 2]]];
        let state_counts = array![[4, 4]];
        let lagrangian_mult = array![[3.0, 3.0]];
        let biased_conf_weights = array![[1.0, 1.0]];
        let bias_sequence = Array2::<f64>::zeros((3, 1));

        let err = update_biased_conf_weights(
            lagrangian_mult.view(),
            biased_conf_weights.view(),
            count_matrices.view(),
            bias_sequence.view(),
            array![0, 2, 1].view(),
            state_counts.view(),
        )
        .unwrap_err();
        assert!(matches!(err, TramError::StateOutOfRange { frame: 1, state: 2, .. }));

        let err = update_biased_conf_weights(
            lagrangian_mult.view(),
            biased_conf_weights.view(),
            count_matrices.view(),
            bias_sequence.view(),
            array![0, 1].view(),
            state_counts.view(),
        )
        .unwrap_err();
        assert!(matches!(err, TramError::ShapeMismatch { name: "bias_sequence", .. }));

        let nan_bias = array![[0.0], [f64::NAN], [0.0]];
        let err = update_biased_conf_weights(
            lagrangian_mult.view(),
            biased_conf_weights.view(),
            count_matrices.view(),
            nan_bias.view(),
            array![0, 1, 1].view(),
            state_counts.view(),
        )
        .unwrap_err();
        assert!(matches!(err, TramError::InvalidBias { frame: 1, therm_state: 0, .. }));
    }

    #[test]
    fn counts_must_fit_inside_visits() {
        let err = update_lagrangian_mult(
            array![[1.0, 1.0]].view(),
            array![[1.0, 1.0]].view(),
            array![[[2, 1], [1, 2]]].view(),
            array![[2, 4]].view(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TramError::InconsistentCounts {
                therm_state: 0,
                conf_state: 0,
                visits: 2,
                transitions: 3,
                ..
            }
        ));
    }

    #[test]
    fn negative_iterates_are_rejected() {
        let err = update_lagrangian_mult(
            array![[1.0, -1.0]].view(),
            array![[1.0, 1.0]].view(),
            array![[[2, 1], [1, 2]]].view(),
            array![[4, 4]].view(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TramError::InvalidIterate {
                name: "lagrangian_mult",
                conf_state: 1,
                ..
            }
        ));
    }

    #[test]
    fn transition_matrices_are_stochastic_and_reversible() {
        let count_matrices = array![[[6, 2, 0], [3, 5, 2], [0, 1, 7]]];
        let lagrangian_mult = array![[5.0, 4.0, 6.0]];
        let biased_conf_weights = array![[0.5, 0.3, 0.2]];

        let p = estimate_transition_matrices(
            lagrangian_mult.view(),
            biased_conf_weights.view(),
            count_matrices.view(),
        )
        .unwrap();

        for i in 0..3 {
            let row_sum: f64 = (0..3).map(|j| p[[0, i, j]]).sum();
            assert!((row_sum - 1.0).abs() < 1e-12);
            for j in 0..3 {
                assert!(p[[0, i, j]] >= 0.0);
                let forward = biased_conf_weights[[0, i]] * p[[0, i, j]];
                let backward = biased_conf_weights[[0, j]] * p[[0, j, i]];
                assert!((forward - backward).abs() < 1e-12);
            }
        }
        assert_eq!(p[[0, 0, 2]], 0.0);
    }

    fn two_state_pair() -> (Array3<usize>, Array2<usize>, Array2<f64>, Array2<f64>) {
        let count_matrices = array![[[2, 1], [1, 2]], [[2, 1], [1, 2]]];
        let state_counts = array![[4, 4], [4, 4]];
        let lagrangian_mult = init_lagrangian_mult(count_matrices.view()).unwrap();
        let biased_conf_weights = Array2::ones((2, 2));
        (count_matrices, state_counts, lagrangian_mult, biased_conf_weights)
    }

    #[test]
    fn frames_impossible_everywhere_are_skipped() {
        let (count_matrices, state_counts, lagrangian_mult, biased_conf_weights) =
            two_state_pair();
        let state_sequence = array![0, 1, 0, 1, 0];
        let mut bias_sequence = Array2::<f64>::zeros((5, 2));
        bias_sequence[[4, 0]] = f64::INFINITY;
        bias_sequence[[4, 1]] = f64::INFINITY;

        let update = update_biased_conf_weights(
            lagrangian_mult.view(),
            biased_conf_weights.view(),
            count_matrices.view(),
            bias_sequence.view(),
            state_sequence.view(),
            state_counts.view(),
        )
        .unwrap();
        assert_eq!(update.r_k_i, array![[4.0, 4.0], [4.0, 4.0]]);
        // two frames per state remain, each shared as 1 / (4 + 4)
        for &w in update.biased_conf_weights.iter() {
            assert!((w - 0.25).abs() < 1e-12);
        }
    }

    #[test]
    fn infinite_bias_in_one_state_only_drops_that_share() {
        let (count_matrices, state_counts, lagrangian_mult, biased_conf_weights) =
            two_state_pair();
        let state_sequence = array![0, 1, 0, 1, 0];
        let mut bias_sequence = Array2::<f64>::zeros((5, 2));
        bias_sequence[[4, 1]] = f64::INFINITY;

        let update = update_biased_conf_weights(
            lagrangian_mult.view(),
            biased_conf_weights.view(),
            count_matrices.view(),
            bias_sequence.view(),
            state_sequence.view(),
            state_counts.view(),
        )
        .unwrap();
        let w = &update.biased_conf_weights;
        // frame 4 counts as 1 / 4 for thermodynamic state 0 and nothing for state 1
        assert!((w[[0, 0]] - 0.5).abs() < 1e-12);
        assert!((w[[1, 0]] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn negative_infinite_bias_is_rejected() {
        let (count_matrices, state_counts, lagrangian_mult, biased_conf_weights) =
            two_state_pair();
        let mut bias_sequence = Array2::<f64>::zeros((5, 2));
        bias_sequence[[4, 0]] = f64::NEG_INFINITY;
        bias_sequence[[4, 1]] = f64::INFINITY;

        let err = update_biased_conf_weights(
            lagrangian_mult.view(),
            biased_conf_weights.view(),
            count_matrices.view(),
            bias_sequence.view(),
            array![0, 1, 0, 1, 0].view(),
            state_counts.view(),
        )
        .unwrap_err();
        match err {
            TramError::InvalidBias {
                frame,
                therm_state,
                value,
            } => {
                assert_eq!((frame, therm_state), (4, 0));
                assert_eq!(value, f64::NEG_INFINITY);
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[test]
    fn output_buffers_must_match_the_declared_extents() {
        let count_matrices = array![[[2, 1], [1, 2]]];
        let state_counts = array![[4, 4]];
        let lagrangian_mult = array![[3.0, 3.0]];
        let biased_conf_weights = array![[1.0, 1.0]];
        let state_sequence = array![0, 0, 0, 1, 1, 1, 0, 1];
        let bias_sequence = Array2::<f64>::zeros((8, 1));

        let mut too_big = Array2::zeros((2, 2));
        let err = update_lagrangian_mult_into(
            lagrangian_mult.view(),
            biased_conf_weights.view(),
            count_matrices.view(),
            state_counts.view(),
            too_big.view_mut(),
        )
        .unwrap_err();
        assert!(matches!(err, TramError::ShapeMismatch { name: "new_lagrangian_mult", .. }));

        let mut fits = Array2::zeros((1, 2));
        let err = update_biased_conf_weights_into(
            lagrangian_mult.view(),
            biased_conf_weights.view(),
            count_matrices.view(),
            bias_sequence.view(),
            state_sequence.view(),
            state_counts.view(),
            too_big.view_mut(),
            fits.view_mut(),
        )
        .unwrap_err();
        assert!(matches!(err, TramError::ShapeMismatch { name: "r_k_i", .. }));

        let mut r_k_i = Array2::zeros((1, 2));
        let err = update_biased_conf_weights_into(
            lagrangian_mult.view(),
            biased_conf_weights.view(),
            count_matrices.view(),
            bias_sequence.view(),
            state_sequence.view(),
            state_counts.view(),
            r_k_i.view_mut(),
            too_big.view_mut(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TramError::ShapeMismatch {
                name: "new_biased_conf_weights",
                ..
            }
        ));
        // nothing was written before the check failed
        assert_eq!(r_k_i, Array2::<f64>::zeros((1, 2)));
    }

    #[test]
    fn partitions_cover_the_trajectory_with_bounded_count() {
        assert!(partitions(0).is_empty());
        assert_eq!(partitions(10), vec![0..10]);
        assert_eq!(partitions(9003), vec![0..3001, 3001..6002, 6002..9003]);

        for &seq_length in &[4096, 4097, 300_000, 10_000_000] {
            let parts = partitions(seq_length);
            assert!(parts.len() <= MAX_PARTITIONS);
            assert_eq!(parts[0].start, 0);
            assert_eq!(parts.last().unwrap().end, seq_length);
            for pair in parts.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
                assert!(!pair[0].is_empty());
            }
        }
        assert_eq!(partitions(10_000_000).len(), MAX_PARTITIONS);
    }

    #[test]
    fn free_energies_of_the_symmetric_system() {
        let count_matrices = array![[[2, 1], [1, 2]]];
        let state_counts = array![[4, 4]];
        let state_sequence = array![0, 0, 0, 1, 1, 1, 0, 1];
        let bias_sequence = Array2::<f64>::zeros((8, 1));

        let free_energies = estimate_free_energies(
            array![[3.0, 3.0]].view(),
            array![[1.0, 1.0]].view(),
            count_matrices.view(),
            bias_sequence.view(),
            state_sequence.view(),
            state_counts.view(),
        )
        .unwrap();
        // every frame has mu = 1 / 4
        for &f in free_energies.conf_energies.iter() {
            assert!(f.abs() < 1e-12);
        }
        assert!((free_energies.therm_energies[0] + 2.0_f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn unvisited_states_have_infinite_conf_energy() {
        let count_matrices = array![[[3, 0], [0, 0]]];
        let state_counts = array![[4, 0]];
        let free_energies = estimate_free_energies(
            array![[3.0, 0.0]].view(),
            array![[1.0, 0.0]].view(),
            count_matrices.view(),
            Array2::<f64>::zeros((4, 1)).view(),
            array![0, 0, 0, 0].view(),
            state_counts.view(),
        )
        .unwrap();
        assert!(free_energies.conf_energies[0].abs() < 1e-12);
        assert_eq!(free_energies.conf_energies[1], f64::INFINITY);
    }

    #[test]
    fn log_likelihood_of_the_symmetric_system() {
        let count_matrices = array![[[2, 1], [1, 2]]];
        let state_counts = array![[4, 4]];
        let state_sequence = array![0, 0, 0, 1, 1, 1, 0, 1];
        let bias_sequence = Array2::<f64>::zeros((8, 1));
        let log_likelihood = |weight: f64| {
            log_likelihood_lower_bound(
                array![[3.0, 3.0]].view(),
                array![[weight, weight]].view(),
                count_matrices.view(),
                bias_sequence.view(),
                state_sequence.view(),
                state_counts.view(),
            )
            .unwrap()
        };

        // p = [[2/3, 1/3], [1/3, 2/3]] and D(x) = 4 for every frame
        let expected =
            4.0 * (2.0_f64 / 3.0).ln() + 2.0 * (1.0_f64 / 3.0).ln() - 8.0 * 4.0_f64.ln();
        assert!((log_likelihood(1.0) - expected).abs() < 1e-10);
        assert!((log_likelihood(0.125) - expected).abs() < 1e-10);
    }

    #[test]
    fn initial_multipliers_are_half_the_symmetrised_row_sums() {
        let count_matrices = array![[[2, 1], [3, 4]]];
        let lagrangian_mult = init_lagrangian_mult(count_matrices.view()).unwrap();
        assert_eq!(lagrangian_mult, array![[4.0, 6.0]]);

        let err = init_lagrangian_mult(Array3::<usize>::zeros((1, 2, 3)).view()).unwrap_err();
        assert!(matches!(err, TramError::ShapeMismatch { name: "count_matrices", .. }));
    }
}
