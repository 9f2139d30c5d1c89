//! Python extension module `tram_direct`, built with the `python` feature.
//!
//! Mirrors the array layout of the C extension this replaces: count arrays are C `int` (`int32`),
//! everything else is `float64`, and bias energies are indexed `[k, t]`.

use crate::errors::*;
use crate::tram_direct;
use ndarray::{Array, Array2, Dimension};
use numpy::{PyArray, PyArray1, PyArray2, PyArray3};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::wrap_pyfunction;

impl From<TramError> for PyErr {
    fn from(err: TramError) -> PyErr {
        match err {
            TramError::UnhandledPythonException { source } => source,
            other => PyErr::new::<PyValueError, _>(other.to_string()),
        }
    }
}

fn counts<D: Dimension>(name: &'static str, array: &PyArray<i32, D>) -> Result<Array<usize, D>> {
    let array = array.to_owned_array();
    if let Some(&value) = array.iter().find(|&&c| c < 0) {
        return Err(TramError::NegativeCount {
            name,
            value: value.into(),
        });
    }
    Ok(array.mapv(|c| c as usize))
}

/// Bias energies arrive as `[k, t]`; the kernels index them `[t, k]`
fn frames_first(bias_sequence: Array2<f64>) -> Array2<f64> {
    bias_sequence.reversed_axes()
}

/// update_lagrangian_mult(lagrangian_mult, biased_conf_weights, count_matrices, state_counts)
///
/// Returns the updated K×M Lagrangian multipliers.
#[pyfunction]
fn update_lagrangian_mult<'py>(
    py: Python<'py>,
    lagrangian_mult: &PyArray2<f64>,
    biased_conf_weights: &PyArray2<f64>,
    count_matrices: &PyArray3<i32>,
    state_counts: &PyArray2<i32>,
) -> PyResult<&'py PyArray2<f64>> {
    let lagrangian_mult = lagrangian_mult.to_owned_array();
    let biased_conf_weights = biased_conf_weights.to_owned_array();
    let count_matrices = counts("count_matrices", count_matrices)?;
    let state_counts = counts("state_counts", state_counts)?;

    let new_lagrangian_mult = tram_direct::update_lagrangian_mult(
        lagrangian_mult.view(),
        biased_conf_weights.view(),
        count_matrices.view(),
        state_counts.view(),
    )?;
    Ok(PyArray::from_array(py, &new_lagrangian_mult))
}

/// update_biased_conf_weights(lagrangian_mult, biased_conf_weights, count_matrices,
///                            bias_sequence, state_sequence, state_counts)
///
/// `bias_sequence[k, t]` is the bias of frame `t` in thermodynamic state `k` (K×T). Returns
/// `(new_biased_conf_weights, R)`, both K×M.
#[pyfunction]
fn update_biased_conf_weights<'py>(
    py: Python<'py>,
    lagrangian_mult: &PyArray2<f64>,
    biased_conf_weights: &PyArray2<f64>,
    count_matrices: &PyArray3<i32>,
    bias_sequence: &PyArray2<f64>,
    state_sequence: &PyArray1<i32>,
    state_counts: &PyArray2<i32>,
) -> PyResult<(&'py PyArray2<f64>, &'py PyArray2<f64>)> {
    let lagrangian_mult = lagrangian_mult.to_owned_array();
    let biased_conf_weights = biased_conf_weights.to_owned_array();
    let count_matrices = counts("count_matrices", count_matrices)?;
    let bias_sequence = frames_first(bias_sequence.to_owned_array());
    let state_sequence = counts("state_sequence", state_sequence)?;
    let state_counts = counts("state_counts", state_counts)?;

    let update = tram_direct::update_biased_conf_weights(
        lagrangian_mult.view(),
        biased_conf_weights.view(),
        count_matrices.view(),
        bias_sequence.view(),
        state_sequence.view(),
        state_counts.view(),
    )?;
    Ok((
        PyArray::from_array(py, &update.biased_conf_weights),
        PyArray::from_array(py, &update.r_k_i),
    ))
}

/// init_lagrangian_mult(count_matrices)
///
/// Returns half the symmetrised row sums of every count matrix.
#[pyfunction]
fn init_lagrangian_mult<'py>(
    py: Python<'py>,
    count_matrices: &PyArray3<i32>,
) -> PyResult<&'py PyArray2<f64>> {
    let count_matrices = counts("count_matrices", count_matrices)?;
    let lagrangian_mult = tram_direct::init_lagrangian_mult(count_matrices.view())?;
    Ok(PyArray::from_array(py, &lagrangian_mult))
}

/// Direct-space TRAM update kernels
#[pymodule]
fn tram_direct(_py: Python<'_>, m: &PyModule) -> PyResult<()> {
    m.add_wrapped(wrap_pyfunction!(update_lagrangian_mult))?;
    m.add_wrapped(wrap_pyfunction!(update_biased_conf_weights))?;
    m.add_wrapped(wrap_pyfunction!(init_lagrangian_mult))?;
    Ok(())
}
