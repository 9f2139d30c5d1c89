#![warn(rust_2018_idioms, missing_docs, missing_debug_implementations)]

//! The transition-based reweighting analysis method (TRAM) for Markov state models built from
//! simulations under multiple thermodynamic states, such as replica exchange, umbrella sampling
//! or simulations at several temperatures.
//!
//! This crate provides the direct-space update kernels of the TRAM self-consistent iteration:
//! [`update_lagrangian_mult`] and [`update_biased_conf_weights`]. Both are pure functions of
//! their inputs, so a driver holds the iterate and alternates them; [`TramDirect`] is such a
//! driver.
//!
//! Please reference the following if you use this code in your research:
//!
//! [1] Wu H, Paul F, Wehmeyer C and Noé F. Multiensemble Markov models of molecular
//! thermodynamics and kinetics. PNAS 113:E3221, 2016. <http://dx.doi.org/10.1073/pnas.1525092113>

#[macro_use]
extern crate derive_builder;

pub mod errors;
pub mod estimator;
pub mod lse;
#[cfg(feature = "python")]
mod python;
pub mod testsystems;
pub mod tram_direct;

pub use errors::{Result, TramError};
pub use estimator::{Estimate, TramDirect, TramDirectBuilder};
pub use tram_direct::{
    estimate_free_energies, estimate_transition_matrices, init_lagrangian_mult,
    log_likelihood_lower_bound, update_biased_conf_weights, update_biased_conf_weights_into,
    update_lagrangian_mult, update_lagrangian_mult_into, FreeEnergies, WeightUpdate,
};
