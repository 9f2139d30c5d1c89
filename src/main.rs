use rand::{rngs::StdRng, SeedableRng};
use tram_rs::testsystems::*;
use tram_rs::*;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let mut rng = StdRng::seed_from_u64(2016);
    let chain = MetropolisChain::random(4, 4, &mut rng)?;
    let Sample {
        count_matrices,
        state_counts,
        state_sequence,
        bias_sequence,
    } = chain.sample(10000, 0, &mut rng)?;

    let tram = TramDirect::builder()
        .count_matrices(count_matrices)
        .state_counts(state_counts)
        .bias_sequence(bias_sequence)
        .state_sequence(state_sequence)
        .tolerance(1.0e-10)
        .build()?;

    let estimate = tram.estimate().map_err(|e| {
        println!("{}", e);
        e
    })?;

    let energies = chain.energies();
    let min_energy = energies.fold(f64::INFINITY, |min, &e| min.min(e));
    let f = estimate.biased_conf_energies();
    let min_f = f.fold(f64::INFINITY, |min, &e| min.min(e));

    println!(
        "converged: {} after {} iterations",
        estimate.converged, estimate.iterations
    );
    for k in 0..tram.n_therm_states() {
        let recovered: Vec<_> = f.row(k).iter().map(|e| e - min_f).collect();
        let exact: Vec<_> = energies.row(k).iter().map(|e| e - min_energy).collect();
        println!("{:?}", recovered);
        println!("{:?}", exact);
    }
    let conf_energies: Vec<_> = estimate
        .conf_energies
        .iter()
        .map(|f| f - estimate.conf_energies[0])
        .collect();
    println!("unbiased: {:?}", conf_energies);
    println!("therm: {}", estimate.therm_energies);

    Ok(())
}
