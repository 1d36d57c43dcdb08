//! Viscosity calibration demo.
//!
//! Usage: `cargo run --release --example calibrate_viscosity [config.json]`
//!
//! Uses the measurement table named in the config when there is one. Otherwise five sensors are
//! drawn from the exact channel solution at the configured viscosity with 10% noise, and the
//! loop is asked to find that viscosity again.
//!
//! Prints every scored candidate and the estimate.

use pinnflow::analytic::Poiseuille;
use pinnflow::calibration::calibrate;
use pinnflow::config::RunConfig;
use pinnflow::measurements::MeasurementSet;
use pinnflow::sampler::{sample, SamplerConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cfg = match std::env::args().nth(1) {
        Some(path) => RunConfig::from_path(path)?,
        None => RunConfig::default(),
    };
    let (domain, params) = cfg.setup()?;

    let measurements = match &cfg.measurements {
        Some(path) => MeasurementSet::from_path(path, &domain)?.0,
        None => {
            // Five interior sensors in the fully developed flow.
            let truth = Poiseuille::new(&domain, &params)?;
            let sensors = SamplerConfig {
                interior: 5,
                seed: 7,
                ..SamplerConfig::default()
            };
            let (set, _) = sample(&domain, &params, &sensors, 0)?;
            MeasurementSet::from_field(&truth, set.interior)?.with_gaussian_noise(0.1, 7)?
        }
    };
    let range = cfg
        .viscosity_range
        .unwrap_or((0.2 * params.viscosity, 5.0 * params.viscosity));
    println!(
        "{} measurements, searching mu in [{:e}, {:e}] Pa·s",
        measurements.len(),
        range.0,
        range.1
    );

    let cal = calibrate(
        &cfg.fitter(),
        &domain,
        &params,
        &measurements,
        range,
        &cfg.calibration,
    )?;
    for e in &cal.evaluations {
        println!("  mu={:.4e}  data_loss={:.4e}", e.viscosity, e.data_loss);
    }
    println!(
        "estimate mu={:.4e} Pa·s (data_loss={:.3e}, zero-flow baseline={:.3e})",
        cal.viscosity, cal.data_loss, cal.baseline_loss
    );
    if cfg.measurements.is_none() {
        println!(
            "generating viscosity {:.4e} Pa·s, relative error {:.1}%",
            params.viscosity,
            100.0 * (cal.viscosity / params.viscosity - 1.0).abs()
        );
    }
    Ok(())
}
