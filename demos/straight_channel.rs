//! Straight-channel reconstruction demo.
//!
//! Usage: `cargo run --release --example straight_channel [config.json] [out.json]`
//!
//! Trains a surrogate for the configured domain (default: the `v0.8_w200` channel), then prints:
//! - the loss trace summary per stage
//! - centreline peak velocity against `1.5·v_in`
//! - wall slip, pressure drop, and cross-section flux along the channel
//!
//! Set `RUST_LOG=info` (or `debug`) to follow the stages.

use pinnflow::config::RunConfig;
use pinnflow::measurements::MeasurementSet;
use pinnflow::trainer::{train_pinn, TrainState};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let cfg = match args.next() {
        Some(path) => RunConfig::from_path(path)?,
        None => RunConfig::default(),
    };
    let out_path = args.next().unwrap_or_else(|| "surrogate.json".to_string());

    let (domain, params) = cfg.setup()?;
    let measurements = match &cfg.measurements {
        Some(path) => Some(MeasurementSet::from_path(path, &domain)?.0),
        None => None,
    };
    println!(
        "domain: {} vertices, area={:e} m², Re={:.3}",
        domain.vertices().len(),
        domain.area(),
        params.reynolds(domain.characteristic_length())
    );

    let out = train_pinn(&domain, &params, &cfg.network, measurements.as_ref(), &cfg.train)?;
    for stage in [TrainState::AdamStage, TrainState::RefineStage] {
        let recs: Vec<_> = out.trace.stage(stage).collect();
        if let (Some(first), Some(last)) = (recs.first(), recs.last()) {
            println!(
                "{stage}: {} iterations, total {:.3e} -> {:.3e} (physics {:.3e}, bc {:.3e})",
                recs.len(),
                first.total,
                last.total,
                last.physics,
                last.bc
            );
        }
    }
    println!("termination: {:?}", out.termination);
    for w in &out.warnings {
        println!("warning: {w:?}");
    }

    let s = &out.surrogate;
    let (lo, hi) = domain.bounding_box();
    let yc = 0.5 * (lo[1] + hi[1]);
    let mid = s.predict_single_point(0.5 * (lo[0] + hi[0]), yc)?;
    let inlet = s.predict_single_point(lo[0], yc)?;
    let outlet = s.predict_single_point(hi[0], yc)?;
    println!(
        "centreline u = {:.4e} m/s ({:.3}·v_in, fully developed: 1.5)",
        mid[0],
        mid[0] / params.inlet_velocity
    );
    println!("max wall slip = {:.3e} m/s", s.max_wall_slip(100)?);
    println!("pressure drop = {:.4e} Pa", inlet[2] - outlet[2]);
    for k in 1..=4 {
        let x = lo[0] + (hi[0] - lo[0]) * k as f64 / 5.0;
        println!("flux at x={x:.4e}: {:.4e} m²/s", s.cross_section_flux(x, 200)?);
    }

    s.save_json(&out_path)?;
    println!("saved surrogate to {out_path}");
    Ok(())
}
