use pinnflow::analytic::Poiseuille;
use pinnflow::calibration::{calibrate, CalibrationConfig, PinnFitter};
use pinnflow::field::MlpConfig;
use pinnflow::geometry::Domain;
use pinnflow::measurements::MeasurementSet;
use pinnflow::optim::AdamConfig;
use pinnflow::params::PhysicalParams;
use pinnflow::sampler::SamplerConfig;
use pinnflow::trainer::{AdamStageConfig, RefineStageConfig, TrainConfig};

/// Five pressure-and-velocity sensors along a unit-width channel, from the exact solution at
/// the true viscosity, with 10% multiplicative noise.
fn sensors(domain: &Domain, truth: &PhysicalParams) -> MeasurementSet {
    let field = Poiseuille::new(domain, truth).expect("poiseuille");
    let coords = ndarray::array![
        [0.5, 0.3],
        [1.2, 0.5],
        [2.0, 0.7],
        [2.8, 0.4],
        [3.4, 0.6],
    ];
    MeasurementSet::from_field(&field, coords)
        .and_then(|m| m.with_gaussian_noise(0.1, 2024))
        .expect("measurements")
}

fn fitter() -> PinnFitter {
    PinnFitter {
        network: MlpConfig {
            hidden: vec![24, 24, 24],
            seed: 4,
            ..MlpConfig::default()
        },
        train: TrainConfig {
            sampler: SamplerConfig {
                interior: 800,
                boundary: 160,
                ..SamplerConfig::default()
            },
            adam: AdamStageConfig {
                optimizer: AdamConfig {
                    lr: 3e-3,
                    ..AdamConfig::default()
                },
                max_iters: 3_000,
                ..AdamStageConfig::default()
            },
            refine: RefineStageConfig {
                max_iters: 500,
                ..RefineStageConfig::default()
            },
            log_every: 0,
            ..TrainConfig::default()
        },
        train_on_measurements: false,
    }
}

#[test]
#[ignore = "trains a network per candidate viscosity; run with --release -- --ignored"]
fn pinn_calibration_recovers_viscosity_and_is_repeatable() {
    let _ = env_logger::builder().is_test(true).try_init();
    let domain = Domain::rectangle(4.0, 1.0).unwrap();
    let truth = PhysicalParams::new(1.0, 0.05, 1.0).unwrap();
    let m = sensors(&domain, &truth);
    let cfg = CalibrationConfig {
        coarse_candidates: 5,
        golden_iters: 6,
        ..CalibrationConfig::default()
    };
    let base = truth.with_viscosity(0.1);

    let a = calibrate(&fitter(), &domain, &base, &m, (0.01, 0.25), &cfg).unwrap();
    assert!(
        (a.viscosity / truth.viscosity - 1.0).abs() < 0.2,
        "estimate {}",
        a.viscosity
    );
    assert!(a.data_loss < a.baseline_loss);

    let b = calibrate(&fitter(), &domain, &base, &m, (0.01, 0.25), &cfg).unwrap();
    assert!((a.viscosity / b.viscosity - 1.0).abs() < 1e-6);
}
