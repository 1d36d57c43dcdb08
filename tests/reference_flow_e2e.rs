use approx::assert_relative_eq;
use ndarray::Array2;
use pinnflow::analytic::Poiseuille;
use pinnflow::calibration::{calibrate, CalibrationConfig, PoiseuilleFitter};
use pinnflow::field::FieldModel;
use pinnflow::geometry::{BoundaryTag, Domain};
use pinnflow::measurements::{CoordinateUnit, MeasurementSet};
use pinnflow::params::{PhysicalParams, Scales, StandardCase};
use pinnflow::residual;
use pinnflow::sampler::{sample, SamplerConfig};
use pinnflow::surrogate::TrainedSurrogate;

/// Dense measurement table for a standard case, written the way a CFD export looks
/// (coordinates in millimetres, `%` header lines).
fn comsol_export(case: StandardCase) -> String {
    let (d, p) = case.setup().expect("standard case");
    let truth = Poiseuille::new(&d, &p).expect("poiseuille");
    let w = case.width();
    let mut out = String::from("% Model: straight_channel.mph\n% Dimension: 2\n% x y u v p\n");
    for i in 0..40 {
        for j in 1..10 {
            let x = StandardCase::LENGTH * (i as f64 + 0.5) / 40.0;
            let y = w * j as f64 / 10.0;
            let [u, v, pr] = {
                let o = truth
                    .predict(&ndarray::array![[x, y]].view())
                    .expect("predict");
                [o[[0, 0]], o[[0, 1]], o[[0, 2]]]
            };
            out.push_str(&format!("{} {} {u:e} {v:e} {pr:e}\n", x * 1e3, y * 1e3));
        }
    }
    out
}

#[test]
fn reference_channel_scenario_holds_for_the_exact_solution() {
    let (d, p) = StandardCase::V08W200.setup().unwrap();
    let s = TrainedSurrogate::new(Poiseuille::new(&d, &p).unwrap(), d.clone(), p);

    let w = StandardCase::V08W200.width();
    let centre = s.predict_single_point(0.005, 0.5 * w).unwrap();
    assert_relative_eq!(centre[0], 1.5 * p.inlet_velocity, max_relative = 1e-10);
    let wall = s.predict_single_point(0.005, 0.0).unwrap();
    assert!(wall[0].abs() < 1e-15);
    let inlet = s.predict_single_point(0.0, 0.5 * w).unwrap();
    let outlet = s.predict_single_point(StandardCase::LENGTH, 0.5 * w).unwrap();
    assert!(inlet[2] - outlet[2] > 0.0);

    // Mass conservation along the channel.
    let q0 = s.cross_section_flux(0.001, 200).unwrap();
    for x in [0.003, 0.005, 0.007, 0.009] {
        assert_relative_eq!(s.cross_section_flux(x, 200).unwrap(), q0, max_relative = 1e-9);
    }
    assert!(s.max_wall_slip(64).unwrap() < 1e-15);

    // Residuals vanish at sampled collocation points.
    let (set, _) = sample(&d, &p, &SamplerConfig::default(), 0).unwrap();
    let r = residual::evaluate(
        s.field(),
        &set.residual_points().view(),
        p.density,
        p.viscosity,
    )
    .unwrap();
    let rms = r.normalized_rms(&Scales::new(&d, &p));
    assert!(rms.iter().all(|&x| x < 1e-9), "{rms:?}");
}

#[test]
fn sampler_is_reproducible_on_every_geometry() {
    let p = PhysicalParams::new(1.0, 0.05, 1.0).unwrap();
    let domains = [
        Domain::rectangle(3.0, 1.0).unwrap(),
        Domain::t_junction(4.0, 2.0, 1.0, 2.0).unwrap(),
        Domain::y_junction(2.0, 2.0, 0.6, 35.0).unwrap(),
    ];
    let cfg = SamplerConfig {
        interior: 500,
        seed: 11,
        ..SamplerConfig::default()
    };
    for d in &domains {
        let (a, wa) = sample(d, &p, &cfg, 3).unwrap();
        let (b, wb) = sample(d, &p, &cfg, 3).unwrap();
        assert_eq!(a, b);
        assert_eq!(wa, wb);
        // Every tagged segment contributes boundary points.
        for tag in [BoundaryTag::Inlet, BoundaryTag::Outlet, BoundaryTag::Wall] {
            assert!(!a.boundary.rows_tagged(tag).is_empty(), "{tag:?}");
        }
    }
}

#[test]
fn millimetre_export_calibrates_to_water() {
    let case = StandardCase::V08W200;
    let (d, p) = case.setup().unwrap();
    let (dense, unit) = MeasurementSet::from_reader(comsol_export(case).as_bytes(), &d).unwrap();
    assert_eq!(unit, CoordinateUnit::Millimeters);
    assert_eq!(dense.len(), 360);
    let stats = dense.stats();
    assert!(stats.coord_max[0] <= StandardCase::LENGTH);

    let sparse = dense
        .subsample(5, 42)
        .unwrap()
        .with_gaussian_noise(0.05, 42)
        .unwrap();
    let cal = calibrate(
        &PoiseuilleFitter,
        &d,
        &p,
        &sparse,
        (1e-4, 1e-2),
        &CalibrationConfig {
            golden_iters: 40,
            log_tol: 1e-3,
            ..CalibrationConfig::default()
        },
    )
    .unwrap();
    assert!(
        (cal.viscosity / p.viscosity - 1.0).abs() < 0.2,
        "estimate {:e}",
        cal.viscosity
    );
    // The dense source set is untouched by subsampling and noise.
    assert_eq!(dense.noise(), 0.0);
}

#[test]
fn exported_grid_matches_point_queries() {
    let (d, p) = StandardCase::V02W150.setup().unwrap();
    let s = TrainedSurrogate::new(Poiseuille::new(&d, &p).unwrap(), d, p);
    let g = s
        .predict_flow_field(StandardCase::LENGTH, StandardCase::V02W150.width(), 21, 7)
        .unwrap();
    let mut pts = Array2::zeros((g.x.len(), 2));
    for (k, (x, y)) in g.x.iter().zip(g.y.iter()).enumerate() {
        pts[[k, 0]] = *x;
        pts[[k, 1]] = *y;
    }
    let flat = s.predict_multiple_points(&pts.view()).unwrap();
    for (k, u) in g.u.iter().enumerate() {
        assert_relative_eq!(*u, flat.u[k], max_relative = 1e-12, epsilon = 1e-18);
    }
}
