//! The network-as-continuous-field abstraction.
//!
//! A field maps coordinates `(x, y)` to `(u, v, p)`. Training needs more than values: the
//! viscous terms need second spatial derivatives, and the optimizer needs gradients with respect
//! to the parameters. We get both without finite differences:
//!
//! - **Input derivatives** are propagated forward as a *jet* `(f, ∂f/∂x, ∂f/∂y, ∂²f/∂x², ∂²f/∂y²)`
//!   through every layer (truncated Taylor-mode forward differentiation).
//! - **Parameter gradients** come from a reverse sweep over the recorded forward tape, which
//!   differentiates the jet propagation itself.
//!
//! Callers only see the capability traits ([`FieldModel`], [`TrainableField`]), so other
//! architectures can be substituted without touching the residual or loss code.

use crate::geometry::Domain;
use crate::params::{PhysicalParams, Scales};
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

/// Output columns.
pub const U: usize = 0;
pub const V: usize = 1;
pub const P: usize = 2;

/// Values and pure spatial derivatives (up to second order) of a batch of vector outputs.
///
/// Every array has shape `(n_points, n_outputs)`. Mixed derivatives are not tracked; the
/// Navier–Stokes residuals only need the Laplacian.
#[derive(Debug, Clone, PartialEq)]
pub struct Jet {
    pub value: Array2<f64>,
    pub dx: Array2<f64>,
    pub dy: Array2<f64>,
    pub dxx: Array2<f64>,
    pub dyy: Array2<f64>,
}

impl Jet {
    pub fn zeros(n: usize, k: usize) -> Self {
        Self {
            value: Array2::zeros((n, k)),
            dx: Array2::zeros((n, k)),
            dy: Array2::zeros((n, k)),
            dxx: Array2::zeros((n, k)),
            dyy: Array2::zeros((n, k)),
        }
    }

    pub fn nrows(&self) -> usize {
        self.value.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.value.ncols()
    }

    /// Keep only the given rows (in the given order).
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            value: self.value.select(Axis(0), rows),
            dx: self.dx.select(Axis(0), rows),
            dy: self.dy.select(Axis(0), rows),
            dxx: self.dxx.select(Axis(0), rows),
            dyy: self.dyy.select(Axis(0), rows),
        }
    }

    /// Whether every component of row `i` is finite.
    pub fn row_is_finite(&self, i: usize) -> bool {
        [&self.value, &self.dx, &self.dy, &self.dxx, &self.dyy]
            .iter()
            .all(|a| a.row(i).iter().all(|x| x.is_finite()))
    }

    fn parts(&self) -> [&Array2<f64>; 5] {
        [&self.value, &self.dx, &self.dy, &self.dxx, &self.dyy]
    }
}

/// Read-only capability of a continuous flow field.
pub trait FieldModel {
    /// `(u, v, p)` at each row of `coords` (`n × 2`), returned as `n × 3`.
    fn predict(&self, coords: &ArrayView2<f64>) -> Result<Array2<f64>> {
        Ok(self.predict_with_gradients(coords)?.value)
    }

    /// `(u, v, p)` with first and pure second spatial derivatives.
    fn predict_with_gradients(&self, coords: &ArrayView2<f64>) -> Result<Jet>;
}

/// A field whose parameters can be optimized.
///
/// Parameters are exchanged as one flat vector so optimizers stay architecture agnostic.
pub trait TrainableField: FieldModel + Clone + Send + Sync {
    /// Whatever the forward pass needs to keep for [`Self::backward`].
    type Tape;

    fn num_params(&self) -> usize;

    fn params(&self) -> Array1<f64>;

    fn set_params(&mut self, params: &ArrayView1<f64>) -> Result<()>;

    /// Forward pass that records a tape.
    fn forward_tape(&self, coords: &ArrayView2<f64>) -> Result<(Jet, Self::Tape)>;

    /// Gradient of a scalar `L` with respect to the flat parameters, given
    /// `adjoint = ∂L/∂jet` for the jet returned by the matching [`Self::forward_tape`].
    fn backward(&self, tape: &Self::Tape, adjoint: &Jet) -> Array1<f64>;
}

pub(crate) fn check_coords(coords: &ArrayView2<f64>) -> Result<()> {
    if coords.ncols() != 2 {
        return Err(Error::Shape("coordinates must have exactly two columns (x, y)"));
    }
    Ok(())
}

/// Smooth activations; piecewise-linear ones would zero the viscous terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Activation {
    #[default]
    Tanh,
    Sine,
}

impl Activation {
    /// `[σ(z), σ'(z), σ''(z), σ'''(z)]`.
    #[inline]
    fn derivatives(self, z: f64) -> [f64; 4] {
        match self {
            Activation::Tanh => {
                let a = z.tanh();
                let s1 = 1.0 - a * a;
                let s2 = -2.0 * a * s1;
                let s3 = -2.0 * s1 * s1 - 2.0 * a * s2;
                [a, s1, s2, s3]
            }
            Activation::Sine => {
                let (s, c) = z.sin_cos();
                [s, c, -s, -c]
            }
        }
    }

    #[inline]
    fn value(self, z: f64) -> f64 {
        match self {
            Activation::Tanh => z.tanh(),
            Activation::Sine => z.sin(),
        }
    }
}

/// Fixed (non-trainable) map applied to the normalized coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum InputEncoding {
    /// `[x̂, ŷ]`.
    #[default]
    Identity,
    /// `[x̂, ŷ, sin(2π Bx̂), cos(2π Bx̂)]` with `B ~ N(0, sigma²)` of shape `features × 2`.
    Fourier { features: usize, sigma: f64 },
}

/// MLP architecture and initialization knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlpConfig {
    /// Hidden layer widths.
    pub hidden: Vec<usize>,
    pub activation: Activation,
    pub encoding: InputEncoding,
    /// RNG seed for weights (and Fourier frequencies).
    pub seed: u64,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            hidden: vec![32, 32, 32],
            activation: Activation::Tanh,
            encoding: InputEncoding::Identity,
            seed: 0,
        }
    }
}

/// Fully connected layer `z = W h + b`, `W` of shape `(out, in)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Dense {
    w: Array2<f64>,
    b: Array1<f64>,
}

impl Dense {
    fn glorot(fan_in: usize, fan_out: usize, rng: &mut ChaCha8Rng) -> Self {
        let std = (2.0 / (fan_in + fan_out) as f64).sqrt();
        let mut w = Array2::<f64>::zeros((fan_out, fan_in));
        for i in 0..fan_out {
            for k in 0..fan_in {
                let z: f64 = StandardNormal.sample(rng);
                w[[i, k]] = std * z;
            }
        }
        Self {
            w,
            b: Array1::zeros(fan_out),
        }
    }

    fn num_params(&self) -> usize {
        self.w.len() + self.b.len()
    }

    /// Affine map on a jet: the bias only enters the value.
    fn forward(&self, h: &Jet) -> Jet {
        let wt = self.w.t();
        Jet {
            value: h.value.dot(&wt) + &self.b,
            dx: h.dx.dot(&wt),
            dy: h.dy.dot(&wt),
            dxx: h.dxx.dot(&wt),
            dyy: h.dyy.dot(&wt),
        }
    }

    /// Accumulate `∂L/∂W`, `∂L/∂b` into `grad` and return `∂L/∂h`.
    fn backward(&self, h: &Jet, gz: &Jet, grad: &mut [f64]) -> Jet {
        let (out, inp) = self.w.dim();
        let mut gw = Array2::<f64>::zeros((out, inp));
        for (gzc, hc) in gz.parts().iter().zip(h.parts()) {
            gw = gw + gzc.t().dot(hc);
        }
        let gb = gz.value.sum_axis(Axis(0));
        let mut k = 0;
        for x in gw.iter() {
            grad[k] += x;
            k += 1;
        }
        for x in gb.iter() {
            grad[k] += x;
            k += 1;
        }
        Jet {
            value: gz.value.dot(&self.w),
            dx: gz.dx.dot(&self.w),
            dy: gz.dy.dot(&self.w),
            dxx: gz.dxx.dot(&self.w),
            dyy: gz.dyy.dot(&self.w),
        }
    }
}

/// Tape of one [`Mlp`] forward pass.
#[derive(Debug, Clone)]
pub struct MlpTape {
    /// Input jet of every layer (index 0 is the encoded coordinates).
    inputs: Vec<Jet>,
    /// Pre-activation jet of every hidden layer.
    pre: Vec<Jet>,
}

/// Feed-forward network ℝ² → ℝ³ with smooth activations.
///
/// Coordinates are mapped to `[-1, 1]²` through the domain's bounding box; outputs are scaled
/// so that `O(1)` network outputs correspond to the characteristic velocity and pressure drop.
/// Both maps are part of the differentiated computation.
///
/// Deserialization checks layer shapes against each other and the encoding, so a loaded
/// network can always be evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MlpState", into = "MlpState")]
pub struct Mlp {
    layers: Vec<Dense>,
    activation: Activation,
    /// Fourier frequency matrix `(features, 2)`, if the Fourier encoding is used.
    fourier: Option<Array2<f64>>,
    center: [f64; 2],
    half_extent: [f64; 2],
    out_scale: [f64; 3],
    out_offset: [f64; 3],
}

/// Serialized form of an [`Mlp`], unchecked.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MlpState {
    layers: Vec<Dense>,
    activation: Activation,
    fourier: Option<Array2<f64>>,
    center: [f64; 2],
    half_extent: [f64; 2],
    out_scale: [f64; 3],
    out_offset: [f64; 3],
}

impl TryFrom<MlpState> for Mlp {
    type Error = Error;

    fn try_from(st: MlpState) -> Result<Self> {
        let Some(last) = st.layers.last() else {
            return Err(Error::Shape("network has no layers"));
        };
        if last.w.nrows() != 3 {
            return Err(Error::Shape("output layer must have three rows (u, v, p)"));
        }
        let nf = match &st.fourier {
            Some(b) if b.ncols() != 2 || b.nrows() == 0 => {
                return Err(Error::Shape("fourier frequencies must be a non-empty (k, 2) matrix"))
            }
            Some(b) => b.nrows(),
            None => 0,
        };
        let mut fan_in = 2 + 2 * nf;
        for layer in &st.layers {
            if layer.w.ncols() != fan_in {
                return Err(Error::Shape("layer input width does not match the previous layer"));
            }
            if layer.b.len() != layer.w.nrows() || layer.w.nrows() == 0 {
                return Err(Error::Shape("layer bias length does not match its weight rows"));
            }
            fan_in = layer.w.nrows();
        }
        let finite = st
            .layers
            .iter()
            .all(|l| l.w.iter().chain(l.b.iter()).all(|x| x.is_finite()))
            && st.fourier.iter().flatten().all(|x| x.is_finite())
            && st.center.iter().chain(&st.out_scale).chain(&st.out_offset).all(|x| x.is_finite());
        if !finite {
            return Err(Error::ParameterInvalid(
                "network parameters must be finite".into(),
            ));
        }
        if st.half_extent.iter().any(|h| !(*h > 0.0) || !h.is_finite()) {
            return Err(Error::ParameterInvalid(
                "coordinate half extents must be positive and finite".into(),
            ));
        }
        Ok(Self {
            layers: st.layers,
            activation: st.activation,
            fourier: st.fourier,
            center: st.center,
            half_extent: st.half_extent,
            out_scale: st.out_scale,
            out_offset: st.out_offset,
        })
    }
}

impl From<Mlp> for MlpState {
    fn from(net: Mlp) -> Self {
        MlpState {
            layers: net.layers,
            activation: net.activation,
            fourier: net.fourier,
            center: net.center,
            half_extent: net.half_extent,
            out_scale: net.out_scale,
            out_offset: net.out_offset,
        }
    }
}

impl Mlp {
    /// Initialize with Glorot-normal weights and zero biases.
    pub fn new(
        cfg: &MlpConfig,
        domain: &Domain,
        scales: &Scales,
        params: &PhysicalParams,
    ) -> Result<Self> {
        if cfg.hidden.is_empty() || cfg.hidden.contains(&0) {
            return Err(Error::Config(
                "hidden layer widths must be non-empty and >= 1".into(),
            ));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);

        let fourier = match cfg.encoding {
            InputEncoding::Identity => None,
            InputEncoding::Fourier { features, sigma } => {
                if features == 0 || !(sigma > 0.0) || !sigma.is_finite() {
                    return Err(Error::Config(
                        "fourier encoding needs features >= 1 and positive finite sigma".into(),
                    ));
                }
                let mut b = Array2::<f64>::zeros((features, 2));
                for i in 0..features {
                    for k in 0..2 {
                        let z: f64 = StandardNormal.sample(&mut rng);
                        b[[i, k]] = sigma * z;
                    }
                }
                Some(b)
            }
        };
        let in_dim = 2 + fourier.as_ref().map_or(0, |b| 2 * b.nrows());

        let mut layers = Vec::with_capacity(cfg.hidden.len() + 1);
        let mut fan_in = in_dim;
        for &width in &cfg.hidden {
            layers.push(Dense::glorot(fan_in, width, &mut rng));
            fan_in = width;
        }
        layers.push(Dense::glorot(fan_in, 3, &mut rng));

        let (lo, hi) = domain.bounding_box();
        Ok(Self {
            layers,
            activation: cfg.activation,
            fourier,
            center: [0.5 * (lo[0] + hi[0]), 0.5 * (lo[1] + hi[1])],
            half_extent: [0.5 * (hi[0] - lo[0]), 0.5 * (hi[1] - lo[1])],
            out_scale: [scales.velocity, scales.velocity, scales.pressure_output],
            out_offset: [0.0, 0.0, params.outlet_pressure],
        })
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Reset the output units for new parameters, keeping the weights.
    ///
    /// The weights then describe the same normalized flow; under the Stokes scaling of the
    /// pressure unit, the pressure field follows the new viscosity.
    pub fn rescale_outputs(&mut self, scales: &Scales, params: &PhysicalParams) {
        self.out_scale = [scales.velocity, scales.velocity, scales.pressure_output];
        self.out_offset = [0.0, 0.0, params.outlet_pressure];
    }

    /// Jet of the encoded, normalized coordinates.
    fn encode(&self, coords: &ArrayView2<f64>) -> Jet {
        let n = coords.nrows();
        let nf = self.fourier.as_ref().map_or(0, |b| b.nrows());
        let mut h = Jet::zeros(n, 2 + 2 * nf);
        let sx = 1.0 / self.half_extent[0];
        let sy = 1.0 / self.half_extent[1];
        for i in 0..n {
            let xh = (coords[[i, 0]] - self.center[0]) * sx;
            let yh = (coords[[i, 1]] - self.center[1]) * sy;
            h.value[[i, 0]] = xh;
            h.value[[i, 1]] = yh;
            h.dx[[i, 0]] = sx;
            h.dy[[i, 1]] = sy;
            if let Some(b) = &self.fourier {
                let two_pi = 2.0 * core::f64::consts::PI;
                for k in 0..nf {
                    let theta = two_pi * (b[[k, 0]] * xh + b[[k, 1]] * yh);
                    let tx = two_pi * b[[k, 0]] * sx;
                    let ty = two_pi * b[[k, 1]] * sy;
                    let (s, c) = theta.sin_cos();
                    let js = 2 + k;
                    let jc = 2 + nf + k;
                    h.value[[i, js]] = s;
                    h.dx[[i, js]] = c * tx;
                    h.dy[[i, js]] = c * ty;
                    h.dxx[[i, js]] = -s * tx * tx;
                    h.dyy[[i, js]] = -s * ty * ty;
                    h.value[[i, jc]] = c;
                    h.dx[[i, jc]] = -s * tx;
                    h.dy[[i, jc]] = -s * ty;
                    h.dxx[[i, jc]] = -c * tx * tx;
                    h.dyy[[i, jc]] = -c * ty * ty;
                }
            }
        }
        h
    }

    /// σ applied to a pre-activation jet (chain rule through second order).
    fn activate(&self, z: &Jet) -> Jet {
        let (n, m) = z.value.dim();
        let mut a = Jet::zeros(n, m);
        for i in 0..n {
            for j in 0..m {
                let [s0, s1, s2, _] = self.activation.derivatives(z.value[[i, j]]);
                let zx = z.dx[[i, j]];
                let zy = z.dy[[i, j]];
                a.value[[i, j]] = s0;
                a.dx[[i, j]] = s1 * zx;
                a.dy[[i, j]] = s1 * zy;
                a.dxx[[i, j]] = s1 * z.dxx[[i, j]] + s2 * zx * zx;
                a.dyy[[i, j]] = s1 * z.dyy[[i, j]] + s2 * zy * zy;
            }
        }
        a
    }

    /// Adjoint of [`Self::activate`]: `∂L/∂z` from `∂L/∂σ(z)`.
    fn activate_backward(&self, z: &Jet, g: &Jet) -> Jet {
        let (n, m) = z.value.dim();
        let mut gz = Jet::zeros(n, m);
        for i in 0..n {
            for j in 0..m {
                let [_, s1, s2, s3] = self.activation.derivatives(z.value[[i, j]]);
                let (zx, zy) = (z.dx[[i, j]], z.dy[[i, j]]);
                let (zxx, zyy) = (z.dxx[[i, j]], z.dyy[[i, j]]);
                let (gv, gx, gy) = (g.value[[i, j]], g.dx[[i, j]], g.dy[[i, j]]);
                let (gxx, gyy) = (g.dxx[[i, j]], g.dyy[[i, j]]);

                gz.value[[i, j]] = gv * s1
                    + (gx * zx + gy * zy + gxx * zxx + gyy * zyy) * s2
                    + (gxx * zx * zx + gyy * zy * zy) * s3;
                gz.dx[[i, j]] = gx * s1 + 2.0 * gxx * s2 * zx;
                gz.dy[[i, j]] = gy * s1 + 2.0 * gyy * s2 * zy;
                gz.dxx[[i, j]] = gxx * s1;
                gz.dyy[[i, j]] = gyy * s1;
            }
        }
        gz
    }

    fn scale_output(&self, mut out: Jet) -> Jet {
        for j in 0..3 {
            let s = self.out_scale[j];
            out.value.column_mut(j).mapv_inplace(|x| s * x + self.out_offset[j]);
            out.dx.column_mut(j).mapv_inplace(|x| s * x);
            out.dy.column_mut(j).mapv_inplace(|x| s * x);
            out.dxx.column_mut(j).mapv_inplace(|x| s * x);
            out.dyy.column_mut(j).mapv_inplace(|x| s * x);
        }
        out
    }
}

impl FieldModel for Mlp {
    fn predict(&self, coords: &ArrayView2<f64>) -> Result<Array2<f64>> {
        check_coords(coords)?;
        let mut h = self.encode(coords).value;
        let last = self.layers.len() - 1;
        for (l, layer) in self.layers.iter().enumerate() {
            let z = h.dot(&layer.w.t()) + &layer.b;
            h = if l < last {
                z.mapv(|x| self.activation.value(x))
            } else {
                z
            };
        }
        for j in 0..3 {
            let (s, o) = (self.out_scale[j], self.out_offset[j]);
            h.column_mut(j).mapv_inplace(|x| s * x + o);
        }
        Ok(h)
    }

    fn predict_with_gradients(&self, coords: &ArrayView2<f64>) -> Result<Jet> {
        Ok(self.forward_tape(coords)?.0)
    }
}

impl TrainableField for Mlp {
    type Tape = MlpTape;

    fn num_params(&self) -> usize {
        self.layers.iter().map(Dense::num_params).sum()
    }

    /// Layer by layer: `W` row-major, then `b`.
    fn params(&self) -> Array1<f64> {
        let mut p = Vec::with_capacity(self.num_params());
        for layer in &self.layers {
            p.extend(layer.w.iter().copied());
            p.extend(layer.b.iter().copied());
        }
        Array1::from_vec(p)
    }

    fn set_params(&mut self, params: &ArrayView1<f64>) -> Result<()> {
        if params.len() != self.num_params() {
            return Err(Error::Shape("parameter vector length does not match the network"));
        }
        let mut k = 0;
        for layer in &mut self.layers {
            for x in layer.w.iter_mut() {
                *x = params[k];
                k += 1;
            }
            for x in layer.b.iter_mut() {
                *x = params[k];
                k += 1;
            }
        }
        Ok(())
    }

    fn forward_tape(&self, coords: &ArrayView2<f64>) -> Result<(Jet, MlpTape)> {
        check_coords(coords)?;
        let last = self.layers.len() - 1;
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut pre = Vec::with_capacity(last);
        let mut h = self.encode(coords);
        for (l, layer) in self.layers.iter().enumerate() {
            let z = layer.forward(&h);
            inputs.push(h);
            if l < last {
                h = self.activate(&z);
                pre.push(z);
            } else {
                h = z;
            }
        }
        Ok((self.scale_output(h), MlpTape { inputs, pre }))
    }

    fn backward(&self, tape: &MlpTape, adjoint: &Jet) -> Array1<f64> {
        let mut grad = vec![0.0; self.num_params()];
        let mut offsets = Vec::with_capacity(self.layers.len());
        let mut k = 0;
        for layer in &self.layers {
            offsets.push(k);
            k += layer.num_params();
        }

        // Undo the output scaling (the offset does not depend on parameters).
        let mut g = adjoint.clone();
        for j in 0..3 {
            let s = self.out_scale[j];
            for part in [&mut g.value, &mut g.dx, &mut g.dy, &mut g.dxx, &mut g.dyy] {
                part.column_mut(j).mapv_inplace(|x| s * x);
            }
        }

        for l in (0..self.layers.len()).rev() {
            let layer = &self.layers[l];
            let start = offsets[l];
            let end = start + layer.num_params();
            let gz = if l < self.layers.len() - 1 {
                self.activate_backward(&tape.pre[l], &g)
            } else {
                g
            };
            g = layer.backward(&tape.inputs[l], &gz, &mut grad[start..end]);
        }
        Array1::from_vec(grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn small_net(activation: Activation, encoding: InputEncoding) -> Mlp {
        let domain = Domain::rectangle(2.0, 1.0).unwrap();
        let params = PhysicalParams {
            density: 1.0,
            viscosity: 0.1,
            inlet_velocity: 1.0,
            outlet_pressure: 0.3,
            ..PhysicalParams::default()
        };
        let scales = Scales::new(&domain, &params);
        let cfg = MlpConfig {
            hidden: vec![6, 5],
            activation,
            encoding,
            seed: 11,
        };
        Mlp::new(&cfg, &domain, &scales, &params).unwrap()
    }

    fn pts() -> Array2<f64> {
        array![[0.3, 0.2], [1.1, 0.7], [1.9, 0.5], [0.05, 0.95]]
    }

    #[test]
    fn rejects_non_2d_coordinates() {
        let net = small_net(Activation::Tanh, InputEncoding::Identity);
        let bad = Array2::<f64>::zeros((3, 3));
        assert!(matches!(net.predict(&bad.view()), Err(Error::Shape(_))));
        assert!(matches!(
            net.predict_with_gradients(&bad.view()),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn value_path_matches_jet_path() {
        for net in [
            small_net(Activation::Tanh, InputEncoding::Identity),
            small_net(
                Activation::Sine,
                InputEncoding::Fourier {
                    features: 3,
                    sigma: 0.5,
                },
            ),
        ] {
            let x = pts();
            let a = net.predict(&x.view()).unwrap();
            let b = net.predict_with_gradients(&x.view()).unwrap().value;
            for (p, q) in a.iter().zip(b.iter()) {
                assert!((p - q).abs() < 1e-12);
            }
        }
    }

    // Finite differences are only used here, to check the jets.
    #[test]
    fn jets_match_central_differences() {
        for net in [
            small_net(Activation::Tanh, InputEncoding::Identity),
            small_net(
                Activation::Tanh,
                InputEncoding::Fourier {
                    features: 2,
                    sigma: 0.3,
                },
            ),
        ] {
            let x = pts();
            let jet = net.predict_with_gradients(&x.view()).unwrap();
            let h = 1e-4;
            for axis in 0..2 {
                let mut xp = x.clone();
                let mut xm = x.clone();
                xp.column_mut(axis).mapv_inplace(|v| v + h);
                xm.column_mut(axis).mapv_inplace(|v| v - h);
                let fp = net.predict(&xp.view()).unwrap();
                let fm = net.predict(&xm.view()).unwrap();
                let f0 = &jet.value;
                let (d1, d2) = if axis == 0 {
                    (&jet.dx, &jet.dxx)
                } else {
                    (&jet.dy, &jet.dyy)
                };
                for i in 0..x.nrows() {
                    for j in 0..3 {
                        let fd1 = (fp[[i, j]] - fm[[i, j]]) / (2.0 * h);
                        let fd2 = (fp[[i, j]] - 2.0 * f0[[i, j]] + fm[[i, j]]) / (h * h);
                        assert!(
                            (fd1 - d1[[i, j]]).abs() < 1e-5 * (1.0 + fd1.abs()),
                            "d1 axis={axis} i={i} j={j}: fd={fd1} ad={}",
                            d1[[i, j]]
                        );
                        assert!(
                            (fd2 - d2[[i, j]]).abs() < 1e-3 * (1.0 + fd2.abs()),
                            "d2 axis={axis} i={i} j={j}: fd={fd2} ad={}",
                            d2[[i, j]]
                        );
                    }
                }
            }
        }
    }

    /// Scalar test objective touching every jet component.
    fn objective(net: &Mlp, x: &Array2<f64>, weights: &Jet) -> f64 {
        let jet = net.predict_with_gradients(&x.view()).unwrap();
        let mut s = 0.0;
        for (a, w) in jet.parts().iter().zip(weights.parts()) {
            s += (*a * w).sum();
        }
        s
    }

    #[test]
    fn parameter_gradient_matches_central_differences() {
        for activation in [Activation::Tanh, Activation::Sine] {
            let net = small_net(activation, InputEncoding::Identity);
            let x = pts();
            let n = x.nrows();
            // Arbitrary fixed adjoint so every path through the jet is exercised.
            let mut w = Jet::zeros(n, 3);
            for i in 0..n {
                for j in 0..3 {
                    let t = (i * 3 + j) as f64;
                    w.value[[i, j]] = 0.3 + 0.1 * t;
                    w.dx[[i, j]] = -0.2 + 0.05 * t;
                    w.dy[[i, j]] = 0.1 - 0.03 * t;
                    w.dxx[[i, j]] = 0.01 * t;
                    w.dyy[[i, j]] = -0.02 + 0.01 * t;
                }
            }
            let (_, tape) = net.forward_tape(&x.view()).unwrap();
            let g = net.backward(&tape, &w);
            assert_eq!(g.len(), net.num_params());

            let p0 = net.params();
            let h = 1e-6;
            for k in (0..p0.len()).step_by(3) {
                let mut pp = p0.clone();
                let mut pm = p0.clone();
                pp[k] += h;
                pm[k] -= h;
                let mut np = net.clone();
                let mut nm = net.clone();
                np.set_params(&pp.view()).unwrap();
                nm.set_params(&pm.view()).unwrap();
                let fd = (objective(&np, &x, &w) - objective(&nm, &x, &w)) / (2.0 * h);
                assert!(
                    (fd - g[k]).abs() < 1e-5 * (1.0 + fd.abs()),
                    "{activation:?} param {k}: fd={fd} ad={}",
                    g[k]
                );
            }
        }
    }

    #[test]
    fn params_roundtrip_and_length_check() {
        let mut net = small_net(Activation::Tanh, InputEncoding::Identity);
        let p = net.params();
        assert_eq!(p.len(), (2 * 6 + 6) + (6 * 5 + 5) + (5 * 3 + 3));
        let doubled = p.mapv(|x| 2.0 * x);
        net.set_params(&doubled.view()).unwrap();
        assert_eq!(net.params(), doubled);
        let short = Array1::<f64>::zeros(3);
        assert!(net.set_params(&short.view()).is_err());
    }

    #[test]
    fn malformed_networks_are_rejected_on_load() {
        let net = small_net(
            Activation::Tanh,
            InputEncoding::Fourier {
                features: 2,
                sigma: 0.5,
            },
        );
        let good = serde_json::to_value(&net).unwrap();
        let back: Mlp = serde_json::from_value(good.clone()).unwrap();
        assert_eq!(back, net);

        let mut no_layers = good.clone();
        no_layers["layers"] = serde_json::json!([]);
        let err = serde_json::from_value::<Mlp>(no_layers).unwrap_err();
        assert!(err.to_string().contains("no layers"), "{err}");

        // Swapping two layers breaks the width chain.
        let mut swapped = good.clone();
        let layers = swapped["layers"].as_array_mut().unwrap();
        layers.swap(0, 1);
        assert!(serde_json::from_value::<Mlp>(swapped).is_err());

        // Dropping the encoding changes the first layer's expected input width.
        let mut no_fourier = good.clone();
        no_fourier["fourier"] = serde_json::Value::Null;
        assert!(serde_json::from_value::<Mlp>(no_fourier).is_err());

        let mut flat = good;
        flat["half_extent"] = serde_json::json!([0.0, 1.0]);
        assert!(serde_json::from_value::<Mlp>(flat).is_err());
    }

    #[test]
    fn rescaled_outputs_follow_the_new_viscosity() {
        let domain = Domain::rectangle(2.0, 1.0).unwrap();
        let a = PhysicalParams::new(1.0, 0.1, 1.0).unwrap();
        let b = a.with_viscosity(0.3);
        let net = Mlp::new(&MlpConfig::default(), &domain, &Scales::new(&domain, &a), &a).unwrap();
        let mut moved = net.clone();
        moved.rescale_outputs(&Scales::new(&domain, &b), &b);
        assert_eq!(moved.params(), net.params());
        let x = pts();
        let pa = net.predict(&x.view()).unwrap();
        let pb = moved.predict(&x.view()).unwrap();
        for i in 0..x.nrows() {
            assert!((pb[[i, U]] - pa[[i, U]]).abs() < 1e-12);
            assert!((pb[[i, P]] - 3.0 * pa[[i, P]]).abs() < 1e-9 * (1.0 + pa[[i, P]].abs()));
        }
    }

    #[test]
    fn same_seed_same_network() {
        let a = small_net(Activation::Tanh, InputEncoding::Identity);
        let b = small_net(Activation::Tanh, InputEncoding::Identity);
        assert_eq!(a, b);
    }

    #[test]
    fn glorot_init_keeps_hidden_activations_alive() {
        // Variance-preserving init: deep tanh activations neither saturate nor collapse.
        let domain = Domain::rectangle(1.0, 1.0).unwrap();
        let params = PhysicalParams::default();
        let scales = Scales::new(&domain, &params);
        let cfg = MlpConfig {
            hidden: vec![64; 6],
            ..MlpConfig::default()
        };
        let net = Mlp::new(&cfg, &domain, &scales, &params).unwrap();
        let mut x = Array2::<f64>::zeros((64, 2));
        for i in 0..64 {
            x[[i, 0]] = (i % 8) as f64 / 7.0;
            x[[i, 1]] = (i / 8) as f64 / 7.0;
        }
        let (_, tape) = net.forward_tape(&x.view()).unwrap();
        let last_hidden = tape.inputs.last().unwrap();
        let var = last_hidden.value.mapv(|a| a * a).mean().unwrap();
        assert!(var > 1e-3 && var < 0.9, "activation second moment {var}");
    }
}
