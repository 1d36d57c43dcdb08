//! Sparse measurements of `(u, v, p)`.
//!
//! A [`MeasurementSet`] is immutable: every transform (noise, subsampling, splitting) returns a
//! new set. Tables exported by CFD tools are read with [`MeasurementSet::from_reader`], which
//! also catches the usual millimetre-vs-metre mix-up against the target domain.

use crate::field::FieldModel;
use crate::geometry::Domain;
use crate::{Error, Result};
use log::warn;
use ndarray::{Array2, ArrayView2, Axis};
use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;

/// Observed flow values at a few coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSet {
    /// `n × 2`.
    coords: Array2<f64>,
    /// `n × 3` columns `u, v, p`; NaN marks an unobserved component.
    values: Array2<f64>,
    /// Relative noise level of the observations.
    noise: f64,
}

/// Length unit detected in an imported table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinateUnit {
    Meters,
    Millimeters,
}

/// Summary statistics of a measurement set (NaN entries ignored).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementStats {
    pub coord_min: [f64; 2],
    pub coord_max: [f64; 2],
    pub value_mean: [f64; 3],
    pub value_std: [f64; 3],
}

/// Relative slack on the domain bounding box before coordinates count as out of range.
const UNIT_TOLERANCE: f64 = 0.05;

impl MeasurementSet {
    pub fn new(coords: Array2<f64>, values: Array2<f64>, noise: f64) -> Result<Self> {
        if coords.ncols() != 2 {
            return Err(Error::Shape("measurement coordinates must be n × 2"));
        }
        if values.ncols() != 3 || values.nrows() != coords.nrows() {
            return Err(Error::Shape("measurement values must be n × 3, aligned with coordinates"));
        }
        if coords.is_empty() {
            return Err(Error::Measurement("measurement set is empty".into()));
        }
        if coords.iter().any(|x| !x.is_finite()) {
            return Err(Error::Measurement("coordinates must be finite".into()));
        }
        if values.iter().any(|x| x.is_infinite()) {
            return Err(Error::Measurement("values must be finite or NaN".into()));
        }
        if !(noise >= 0.0) || !noise.is_finite() {
            return Err(Error::Measurement(format!(
                "noise level must be non-negative and finite, got {noise}"
            )));
        }
        Ok(Self {
            coords,
            values,
            noise,
        })
    }

    /// Noise-free observations of `field` at `coords`.
    pub fn from_field<F: FieldModel + ?Sized>(field: &F, coords: Array2<f64>) -> Result<Self> {
        let values = field.predict(&coords.view())?;
        Self::new(coords, values, 0.0)
    }

    pub fn coords(&self) -> ArrayView2<'_, f64> {
        self.coords.view()
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn noise(&self) -> f64 {
        self.noise
    }

    pub fn len(&self) -> usize {
        self.coords.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.nrows() == 0
    }

    /// Rows `rows`, in that order.
    pub fn select(&self, rows: &[usize]) -> Result<Self> {
        if rows.iter().any(|&i| i >= self.len()) {
            return Err(Error::Measurement("row index out of range".into()));
        }
        Self::new(
            self.coords.select(Axis(0), rows),
            self.values.select(Axis(0), rows),
            self.noise,
        )
    }

    /// Keep only the given components (`[u, v, p]` flags); the others become unobserved.
    pub fn observe_only(&self, keep: [bool; 3]) -> Self {
        let mut values = self.values.clone();
        for (j, &k) in keep.iter().enumerate() {
            if !k {
                values.column_mut(j).fill(f64::NAN);
            }
        }
        Self {
            values,
            ..self.clone()
        }
    }

    /// Multiply every observed value by `1 + σ·z`, `z ~ N(0, 1)`.
    pub fn with_gaussian_noise(&self, relative_sigma: f64, seed: u64) -> Result<Self> {
        if !(relative_sigma >= 0.0) || !relative_sigma.is_finite() {
            return Err(Error::Measurement(
                "relative noise must be non-negative and finite".into(),
            ));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut values = self.values.clone();
        for x in values.iter_mut() {
            let z: f64 = StandardNormal.sample(&mut rng);
            if x.is_finite() {
                *x *= 1.0 + relative_sigma * z;
            }
        }
        Self::new(self.coords.clone(), values, relative_sigma)
    }

    /// `n` distinct rows drawn without replacement.
    pub fn subsample(&self, n: usize, seed: u64) -> Result<Self> {
        if n == 0 || n > self.len() {
            return Err(Error::Measurement(format!(
                "cannot draw {n} points from a set of {}",
                self.len()
            )));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut rows = index::sample(&mut rng, self.len(), n).into_vec();
        rows.sort_unstable();
        self.select(&rows)
    }

    /// Seeded shuffle split into `(train, validation, test)`; the test set takes the rest.
    pub fn split(&self, train: f64, validation: f64, seed: u64) -> Result<(Self, Self, Self)> {
        if !(train > 0.0) || !(validation >= 0.0) || !(train + validation < 1.0) {
            return Err(Error::Measurement(
                "split fractions must satisfy train > 0, validation >= 0, train + validation < 1"
                    .into(),
            ));
        }
        let n = self.len();
        let n_train = (train * n as f64).round() as usize;
        let n_val = (validation * n as f64).round() as usize;
        if n_train == 0 || n_train + n_val >= n {
            return Err(Error::Measurement(format!(
                "{n} points are too few for this split"
            )));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let perm = index::sample(&mut rng, n, n).into_vec();
        let (a, rest) = perm.split_at(n_train);
        let (b, c) = rest.split_at(n_val);
        // An empty validation set is allowed; `select` refuses empty sets.
        let val = if b.is_empty() {
            Self {
                coords: Array2::zeros((0, 2)),
                values: Array2::zeros((0, 3)),
                noise: self.noise,
            }
        } else {
            self.select(b)?
        };
        Ok((self.select(a)?, val, self.select(c)?))
    }

    pub fn stats(&self) -> MeasurementStats {
        let mut coord_min = [f64::INFINITY; 2];
        let mut coord_max = [f64::NEG_INFINITY; 2];
        for row in self.coords.rows() {
            for k in 0..2 {
                coord_min[k] = coord_min[k].min(row[k]);
                coord_max[k] = coord_max[k].max(row[k]);
            }
        }
        let mut value_mean = [f64::NAN; 3];
        let mut value_std = [f64::NAN; 3];
        for j in 0..3 {
            let xs: Vec<f64> = self
                .values
                .column(j)
                .iter()
                .copied()
                .filter(|x| x.is_finite())
                .collect();
            if xs.is_empty() {
                continue;
            }
            let n = xs.len() as f64;
            let mean = xs.iter().sum::<f64>() / n;
            let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
            value_mean[j] = mean;
            value_std[j] = var.sqrt();
        }
        MeasurementStats {
            coord_min,
            coord_max,
            value_mean,
            value_std,
        }
    }

    /// Read an `x, y, u, v, p` table from a file. See [`Self::from_reader`].
    pub fn from_path(path: impl AsRef<Path>, domain: &Domain) -> Result<(Self, CoordinateUnit)> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file), domain)
    }

    /// Read an `x, y, u, v, p` table (comma or whitespace separated).
    ///
    /// Lines starting with `%` or `#` are skipped, as is a leading header row. Columns named
    /// `x, y, u, v, p` in a header are matched by name; otherwise the first five columns are
    /// used in that order. Empty fields and `NaN` are unobserved.
    ///
    /// Coordinates must fall inside the domain's bounding box (with a small tolerance). If they
    /// do not, but do once divided by 1000, they are taken to be millimetres and converted.
    pub fn from_reader<R: Read>(mut reader: R, domain: &Domain) -> Result<(Self, CoordinateUnit)> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;

        let mut cleaned = String::with_capacity(text.len());
        for line in text.lines() {
            let t = line.trim();
            if t.is_empty() || t.starts_with('%') || t.starts_with('#') {
                continue;
            }
            if t.contains(',') {
                cleaned.push_str(t);
            } else {
                cleaned.push_str(&t.split_whitespace().collect::<Vec<_>>().join(","));
            }
            cleaned.push('\n');
        }

        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(cleaned.as_bytes());

        let mut columns = [0, 1, 2, 3, 4];
        let mut rows: Vec<[f64; 5]> = Vec::new();
        for (row_idx, result) in rdr.records().enumerate() {
            let record = result?;
            if row_idx == 0 && record.get(0).is_some_and(|f| f.parse::<f64>().is_err()) {
                let names: Vec<String> = record.iter().map(|h| h.to_ascii_lowercase()).collect();
                let found: Vec<Option<usize>> = ["x", "y", "u", "v", "p"]
                    .iter()
                    .map(|c| names.iter().position(|n| n == c))
                    .collect();
                if found.iter().all(Option::is_some) {
                    for (k, f) in found.into_iter().enumerate() {
                        columns[k] = f.unwrap_or(k);
                    }
                }
                continue;
            }
            let mut row = [f64::NAN; 5];
            for (k, &c) in columns.iter().enumerate() {
                let field = record.get(c).unwrap_or("");
                if field.is_empty() {
                    if k < 2 {
                        return Err(Error::Measurement(format!(
                            "missing coordinate at row {}",
                            row_idx + 1
                        )));
                    }
                    continue;
                }
                row[k] = field.parse().map_err(|_| {
                    Error::Measurement(format!("invalid number {field:?} at row {}", row_idx + 1))
                })?;
            }
            rows.push(row);
        }
        if rows.is_empty() {
            return Err(Error::Measurement("no data rows found".into()));
        }

        let n = rows.len();
        let mut coords = Array2::zeros((n, 2));
        let mut values = Array2::zeros((n, 3));
        for (i, r) in rows.iter().enumerate() {
            coords[[i, 0]] = r[0];
            coords[[i, 1]] = r[1];
            for j in 0..3 {
                values[[i, j]] = r[2 + j];
            }
        }

        let unit = detect_unit(&coords, domain)?;
        if unit == CoordinateUnit::Millimeters {
            warn!("measurement coordinates look like millimetres; converting {n} points to metres");
            coords.mapv_inplace(|x| x * 1e-3);
        }
        Ok((Self::new(coords, values, 0.0)?, unit))
    }
}

fn fits(coords: &Array2<f64>, scale: f64, lo: [f64; 2], hi: [f64; 2], slack: f64) -> bool {
    coords.rows().into_iter().all(|r| {
        (0..2).all(|k| r[k] * scale >= lo[k] - slack && r[k] * scale <= hi[k] + slack)
    })
}

fn detect_unit(coords: &Array2<f64>, domain: &Domain) -> Result<CoordinateUnit> {
    let (lo, hi) = domain.bounding_box();
    let slack = UNIT_TOLERANCE * (hi[0] - lo[0]).max(hi[1] - lo[1]);
    if fits(coords, 1.0, lo, hi, slack) {
        return Ok(CoordinateUnit::Meters);
    }
    if fits(coords, 1e-3, lo, hi, slack) {
        return Ok(CoordinateUnit::Millimeters);
    }
    Err(Error::Measurement(format!(
        "coordinates fall outside the domain bounding box [{:e}, {:e}] × [{:e}, {:e}] in metres and millimetres",
        lo[0], hi[0], lo[1], hi[1]
    )))
}
