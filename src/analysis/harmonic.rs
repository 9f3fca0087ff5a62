//! Per-pixel harmonic regression.
//!
//! Each pixel's series is fitted with
//! `a + b·(t − t_ref) + c₁cos 2πt + s₁sin 2πt + c₂cos 4πt + s₂sin 4πt`
//! where `t` is in decimal years. Complete series share one pseudo-inverse of
//! the design matrix; series with gaps are refitted on their valid samples.

use crate::models::{HarmonicFit, SstCube};
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array2, Array3, ArrayView1};
use rayon::prelude::*;
use std::f64::consts::PI;
use tracing::{debug, info};

/// Number of regression coefficients.
pub const N_COEFFS: usize = 6;

/// Singular values below this are treated as zero.
const PINV_EPSILON: f64 = 1e-10;

/// Coefficient names in storage order.
pub const COEFF_NAMES: [&str; N_COEFFS] = [
    "mean",
    "trend",
    "annual_cos",
    "annual_sin",
    "semiannual_cos",
    "semiannual_sin",
];

/// Convert timestamps to decimal years.
pub fn decimal_years(times: &[DateTime<Utc>]) -> Vec<f64> {
    times
        .iter()
        .map(|t| {
            let year = t.year();
            let days_in_year = if NaiveDate::from_ymd_opt(year, 2, 29).is_some() {
                366.0
            } else {
                365.0
            };
            let day_fraction = t.num_seconds_from_midnight() as f64 / 86_400.0;
            year as f64 + (t.ordinal0() as f64 + day_fraction) / days_in_year
        })
        .collect()
}

/// Design matrix, one row per time step.
pub fn design_matrix(t: &[f64], t_ref: f64) -> DMatrix<f64> {
    DMatrix::from_fn(t.len(), N_COEFFS, |row, col| {
        let t = t[row];
        match col {
            0 => 1.0,
            1 => t - t_ref,
            2 => (2.0 * PI * t).cos(),
            3 => (2.0 * PI * t).sin(),
            4 => (4.0 * PI * t).cos(),
            _ => (4.0 * PI * t).sin(),
        }
    })
}

fn pseudo_inverse(design: DMatrix<f64>) -> Result<DMatrix<f64>> {
    design
        .pseudo_inverse(PINV_EPSILON)
        .map_err(|e| anyhow!("Pseudo-inverse failed: {}", e))
}

/// The shared regression model for one time axis.
#[derive(Debug, Clone)]
pub struct HarmonicModel {
    t: Vec<f64>,
    t_ref: f64,
    design: DMatrix<f64>,
    pinv: DMatrix<f64>,
    min_valid: usize,
}

impl HarmonicModel {
    /// Build the model. `min_valid_fraction` is the share of valid samples a
    /// gappy series needs to be fitted at all.
    pub fn new(times: &[DateTime<Utc>], min_valid_fraction: f64) -> Result<Self> {
        if times.len() < N_COEFFS {
            bail!(
                "Need at least {} time steps for the harmonic fit, got {}",
                N_COEFFS,
                times.len()
            );
        }

        let t = decimal_years(times);
        let t_ref = t.iter().sum::<f64>() / t.len() as f64;
        let design = design_matrix(&t, t_ref);
        let pinv = pseudo_inverse(design.clone())?;
        let min_valid = ((min_valid_fraction * t.len() as f64).ceil() as usize).max(N_COEFFS);

        debug!(
            "Harmonic model over {} steps, t_ref {:.3}, min valid {}",
            t.len(),
            t_ref,
            min_valid
        );

        Ok(Self {
            t,
            t_ref,
            design,
            pinv,
            min_valid,
        })
    }

    /// Fit one series. `None` when too few samples are valid.
    pub fn fit_series(&self, series: ArrayView1<'_, f64>) -> Option<[f64; N_COEFFS]> {
        let valid: Vec<usize> = series
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .map(|(i, _)| i)
            .collect();

        let coeffs = if valid.len() == series.len() {
            let y = DVector::from_iterator(series.len(), series.iter().copied());
            &self.pinv * y
        } else {
            if valid.len() < self.min_valid {
                return None;
            }
            let design = self.design.select_rows(valid.iter());
            let pinv = pseudo_inverse(design).ok()?;
            let y = DVector::from_iterator(valid.len(), valid.iter().map(|&i| series[i]));
            pinv * y
        };

        let mut out = [0.0; N_COEFFS];
        out.iter_mut().zip(coeffs.iter()).for_each(|(o, c)| *o = *c);
        out.iter().all(|c| c.is_finite()).then_some(out)
    }

    /// Seasonal part of the model at time index `step`.
    pub fn seasonal_at(&self, step: usize, coeffs: &[f64; N_COEFFS]) -> f64 {
        (2..N_COEFFS)
            .map(|col| self.design[(step, col)] * coeffs[col])
            .sum()
    }

    /// Full model value at time index `step`.
    pub fn predict_at(&self, step: usize, coeffs: &[f64; N_COEFFS]) -> f64 {
        coeffs[0] + coeffs[1] * self.design[(step, 1)] + self.seasonal_at(step, coeffs)
    }

    /// Fit every pixel of the cube and derive the statistical layers.
    pub fn fit(&self, cube: &SstCube) -> Result<HarmonicFit> {
        let n_time = cube.n_time();
        if n_time != self.t.len() {
            bail!(
                "Cube has {} time steps but the model was built for {}",
                n_time,
                self.t.len()
            );
        }
        let (nlat, nlon) = cube.grid_shape();

        let fits: Vec<Option<[f64; N_COEFFS]>> = (0..nlat * nlon)
            .into_par_iter()
            .map(|p| self.fit_series(cube.pixel_series(p / nlon, p % nlon)))
            .collect();

        let fitted = fits.iter().filter(|f| f.is_some()).count();
        info!("Fitted {} of {} pixels", fitted, fits.len());

        let mut mean = Array2::from_elem((nlat, nlon), f64::NAN);
        let mut trend = Array2::from_elem((nlat, nlon), f64::NAN);
        let mut annual = Array2::from_elem((nlat, nlon), f64::NAN);
        let mut semiannual = Array2::from_elem((nlat, nlon), f64::NAN);
        let mut coefficients = Array3::from_elem((N_COEFFS, nlat, nlon), f64::NAN);
        let mut seasonal = Array3::from_elem((n_time, nlat, nlon), f64::NAN);
        let mut anomaly = Array3::from_elem((n_time, nlat, nlon), f64::NAN);

        for (p, fit) in fits.iter().enumerate() {
            let Some(c) = fit else { continue };
            let (i, j) = (p / nlon, p % nlon);

            mean[(i, j)] = c[0];
            trend[(i, j)] = c[1];
            annual[(i, j)] = c[2].hypot(c[3]);
            semiannual[(i, j)] = c[4].hypot(c[5]);
            for (k, value) in c.iter().enumerate() {
                coefficients[(k, i, j)] = *value;
            }

            for step in 0..n_time {
                seasonal[(step, i, j)] = self.seasonal_at(step, c);
                // NaN observations stay NaN
                anomaly[(step, i, j)] = cube.values[(step, i, j)] - self.predict_at(step, c);
            }
        }

        Ok(HarmonicFit {
            t_ref: self.t_ref,
            mean,
            trend,
            annual_amplitude: annual,
            semiannual_amplitude: semiannual,
            coefficients,
            seasonal,
            anomaly,
        })
    }
}
