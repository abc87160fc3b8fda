//! Dataset preparation: dense row-major design matrix, response, trials.
//!
//! A [`Dataset`] is validated on construction (rectangular, finite). Covariates are
//! standardized with [`Dataset::standardize`] before fitting; the original centers and
//! scales are kept so coefficients can be mapped back to the input units.

use vs_core::{Error, Result};

/// Dense row-major design matrix without an intercept column.
#[derive(Debug, Clone)]
pub(crate) struct DenseX {
    pub(crate) n: usize,
    pub(crate) p: usize,
    pub(crate) data: Vec<f64>,
}

impl DenseX {
    #[inline]
    pub(crate) fn row(&self, i: usize) -> &[f64] {
        let start = i * self.p;
        &self.data[start..start + self.p]
    }

    #[inline]
    pub(crate) fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.p + j]
    }
}

#[inline]
pub(crate) fn row_dot(x_row: &[f64], beta: &[f64]) -> f64 {
    debug_assert_eq!(x_row.len(), beta.len());
    x_row.iter().zip(beta).map(|(&x, &b)| x * b).sum()
}

/// Observations × covariates plus a response column.
#[derive(Debug, Clone)]
pub struct Dataset {
    x: DenseX,
    y: Vec<f64>,
    trials: Vec<f64>,
    names: Vec<String>,
    response_name: String,
    centers: Vec<f64>,
    scales: Vec<f64>,
    standardized: bool,
}

impl Dataset {
    /// Build a dataset from row-wise covariates and a response.
    ///
    /// `p = 0` (intercept-only) is allowed; `n = 0` is not.
    pub fn from_rows(x: Vec<Vec<f64>>, y: Vec<f64>, names: Vec<String>) -> Result<Self> {
        let n = y.len();
        if n == 0 {
            return Err(Error::Validation("dataset must contain at least one observation".into()));
        }
        if x.len() != n {
            return Err(Error::Validation(format!(
                "X has {} rows but y has {} values",
                x.len(),
                n
            )));
        }
        let p = names.len();
        let mut data = Vec::with_capacity(n * p);
        for (i, row) in x.into_iter().enumerate() {
            if row.len() != p {
                return Err(Error::Validation(format!(
                    "X must be rectangular: row {} has len {}, expected {}",
                    i,
                    row.len(),
                    p
                )));
            }
            for (j, v) in row.into_iter().enumerate() {
                if !v.is_finite() {
                    return Err(Error::Validation(format!(
                        "non-finite value in covariate '{}' at row {}",
                        names[j], i
                    )));
                }
                data.push(v);
            }
        }
        if let Some(i) = y.iter().position(|v| !v.is_finite()) {
            return Err(Error::Validation(format!("non-finite response at row {}", i)));
        }
        Ok(Self {
            x: DenseX { n, p, data },
            y,
            trials: vec![1.0; n],
            names,
            response_name: "y".to_string(),
            centers: vec![0.0; p],
            scales: vec![1.0; p],
            standardized: false,
        })
    }

    /// Build a dataset from covariate columns.
    pub fn from_columns(columns: Vec<Vec<f64>>, y: Vec<f64>, names: Vec<String>) -> Result<Self> {
        if columns.len() != names.len() {
            return Err(Error::Validation(format!(
                "{} columns but {} names",
                columns.len(),
                names.len()
            )));
        }
        let n = y.len();
        if let Some((j, c)) = columns.iter().enumerate().find(|(_, c)| c.len() != n) {
            return Err(Error::Validation(format!(
                "column '{}' has {} values, expected {}",
                names[j],
                c.len(),
                n
            )));
        }
        let rows = (0..n).map(|i| columns.iter().map(|c| c[i]).collect()).collect();
        Self::from_rows(rows, y, names)
    }

    /// Attach per-observation binomial trial counts (default: 1 for every row).
    pub fn with_trials(mut self, trials: Vec<f64>) -> Result<Self> {
        if trials.len() != self.x.n {
            return Err(Error::Validation(format!(
                "trials has {} values, expected {}",
                trials.len(),
                self.x.n
            )));
        }
        if let Some(i) = trials.iter().position(|&t| !(t.is_finite() && t >= 1.0 && t.fract() == 0.0)) {
            return Err(Error::Validation(format!(
                "trials must be positive integers, got {} at row {}",
                trials[i], i
            )));
        }
        self.trials = trials;
        Ok(self)
    }

    /// Set the response column name (used in reports).
    pub fn with_response_name(mut self, name: impl Into<String>) -> Self {
        self.response_name = name.into();
        self
    }

    /// Return a copy with every covariate centered to mean 0 and scaled to unit sample SD.
    ///
    /// A column that is identically zero is kept as-is. Any other constant column is
    /// rejected because it cannot be scaled and is collinear with the intercept.
    pub fn standardize(&self) -> Result<Self> {
        let (n, p) = (self.x.n, self.x.p);
        if p > 0 && n < 2 {
            return Err(Error::Validation("standardization needs at least 2 observations".into()));
        }
        let mut centers = vec![0.0; p];
        let mut scales = vec![1.0; p];
        for j in 0..p {
            let col = self.column(j);
            let mean = col.iter().sum::<f64>() / n as f64;
            let var = col.iter().map(|&v| (v - mean) * (v - mean)).sum::<f64>() / (n as f64 - 1.0);
            if var <= 0.0 {
                if col.iter().all(|&v| v == 0.0) {
                    continue;
                }
                return Err(Error::Validation(format!(
                    "covariate '{}' has zero variance and cannot be standardized",
                    self.names[j]
                )));
            }
            centers[j] = mean;
            scales[j] = var.sqrt();
        }
        let mut data = self.x.data.clone();
        for i in 0..n {
            for j in 0..p {
                let v = &mut data[i * p + j];
                *v = (*v - centers[j]) / scales[j];
            }
        }
        Ok(Self {
            x: DenseX { n, p, data },
            y: self.y.clone(),
            trials: self.trials.clone(),
            names: self.names.clone(),
            response_name: self.response_name.clone(),
            centers,
            scales,
            standardized: true,
        })
    }

    /// Keep only the given rows (in the given order).
    pub fn select_rows(&self, rows: &[usize]) -> Result<Self> {
        if rows.is_empty() {
            return Err(Error::Validation("row selection is empty".into()));
        }
        let p = self.x.p;
        let mut data = Vec::with_capacity(rows.len() * p);
        let mut y = Vec::with_capacity(rows.len());
        let mut trials = Vec::with_capacity(rows.len());
        for &i in rows {
            if i >= self.x.n {
                return Err(Error::Validation(format!("row index {} out of range", i)));
            }
            data.extend_from_slice(self.x.row(i));
            y.push(self.y[i]);
            trials.push(self.trials[i]);
        }
        Ok(Self {
            x: DenseX { n: rows.len(), p, data },
            y,
            trials,
            names: self.names.clone(),
            response_name: self.response_name.clone(),
            centers: self.centers.clone(),
            scales: self.scales.clone(),
            standardized: self.standardized,
        })
    }

    /// All rows except `row`.
    pub fn without_row(&self, row: usize) -> Result<Self> {
        let keep: Vec<usize> = (0..self.x.n).filter(|&i| i != row).collect();
        self.select_rows(&keep)
    }

    /// Number of observations.
    pub fn n_obs(&self) -> usize {
        self.x.n
    }

    /// Number of covariates (excluding the intercept).
    pub fn n_covariates(&self) -> usize {
        self.x.p
    }

    /// Covariate values of row `i`.
    pub fn row(&self, i: usize) -> &[f64] {
        self.x.row(i)
    }

    /// Copy of covariate column `j`.
    pub fn column(&self, j: usize) -> Vec<f64> {
        (0..self.x.n).map(|i| self.x.get(i, j)).collect()
    }

    /// Response values.
    pub fn y(&self) -> &[f64] {
        &self.y
    }

    /// Binomial trial counts (1 for Bernoulli responses).
    pub fn trials(&self) -> &[f64] {
        &self.trials
    }

    /// Covariate names.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Response name.
    pub fn response_name(&self) -> &str {
        &self.response_name
    }

    /// Column means subtracted by [`Self::standardize`] (zeros if not standardized).
    pub fn centers(&self) -> &[f64] {
        &self.centers
    }

    /// Column SDs divided out by [`Self::standardize`] (ones if not standardized).
    pub fn scales(&self) -> &[f64] {
        &self.scales
    }

    /// Whether [`Self::standardize`] produced this dataset.
    pub fn is_standardized(&self) -> bool {
        self.standardized
    }

    /// Sample standard deviation of the response.
    pub fn y_sd(&self) -> f64 {
        vs_prob::math::sample_variance(&self.y).sqrt()
    }

    pub(crate) fn design(&self) -> &DenseX {
        &self.x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn names(p: usize) -> Vec<String> {
        (1..=p).map(|j| format!("x{}", j)).collect()
    }

    #[test]
    fn test_standardize_zero_mean_unit_sd() {
        let x = vec![vec![1.0, 10.0], vec![2.0, 30.0], vec![3.0, 20.0], vec![6.0, 40.0]];
        let ds = Dataset::from_rows(x, vec![0.0, 1.0, 0.0, 1.0], names(2)).unwrap();
        let s = ds.standardize().unwrap();
        for j in 0..2 {
            let col = s.column(j);
            let mean = col.iter().sum::<f64>() / 4.0;
            let var = col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 3.0;
            assert_relative_eq!(mean, 0.0, epsilon = 1e-12);
            assert_relative_eq!(var, 1.0, epsilon = 1e-12);
        }
        assert_relative_eq!(s.centers()[0], 3.0, epsilon = 1e-12);
        assert!(s.is_standardized());
    }

    #[test]
    fn test_zero_column_is_kept_constant_column_rejected() {
        let x = vec![vec![0.0, 1.0], vec![0.0, 2.0], vec![0.0, 3.0]];
        let ds = Dataset::from_rows(x, vec![1.0, 0.0, 1.0], names(2)).unwrap();
        let s = ds.standardize().unwrap();
        assert_eq!(s.column(0), vec![0.0, 0.0, 0.0]);

        let x = vec![vec![5.0], vec![5.0], vec![5.0]];
        let ds = Dataset::from_rows(x, vec![1.0, 0.0, 1.0], names(1)).unwrap();
        assert!(matches!(ds.standardize(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_rejects_non_finite_and_ragged() {
        let bad = Dataset::from_rows(vec![vec![f64::NAN]], vec![1.0], names(1));
        assert!(bad.is_err());
        let ragged = Dataset::from_rows(vec![vec![1.0], vec![1.0, 2.0]], vec![1.0, 0.0], names(1));
        assert!(ragged.is_err());
        let y_nan = Dataset::from_rows(vec![vec![1.0]], vec![f64::INFINITY], names(1));
        assert!(y_nan.is_err());
    }

    #[test]
    fn test_select_rows_and_trials() {
        let ds = Dataset::from_columns(vec![vec![1.0, 2.0, 3.0]], vec![0.0, 2.0, 1.0], names(1))
            .unwrap()
            .with_trials(vec![1.0, 3.0, 2.0])
            .unwrap();
        let sub = ds.without_row(1).unwrap();
        assert_eq!(sub.n_obs(), 2);
        assert_eq!(sub.y(), &[0.0, 1.0]);
        assert_eq!(sub.trials(), &[1.0, 2.0]);
        assert!(ds.clone().with_trials(vec![1.0, 0.5, 1.0]).is_err());
    }
}
