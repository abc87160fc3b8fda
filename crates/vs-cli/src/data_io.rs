//! CSV loading into a [`Dataset`].

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use vs_inference::Dataset;

/// Where the data comes from and which columns to use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Input CSV file (with a header row).
    pub input: PathBuf,
    /// Response column.
    pub response: String,
    /// Covariate columns. Defaults to every column except the response (and trials).
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    /// Binomial trial-count column (default: one trial per row).
    #[serde(default)]
    pub trials: Option<String>,
    /// Columns where a value of exactly 0 marks a missing entry; such rows are dropped.
    #[serde(default)]
    pub zero_as_missing: Vec<String>,
    /// Field delimiter, `,` or `;`.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Standardize covariates before fitting.
    #[serde(default = "default_standardize")]
    pub standardize: bool,
}

fn default_delimiter() -> char {
    ','
}

fn default_standardize() -> bool {
    true
}

/// Parsed CSV table: header plus numeric rows.
#[derive(Debug, Clone)]
struct Table {
    header: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl Table {
    fn index_of(&self, name: &str) -> Result<usize> {
        self.header
            .iter()
            .position(|h| h == name)
            .with_context(|| format!("column '{}' not found; available: {}", name, self.header.join(", ")))
    }
}

fn delimiter_byte(delimiter: char) -> Result<u8> {
    match delimiter {
        ',' => Ok(b','),
        ';' => Ok(b';'),
        other => bail!("unsupported delimiter '{}': expected ',' or ';'", other),
    }
}

fn read_table(path: &Path, delimiter: char) -> Result<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter_byte(delimiter)?)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let header: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("{}: bad CSV record {}", path.display(), line + 1))?;
        let row = record
            .iter()
            .enumerate()
            .map(|(j, field)| {
                field.parse::<f64>().with_context(|| {
                    format!("row {}, column '{}': '{}' is not a number", line + 1, header[j], field)
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        rows.push(row);
    }
    if rows.is_empty() {
        bail!("{} contains no data rows", path.display());
    }
    Ok(Table { header, rows })
}

/// Drop rows where any of `columns` equals zero. Returns the number of dropped rows.
fn drop_zero_rows(rows: &mut Vec<Vec<f64>>, columns: &[usize]) -> usize {
    let before = rows.len();
    rows.retain(|r| columns.iter().all(|&j| r[j] != 0.0));
    before - rows.len()
}

/// Load `config.input` into a [`Dataset`].
pub fn load_dataset(config: &DatasetConfig) -> Result<Dataset> {
    let mut table = read_table(&config.input, config.delimiter)?;
    let response = table.index_of(&config.response)?;
    let trials = config.trials.as_deref().map(|t| table.index_of(t)).transpose()?;

    let covariates: Vec<usize> = match &config.columns {
        Some(cols) => cols.iter().map(|c| table.index_of(c)).collect::<Result<_>>()?,
        None => (0..table.header.len()).filter(|&j| j != response && Some(j) != trials).collect(),
    };
    if covariates.contains(&response) {
        bail!("response '{}' cannot also be a covariate", config.response);
    }

    if !config.zero_as_missing.is_empty() {
        let missing = config
            .zero_as_missing
            .iter()
            .map(|c| table.index_of(c))
            .collect::<Result<Vec<_>>>()?;
        let dropped = drop_zero_rows(&mut table.rows, &missing);
        tracing::info!(
            dropped,
            remaining = table.rows.len(),
            "dropped rows with zero in {}",
            config.zero_as_missing.join(", ")
        );
        if table.rows.is_empty() {
            bail!("no rows left after dropping zeros in {}", config.zero_as_missing.join(", "));
        }
    }

    let names: Vec<String> = covariates.iter().map(|&j| table.header[j].clone()).collect();
    let x: Vec<Vec<f64>> =
        table.rows.iter().map(|r| covariates.iter().map(|&j| r[j]).collect()).collect();
    let y: Vec<f64> = table.rows.iter().map(|r| r[response]).collect();

    let mut data = Dataset::from_rows(x, y, names)?.with_response_name(config.response.clone());
    if let Some(t) = trials {
        data = data.with_trials(table.rows.iter().map(|r| r[t]).collect())?;
    }
    if config.standardize {
        data = data.standardize()?;
    }
    tracing::info!(n_obs = data.n_obs(), n_covariates = data.n_covariates(), "loaded dataset");
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_tmp(name: &str, contents: &str) -> PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let mut p = std::env::temp_dir();
        p.push(format!("varsel_data_io_{}_{}_{}", std::process::id(), nanos, name));
        std::fs::write(&p, contents).unwrap();
        p
    }

    fn config(input: PathBuf) -> DatasetConfig {
        DatasetConfig {
            input,
            response: "y".into(),
            columns: None,
            trials: None,
            zero_as_missing: Vec::new(),
            delimiter: ',',
            standardize: false,
        }
    }

    #[test]
    fn test_default_columns_exclude_response() {
        let p = write_tmp("a.csv", "a,y,b\n1,10,4\n2,20,5\n3,30,7\n");
        let data = load_dataset(&config(p.clone())).unwrap();
        assert_eq!(data.names(), &["a".to_string(), "b".to_string()]);
        assert_eq!(data.y(), &[10.0, 20.0, 30.0]);
        assert_eq!(data.row(2), &[3.0, 7.0]);
        assert_eq!(data.response_name(), "y");
        std::fs::remove_file(p).ok();
    }

    #[test]
    fn test_semicolon_and_column_subset() {
        let p = write_tmp("b.csv", "a;b;y\n1;4;0\n2;5;1\n3;7;1\n");
        let mut cfg = config(p.clone());
        cfg.delimiter = ';';
        cfg.columns = Some(vec!["b".into()]);
        let data = load_dataset(&cfg).unwrap();
        assert_eq!(data.names(), &["b".to_string()]);
        assert_eq!(data.row(1), &[5.0]);
        std::fs::remove_file(p).ok();
    }

    #[test]
    fn test_zero_as_missing_drops_rows() {
        let p = write_tmp("c.csv", "a,b,y\n1,0,1\n0,5,2\n3,7,3\n4,8,4\n");
        let mut cfg = config(p.clone());
        cfg.zero_as_missing = vec!["b".into()];
        let data = load_dataset(&cfg).unwrap();
        assert_eq!(data.n_obs(), 3);
        assert_eq!(data.y(), &[2.0, 3.0, 4.0]);
        std::fs::remove_file(p).ok();
    }

    #[test]
    fn test_trials_column() {
        let p = write_tmp("d.csv", "x,n,y\n0.5,3,1\n-0.2,2,2\n1.0,4,0\n");
        let mut cfg = config(p.clone());
        cfg.trials = Some("n".into());
        let data = load_dataset(&cfg).unwrap();
        assert_eq!(data.names(), &["x".to_string()]);
        assert_eq!(data.trials(), &[3.0, 2.0, 4.0]);
        std::fs::remove_file(p).ok();
    }

    #[test]
    fn test_errors() {
        let p = write_tmp("e.csv", "a,y\n1,x\n");
        assert!(load_dataset(&config(p.clone())).is_err());
        std::fs::remove_file(p).ok();

        let p = write_tmp("f.csv", "a,y\n1,2\n2,3\n");
        let mut cfg = config(p.clone());
        cfg.response = "missing".into();
        assert!(load_dataset(&cfg).is_err());
        cfg.response = "y".into();
        cfg.delimiter = '\t';
        assert!(load_dataset(&cfg).is_err());
        cfg.delimiter = ',';
        cfg.columns = Some(vec!["y".into()]);
        assert!(load_dataset(&cfg).is_err());
        std::fs::remove_file(p).ok();
    }
}
