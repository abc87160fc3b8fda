//! JSON output: run metadata plus per-stage report sections.

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use vs_inference::loo::ComparisonRow;
use vs_inference::{GlmFit, LooComparison, LooResult, VarselResult};

#[derive(Debug, Clone, Serialize)]
pub struct BundleMeta {
    pub tool: String,
    pub tool_version: String,
    pub created_unix_ms: u128,
    pub command: String,
    pub args: serde_json::Value,
    pub input: BundleInputMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleInputMeta {
    pub original_path: String,
    pub input_sha256: String,
    pub input_bytes: u64,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut s = String::with_capacity(64);
    for b in digest {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

fn now_unix_ms() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0)
}

impl BundleMeta {
    /// Metadata for `command` run on `input`; hashes the input file.
    pub fn new(command: &str, args: serde_json::Value, input: &Path) -> Result<Self> {
        let bytes = std::fs::read(input)?;
        Ok(Self {
            tool: "varsel".to_string(),
            tool_version: vs_core::VERSION.to_string(),
            created_unix_ms: now_unix_ms(),
            command: command.to_string(),
            args,
            input: BundleInputMeta {
                original_path: input.display().to_string(),
                input_sha256: sha256_hex(&bytes),
                input_bytes: bytes.len() as u64,
            },
        })
    }
}

/// Non-finite numbers become `null` so every report stays valid JSON.
fn num(x: f64) -> serde_json::Value {
    if x.is_finite() { json!(x) } else { serde_json::Value::Null }
}

fn nums(xs: &[f64]) -> serde_json::Value {
    serde_json::Value::Array(xs.iter().map(|&x| num(x)).collect())
}

pub fn fit_report(fit: &GlmFit, prob: f64) -> Result<serde_json::Value> {
    let summary = fit.summary_with_prob(prob)?;
    let diag = fit.diagnostics();
    let quality = fit.quality();
    let data = fit.dataset();
    let params: Vec<serde_json::Value> = summary
        .iter()
        .map(|s| {
            json!({
                "name": s.name,
                "mean": num(s.mean),
                "sd": num(s.sd),
                "lower": num(s.lower),
                "median": num(s.median),
                "upper": num(s.upper),
                "r_hat": num(s.r_hat),
                "ess_bulk": num(s.ess_bulk),
                "ess_tail": num(s.ess_tail),
            })
        })
        .collect();
    let config = fit.config();
    Ok(json!({
        "family": fit.family().to_string(),
        "prior": fit.model().prior_spec().coefficients.name(),
        "response": data.response_name(),
        "n_obs": data.n_obs(),
        "covariates": data.names(),
        "standardized": data.is_standardized(),
        "n_chains": config.n_chains,
        "n_warmup": config.n_warmup,
        "n_samples": config.n_samples,
        "seed": config.seed,
        "interval_prob": prob,
        "parameters": params,
        "diagnostics": {
            "n_divergent": diag.n_divergent,
            "divergence_rate": num(diag.divergence_rate),
            "max_treedepth_rate": num(diag.max_treedepth_rate),
            "ebfmi": nums(&diag.ebfmi),
            "mean_accept_stat": nums(&diag.mean_accept_stat),
        },
        "quality": {
            "status": quality.status.to_string(),
            "warnings": quality.warnings,
            "failures": quality.failures,
            "max_r_hat": num(quality.max_r_hat),
            "min_ess_bulk": num(quality.min_ess_bulk),
            "min_ess_tail": num(quality.min_ess_tail),
        },
    }))
}

pub fn loo_report(res: &LooResult, pointwise: bool) -> serde_json::Value {
    let mut out = json!({
        "estimator": res.estimator,
        "n_obs": res.n_obs(),
        "elpd_loo": num(res.elpd_loo),
        "se_elpd_loo": num(res.se_elpd_loo),
        "p_loo": num(res.p_loo),
        "se_p_loo": num(res.se_p_loo),
        "looic": num(res.looic),
        "se_looic": num(res.se_looic),
        "k_threshold": res.k_threshold,
        "max_pareto_k": res.max_pareto_k().map(num),
        "high_k": res.high_k_indices(),
        "pareto_k_table": res.pareto_k_table().map(|rows| {
            rows.iter()
                .map(|r| {
                    json!({
                        "category": r.category.to_string(),
                        "range": r.range,
                        "count": r.count,
                        "fraction": r.fraction,
                    })
                })
                .collect::<Vec<_>>()
        }),
        "warnings": res.warnings,
    });
    if pointwise {
        out["pointwise_elpd"] = nums(&res.pointwise_elpd);
        out["pareto_k"] = res.pareto_k.as_deref().map(nums).unwrap_or(serde_json::Value::Null);
    }
    out
}

fn comparison_row(row: &ComparisonRow, names: &[String]) -> serde_json::Value {
    json!({
        "model": names.get(row.model).cloned().unwrap_or_else(|| row.model.to_string()),
        "elpd_loo": num(row.elpd_loo),
        "se_elpd_loo": num(row.se_elpd_loo),
        "elpd_diff": num(row.elpd_diff),
        "se_diff": num(row.se_diff),
        "p_loo": num(row.p_loo),
        "looic": num(row.looic),
    })
}

pub fn comparison_report(cmp: &LooComparison, names: &[String]) -> serde_json::Value {
    json!({
        "best": cmp.best().and_then(|m| names.get(m)),
        "rows": cmp.rows.iter().map(|r| comparison_row(r, names)).collect::<Vec<_>>(),
    })
}

pub fn varsel_report(res: &VarselResult) -> serde_json::Value {
    let sizes: Vec<serde_json::Value> = res
        .sizes
        .iter()
        .map(|s| {
            json!({
                "size": s.size,
                "added": s.added,
                "elpd": num(s.elpd),
                "se": num(s.se),
                "diff": num(s.diff),
                "se_diff": num(s.se_diff),
                "mse": num(s.mse),
                "kl": num(s.kl),
            })
        })
        .collect();
    json!({
        "criterion": res.criterion,
        "baseline": res.baseline,
        "cv_method": res.cv_method,
        "state": res.state.to_string(),
        "path": res.path,
        "path_names": res.path_names,
        "reference": { "elpd": num(res.reference.elpd), "se": num(res.reference.se) },
        "sizes": sizes,
        "suggested_size": res.suggested_size,
        "selected": res.selected_names(),
        "solution_terms_stability": res.solution_terms_stability.as_deref().map(nums),
        "warnings": res.warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sha256_hex(b"").len(), 64);
    }

    #[test]
    fn test_non_finite_numbers_become_null() {
        assert_eq!(num(f64::NAN), serde_json::Value::Null);
        assert_eq!(num(f64::INFINITY), serde_json::Value::Null);
        assert_eq!(num(1.5), json!(1.5));
        assert_eq!(nums(&[1.0, f64::NAN]), json!([1.0, null]));
    }
}
