use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_varsel"))
}

fn tmp_path(filename: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let mut p = std::env::temp_dir();
    p.push(format!("varsel_cli_{}_{}_{}", std::process::id(), nanos, filename));
    p
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

fn stdout_json(out: &Output) -> serde_json::Value {
    assert!(
        out.status.success(),
        "command failed\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
    serde_json::from_slice(&out.stdout).expect("stdout should be valid JSON")
}

/// `y = 1 + 2 x1 + noise`, `x2` pure noise. Deterministic pseudo-noise.
fn write_linear_csv(name: &str, delimiter: char) -> PathBuf {
    let path = tmp_path(name);
    let d = delimiter;
    let mut s = format!("x1{d}x2{d}y\n");
    for i in 0..40 {
        let t = i as f64;
        let x1 = (0.7 * t).sin() * 1.5;
        let x2 = (1.3 * t + 0.4).cos();
        let noise = 0.3 * (2.9 * t + 1.1).sin();
        let y = 1.0 + 2.0 * x1 + noise;
        s.push_str(&format!("{x1:.6}{d}{x2:.6}{d}{y:.6}\n"));
    }
    std::fs::write(&path, s).unwrap();
    path
}

const QUICK: [&str; 6] = ["--chains", "2", "--warmup", "200", "--samples", "200"];

fn with_quick<'a>(args: &[&'a str]) -> Vec<&'a str> {
    let mut v = args.to_vec();
    v.extend_from_slice(&QUICK);
    v
}

#[test]
fn version_prints_tool_name() {
    let out = run(&["version"]);
    assert!(out.status.success());
    let s = String::from_utf8_lossy(&out.stdout);
    assert!(s.starts_with("varsel "), "unexpected: {}", s);
}

#[test]
fn fit_reports_summaries_and_input_hash() {
    let csv = write_linear_csv("fit.csv", ',');
    let input = csv.to_string_lossy().to_string();
    let out = run(&with_quick(&["fit", "--input", &input, "--response", "y"]));
    let v = stdout_json(&out);

    let params = v.get("parameters").and_then(|x| x.as_array()).expect("parameters should be an array");
    let names: Vec<&str> = params.iter().filter_map(|p| p.get("name")?.as_str()).collect();
    assert_eq!(names, vec!["(Intercept)", "x1", "x2", "sigma"]);
    for p in params {
        for key in ["mean", "sd", "lower", "upper", "r_hat", "ess_bulk", "ess_tail"] {
            assert!(p.get(key).is_some(), "missing {} in {}", key, p);
        }
    }
    let x1_lower = params[1].get("lower").and_then(|x| x.as_f64()).expect("x1 lower");
    assert!(x1_lower > 0.0, "x1 interval should exclude 0: {}", params[1]);

    let status = v.pointer("/quality/status").and_then(|x| x.as_str()).expect("quality.status");
    assert!(["ok", "warn", "fail"].contains(&status));
    assert!(v.pointer("/diagnostics/n_divergent").and_then(|x| x.as_u64()).is_some());

    let sha = v.pointer("/meta/input/input_sha256").and_then(|x| x.as_str()).expect("input sha");
    assert_eq!(sha.len(), 64);
    assert_eq!(v.pointer("/meta/command").and_then(|x| x.as_str()), Some("fit"));
    std::fs::remove_file(csv).ok();
}

#[test]
fn loo_writes_output_file() {
    let csv = write_linear_csv("loo.csv", ';');
    let input = csv.to_string_lossy().to_string();
    let out_path = tmp_path("loo.json");
    let output = out_path.to_string_lossy().to_string();
    let out = run(&with_quick(&[
        "loo", "-i", &input, "--response", "y", "--delimiter", ";", "--pointwise", "-o", &output,
    ]));
    assert!(out.status.success(), "stderr:\n{}", String::from_utf8_lossy(&out.stderr));

    let v: serde_json::Value = serde_json::from_slice(&std::fs::read(&out_path).unwrap()).unwrap();
    let elpd = v.pointer("/loo/elpd_loo").and_then(|x| x.as_f64()).expect("elpd_loo");
    assert!(elpd.is_finite());
    assert!(v.pointer("/loo/se_elpd_loo").and_then(|x| x.as_f64()).unwrap() > 0.0);
    let table = v.pointer("/loo/pareto_k_table").and_then(|x| x.as_array()).expect("k table");
    assert_eq!(table.len(), 4);
    let total: u64 = table.iter().filter_map(|r| r.get("count")?.as_u64()).sum();
    assert_eq!(total, 40);
    let pw = v.pointer("/loo/pointwise_elpd").and_then(|x| x.as_array()).expect("pointwise");
    assert_eq!(pw.len(), 40);
    std::fs::remove_file(csv).ok();
    std::fs::remove_file(out_path).ok();
}

#[test]
fn compare_ranks_full_model_first() {
    let csv = write_linear_csv("compare.csv", ',');
    let input = csv.to_string_lossy().to_string();
    let out = run(&with_quick(&["compare", "-i", &input, "--response", "y", "--submodel", ""]));
    let v = stdout_json(&out);
    let rows = v.pointer("/comparison/rows").and_then(|x| x.as_array()).expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(v.pointer("/comparison/best").and_then(|x| x.as_str()), Some("full"));
    let diff = rows[1].get("elpd_diff").and_then(|x| x.as_f64()).unwrap();
    assert!(diff < 0.0);
    assert!(v.pointer("/models/intercept-only/elpd_loo").is_some());
    std::fs::remove_file(csv).ok();
}

#[test]
fn compare_with_horseshoe_handles_small_submodels() {
    let csv = write_linear_csv("compare_hs.csv", ',');
    let input = csv.to_string_lossy().to_string();
    let out = run(&with_quick(&[
        "compare", "-i", &input, "--response", "y", "--prior", "hs", "--p0", "1.5",
        "--submodel", "", "--submodel", "x1",
    ]));
    let v = stdout_json(&out);
    let rows = v.pointer("/comparison/rows").and_then(|x| x.as_array()).expect("rows");
    assert_eq!(rows.len(), 3);
    assert!(v.pointer("/models/intercept-only/elpd_loo").and_then(|x| x.as_f64()).is_some());
    assert!(v.pointer("/models/x1/elpd_loo").and_then(|x| x.as_f64()).is_some());
    std::fs::remove_file(csv).ok();
}

#[test]
fn select_finds_signal() {
    let csv = write_linear_csv("select.csv", ',');
    let input = csv.to_string_lossy().to_string();
    let out = run(&with_quick(&[
        "select", "-i", &input, "--response", "y", "--n-draws-pred", "100",
    ]));
    let v = stdout_json(&out);
    let path = v.pointer("/selection/path_names").and_then(|x| x.as_array()).expect("path");
    assert_eq!(path.len(), 2);
    assert_eq!(path[0].as_str(), Some("x1"));
    let sizes = v.pointer("/selection/sizes").and_then(|x| x.as_array()).expect("sizes");
    assert_eq!(sizes.len(), 3);
    assert_eq!(v.pointer("/selection/state").and_then(|x| x.as_str()), Some("done"));
    std::fs::remove_file(csv).ok();
}

#[test]
fn run_config_drives_pipeline() {
    let csv = write_linear_csv("run.csv", ',');
    let cfg_path = tmp_path("run.json");
    let cfg = serde_json::json!({
        "dataset": { "input": csv, "response": "y", "columns": ["x1"] },
        "sampler": { "n_chains": 2, "n_warmup": 200, "n_samples": 200, "seed": 3 },
        "loo": { "reloo": true },
        "threads": 2,
    });
    std::fs::write(&cfg_path, serde_json::to_string_pretty(&cfg).unwrap()).unwrap();
    let config = cfg_path.to_string_lossy().to_string();
    let v = stdout_json(&run(&["run", "--config", &config]));

    assert_eq!(v.pointer("/meta/command").and_then(|x| x.as_str()), Some("run"));
    assert_eq!(v.pointer("/fit/covariates").and_then(|x| x.as_array()).map(|a| a.len()), Some(1));
    assert!(v.pointer("/loo/elpd_loo").and_then(|x| x.as_f64()).is_some());
    assert!(v.get("selection").map(|x| x.is_null()).unwrap_or(false));
    std::fs::remove_file(csv).ok();
    std::fs::remove_file(cfg_path).ok();
}

#[test]
fn bad_input_fails_cleanly() {
    let csv = write_linear_csv("bad.csv", ',');
    let input = csv.to_string_lossy().to_string();
    let out = run(&["fit", "-i", &input, "--response", "nope"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("nope"));

    let out = run(&["fit", "-i", &input, "--response", "y", "--delimiter", "|"]);
    assert!(!out.status.success());
    std::fs::remove_file(csv).ok();
}
