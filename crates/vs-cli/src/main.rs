//! varsel CLI

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::{Path, PathBuf};
use vs_inference::{
    Baseline, CvMethod, Link, SamplerConfig, SearchCriterion, VarselConfig, loo_compare, varsel,
};

mod data_io;
mod report;
mod run;

use data_io::DatasetConfig;
use report::BundleMeta;
use run::{FamilyKind, HORSESHOE_TARGET_ACCEPT, LooConfig, ModelConfig, PriorKind};

#[derive(Parser)]
#[command(name = "varsel")]
#[command(about = "varsel - Bayesian GLMs, PSIS-LOO and projection-predictive variable selection")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct DataArgs {
    /// Input CSV file with a header row
    #[arg(short, long)]
    input: PathBuf,

    /// Response column
    #[arg(long)]
    response: String,

    /// Covariate columns (comma-separated). Defaults to every other column.
    #[arg(long, value_delimiter = ',')]
    columns: Option<Vec<String>>,

    /// Binomial trial-count column
    #[arg(long)]
    trials: Option<String>,

    /// Columns where 0 marks a missing value; rows with such zeros are dropped
    #[arg(long, value_delimiter = ',')]
    zero_as_missing: Vec<String>,

    /// Field delimiter (',' or ';')
    #[arg(long, default_value = ",")]
    delimiter: char,

    /// Keep covariates on their original scale
    #[arg(long)]
    no_standardize: bool,
}

impl DataArgs {
    fn config(&self) -> DatasetConfig {
        DatasetConfig {
            input: self.input.clone(),
            response: self.response.clone(),
            columns: self.columns.clone(),
            trials: self.trials.clone(),
            zero_as_missing: self.zero_as_missing.clone(),
            delimiter: self.delimiter,
            standardize: !self.no_standardize,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct ModelArgs {
    /// Response family
    #[arg(long, value_enum, default_value_t = FamilyKind::Gaussian)]
    family: FamilyKind,

    /// Link for the binomial family (logit, probit, cauchit, cloglog)
    #[arg(long, default_value = "logit")]
    link: Link,

    /// Coefficient prior
    #[arg(long, value_enum, default_value_t = PriorKind::Normal)]
    prior: PriorKind,

    /// Prior guess of the number of relevant covariates (horseshoe)
    #[arg(long)]
    p0: Option<f64>,
}

impl ModelArgs {
    fn config(&self) -> ModelConfig {
        ModelConfig { family: self.family, link: self.link, prior: self.prior, p0: self.p0 }
    }
}

#[derive(Args, Debug, Clone)]
struct SamplerArgs {
    /// Number of chains (default: available cores, at most 4)
    #[arg(long)]
    chains: Option<usize>,

    /// Warmup iterations per chain
    #[arg(long, default_value = "1000")]
    warmup: usize,

    /// Post-warmup draws per chain
    #[arg(long, default_value = "1000")]
    samples: usize,

    /// Base random seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Target acceptance statistic (default 0.8, or 0.95 with the horseshoe prior)
    #[arg(long)]
    target_accept: Option<f64>,

    /// Maximum NUTS tree depth
    #[arg(long, default_value = "10")]
    max_treedepth: usize,
}

impl SamplerArgs {
    fn config(&self, prior: PriorKind) -> SamplerConfig {
        let mut cfg = SamplerConfig {
            n_warmup: self.warmup,
            n_samples: self.samples,
            seed: self.seed,
            ..Default::default()
        };
        if let Some(chains) = self.chains {
            cfg.n_chains = chains;
        }
        cfg.nuts.max_treedepth = self.max_treedepth;
        cfg.nuts.target_accept = match (self.target_accept, prior) {
            (Some(t), _) => t,
            (None, PriorKind::Horseshoe) => HORSESHOE_TARGET_ACCEPT,
            (None, _) => cfg.nuts.target_accept,
        };
        cfg
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum CriterionArg {
    Elpd,
    Mse,
    Kl,
}

impl From<CriterionArg> for SearchCriterion {
    fn from(c: CriterionArg) -> Self {
        match c {
            CriterionArg::Elpd => SearchCriterion::Elpd,
            CriterionArg::Mse => SearchCriterion::Mse,
            CriterionArg::Kl => SearchCriterion::Kl,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum BaselineArg {
    Best,
    Reference,
}

impl From<BaselineArg> for Baseline {
    fn from(b: BaselineArg) -> Self {
        match b {
            BaselineArg::Best => Baseline::Best,
            BaselineArg::Reference => Baseline::Reference,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a Bayesian GLM with NUTS and report posterior summaries
    Fit {
        #[command(flatten)]
        data: DataArgs,

        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        sampler: SamplerArgs,

        /// Central posterior interval probability
        #[arg(long, default_value = "0.9")]
        prob: f64,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Threads (0 = auto)
        #[arg(long, default_value = "0")]
        threads: usize,
    },

    /// Fit, then estimate out-of-sample accuracy with PSIS-LOO or K-fold CV
    Loo {
        #[command(flatten)]
        data: DataArgs,

        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        sampler: SamplerArgs,

        /// Refit the model for observations with Pareto k above the threshold
        #[arg(long)]
        reloo: bool,

        /// Use K-fold CV with this many folds instead of PSIS-LOO
        #[arg(long)]
        kfold: Option<usize>,

        /// Include pointwise elpd and Pareto k in the output
        #[arg(long)]
        pointwise: bool,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Threads (0 = auto)
        #[arg(long, default_value = "0")]
        threads: usize,
    },

    /// Compare the full model with covariate subsets by elpd
    Compare {
        #[command(flatten)]
        data: DataArgs,

        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        sampler: SamplerArgs,

        /// Submodel covariates (comma-separated; empty = intercept-only). Repeatable.
        #[arg(long = "submodel", required = true)]
        submodels: Vec<String>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Threads (0 = auto)
        #[arg(long, default_value = "0")]
        threads: usize,
    },

    /// Projection-predictive forward variable selection
    Select {
        #[command(flatten)]
        data: DataArgs,

        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        sampler: SamplerArgs,

        /// Candidate ranking criterion
        #[arg(long, value_enum, default_value = "elpd")]
        criterion: CriterionArg,

        /// Baseline for the suggested size
        #[arg(long, value_enum, default_value = "best")]
        baseline: BaselineArg,

        /// Cross-validate the search with K folds instead of PSIS-LOO
        #[arg(long)]
        kfold: Option<usize>,

        /// Largest submodel size to search
        #[arg(long)]
        max_size: Option<usize>,

        /// Reference draws projected during the search
        #[arg(long, default_value = "100")]
        n_draws_search: usize,

        /// Reference draws projected for the performance curve
        #[arg(long, default_value = "400")]
        n_draws_pred: usize,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Threads (0 = auto)
        #[arg(long, default_value = "0")]
        threads: usize,
    },

    /// Run fit, LOO and (optionally) selection from a JSON run config
    Run {
        /// Run config (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Output file; overrides the config's `output`
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Fit { data, model, sampler, prob, output, threads } => {
            setup_threads(threads);
            cmd_fit(&data, &model, &sampler, prob, output.as_ref())
        }
        Commands::Loo { data, model, sampler, reloo, kfold, pointwise, output, threads } => {
            setup_threads(threads);
            let loo = LooConfig { reloo, kfold, pointwise, ..Default::default() };
            cmd_loo(&data, &model, &sampler, &loo, output.as_ref())
        }
        Commands::Compare { data, model, sampler, submodels, output, threads } => {
            setup_threads(threads);
            cmd_compare(&data, &model, &sampler, &submodels, output.as_ref())
        }
        Commands::Select {
            data,
            model,
            sampler,
            criterion,
            baseline,
            kfold,
            max_size,
            n_draws_search,
            n_draws_pred,
            output,
            threads,
        } => {
            setup_threads(threads);
            let cfg = VarselConfig {
                max_size,
                criterion: criterion.into(),
                baseline: baseline.into(),
                cv_method: kfold.map_or(CvMethod::Loo, |k| CvMethod::KFold { k }),
                n_draws_search,
                n_draws_pred,
                seed: sampler.seed,
                ..Default::default()
            };
            cmd_select(&data, &model, &sampler, &cfg, output.as_ref())
        }
        Commands::Run { config, output } => cmd_run(&config, output.as_ref()),
        Commands::Version => {
            println!("varsel {}", vs_core::VERSION);
            Ok(())
        }
    }
}

fn setup_threads(threads: usize) {
    if threads > 0 {
        // Best-effort; if a global pool already exists, keep going.
        let _ = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global();
    }
}

fn write_json(output: Option<&PathBuf>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}

fn cmd_fit(
    data: &DataArgs,
    model: &ModelArgs,
    sampler: &SamplerArgs,
    prob: f64,
    output: Option<&PathBuf>,
) -> Result<()> {
    let (dataset, model_cfg) = (data.config(), model.config());
    let sampler_cfg = sampler.config(model.prior);
    let fit = run::fit_reference(&dataset, &model_cfg, &sampler_cfg)?;
    tracing::info!(status = %fit.quality().status, "fit complete");

    let args = json!({ "dataset": dataset, "model": model_cfg, "sampler": sampler_cfg, "prob": prob });
    let meta = BundleMeta::new("fit", args, &dataset.input)?;
    let mut out = report::fit_report(&fit, prob)?;
    out["meta"] = serde_json::to_value(meta)?;
    write_json(output, out)
}

fn cmd_loo(
    data: &DataArgs,
    model: &ModelArgs,
    sampler: &SamplerArgs,
    loo: &LooConfig,
    output: Option<&PathBuf>,
) -> Result<()> {
    let (dataset, model_cfg) = (data.config(), model.config());
    let sampler_cfg = sampler.config(model.prior);
    let fit = run::fit_reference(&dataset, &model_cfg, &sampler_cfg)?;
    let res = run::cross_validate(&fit, loo, sampler_cfg.seed)?;
    tracing::info!(elpd_loo = res.elpd_loo, se = res.se_elpd_loo, "cross-validation complete");

    let args = json!({ "dataset": dataset, "model": model_cfg, "sampler": sampler_cfg, "loo": loo });
    let meta = BundleMeta::new("loo", args, &dataset.input)?;
    let out = json!({
        "meta": meta,
        "quality": fit.quality(),
        "loo": report::loo_report(&res, loo.pointwise),
    });
    write_json(output, out)
}

/// Parse a `--submodel` value: comma-separated names, empty for intercept-only.
fn parse_submodel(spec: &str) -> Vec<String> {
    spec.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn cmd_compare(
    data: &DataArgs,
    model: &ModelArgs,
    sampler: &SamplerArgs,
    submodels: &[String],
    output: Option<&PathBuf>,
) -> Result<()> {
    let (dataset, model_cfg) = (data.config(), model.config());
    let sampler_cfg = sampler.config(model.prior);
    let loo_cfg = LooConfig::default();

    let mut names = vec!["full".to_string()];
    let mut configs = vec![(dataset.clone(), model_cfg.clone())];
    for spec in submodels {
        let cols = parse_submodel(spec);
        names.push(if cols.is_empty() { "intercept-only".to_string() } else { cols.join("+") });
        let sub_model = model_cfg.for_submodel(cols.len());
        configs.push((DatasetConfig { columns: Some(cols), ..dataset.clone() }, sub_model));
    }

    let mut results = Vec::with_capacity(configs.len());
    for (name, (data_cfg, sub_model)) in names.iter().zip(&configs) {
        tracing::info!(model = %name, prior = ?sub_model.prior, "fitting");
        let fit = run::fit_reference(data_cfg, sub_model, &sampler_cfg)?;
        results.push(run::cross_validate(&fit, &loo_cfg, sampler_cfg.seed)?);
    }
    let refs: Vec<_> = results.iter().collect();
    let cmp = loo_compare(&refs)?;

    let args = json!({
        "dataset": dataset,
        "model": model_cfg,
        "sampler": sampler_cfg,
        "submodels": submodels,
    });
    let meta = BundleMeta::new("compare", args, &dataset.input)?;
    let models: serde_json::Map<String, serde_json::Value> = names
        .iter()
        .zip(&results)
        .map(|(n, r)| (n.clone(), report::loo_report(r, false)))
        .collect();
    let out = json!({
        "meta": meta,
        "models": models,
        "comparison": report::comparison_report(&cmp, &names),
    });
    write_json(output, out)
}

fn cmd_select(
    data: &DataArgs,
    model: &ModelArgs,
    sampler: &SamplerArgs,
    cfg: &VarselConfig,
    output: Option<&PathBuf>,
) -> Result<()> {
    let (dataset, model_cfg) = (data.config(), model.config());
    let sampler_cfg = sampler.config(model.prior);
    let fit = run::fit_reference(&dataset, &model_cfg, &sampler_cfg)?;
    let res = varsel(&fit, cfg)?;
    tracing::info!(suggested = ?res.suggested_size, "selection complete");

    let args = json!({ "dataset": dataset, "model": model_cfg, "sampler": sampler_cfg, "selection": cfg });
    let meta = BundleMeta::new("select", args, &dataset.input)?;
    let out = json!({
        "meta": meta,
        "quality": fit.quality(),
        "selection": report::varsel_report(&res),
    });
    write_json(output, out)
}

fn cmd_run(config: &Path, output: Option<&PathBuf>) -> Result<()> {
    let cfg = run::read_run_config(config)?;
    setup_threads(cfg.threads);
    let out = run::execute(&cfg)?;
    write_json(output.or(cfg.output.as_ref()), out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_submodel() {
        assert_eq!(parse_submodel("x1, x2"), vec!["x1".to_string(), "x2".to_string()]);
        assert!(parse_submodel("").is_empty());
    }

    #[test]
    fn test_cli_parses_select() {
        let cli = Cli::try_parse_from([
            "varsel", "select", "-i", "d.csv", "--response", "y", "--family", "binomial",
            "--link", "probit", "--prior", "hs", "--kfold", "5", "--criterion", "kl",
        ])
        .unwrap();
        match cli.command {
            Commands::Select { model, kfold, criterion, .. } => {
                assert_eq!(model.family, FamilyKind::Binomial);
                assert_eq!(model.link, Link::Probit);
                assert_eq!(model.prior, PriorKind::Horseshoe);
                assert_eq!(kfold, Some(5));
                assert!(matches!(criterion, CriterionArg::Kl));
            }
            _ => panic!("expected select"),
        }
    }

    #[test]
    fn test_horseshoe_raises_target_accept() {
        let cli = Cli::try_parse_from(["varsel", "fit", "-i", "d.csv", "--response", "y", "--chains", "2"])
            .unwrap();
        let Commands::Fit { sampler, .. } = cli.command else { panic!("expected fit") };
        assert_eq!(sampler.config(PriorKind::Normal).nuts.target_accept, 0.8);
        assert_eq!(sampler.config(PriorKind::Horseshoe).nuts.target_accept, 0.95);
        assert_eq!(sampler.config(PriorKind::Normal).n_chains, 2);
    }
}
