use std::fs::{self, File};
use std::path::Path;

use anyhow::{bail, Context, Result};
use kestrel_events::cli::{usage, HarnessArgs};
use kestrel_events::config::DispatchConfig;
use kestrel_events::script_harness::{load_fixture, run_fixture, HarnessOutput};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    let args = match HarnessArgs::parse_from_env() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("[script-harness] {err}\n{}", usage());
            std::process::exit(2);
        }
    };
    if args.help {
        println!("{}", usage());
        return;
    }
    let config = match &args.config {
        Some(path) => DispatchConfig::load_or_default(path),
        None => DispatchConfig::default(),
    };
    init_tracing(&config);
    if let Err(err) = run(args, config) {
        error!("script harness failed: {err:?}");
        std::process::exit(1);
    }
}

fn init_tracing(config: &DispatchConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn run(args: HarnessArgs, mut config: DispatchConfig) -> Result<()> {
    let overrides = args.config_overrides();
    if !overrides.is_empty() {
        info!(fields = ?overrides.applied_fields(), "applying command line overrides");
        config.apply_overrides(&overrides);
    }
    let fixture_path = args.require_fixture()?;
    let fixture = load_fixture(fixture_path)?;
    let base_dir = fixture_path.parent().unwrap_or_else(|| Path::new("."));
    let output = run_fixture(&fixture, &config, base_dir)?;
    for timing in &output.timings {
        info!(
            event = %timing.name,
            samples = timing.profile.samples,
            average_ms = timing.profile.average_ms,
            max_ms = timing.profile.max_ms,
            "event timings"
        );
    }

    if let Some(path) = &args.write_output {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating output directory '{}'", parent.display()))?;
            }
        }
        let file =
            File::create(path).with_context(|| format!("writing harness output to '{}'", path.display()))?;
        serde_json::to_writer_pretty(file, &output.without_timings()).with_context(|| "serializing harness output")?;
        info!(path = %path.display(), "wrote harness output");
    }

    if let Some(path) = &args.golden {
        let file = File::open(path).with_context(|| format!("opening golden file '{}'", path.display()))?;
        let expected: HarnessOutput = serde_json::from_reader(file).with_context(|| "parsing golden JSON")?;
        let actual = output.without_timings();
        if expected.without_timings() != actual {
            bail!(
                "golden mismatch for {} (use --write-output to refresh):\nexpected: {}\nactual:   {}",
                fixture_path.display(),
                serde_json::to_string(&expected).unwrap_or_default(),
                serde_json::to_string(&actual).unwrap_or_default(),
            );
        }
        info!(path = %path.display(), "matched golden");
    } else if args.write_output.is_none() {
        serde_json::to_writer_pretty(std::io::stdout(), &output)?;
        println!();
    }
    Ok(())
}
