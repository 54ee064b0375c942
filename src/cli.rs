use crate::config::DispatchConfigOverrides;
use anyhow::{anyhow, bail, Result};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HarnessArgs {
    pub fixture: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub write_output: Option<PathBuf>,
    pub golden: Option<PathBuf>,
    pub help: bool,
    profile: Option<bool>,
    trace_handlers: Option<bool>,
    script_root: Option<PathBuf>,
}

impl HarnessArgs {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = HarnessArgs::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // skip program name if present
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            if flag == "--help" || flag == "-h" {
                parsed.help = true;
                continue;
            }
            if !flag.starts_with('-') {
                bail!("Unexpected argument '{flag}'. Use --help for the supported flags.");
            }
            let value =
                iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match flag {
                "--fixture" | "-f" => parsed.fixture = Some(PathBuf::from(value)),
                "--config" | "-c" => parsed.config = Some(PathBuf::from(value)),
                "--write-output" | "-o" => parsed.write_output = Some(PathBuf::from(value)),
                "--golden" | "-g" => parsed.golden = Some(PathBuf::from(value)),
                "--scripts" => parsed.script_root = Some(PathBuf::from(value)),
                "--profile" => parsed.profile = Some(parse_bool_flag("profile", &value)?),
                "--trace-handlers" => parsed.trace_handlers = Some(parse_bool_flag("trace-handlers", &value)?),
                _ => bail!("Unknown flag '{flag}'. Use --help for the supported flags."),
            }
        }
        Ok(parsed)
    }

    pub fn require_fixture(&self) -> Result<&PathBuf> {
        self.fixture.as_ref().ok_or_else(|| anyhow!("--fixture <path> is required"))
    }

    pub fn config_overrides(&self) -> DispatchConfigOverrides {
        DispatchConfigOverrides {
            profile: self.profile,
            trace_handlers: self.trace_handlers,
            script_root: self.script_root.clone(),
        }
    }
}

pub fn usage() -> &'static str {
    "Usage: script_harness --fixture <path> [options]\n\
     \x20 -f, --fixture         Harness fixture JSON file\n\
     \x20 -c, --config          Dispatch config JSON file\n\
     \x20 -g, --golden          Golden report to compare against\n\
     \x20 -o, --write-output    Write the actual report JSON here\n\
     \x20     --scripts         Script root used to resolve relative script paths\n\
     \x20     --profile         on/off, overrides profiler.enabled\n\
     \x20     --trace-handlers  on/off, overrides profiler.trace_handlers"
}

fn parse_bool_flag(flag: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("Invalid {flag} value '{other}'. Use on/off or true/false."),
    }
}
