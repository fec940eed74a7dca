//! Command-line parsing.

use saga_core::runner::RunConfig;
use std::path::PathBuf;

/// Options given on the command line. Anything unset falls back to the
/// config file, then to defaults.
#[derive(Debug, Default)]
pub struct CliArgs {
    pub config: Option<PathBuf>,
    pub premise: Option<String>,
    pub premise_file: Option<PathBuf>,
    pub world_file: Option<PathBuf>,
    pub story: Option<String>,
    pub store: Option<PathBuf>,
    pub target: Option<u32>,
    pub arc_size: Option<u32>,
    pub session_limit: Option<u32>,
    pub seed: Option<u64>,
    pub model: Option<String>,
}

fn number<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> Result<T, String> {
    let value = value.ok_or_else(|| format!("{flag} needs a value"))?;
    value.parse().map_err(|_| format!("{flag}: not a number: {value}"))
}

fn text(flag: &str, value: Option<&String>) -> Result<String, String> {
    value.cloned().ok_or_else(|| format!("{flag} needs a value"))
}

pub fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut cli = CliArgs::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let value = args.get(i + 1);
        match flag {
            "--config" => cli.config = Some(text(flag, value)?.into()),
            "--premise" => cli.premise = Some(text(flag, value)?),
            "--premise-file" => cli.premise_file = Some(text(flag, value)?.into()),
            "--world-file" => cli.world_file = Some(text(flag, value)?.into()),
            "--story" => cli.story = Some(text(flag, value)?),
            "--store" => cli.store = Some(text(flag, value)?.into()),
            "--target" => cli.target = Some(number(flag, value)?),
            "--arc-size" => cli.arc_size = Some(number(flag, value)?),
            "--session-limit" => cli.session_limit = Some(number(flag, value)?),
            "--seed" => cli.seed = Some(number(flag, value)?),
            "--model" => cli.model = Some(text(flag, value)?),
            other => return Err(format!("unknown option: {other}")),
        }
        i += 2;
    }

    Ok(cli)
}

impl CliArgs {
    /// Build the run configuration: config file first, then flags on top.
    pub async fn into_config(self) -> Result<RunConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_json_file(path).await?,
            None => RunConfig::default(),
        };

        if let Some(story) = self.story {
            config.story_id = story;
        }
        if let Some(premise) = self.premise {
            config.premise = premise;
        }
        if let Some(path) = self.premise_file {
            config.premise = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| format!("{}: {e}", path.display()))?;
        }
        if let Some(path) = self.world_file {
            let document = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| format!("{}: {e}", path.display()))?;
            config.world_document = Some(document);
        }
        if let Some(target) = self.target {
            config.target_installments = target;
        }
        if let Some(arc_size) = self.arc_size {
            config = config.with_arc_size(arc_size);
        }
        if let Some(limit) = self.session_limit {
            config.session_limit = Some(limit);
        }
        if let Some(seed) = self.seed {
            config = config.with_seed(seed);
        }

        if config.premise.trim().is_empty() {
            return Err("a premise is required (--premise or --premise-file)".into());
        }
        config.validate()?;
        Ok(config)
    }
}
