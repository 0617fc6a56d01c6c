use crate::instrumentation::InstrumentationKind;
use crate::mutator::MutatorKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    /// Whitespace-separated command line; `@@` is replaced by the input file.
    pub command: String,
    #[serde(default)]
    pub seed_paths: Vec<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct InstrumentationSettings {
    #[serde(default = "default_instrumentation_kind")]
    pub kind: String,
    /// JSON object handed to the backend, see its help text.
    #[serde(default)]
    pub options: String,
}

fn default_instrumentation_kind() -> String {
    InstrumentationKind::Dbt.name().to_string()
}

impl InstrumentationSettings {
    pub fn kind(&self) -> Result<InstrumentationKind, anyhow::Error> {
        Ok(self.kind.parse()?)
    }
}

impl Default for InstrumentationSettings {
    fn default() -> Self {
        Self {
            kind: default_instrumentation_kind(),
            options: String::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MutatorSettings {
    #[serde(default = "default_mutator_kind")]
    pub kind: String,
    #[serde(default)]
    pub options: String,
}

fn default_mutator_kind() -> String {
    MutatorKind::Havoc.name().to_string()
}

impl MutatorSettings {
    pub fn kind(&self) -> Result<MutatorKind, anyhow::Error> {
        Ok(self.kind.parse()?)
    }
}

impl Default for MutatorSettings {
    fn default() -> Self {
        Self {
            kind: default_mutator_kind(),
            options: String::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_iterations")]
    pub max_iterations: u64,
    /// Largest input the mutator may produce.
    #[serde(default = "default_max_input_len")]
    pub max_input_len: usize,
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
}

pub fn default_iterations() -> u64 {
    1_000_000
}
pub fn default_max_input_len() -> usize {
    1 << 20
}
pub fn default_checkpoint_interval() -> u64 {
    10_000
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_iterations(),
            max_input_len: default_max_input_len(),
            checkpoint_path: None,
            checkpoint_interval: default_checkpoint_interval(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EmberConfig {
    pub target: TargetSettings,
    #[serde(default)]
    pub instrumentation: InstrumentationSettings,
    #[serde(default)]
    pub mutator: MutatorSettings,
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
}

impl EmberConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        Self::from_toml(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {:?}: {}", path, e))
    }

    pub fn from_toml(content: &str) -> Result<Self, anyhow::Error> {
        let config: EmberConfig = toml::from_str(content)?;
        config.instrumentation.kind()?;
        config.mutator.kind()?;
        Ok(config)
    }
}
