use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

use crate::diffuse::{SolverKind, SolverSettings};
use crate::onto::{AnnotationFilter, Aspect};

/// Minimum number of distinct terms an entity needs to enter the network.
pub const DEFAULT_MIN_TERMS: usize = 10;
/// Z-score at or above which an unlabeled entity is reported as a hit.
pub const DEFAULT_ZSCORE_CUTOFF: f64 = 2.0;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect: Option<Aspect>,
    pub skip_negated: bool,
    pub exclude_evidence: Vec<String>,
    pub min_terms: usize,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            aspect: None,
            skip_negated: true,
            exclude_evidence: Vec::new(),
            min_terms: DEFAULT_MIN_TERMS,
        }
    }
}

impl CorpusConfig {
    pub fn filter(&self) -> AnnotationFilter {
        AnnotationFilter {
            aspect: self.aspect,
            skip_negated: self.skip_negated,
            exclude_evidence: self.exclude_evidence.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Neighbors kept per entity. Unset means `ceil(sqrt(n))`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub neighbors: Option<usize>,
    pub progress: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            neighbors: None,
            progress: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionConfig {
    pub solver: SolverKind,
    pub tolerance: f64,
    pub max_iterations: usize,
    pub restart: usize,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        let settings = SolverSettings::default();
        Self {
            solver: SolverKind::default(),
            tolerance: settings.tolerance,
            max_iterations: settings.max_iterations,
            restart: settings.restart,
        }
    }
}

impl DiffusionConfig {
    pub fn settings(&self) -> SolverSettings {
        SolverSettings {
            tolerance: self.tolerance,
            max_iterations: self.max_iterations,
            restart: self.restart,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub zscore_cutoff: f64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            zscore_cutoff: DEFAULT_ZSCORE_CUTOFF,
        }
    }
}

/// Every tunable of a run. Missing sections and keys take their defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub corpus: CorpusConfig,
    pub network: NetworkConfig,
    pub diffusion: DiffusionConfig,
    pub report: ReportConfig,
}

impl RunConfig {
    /// Loads and validates a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: RunConfig = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.corpus.min_terms == 0 {
            return Err(ConfigError::Invalid(
                "corpus.min_terms must be at least 1".to_string(),
            ));
        }
        if self.network.neighbors == Some(0) {
            return Err(ConfigError::Invalid(
                "network.neighbors must be at least 1".to_string(),
            ));
        }
        self.diffusion
            .settings()
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("diffusion: {e}")))?;
        if !self.report.zscore_cutoff.is_finite() {
            return Err(ConfigError::Invalid(
                "report.zscore_cutoff must be a finite number".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_survive_a_save_load_cycle() {
        let file = NamedTempFile::new().unwrap();
        let config = RunConfig::default();
        config.save(file.path()).unwrap();
        assert_eq!(RunConfig::load(file.path()).unwrap(), config);
    }

    #[test]
    fn custom_values_survive_a_save_load_cycle() {
        let file = NamedTempFile::new().unwrap();
        let mut config = RunConfig::default();
        config.corpus.aspect = Some(Aspect::Process);
        config.corpus.exclude_evidence = vec!["IEA".to_string()];
        config.network.neighbors = Some(7);
        config.diffusion.solver = SolverKind::Direct;
        config.report.zscore_cutoff = 1.5;
        config.save(file.path()).unwrap();

        let text = std::fs::read_to_string(file.path()).unwrap();
        assert!(text.contains("aspect = \"P\""));
        assert!(text.contains("solver = \"direct\""));
        assert_eq!(RunConfig::load(file.path()).unwrap(), config);
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[network]\nneighbors = 4\n\n[corpus]\naspect = \"F\"").unwrap();
        file.flush().unwrap();
        let config = RunConfig::load(file.path()).unwrap();
        assert_eq!(config.network.neighbors, Some(4));
        assert_eq!(config.corpus.aspect, Some(Aspect::Function));
        assert_eq!(config.corpus.min_terms, DEFAULT_MIN_TERMS);
        assert_eq!(config.diffusion, DiffusionConfig::default());
        assert!(config.corpus.filter().skip_negated);
    }

    #[test]
    fn invalid_values_are_rejected_on_load() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[diffusion]\ntolerance = -1.0").unwrap();
        file.flush().unwrap();
        assert!(matches!(
            RunConfig::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        let mut config = RunConfig::default();
        config.network.neighbors = Some(0);
        assert!(config.validate().is_err());
    }
}
