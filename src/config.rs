// Configuration management for CodeLens

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Config file looked up in the project root
pub const CONFIG_FILE: &str = ".codelens.toml";

/// Index database file created in the project root
pub const DB_FILE: &str = ".codelens.db";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub project: ProjectConfig,
    pub indexing: IndexingConfig,
    pub query: QueryConfig,
    pub rules: RulesConfig,
    pub logging: LoggingConfig,
    pub layers: Vec<LayerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
    pub root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub exclude: Vec<String>,
    pub include: Vec<String>,
    pub watch: bool,
    /// Files written per transaction; each file still gets its own savepoint
    pub batch_size: usize,
    /// Extraction worker threads
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub max_depth: usize,
    pub max_nodes: usize,
    pub search_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub timeout_ms: u64,
    pub max_rows: usize,
    pub preview_rows: usize,
    pub default_weight: f64,
    pub rating_alpha: f64,
    pub disable_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

/// A named architectural layer and the layers it may import from
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LayerConfig {
    pub name: String,
    pub paths: Vec<String>,
    pub allowed_imports: Vec<String>,
    pub description: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: ProjectConfig::default(),
            indexing: IndexingConfig::default(),
            query: QueryConfig::default(),
            rules: RulesConfig::default(),
            logging: LoggingConfig::default(),
            layers: Vec::new(),
        }
    }
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "unnamed-project".to_string(),
            root: ".".to_string(),
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            exclude: vec![
                "**/.git/**".to_string(),
                "**/__pycache__/**".to_string(),
                "**/.venv/**".to_string(),
                "**/venv/**".to_string(),
                "**/node_modules/**".to_string(),
                "**/target/**".to_string(),
                "**/build/**".to_string(),
                "**/dist/**".to_string(),
            ],
            include: vec![],
            watch: false,
            batch_size: 64,
            workers: 4,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_nodes: 5000,
            search_limit: 20,
        }
    }
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            max_rows: 1000,
            preview_rows: 50,
            default_weight: 0.5,
            rating_alpha: 0.3,
            disable_threshold: 0.2,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from project directory
    /// Looks for .codelens.toml in the project root
    pub fn from_project_dir<P: AsRef<Path>>(project_dir: P) -> Self {
        let config_path = project_dir.as_ref().join(CONFIG_FILE);

        if !config_path.exists() {
            tracing::debug!("No config at {}, using defaults", config_path.display());
            return Self::default();
        }

        match Self::from_file(&config_path) {
            Ok(config) => {
                tracing::info!("Loaded configuration from {}", config_path.display());
                config
            }
            Err(e) => {
                tracing::warn!("Could not load config from {}: {}", config_path.display(), e);
                tracing::info!("Using default configuration");
                Self::default()
            }
        }
    }

    /// Compile the include/exclude patterns into a path filter
    pub fn path_filter(&self) -> anyhow::Result<PathFilter> {
        Ok(PathFilter {
            include: build_globset(&self.indexing.include)?,
            exclude: build_globset(&self.indexing.exclude)?,
            has_include: !self.indexing.include.is_empty(),
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.project.name.is_empty() {
            return Err(anyhow::anyhow!("Project name cannot be empty"));
        }

        if self.indexing.batch_size == 0 {
            return Err(anyhow::anyhow!("Batch size must be greater than 0"));
        }
        if self.indexing.workers == 0 {
            return Err(anyhow::anyhow!("Worker count must be greater than 0"));
        }

        if self.query.max_depth == 0 {
            return Err(anyhow::anyhow!("Query max depth must be greater than 0"));
        }
        if self.query.max_nodes == 0 {
            return Err(anyhow::anyhow!("Query max nodes must be greater than 0"));
        }

        if self.rules.timeout_ms == 0 {
            return Err(anyhow::anyhow!("Rule timeout must be greater than 0"));
        }
        if self.rules.max_rows == 0 {
            return Err(anyhow::anyhow!("Rule row budget must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.rules.default_weight) {
            return Err(anyhow::anyhow!("Rule default weight must be within 0..=1"));
        }
        if !(self.rules.rating_alpha > 0.0 && self.rules.rating_alpha <= 1.0) {
            return Err(anyhow::anyhow!("Rating alpha must be within (0, 1]"));
        }
        if self.rules.disable_threshold >= self.rules.default_weight {
            return Err(anyhow::anyhow!(
                "Disable threshold must be below the default rule weight"
            ));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!("Invalid log level: {}", self.logging.level));
        }
        let valid_formats = ["compact", "pretty", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!("Invalid log format: {}", self.logging.format));
        }

        let mut seen = std::collections::HashSet::new();
        for layer in &self.layers {
            if layer.name.is_empty() {
                return Err(anyhow::anyhow!("Layer name cannot be empty"));
            }
            if !seen.insert(layer.name.as_str()) {
                return Err(anyhow::anyhow!("Duplicate layer: {}", layer.name));
            }
            if layer.paths.is_empty() {
                return Err(anyhow::anyhow!("Layer {} has no paths", layer.name));
            }
        }
        for layer in &self.layers {
            for allowed in &layer.allowed_imports {
                if !seen.contains(allowed.as_str()) {
                    return Err(anyhow::anyhow!(
                        "Layer {} allows unknown layer {}",
                        layer.name,
                        allowed
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Compiled include/exclude globs
#[derive(Debug, Clone)]
pub struct PathFilter {
    include: GlobSet,
    exclude: GlobSet,
    has_include: bool,
}

impl PathFilter {
    /// Check if a project-relative path should be indexed
    pub fn should_index(&self, rel_path: &str) -> bool {
        if rel_path == DB_FILE || rel_path.starts_with(&format!("{}-", DB_FILE)) {
            return false;
        }
        if self.exclude.is_match(rel_path) {
            return false;
        }
        !self.has_include || self.include.is_match(rel_path)
    }

    /// True when nothing below the directory `rel_dir` can be indexed
    pub fn excludes_dir(&self, rel_dir: &str) -> bool {
        !rel_dir.is_empty()
            && (self.exclude.is_match(rel_dir)
                || self.exclude.is_match(format!("{}/_", rel_dir)))
    }
}

fn build_globset(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.project.name, "unnamed-project");
        assert!(config.layers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_should_index_file() {
        let filter = Config::default().path_filter().unwrap();

        assert!(filter.should_index("src/main.py"));
        assert!(filter.should_index("pkg/utils.py"));

        assert!(!filter.should_index("pkg/__pycache__/utils.py"));
        assert!(!filter.should_index(".venv/lib/site.py"));
        assert!(!filter.should_index(".codelens.db"));
        assert!(!filter.should_index(".codelens.db-wal"));

        assert!(filter.excludes_dir(".git"));
        assert!(filter.excludes_dir("pkg/__pycache__"));
        assert!(!filter.excludes_dir("pkg"));
        assert!(!filter.excludes_dir(""));
    }

    #[test]
    fn test_include_patterns() {
        let mut config = Config::default();
        config.indexing.include = vec!["app/**".to_string()];
        let filter = config.path_filter().unwrap();

        assert!(filter.should_index("app/models.py"));
        assert!(!filter.should_index("scripts/tool.py"));
    }

    #[test]
    fn test_parse_layers_from_toml() {
        let config: Config = toml::from_str(
            r#"
            [project]
            name = "shop"

            [[layers]]
            name = "domain"
            paths = ["domain/**"]
            allowed_imports = []

            [[layers]]
            name = "api"
            paths = ["api/**"]
            allowed_imports = ["domain"]
            "#,
        )
        .unwrap();

        assert_eq!(config.project.name, "shop");
        assert_eq!(config.layers.len(), 2);
        assert_eq!(config.layers[1].allowed_imports, vec!["domain".to_string()]);
        assert_eq!(config.rules.max_rows, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.project.name = "".to_string();
        assert!(config.validate().is_err());
        config.project.name = "test".to_string();

        config.indexing.batch_size = 0;
        assert!(config.validate().is_err());
        config.indexing.batch_size = 10;

        config.rules.disable_threshold = 0.9;
        assert!(config.validate().is_err());
        config.rules.disable_threshold = 0.2;

        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "info".to_string();

        config.layers = vec![LayerConfig {
            name: "core".to_string(),
            paths: vec!["core/**".to_string()],
            allowed_imports: vec!["nowhere".to_string()],
            description: String::new(),
        }];
        assert!(config.validate().is_err());
    }
}
