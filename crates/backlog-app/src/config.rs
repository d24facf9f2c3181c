use std::{fs, path::Path};

use anyhow::{Context, Result, bail};
use backlog_core::rank::{DEFAULT_MAX_KEY_LEN, MAX_MAX_KEY_LEN, MIN_MAX_KEY_LEN, RankAllocator};
use serde::Deserialize;

const CONFIG_DIR: &str = ".backlog";
const CONFIG_FILE: &str = "config.toml";

/// Top-level project configuration loaded from `.backlog/config.toml`.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Stack-rank settings.
    #[serde(default)]
    pub ranking: RankingConfig,
}

impl ProjectConfig {
    /// Load configuration from a working directory; a missing file yields defaults.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, parsed or validated.
    pub fn from_workdir(workdir: impl AsRef<Path>) -> Result<Self> {
        let config_path = workdir.as_ref().join(CONFIG_DIR).join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;
        config
            .ranking
            .validate()
            .with_context(|| format!("invalid configuration in {}", config_path.display()))?;
        Ok(config)
    }
}

/// `[ranking]` block.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RankingConfig {
    /// Longest rank key the allocator may mint before a scope must be rebalanced.
    pub max_key_length: usize,
    /// Rebalance scopes holding duplicate ranks before inserting into them.
    pub rebalance_on_duplicates: bool,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            max_key_length: DEFAULT_MAX_KEY_LEN,
            rebalance_on_duplicates: true,
        }
    }
}

impl RankingConfig {
    /// Allocator honoring `max_key_length`.
    #[must_use]
    pub fn allocator(&self) -> RankAllocator {
        RankAllocator::new(self.max_key_length)
    }

    fn validate(&self) -> Result<()> {
        if !(MIN_MAX_KEY_LEN..=MAX_MAX_KEY_LEN).contains(&self.max_key_length) {
            bail!(
                "ranking.max_key_length must be between {MIN_MAX_KEY_LEN} and {MAX_MAX_KEY_LEN}, got {}",
                self.max_key_length
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_config(dir: &Path, body: &str) -> Result<()> {
        let cfg_dir = dir.join(CONFIG_DIR);
        fs::create_dir_all(&cfg_dir)?;
        let mut file = fs::File::create(cfg_dir.join(CONFIG_FILE))?;
        writeln!(file, "{body}")?;
        Ok(())
    }

    #[test]
    fn missing_config_returns_defaults() -> Result<()> {
        let dir = tempdir()?;
        let cfg = ProjectConfig::from_workdir(dir.path())?;
        assert_eq!(cfg.ranking.max_key_length, DEFAULT_MAX_KEY_LEN);
        assert!(cfg.ranking.rebalance_on_duplicates);
        assert_eq!(cfg.ranking.allocator().max_len(), DEFAULT_MAX_KEY_LEN);
        Ok(())
    }

    #[test]
    fn load_ranking_block() -> Result<()> {
        let dir = tempdir()?;
        write_config(dir.path(), "[ranking]\nmax_key_length = 6\nrebalance_on_duplicates = false")?;
        let cfg = ProjectConfig::from_workdir(dir.path())?;
        assert_eq!(cfg.ranking.max_key_length, 6);
        assert!(!cfg.ranking.rebalance_on_duplicates);
        assert_eq!(cfg.ranking.allocator().max_len(), 6);
        Ok(())
    }

    #[test]
    fn partial_block_keeps_remaining_defaults() -> Result<()> {
        let dir = tempdir()?;
        write_config(dir.path(), "[ranking]\nmax_key_length = 10")?;
        let cfg = ProjectConfig::from_workdir(dir.path())?;
        assert_eq!(cfg.ranking.max_key_length, 10);
        assert!(cfg.ranking.rebalance_on_duplicates);
        Ok(())
    }

    #[test]
    fn out_of_range_key_length_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        write_config(dir.path(), "[ranking]\nmax_key_length = 40")?;
        let Err(err) = ProjectConfig::from_workdir(dir.path()) else {
            panic!("oversized max_key_length should error");
        };
        assert!(format!("{err:#}").contains("max_key_length"));
        Ok(())
    }

    #[test]
    fn malformed_toml_is_reported_with_path() -> Result<()> {
        let dir = tempdir()?;
        write_config(dir.path(), "[ranking\nmax_key_length = 6")?;
        let Err(err) = ProjectConfig::from_workdir(dir.path()) else {
            panic!("malformed file should error");
        };
        assert!(err.to_string().contains("failed to parse"));
        Ok(())
    }
}
