use crate::config::schema::{
    AppConfig, CacheConfig, DatabaseConfig, FetchConfig, PipelineConfig, SchedulerConfig,
};
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use validator::Validate;

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
        let path = path.as_ref();
        let mut visited = HashSet::new();
        Self::load_with_inheritance(path, &mut visited, false)
    }

    fn load_with_inheritance(
        path: &Path,
        visited: &mut HashSet<PathBuf>,
        is_parent_load: bool,
    ) -> Result<AppConfig> {
        let path = fs::canonicalize(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

        if visited.contains(&path) {
            return Err(Error::Config(format!(
                "Circular inheritance detected involving {}",
                path.display()
            )));
        }
        visited.insert(path.clone());

        let config = Self::load_file(&path)?;

        let final_config = if let Some(parent_path_str) = &config.extends {
            let parent_path = path
                .parent()
                .ok_or_else(|| {
                    Error::Config(format!(
                        "Cannot determine parent directory for {}",
                        path.display()
                    ))
                })?
                .join(parent_path_str);

            let parent_config = Self::load_with_inheritance(&parent_path, visited, true)?;
            Self::merge_configs(parent_config, config)
        } else {
            config
        };

        if !is_parent_load {
            final_config.validate()?;
        }

        Ok(final_config)
    }

    fn load_file(path: &Path) -> Result<AppConfig> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<AppConfig> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Ok(serde_json::from_str(content)?),
            Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(content)?),
            Some("toml") => Ok(toml::from_str(content)?),
            _ => Err(Error::Config(format!(
                "Unsupported file extension: {}",
                path.display()
            ))),
        }
    }

    fn merge_configs(mut parent: AppConfig, child: AppConfig) -> AppConfig {
        let defaults = AppConfig::default();

        if child.owner_id != defaults.owner_id {
            parent.owner_id = child.owner_id;
        }
        if child.database != DatabaseConfig::default() {
            parent.database = child.database;
        }
        if !child.proxies.is_empty() {
            parent.proxies = child.proxies;
        }
        if child.fetch != FetchConfig::default() {
            parent.fetch = child.fetch;
        }
        if child.scheduler != SchedulerConfig::default() {
            parent.scheduler = child.scheduler;
        }
        if child.cache != CacheConfig::default() {
            parent.cache = child.cache;
        }
        if child.pipeline != PipelineConfig::default() {
            parent.pipeline = child.pipeline;
        }
        if child.output.is_some() {
            parent.output = child.output;
        }

        parent.extends = None;
        parent
    }
}
