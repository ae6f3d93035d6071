use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::runtime::ResolvedPaths;

pub const DEFAULT_USER_AGENT: &str = "wikimirror/0.1 (community preservation)";
pub const DEFAULT_ARTICLE_PATH: &str = "/$1";
pub const DEFAULT_PROFILE_TEMPLATE: &str = "Template:Characterprofile";
pub const DEFAULT_EXCLUDED_NAMESPACES: &[i32] = &[1, 2, 3];
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MirrorConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub crawl: CrawlSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub import: ImportSection,
    #[serde(default)]
    pub archive: ArchiveSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub url: Option<String>,
    pub api_url: Option<String>,
    pub name: Option<String>,
    pub article_path: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CrawlSection {
    pub delay_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub max_throttle_retries: Option<usize>,
    pub throttle_delay_ms: Option<u64>,
    pub max_concurrent_requests: Option<usize>,
    pub workers: Option<usize>,
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PolicySection {
    pub excluded_namespaces: Option<Vec<i32>>,
    #[serde(default)]
    pub profile_templates: Vec<String>,
    pub opted_in_file: Option<String>,
    pub excluded_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ImportSection {
    pub php: Option<String>,
    pub wiki_dir: Option<String>,
    pub local_settings: Option<String>,
    pub max_busy_retries: Option<usize>,
    pub busy_retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ArchiveSection {
    pub live_url: Option<String>,
}

/// Locations of the two flat policy registries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryPaths {
    pub opted_in: PathBuf,
    pub excluded: PathBuf,
}

impl MirrorConfig {
    /// Resolve the wiki API URL: env WIKI_API_URL > config > None.
    pub fn api_url_owned(&self) -> Option<String> {
        self.api_url_with(&|key| env::var(key).ok())
    }

    pub(crate) fn api_url_with<F>(&self, lookup_env: &F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        non_empty(lookup_env("WIKI_API_URL")).or_else(|| self.wiki.api_url.clone())
    }

    /// Resolve the wiki base URL: env WIKI_URL > config > derived from api_url.
    pub fn wiki_url(&self) -> Option<String> {
        self.wiki_url_with(&|key| env::var(key).ok())
    }

    pub(crate) fn wiki_url_with<F>(&self, lookup_env: &F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = non_empty(lookup_env("WIKI_URL")) {
            return Some(value);
        }
        if let Some(ref url) = self.wiki.url {
            return Some(url.clone());
        }
        self.api_url_with(lookup_env)
            .and_then(|api| derive_wiki_url(&api))
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        self.user_agent_with(&|key| env::var(key).ok())
    }

    pub(crate) fn user_agent_with<F>(&self, lookup_env: &F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = non_empty(lookup_env("WIKI_USER_AGENT")) {
            return value;
        }
        if let Some(agent) = self.wiki.user_agent.as_deref() {
            return agent.to_string();
        }
        match self.wiki.name.as_deref() {
            Some(name) if !name.trim().is_empty() => {
                format!("{}-Archiver/1.0 (community preservation)", name.trim())
            }
            _ => DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn article_path(&self) -> &str {
        self.wiki
            .article_path
            .as_deref()
            .unwrap_or(DEFAULT_ARTICLE_PATH)
    }

    /// Display name of the source wiki, used in log file names and the archive banner.
    pub fn wiki_name(&self) -> String {
        if let Some(name) = self.wiki.name.as_deref()
            && !name.trim().is_empty()
        {
            return name.trim().to_string();
        }
        self.wiki_url()
            .and_then(|url| host_of(&url))
            .unwrap_or_else(|| "wiki".to_string())
    }

    /// Short identifier safe for file names.
    pub fn wiki_id(&self) -> String {
        let id = self
            .wiki_name()
            .chars()
            .filter_map(|ch| {
                if ch.is_ascii_alphanumeric() {
                    Some(ch.to_ascii_lowercase())
                } else if ch == '-' || ch == '_' || ch == '.' {
                    Some('-')
                } else {
                    None
                }
            })
            .collect::<String>();
        if id.is_empty() { "wiki".to_string() } else { id }
    }

    /// Live wiki URL used for banner links and absolute image sources.
    pub fn live_url(&self) -> Option<String> {
        self.archive.live_url.clone().or_else(|| self.wiki_url())
    }

    pub fn workers(&self) -> usize {
        self.crawl.workers.unwrap_or(DEFAULT_WORKERS).max(1)
    }

    pub fn batch_size(&self) -> usize {
        self.crawl.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).clamp(1, 500)
    }

    /// Talk, User and User talk are always excluded; the configured list only adds to them.
    pub fn excluded_namespaces(&self) -> BTreeSet<i32> {
        DEFAULT_EXCLUDED_NAMESPACES
            .iter()
            .chain(self.policy.excluded_namespaces.iter().flatten())
            .copied()
            .collect()
    }

    pub fn profile_templates(&self) -> Vec<String> {
        let templates = self
            .policy
            .profile_templates
            .iter()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(|value| {
                if value.starts_with("Template:") {
                    value.to_string()
                } else {
                    format!("Template:{value}")
                }
            })
            .collect::<Vec<_>>();
        if templates.is_empty() {
            vec![DEFAULT_PROFILE_TEMPLATE.to_string()]
        } else {
            templates
        }
    }

    pub fn registry_paths(&self, paths: &ResolvedPaths) -> RegistryPaths {
        let opted_in = self
            .policy
            .opted_in_file
            .as_deref()
            .map(|value| absolutize_from_project(Path::new(value), &paths.project_root))
            .unwrap_or_else(|| paths.opted_in_path());
        let excluded = self
            .policy
            .excluded_file
            .as_deref()
            .map(|value| absolutize_from_project(Path::new(value), &paths.project_root))
            .unwrap_or_else(|| paths.excluded_path());
        RegistryPaths { opted_in, excluded }
    }
}

/// Load and parse a MirrorConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MirrorConfig> {
    if !config_path.exists() {
        return Ok(MirrorConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MirrorConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Derive wiki base URL from an API URL by stripping `/api.php` or `/w/api.php`.
pub fn derive_wiki_url(api_url: &str) -> Option<String> {
    let trimmed = api_url.trim();
    let stripped = trimmed
        .strip_suffix("/w/api.php")
        .or_else(|| trimmed.strip_suffix("/api.php"))
        .unwrap_or(trimmed);
    let result = stripped.trim_end_matches('/').to_string();
    if result.is_empty() {
        None
    } else {
        Some(result)
    }
}

fn host_of(url: &str) -> Option<String> {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host = without_scheme.split(['/', ':']).next()?.trim();
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn absolutize_from_project(path: &Path, project_root: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_root.join(path)
    }
}
