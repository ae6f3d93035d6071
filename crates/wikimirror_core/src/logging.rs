use std::env;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::runtime::ResolvedPaths;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingOptions {
    /// Log file stem, usually the command being run.
    pub name: String,
    pub wiki_id: Option<String>,
    pub verbose: bool,
}

pub fn resolve_log_dir(paths: &ResolvedPaths) -> PathBuf {
    resolve_log_dir_with(paths, |key| env::var(key).ok())
}

fn resolve_log_dir_with<F>(paths: &ResolvedPaths, lookup_env: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    match lookup_env("LOG_DIR") {
        Some(value) if !value.trim().is_empty() => {
            crate::config::absolutize_from_project(Path::new(value.trim()), &paths.project_root)
        }
        _ => paths.logs_dir.clone(),
    }
}

pub fn log_file_name(wiki_id: Option<&str>, name: &str) -> String {
    match wiki_id {
        Some(id) if !id.is_empty() => format!("{id}-{name}.log"),
        _ => format!("{name}.log"),
    }
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}

/// Install the global subscriber: stderr plus, when a log dir is given, an appended
/// plain-text log file. Returns the log file path.
pub fn init_logging(log_dir: Option<&Path>, options: &LoggingOptions) -> Result<Option<PathBuf>> {
    let mut log_path = None;
    let file_layer = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log dir {}", dir.display()))?;
            let path = dir.join(log_file_name(options.wiki_id.as_deref(), &options.name));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            log_path = Some(path);
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    let filter = if options.verbose {
        EnvFilter::new(default_directive(true))
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive(false)))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|error| anyhow!("failed to install log subscriber: {error}"))?;
    Ok(log_path)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::tempdir;

    use super::{default_directive, log_file_name, resolve_log_dir_with};
    use crate::runtime::tests::initialized_paths;

    #[test]
    fn log_file_is_named_after_wiki_and_command() {
        assert_eq!(log_file_name(Some("gswiki"), "run"), "gswiki-run.log");
        assert_eq!(log_file_name(None, "status"), "status.log");
        assert_eq!(log_file_name(Some(""), "status"), "status.log");
    }

    #[test]
    fn log_dir_prefers_env_override() {
        let temp = tempdir().expect("tempdir");
        let paths = initialized_paths(temp.path());

        let default = resolve_log_dir_with(&paths, |_| None);
        assert_eq!(default, paths.logs_dir);

        let relative = resolve_log_dir_with(&paths, |key| {
            (key == "LOG_DIR").then(|| "var/logs".to_string())
        });
        assert_eq!(relative, paths.project_root.join("var/logs"));

        let absolute_dir = temp.path().join("elsewhere");
        let absolute = absolute_dir.display().to_string();
        let resolved = resolve_log_dir_with(&paths, |_| Some(absolute.clone()));
        assert_eq!(resolved, PathBuf::from(&absolute));
    }

    #[test]
    fn verbose_raises_the_default_level() {
        assert_eq!(default_directive(false), "info");
        assert_eq!(default_directive(true), "debug");
    }
}
