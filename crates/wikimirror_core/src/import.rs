//! Feeding export batches into a destination MediaWiki through its maintenance scripts.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, error, info, warn};

use crate::config::{MirrorConfig, absolutize_from_project};
use crate::error::ImportError;
use crate::persist::write_atomic;
use crate::runtime::ResolvedPaths;
use crate::shutdown::ShutdownSignal;

pub const DEFAULT_PHP: &str = "php";
pub const DEFAULT_MAX_BUSY_RETRIES: usize = 3;
pub const DEFAULT_BUSY_RETRY_DELAY_MS: u64 = 5_000;

const BUSY_MARKERS: &[&str] = &[
    "read-only",
    "readonly",
    "database is locked",
    "lock wait timeout",
    "deadlock found",
];

pub trait ImportBackend: Send + Sync {
    fn import_dump(&self, dump: &Path) -> Result<(), ImportError>;
    fn import_images(&self, dir: &Path) -> Result<(), ImportError>;
    /// Rebuild search text and link tables after a full import.
    fn rebuild_indexes(&self) -> Result<(), ImportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyRetryPolicy {
    pub max_retries: usize,
    pub delay: Duration,
}

impl BusyRetryPolicy {
    pub fn from_config(config: &MirrorConfig) -> Self {
        Self {
            max_retries: config
                .import
                .max_busy_retries
                .unwrap_or(DEFAULT_MAX_BUSY_RETRIES),
            delay: Duration::from_millis(
                config
                    .import
                    .busy_retry_delay_ms
                    .unwrap_or(DEFAULT_BUSY_RETRY_DELAY_MS),
            ),
        }
    }
}

/// Run `operation`, backing off while the destination reports itself busy. Other
/// failures are returned immediately.
pub fn with_busy_retry<F>(
    policy: &BusyRetryPolicy,
    shutdown: &ShutdownSignal,
    label: &str,
    mut operation: F,
) -> Result<(), ImportError>
where
    F: FnMut() -> Result<(), ImportError>,
{
    let mut attempt = 0usize;
    loop {
        match operation() {
            Ok(()) => return Ok(()),
            Err(ImportError::Busy(message)) if attempt < policy.max_retries => {
                let delay = policy.delay.saturating_mul(1u32 << attempt.min(16));
                attempt += 1;
                warn!(
                    "{label}: destination busy ({message}); retry {attempt}/{} in {}ms",
                    policy.max_retries,
                    delay.as_millis()
                );
                shutdown.sleep(delay).map_err(|_| {
                    ImportError::Failed(format!("{label} cancelled while waiting for destination"))
                })?;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Imports by shelling out to `php maintenance/<script>.php` inside the wiki install.
#[derive(Debug, Clone)]
pub struct MaintenanceScriptBackend {
    php: String,
    wiki_dir: PathBuf,
    local_settings: PathBuf,
}

impl MaintenanceScriptBackend {
    pub fn new(php: impl Into<String>, wiki_dir: PathBuf, local_settings: PathBuf) -> Self {
        Self {
            php: php.into(),
            wiki_dir,
            local_settings,
        }
    }

    pub fn from_config(config: &MirrorConfig, paths: &ResolvedPaths) -> Result<Self> {
        let Some(wiki_dir) = config
            .import
            .wiki_dir
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        else {
            bail!("[import].wiki_dir must point at the destination MediaWiki install");
        };
        let wiki_dir = absolutize_from_project(Path::new(wiki_dir), &paths.project_root);
        let local_settings = config
            .import
            .local_settings
            .as_deref()
            .map(|value| absolutize_from_project(Path::new(value), &paths.project_root))
            .unwrap_or_else(|| wiki_dir.join("LocalSettings.php"));
        let php = config
            .import
            .php
            .clone()
            .unwrap_or_else(|| DEFAULT_PHP.to_string());
        Ok(Self::new(php, wiki_dir, local_settings))
    }

    fn run_script(&self, script: &str, args: &[&Path]) -> Result<(), ImportError> {
        let script_path = self.wiki_dir.join("maintenance").join(script);
        let _window = ReadOnlyWindow::open(&self.local_settings)
            .map_err(|error| ImportError::Failed(format!("{error:#}")))?;
        debug!("running {} {}", self.php, script_path.display());
        let output = Command::new(&self.php)
            .arg(&script_path)
            .args(args)
            .current_dir(&self.wiki_dir)
            .output()
            .map_err(|error| {
                ImportError::Failed(format!("failed to launch {} {script}: {error}", self.php))
            })?;
        if output.status.success() {
            info!("{script} completed");
            return Ok(());
        }
        let mut text = String::from_utf8_lossy(&output.stderr).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stdout));
        Err(classify_script_failure(script, &text))
    }
}

impl ImportBackend for MaintenanceScriptBackend {
    fn import_dump(&self, dump: &Path) -> Result<(), ImportError> {
        self.run_script("importDump.php", &[dump])
    }

    fn import_images(&self, dir: &Path) -> Result<(), ImportError> {
        self.run_script("importImages.php", &[dir])
    }

    fn rebuild_indexes(&self) -> Result<(), ImportError> {
        self.run_script("rebuildtextindex.php", &[])?;
        self.run_script("refreshLinks.php", &[])
    }
}

pub fn classify_script_failure(script: &str, output: &str) -> ImportError {
    let summary = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or("no output")
        .to_string();
    let lowered = output.to_ascii_lowercase();
    if BUSY_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        ImportError::Busy(format!("{script}: {summary}"))
    } else {
        ImportError::Failed(format!("{script}: {summary}"))
    }
}

/// Lifts `$wgReadOnly` in LocalSettings.php for the lifetime of the guard and puts the
/// original file back on drop.
pub struct ReadOnlyWindow {
    path: PathBuf,
    original: Option<String>,
}

impl ReadOnlyWindow {
    pub fn open(path: &Path) -> Result<Self> {
        let mut window = Self {
            path: path.to_path_buf(),
            original: None,
        };
        if !path.exists() {
            debug!("no LocalSettings at {}; skipping read-only toggle", path.display());
            return Ok(window);
        }
        let original = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let Some(lifted) = comment_out_read_only(&original) else {
            return Ok(window);
        };
        write_atomic(path, lifted.as_bytes())?;
        info!("lifted $wgReadOnly in {}", path.display());
        window.original = Some(original);
        Ok(window)
    }

    pub fn is_active(&self) -> bool {
        self.original.is_some()
    }
}

impl Drop for ReadOnlyWindow {
    fn drop(&mut self) {
        let Some(original) = self.original.take() else {
            return;
        };
        match write_atomic(&self.path, original.as_bytes()) {
            Ok(()) => info!("restored $wgReadOnly in {}", self.path.display()),
            Err(err) => error!(
                "failed to restore {}; the wiki stays writable: {err:#}",
                self.path.display()
            ),
        }
    }
}

fn comment_out_read_only(content: &str) -> Option<String> {
    let mut changed = false;
    let lines = content
        .split_inclusive('\n')
        .map(|line| {
            if line.trim_start().starts_with("$wgReadOnly") {
                changed = true;
                format!("# {line}")
            } else {
                line.to_string()
            }
        })
        .collect::<String>();
    changed.then_some(lines)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::fs;
    use std::time::Duration;

    use tempfile::tempdir;

    use super::{
        BusyRetryPolicy, ImportBackend, MaintenanceScriptBackend, ReadOnlyWindow,
        classify_script_failure, with_busy_retry,
    };
    use crate::error::ImportError;
    use crate::shutdown::ShutdownSignal;

    const SETTINGS: &str = "<?php\n$wgSitename = \"Mirror\";\n$wgReadOnly = \"Archive maintenance\";\n";

    fn fast_policy(max_retries: usize) -> BusyRetryPolicy {
        BusyRetryPolicy {
            max_retries,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn read_only_window_lifts_and_restores_settings() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("LocalSettings.php");
        fs::write(&path, SETTINGS).expect("write settings");
        {
            let window = ReadOnlyWindow::open(&path).expect("open window");
            assert!(window.is_active());
            let lifted = fs::read_to_string(&path).expect("read");
            assert!(lifted.contains("# $wgReadOnly = \"Archive maintenance\";"));
            assert!(lifted.contains("$wgSitename"));
        }
        assert_eq!(fs::read_to_string(&path).expect("read"), SETTINGS);
    }

    #[test]
    fn read_only_window_is_inert_for_writable_wikis() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("LocalSettings.php");
        fs::write(&path, "<?php\n$wgSitename = \"Mirror\";\n").expect("write");
        let window = ReadOnlyWindow::open(&path).expect("open");
        assert!(!window.is_active());
        let missing = ReadOnlyWindow::open(&temp.path().join("absent.php")).expect("missing");
        assert!(!missing.is_active());
    }

    #[test]
    fn busy_retry_backs_off_then_succeeds() {
        let calls = Cell::new(0);
        let result = with_busy_retry(&fast_policy(3), &ShutdownSignal::new(), "test", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(ImportError::Busy("locked".to_string()))
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn non_busy_failures_are_not_retried() {
        let calls = Cell::new(0);
        let result = with_busy_retry(&fast_policy(3), &ShutdownSignal::new(), "test", || {
            calls.set(calls.get() + 1);
            Err(ImportError::Failed("bad xml".to_string()))
        });
        assert!(matches!(result, Err(ImportError::Failed(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn busy_retry_stops_on_shutdown() {
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        let result = with_busy_retry(&fast_policy(5), &shutdown, "test", || {
            Err(ImportError::Busy("locked".to_string()))
        });
        assert!(
            matches!(result, Err(ImportError::Failed(message)) if message.contains("cancelled"))
        );
    }

    #[test]
    fn script_output_classification() {
        assert!(matches!(
            classify_script_failure("importDump.php", "Error: The wiki is currently read-only\n"),
            ImportError::Busy(_)
        ));
        assert!(matches!(
            classify_script_failure("importDump.php", "XML parse error at line 3\n"),
            ImportError::Failed(message) if message == "importDump.php: XML parse error at line 3"
        ));
    }

    #[cfg(unix)]
    #[test]
    fn maintenance_backend_runs_scripts_inside_the_window() {
        let temp = tempdir().expect("tempdir");
        let wiki_dir = temp.path().join("wiki");
        let maintenance = wiki_dir.join("maintenance");
        fs::create_dir_all(&maintenance).expect("maintenance dir");
        let settings = wiki_dir.join("LocalSettings.php");
        fs::write(&settings, SETTINGS).expect("settings");
        let record = temp.path().join("record.txt");
        fs::write(
            maintenance.join("importDump.php"),
            format!(
                "grep -c '^# \\$wgReadOnly' LocalSettings.php > '{}'\necho \"$1\" >> '{}'\n",
                record.display(),
                record.display()
            ),
        )
        .expect("script");
        fs::write(
            maintenance.join("importImages.php"),
            "echo 'Database is read-only' >&2\nexit 1\n",
        )
        .expect("script");

        let backend = MaintenanceScriptBackend::new("sh", wiki_dir.clone(), settings.clone());
        let dump = temp.path().join("batch.xml");
        backend.import_dump(&dump).expect("import dump");
        let recorded = fs::read_to_string(&record).expect("record");
        assert_eq!(recorded, format!("1\n{}\n", dump.display()));
        assert_eq!(fs::read_to_string(&settings).expect("settings"), SETTINGS);

        let error = backend
            .import_images(temp.path())
            .expect_err("images fail");
        assert!(matches!(error, ImportError::Busy(_)));
    }
}
