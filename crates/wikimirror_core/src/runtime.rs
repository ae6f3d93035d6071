use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::absolutize_from_project;
use crate::persist::write_atomic;

pub const STATE_DIR_NAME: &str = ".wikimirror";
pub const DB_FILENAME: &str = "wikimirror.db";
pub const OPTED_IN_FILENAME: &str = "opted_in.json";
pub const EXCLUDED_FILENAME: &str = "excluded.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub archive_dir: PathBuf,
    pub import_dir: PathBuf,
    pub media_dir: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub policy_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub config_source: ValueSource,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub project_root_exists: bool,
    pub archive_exists: bool,
    pub import_exists: bool,
    pub media_exists: bool,
    pub state_dir_exists: bool,
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub opted_in_exists: bool,
    pub excluded_exists: bool,
    pub warnings: Vec<String>,
}

impl ResolvedPaths {
    pub fn opted_in_path(&self) -> PathBuf {
        self.policy_dir.join(OPTED_IN_FILENAME)
    }

    pub fn excluded_path(&self) -> PathBuf {
        self.policy_dir.join(EXCLUDED_FILENAME)
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\narchive_dir={}\nimport_dir={}\nmedia_dir={}\ndb_path={}\nconfig_path={} ({})\npolicy_dir={}",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.archive_dir),
            normalize_for_display(&self.import_dir),
            normalize_for_display(&self.media_dir),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.policy_dir),
        )
    }
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let db_exists = paths.db_path.exists();
    let db_size_bytes = if db_exists {
        let metadata = fs::metadata(&paths.db_path)
            .with_context(|| format!("failed to inspect {}", paths.db_path.display()))?;
        Some(metadata.len())
    } else {
        None
    };
    let state_dir_exists = paths.state_dir.exists();
    let opted_in_exists = paths.opted_in_path().exists();
    let excluded_exists = paths.excluded_path().exists();

    let mut warnings = Vec::new();
    if !state_dir_exists {
        warnings.push(
            ".wikimirror/ is missing; run `wikimirror init` before crawl commands".to_string(),
        );
    }
    if state_dir_exists && (!opted_in_exists || !excluded_exists) {
        warnings.push(
            "policy registries are missing; crawls will refuse to run until they exist"
                .to_string(),
        );
    }

    Ok(RuntimeStatus {
        project_root_exists: paths.project_root.exists(),
        archive_exists: paths.archive_dir.exists(),
        import_exists: paths.import_dir.exists(),
        media_exists: paths.media_dir.exists(),
        state_dir_exists,
        db_exists,
        db_size_bytes,
        config_exists: paths.config_path.exists(),
        opted_in_exists,
        excluded_exists,
        warnings,
    })
}

pub fn ensure_runtime_ready(paths: &ResolvedPaths, status: &RuntimeStatus) -> Result<()> {
    if !status.state_dir_exists {
        bail!(
            "Runtime layout is not initialized.\nMissing required path:\n  - .wikimirror/ (missing)\nRun: wikimirror --project-root {} init",
            normalize_for_display(&paths.project_root)
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
    pub wrote_registries: usize,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

pub(crate) fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env)
        .context("failed to resolve project root")?;

    let state_dir = project_root.join(STATE_DIR_NAME);
    let data_dir = state_dir.join("data");

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (
            absolutize_from_project(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = lookup_env("WIKIMIRROR_CONFIG") {
        (
            absolutize_from_project(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("config.toml"), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        archive_dir: project_root.join("archive"),
        import_dir: project_root.join("import"),
        media_dir: project_root.join("media"),
        db_path: data_dir.join(DB_FILENAME),
        policy_dir: state_dir.join("policy"),
        logs_dir: state_dir.join("logs"),
        tmp_dir: state_dir.join("tmp"),
        project_root,
        state_dir,
        data_dir,
        config_path,
        root_source,
        config_source,
    })
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();

    let required_dirs = [
        &paths.archive_dir,
        &paths.import_dir,
        &paths.media_dir,
        &paths.state_dir,
        &paths.data_dir,
        &paths.policy_dir,
        &paths.logs_dir,
        &paths.tmp_dir,
    ];
    for dir in required_dirs {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = write_text_file(
        &paths.config_path,
        &render_materialized_config(paths),
        options.force,
    )?;

    // Registries are policy data; `--force` never resets them.
    let mut wrote_registries = 0;
    for registry in [paths.opted_in_path(), paths.excluded_path()] {
        if write_text_file(&registry, "[]\n", false)? {
            wrote_registries += 1;
        }
    }

    Ok(InitReport {
        created_dirs,
        wrote_config,
        wrote_registries,
    })
}

pub fn render_materialized_config(paths: &ResolvedPaths) -> String {
    let opted_in = normalize_for_display(&paths.opted_in_path());
    let excluded = normalize_for_display(&paths.excluded_path());
    format!(
        "# wikimirror runtime configuration (materialized by `wikimirror init`)\n\n[wiki]\n# api_url = \"https://your-wiki.example.org/api.php\"\n# url = \"https://your-wiki.example.org\"\n# name = \"YourWiki\"\narticle_path = \"/$1\"\n\n[crawl]\ndelay_ms = 1000\ntimeout_ms = 30000\nmax_retries = 3\nretry_delay_ms = 2000\nmax_throttle_retries = 8\nthrottle_delay_ms = 5000\nmax_concurrent_requests = 2\nworkers = 4\nbatch_size = 50\n\n[policy]\nexcluded_namespaces = [1, 2, 3]\nprofile_templates = [\"Template:Characterprofile\"]\nopted_in_file = \"{opted_in}\"\nexcluded_file = \"{excluded}\"\n\n[import]\nphp = \"php\"\n# wiki_dir = \"/var/www/mediawiki\"\n# local_settings = \"/var/www/mediawiki/LocalSettings.php\"\nmax_busy_retries = 3\nbusy_retry_delay_ms = 5000\n\n[archive]\n# live_url = \"https://your-wiki.example.org\"\n",
    )
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> Result<(PathBuf, ValueSource)>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return Ok((absolutize_from_project(path, &context.cwd), ValueSource::Flag));
    }
    if let Some(value) =
        lookup_env("WIKIMIRROR_PROJECT_ROOT").filter(|value| !value.trim().is_empty())
    {
        let root = absolutize_from_project(Path::new(value.trim()), &context.cwd);
        return Ok((root, ValueSource::Env));
    }
    Ok(find_initialized_ancestor(context)
        .map(|root| (root, ValueSource::Heuristic))
        .unwrap_or_else(|| (context.cwd.clone(), ValueSource::Default)))
}

/// Nearest directory holding `.wikimirror/`, searching above the cwd first and then
/// above the executable.
fn find_initialized_ancestor(context: &ResolutionContext) -> Option<PathBuf> {
    let mut visited = HashSet::new();
    context
        .cwd
        .ancestors()
        .chain(context.executable_dir.iter().flat_map(|dir| dir.ancestors()))
        .filter(|candidate| visited.insert(candidate.to_path_buf()))
        .find(|candidate| candidate.join(STATE_DIR_NAME).is_dir())
        .map(Path::to_path_buf)
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    write_atomic(path, content.as_bytes())?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
