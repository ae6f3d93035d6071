use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use wikimirror_core::api::{MediaWikiClient, MediaWikiClientConfig, WikiReadApi};
use wikimirror_core::config::{MirrorConfig, load_config};
use wikimirror_core::filter::{PolicyData, refresh_excluded_registry};
use wikimirror_core::import::{BusyRetryPolicy, MaintenanceScriptBackend};
use wikimirror_core::logging::{LoggingOptions, init_logging, resolve_log_dir};
use wikimirror_core::orchestrator::{CrawlMode, Orchestrator, RunOptions, RunSummary};
use wikimirror_core::persist::{Destination, HtmlSink, ImportSink, PageSink};
use wikimirror_core::postprocess::{PostprocessOptions, postprocess_tree};
use wikimirror_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, ensure_runtime_ready,
    init_layout, inspect_runtime, normalize_for_display, resolve_paths,
};
use wikimirror_core::shutdown::ShutdownSignal;
use wikimirror_core::state::{StateStore, StateSummary, format_timestamp};

#[derive(Debug, Parser)]
#[command(
    name = "wikimirror",
    version,
    about = "Archive a MediaWiki wiki into a static HTML mirror or a destination wiki"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Log at debug level")]
    verbose: bool,
    #[arg(long, global = true, help = "Print reports as JSON")]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
    verbose: bool,
    json: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
            verbose: cli.verbose,
            json: cli.json,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the runtime layout, default config and empty policy registries
    Init(InitArgs),
    /// Crawl the source wiki into a destination
    Run(RunArgs),
    /// Re-attempt pages recorded as failed by earlier runs
    Retry(RetryArgs),
    /// Maintain the policy registries
    Registry(RegistryArgs),
    /// Make a mirrored HTML tree browsable offline
    Postprocess(PostprocessArgs),
    /// Show runtime layout and crawl state
    Status,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Full,
    Templates,
    Recent,
    Images,
}

impl From<ModeArg> for CrawlMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Full => Self::Full,
            ModeArg::Templates => Self::TemplatesOnly,
            ModeArg::Recent => Self::Recent,
            ModeArg::Images => Self::Images,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum DestinationArg {
    #[default]
    Html,
    Import,
}

impl From<DestinationArg> for Destination {
    fn from(destination: DestinationArg) -> Self {
        match destination {
            DestinationArg::Html => Self::Html,
            DestinationArg::Import => Self::Import,
        }
    }
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(value_enum)]
    mode: ModeArg,
    #[arg(
        long = "namespace",
        value_name = "N",
        help = "Restrict the run to a namespace (repeatable)"
    )]
    namespaces: Vec<i32>,
    #[arg(long, help = "Report filter decisions without fetching or writing")]
    dry_run: bool,
    #[arg(long, value_enum, default_value_t = DestinationArg::Html)]
    destination: DestinationArg,
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
    #[arg(long, help = "Refetch pages whose archived revision is current")]
    force: bool,
}

#[derive(Debug, Args)]
struct RetryArgs {
    #[arg(long, value_enum, default_value_t = DestinationArg::Html)]
    destination: DestinationArg,
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
}

#[derive(Debug, Args)]
struct RegistryArgs {
    #[command(subcommand)]
    command: RegistrySubcommand,
}

#[derive(Debug, Subcommand)]
enum RegistrySubcommand {
    /// Rebuild the excluded-titles registry from profile template transclusions
    Refresh,
}

#[derive(Debug, Args)]
struct PostprocessArgs {
    #[arg(value_name = "DIR")]
    dir: PathBuf,
    #[arg(long, value_name = "NAME")]
    wiki_name: Option<String>,
    #[arg(long, value_name = "URL")]
    live_url: Option<String>,
    #[arg(long, value_name = "RFC3339", help = "Capture time shown in the banner (default: now)")]
    captured_at: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Run(args)) => run_crawl(&runtime, args),
        Some(Commands::Retry(args)) => run_retry(&runtime, args),
        Some(Commands::Registry(RegistryArgs { command })) => match command {
            RegistrySubcommand::Refresh => run_registry_refresh(&runtime),
        },
        Some(Commands::Postprocess(args)) => run_postprocess(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Resolved paths plus parsed config for one invocation.
struct Workspace {
    paths: ResolvedPaths,
    config: MirrorConfig,
}

fn load_workspace(runtime: &RuntimeOptions) -> Result<Workspace> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    Ok(Workspace { paths, config })
}

/// Workspace for commands that need an initialized layout. Logs go to a file as well.
fn load_ready_workspace(runtime: &RuntimeOptions, command_name: &str) -> Result<Workspace> {
    let workspace = load_workspace(runtime)?;
    let status = inspect_runtime(&workspace.paths)?;
    ensure_runtime_ready(&workspace.paths, &status)?;
    let log_dir = resolve_log_dir(&workspace.paths);
    let log_path = init_logging(
        Some(&log_dir),
        &LoggingOptions {
            name: command_name.to_string(),
            wiki_id: Some(workspace.config.wiki_id()),
            verbose: runtime.verbose,
        },
    )?;
    if let Some(log_path) = log_path {
        info!("logging to {}", normalize_for_display(&log_path));
    }
    Ok(workspace)
}

fn init_console_logging(runtime: &RuntimeOptions, command_name: &str) -> Result<()> {
    init_logging(
        None,
        &LoggingOptions {
            name: command_name.to_string(),
            wiki_id: None,
            verbose: runtime.verbose,
        },
    )?;
    Ok(())
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    init_console_logging(runtime, "init")?;
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, &InitOptions { force: args.force })?;

    if runtime.json {
        #[derive(Serialize)]
        struct InitOutput {
            project_root: String,
            created_dirs: Vec<String>,
            wrote_config: bool,
            wrote_registries: usize,
        }
        return print_json(&InitOutput {
            project_root: normalize_for_display(&paths.project_root),
            created_dirs: report
                .created_dirs
                .iter()
                .map(|dir| normalize_for_display(dir))
                .collect(),
            wrote_config: report.wrote_config,
            wrote_registries: report.wrote_registries,
        });
    }

    println!("Initialized wikimirror runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("archive_dir: {}", normalize_for_display(&paths.archive_dir));
    println!("import_dir: {}", normalize_for_display(&paths.import_dir));
    println!("media_dir: {}", normalize_for_display(&paths.media_dir));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("wrote_registries: {}", report.wrote_registries);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_crawl(runtime: &RuntimeOptions, args: RunArgs) -> Result<()> {
    let mode = CrawlMode::from(args.mode);
    let workspace = load_ready_workspace(runtime, &format!("run-{}", mode.as_str()))?;
    let Workspace { paths, config } = &workspace;
    let shutdown = install_shutdown()?;
    let policy = PolicyData::load(config, &config.registry_paths(paths))?;
    let client = connect(config, &shutdown)?;

    let destination = Destination::from(args.destination);
    let sink = build_sink(paths, config, destination, &shutdown)?;
    let mut store = StateStore::open(paths, destination)?;

    let mut options = RunOptions::from_config(config, mode);
    options.namespaces = args.namespaces;
    options.dry_run = args.dry_run;
    options.force = args.force;
    if let Some(workers) = args.workers {
        options.workers = workers.max(1);
    }

    let summary = Orchestrator::new(&client, sink.as_ref(), &mut store, &policy, shutdown)
        .run(&options)?;
    print_run_summary(runtime, &summary)?;
    print_diagnostics(runtime, paths);
    Ok(())
}

fn run_retry(runtime: &RuntimeOptions, args: RetryArgs) -> Result<()> {
    let workspace = load_ready_workspace(runtime, "retry")?;
    let Workspace { paths, config } = &workspace;
    let shutdown = install_shutdown()?;
    let policy = PolicyData::load(config, &config.registry_paths(paths))?;
    let client = connect(config, &shutdown)?;

    let destination = Destination::from(args.destination);
    let sink = build_sink(paths, config, destination, &shutdown)?;
    let mut store = StateStore::open(paths, destination)?;

    let mut options = RunOptions::from_config(config, CrawlMode::Full);
    if let Some(workers) = args.workers {
        options.workers = workers.max(1);
    }
    let summary = Orchestrator::new(&client, sink.as_ref(), &mut store, &policy, shutdown)
        .retry_failures(&options)?;
    print_run_summary(runtime, &summary)?;
    print_diagnostics(runtime, paths);
    Ok(())
}

fn run_registry_refresh(runtime: &RuntimeOptions) -> Result<()> {
    let workspace = load_ready_workspace(runtime, "registry")?;
    let Workspace { paths, config } = &workspace;
    let shutdown = install_shutdown()?;
    let templates = config.profile_templates();
    if templates.is_empty() {
        bail!("no profile templates configured; set [policy].profile_templates");
    }
    let client = connect(config, &shutdown)?;
    let registry = config.registry_paths(paths).excluded;
    let report = refresh_excluded_registry(&client, &templates, &registry)?;

    if runtime.json {
        return print_json(&report);
    }
    println!("registry refresh");
    println!("registry: {}", normalize_for_display(&registry));
    for template in &report.templates {
        println!("template: {template}");
    }
    println!("excluded_titles: {}", report.excluded_titles);
    println!(
        "previous_titles: {}",
        report
            .previous_titles
            .map(|count| count.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("requests: {}", client.request_count());
    print_diagnostics(runtime, paths);
    Ok(())
}

fn run_postprocess(runtime: &RuntimeOptions, args: PostprocessArgs) -> Result<()> {
    init_console_logging(runtime, "postprocess")?;
    let workspace = load_workspace(runtime)?;
    let captured_at = match args.captured_at.as_deref() {
        Some(value) => DateTime::parse_from_rfc3339(value.trim())
            .with_context(|| format!("invalid --captured-at timestamp: {value}"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };
    let mut options = PostprocessOptions::from_config(&workspace.config, captured_at);
    if let Some(name) = args.wiki_name {
        options.wiki_name = name;
    }
    if let Some(url) = args.live_url {
        options.live_url = Some(url);
    }

    let report = postprocess_tree(&args.dir, &options)?;
    if runtime.json {
        print_json(&report)?;
    } else {
        println!("postprocess");
        println!("dir: {}", normalize_for_display(&args.dir));
        println!("wiki_name: {}", options.wiki_name);
        println!("live_url: {}", options.live_url.as_deref().unwrap_or("<none>"));
        println!("captured_at: {}", format_timestamp(options.captured_at));
        println!("scanned: {}", report.scanned);
        println!("processed: {}", report.processed);
        println!("already_processed: {}", report.already_processed);
        println!("failed: {}", report.failed);
        for path in &report.failed_paths {
            println!("failed.path: {path}");
        }
    }
    if report.failed > 0 {
        bail!("{} document(s) could not be post-processed", report.failed);
    }
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    init_console_logging(runtime, "status")?;
    let workspace = load_workspace(runtime)?;
    let paths = &workspace.paths;
    let status = inspect_runtime(paths)?;
    let mut destinations = Vec::new();
    if status.db_exists {
        for destination in [Destination::Html, Destination::Import] {
            destinations.push(StateStore::open(paths, destination)?.summary()?);
        }
    }

    if runtime.json {
        #[derive(Serialize)]
        struct StatusOutput<'a> {
            project_root: String,
            wiki_name: String,
            api_url: Option<String>,
            state_dir_exists: bool,
            db_exists: bool,
            db_size_bytes: Option<u64>,
            config_exists: bool,
            registries_exist: bool,
            destinations: &'a [StateSummary],
            warnings: &'a [String],
        }
        return print_json(&StatusOutput {
            project_root: normalize_for_display(&paths.project_root),
            wiki_name: workspace.config.wiki_name(),
            api_url: workspace.config.api_url_owned(),
            state_dir_exists: status.state_dir_exists,
            db_exists: status.db_exists,
            db_size_bytes: status.db_size_bytes,
            config_exists: status.config_exists,
            registries_exist: status.opted_in_exists && status.excluded_exists,
            destinations: &destinations,
            warnings: &status.warnings,
        });
    }

    println!("runtime status");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("wiki_name: {}", workspace.config.wiki_name());
    println!(
        "api_url: {}",
        workspace
            .config
            .api_url_owned()
            .unwrap_or_else(|| "<unset>".to_string())
    );
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("archive_exists: {}", format_flag(status.archive_exists));
    println!("import_exists: {}", format_flag(status.import_exists));
    println!("media_exists: {}", format_flag(status.media_exists));
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("opted_in_exists: {}", format_flag(status.opted_in_exists));
    println!("excluded_exists: {}", format_flag(status.excluded_exists));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    for summary in &destinations {
        print_state_summary(summary);
    }
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    print_diagnostics(runtime, paths);
    Ok(())
}

fn install_shutdown() -> Result<ShutdownSignal> {
    let shutdown = ShutdownSignal::new();
    shutdown.install_ctrlc()?;
    Ok(shutdown)
}

fn connect(config: &MirrorConfig, shutdown: &ShutdownSignal) -> Result<MediaWikiClient> {
    let client =
        MediaWikiClient::new(MediaWikiClientConfig::from_config(config), shutdown.clone())?;
    if client.login_from_config()? {
        info!("authenticated session established");
    }
    Ok(client)
}

fn build_sink(
    paths: &ResolvedPaths,
    config: &MirrorConfig,
    destination: Destination,
    shutdown: &ShutdownSignal,
) -> Result<Box<dyn PageSink>> {
    let wiki_name = config.wiki_name();
    Ok(match destination {
        Destination::Html => Box::new(HtmlSink::new(paths, &wiki_name)),
        Destination::Import => Box::new(ImportSink::new(
            paths,
            &wiki_name,
            Box::new(MaintenanceScriptBackend::from_config(config, paths)?),
            BusyRetryPolicy::from_config(config),
            shutdown.clone(),
        )),
    })
}

fn print_run_summary(runtime: &RuntimeOptions, summary: &RunSummary) -> Result<()> {
    if runtime.json {
        return print_json(summary);
    }
    println!("run: {}", summary.run);
    println!("destination: {}", summary.destination.as_str());
    println!("dry_run: {}", summary.dry_run);
    if summary.fell_back_to_full {
        println!("fell_back_to_full: true");
    }
    println!("resumed: {}", summary.resumed);
    println!(
        "namespaces: {}",
        summary
            .namespaces
            .iter()
            .map(|namespace| namespace.to_string())
            .collect::<Vec<_>>()
            .join(",")
    );
    println!("listed: {}", summary.listed);
    for (reason, count) in &summary.decisions {
        println!("decision.{}: {count}", reason.as_str());
    }
    println!("unchanged: {}", summary.unchanged);
    println!("fetched: {}", summary.fetched);
    println!("persisted: {}", summary.persisted);
    println!("renamed: {}", summary.renamed);
    println!("withdrawn: {}", summary.withdrawn);
    println!("failures: {}", summary.failure_count());
    for (category, count) in &summary.failures {
        println!("failure.{category}: {count}");
    }
    for title in &summary.failed_titles {
        println!("failure.title: {title}");
    }
    println!("batches: {}", summary.batches);
    println!("requests: {}", summary.requests);
    for planned in &summary.planned {
        println!(
            "plan: {} [{}] ns={} id={} {}",
            if planned.include { "include" } else { "exclude" },
            planned.reason.as_str(),
            planned.namespace,
            planned.page_id,
            planned.title
        );
    }
    Ok(())
}

fn print_state_summary(summary: &StateSummary) {
    let prefix = summary.destination.as_str();
    let format_checkpoint = |value: Option<DateTime<Utc>>| {
        value
            .map(format_timestamp)
            .unwrap_or_else(|| "never".to_string())
    };
    println!("{prefix}.last_full_crawl: {}", format_checkpoint(summary.last_full_crawl));
    println!(
        "{prefix}.last_incremental_crawl: {}",
        format_checkpoint(summary.last_incremental_crawl)
    );
    println!("{prefix}.resumable: {}", format_flag(summary.resumable));
    println!("{prefix}.ledger_pages: {}", summary.ledger_pages);
    println!("{prefix}.ledger_images: {}", summary.ledger_images);
    println!("{prefix}.pending_failures: {}", summary.pending_failures);
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics && !runtime.json {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
