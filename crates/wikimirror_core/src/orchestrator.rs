//! Crawl runs. Every mode shares one loop: list, filter, fetch, filter again on content,
//! persist, then commit the batch and its checkpoint in one state transaction.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::collections::btree_map::Entry;
use std::sync::{Mutex, PoisonError};
use std::thread;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::api::{
    ImageHandle, MAX_LIST_LIMIT, PageHandle, PageListCursor, PageListQuery, WikiReadApi,
};
use crate::config::MirrorConfig;
use crate::error::{FailureCategory, FetchError, RunError};
use crate::filter::{
    FilterDecision, FilterReason, NS_CATEGORY, NS_FILE, NS_MEDIAWIKI, NS_MODULE, NS_TEMPLATE,
    PolicyData, decide,
};
use crate::persist::{Destination, DownloadedImage, OutputKind, PageSink, PersistedPage};
use crate::shutdown::ShutdownSignal;
use crate::state::{
    BatchCommit, ContinuationUpdate, CrawlState, FailureRecord, LedgerEntry, SavedContinuation,
    StateStore,
};

/// Namespaces refreshed by a templates-only run.
pub const TEMPLATE_SCOPE_NAMESPACES: &[i32] = &[NS_MEDIAWIKI, NS_TEMPLATE, NS_CATEGORY, NS_MODULE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlMode {
    Full,
    TemplatesOnly,
    Recent,
    Images,
}

impl CrawlMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::TemplatesOnly => "templates",
            Self::Recent => "recent",
            Self::Images => "images",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "full" => Some(Self::Full),
            "templates" | "templates_only" | "templates-only" => Some(Self::TemplatesOnly),
            "recent" => Some(Self::Recent),
            "images" => Some(Self::Images),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub mode: CrawlMode,
    /// Overrides the mode's namespace selection when non-empty.
    pub namespaces: Vec<i32>,
    pub dry_run: bool,
    /// Refetch pages whose ledger revision matches the listing.
    pub force: bool,
    pub workers: usize,
    pub batch_size: usize,
}

impl RunOptions {
    pub fn from_config(config: &MirrorConfig, mode: CrawlMode) -> Self {
        Self {
            mode,
            namespaces: Vec::new(),
            dry_run: false,
            force: false,
            workers: config.workers(),
            batch_size: config.batch_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedDecision {
    pub title: String,
    pub namespace: i32,
    pub page_id: i64,
    pub include: bool,
    pub reason: FilterReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run: String,
    pub destination: Destination,
    pub dry_run: bool,
    pub fell_back_to_full: bool,
    pub resumed: bool,
    pub namespaces: Vec<i32>,
    pub listed: usize,
    pub decisions: BTreeMap<FilterReason, usize>,
    pub unchanged: usize,
    pub fetched: usize,
    pub persisted: usize,
    pub renamed: usize,
    pub withdrawn: usize,
    pub failures: BTreeMap<FailureCategory, usize>,
    pub failed_titles: Vec<String>,
    pub requests: usize,
    pub batches: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub planned: Vec<PlannedDecision>,
}

impl RunSummary {
    fn new(run: &str, destination: Destination, dry_run: bool) -> Self {
        Self {
            run: run.to_string(),
            destination,
            dry_run,
            fell_back_to_full: false,
            resumed: false,
            namespaces: Vec::new(),
            listed: 0,
            decisions: BTreeMap::new(),
            unchanged: 0,
            fetched: 0,
            persisted: 0,
            renamed: 0,
            withdrawn: 0,
            failures: BTreeMap::new(),
            failed_titles: Vec::new(),
            requests: 0,
            batches: 0,
            planned: Vec::new(),
        }
    }

    pub fn failure_count(&self) -> usize {
        self.failures.values().sum()
    }

    pub fn decision_count(&self, reason: FilterReason) -> usize {
        self.decisions.get(&reason).copied().unwrap_or(0)
    }

    fn record_decision(&mut self, reason: FilterReason) {
        *self.decisions.entry(reason).or_default() += 1;
    }

    fn record_failure(&mut self, category: FailureCategory, title: &str) {
        *self.failures.entry(category).or_default() += 1;
        self.failed_titles.push(title.to_string());
    }

    fn plan(&mut self, title: &str, namespace: i32, page_id: i64, decision: FilterDecision) {
        self.record_decision(decision.reason);
        self.planned.push(PlannedDecision {
            title: title.to_string(),
            namespace,
            page_id,
            include: decision.include,
            reason: decision.reason,
        });
    }

    fn log(&self) {
        info!(
            "{} run finished: listed={} fetched={} persisted={} unchanged={} renamed={} withdrawn={} failures={} requests={}",
            self.run,
            self.listed,
            self.fetched,
            self.persisted,
            self.unchanged,
            self.renamed,
            self.withdrawn,
            self.failure_count(),
            self.requests
        );
        for (category, count) in &self.failures {
            warn!("{count} page(s) failed with {category}");
        }
    }
}

#[derive(Debug, Default)]
struct BatchOutcome {
    commit: BatchCommit,
    /// Output keys to remove once the commit is durable.
    retire: Vec<String>,
}

pub struct Orchestrator<'a> {
    api: &'a dyn WikiReadApi,
    sink: &'a dyn PageSink,
    store: &'a mut StateStore,
    policy: &'a PolicyData,
    shutdown: ShutdownSignal,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        api: &'a dyn WikiReadApi,
        sink: &'a dyn PageSink,
        store: &'a mut StateStore,
        policy: &'a PolicyData,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            api,
            sink,
            store,
            policy,
            shutdown,
        }
    }

    pub fn run(&mut self, options: &RunOptions) -> Result<RunSummary, RunError> {
        self.ensure_destination_matches()?;
        let started_at = Utc::now();
        let state = self.store.load().map_err(RunError::State)?;
        let mut mode = options.mode;
        let mut summary = RunSummary::new(mode.as_str(), self.sink.destination(), options.dry_run);
        if mode == CrawlMode::Recent && state.last_incremental_crawl.is_none() {
            warn!("no incremental checkpoint recorded; running a full crawl instead");
            mode = CrawlMode::Full;
            summary.run = mode.as_str().to_string();
            summary.fell_back_to_full = true;
        }
        info!(
            "starting {} run into {} destination{}",
            mode.as_str(),
            self.sink.destination().as_str(),
            if options.dry_run { " (dry run)" } else { "" }
        );

        match (mode, state.last_incremental_crawl) {
            (CrawlMode::Recent, Some(since)) => self.run_recent(options, since, &mut summary)?,
            (CrawlMode::Images, _) => self.run_images(options, &state, &mut summary)?,
            _ => self.run_listing(mode, options, &state, started_at, &mut summary)?,
        }

        summary.requests = self.api.request_count();
        summary.log();
        Ok(summary)
    }

    /// Follow-up pass over recorded failures. Checkpoints are left alone.
    pub fn retry_failures(&mut self, options: &RunOptions) -> Result<RunSummary, RunError> {
        self.ensure_destination_matches()?;
        let failures = self.store.failures().map_err(RunError::State)?;
        let mut summary = RunSummary::new("retry", self.sink.destination(), options.dry_run);
        info!("retrying {} recorded failure(s)", failures.len());
        let retry_options = RunOptions {
            force: true,
            ..options.clone()
        };

        let (images, pages): (Vec<_>, Vec<_>) = failures
            .into_iter()
            .map(|stored| stored.failure)
            .partition(|failure| failure.kind == OutputKind::Image);
        let page_handles = pages
            .into_iter()
            .map(|failure| PageHandle {
                title: failure.title,
                namespace: failure.namespace,
                page_id: failure.page_id,
                last_revision_timestamp: None,
            })
            .collect::<Vec<_>>();
        for chunk in page_handles.chunks(retry_options.batch_size.max(1)) {
            self.check_shutdown()?;
            let outcome = self.process_pages(chunk.to_vec(), &retry_options, &mut summary)?;
            if !retry_options.dry_run {
                self.commit(outcome, &mut summary)?;
            }
        }

        let image_handles = images
            .into_iter()
            .map(|failure| ImageHandle {
                page_id: failure.page_id,
                title: failure.title,
                url: None,
                timestamp: None,
            })
            .collect::<Vec<_>>();
        for chunk in image_handles.chunks(retry_options.batch_size.max(1)) {
            self.check_shutdown()?;
            let outcome = self.process_images(chunk.to_vec(), &retry_options, &mut summary)?;
            if !retry_options.dry_run {
                self.commit(outcome, &mut summary)?;
            }
        }

        summary.requests = self.api.request_count();
        summary.log();
        Ok(summary)
    }

    fn run_listing(
        &mut self,
        mode: CrawlMode,
        options: &RunOptions,
        state: &CrawlState,
        started_at: DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> Result<(), RunError> {
        let namespaces = self.select_namespaces(mode, options)?;
        summary.namespaces = namespaces.clone();
        let run_key = run_key(mode, &namespaces);
        let (start_index, mut token) = match &state.continuation {
            Some(saved) if saved.run_key == run_key && !options.dry_run => {
                match saved.namespace.and_then(|namespace| {
                    namespaces
                        .iter()
                        .position(|candidate| *candidate == namespace)
                }) {
                    Some(index) => {
                        info!(
                            "resuming {} at namespace {}",
                            mode.as_str(),
                            namespaces[index]
                        );
                        summary.resumed = true;
                        (index, saved.token())
                    }
                    None => (0, None),
                }
            }
            _ => (0, None),
        };
        // Only a complete, unscoped full crawl moves the checkpoints.
        let records_checkpoints = mode == CrawlMode::Full && options.namespaces.is_empty();

        for (index, namespace) in namespaces.iter().copied().enumerate().skip(start_index) {
            debug!("listing namespace {namespace}");
            let query = PageListQuery {
                namespace: Some(namespace),
                since: None,
                limit: options.batch_size,
            };
            let mut cursor = PageListCursor::resume(self.api, query, token.take());
            while let Some(listed) = cursor.next() {
                self.check_shutdown()?;
                let listed = listed?;
                let mut outcome = self.process_pages(listed.pages, options, summary)?;
                if options.dry_run {
                    continue;
                }
                outcome.commit.continuation =
                    match (cursor.resume_token(), namespaces.get(index + 1)) {
                        (Some(next), _) => ContinuationUpdate::Set(SavedContinuation {
                            run_key: run_key.clone(),
                            namespace: Some(namespace),
                            token: Some(next.as_str().to_string()),
                        }),
                        (None, Some(next_namespace)) => {
                            ContinuationUpdate::Set(SavedContinuation {
                                run_key: run_key.clone(),
                                namespace: Some(*next_namespace),
                                token: None,
                            })
                        }
                        (None, None) => ContinuationUpdate::Clear,
                    };
                if records_checkpoints && outcome.commit.continuation == ContinuationUpdate::Clear {
                    outcome.commit.last_full_crawl = Some(started_at);
                    if state
                        .last_incremental_crawl
                        .is_none_or(|previous| previous < started_at)
                    {
                        outcome.commit.last_incremental_crawl = Some(started_at);
                    }
                }
                self.commit(outcome, summary)?;
            }
        }

        if !options.dry_run {
            self.sink
                .finish_run(records_checkpoints)
                .map_err(RunError::Persistence)?;
        }
        Ok(())
    }

    fn run_recent(
        &mut self,
        options: &RunOptions,
        since: DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> Result<(), RunError> {
        let scopes = if options.namespaces.is_empty() {
            vec![None]
        } else {
            sorted_unique(&options.namespaces)
                .into_iter()
                .map(Some)
                .collect()
        };
        summary.namespaces = sorted_unique(&options.namespaces);

        // The whole change set is listed before anything is fetched.
        let mut changes: BTreeMap<i64, PageHandle> = BTreeMap::new();
        for namespace in scopes {
            let query = PageListQuery {
                namespace,
                since: Some(since),
                limit: MAX_LIST_LIMIT,
            };
            for listed in PageListCursor::new(self.api, query) {
                self.check_shutdown()?;
                for handle in listed?.pages {
                    match changes.entry(handle.page_id) {
                        Entry::Vacant(slot) => {
                            slot.insert(handle);
                        }
                        Entry::Occupied(mut slot) => {
                            if handle.last_revision_timestamp > slot.get().last_revision_timestamp {
                                slot.insert(handle);
                            }
                        }
                    }
                }
            }
        }
        let newest = changes
            .values()
            .filter_map(|handle| handle.last_revision_timestamp)
            .max();
        info!("{} page(s) changed since {since}", changes.len());

        let handles = changes.into_values().collect::<Vec<_>>();
        let batches = handles.chunks(options.batch_size.max(1)).collect::<Vec<_>>();
        let last_index = batches.len().saturating_sub(1);
        for (index, batch) in batches.into_iter().enumerate() {
            self.check_shutdown()?;
            let mut outcome = self.process_pages(batch.to_vec(), options, summary)?;
            if options.dry_run {
                continue;
            }
            if index == last_index && options.namespaces.is_empty() {
                outcome.commit.last_incremental_crawl = newest;
            }
            self.commit(outcome, summary)?;
        }

        if !options.dry_run {
            self.sink.finish_run(false).map_err(RunError::Persistence)?;
        }
        Ok(())
    }

    fn run_images(
        &mut self,
        options: &RunOptions,
        state: &CrawlState,
        summary: &mut RunSummary,
    ) -> Result<(), RunError> {
        let run_key = run_key(CrawlMode::Images, &[]);
        summary.namespaces = vec![NS_FILE];
        let mut token = match &state.continuation {
            Some(saved) if saved.run_key == run_key && !options.dry_run => {
                summary.resumed = true;
                saved.token()
            }
            _ => None,
        };
        loop {
            self.check_shutdown()?;
            let listed = self.api.list_images(options.batch_size, token.as_ref())?;
            let mut outcome = self.process_images(listed.images, options, summary)?;
            token = listed.next;
            if !options.dry_run {
                outcome.commit.continuation = match &token {
                    Some(next) => ContinuationUpdate::Set(SavedContinuation {
                        run_key: run_key.clone(),
                        namespace: Some(NS_FILE),
                        token: Some(next.as_str().to_string()),
                    }),
                    None => ContinuationUpdate::Clear,
                };
                self.commit(outcome, summary)?;
            }
            if token.is_none() {
                break;
            }
        }
        if !options.dry_run {
            self.sink.finish_run(false).map_err(RunError::Persistence)?;
        }
        Ok(())
    }

    fn process_pages(
        &mut self,
        handles: Vec<PageHandle>,
        options: &RunOptions,
        summary: &mut RunSummary,
    ) -> Result<BatchOutcome, RunError> {
        let mut outcome = BatchOutcome::default();
        let mut pending = Vec::new();
        summary.listed += handles.len();
        for handle in handles {
            let archived = self.archived_revision(
                OutputKind::Page,
                handle.page_id,
                &handle.title,
                handle.last_revision_timestamp,
            )?;
            let mut signature = self.policy.registry_signature(&handle.title);
            // An unchanged revision is not refetched, so its last known content decides.
            if let Some(entry) = &archived {
                signature.uses_profile_template |= entry.uses_profile_template;
            }
            let decision = decide(&handle.title, handle.namespace, signature, self.policy);
            if options.dry_run {
                summary.plan(&handle.title, handle.namespace, handle.page_id, decision);
                continue;
            }
            if !decision.include {
                summary.record_decision(decision.reason);
                self.withdraw(OutputKind::Page, handle.page_id, &mut outcome, summary)?;
                continue;
            }
            if !options.force && archived.is_some() {
                summary.record_decision(decision.reason);
                summary.unchanged += 1;
                continue;
            }
            pending.push((handle, decision));
        }
        if pending.is_empty() {
            return Ok(outcome);
        }

        let api = self.api;
        let format = self.sink.content_format();
        let results = fetch_all(&pending, options.workers, |(handle, _)| {
            api.fetch_content(handle.page_id, format)
        });
        self.check_shutdown()?;

        let mut contents = Vec::with_capacity(results.len());
        let mut profile_pages = BTreeSet::new();
        for ((handle, decision), result) in pending.into_iter().zip(results) {
            match result {
                Ok(content) => {
                    summary.fetched += 1;
                    let signature = self
                        .policy
                        .content_signature(&content.title, &content.templates);
                    let decision =
                        decide(&content.title, content.namespace, signature, self.policy);
                    summary.record_decision(decision.reason);
                    if decision.include {
                        if signature.uses_profile_template {
                            profile_pages.insert(content.page_id);
                        }
                        contents.push(content);
                    } else {
                        debug!(
                            "{} excluded after fetch: {}",
                            content.title,
                            decision.reason.as_str()
                        );
                        self.withdraw(OutputKind::Page, content.page_id, &mut outcome, summary)?;
                    }
                }
                Err(FetchError::Cancelled) => return Err(RunError::Cancelled),
                Err(error) => {
                    summary.record_decision(decision.reason);
                    outcome.commit.failures.push(failure_record(
                        summary,
                        OutputKind::Page,
                        handle.page_id,
                        &handle.title,
                        handle.namespace,
                        &error,
                    ));
                }
            }
        }

        let mut persisted = self
            .sink
            .persist_pages(&contents)
            .map_err(RunError::Persistence)?;
        for page in &mut persisted {
            page.uses_profile_template = profile_pages.contains(&page.page_id);
        }
        self.note_renames(&persisted, &mut outcome, summary)?;
        summary.persisted += persisted.len();
        outcome.commit.persisted = persisted;
        Ok(outcome)
    }

    fn process_images(
        &mut self,
        handles: Vec<ImageHandle>,
        options: &RunOptions,
        summary: &mut RunSummary,
    ) -> Result<BatchOutcome, RunError> {
        let mut outcome = BatchOutcome::default();
        let mut pending = Vec::new();
        summary.listed += handles.len();
        for handle in handles {
            let signature = self.policy.registry_signature(&handle.title);
            let decision = decide(&handle.title, NS_FILE, signature, self.policy);
            if options.dry_run {
                summary.plan(&handle.title, NS_FILE, handle.page_id, decision);
                continue;
            }
            summary.record_decision(decision.reason);
            if !decision.include {
                self.withdraw(OutputKind::Image, handle.page_id, &mut outcome, summary)?;
                continue;
            }
            if !options.force
                && self
                    .archived_revision(
                        OutputKind::Image,
                        handle.page_id,
                        &handle.title,
                        handle.timestamp,
                    )?
                    .is_some()
            {
                summary.unchanged += 1;
                continue;
            }
            pending.push(handle);
        }
        if pending.is_empty() {
            return Ok(outcome);
        }

        let api = self.api;
        let results = fetch_all(&pending, options.workers, |handle| {
            api.fetch_image_bytes(&handle.title)
        });
        self.check_shutdown()?;

        let mut downloads = Vec::with_capacity(results.len());
        for (handle, result) in pending.into_iter().zip(results) {
            match result {
                Ok(bytes) => {
                    summary.fetched += 1;
                    downloads.push(DownloadedImage { handle, bytes });
                }
                Err(FetchError::Cancelled) => return Err(RunError::Cancelled),
                Err(error) => {
                    outcome.commit.failures.push(failure_record(
                        summary,
                        OutputKind::Image,
                        handle.page_id,
                        &handle.title,
                        NS_FILE,
                        &error,
                    ));
                }
            }
        }

        let persisted = self
            .sink
            .persist_images(&downloads)
            .map_err(RunError::Persistence)?;
        self.note_renames(&persisted, &mut outcome, summary)?;
        summary.persisted += persisted.len();
        outcome.commit.persisted = persisted;
        Ok(outcome)
    }

    fn commit(&mut self, outcome: BatchOutcome, summary: &mut RunSummary) -> Result<(), RunError> {
        self.store
            .commit_batch(&outcome.commit)
            .map_err(RunError::State)?;
        summary.batches += 1;
        for key in outcome.retire {
            // A swap of titles can hand an old key to another page.
            match self.store.output_key_in_use(&key) {
                Ok(true) => debug!("{key} now belongs to another page; keeping it"),
                Ok(false) => {
                    if let Err(error) = self.sink.retire_output(&key) {
                        warn!("failed to retire {key}: {error:#}");
                    }
                }
                Err(error) => warn!("failed to check ownership of {key}: {error:#}"),
            }
        }
        Ok(())
    }

    fn withdraw(
        &self,
        kind: OutputKind,
        page_id: i64,
        outcome: &mut BatchOutcome,
        summary: &mut RunSummary,
    ) -> Result<(), RunError> {
        outcome.commit.cleared_failures.push((kind, page_id));
        let entry = self
            .store
            .ledger_entry(kind, page_id)
            .map_err(RunError::State)?;
        if let Some(entry) = entry {
            info!("withdrawing {} from the archive", entry.title);
            outcome.commit.withdrawn.push((kind, page_id));
            outcome.retire.push(entry.output_key);
            summary.withdrawn += 1;
        }
        Ok(())
    }

    fn note_renames(
        &self,
        persisted: &[PersistedPage],
        outcome: &mut BatchOutcome,
        summary: &mut RunSummary,
    ) -> Result<(), RunError> {
        for page in persisted {
            let previous = self
                .store
                .ledger_entry(page.kind, page.page_id)
                .map_err(RunError::State)?;
            if let Some(previous) = previous
                && previous.output_key != page.output_key
            {
                info!("{} was renamed to {}", previous.title, page.title);
                outcome.retire.push(previous.output_key);
                summary.renamed += 1;
            }
        }
        Ok(())
    }

    /// The ledger row for this exact title and revision, if it was already persisted.
    fn archived_revision(
        &self,
        kind: OutputKind,
        page_id: i64,
        title: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Option<LedgerEntry>, RunError> {
        let Some(timestamp) = timestamp else {
            return Ok(None);
        };
        let entry = self
            .store
            .ledger_entry(kind, page_id)
            .map_err(RunError::State)?;
        Ok(entry.filter(|entry| {
            entry.title == title && entry.revision_timestamp == Some(timestamp)
        }))
    }

    fn select_namespaces(
        &self,
        mode: CrawlMode,
        options: &RunOptions,
    ) -> Result<Vec<i32>, RunError> {
        if !options.namespaces.is_empty() {
            return Ok(sorted_unique(&options.namespaces));
        }
        let site = self.api.namespaces()?;
        Ok(match mode {
            CrawlMode::TemplatesOnly => site
                .into_iter()
                .filter(|namespace| TEMPLATE_SCOPE_NAMESPACES.contains(namespace))
                .collect(),
            _ => site
                .into_iter()
                .filter(|namespace| !self.policy.excluded_namespaces.contains(namespace))
                .collect(),
        })
    }

    fn check_shutdown(&self) -> Result<(), RunError> {
        if self.shutdown.is_triggered() {
            return Err(RunError::Cancelled);
        }
        Ok(())
    }

    fn ensure_destination_matches(&self) -> Result<(), RunError> {
        if self.store.destination() != self.sink.destination() {
            return Err(RunError::Config(format!(
                "state store tracks the {} destination but the sink writes {}",
                self.store.destination().as_str(),
                self.sink.destination().as_str()
            )));
        }
        Ok(())
    }
}

fn failure_record(
    summary: &mut RunSummary,
    kind: OutputKind,
    page_id: i64,
    title: &str,
    namespace: i32,
    error: &FetchError,
) -> FailureRecord {
    let category = error.category();
    warn!("skipping {title}: {error}");
    summary.record_failure(category, title);
    FailureRecord {
        page_id,
        kind,
        title: title.to_string(),
        namespace,
        category,
        message: error.to_string(),
    }
}

pub fn run_key(mode: CrawlMode, namespaces: &[i32]) -> String {
    let scope = namespaces
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    format!("{}|{scope}", mode.as_str())
}

fn sorted_unique(values: &[i32]) -> Vec<i32> {
    values.iter().copied().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Run `fetch` over `items` on at most `workers` scoped threads. Results keep the
/// order of `items`; completion order is irrelevant.
fn fetch_all<T, R, F>(items: &[T], workers: usize, fetch: F) -> Vec<Result<R, FetchError>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> Result<R, FetchError> + Sync,
{
    if items.is_empty() {
        return Vec::new();
    }
    let queue = Mutex::new((0..items.len()).collect::<VecDeque<_>>());
    let slots = Mutex::new((0..items.len()).map(|_| None).collect::<Vec<_>>());
    let workers = workers.clamp(1, items.len());
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let next = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    let Some(index) = next else {
                        break;
                    };
                    let result = fetch(&items[index]);
                    slots.lock().unwrap_or_else(PoisonError::into_inner)[index] = Some(result);
                }
            });
        }
    });
    slots
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| Err(FetchError::permanent("fetch worker exited early")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::{BTreeMap, BTreeSet};
    use std::fs;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use anyhow::bail;
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::{TempDir, tempdir};

    use super::{CrawlMode, Orchestrator, RunOptions, RunSummary, fetch_all};
    use crate::api::{
        ContentFormat, ContinuationToken, ImageHandle, ImageListPage, ListPage, PageHandle,
        PageListQuery, RevisionContent, WikiReadApi,
    };
    use crate::error::{FailureCategory, FetchError, RunError};
    use crate::filter::{FilterReason, PolicyData, refresh_excluded_registry};
    use crate::persist::{
        Destination, DownloadedImage, HtmlSink, OutputKind, PageSink, PersistedPage,
    };
    use crate::runtime::ResolvedPaths;
    use crate::runtime::tests::initialized_paths;
    use crate::shutdown::ShutdownSignal;
    use crate::state::{BatchCommit, StateStore};

    const PROFILE: &str = "Template:Characterprofile";

    #[derive(Clone)]
    struct MockPage {
        handle: PageHandle,
        templates: Vec<String>,
    }

    #[derive(Default)]
    struct MockApi {
        namespaces: Vec<i32>,
        pages: Mutex<Vec<MockPage>>,
        images: Vec<ImageHandle>,
        missing: Mutex<BTreeSet<i64>>,
        embedded: BTreeMap<String, Vec<String>>,
        fail_listing: AtomicBool,
        fetches: AtomicUsize,
        requests: AtomicUsize,
    }

    impl MockApi {
        fn with_pages(namespaces: &[i32], pages: Vec<MockPage>) -> Self {
            Self {
                namespaces: namespaces.to_vec(),
                pages: Mutex::new(pages),
                ..Self::default()
            }
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }

        fn update(&self, page_id: i64, change: impl FnOnce(&mut MockPage)) {
            let mut pages = self.pages.lock().expect("pages lock");
            let page = pages
                .iter_mut()
                .find(|page| page.handle.page_id == page_id)
                .expect("page exists");
            change(page);
        }
    }

    fn paginate<T: Clone>(
        items: &[T],
        limit: usize,
        token: Option<&ContinuationToken>,
    ) -> (Vec<T>, Option<ContinuationToken>) {
        let offset = token
            .and_then(|token| token.as_str().parse::<usize>().ok())
            .unwrap_or(0)
            .min(items.len());
        let end = (offset + limit.max(1)).min(items.len());
        let next = (end < items.len()).then(|| ContinuationToken::from_raw(end.to_string()));
        (items[offset..end].to_vec(), next)
    }

    impl WikiReadApi for MockApi {
        fn namespaces(&self) -> Result<Vec<i32>, FetchError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            Ok(self.namespaces.clone())
        }

        fn fetch_page_list(
            &self,
            query: &PageListQuery,
            token: Option<&ContinuationToken>,
        ) -> Result<ListPage, FetchError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.fail_listing.load(Ordering::SeqCst) {
                return Err(FetchError::Transient {
                    attempts: 3,
                    message: "connection reset".to_string(),
                });
            }
            let mut matching = self
                .pages
                .lock()
                .expect("pages lock")
                .iter()
                .map(|page| page.handle.clone())
                .filter(|handle| query.namespace.is_none_or(|ns| ns == handle.namespace))
                .filter(|handle| match query.since {
                    Some(since) => handle
                        .last_revision_timestamp
                        .is_some_and(|at| at > since),
                    None => true,
                })
                .collect::<Vec<_>>();
            if query.since.is_some() {
                matching.sort_by_key(|handle| handle.last_revision_timestamp);
            } else {
                matching.sort_by(|left, right| left.title.cmp(&right.title));
            }
            let (pages, next) = paginate(&matching, query.limit, token);
            Ok(ListPage { pages, next })
        }

        fn list_embedded_in(&self, template: &str) -> Result<Vec<String>, FetchError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            Ok(self.embedded.get(template).cloned().unwrap_or_default())
        }

        fn fetch_content(
            &self,
            page_id: i64,
            format: ContentFormat,
        ) -> Result<RevisionContent, FetchError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let not_found = || FetchError::NotFound {
                target: format!("page id {page_id}"),
            };
            if self.missing.lock().expect("missing lock").contains(&page_id) {
                return Err(not_found());
            }
            let pages = self.pages.lock().expect("pages lock");
            let page = pages
                .iter()
                .find(|page| page.handle.page_id == page_id)
                .ok_or_else(not_found)?;
            Ok(RevisionContent {
                page_id,
                title: page.handle.title.clone(),
                namespace: page.handle.namespace,
                revision_id: page_id * 10,
                timestamp: page.handle.last_revision_timestamp.unwrap_or_else(|| at(1, 0)),
                content_model: "wikitext".to_string(),
                format,
                body: format!("<p>{}</p>", page.handle.title),
                templates: page.templates.clone(),
            })
        }

        fn list_images(
            &self,
            limit: usize,
            token: Option<&ContinuationToken>,
        ) -> Result<ImageListPage, FetchError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let (images, next) = paginate(&self.images, limit, token);
            Ok(ImageListPage { images, next })
        }

        fn fetch_image_bytes(&self, title: &str) -> Result<Vec<u8>, FetchError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(title.as_bytes().to_vec())
        }

        fn request_count(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    /// Html sink that fails on its n-th page batch.
    struct FlakySink {
        inner: HtmlSink,
        fail_on: usize,
        calls: Cell<usize>,
    }

    impl PageSink for FlakySink {
        fn destination(&self) -> Destination {
            self.inner.destination()
        }

        fn content_format(&self) -> ContentFormat {
            self.inner.content_format()
        }

        fn persist_pages(&self, pages: &[RevisionContent]) -> anyhow::Result<Vec<PersistedPage>> {
            self.calls.set(self.calls.get() + 1);
            if self.calls.get() == self.fail_on {
                bail!("disk full");
            }
            self.inner.persist_pages(pages)
        }

        fn persist_images(
            &self,
            images: &[DownloadedImage],
        ) -> anyhow::Result<Vec<PersistedPage>> {
            self.inner.persist_images(images)
        }

        fn retire_output(&self, output_key: &str) -> anyhow::Result<()> {
            self.inner.retire_output(output_key)
        }

        fn finish_run(&self, full_refresh: bool) -> anyhow::Result<()> {
            self.inner.finish_run(full_refresh)
        }
    }

    struct Fixture {
        _temp: TempDir,
        paths: ResolvedPaths,
        store: StateStore,
        policy: PolicyData,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempdir().expect("tempdir");
            let paths = initialized_paths(temp.path());
            let store = StateStore::open(&paths, Destination::Html).expect("open state");
            Self {
                _temp: temp,
                paths,
                store,
                policy: PolicyData {
                    excluded_namespaces: BTreeSet::from([1, 2, 3]),
                    profile_templates: BTreeSet::from([PROFILE.to_string()]),
                    opted_in: BTreeSet::new(),
                    excluded: BTreeSet::new(),
                },
            }
        }

        fn run(&mut self, api: &MockApi, options: &RunOptions) -> Result<RunSummary, RunError> {
            let sink = HtmlSink::new(&self.paths, "Test Wiki");
            self.run_with(api, &sink, options)
        }

        fn run_with(
            &mut self,
            api: &MockApi,
            sink: &dyn PageSink,
            options: &RunOptions,
        ) -> Result<RunSummary, RunError> {
            Orchestrator::new(api, sink, &mut self.store, &self.policy, ShutdownSignal::new())
                .run(options)
        }

        fn archived(&self, title: &str) -> bool {
            self.paths
                .archive_dir
                .join(crate::codec::title_to_filename(title))
                .exists()
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap()
    }

    fn page(page_id: i64, title: &str, namespace: i32, timestamp: DateTime<Utc>) -> MockPage {
        MockPage {
            handle: PageHandle {
                title: title.to_string(),
                namespace,
                page_id,
                last_revision_timestamp: Some(timestamp),
            },
            templates: Vec::new(),
        }
    }

    fn options(mode: CrawlMode) -> RunOptions {
        RunOptions {
            mode,
            namespaces: Vec::new(),
            dry_run: false,
            force: false,
            workers: 3,
            batch_size: 4,
        }
    }

    fn numbered_pages(count: i64) -> Vec<MockPage> {
        (1..=count)
            .map(|id| page(id, &format!("Page {id:02}"), 0, at(2, 0)))
            .collect()
    }

    #[test]
    fn recent_run_fetches_changes_and_advances_checkpoint() {
        let mut fixture = Fixture::new();
        let t0 = at(10, 0);
        fixture
            .store
            .commit_batch(&BatchCommit {
                last_incremental_crawl: Some(t0),
                ..BatchCommit::default()
            })
            .expect("seed checkpoint");
        let api = MockApi::with_pages(
            &[0],
            vec![
                page(1, "Before", 0, at(9, 0)),
                page(2, "Alpha", 0, at(10, 1)),
                page(3, "Beta", 0, at(11, 5)),
                page(4, "Gamma", 0, at(10, 8)),
            ],
        );

        let summary = fixture
            .run(&api, &options(CrawlMode::Recent))
            .expect("recent run");
        assert_eq!(summary.fetched, 3);
        assert_eq!(summary.persisted, 3);
        assert_eq!(api.fetches(), 3);
        assert_eq!(
            fixture.store.load().expect("load").last_incremental_crawl,
            Some(at(11, 5))
        );

        let rerun = fixture
            .run(&api, &options(CrawlMode::Recent))
            .expect("rerun");
        assert_eq!(rerun.listed, 0);
        assert_eq!(rerun.fetched, 0);
        assert_eq!(api.fetches(), 3);
    }

    #[test]
    fn recent_checkpoint_covers_excluded_and_failed_changes() {
        let mut fixture = Fixture::new();
        fixture.policy.excluded.insert("Bob".to_string());
        fixture
            .store
            .commit_batch(&BatchCommit {
                last_incremental_crawl: Some(at(10, 0)),
                ..BatchCommit::default()
            })
            .expect("seed checkpoint");
        let api = MockApi::with_pages(
            &[0],
            vec![
                page(1, "Alpha", 0, at(10, 1)),
                page(2, "Bob", 0, at(11, 0)),
                page(3, "Gone", 0, at(12, 0)),
            ],
        );
        api.missing.lock().expect("lock").insert(3);

        let summary = fixture
            .run(&api, &options(CrawlMode::Recent))
            .expect("recent run");
        assert_eq!(summary.persisted, 1);
        assert_eq!(summary.decision_count(FilterReason::PrivacyExcluded), 1);
        assert_eq!(summary.failure_count(), 1);
        assert_eq!(
            fixture.store.load().expect("load").last_incremental_crawl,
            Some(at(12, 0))
        );
        assert_eq!(fixture.store.failures().expect("failures").len(), 1);

        let rerun = fixture
            .run(&api, &options(CrawlMode::Recent))
            .expect("rerun");
        assert_eq!(rerun.listed, 0);
    }

    #[test]
    fn single_page_failure_is_recorded_and_the_run_continues() {
        let mut fixture = Fixture::new();
        let api = MockApi::with_pages(&[0, 1, 2, 3], numbered_pages(10));
        api.missing.lock().expect("lock").insert(7);

        let summary = fixture
            .run(&api, &options(CrawlMode::Full))
            .expect("run is not fatal");
        assert_eq!(summary.persisted, 9);
        assert_eq!(summary.failure_count(), 1);
        assert_eq!(summary.failures.get(&FailureCategory::PermanentFetch), Some(&1));
        assert_eq!(summary.failed_titles, vec!["Page 07".to_string()]);
        assert_eq!(summary.namespaces, vec![0]);

        let failures = fixture.store.failures().expect("failures");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].failure.page_id, 7);
        assert_eq!(fixture.store.ledger_count(OutputKind::Page).expect("count"), 9);
        assert!(fixture.store.load().expect("load").last_full_crawl.is_some());
    }

    #[test]
    fn listing_failure_leaves_state_unchanged() {
        let mut fixture = Fixture::new();
        fixture
            .store
            .commit_batch(&BatchCommit {
                last_full_crawl: Some(at(1, 0)),
                last_incremental_crawl: Some(at(1, 0)),
                ..BatchCommit::default()
            })
            .expect("seed");
        let before = fixture.store.load().expect("load");
        let api = MockApi::with_pages(&[0], numbered_pages(3));
        api.fail_listing.store(true, Ordering::SeqCst);

        let error = fixture
            .run(&api, &options(CrawlMode::Full))
            .expect_err("listing failure is fatal");
        assert!(matches!(error, RunError::Listing(FetchError::Transient { .. })));
        assert_eq!(fixture.store.load().expect("load"), before);
        assert_eq!(api.fetches(), 0);
    }

    #[test]
    fn persistence_failure_does_not_advance_state() {
        let mut fixture = Fixture::new();
        let api = MockApi::with_pages(&[0], numbered_pages(3));
        let sink = FlakySink {
            inner: HtmlSink::new(&fixture.paths, "Test Wiki"),
            fail_on: 1,
            calls: Cell::new(0),
        };

        let error = fixture
            .run_with(&api, &sink, &options(CrawlMode::Full))
            .expect_err("persistence failure");
        assert!(matches!(error, RunError::Persistence(_)));
        assert_eq!(fixture.store.load().expect("load"), Default::default());
        assert_eq!(fixture.store.ledger_count(OutputKind::Page).expect("count"), 0);
    }

    #[test]
    fn interrupted_full_run_resumes_from_last_durable_batch() {
        let mut fixture = Fixture::new();
        let api = MockApi::with_pages(&[0], numbered_pages(10));
        let flaky = FlakySink {
            inner: HtmlSink::new(&fixture.paths, "Test Wiki"),
            fail_on: 2,
            calls: Cell::new(0),
        };
        assert!(
            fixture
                .run_with(&api, &flaky, &options(CrawlMode::Full))
                .is_err()
        );
        assert_eq!(api.fetches(), 8);
        let saved = fixture
            .store
            .load()
            .expect("load")
            .continuation
            .expect("continuation saved");
        assert_eq!(saved.token.as_deref(), Some("4"));

        let summary = fixture
            .run(&api, &options(CrawlMode::Full))
            .expect("resumed run");
        assert!(summary.resumed);
        assert_eq!(summary.fetched, 6);
        assert_eq!(fixture.store.ledger_count(OutputKind::Page).expect("count"), 10);
        assert!(fixture.store.load().expect("load").continuation.is_none());
    }

    #[test]
    fn dry_run_reports_decisions_without_fetching() {
        let mut fixture = Fixture::new();
        fixture.policy.opted_in.insert("Alice".to_string());
        fixture.policy.excluded.insert("Bob".to_string());
        let api = MockApi::with_pages(
            &[0, 3],
            vec![
                page(1, "Alice", 0, at(2, 0)),
                page(2, "Bob", 0, at(2, 0)),
                page(3, "Lore", 0, at(2, 0)),
                page(4, "User talk:Alice", 3, at(2, 0)),
            ],
        );
        let options = RunOptions {
            namespaces: vec![0, 3],
            dry_run: true,
            ..options(CrawlMode::Full)
        };

        let summary = fixture.run(&api, &options).expect("dry run");
        assert_eq!(api.fetches(), 0);
        assert_eq!(summary.planned.len(), 4);
        assert_eq!(summary.decision_count(FilterReason::OptedIn), 1);
        assert_eq!(summary.decision_count(FilterReason::PrivacyExcluded), 1);
        assert_eq!(summary.decision_count(FilterReason::Allowed), 1);
        assert_eq!(summary.decision_count(FilterReason::NamespaceExcluded), 1);
        assert!(!fixture.archived("Lore"));
        assert_eq!(fixture.store.load().expect("load"), Default::default());
    }

    #[test]
    fn content_signature_withdraws_a_previously_archived_page() {
        let mut fixture = Fixture::new();
        let api = MockApi::with_pages(&[0], vec![page(1, "Alice", 0, at(2, 0))]);
        fixture
            .run(&api, &options(CrawlMode::Full))
            .expect("first run");
        assert!(fixture.archived("Alice"));

        api.update(1, |page| {
            page.templates = vec![PROFILE.to_string()];
            page.handle.last_revision_timestamp = Some(at(3, 0));
        });
        let summary = fixture
            .run(&api, &options(CrawlMode::Full))
            .expect("second run");
        assert_eq!(summary.decision_count(FilterReason::PrivacyExcluded), 1);
        assert_eq!(summary.withdrawn, 1);
        assert!(!fixture.archived("Alice"));
        assert!(
            fixture
                .store
                .ledger_entry(OutputKind::Page, 1)
                .expect("query")
                .is_none()
        );
    }

    #[test]
    fn revoked_opt_in_withdraws_an_unchanged_profile_page() {
        let mut fixture = Fixture::new();
        fixture.policy.opted_in.insert("Alice".to_string());
        let mut alice = page(1, "Alice", 0, at(2, 0));
        alice.templates = vec![PROFILE.to_string()];
        let api = MockApi::with_pages(&[0], vec![alice, page(2, "Lore", 0, at(2, 0))]);

        let first = fixture
            .run(&api, &options(CrawlMode::Full))
            .expect("first run");
        assert_eq!(first.decision_count(FilterReason::OptedIn), 1);
        assert!(fixture.archived("Alice"));
        let entry = fixture
            .store
            .ledger_entry(OutputKind::Page, 1)
            .expect("query")
            .expect("entry");
        assert!(entry.uses_profile_template);

        fixture.policy.opted_in.clear();
        let second = fixture
            .run(&api, &options(CrawlMode::Full))
            .expect("second run");
        assert_eq!(api.fetches(), 2);
        assert_eq!(second.decision_count(FilterReason::PrivacyExcluded), 1);
        assert_eq!(second.decision_count(FilterReason::Allowed), 1);
        assert_eq!(second.unchanged, 1);
        assert_eq!(second.withdrawn, 1);
        assert!(!fixture.archived("Alice"));
        assert!(fixture.archived("Lore"));
        assert!(
            fixture
                .store
                .ledger_entry(OutputKind::Page, 1)
                .expect("query")
                .is_none()
        );
    }

    #[test]
    fn renamed_page_replaces_its_old_output() {
        let mut fixture = Fixture::new();
        let api = MockApi::with_pages(&[0], vec![page(5, "Old Name", 0, at(2, 0))]);
        fixture
            .run(&api, &options(CrawlMode::Full))
            .expect("first run");

        api.update(5, |page| {
            page.handle.title = "New Name".to_string();
            page.handle.last_revision_timestamp = Some(at(4, 0));
        });
        let summary = fixture
            .run(&api, &options(CrawlMode::Full))
            .expect("second run");
        assert_eq!(summary.renamed, 1);
        assert!(!fixture.archived("Old Name"));
        assert!(fixture.archived("New Name"));
        let entry = fixture
            .store
            .ledger_entry(OutputKind::Page, 5)
            .expect("query")
            .expect("entry");
        assert_eq!(entry.title, "New Name");
    }

    #[test]
    fn swapped_titles_keep_both_outputs() {
        let mut fixture = Fixture::new();
        let api = MockApi::with_pages(
            &[0],
            vec![page(1, "Left", 0, at(2, 0)), page(2, "Right", 0, at(2, 0))],
        );
        fixture
            .run(&api, &options(CrawlMode::Full))
            .expect("first run");
        api.update(1, |page| {
            page.handle.title = "Right".to_string();
            page.handle.last_revision_timestamp = Some(at(3, 0));
        });
        api.update(2, |page| {
            page.handle.title = "Left".to_string();
            page.handle.last_revision_timestamp = Some(at(3, 0));
        });
        fixture
            .run(&api, &options(CrawlMode::Full))
            .expect("second run");
        assert!(fixture.archived("Left"));
        assert!(fixture.archived("Right"));
    }

    #[test]
    fn unchanged_pages_are_not_refetched() {
        let mut fixture = Fixture::new();
        let api = MockApi::with_pages(&[0], numbered_pages(5));
        fixture
            .run(&api, &options(CrawlMode::Full))
            .expect("first run");
        let summary = fixture
            .run(&api, &options(CrawlMode::Full))
            .expect("second run");
        assert_eq!(summary.fetched, 0);
        assert_eq!(summary.unchanged, 5);

        let forced = RunOptions {
            force: true,
            ..options(CrawlMode::Full)
        };
        assert_eq!(fixture.run(&api, &forced).expect("forced").fetched, 5);
    }

    #[test]
    fn retry_pass_clears_recovered_failures() {
        let mut fixture = Fixture::new();
        let api = MockApi::with_pages(&[0], numbered_pages(8));
        api.missing.lock().expect("lock").insert(7);
        fixture
            .run(&api, &options(CrawlMode::Full))
            .expect("first run");
        let checkpoint = fixture.store.load().expect("load");
        assert_eq!(fixture.store.failures().expect("failures").len(), 1);

        api.missing.lock().expect("lock").clear();
        let sink = HtmlSink::new(&fixture.paths, "Test Wiki");
        let summary = Orchestrator::new(
            &api,
            &sink,
            &mut fixture.store,
            &fixture.policy,
            ShutdownSignal::new(),
        )
        .retry_failures(&options(CrawlMode::Full))
        .expect("retry");
        assert_eq!(summary.persisted, 1);
        assert!(fixture.store.failures().expect("failures").is_empty());
        assert!(fixture.archived("Page 07"));
        assert_eq!(fixture.store.load().expect("load"), checkpoint);
    }

    #[test]
    fn templates_only_run_restricts_namespaces() {
        let mut fixture = Fixture::new();
        let api = MockApi::with_pages(
            &[0, 10, 14, 828],
            vec![
                page(1, "Lore", 0, at(2, 0)),
                page(2, "Template:Infobox", 10, at(2, 0)),
                page(3, "Category:Weapons", 14, at(2, 0)),
            ],
        );
        let summary = fixture
            .run(&api, &options(CrawlMode::TemplatesOnly))
            .expect("templates run");
        assert_eq!(summary.namespaces, vec![10, 14, 828]);
        assert_eq!(summary.persisted, 2);
        assert!(!fixture.archived("Lore"));
        assert!(fixture.store.load().expect("load").last_full_crawl.is_none());
    }

    #[test]
    fn recent_without_checkpoint_falls_back_to_full() {
        let mut fixture = Fixture::new();
        let api = MockApi::with_pages(&[0], numbered_pages(2));
        let summary = fixture
            .run(&api, &options(CrawlMode::Recent))
            .expect("run");
        assert!(summary.fell_back_to_full);
        assert_eq!(summary.run, "full");
        let state = fixture.store.load().expect("load");
        assert!(state.last_full_crawl.is_some());
        assert_eq!(state.last_full_crawl, state.last_incremental_crawl);
    }

    #[test]
    fn images_run_downloads_media_once() {
        let mut fixture = Fixture::new();
        let api = MockApi {
            images: (1..=3)
                .map(|id| ImageHandle {
                    page_id: 100 + id,
                    title: format!("File:Map {id}.png"),
                    url: None,
                    timestamp: Some(at(2, 0)),
                })
                .collect(),
            ..MockApi::default()
        };
        let options = RunOptions {
            batch_size: 2,
            ..options(CrawlMode::Images)
        };
        let summary = fixture.run(&api, &options).expect("images run");
        assert_eq!(summary.persisted, 3);
        assert_eq!(summary.batches, 2);
        assert_eq!(
            fs::read(fixture.paths.media_dir.join("Map 2.png")).expect("image"),
            b"File:Map 2.png".to_vec()
        );
        let rerun = fixture.run(&api, &options).expect("rerun");
        assert_eq!(rerun.fetched, 0);
        assert_eq!(rerun.unchanged, 3);
    }

    #[test]
    fn cancelled_run_does_not_commit() {
        let mut fixture = Fixture::new();
        let api = MockApi::with_pages(&[0], numbered_pages(3));
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        let sink = HtmlSink::new(&fixture.paths, "Test Wiki");
        let error = Orchestrator::new(&api, &sink, &mut fixture.store, &fixture.policy, shutdown)
            .run(&options(CrawlMode::Full))
            .expect_err("cancelled");
        assert!(matches!(error, RunError::Cancelled));
        assert_eq!(fixture.store.load().expect("load"), Default::default());
    }

    #[test]
    fn registry_refresh_rewrites_the_excluded_titles() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("excluded.json");
        fs::write(&path, "[\"Stale\"]").expect("seed");
        let api = MockApi {
            embedded: BTreeMap::from([(
                PROFILE.to_string(),
                vec!["Bob_Smith".to_string(), "Alice".to_string()],
            )]),
            ..MockApi::default()
        };
        let report =
            refresh_excluded_registry(&api, &[PROFILE.to_string()], &path).expect("refresh");
        assert_eq!(report.excluded_titles, 2);
        assert_eq!(report.previous_titles, Some(1));
        let titles: Vec<String> =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(titles, vec!["Alice".to_string(), "Bob Smith".to_string()]);
    }

    #[test]
    fn fetch_all_keeps_input_order() {
        let items = (0..20).collect::<Vec<u64>>();
        let results = fetch_all(&items, 4, |value| {
            if *value == 13 {
                Err(FetchError::permanent("unlucky"))
            } else {
                Ok(value * 2)
            }
        });
        assert_eq!(results.len(), 20);
        assert_eq!(results[5].as_ref().ok(), Some(&10));
        assert!(results[13].is_err());
    }
}
