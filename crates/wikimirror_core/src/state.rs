use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};

use crate::api::ContinuationToken;
use crate::error::FailureCategory;
use crate::persist::{Destination, OutputKind, PersistedPage};
use crate::runtime::ResolvedPaths;

const STATE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS crawl_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS page_ledger (
    destination TEXT NOT NULL,
    kind TEXT NOT NULL,
    page_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    namespace INTEGER NOT NULL,
    output_key TEXT NOT NULL,
    revision_id INTEGER,
    revision_timestamp TEXT,
    content_hash TEXT NOT NULL,
    uses_profile_template INTEGER NOT NULL DEFAULT 0,
    persisted_at TEXT NOT NULL,
    PRIMARY KEY (destination, kind, page_id)
);
CREATE INDEX IF NOT EXISTS idx_page_ledger_title ON page_ledger(destination, title);
CREATE INDEX IF NOT EXISTS idx_page_ledger_output ON page_ledger(destination, output_key);

CREATE TABLE IF NOT EXISTS crawl_failures (
    destination TEXT NOT NULL,
    kind TEXT NOT NULL,
    page_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    namespace INTEGER NOT NULL,
    category TEXT NOT NULL,
    message TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (destination, kind, page_id)
);
"#;

/// Where an interrupted listing stopped. `token` is `None` when the namespace had not
/// been started yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedContinuation {
    pub run_key: String,
    pub namespace: Option<i32>,
    pub token: Option<String>,
}

impl SavedContinuation {
    pub fn token(&self) -> Option<ContinuationToken> {
        self.token.as_deref().map(ContinuationToken::from_raw)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlState {
    pub last_full_crawl: Option<DateTime<Utc>>,
    pub last_incremental_crawl: Option<DateTime<Utc>>,
    pub continuation: Option<SavedContinuation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub page_id: i64,
    pub kind: OutputKind,
    pub title: String,
    pub namespace: i32,
    pub output_key: String,
    pub revision_id: Option<i64>,
    pub revision_timestamp: Option<DateTime<Utc>>,
    pub content_hash: String,
    /// The archived revision transcluded a profile template.
    pub uses_profile_template: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub page_id: i64,
    pub kind: OutputKind,
    pub title: String,
    pub namespace: i32,
    pub category: FailureCategory,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredFailure {
    #[serde(flatten)]
    pub failure: FailureRecord,
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ContinuationUpdate {
    #[default]
    Keep,
    Set(SavedContinuation),
    Clear,
}

/// Everything one batch changes. Applied in a single transaction so the ledger and the
/// checkpoints never disagree about what reached the destination.
#[derive(Debug, Clone, Default)]
pub struct BatchCommit {
    pub persisted: Vec<PersistedPage>,
    pub failures: Vec<FailureRecord>,
    /// Ledger rows whose output was retired by policy.
    pub withdrawn: Vec<(OutputKind, i64)>,
    /// Failure rows that no longer need a retry.
    pub cleared_failures: Vec<(OutputKind, i64)>,
    pub continuation: ContinuationUpdate,
    pub last_full_crawl: Option<DateTime<Utc>>,
    pub last_incremental_crawl: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSummary {
    pub destination: Destination,
    pub last_full_crawl: Option<DateTime<Utc>>,
    pub last_incremental_crawl: Option<DateTime<Utc>>,
    pub resumable: bool,
    pub ledger_pages: usize,
    pub ledger_images: usize,
    pub pending_failures: usize,
}

/// Crawl state for one destination. Several destinations share the database file but
/// never each other's rows.
pub struct StateStore {
    connection: Connection,
    destination: Destination,
}

impl StateStore {
    pub fn open(paths: &ResolvedPaths, destination: Destination) -> Result<Self> {
        Self::open_at(&paths.db_path, destination)
    }

    pub fn open_at(db_path: &Path, destination: Destination) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        connection
            .execute_batch(STATE_SCHEMA_SQL)
            .context("failed to initialize crawl state schema")?;
        ensure_ledger_columns(&connection)?;
        Ok(Self {
            connection,
            destination,
        })
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }

    pub fn load(&self) -> Result<CrawlState> {
        let continuation = match self.get_value("continuation")? {
            Some(raw) => Some(
                serde_json::from_str::<SavedContinuation>(&raw)
                    .context("failed to decode saved continuation")?,
            ),
            None => None,
        };
        Ok(CrawlState {
            last_full_crawl: self.get_timestamp("last_full_crawl")?,
            last_incremental_crawl: self.get_timestamp("last_incremental_crawl")?,
            continuation,
        })
    }

    pub fn ledger_entry(&self, kind: OutputKind, page_id: i64) -> Result<Option<LedgerEntry>> {
        let row = self
            .connection
            .query_row(
                "SELECT page_id, kind, title, namespace, output_key, revision_id,
                        revision_timestamp, content_hash, uses_profile_template
                 FROM page_ledger
                 WHERE destination = ?1 AND kind = ?2 AND page_id = ?3",
                params![self.destination.as_str(), kind.as_str(), page_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i32>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, bool>(8)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to read ledger row for page {page_id}"))?;
        let Some((
            page_id,
            kind,
            title,
            namespace,
            output_key,
            revision_id,
            timestamp,
            hash,
            uses_profile_template,
        )) = row
        else {
            return Ok(None);
        };
        let revision_timestamp = match timestamp {
            Some(value) => Some(parse_timestamp(&value)?),
            None => None,
        };
        Ok(Some(LedgerEntry {
            page_id,
            kind: OutputKind::parse(&kind).with_context(|| format!("unknown ledger kind {kind}"))?,
            title,
            namespace,
            output_key,
            revision_id,
            revision_timestamp,
            content_hash: hash,
            uses_profile_template,
        }))
    }

    pub fn ledger_count(&self, kind: OutputKind) -> Result<usize> {
        let count: i64 = self
            .connection
            .query_row(
                "SELECT COUNT(*) FROM page_ledger WHERE destination = ?1 AND kind = ?2",
                params![self.destination.as_str(), kind.as_str()],
                |row| row.get(0),
            )
            .context("failed to count ledger rows")?;
        Ok(count as usize)
    }

    pub fn output_key_in_use(&self, output_key: &str) -> Result<bool> {
        let exists: i64 = self
            .connection
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM page_ledger WHERE destination = ?1 AND output_key = ?2
                )",
                params![self.destination.as_str(), output_key],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to look up ledger owner of {output_key}"))?;
        Ok(exists == 1)
    }

    /// Outstanding failures, oldest first.
    pub fn failures(&self) -> Result<Vec<StoredFailure>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT page_id, kind, title, namespace, category, message, attempts, recorded_at
                 FROM crawl_failures
                 WHERE destination = ?1
                 ORDER BY recorded_at, page_id",
            )
            .context("failed to prepare failure query")?;
        let rows = statement
            .query_map([self.destination.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i32>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, u32>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .context("failed to query crawl failures")?;

        let mut failures = Vec::new();
        for row in rows {
            let (page_id, kind, title, namespace, category, message, attempts, recorded_at) =
                row.context("failed to decode crawl failure row")?;
            failures.push(StoredFailure {
                failure: FailureRecord {
                    page_id,
                    kind: OutputKind::parse(&kind)
                        .with_context(|| format!("unknown failure kind {kind}"))?,
                    title,
                    namespace,
                    category: FailureCategory::parse(&category)
                        .with_context(|| format!("unknown failure category {category}"))?,
                    message,
                },
                attempts,
                recorded_at: parse_timestamp(&recorded_at)?,
            });
        }
        Ok(failures)
    }

    pub fn summary(&self) -> Result<StateSummary> {
        let state = self.load()?;
        Ok(StateSummary {
            destination: self.destination,
            last_full_crawl: state.last_full_crawl,
            last_incremental_crawl: state.last_incremental_crawl,
            resumable: state.continuation.is_some(),
            ledger_pages: self.ledger_count(OutputKind::Page)?,
            ledger_images: self.ledger_count(OutputKind::Image)?,
            pending_failures: self.failures()?.len(),
        })
    }

    pub fn commit_batch(&mut self, commit: &BatchCommit) -> Result<()> {
        let destination = self.destination;
        let transaction = self
            .connection
            .transaction()
            .context("failed to start crawl state transaction")?;
        apply_batch(&transaction, destination, commit)?;
        transaction
            .commit()
            .context("failed to commit crawl state transaction")
    }

    fn key(&self, name: &str) -> String {
        format!("{}.{name}", self.destination.as_str())
    }

    fn get_value(&self, name: &str) -> Result<Option<String>> {
        let key = self.key(name);
        self.connection
            .query_row(
                "SELECT value FROM crawl_state WHERE key = ?1 LIMIT 1",
                [&key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read crawl state key {key}"))
    }

    fn get_timestamp(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        self.get_value(name)?
            .as_deref()
            .map(parse_timestamp)
            .transpose()
    }
}

fn apply_batch(
    transaction: &Transaction<'_>,
    destination: Destination,
    commit: &BatchCommit,
) -> Result<()> {
    let destination_key = destination.as_str();
    let now = format_timestamp(Utc::now());

    for page in &commit.persisted {
        transaction
            .execute(
                "INSERT INTO page_ledger (
                    destination, kind, page_id, title, namespace, output_key, revision_id,
                    revision_timestamp, content_hash, uses_profile_template, persisted_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(destination, kind, page_id) DO UPDATE SET
                    title = excluded.title,
                    namespace = excluded.namespace,
                    output_key = excluded.output_key,
                    revision_id = excluded.revision_id,
                    revision_timestamp = excluded.revision_timestamp,
                    content_hash = excluded.content_hash,
                    uses_profile_template = excluded.uses_profile_template,
                    persisted_at = excluded.persisted_at",
                params![
                    destination_key,
                    page.kind.as_str(),
                    page.page_id,
                    page.title,
                    page.namespace,
                    page.output_key,
                    page.revision_id,
                    page.revision_timestamp.map(format_timestamp),
                    page.content_hash,
                    page.uses_profile_template,
                    now,
                ],
            )
            .with_context(|| format!("failed to upsert ledger row for {}", page.title))?;
        delete_failure(transaction, destination_key, page.kind, page.page_id)?;
    }

    for (kind, page_id) in &commit.withdrawn {
        transaction
            .execute(
                "DELETE FROM page_ledger WHERE destination = ?1 AND kind = ?2 AND page_id = ?3",
                params![destination_key, kind.as_str(), page_id],
            )
            .with_context(|| format!("failed to withdraw ledger row for page {page_id}"))?;
        delete_failure(transaction, destination_key, *kind, *page_id)?;
    }

    for (kind, page_id) in &commit.cleared_failures {
        delete_failure(transaction, destination_key, *kind, *page_id)?;
    }

    for failure in &commit.failures {
        transaction
            .execute(
                "INSERT INTO crawl_failures (
                    destination, kind, page_id, title, namespace, category, message, attempts,
                    recorded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)
                ON CONFLICT(destination, kind, page_id) DO UPDATE SET
                    title = excluded.title,
                    namespace = excluded.namespace,
                    category = excluded.category,
                    message = excluded.message,
                    attempts = crawl_failures.attempts + 1,
                    recorded_at = excluded.recorded_at",
                params![
                    destination_key,
                    failure.kind.as_str(),
                    failure.page_id,
                    failure.title,
                    failure.namespace,
                    failure.category.as_str(),
                    failure.message,
                    now,
                ],
            )
            .with_context(|| format!("failed to record failure for {}", failure.title))?;
    }

    match &commit.continuation {
        ContinuationUpdate::Keep => {}
        ContinuationUpdate::Set(saved) => {
            let raw = serde_json::to_string(saved).context("failed to encode continuation")?;
            set_value(transaction, destination, "continuation", &raw)?;
        }
        ContinuationUpdate::Clear => {
            transaction
                .execute(
                    "DELETE FROM crawl_state WHERE key = ?1",
                    [format!("{destination_key}.continuation")],
                )
                .context("failed to clear saved continuation")?;
        }
    }
    if let Some(at) = commit.last_full_crawl {
        set_value(transaction, destination, "last_full_crawl", &format_timestamp(at))?;
    }
    if let Some(at) = commit.last_incremental_crawl {
        set_value(
            transaction,
            destination,
            "last_incremental_crawl",
            &format_timestamp(at),
        )?;
    }
    Ok(())
}

/// Databases created before `uses_profile_template` existed gain the column in place.
fn ensure_ledger_columns(connection: &Connection) -> Result<()> {
    let mut statement = connection
        .prepare("SELECT name FROM pragma_table_info('page_ledger')")
        .context("failed to inspect page_ledger columns")?;
    let columns = statement
        .query_map([], |row| row.get::<_, String>(0))
        .context("failed to list page_ledger columns")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to read page_ledger columns")?;
    if !columns.iter().any(|name| name == "uses_profile_template") {
        connection
            .execute(
                "ALTER TABLE page_ledger
                 ADD COLUMN uses_profile_template INTEGER NOT NULL DEFAULT 0",
                [],
            )
            .context("failed to add uses_profile_template to page_ledger")?;
    }
    Ok(())
}

fn delete_failure(
    transaction: &Transaction<'_>,
    destination: &str,
    kind: OutputKind,
    page_id: i64,
) -> Result<()> {
    transaction
        .execute(
            "DELETE FROM crawl_failures WHERE destination = ?1 AND kind = ?2 AND page_id = ?3",
            params![destination, kind.as_str(), page_id],
        )
        .with_context(|| format!("failed to clear failure for page {page_id}"))?;
    Ok(())
}

fn set_value(
    transaction: &Transaction<'_>,
    destination: Destination,
    name: &str,
    value: &str,
) -> Result<()> {
    let key = format!("{}.{name}", destination.as_str());
    transaction
        .execute(
            "INSERT INTO crawl_state (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .with_context(|| format!("failed to set crawl state key {key}"))?;
    Ok(())
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .with_context(|| format!("invalid stored timestamp {value}"))
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    use super::{
        BatchCommit, ContinuationUpdate, FailureRecord, SavedContinuation, StateStore,
    };
    use crate::error::FailureCategory;
    use crate::persist::{Destination, OutputKind, PersistedPage};

    fn persisted(page_id: i64, title: &str) -> PersistedPage {
        PersistedPage {
            page_id,
            kind: OutputKind::Page,
            title: title.to_string(),
            namespace: 0,
            output_key: format!("archive/{title}.html"),
            revision_id: Some(page_id * 100),
            revision_timestamp: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
            content_hash: "0011223344556677".to_string(),
            uses_profile_template: false,
        }
    }

    fn failure(page_id: i64, title: &str) -> FailureRecord {
        FailureRecord {
            page_id,
            kind: OutputKind::Page,
            title: title.to_string(),
            namespace: 0,
            category: FailureCategory::TransientNetwork,
            message: "connection reset".to_string(),
        }
    }

    #[test]
    fn fresh_store_has_no_checkpoints() {
        let temp = tempdir().expect("tempdir");
        let store = StateStore::open_at(&temp.path().join("state.db"), Destination::Html)
            .expect("open");
        let state = store.load().expect("load");
        assert_eq!(state.last_full_crawl, None);
        assert_eq!(state.last_incremental_crawl, None);
        assert_eq!(state.continuation, None);
        assert_eq!(store.ledger_count(OutputKind::Page).expect("count"), 0);
    }

    #[test]
    fn committed_batch_survives_reopen() {
        let temp = tempdir().expect("tempdir");
        let db = temp.path().join("state.db");
        let checkpoint = Utc.with_ymd_and_hms(2024, 4, 2, 9, 15, 0).unwrap();
        {
            let mut store = StateStore::open_at(&db, Destination::Html).expect("open");
            store
                .commit_batch(&BatchCommit {
                    persisted: vec![persisted(1, "Alpha"), persisted(2, "Beta")],
                    failures: vec![failure(3, "Gamma")],
                    continuation: ContinuationUpdate::Set(SavedContinuation {
                        run_key: "full|0".to_string(),
                        namespace: Some(0),
                        token: Some("{\"apcontinue\":\"Beta\"}".to_string()),
                    }),
                    last_incremental_crawl: Some(checkpoint),
                    ..BatchCommit::default()
                })
                .expect("commit");
        }

        let store = StateStore::open_at(&db, Destination::Html).expect("reopen");
        let state = store.load().expect("load");
        assert_eq!(state.last_incremental_crawl, Some(checkpoint));
        let saved = state.continuation.expect("continuation");
        assert_eq!(
            saved.token().expect("token").as_str(),
            "{\"apcontinue\":\"Beta\"}"
        );
        let entry = store
            .ledger_entry(OutputKind::Page, 2)
            .expect("query")
            .expect("entry");
        assert_eq!(entry.title, "Beta");
        assert_eq!(entry.revision_id, Some(200));
        assert!(!entry.uses_profile_template);
        assert_eq!(store.failures().expect("failures").len(), 1);
    }

    #[test]
    fn ledger_remembers_profile_transclusion() {
        let temp = tempdir().expect("tempdir");
        let mut store = StateStore::open_at(&temp.path().join("state.db"), Destination::Html)
            .expect("open");
        store
            .commit_batch(&BatchCommit {
                persisted: vec![PersistedPage {
                    uses_profile_template: true,
                    ..persisted(6, "Alice")
                }],
                ..BatchCommit::default()
            })
            .expect("commit");
        let entry = store
            .ledger_entry(OutputKind::Page, 6)
            .expect("query")
            .expect("entry");
        assert!(entry.uses_profile_template);

        store
            .commit_batch(&BatchCommit {
                persisted: vec![persisted(6, "Alice")],
                ..BatchCommit::default()
            })
            .expect("overwrite");
        let entry = store
            .ledger_entry(OutputKind::Page, 6)
            .expect("query")
            .expect("entry");
        assert!(!entry.uses_profile_template);
    }

    #[test]
    fn older_ledger_gains_the_profile_column() {
        let temp = tempdir().expect("tempdir");
        let db = temp.path().join("state.db");
        {
            let connection = rusqlite::Connection::open(&db).expect("open raw");
            connection
                .execute_batch(
                    "CREATE TABLE page_ledger (
                        destination TEXT NOT NULL,
                        kind TEXT NOT NULL,
                        page_id INTEGER NOT NULL,
                        title TEXT NOT NULL,
                        namespace INTEGER NOT NULL,
                        output_key TEXT NOT NULL,
                        revision_id INTEGER,
                        revision_timestamp TEXT,
                        content_hash TEXT NOT NULL,
                        persisted_at TEXT NOT NULL,
                        PRIMARY KEY (destination, kind, page_id)
                    );
                    INSERT INTO page_ledger VALUES
                        ('html', 'page', 1, 'Alpha', 0, 'Alpha.html', 10, NULL, 'aa',
                         '2024-01-01T00:00:00Z');",
                )
                .expect("legacy schema");
        }

        let store = StateStore::open_at(&db, Destination::Html).expect("open");
        let entry = store
            .ledger_entry(OutputKind::Page, 1)
            .expect("query")
            .expect("entry");
        assert_eq!(entry.title, "Alpha");
        assert!(!entry.uses_profile_template);
    }

    #[test]
    fn repeated_failures_count_attempts_and_success_clears_them() {
        let temp = tempdir().expect("tempdir");
        let mut store = StateStore::open_at(&temp.path().join("state.db"), Destination::Html)
            .expect("open");
        for _ in 0..2 {
            store
                .commit_batch(&BatchCommit {
                    failures: vec![failure(9, "Flaky")],
                    ..BatchCommit::default()
                })
                .expect("commit failure");
        }
        let failures = store.failures().expect("failures");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempts, 2);

        store
            .commit_batch(&BatchCommit {
                persisted: vec![persisted(9, "Flaky")],
                ..BatchCommit::default()
            })
            .expect("commit success");
        assert!(store.failures().expect("failures").is_empty());
    }

    #[test]
    fn withdrawn_pages_leave_the_ledger() {
        let temp = tempdir().expect("tempdir");
        let mut store = StateStore::open_at(&temp.path().join("state.db"), Destination::Html)
            .expect("open");
        store
            .commit_batch(&BatchCommit {
                persisted: vec![persisted(4, "Delta")],
                ..BatchCommit::default()
            })
            .expect("commit");
        store
            .commit_batch(&BatchCommit {
                withdrawn: vec![(OutputKind::Page, 4)],
                ..BatchCommit::default()
            })
            .expect("withdraw");
        assert!(
            store
                .ledger_entry(OutputKind::Page, 4)
                .expect("query")
                .is_none()
        );
    }

    #[test]
    fn continuation_can_be_cleared() {
        let temp = tempdir().expect("tempdir");
        let mut store = StateStore::open_at(&temp.path().join("state.db"), Destination::Html)
            .expect("open");
        store
            .commit_batch(&BatchCommit {
                continuation: ContinuationUpdate::Set(SavedContinuation {
                    run_key: "recent|*".to_string(),
                    namespace: None,
                    token: None,
                }),
                ..BatchCommit::default()
            })
            .expect("set");
        assert!(store.load().expect("load").continuation.is_some());
        store
            .commit_batch(&BatchCommit {
                continuation: ContinuationUpdate::Clear,
                ..BatchCommit::default()
            })
            .expect("clear");
        assert!(store.load().expect("load").continuation.is_none());
    }

    #[test]
    fn destinations_do_not_share_rows() {
        let temp = tempdir().expect("tempdir");
        let db = temp.path().join("state.db");
        let mut html = StateStore::open_at(&db, Destination::Html).expect("html");
        html.commit_batch(&BatchCommit {
            persisted: vec![persisted(1, "Alpha")],
            last_full_crawl: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            ..BatchCommit::default()
        })
        .expect("commit");

        let import = StateStore::open_at(&db, Destination::Import).expect("import");
        assert_eq!(import.load().expect("load").last_full_crawl, None);
        assert!(
            import
                .ledger_entry(OutputKind::Page, 1)
                .expect("query")
                .is_none()
        );
        let summary = html.summary().expect("summary");
        assert_eq!(summary.ledger_pages, 1);
        assert!(!summary.resumable);
    }
}
