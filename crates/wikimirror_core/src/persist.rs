use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::api::{ContentFormat, ImageHandle, RevisionContent};
use crate::codec::{encode_title, title_to_filename};
use crate::import::{BusyRetryPolicy, ImportBackend, with_busy_retry};
use crate::runtime::ResolvedPaths;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Html,
    Import,
}

impl Destination {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Import => "import",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Page,
    Image,
}

impl OutputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::Image => "image",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "page" => Some(Self::Page),
            "image" => Some(Self::Image),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedImage {
    pub handle: ImageHandle,
    pub bytes: Vec<u8>,
}

/// Ledger row for one durably written output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedPage {
    pub page_id: i64,
    pub kind: OutputKind,
    pub title: String,
    pub namespace: i32,
    pub output_key: String,
    pub revision_id: Option<i64>,
    pub revision_timestamp: Option<DateTime<Utc>>,
    pub content_hash: String,
    /// Filled in by the orchestrator from the page's content signature.
    pub uses_profile_template: bool,
}

/// Where fetched content ends up. Every method either leaves all of its outputs in
/// place or returns an error.
pub trait PageSink {
    fn destination(&self) -> Destination;
    fn content_format(&self) -> ContentFormat;
    fn persist_pages(&self, pages: &[RevisionContent]) -> Result<Vec<PersistedPage>>;
    fn persist_images(&self, images: &[DownloadedImage]) -> Result<Vec<PersistedPage>>;
    /// Drop an output superseded by a rename or withdrawn by policy.
    fn retire_output(&self, output_key: &str) -> Result<()>;
    fn finish_run(&self, full_refresh: bool) -> Result<()>;
}

/// Static archive pages under `archive/`, images under `media/`.
pub struct HtmlSink {
    project_root: PathBuf,
    archive_dir: PathBuf,
    media_dir: PathBuf,
    wiki_name: String,
}

impl HtmlSink {
    pub fn new(paths: &ResolvedPaths, wiki_name: &str) -> Self {
        Self {
            project_root: paths.project_root.clone(),
            archive_dir: paths.archive_dir.clone(),
            media_dir: paths.media_dir.clone(),
            wiki_name: wiki_name.to_string(),
        }
    }

    fn output_key(&self, path: &Path) -> String {
        relative_key(&self.project_root, path)
    }
}

impl PageSink for HtmlSink {
    fn destination(&self) -> Destination {
        Destination::Html
    }

    fn content_format(&self) -> ContentFormat {
        ContentFormat::Html
    }

    fn persist_pages(&self, pages: &[RevisionContent]) -> Result<Vec<PersistedPage>> {
        let mut persisted = Vec::with_capacity(pages.len());
        for page in pages {
            let path = self.archive_dir.join(title_to_filename(&page.title));
            let document = render_html_document(page, &self.wiki_name);
            write_atomic(&path, document.as_bytes())?;
            debug!("wrote {}", path.display());
            persisted.push(PersistedPage {
                page_id: page.page_id,
                kind: OutputKind::Page,
                title: page.title.clone(),
                namespace: page.namespace,
                output_key: self.output_key(&path),
                revision_id: Some(page.revision_id),
                revision_timestamp: Some(page.timestamp),
                content_hash: content_hash(page.body.as_bytes()),
                uses_profile_template: false,
            });
        }
        Ok(persisted)
    }

    fn persist_images(&self, images: &[DownloadedImage]) -> Result<Vec<PersistedPage>> {
        let mut persisted = Vec::with_capacity(images.len());
        for image in images {
            let path = self.media_dir.join(encode_title(image.handle.file_name()));
            write_atomic(&path, &image.bytes)?;
            persisted.push(image_record(image, self.output_key(&path)));
        }
        Ok(persisted)
    }

    fn retire_output(&self, output_key: &str) -> Result<()> {
        remove_output(&self.project_root, output_key)
    }

    fn finish_run(&self, _full_refresh: bool) -> Result<()> {
        Ok(())
    }
}

/// Export XML batches under `import/`, fed to the destination wiki.
pub struct ImportSink {
    import_dir: PathBuf,
    wiki_name: String,
    backend: Box<dyn ImportBackend>,
    busy_policy: BusyRetryPolicy,
    shutdown: ShutdownSignal,
    batch_label: String,
    sequence: AtomicUsize,
}

impl ImportSink {
    pub fn new(
        paths: &ResolvedPaths,
        wiki_name: &str,
        backend: Box<dyn ImportBackend>,
        busy_policy: BusyRetryPolicy,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            import_dir: paths.import_dir.clone(),
            wiki_name: wiki_name.to_string(),
            backend,
            busy_policy,
            shutdown,
            batch_label: Utc::now().format("%Y%m%dT%H%M%SZ").to_string(),
            sequence: AtomicUsize::new(0),
        }
    }

    fn next_batch_name(&self) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("batch-{}-{sequence:04}", self.batch_label)
    }
}

impl PageSink for ImportSink {
    fn destination(&self) -> Destination {
        Destination::Import
    }

    fn content_format(&self) -> ContentFormat {
        ContentFormat::Wikitext
    }

    fn persist_pages(&self, pages: &[RevisionContent]) -> Result<Vec<PersistedPage>> {
        if pages.is_empty() {
            return Ok(Vec::new());
        }
        let dump_path = self
            .import_dir
            .join(format!("{}.xml", self.next_batch_name()));
        let xml = render_export_xml(pages, &self.wiki_name);
        write_atomic(&dump_path, xml.as_bytes())?;
        with_busy_retry(&self.busy_policy, &self.shutdown, "importDump", || {
            self.backend.import_dump(&dump_path)
        })
        .with_context(|| format!("failed to import {}", dump_path.display()))?;
        info!("imported {} page(s) from {}", pages.len(), dump_path.display());

        Ok(pages
            .iter()
            .map(|page| PersistedPage {
                page_id: page.page_id,
                kind: OutputKind::Page,
                title: page.title.clone(),
                namespace: page.namespace,
                output_key: title_to_filename(&page.title),
                revision_id: Some(page.revision_id),
                revision_timestamp: Some(page.timestamp),
                content_hash: content_hash(page.body.as_bytes()),
                uses_profile_template: false,
            })
            .collect())
    }

    fn persist_images(&self, images: &[DownloadedImage]) -> Result<Vec<PersistedPage>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let batch_dir = self.import_dir.join("images").join(self.next_batch_name());
        let mut persisted = Vec::with_capacity(images.len());
        for image in images {
            let path = batch_dir.join(encode_title(image.handle.file_name()));
            write_atomic(&path, &image.bytes)?;
            persisted.push(image_record(image, format!("media:{}", image.handle.title)));
        }
        with_busy_retry(&self.busy_policy, &self.shutdown, "importImages", || {
            self.backend.import_images(&batch_dir)
        })
        .with_context(|| format!("failed to import images from {}", batch_dir.display()))?;
        Ok(persisted)
    }

    fn retire_output(&self, output_key: &str) -> Result<()> {
        // The destination keeps the old title; history there is not ours to delete.
        warn!("{output_key} was superseded but remains on the destination wiki");
        Ok(())
    }

    fn finish_run(&self, full_refresh: bool) -> Result<()> {
        if !full_refresh {
            return Ok(());
        }
        with_busy_retry(&self.busy_policy, &self.shutdown, "index rebuild", || {
            self.backend.rebuild_indexes()
        })
        .context("failed to rebuild destination search and link tables")
    }
}

fn image_record(image: &DownloadedImage, output_key: String) -> PersistedPage {
    PersistedPage {
        page_id: image.handle.page_id,
        kind: OutputKind::Image,
        title: image.handle.title.clone(),
        namespace: crate::filter::NS_FILE,
        output_key,
        revision_id: None,
        revision_timestamp: image.handle.timestamp,
        content_hash: content_hash(&image.bytes),
        uses_profile_template: false,
    }
}

/// Write through a temp file in the target directory and rename into place, so readers
/// see either the old file or the complete new one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    let mut temp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    temp.write_all(bytes)
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    temp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync temp file for {}", path.display()))?;
    temp.persist(path)
        .map_err(|error| error.error)
        .with_context(|| format!("failed to move temp file into {}", path.display()))?;
    Ok(())
}

pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut output = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn relative_key(project_root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(project_root).unwrap_or(path);
    relative.to_string_lossy().replace('\\', "/")
}

fn remove_output(project_root: &Path, output_key: &str) -> Result<()> {
    let mut path = project_root.to_path_buf();
    for segment in output_key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            continue;
        }
        path.push(segment);
    }
    match fs::remove_file(&path) {
        Ok(()) => {
            info!("removed superseded output {}", path.display());
            Ok(())
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => {
            Err(error).with_context(|| format!("failed to remove {}", path.display()))
        }
    }
}

pub fn render_html_document(page: &RevisionContent, wiki_name: &str) -> String {
    let title = html_escape(&page.title);
    let body = match page.format {
        ContentFormat::Html => page.body.clone(),
        ContentFormat::Wikitext => format!("<pre>{}</pre>", html_escape(&page.body)),
    };
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n<meta name=\"wikimirror-revision\" content=\"{revision}\">\n<meta name=\"wikimirror-timestamp\" content=\"{timestamp}\">\n<title>{title} - {wiki}</title>\n</head>\n<body>\n<div id=\"content\" class=\"mw-body\">\n<h1 id=\"firstHeading\" class=\"firstHeading\">{title}</h1>\n<div id=\"mw-content-text\">\n{body}\n</div>\n</div>\n</body>\n</html>\n",
        revision = page.revision_id,
        timestamp = page.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        wiki = html_escape(wiki_name),
    )
}

pub fn render_export_xml(pages: &[RevisionContent], wiki_name: &str) -> String {
    let mut xml = String::from(
        "<mediawiki xmlns=\"http://www.mediawiki.org/xml/export-0.11/\" xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\" xsi:schemaLocation=\"http://www.mediawiki.org/xml/export-0.11/ http://www.mediawiki.org/xml/export-0.11.xsd\" version=\"0.11\" xml:lang=\"en\">\n",
    );
    for page in pages {
        let text = xml_escape(&page.body);
        xml.push_str(&format!(
            "  <page>\n    <title>{title}</title>\n    <ns>{ns}</ns>\n    <id>{id}</id>\n    <revision>\n      <id>{revid}</id>\n      <timestamp>{timestamp}</timestamp>\n      <contributor>\n        <username>{contributor}</username>\n      </contributor>\n      <comment>Imported from {contributor}</comment>\n      <model>{model}</model>\n      <format>{format}</format>\n      <text bytes=\"{bytes}\" xml:space=\"preserve\">{text}</text>\n    </revision>\n  </page>\n",
            title = xml_escape(&page.title),
            ns = page.namespace,
            id = page.page_id,
            revid = page.revision_id,
            timestamp = page.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            contributor = xml_escape(wiki_name),
            model = xml_escape(&page.content_model),
            format = content_format_mime(&page.content_model),
            bytes = page.body.len(),
        ));
    }
    xml.push_str("</mediawiki>\n");
    xml
}

fn content_format_mime(content_model: &str) -> &'static str {
    match content_model {
        "wikitext" => "text/x-wiki",
        "css" | "sanitized-css" => "text/css",
        "javascript" => "text/javascript",
        "json" => "application/json",
        _ => "text/plain",
    }
}

pub fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Escape markup and drop characters XML 1.0 cannot carry.
fn xml_escape(value: &str) -> String {
    html_escape(value)
        .chars()
        .filter(|ch| !ch.is_control() || matches!(ch, '\t' | '\n' | '\r'))
        .collect()
}
