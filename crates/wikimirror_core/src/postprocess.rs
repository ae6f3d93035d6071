//! Offline fix-up for mirrored HTML trees. A processed document carries a marker meta
//! tag and is skipped on later passes, so running twice changes nothing.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use regex::{Captures, Regex};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::codec::{filename_to_href, percent_decode_url, title_to_filename};
use crate::config::MirrorConfig;
use crate::persist::{html_escape, write_atomic};

pub const PROCESSED_MARKER_NAME: &str = "wikimirror-processed";

const ASSET_PREFIXES: &[&str] = &["images/", "resources/", "skins/", "extensions/"];

const OFFLINE_CSS: &str = r#"body { margin: 0; padding: 0; font-family: sans-serif; background: #f6f6f6; }
#content { margin: 0 0 0 10em; padding: 1em 1.5em; background: white; border: 1px solid #a7d7f9; border-right: none; min-height: 100vh; }
#mw-panel, #mw-navigation { position: fixed; top: 0; left: 0; width: 10em; height: 100%; background: #f6f6f6; padding: 1em 0.5em; overflow-y: auto; font-size: 0.85em; z-index: 100; }
#mw-panel .portal h3 { font-size: 0.9em; font-weight: bold; margin: 0 0 0.5em 0; padding: 0.25em; background: #e0e0e0; }
#mw-panel .portal .body ul { list-style: none; padding: 0; margin: 0; }
#mw-panel a, #mw-content-text a { color: #0645ad; text-decoration: none; }
#mw-content-text a.new { color: #d33; }
#mw-head, #mw-head-base, #mw-page-base, #ca-edit, #ca-viewsource, #ca-history, #ca-watch,
#ca-unwatch, #pt-login, #pt-createaccount, .mw-editsection, .noprint { display: none !important; }
#firstHeading { font-size: 1.8em; margin: 0 0 0.5em 0; padding-bottom: 0.2em; border-bottom: 1px solid #a7d7f9; }
#mw-content-text { line-height: 1.6; }
table { border-collapse: collapse; }
.wikitable { background: white; border: 1px solid #a2a9b1; margin: 1em 0; }
.wikitable th, .wikitable td { border: 1px solid #a2a9b1; padding: 0.4em 0.6em; }
.wikitable th { background: #eaecf0; }
.infobox { float: right; clear: right; margin: 0 0 1em 1em; padding: 0.5em; background: #f8f9fa; border: 1px solid #a2a9b1; font-size: 0.9em; width: 22em; }
#toc, .toc { background: #f8f9fa; border: 1px solid #a2a9b1; padding: 0.5em 1em; display: inline-block; margin: 1em 0; }
.thumb { margin: 0.5em; background: #f8f9fa; border: 1px solid #c8ccd1; padding: 3px; }
#catlinks { margin-top: 2em; padding: 0.5em; background: #f8f9fa; border: 1px solid #a2a9b1; font-size: 0.9em; }
#footer { margin-left: 10em; padding: 1em; background: #f6f6f6; border-top: 1px solid #a7d7f9; font-size: 0.8em; color: #555; }
@media (max-width: 800px) {
  #mw-panel, #mw-navigation { position: relative; width: 100%; height: auto; }
  #content, #footer { margin-left: 0; }
}
#archive-notice { position: fixed; top: 0; left: 0; right: 0; background: linear-gradient(135deg, #1a1a2e 0%, #16213e 100%); color: white; padding: 8px; text-align: center; font-size: 13px; z-index: 1000; border-bottom: 2px solid #e94560; }
#archive-notice strong { color: #e94560; }
#archive-notice a { color: #7dd3fc; margin-left: 10px; }
body { padding-top: 40px; }
#mw-panel { top: 40px; }
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostprocessOptions {
    pub wiki_name: String,
    pub live_url: Option<String>,
    pub captured_at: DateTime<Utc>,
    /// Path prefix of article URLs on the live wiki, e.g. `/` or `/wiki/`.
    pub article_prefix: String,
}

impl PostprocessOptions {
    pub fn from_config(config: &MirrorConfig, captured_at: DateTime<Utc>) -> Self {
        Self {
            wiki_name: config.wiki_name(),
            live_url: config.live_url(),
            captured_at,
            article_prefix: article_prefix(config.article_path()),
        }
    }

    fn live_link(&self, path: &str) -> Option<String> {
        self.live_url
            .as_deref()
            .map(|base| format!("{}{path}", base.trim_end_matches('/')))
    }
}

/// `/wiki/$1` becomes `/wiki/`.
pub fn article_prefix(article_path: &str) -> String {
    let prefix = article_path
        .split("$1")
        .next()
        .unwrap_or("/")
        .trim();
    if prefix.starts_with('/') {
        prefix.to_string()
    } else {
        format!("/{prefix}")
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PostprocessReport {
    pub scanned: usize,
    pub processed: usize,
    pub already_processed: usize,
    pub failed: usize,
    pub failed_paths: Vec<String>,
}

/// Where a document sits inside the tree being processed.
struct DocumentLocation<'a> {
    root: &'a Path,
    dir: &'a Path,
    depth: usize,
}

struct Rewriter {
    marker: Regex,
    link_tag: Regex,
    loader_script: Regex,
    head_open: Regex,
    body_open: Regex,
    href: Regex,
    root_src: Regex,
    rel_stylesheet: Regex,
    href_attr: Regex,
}

impl Rewriter {
    fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).with_context(|| format!("invalid rewrite pattern {pattern}"))
        };
        Ok(Self {
            marker: compile(&format!(r#"<meta name="{PROCESSED_MARKER_NAME}""#))?,
            link_tag: compile(r"(?i)<link\b[^>]*>")?,
            loader_script: compile(
                r#"(?is)<script\b[^>]*\bsrc="[^"]*load\.php[^"]*"[^>]*>\s*</script>"#,
            )?,
            head_open: compile(r"(?i)<head\b[^>]*>")?,
            body_open: compile(r"(?i)<body\b[^>]*>")?,
            href: compile(r#"\bhref="([^"]*)""#)?,
            root_src: compile(r#"\bsrc="(/[^/"][^"]*)""#)?,
            rel_stylesheet: compile(r#"(?i)\brel="[^"]*\bstylesheet\b[^"]*""#)?,
            href_attr: compile(r#"(?i)\bhref="([^"]*)""#)?,
        })
    }

    /// `None` when the document already carries the processed marker.
    fn rewrite(
        &self,
        html: &str,
        location: &DocumentLocation<'_>,
        options: &PostprocessOptions,
    ) -> Option<String> {
        if self.marker.is_match(html) {
            return None;
        }

        let without_loaders = self.loader_script.replace_all(html, "");
        let with_styles = self
            .link_tag
            .replace_all(&without_loaders, |caps: &Captures<'_>| {
                self.rewrite_link_tag(&caps[0], location)
            })
            .into_owned();
        let with_links = self
            .href
            .replace_all(&with_styles, |caps: &Captures<'_>| {
                match rewrite_href(&caps[1], location.depth, options) {
                    Some(href) => format!("href=\"{href}\""),
                    None => caps[0].to_string(),
                }
            })
            .into_owned();
        let with_sources = self
            .root_src
            .replace_all(&with_links, |caps: &Captures<'_>| {
                match options.live_link(&caps[1]) {
                    Some(absolute) => format!("src=\"{absolute}\""),
                    None => caps[0].to_string(),
                }
            })
            .into_owned();

        let head_block = format!(
            "\n<meta name=\"{PROCESSED_MARKER_NAME}\" content=\"{}\">\n<style id=\"wikimirror-offline\">\n/* {} offline archive */\n{OFFLINE_CSS}</style>\n",
            options.captured_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            html_escape(&options.wiki_name),
        );
        let with_head = insert_after(&self.head_open, &with_sources, &head_block)
            .unwrap_or_else(|| format!("{head_block}{with_sources}"));
        let banner = render_banner(options);
        Some(
            insert_after(&self.body_open, &with_head, &banner)
                .unwrap_or_else(|| format!("{with_head}{banner}")),
        )
    }

    fn rewrite_link_tag(&self, tag: &str, location: &DocumentLocation<'_>) -> String {
        let Some(href) = self.href_attr.captures(tag).map(|caps| caps[1].to_string()) else {
            return tag.to_string();
        };
        if self.rel_stylesheet.is_match(tag)
            && let Some(path) = local_asset(&href, location)
        {
            match fs::read_to_string(&path) {
                Ok(css) => {
                    debug!("inlined {}", path.display());
                    return format!(
                        "<style data-inlined-from=\"{}\">\n{}\n</style>",
                        html_escape(&href),
                        css.replace("</style", "<\\/style")
                    );
                }
                Err(error) => warn!("failed to read stylesheet {}: {error}", path.display()),
            }
        }
        if href.contains("load.php") {
            return String::new();
        }
        tag.to_string()
    }
}

fn insert_after(pattern: &Regex, html: &str, insertion: &str) -> Option<String> {
    let found = pattern.find(html)?;
    let mut out = String::with_capacity(html.len() + insertion.len());
    out.push_str(&html[..found.end()]);
    out.push_str(insertion);
    out.push_str(&html[found.end()..]);
    Some(out)
}

fn render_banner(options: &PostprocessOptions) -> String {
    let captured = options.captured_at.format("%Y-%m-%d %H:%M");
    let live = options
        .live_url
        .as_deref()
        .map(|url| {
            format!(
                "\n<a href=\"{}\" target=\"_blank\">View live wiki &rarr;</a>",
                html_escape(url)
            )
        })
        .unwrap_or_default();
    format!(
        "\n<div id=\"archive-notice\">\n<strong>ARCHIVED SNAPSHOT</strong> - Static snapshot of {} for offline viewing. Captured: {captured} UTC{live}\n</div>\n",
        html_escape(&options.wiki_name)
    )
}

/// Rewrite one `href` value. `None` keeps the original attribute.
fn rewrite_href(href: &str, depth: usize, options: &PostprocessOptions) -> Option<String> {
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let path = match strip_live_origin(href, options) {
        Some(path) => path,
        None if href.starts_with('/') && !href.starts_with("//") => href.to_string(),
        // Relative links were already resolved by the mirroring tool; other hosts stay.
        None => return None,
    };

    let (path_part, fragment) = match path.split_once('#') {
        Some((path_part, fragment)) => (path_part.to_string(), format!("#{fragment}")),
        None => (path.clone(), String::new()),
    };
    let live_target = || options.live_link(&path);
    if path_part.contains("api.php") || path_part.contains("index.php") || path_part.contains('?') {
        return live_target();
    }
    let relative = path_part.trim_start_matches('/');
    if ASSET_PREFIXES
        .iter()
        .any(|prefix| relative.starts_with(prefix))
    {
        return live_target();
    }
    let article = path_part.strip_prefix(options.article_prefix.as_str())?;
    if article.is_empty() {
        return None;
    }
    let title = percent_decode_url(article).replace('_', " ");
    if title.starts_with("Special:") {
        return live_target();
    }
    Some(format!(
        "{}{}{fragment}",
        "../".repeat(depth),
        filename_to_href(&title_to_filename(&title))
    ))
}

/// Path of an absolute link into the live wiki, if it is one.
fn strip_live_origin(href: &str, options: &PostprocessOptions) -> Option<String> {
    let live = options.live_url.as_deref()?.trim_end_matches('/');
    let origin_free = |url: &str| {
        url.split_once("://")
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_else(|| url.trim_start_matches("//").to_string())
    };
    let live_host = origin_free(live);
    let candidate = origin_free(href);
    if !(href.contains("://") || href.starts_with("//")) {
        return None;
    }
    let rest = candidate.strip_prefix(&live_host)?;
    if rest.is_empty() {
        return Some("/".to_string());
    }
    rest.starts_with('/').then(|| rest.to_string())
}

/// Resolve a stylesheet reference to a file inside the tree.
fn local_asset(href: &str, location: &DocumentLocation<'_>) -> Option<PathBuf> {
    if href.contains("://") || href.starts_with("//") || href.starts_with("data:") {
        return None;
    }
    let without_fragment = href.split('#').next().unwrap_or(href);
    let decoded = percent_decode_url(without_fragment);
    let mut candidates = vec![decoded.clone()];
    if let Some((path, _)) = decoded.split_once('?') {
        candidates.push(path.to_string());
    }
    let root = fs::canonicalize(location.root).ok()?;
    candidates.into_iter().find_map(|candidate| {
        let joined = match candidate.strip_prefix('/') {
            Some(from_root) => location.root.join(from_root),
            None => location.dir.join(&candidate),
        };
        let resolved = fs::canonicalize(&joined).ok()?;
        (resolved.starts_with(&root) && resolved.is_file()).then_some(resolved)
    })
}

pub fn postprocess_tree(root: &Path, options: &PostprocessOptions) -> Result<PostprocessReport> {
    if !root.is_dir() {
        bail!("not a directory: {}", root.display());
    }
    let rewriter = Rewriter::new()?;
    let mut documents = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        let path = entry.path();
        if entry.file_type().is_file()
            && path
                .extension()
                .and_then(|value| value.to_str())
                .is_some_and(|value| {
                    value.eq_ignore_ascii_case("html") || value.eq_ignore_ascii_case("htm")
                })
        {
            documents.push(path.to_path_buf());
        }
    }
    documents.sort();
    info!("post-processing {} document(s) under {}", documents.len(), root.display());

    let mut report = PostprocessReport::default();
    for path in documents {
        report.scanned += 1;
        match process_file(&rewriter, root, &path, options) {
            Ok(true) => report.processed += 1,
            Ok(false) => report.already_processed += 1,
            Err(error) => {
                warn!("failed to post-process {}: {error:#}", path.display());
                report.failed += 1;
                report.failed_paths.push(path.display().to_string());
            }
        }
    }
    info!(
        "post-processing done: processed={} already_processed={} failed={}",
        report.processed, report.already_processed, report.failed
    );
    Ok(report)
}

fn process_file(
    rewriter: &Rewriter,
    root: &Path,
    path: &Path,
    options: &PostprocessOptions,
) -> Result<bool> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let html = String::from_utf8_lossy(&bytes);
    let dir = path.parent().unwrap_or(root);
    let location = DocumentLocation {
        root,
        dir,
        depth: depth_below(root, dir),
    };
    let Some(rewritten) = rewriter.rewrite(&html, &location, options) else {
        return Ok(false);
    };
    if rewritten.as_bytes() != bytes.as_slice() {
        write_atomic(path, rewritten.as_bytes())?;
    }
    Ok(true)
}

fn depth_below(root: &Path, dir: &Path) -> usize {
    dir.strip_prefix(root)
        .map(|relative| {
            relative
                .components()
                .filter(|component| matches!(component, Component::Normal(_)))
                .count()
        })
        .unwrap_or(0)
}
