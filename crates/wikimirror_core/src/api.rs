use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::MirrorConfig;
use crate::error::FetchError;
use crate::ratelimit::RateLimiter;
use crate::shutdown::ShutdownSignal;
use crate::transport::{HttpResponse, HttpTransport, ReqwestTransport, TransportError};

const MAX_THROTTLE_DELAY: Duration = Duration::from_secs(300);
pub const MAX_LIST_LIMIT: usize = 500;

/// Identity of one wiki page as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageHandle {
    pub title: String,
    pub namespace: i32,
    pub page_id: i64,
    pub last_revision_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentFormat {
    Wikitext,
    Html,
}

/// Fetched payload for one page revision. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionContent {
    pub page_id: i64,
    pub title: String,
    pub namespace: i32,
    pub revision_id: i64,
    pub timestamp: DateTime<Utc>,
    pub content_model: String,
    pub format: ContentFormat,
    pub body: String,
    pub templates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageHandle {
    pub page_id: i64,
    pub title: String,
    pub url: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ImageHandle {
    /// File name without the `File:` prefix.
    pub fn file_name(&self) -> &str {
        self.title
            .split_once(':')
            .map(|(_, name)| name)
            .unwrap_or(&self.title)
    }
}

/// Opaque pagination cursor: the serialized `continue` object of the last response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    fn from_continue(map: Map<String, Value>) -> Self {
        Self(Value::Object(map).to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn params(&self) -> Result<Vec<(String, String)>, FetchError> {
        let parsed: Map<String, Value> = serde_json::from_str(&self.0).map_err(|error| {
            FetchError::permanent(format!("unreadable continuation token: {error}"))
        })?;
        Ok(parsed
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageListQuery {
    pub namespace: Option<i32>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPage {
    pub pages: Vec<PageHandle>,
    pub next: Option<ContinuationToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageListPage {
    pub images: Vec<ImageHandle>,
    pub next: Option<ContinuationToken>,
}

/// Read side of the source wiki. Implementations are shared by the fetch workers.
pub trait WikiReadApi: Send + Sync {
    fn namespaces(&self) -> Result<Vec<i32>, FetchError>;
    fn fetch_page_list(
        &self,
        query: &PageListQuery,
        token: Option<&ContinuationToken>,
    ) -> Result<ListPage, FetchError>;
    fn list_embedded_in(&self, template: &str) -> Result<Vec<String>, FetchError>;
    fn fetch_content(&self, page_id: i64, format: ContentFormat)
    -> Result<RevisionContent, FetchError>;
    fn list_images(
        &self,
        limit: usize,
        token: Option<&ContinuationToken>,
    ) -> Result<ImageListPage, FetchError>;
    fn fetch_image_bytes(&self, title: &str) -> Result<Vec<u8>, FetchError>;
    fn request_count(&self) -> usize;
}

/// Lazy, restartable walk over a paginated listing.
pub struct PageListCursor<'a, A: WikiReadApi + ?Sized> {
    api: &'a A,
    query: PageListQuery,
    next: Option<ContinuationToken>,
    finished: bool,
}

impl<'a, A: WikiReadApi + ?Sized> PageListCursor<'a, A> {
    pub fn new(api: &'a A, query: PageListQuery) -> Self {
        Self::resume(api, query, None)
    }

    /// Continue a listing from a token persisted by an earlier run.
    pub fn resume(api: &'a A, query: PageListQuery, token: Option<ContinuationToken>) -> Self {
        Self {
            api,
            query,
            next: token,
            finished: false,
        }
    }

    /// Token for the page after the last one yielded.
    pub fn resume_token(&self) -> Option<&ContinuationToken> {
        self.next.as_ref()
    }
}

impl<A: WikiReadApi + ?Sized> Iterator for PageListCursor<'_, A> {
    type Item = Result<ListPage, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.api.fetch_page_list(&self.query, self.next.as_ref()) {
            Ok(page) => {
                self.next = page.next.clone();
                self.finished = self.next.is_none();
                Some(Ok(page))
            }
            Err(error) => {
                self.finished = true;
                Some(Err(error))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
    pub max_concurrent_requests: usize,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub max_throttle_retries: usize,
    pub throttle_delay_ms: u64,
    pub bot_user: Option<String>,
    pub bot_pass: Option<String>,
}

impl MediaWikiClientConfig {
    pub fn from_config(config: &MirrorConfig) -> Self {
        Self::from_config_with_lookup(config, &|key| env::var(key).ok())
    }

    fn from_config_with_lookup<F>(config: &MirrorConfig, lookup_env: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let crawl = &config.crawl;
        Self {
            api_url: config.api_url_with(lookup_env).unwrap_or_default(),
            user_agent: config.user_agent_with(lookup_env),
            timeout_ms: env_parsed(lookup_env, "WIKI_HTTP_TIMEOUT_MS")
                .or(crawl.timeout_ms)
                .unwrap_or(30_000),
            rate_limit_ms: env_parsed(lookup_env, "WIKI_RATE_LIMIT_MS")
                .or(crawl.delay_ms)
                .unwrap_or(1_000),
            max_concurrent_requests: crawl.max_concurrent_requests.unwrap_or(2),
            max_retries: env_parsed(lookup_env, "WIKI_HTTP_RETRIES")
                .or(crawl.max_retries)
                .unwrap_or(3),
            retry_delay_ms: env_parsed(lookup_env, "WIKI_HTTP_RETRY_DELAY_MS")
                .or(crawl.retry_delay_ms)
                .unwrap_or(2_000),
            max_throttle_retries: crawl.max_throttle_retries.unwrap_or(8),
            throttle_delay_ms: crawl.throttle_delay_ms.unwrap_or(5_000),
            bot_user: lookup_env("WIKI_BOT_USER").filter(|value| !value.trim().is_empty()),
            bot_pass: lookup_env("WIKI_BOT_PASS").filter(|value| !value.is_empty()),
        }
    }
}

pub struct MediaWikiClient {
    transport: Box<dyn HttpTransport>,
    config: MediaWikiClientConfig,
    limiter: RateLimiter,
    shutdown: ShutdownSignal,
    request_count: AtomicUsize,
}

enum Failure {
    Throttled(Option<Duration>),
    Transient(String),
    Fatal(FetchError),
}

#[derive(Clone, Copy)]
enum Method {
    Get,
    Post,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig, shutdown: ShutdownSignal) -> Result<Self> {
        if config.api_url.trim().is_empty() {
            bail!("wiki API URL is not configured; set WIKI_API_URL or [wiki].api_url");
        }
        Url::parse(&config.api_url)
            .with_context(|| format!("invalid wiki API URL: {}", config.api_url))?;
        let transport = ReqwestTransport::new(
            &config.user_agent,
            Duration::from_millis(config.timeout_ms),
        )?;
        Ok(Self::with_transport(config, Box::new(transport), shutdown))
    }

    pub fn with_transport(
        config: MediaWikiClientConfig,
        transport: Box<dyn HttpTransport>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let limiter = RateLimiter::new(
            Duration::from_millis(config.rate_limit_ms),
            config.max_concurrent_requests,
            shutdown.clone(),
        );
        Self {
            transport,
            config,
            limiter,
            shutdown,
            request_count: AtomicUsize::new(0),
        }
    }

    /// Log in with the configured bot credentials, if any. Returns whether a login happened.
    pub fn login_from_config(&self) -> Result<bool, FetchError> {
        match (&self.config.bot_user, &self.config.bot_pass) {
            (Some(user), Some(pass)) => {
                self.login(user, pass)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn login(&self, username: &str, password: &str) -> Result<(), FetchError> {
        let tokens: QueryResponse = self.query(
            &[
                ("action", "query".to_string()),
                ("meta", "tokens".to_string()),
                ("type", "login".to_string()),
            ],
            None,
            "login token",
        )?;
        let login_token = tokens
            .query
            .tokens
            .and_then(|tokens| tokens.logintoken)
            .ok_or_else(|| FetchError::permanent("failed to get MediaWiki login token"))?;

        let response = self.request_json(
            Method::Post,
            &[
                ("action", "login".to_string()),
                ("lgname", username.to_string()),
                ("lgpassword", password.to_string()),
                ("lgtoken", login_token),
            ],
            "login",
        )?;
        let payload: LoginResponse = decode(response, "login")?;
        match payload.login.result.as_deref() {
            Some("Success") => Ok(()),
            other => Err(FetchError::permanent(format!(
                "MediaWiki login failed: {}",
                payload
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ))),
        }
    }

    fn query<T: DeserializeOwned>(
        &self,
        params: &[(&str, String)],
        token: Option<&ContinuationToken>,
        target: &str,
    ) -> Result<T, FetchError> {
        let mut params = params
            .iter()
            .map(|(key, value)| ((*key).to_string(), value.clone()))
            .collect::<Vec<_>>();
        if let Some(token) = token {
            params.extend(token.params()?);
        }
        let borrowed = params
            .iter()
            .map(|(key, value)| (key.as_str(), value.clone()))
            .collect::<Vec<_>>();
        let value = self.request_json(Method::Get, &borrowed, target)?;
        decode(value, target)
    }

    fn request_json(
        &self,
        method: Method,
        params: &[(&str, String)],
        target: &str,
    ) -> Result<Value, FetchError> {
        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }

        self.execute(
            || match method {
                Method::Get => self.transport.get(&self.config.api_url, &pairs),
                Method::Post => self.transport.post_form(&self.config.api_url, &pairs),
            },
            |response| decode_api_response(response, target),
        )
    }

    fn request_bytes(&self, url: &str, target: &str) -> Result<Vec<u8>, FetchError> {
        self.execute(
            || self.transport.get(url, &[]),
            |response| {
                check_status(&response, target)?;
                Ok(response.body)
            },
        )
    }

    /// Send through the rate limiter until success, a permanent failure, or an exhausted
    /// budget. Throttle backoffs and transient retries are budgeted separately.
    fn execute<T, S, D>(&self, send: S, decode: D) -> Result<T, FetchError>
    where
        S: Fn() -> Result<HttpResponse, TransportError>,
        D: Fn(HttpResponse) -> Result<T, Failure>,
    {
        let mut transient_attempts = 0usize;
        let mut throttle_retries = 0usize;
        loop {
            let outcome = {
                let _permit = self.limiter.acquire()?;
                self.request_count.fetch_add(1, Ordering::Relaxed);
                send()
            };
            let failure = match outcome {
                Ok(response) => match decode(response) {
                    Ok(value) => return Ok(value),
                    Err(failure) => failure,
                },
                Err(error) if error.is_retryable() => Failure::Transient(error.message),
                Err(error) => Failure::Fatal(FetchError::permanent(error.message)),
            };

            match failure {
                Failure::Fatal(error) => return Err(error),
                Failure::Throttled(retry_after) => {
                    if throttle_retries >= self.config.max_throttle_retries {
                        return Err(FetchError::Throttled {
                            retries: throttle_retries,
                        });
                    }
                    let delay = retry_after
                        .unwrap_or_else(|| self.throttle_delay(throttle_retries))
                        .min(MAX_THROTTLE_DELAY);
                    warn!(
                        "upstream throttled; pausing requests for {} ms",
                        delay.as_millis()
                    );
                    self.limiter.suspend(delay);
                    throttle_retries += 1;
                }
                Failure::Transient(message) => {
                    transient_attempts += 1;
                    if transient_attempts > self.config.max_retries {
                        return Err(FetchError::Transient {
                            attempts: transient_attempts,
                            message,
                        });
                    }
                    debug!("transient failure (attempt {transient_attempts}): {message}");
                    self.wait_before_retry(transient_attempts - 1)?;
                }
            }
        }
    }

    fn throttle_delay(&self, retry: usize) -> Duration {
        let exponent = u32::try_from(retry).unwrap_or(16).min(16);
        Duration::from_millis(
            self.config
                .throttle_delay_ms
                .saturating_mul(2u64.saturating_pow(exponent)),
        )
    }

    fn wait_before_retry(&self, attempt: usize) -> Result<(), FetchError> {
        let exponent = u32::try_from(attempt).unwrap_or(16).min(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis()) % (base / 4 + 1))
            .unwrap_or(0);
        self.shutdown
            .sleep(Duration::from_millis(base.saturating_add(jitter)))
    }

    fn fetch_wikitext(&self, page_id: i64) -> Result<RevisionContent, FetchError> {
        let target = format!("page id {page_id}");
        let mut token: Option<ContinuationToken> = None;
        let mut content: Option<RevisionContent> = None;
        let mut templates = BTreeSet::new();
        loop {
            let response: QueryResponse = self.query(
                &[
                    ("action", "query".to_string()),
                    ("pageids", page_id.to_string()),
                    ("prop", "revisions|templates".to_string()),
                    ("rvprop", "ids|timestamp|content|contentmodel".to_string()),
                    ("rvslots", "main".to_string()),
                    ("tllimit", "max".to_string()),
                ],
                token.as_ref(),
                &target,
            )?;
            let page = single_page(response.query.pages, &target)?;
            templates.extend(page.templates.into_iter().map(|item| item.title));
            if content.is_none()
                && let Some(revision) = page.revisions.into_iter().next()
            {
                let slot = revision.slots.and_then(|slots| slots.main);
                let content_model = slot
                    .as_ref()
                    .and_then(|slot| slot.contentmodel.clone())
                    .or(revision.contentmodel)
                    .unwrap_or_else(|| "wikitext".to_string());
                content = Some(RevisionContent {
                    page_id,
                    title: page.title,
                    namespace: page.ns,
                    revision_id: revision.revid,
                    timestamp: revision.timestamp,
                    content_model,
                    format: ContentFormat::Wikitext,
                    body: slot.map(|slot| slot.content).unwrap_or_default(),
                    templates: Vec::new(),
                });
            }
            token = response.continuation.map(ContinuationToken::from_continue);
            if token.is_none() {
                break;
            }
        }

        let mut content = content
            .ok_or_else(|| FetchError::permanent(format!("{target} returned no revision")))?;
        content.templates = templates.into_iter().collect();
        Ok(content)
    }

    fn fetch_html(&self, page_id: i64) -> Result<RevisionContent, FetchError> {
        let target = format!("page id {page_id}");
        let metadata: QueryResponse = self.query(
            &[
                ("action", "query".to_string()),
                ("pageids", page_id.to_string()),
                ("prop", "revisions".to_string()),
                ("rvprop", "ids|timestamp|contentmodel".to_string()),
            ],
            None,
            &target,
        )?;
        let page = single_page(metadata.query.pages, &target)?;
        let revision = page
            .revisions
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::permanent(format!("{target} returned no revision")))?;

        let parsed: ParseResponse = self.query(
            &[
                ("action", "parse".to_string()),
                ("oldid", revision.revid.to_string()),
                ("prop", "text|templates".to_string()),
                ("disablelimitreport", "1".to_string()),
                ("disableeditsection", "1".to_string()),
            ],
            None,
            &target,
        )?;
        Ok(RevisionContent {
            page_id,
            title: page.title,
            namespace: page.ns,
            revision_id: revision.revid,
            timestamp: revision.timestamp,
            content_model: revision
                .contentmodel
                .unwrap_or_else(|| "wikitext".to_string()),
            format: ContentFormat::Html,
            body: parsed.parse.text,
            templates: parsed
                .parse
                .templates
                .into_iter()
                .map(|item| item.title)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        })
    }

    fn resolve_media_url(&self, url: &str) -> String {
        if url.starts_with("//") {
            let scheme = self
                .config
                .api_url
                .split_once("://")
                .map(|(scheme, _)| scheme)
                .unwrap_or("https");
            return format!("{scheme}:{url}");
        }
        if url.starts_with('/')
            && let Ok(base) = Url::parse(&self.config.api_url)
            && let Ok(joined) = base.join(url)
        {
            return joined.to_string();
        }
        url.to_string()
    }
}

impl WikiReadApi for MediaWikiClient {
    fn namespaces(&self) -> Result<Vec<i32>, FetchError> {
        let response: QueryResponse = self.query(
            &[
                ("action", "query".to_string()),
                ("meta", "siteinfo".to_string()),
                ("siprop", "namespaces".to_string()),
            ],
            None,
            "siteinfo namespaces",
        )?;
        let namespaces = response
            .query
            .namespaces
            .values()
            .map(|item| item.id)
            .filter(|id| *id >= 0)
            .collect::<BTreeSet<_>>();
        if namespaces.is_empty() {
            return Err(FetchError::permanent("siteinfo returned no namespaces"));
        }
        Ok(namespaces.into_iter().collect())
    }

    fn fetch_page_list(
        &self,
        query: &PageListQuery,
        token: Option<&ContinuationToken>,
    ) -> Result<ListPage, FetchError> {
        let limit = query.limit.clamp(1, MAX_LIST_LIMIT).to_string();
        match query.since {
            None => {
                let response: QueryResponse = self.query(
                    &[
                        ("action", "query".to_string()),
                        ("generator", "allpages".to_string()),
                        ("gapnamespace", query.namespace.unwrap_or(0).to_string()),
                        ("gapfilterredir", "nonredirects".to_string()),
                        ("gaplimit", limit),
                        ("prop", "revisions".to_string()),
                        ("rvprop", "ids|timestamp".to_string()),
                    ],
                    token,
                    "page list",
                )?;
                let mut pages = response
                    .query
                    .pages
                    .into_iter()
                    .filter(|page| !page.missing && !page.invalid)
                    .filter_map(|page| {
                        Some(PageHandle {
                            page_id: page.pageid?,
                            last_revision_timestamp: page
                                .revisions
                                .first()
                                .map(|revision| revision.timestamp),
                            title: page.title,
                            namespace: page.ns,
                        })
                    })
                    .collect::<Vec<_>>();
                pages.sort_by(|left, right| left.title.cmp(&right.title));
                Ok(ListPage {
                    pages,
                    next: response.continuation.map(ContinuationToken::from_continue),
                })
            }
            Some(since) => {
                let response: QueryResponse = self.query(
                    &[
                        ("action", "query".to_string()),
                        ("list", "recentchanges".to_string()),
                        (
                            "rcstart",
                            since.to_rfc3339_opts(SecondsFormat::Secs, true),
                        ),
                        ("rcdir", "newer".to_string()),
                        (
                            "rcnamespace",
                            query
                                .namespace
                                .map(|namespace| namespace.to_string())
                                .unwrap_or_default(),
                        ),
                        ("rcprop", "title|ids|timestamp".to_string()),
                        ("rctype", "edit|new".to_string()),
                        ("rclimit", limit),
                    ],
                    token,
                    "recent changes",
                )?;
                // rcstart is inclusive; the checkpoint itself was already processed.
                let pages = response
                    .query
                    .recentchanges
                    .into_iter()
                    .filter(|change| change.pageid > 0 && change.timestamp > since)
                    .map(|change| PageHandle {
                        title: change.title,
                        namespace: change.ns,
                        page_id: change.pageid,
                        last_revision_timestamp: Some(change.timestamp),
                    })
                    .collect();
                Ok(ListPage {
                    pages,
                    next: response.continuation.map(ContinuationToken::from_continue),
                })
            }
        }
    }

    fn list_embedded_in(&self, template: &str) -> Result<Vec<String>, FetchError> {
        let mut titles = BTreeSet::new();
        let mut token: Option<ContinuationToken> = None;
        loop {
            let response: QueryResponse = self.query(
                &[
                    ("action", "query".to_string()),
                    ("list", "embeddedin".to_string()),
                    ("eititle", template.to_string()),
                    ("eilimit", MAX_LIST_LIMIT.to_string()),
                ],
                token.as_ref(),
                template,
            )?;
            titles.extend(response.query.embeddedin.into_iter().map(|item| item.title));
            token = response.continuation.map(ContinuationToken::from_continue);
            if token.is_none() {
                break;
            }
        }
        Ok(titles.into_iter().collect())
    }

    fn fetch_content(
        &self,
        page_id: i64,
        format: ContentFormat,
    ) -> Result<RevisionContent, FetchError> {
        match format {
            ContentFormat::Wikitext => self.fetch_wikitext(page_id),
            ContentFormat::Html => self.fetch_html(page_id),
        }
    }

    fn list_images(
        &self,
        limit: usize,
        token: Option<&ContinuationToken>,
    ) -> Result<ImageListPage, FetchError> {
        let response: QueryResponse = self.query(
            &[
                ("action", "query".to_string()),
                ("generator", "allimages".to_string()),
                ("gailimit", limit.clamp(1, MAX_LIST_LIMIT).to_string()),
                ("prop", "imageinfo".to_string()),
                ("iiprop", "url|timestamp".to_string()),
            ],
            token,
            "image list",
        )?;
        let mut images = response
            .query
            .pages
            .into_iter()
            .filter_map(|page| {
                let info = page.imageinfo.into_iter().next();
                Some(ImageHandle {
                    page_id: page.pageid?,
                    title: page.title,
                    url: info.as_ref().and_then(|info| info.url.clone()),
                    timestamp: info.and_then(|info| info.timestamp),
                })
            })
            .collect::<Vec<_>>();
        images.sort_by(|left, right| left.title.cmp(&right.title));
        Ok(ImageListPage {
            images,
            next: response.continuation.map(ContinuationToken::from_continue),
        })
    }

    fn fetch_image_bytes(&self, title: &str) -> Result<Vec<u8>, FetchError> {
        let response: QueryResponse = self.query(
            &[
                ("action", "query".to_string()),
                ("titles", title.to_string()),
                ("prop", "imageinfo".to_string()),
                ("iiprop", "url".to_string()),
            ],
            None,
            title,
        )?;
        let url = response
            .query
            .pages
            .into_iter()
            .next()
            .and_then(|page| page.imageinfo.into_iter().next())
            .and_then(|info| info.url)
            .ok_or_else(|| FetchError::NotFound {
                target: title.to_string(),
            })?;
        self.request_bytes(&self.resolve_media_url(&url), title)
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }
}

fn single_page(pages: Vec<PageQueryItem>, target: &str) -> Result<PageQueryItem, FetchError> {
    let page = pages.into_iter().next().ok_or_else(|| FetchError::NotFound {
        target: target.to_string(),
    })?;
    if page.missing || page.invalid {
        return Err(FetchError::NotFound {
            target: target.to_string(),
        });
    }
    Ok(page)
}

fn check_status(response: &HttpResponse, target: &str) -> Result<(), Failure> {
    if response.is_success() {
        return Ok(());
    }
    match response.status {
        429 => Err(Failure::Throttled(response.retry_after)),
        503 if response.retry_after.is_some() => Err(Failure::Throttled(response.retry_after)),
        404 => Err(Failure::Fatal(FetchError::NotFound {
            target: target.to_string(),
        })),
        408 | 500 | 502 | 503 | 504 => {
            Err(Failure::Transient(format!("HTTP {}", response.status)))
        }
        status => Err(Failure::Fatal(FetchError::permanent(format!(
            "request for {target} failed with HTTP {status}"
        )))),
    }
}

fn decode_api_response(response: HttpResponse, target: &str) -> Result<Value, Failure> {
    check_status(&response, target)?;
    let payload: Value = serde_json::from_slice(&response.body).map_err(|error| {
        Failure::Fatal(FetchError::permanent(format!(
            "malformed MediaWiki API response for {target}: {error}"
        )))
    })?;
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        return Err(match code {
            "maxlag" | "ratelimited" => Failure::Throttled(response.retry_after),
            "missingtitle" | "nosuchpageid" | "nosuchrevid" => {
                Failure::Fatal(FetchError::NotFound {
                    target: target.to_string(),
                })
            }
            _ => Failure::Fatal(FetchError::permanent(format!(
                "MediaWiki API error [{code}]: {info}"
            ))),
        });
    }
    Ok(payload)
}

fn decode<T: DeserializeOwned>(value: Value, target: &str) -> Result<T, FetchError> {
    serde_json::from_value(value).map_err(|error| {
        FetchError::permanent(format!("unexpected response schema for {target}: {error}"))
    })
}

fn env_parsed<T, F>(lookup_env: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup_env(key).and_then(|value| value.trim().parse::<T>().ok())
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    pages: Vec<PageQueryItem>,
    #[serde(default)]
    recentchanges: Vec<RecentChangeItem>,
    #[serde(default)]
    embeddedin: Vec<TitleQueryItem>,
    #[serde(default)]
    namespaces: BTreeMap<String, NamespaceItem>,
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    pageid: Option<i64>,
    #[serde(default)]
    ns: i32,
    #[serde(default)]
    title: String,
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    invalid: bool,
    #[serde(default)]
    revisions: Vec<RevisionQueryItem>,
    #[serde(default)]
    templates: Vec<TitleQueryItem>,
    #[serde(default)]
    imageinfo: Vec<ImageInfoItem>,
}

#[derive(Debug, Deserialize)]
struct RevisionQueryItem {
    revid: i64,
    timestamp: DateTime<Utc>,
    contentmodel: Option<String>,
    slots: Option<RevisionSlotContainer>,
}

#[derive(Debug, Deserialize)]
struct RevisionSlotContainer {
    main: Option<RevisionMainSlot>,
}

#[derive(Debug, Deserialize)]
struct RevisionMainSlot {
    contentmodel: Option<String>,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct RecentChangeItem {
    #[serde(default)]
    pageid: i64,
    ns: i32,
    title: String,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TitleQueryItem {
    title: String,
}

#[derive(Debug, Deserialize)]
struct NamespaceItem {
    id: i32,
}

#[derive(Debug, Deserialize)]
struct ImageInfoItem {
    url: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ParseResponse {
    parse: ParsePayload,
}

#[derive(Debug, Deserialize)]
struct ParsePayload {
    #[serde(default)]
    text: String,
    #[serde(default)]
    templates: Vec<TitleQueryItem>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}
