//! Inclusion policy. Every decision is recomputed from the registries loaded for the
//! current run, so edits to either registry apply to the next run without a re-crawl.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use crate::api::WikiReadApi;
use crate::config::{MirrorConfig, RegistryPaths};
use crate::error::{FetchError, RunError};
use crate::persist::write_atomic;

pub const NS_MAIN: i32 = 0;
pub const NS_TALK: i32 = 1;
pub const NS_USER: i32 = 2;
pub const NS_USER_TALK: i32 = 3;
pub const NS_FILE: i32 = 6;
pub const NS_MEDIAWIKI: i32 = 8;
pub const NS_TEMPLATE: i32 = 10;
pub const NS_CATEGORY: i32 = 14;
pub const NS_MODULE: i32 = 828;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterReason {
    NamespaceExcluded,
    PrivacyExcluded,
    OptedIn,
    Allowed,
}

impl FilterReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NamespaceExcluded => "NAMESPACE_EXCLUDED",
            Self::PrivacyExcluded => "PRIVACY_EXCLUDED",
            Self::OptedIn => "OPTED_IN",
            Self::Allowed => "ALLOWED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FilterDecision {
    pub include: bool,
    pub reason: FilterReason,
}

impl FilterDecision {
    fn excluded(reason: FilterReason) -> Self {
        Self {
            include: false,
            reason,
        }
    }

    fn included(reason: FilterReason) -> Self {
        Self {
            include: true,
            reason,
        }
    }
}

/// What is known about a page's content when the decision is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentSignature {
    pub uses_profile_template: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyData {
    pub excluded_namespaces: BTreeSet<i32>,
    pub profile_templates: BTreeSet<String>,
    pub opted_in: BTreeSet<String>,
    pub excluded: BTreeSet<String>,
}

impl PolicyData {
    /// Load both registries. A missing or unreadable registry is fatal: without it the
    /// privacy rule cannot be evaluated.
    pub fn load(config: &MirrorConfig, registries: &RegistryPaths) -> Result<Self, RunError> {
        Ok(Self {
            excluded_namespaces: config.excluded_namespaces(),
            profile_templates: config
                .profile_templates()
                .iter()
                .map(|title| normalize_title(title))
                .collect(),
            opted_in: load_registry(&registries.opted_in)?,
            excluded: load_registry(&registries.excluded)?,
        })
    }

    pub fn is_opted_in(&self, title: &str) -> bool {
        self.opted_in.contains(&normalize_title(title))
    }

    /// Signature known before fetching: only the excluded-titles registry.
    pub fn registry_signature(&self, title: &str) -> ContentSignature {
        ContentSignature {
            uses_profile_template: self.excluded.contains(&normalize_title(title)),
        }
    }

    /// Signature after fetching: registry membership or an actual profile transclusion.
    pub fn content_signature(&self, title: &str, templates: &[String]) -> ContentSignature {
        let transcludes = templates
            .iter()
            .any(|template| self.profile_templates.contains(&normalize_title(template)));
        ContentSignature {
            uses_profile_template: transcludes
                || self.registry_signature(title).uses_profile_template,
        }
    }
}

/// Namespace exclusion is checked first and cannot be overridden by opting in.
pub fn decide(
    title: &str,
    namespace: i32,
    signature: ContentSignature,
    policy: &PolicyData,
) -> FilterDecision {
    if policy.excluded_namespaces.contains(&namespace) {
        return FilterDecision::excluded(FilterReason::NamespaceExcluded);
    }
    let opted_in = policy.is_opted_in(title);
    if signature.uses_profile_template && !is_template_family(namespace) && !opted_in {
        return FilterDecision::excluded(FilterReason::PrivacyExcluded);
    }
    if opted_in {
        return FilterDecision::included(FilterReason::OptedIn);
    }
    FilterDecision::included(FilterReason::Allowed)
}

/// Template definitions and their documentation transclude the profile template
/// without describing anyone, so the privacy rule does not apply to them.
pub fn is_template_family(namespace: i32) -> bool {
    matches!(namespace, NS_MEDIAWIKI | NS_TEMPLATE | NS_MODULE)
}

pub fn normalize_title(title: &str) -> String {
    title.replace('_', " ").trim().to_string()
}

fn load_registry(path: &Path) -> Result<BTreeSet<String>, RunError> {
    let missing = |reason: String| RunError::PolicyDataMissing {
        path: path.to_path_buf(),
        reason,
    };
    let content = fs::read_to_string(path).map_err(|error| missing(error.to_string()))?;
    let titles: Vec<String> =
        serde_json::from_str(&content).map_err(|error| missing(error.to_string()))?;
    Ok(titles
        .iter()
        .map(|title| normalize_title(title))
        .filter(|title| !title.is_empty())
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryRefreshReport {
    pub templates: Vec<String>,
    pub excluded_titles: usize,
    pub previous_titles: Option<usize>,
}

/// Rewrite the excluded-titles registry from the pages that currently transclude a
/// profile template.
pub fn refresh_excluded_registry<A: WikiReadApi + ?Sized>(
    api: &A,
    templates: &[String],
    path: &Path,
) -> Result<RegistryRefreshReport, RunError> {
    let previous_titles = load_registry(path).ok().map(|titles| titles.len());
    let mut titles = BTreeSet::new();
    for template in templates {
        let embedded = api.list_embedded_in(template).map_err(|error| match error {
            FetchError::Cancelled => RunError::Cancelled,
            other => RunError::Listing(other),
        })?;
        titles.extend(embedded.iter().map(|title| normalize_title(title)));
    }
    let rendered = serde_json::to_string_pretty(&titles.iter().collect::<Vec<_>>())
        .context("failed to serialize excluded registry")
        .map_err(RunError::Persistence)?;
    write_atomic(path, format!("{rendered}\n").as_bytes()).map_err(RunError::Persistence)?;
    Ok(RegistryRefreshReport {
        templates: templates.to_vec(),
        excluded_titles: titles.len(),
        previous_titles,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::fs;

    use tempfile::tempdir;

    use super::{
        ContentSignature, FilterReason, NS_MAIN, NS_TALK, NS_TEMPLATE, NS_USER, NS_USER_TALK,
        PolicyData, decide, load_registry,
    };
    use crate::config::{MirrorConfig, RegistryPaths, load_config};
    use crate::error::RunError;

    fn policy(opted_in: &[&str], excluded: &[&str]) -> PolicyData {
        PolicyData {
            excluded_namespaces: BTreeSet::from([NS_TALK, NS_USER, NS_USER_TALK]),
            profile_templates: BTreeSet::from(["Template:Characterprofile".to_string()]),
            opted_in: opted_in.iter().map(ToString::to_string).collect(),
            excluded: excluded.iter().map(ToString::to_string).collect(),
        }
    }

    const PROFILE: ContentSignature = ContentSignature {
        uses_profile_template: true,
    };
    const PLAIN: ContentSignature = ContentSignature {
        uses_profile_template: false,
    };

    #[test]
    fn user_talk_pages_are_always_excluded() {
        let policy = policy(&["User talk:Alice"], &[]);
        for signature in [PROFILE, PLAIN] {
            let decision = decide("User talk:Alice", NS_USER_TALK, signature, &policy);
            assert!(!decision.include);
            assert_eq!(decision.reason, FilterReason::NamespaceExcluded);
        }
    }

    #[test]
    fn opted_in_profile_page_is_included() {
        let policy = policy(&["Alice"], &["Alice"]);
        let decision = decide("Alice", NS_MAIN, PROFILE, &policy);
        assert!(decision.include);
        assert_eq!(decision.reason, FilterReason::OptedIn);
    }

    #[test]
    fn profile_page_without_opt_in_is_privacy_excluded() {
        let policy = policy(&[], &[]);
        let decision = decide("Bob", NS_MAIN, PROFILE, &policy);
        assert!(!decision.include);
        assert_eq!(decision.reason, FilterReason::PrivacyExcluded);
    }

    #[test]
    fn opted_in_plain_page_reports_opt_in() {
        let policy = policy(&["Carol"], &[]);
        assert_eq!(
            decide("Carol", NS_MAIN, PLAIN, &policy).reason,
            FilterReason::OptedIn
        );
        assert_eq!(
            decide("Dave", NS_MAIN, PLAIN, &policy).reason,
            FilterReason::Allowed
        );
    }

    #[test]
    fn template_pages_are_exempt_from_the_privacy_rule() {
        let policy = policy(&[], &["Template:Characterprofile/doc"]);
        let signature = policy.registry_signature("Template:Characterprofile/doc");
        assert!(signature.uses_profile_template);
        let decision = decide("Template:Characterprofile/doc", NS_TEMPLATE, signature, &policy);
        assert!(decision.include);
        assert_eq!(decision.reason, FilterReason::Allowed);
    }

    #[test]
    fn content_signature_detects_transclusion_and_registry() {
        let policy = policy(&[], &["Listed_Person"]);
        assert!(
            policy
                .content_signature("Eve", &["Template:Characterprofile".to_string()])
                .uses_profile_template
        );
        assert!(
            policy
                .registry_signature("Listed Person")
                .uses_profile_template
        );
        assert!(
            !policy
                .content_signature("Eve", &["Template:Nav".to_string()])
                .uses_profile_template
        );
    }

    #[test]
    fn missing_registry_is_policy_data_missing() {
        let temp = tempdir().expect("tempdir");
        let registries = RegistryPaths {
            opted_in: temp.path().join("opted_in.json"),
            excluded: temp.path().join("excluded.json"),
        };
        fs::write(&registries.excluded, "[]").expect("write excluded");
        let error = PolicyData::load(&MirrorConfig::default(), &registries).expect_err("missing");
        assert!(matches!(error, RunError::PolicyDataMissing { .. }));
    }

    #[test]
    fn unparseable_registry_is_policy_data_missing() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("opted_in.json");
        fs::write(&path, "{\"Alice\": true}").expect("write");
        assert!(matches!(
            load_registry(&path),
            Err(RunError::PolicyDataMissing { .. })
        ));
    }

    #[test]
    fn registries_normalize_underscores() {
        let temp = tempdir().expect("tempdir");
        let registries = RegistryPaths {
            opted_in: temp.path().join("opted_in.json"),
            excluded: temp.path().join("excluded.json"),
        };
        fs::write(&registries.opted_in, "[\"Alice_Smith\", \"  \"]").expect("write");
        fs::write(&registries.excluded, "[]").expect("write");
        let policy = PolicyData::load(&MirrorConfig::default(), &registries).expect("load");
        assert!(policy.is_opted_in("Alice Smith"));
        assert_eq!(policy.opted_in.len(), 1);
        assert!(policy.excluded_namespaces.contains(&NS_USER));
    }

    #[test]
    fn empty_namespace_override_still_excludes_user_talk() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[policy]\nexcluded_namespaces = []\n").expect("write");
        let registries = RegistryPaths {
            opted_in: temp.path().join("opted_in.json"),
            excluded: temp.path().join("excluded.json"),
        };
        fs::write(&registries.opted_in, "[\"Alice\"]").expect("write");
        fs::write(&registries.excluded, "[]").expect("write");

        let config = load_config(&config_path).expect("load config");
        let policy = PolicyData::load(&config, &registries).expect("load");
        for namespace in [NS_TALK, NS_USER, NS_USER_TALK] {
            let decision = decide("User talk:Alice", namespace, PLAIN, &policy);
            assert!(!decision.include);
            assert_eq!(decision.reason, FilterReason::NamespaceExcluded);
        }
    }
}
