//! Keyword extraction: direct field lookup or AI title translation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::dispatch::{StageAction, Task};
use crate::error::TaskError;
use crate::session::{Session, WaitCondition};
use crate::stages::{KeywordEntry, PageTimings};
use crate::translate::Translator;

/// Value reported when a listing lacks the requested field.
pub const NOT_FOUND: &str = "Not found";

const SENTINELS: [&str; 4] = ["not found", "see description", "unknown", "not specified"];
const SKIPPED_VALUES: [&str; 2] = ["Not Specified", "Not Applicable"];

const FIELD_CONTAINER: &str = "dl.ux-labels-values";
const FIELD_LABEL: &str = "dt .ux-textspans";
const FIELD_VALUE: &str = "dd .ux-textspans";
const TITLE_SELECTOR: &str = "h1.x-item-title__mainTitle > span.ux-textspans.ux-textspans--BOLD";

// ── Direct mode ─────────────────────────────────────────────────────

/// Reads one named item-specific field from a listing page.
pub struct FieldLookupAction {
    field: String,
    timings: PageTimings,
}

impl FieldLookupAction {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.trim().to_lowercase(),
            timings: PageTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: PageTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Value of the field among label/value rows, or [`NOT_FOUND`].
    fn pick(&self, rows: &[Vec<String>]) -> String {
        let mut fields: HashMap<String, &str> = HashMap::new();
        for row in rows {
            let (Some(label), Some(value)) = (row.first(), row.get(1)) else {
                continue;
            };
            if label.is_empty() || SKIPPED_VALUES.contains(&value.as_str()) {
                continue;
            }
            fields.insert(label.to_lowercase(), value);
        }
        fields
            .get(&self.field)
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
            .unwrap_or_else(|| NOT_FOUND.to_string())
    }
}

#[async_trait]
impl StageAction for FieldLookupAction {
    type Payload = String;
    type Output = String;

    fn name(&self) -> &str {
        "field-lookup"
    }

    async fn execute(
        &self,
        session: &mut dyn Session,
        task: &Task<String>,
    ) -> Result<String, TaskError> {
        session
            .navigate(&task.payload, WaitCondition::DomContentLoaded, self.timings.navigation)
            .await?;
        let rows = session
            .read_fields(FIELD_CONTAINER, &[FIELD_LABEL, FIELD_VALUE])
            .await?;
        let value = self.pick(&rows);
        debug!(index = task.original_index, field = %self.field, value = %value, "Read item field");
        Ok(value)
    }
}

// ── AI mode ─────────────────────────────────────────────────────────

/// Reads a listing's title.
pub struct TitleAction {
    timings: PageTimings,
}

impl TitleAction {
    pub fn new(timings: PageTimings) -> Self {
        Self { timings }
    }
}

#[async_trait]
impl StageAction for TitleAction {
    type Payload = String;
    type Output = String;

    fn name(&self) -> &str {
        "title"
    }

    async fn execute(
        &self,
        session: &mut dyn Session,
        task: &Task<String>,
    ) -> Result<String, TaskError> {
        session
            .navigate(&task.payload, WaitCondition::DomContentLoaded, self.timings.navigation)
            .await?;
        session.wait_for(TITLE_SELECTOR, self.timings.element).await?;
        match session.read_text(TITLE_SELECTOR).await? {
            Some(title) if !title.is_empty() => Ok(title),
            _ => Err(TaskError::Transient(format!("empty title at {}", task.payload))),
        }
    }
}

/// A native keyword and its English rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub native: String,
    pub english: String,
}

/// Extracts a native keyword from a title, then translates it.
///
/// Runs on detached sessions; the session is never touched.
pub struct TranslateAction {
    translator: Arc<dyn Translator>,
    pacing: Duration,
}

impl TranslateAction {
    /// `pacing` separates the two translator calls.
    pub fn new(translator: Arc<dyn Translator>, pacing: Duration) -> Self {
        Self { translator, pacing }
    }
}

#[async_trait]
impl StageAction for TranslateAction {
    type Payload = String;
    type Output = Translation;

    fn name(&self) -> &str {
        "translate"
    }

    async fn execute(
        &self,
        _session: &mut dyn Session,
        task: &Task<String>,
    ) -> Result<Translation, TaskError> {
        let native = self.translator.extract_native_keyword(&task.payload).await?;
        tokio::time::sleep(self.pacing).await;
        let english = self.translator.translate(&native).await?;
        debug!(
            index = task.original_index,
            native = %native,
            english = %english,
            "Translated title"
        );
        Ok(Translation { native, english })
    }
}

// ── Filtering ───────────────────────────────────────────────────────

/// Drops sentinel and blacklisted keywords and collapses case duplicates.
#[derive(Debug, Clone, Default)]
pub struct KeywordFilter {
    blacklist: HashSet<String>,
}

impl KeywordFilter {
    pub fn new<I, S>(blacklist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            blacklist: blacklist
                .into_iter()
                .map(|term| term.as_ref().trim().to_lowercase())
                .filter(|term| !term.is_empty())
                .collect(),
        }
    }

    pub fn accepts(&self, value: &str) -> bool {
        let normalized = value.trim().to_lowercase();
        !normalized.is_empty()
            && !SENTINELS.contains(&normalized.as_str())
            && !self.blacklist.contains(&normalized)
    }

    /// Direct mode: one entry per accepted, case-distinct field value.
    ///
    /// `values` and `links` are both keyed by the link's index; the first
    /// index carrying a value wins.
    pub fn direct_entries(
        &self,
        values: &BTreeMap<usize, String>,
        links: &[String],
    ) -> Vec<KeywordEntry> {
        let accepted = values.iter().filter(|(_, v)| self.accepts(v));
        let entries: Vec<KeywordEntry> = unique_by_lowercase(accepted, |(_, v)| v.as_str())
            .into_iter()
            .map(|(index, value)| KeywordEntry {
                keyword: value.trim().to_string(),
                native_keyword: value.trim().to_string(),
                listing_link: links.get(*index).cloned().unwrap_or_default(),
            })
            .collect();
        info!(values = values.len(), kept = entries.len(), "Filtered field values");
        entries
    }

    /// AI mode: one entry per accepted, case-distinct translation.
    ///
    /// `translations` is keyed by the title's index in `titles`.
    pub fn translated_entries(
        &self,
        translations: &BTreeMap<usize, Translation>,
        titles: &[(String, String)],
    ) -> Vec<KeywordEntry> {
        let accepted = translations.iter().filter(|(_, t)| self.accepts(&t.english));
        let entries: Vec<KeywordEntry> = unique_by_lowercase(accepted, |(_, t)| t.english.as_str())
            .into_iter()
            .map(|(index, t)| KeywordEntry {
                keyword: t.english.trim().to_string(),
                native_keyword: t.native.trim().to_string(),
                listing_link: titles.get(*index).map(|(_, link)| link.clone()).unwrap_or_default(),
            })
            .collect();
        info!(translations = translations.len(), kept = entries.len(), "Filtered translations");
        entries
    }
}

/// Titles paired with their listing link, deduplicated ignoring case.
///
/// `titles` is keyed by the link's index in `links`.
pub fn unique_titles(titles: &BTreeMap<usize, String>, links: &[String]) -> Vec<(String, String)> {
    unique_by_lowercase(titles.iter(), |(_, title)| title.as_str())
        .into_iter()
        .map(|(index, title)| (title.clone(), links.get(*index).cloned().unwrap_or_default()))
        .collect()
}

/// Keep the first item for each lower-cased, trimmed key.
fn unique_by_lowercase<T>(items: impl IntoIterator<Item = T>, key: impl Fn(&T) -> &str) -> Vec<T> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(key(item).trim().to_lowercase()))
        .collect()
}
