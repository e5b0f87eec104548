//! Scripted fakes shared by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SessionError;
use crate::identity::{Cookie, Identity};
use crate::session::{Session, SessionFactory, WaitCondition};

/// A page whose content is fixed up front.
///
/// Selectors not registered with `with_text`, `with_present`, or friends
/// fail waits immediately with `SelectorNotFound`.
#[derive(Debug, Default, Clone)]
pub struct ScriptedSession {
    texts: HashMap<String, String>,
    /// `(url prefix, selector, text)` visible only while on a matching page.
    page_texts: Vec<(String, String, String)>,
    present: HashSet<String>,
    /// Waits left before a registered selector shows up.
    late: HashMap<String, usize>,
    attributes: HashMap<(String, String), Vec<String>>,
    sequences: HashMap<(String, String), VecDeque<Option<String>>>,
    fields: HashMap<String, Vec<Vec<String>>>,
    submit_url: Option<String>,
    /// Navigations never finish; waits on them run out their timeout.
    stalled: bool,
    url: String,
    typed: String,
    cookies: Vec<Cookie>,
    pub log: Vec<String>,
    closes: Option<Arc<AtomicUsize>>,
}

impl ScriptedSession {
    pub fn with_text(mut self, selector: &str, text: &str) -> Self {
        self.present.insert(selector.to_string());
        self.texts.insert(selector.to_string(), text.to_string());
        self
    }

    /// Text shown at `selector` only while the current URL starts with `url_prefix`.
    pub fn with_text_on(mut self, url_prefix: &str, selector: &str, text: &str) -> Self {
        self.page_texts
            .push((url_prefix.to_string(), selector.to_string(), text.to_string()));
        self
    }

    /// Start on `url` instead of a blank page.
    pub fn at(mut self, url: &str) -> Self {
        self.url = url.to_string();
        self
    }

    pub fn with_present(mut self, selector: &str) -> Self {
        self.present.insert(selector.to_string());
        self
    }

    /// `selector` is present, but the first `misses` waits for it fail.
    pub fn with_late(mut self, selector: &str, misses: usize) -> Self {
        self.present.insert(selector.to_string());
        self.late.insert(selector.to_string(), misses);
        self
    }

    pub fn with_attributes(mut self, selector: &str, attribute: &str, values: &[&str]) -> Self {
        self.present.insert(selector.to_string());
        self.attributes.insert(
            (selector.to_string(), attribute.to_string()),
            values.iter().map(|v| v.to_string()).collect(),
        );
        self
    }

    pub fn with_fields(mut self, container: &str, rows: &[&[&str]]) -> Self {
        self.present.insert(container.to_string());
        self.fields.insert(
            container.to_string(),
            rows.iter()
                .map(|row| row.iter().map(|v| v.to_string()).collect())
                .collect(),
        );
        self
    }

    /// Successive values of `attribute(selector, name)`; the last one sticks.
    pub fn with_attribute_sequence(
        mut self,
        selector: &str,
        name: &str,
        values: &[Option<&str>],
    ) -> Self {
        self.present.insert(selector.to_string());
        self.sequences.insert(
            (selector.to_string(), name.to_string()),
            values.iter().map(|v| v.map(str::to_string)).collect(),
        );
        self
    }

    /// URL reached after pressing enter; `{query}` is replaced by the typed text.
    pub fn with_submit_url(mut self, template: &str) -> Self {
        self.submit_url = Some(template.to_string());
        self
    }

    pub fn with_stalled_navigation(mut self) -> Self {
        self.stalled = true;
        self
    }

    pub fn counting_closes(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.closes = Some(counter);
        self
    }

    /// Whether a wait for `selector` succeeds now; uses up one late miss.
    fn visible(&mut self, selector: &str) -> bool {
        if let Some(misses) = self.late.get_mut(selector)
            && *misses > 0
        {
            *misses -= 1;
            return false;
        }
        self.present.contains(selector)
    }

    fn require(&self, selector: &str) -> Result<(), SessionError> {
        if self.present.contains(selector) {
            Ok(())
        } else {
            Err(SessionError::SelectorNotFound(selector.to_string()))
        }
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn navigate(
        &mut self,
        url: &str,
        _: WaitCondition,
        _: Duration,
    ) -> Result<(), SessionError> {
        self.log.push(format!("navigate {url}"));
        self.url = url.to_string();
        Ok(())
    }

    async fn reload(&mut self, _: WaitCondition, _: Duration) -> Result<(), SessionError> {
        self.log.push("reload".into());
        Ok(())
    }

    async fn wait_for(&mut self, selector: &str, _: Duration) -> Result<(), SessionError> {
        if self.visible(selector) {
            Ok(())
        } else {
            Err(SessionError::SelectorNotFound(selector.to_string()))
        }
    }

    async fn wait_for_any(
        &mut self,
        selectors: &[&str],
        _: Duration,
    ) -> Result<usize, SessionError> {
        selectors
            .iter()
            .position(|s| self.visible(s))
            .ok_or_else(|| SessionError::SelectorNotFound(selectors.join(", ")))
    }

    async fn wait_for_navigation(&mut self, timeout: Duration) -> Result<(), SessionError> {
        if self.stalled {
            tokio::time::sleep(timeout).await;
            return Err(SessionError::Timeout {
                operation: "navigation".into(),
                after: timeout,
            });
        }
        Ok(())
    }

    async fn wait_for_navigation_or(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<bool, SessionError> {
        if self.visible(selector) {
            return Ok(true);
        }
        self.wait_for_navigation(timeout).await.map(|()| false)
    }

    async fn click(&mut self, selector: &str) -> Result<(), SessionError> {
        self.require(selector)?;
        self.log.push(format!("click {selector}"));
        Ok(())
    }

    async fn type_text(&mut self, selector: &str, text: &str) -> Result<(), SessionError> {
        self.require(selector)?;
        self.log.push(format!("type {selector} {text}"));
        self.typed = text.to_string();
        Ok(())
    }

    async fn press_enter(&mut self, selector: &str) -> Result<(), SessionError> {
        self.log.push(format!("enter {selector}"));
        if let Some(template) = &self.submit_url {
            self.url = template.replace("{query}", &self.typed);
        }
        Ok(())
    }

    async fn read_text(&mut self, selector: &str) -> Result<Option<String>, SessionError> {
        let on_page = self
            .page_texts
            .iter()
            .find(|(prefix, sel, _)| sel == selector && self.url.starts_with(prefix.as_str()))
            .map(|(_, _, text)| text.clone());
        Ok(on_page.or_else(|| self.texts.get(selector).cloned()))
    }

    async fn read_attributes(
        &mut self,
        selector: &str,
        attribute: &str,
    ) -> Result<Vec<String>, SessionError> {
        Ok(self
            .attributes
            .get(&(selector.to_string(), attribute.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn read_fields(
        &mut self,
        container: &str,
        _: &[&str],
    ) -> Result<Vec<Vec<String>>, SessionError> {
        Ok(self.fields.get(container).cloned().unwrap_or_default())
    }

    async fn attribute(
        &mut self,
        selector: &str,
        name: &str,
    ) -> Result<Option<Option<String>>, SessionError> {
        if !self.present.contains(selector) {
            return Ok(None);
        }
        let key = (selector.to_string(), name.to_string());
        if let Some(values) = self.sequences.get_mut(&key) {
            let value = if values.len() > 1 {
                values.pop_front().flatten()
            } else {
                values.front().cloned().flatten()
            };
            return Ok(Some(value));
        }
        Ok(Some(
            self.attributes
                .get(&(selector.to_string(), name.to_string()))
                .and_then(|v| v.first().cloned()),
        ))
    }

    async fn current_url(&mut self) -> Result<String, SessionError> {
        Ok(self.url.clone())
    }

    async fn cookies(&mut self) -> Result<Vec<Cookie>, SessionError> {
        Ok(self.cookies.clone())
    }

    async fn set_cookies(&mut self, cookies: &[Cookie]) -> Result<(), SessionError> {
        self.cookies = cookies.to_vec();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if let Some(counter) = &self.closes {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Hands out clones of a template session, or of the identity's own session
/// when one is registered; identities listed in `refuse` fail to open.
#[derive(Debug, Default)]
pub struct ScriptedFactory {
    pub template: ScriptedSession,
    pub per_identity: HashMap<String, ScriptedSession>,
    pub refuse: HashSet<String>,
    pub opened: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new(template: ScriptedSession) -> Self {
        Self {
            template,
            ..Self::default()
        }
    }

    pub fn with_identity(mut self, identity: &str, session: ScriptedSession) -> Self {
        self.per_identity.insert(identity.to_string(), session);
        self
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn open(&self, identity: &Identity) -> Result<Box<dyn Session>, SessionError> {
        if self.refuse.contains(&identity.id) {
            return Err(SessionError::Launch(format!("refused {}", identity.id)));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let session = self.per_identity.get(&identity.id).unwrap_or(&self.template);
        Ok(Box::new(session.clone()))
    }
}
