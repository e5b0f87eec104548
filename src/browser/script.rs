//! In-page scripts used by the Chromium driver.
//!
//! Selectors and names are embedded as JSON string literals.

fn literal(value: &str) -> String {
    serde_json::Value::from(value).to_string()
}

/// Trimmed text of the first match, or `null`.
pub fn read_text(selector: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({}); \
         return el ? (el.textContent || '').trim() : null; }})()",
        literal(selector)
    )
}

/// Whether an element matches.
pub fn exists(selector: &str) -> String {
    format!("document.querySelector({}) !== null", literal(selector))
}

/// Click the first match from page script; `false` when nothing matched.
pub fn click(selector: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({}); \
         if (!el) return false; el.click(); return true; }})()",
        literal(selector)
    )
}

/// Clear an input's value; `false` when nothing matched.
pub fn clear(selector: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({}); \
         if (!el) return false; el.value = ''; return true; }})()",
        literal(selector)
    )
}

/// Attribute values of every match, skipping elements without it.
pub fn read_attributes(selector: &str, attribute: &str) -> String {
    format!(
        "Array.from(document.querySelectorAll({})) \
         .map(el => el.getAttribute({})).filter(v => v !== null)",
        literal(selector),
        literal(attribute)
    )
}

/// `null` when nothing matches, otherwise a one-element array holding the
/// attribute value (itself `null` when absent).
pub fn attribute(selector: &str, name: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({}); \
         return el ? [el.getAttribute({})] : null; }})()",
        literal(selector),
        literal(name)
    )
}

/// Status code of the main document response, `null` when unknown.
pub fn response_status() -> String {
    "(() => { const nav = performance.getEntriesByType('navigation')[0]; \
     return nav && nav.responseStatus ? nav.responseStatus : null; })()"
        .to_string()
}

/// For each container, the trimmed text of the first match of every part.
pub fn read_fields(container: &str, parts: &[&str]) -> String {
    let parts = serde_json::Value::from(parts.to_vec()).to_string();
    format!(
        "Array.from(document.querySelectorAll({})).map(c => {}.map(p => {{ \
         const el = c.querySelector(p); return el ? (el.textContent || '').trim() : ''; }}))",
        literal(container),
        parts
    )
}
