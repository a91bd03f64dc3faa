//! Gating for tests that need a real E2B account.
//!
//! Tests tagged `integration` only run when `E2B_API_KEY` is set. The check
//! looks at presence, not validity: any non-empty value lets them run.
//!
//! Inside a test body, use the [`require_integration_env!`](crate::require_integration_env)
//! macro:
//!
//! ```ignore
//! #[tokio::test]
//! async fn talks_to_e2b() {
//!     e2b_mcp::require_integration_env!();
//!     // ... exercise a live sandbox ...
//! }
//! ```

use crate::config::API_KEY_ENV;

/// Keyword that marks a test as an integration test.
pub const INTEGRATION_MARKER: &str = "integration";

/// Help line registered for the `integration` marker.
pub const MARKER_DESCRIPTION: &str = "integration: marks tests as integration tests";

/// Reason attached to integration tests skipped for lack of a credential.
pub const SKIP_REASON: &str = "need E2B_API_KEY to run integration tests";

/// A marker attached to a collected test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    Skip { reason: String },
}

/// Marker help lines known to the test harness.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MarkerRegistry {
    lines: Vec<String>,
}

impl MarkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `name: description` line. Re-adding the same line is a no-op.
    pub fn add_line(&mut self, line: &str) {
        if !self.lines.iter().any(|l| l == line) {
            self.lines.push(line.to_string());
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_registered(&self, marker: &str) -> bool {
        self.lines
            .iter()
            .any(|l| l.split(':').next().map(str::trim) == Some(marker))
    }
}

/// Registers the `integration` marker.
pub fn configure(registry: &mut MarkerRegistry) {
    registry.add_line(MARKER_DESCRIPTION);
}

/// A collected test, as seen by the gating hook.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TestItem {
    pub name: String,
    pub keywords: Vec<String>,
    pub markers: Vec<Marker>,
}

impl TestItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keywords.push(keyword.into());
        self
    }

    pub fn has_keyword(&self, keyword: &str) -> bool {
        self.keywords.iter().any(|k| k == keyword)
    }

    pub fn add_marker(&mut self, marker: Marker) {
        self.markers.push(marker);
    }

    pub fn skip_reason(&self) -> Option<&str> {
        self.markers
            .iter()
            .map(|Marker::Skip { reason }| reason.as_str())
            .next()
    }
}

fn has_credential(api_key: Option<&str>) -> bool {
    api_key.is_some_and(|key| !key.is_empty())
}

/// Marks every `integration` item as skipped when `api_key` is absent or empty.
///
/// Items without the keyword are never touched.
pub fn apply_integration_skips(items: &mut [TestItem], api_key: Option<&str>) {
    if has_credential(api_key) {
        return;
    }
    for item in items.iter_mut().filter(|i| i.has_keyword(INTEGRATION_MARKER)) {
        item.add_marker(Marker::Skip {
            reason: SKIP_REASON.to_string(),
        });
    }
}

/// [`apply_integration_skips`] against the process environment.
pub fn modify_collected_items(items: &mut [TestItem]) {
    let api_key = std::env::var(API_KEY_ENV).ok();
    apply_integration_skips(items, api_key.as_deref());
}

/// `Some(SKIP_REASON)` when integration tests cannot run in this environment.
pub fn integration_skip_reason() -> Option<&'static str> {
    let api_key = std::env::var(API_KEY_ENV).ok();
    (!has_credential(api_key.as_deref())).then_some(SKIP_REASON)
}

/// Returns early from the enclosing test when `E2B_API_KEY` is not set.
#[macro_export]
macro_rules! require_integration_env {
    () => {
        if let Some(reason) = $crate::integration::integration_skip_reason() {
            eprintln!("skipped: {}", reason);
            return;
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collected() -> Vec<TestItem> {
        vec![
            TestItem::new("test_live_sandbox").with_keyword(INTEGRATION_MARKER),
            TestItem::new("test_server_config"),
        ]
    }

    #[test]
    fn test_integration_item_skipped_without_credential() {
        let mut items = collected();
        apply_integration_skips(&mut items, None);
        assert_eq!(items[0].skip_reason(), Some(SKIP_REASON));
        assert_eq!(
            items[0].markers,
            vec![Marker::Skip {
                reason: "need E2B_API_KEY to run integration tests".to_string()
            }]
        );
    }

    #[test]
    fn test_configure_registers_integration_marker() {
        let mut registry = MarkerRegistry::new();
        configure(&mut registry);
        configure(&mut registry);
        assert_eq!(
            registry.lines(),
            ["integration: marks tests as integration tests".to_string()]
        );
        assert!(registry.is_registered(INTEGRATION_MARKER));
        assert!(!registry.is_registered("slow"));
    }

    #[test]
    fn test_empty_credential_counts_as_missing() {
        let mut items = collected();
        apply_integration_skips(&mut items, Some(""));
        assert_eq!(items[0].skip_reason(), Some(SKIP_REASON));
    }

    #[test]
    fn test_credential_present_adds_nothing() {
        let mut items = collected();
        apply_integration_skips(&mut items, Some("e2b_anything"));
        assert!(items.iter().all(|i| i.markers.is_empty()));
    }

    #[test]
    fn test_untagged_items_never_modified() {
        for api_key in [None, Some(""), Some("e2b_key")] {
            let mut items = vec![TestItem::new("plain").with_keyword("slow")];
            let before = items.clone();
            apply_integration_skips(&mut items, api_key);
            assert_eq!(items, before);
        }
    }
}
