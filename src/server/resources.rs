//! UI resource bundles: self-contained HTML apps the chat frontend renders
//! in sandboxed iframes (tables, bar charts, line charts). The protocol
//! server only lists and serves them; rendering is the frontend's business.

use std::path::Path;

use serde::Serialize;

/// One bundle: a stable URI plus the inlined HTML document.
#[derive(Debug, Clone, Serialize)]
pub struct UiResource {
    pub uri: String,
    pub name: String,
    #[serde(rename = "mimeType")]
    pub mime_type: &'static str,
    pub html: String,
}

/// Bundles loaded from the resource directory at startup.
#[derive(Debug, Default)]
pub struct UiResources {
    resources: Vec<UiResource>,
}

impl UiResources {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load every `*.html` file under `dir`. Missing directory is not an
    /// error; the server simply advertises no UI bundles.
    pub fn load(dir: Option<&Path>) -> Self {
        let Some(dir) = dir else {
            return Self::empty();
        };
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("UI resource directory {}: {e}", dir.display());
                return Self::empty();
            }
        };

        let mut resources = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("html") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match std::fs::read_to_string(&path) {
                Ok(html) => resources.push(UiResource {
                    uri: format!("ui://censusgate/{stem}"),
                    name: stem.to_string(),
                    mime_type: "text/html",
                    html,
                }),
                Err(e) => tracing::warn!("skipping UI resource {}: {e}", path.display()),
            }
        }
        resources.sort_by(|a, b| a.uri.cmp(&b.uri));
        tracing::info!(count = resources.len(), "loaded UI resource bundles");
        Self { resources }
    }

    pub fn list(&self) -> &[UiResource] {
        &self.resources
    }

    pub fn get(&self, uri: &str) -> Option<&UiResource> {
        self.resources.iter().find(|r| r.uri == uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_html_bundles_from_a_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("table.html"), "<html>table</html>").unwrap();
        std::fs::write(dir.path().join("bar-chart.html"), "<html>bars</html>").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a bundle").unwrap();

        let resources = UiResources::load(Some(dir.path()));
        assert_eq!(resources.list().len(), 2);
        assert_eq!(resources.list()[0].uri, "ui://censusgate/bar-chart");
        assert!(resources.get("ui://censusgate/table").is_some());
        assert!(resources.get("ui://censusgate/pie").is_none());
    }

    #[test]
    fn missing_directory_is_empty_not_fatal() {
        let resources = UiResources::load(Some(Path::new("/definitely/not/here")));
        assert!(resources.list().is_empty());
    }
}
