//! Terms sub-flow (C6): document selection/rendering, independent of HTTP.
//! The HTTP handlers live in `routes::terms` and call into this module.

use anyhow::{Context, Result};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct TermsDocument {
    pub headline: String,
    pub terms_html: String,
    pub version: String,
}

/// Pick the most recently versioned `v<N>.md` file in `dir` and render it.
///
/// Version ordering is numeric-aware (`v10 > v2`) rather than lexicographic,
/// since a plain string comparison would silently regress once a two-digit
/// version shipped.
pub fn load_latest(dir: &str) -> Result<TermsDocument> {
    let path = latest_version_path(dir)?;
    let version = version_from_filename(&path)
        .ok_or_else(|| anyhow::anyhow!("could not parse version from {}", path.display()))?;

    let markdown = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read terms document at {}", path.display()))?;
    let terms_html = render_markdown(&markdown);

    Ok(TermsDocument {
        headline: "Terms and Conditions".to_string(),
        terms_html,
        version,
    })
}

fn latest_version_path(dir: &str) -> Result<std::path::PathBuf> {
    let mut candidates: Vec<(u64, std::path::PathBuf)> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read terms directory {dir}"))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let path = entry.path();
            version_number(&path).map(|n| (n, path))
        })
        .collect();

    candidates.sort_by_key(|(n, _)| *n);
    candidates
        .pop()
        .map(|(_, path)| path)
        .ok_or_else(|| anyhow::anyhow!("no v<N>.md terms documents found in {dir}"))
}

fn version_from_filename(path: &Path) -> Option<String> {
    path.file_stem()?.to_str()?.strip_prefix('v').map(String::from)
}

fn version_number(path: &Path) -> Option<u64> {
    version_from_filename(path)?.parse().ok()
}

fn render_markdown(markdown: &str) -> String {
    use pulldown_cmark::{html, Parser};
    let parser = Parser::new(markdown);
    let mut html_out = String::new();
    html::push_html(&mut html_out, parser);
    html_out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn picks_numerically_greatest_version_not_lexicographic() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("v2.md"), "# v2").unwrap();
        fs::write(dir.path().join("v10.md"), "# v10").unwrap();

        let doc = load_latest(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(doc.version, "10");
    }

    #[test]
    fn renders_markdown_to_html() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("v1.md"), "# Hello\n\nWorld").unwrap();

        let doc = load_latest(dir.path().to_str().unwrap()).unwrap();
        assert!(doc.terms_html.contains("<h1>"));
        assert!(doc.terms_html.contains("World"));
    }

    #[test]
    fn errors_when_directory_has_no_versioned_documents() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("readme.md"), "not versioned").unwrap();

        let result = load_latest(dir.path().to_str().unwrap());
        assert!(result.is_err());
    }
}
