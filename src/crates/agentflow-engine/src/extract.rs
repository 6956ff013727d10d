//! File-reference and dependency extraction
//!
//! Scans code, tool output and message text for paths the run produced, and
//! code blocks for import-style dependency hints. Discovered files are
//! resolved against the run's working directory; textual files under the
//! capture ceiling get a content prefix embedded in the `file_gen` event.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use regex::Regex;

use agentflow_core::event::FileArtifact;

/// Extensions treated as textual and safe to embed.
const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "rst", "log", "py", "rs", "js", "ts", "sh", "sql", "json", "yaml", "yml",
    "toml", "csv", "tsv", "xml", "html", "css", "ini", "cfg",
];

/// Extensions the scanners recognize as plausible artifacts. Anything else in
/// free text is too noisy to treat as a file reference.
const KNOWN_EXTENSIONS: &[&str] = &[
    "txt", "md", "rst", "log", "py", "rs", "js", "ts", "sh", "sql", "json", "yaml", "yml",
    "toml", "csv", "tsv", "xml", "html", "css", "ini", "cfg", "png", "jpg", "jpeg", "gif",
    "svg", "pdf", "zip", "tar", "gz", "parquet", "bin", "db",
];

/// Capture limits, taken from the engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct FileScanLimits {
    /// Files larger than this are recorded without content
    pub capture_max_bytes: u64,
    /// Embedded content is clipped to this many bytes
    pub embed_max_bytes: usize,
}

fn extension_of(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

fn has_known_extension(path: &str) -> bool {
    extension_of(path)
        .map(|ext| KNOWN_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// True when the extension marks a file we can embed as text.
pub fn is_textual(path: &str) -> bool {
    extension_of(path)
        .map(|ext| TEXT_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Coarse artifact type from the extension.
pub fn infer_file_type(path: &str) -> &'static str {
    match extension_of(path).as_deref() {
        Some("py" | "rs" | "js" | "ts" | "sh" | "sql") => "code",
        Some("json" | "yaml" | "yml" | "toml" | "csv" | "tsv" | "xml" | "parquet" | "db") => {
            "data"
        }
        Some("png" | "jpg" | "jpeg" | "gif" | "svg") => "image",
        Some("zip" | "tar" | "gz") => "archive",
        Some("html" | "css" | "md" | "rst" | "txt" | "log" | "ini" | "cfg") => "text",
        _ => "binary",
    }
}

fn push_path(paths: &mut BTreeSet<String>, candidate: &str) {
    let trimmed = candidate.trim_matches(|c: char| {
        c.is_whitespace() || matches!(c, '"' | '\'' | '`' | ',' | ';' | ':' | ')' | '(')
    });
    if !trimmed.is_empty() && has_known_extension(trimmed) {
        paths.insert(trimmed.to_string());
    }
}

/// Paths mentioned in prose: "saved to X", "written to X", "created file X",
/// plus bare tokens with a recognized extension.
pub fn scan_text_for_paths(text: &str) -> Vec<String> {
    let mut paths = BTreeSet::new();

    let phrases =
        Regex::new(r#"(?i)(?:saved to|written to|created file|wrote)[:\s]+([\w@~./\\-]+)"#)
            .expect("static regex");
    for capture in phrases.captures_iter(text) {
        push_path(&mut paths, &capture[1]);
    }

    let bare = Regex::new(r#"[\w@~./\\-]+\.[A-Za-z0-9]{1,8}"#).expect("static regex");
    for m in bare.find_iter(text) {
        push_path(&mut paths, m.as_str());
    }

    paths.into_iter().collect()
}

/// Paths a code block writes to: `open(path, "w"/"a")` and
/// `Path(path).write_text(...)` shapes.
pub fn scan_code_for_paths(code: &str) -> Vec<String> {
    let mut paths = BTreeSet::new();

    let open_write =
        Regex::new(r#"open\(\s*['"]([^'"]+)['"]\s*,\s*['"][wax]"#).expect("static regex");
    for capture in open_write.captures_iter(code) {
        push_path(&mut paths, &capture[1]);
    }

    let write_text =
        Regex::new(r#"Path\(\s*['"]([^'"]+)['"]\s*\)\s*\.write_(?:text|bytes)"#)
            .expect("static regex");
    for capture in write_text.captures_iter(code) {
        push_path(&mut paths, &capture[1]);
    }

    paths.into_iter().collect()
}

/// Top-level import hints from an executed code block (`import x`,
/// `from x import y`). Module roots only, deduplicated, in first-seen order.
pub fn extract_imports(code: &str) -> Vec<String> {
    let line_import =
        Regex::new(r#"(?m)^\s*(?:import|from)\s+([A-Za-z_][A-Za-z0-9_.]*)"#)
            .expect("static regex");
    let mut seen = BTreeSet::new();
    let mut imports = Vec::new();
    for capture in line_import.captures_iter(code) {
        let root = capture[1].split('.').next().unwrap_or(&capture[1]).to_string();
        if seen.insert(root.clone()) {
            imports.push(root);
        }
    }
    imports
}

/// Build the artifact record for one discovered path.
///
/// Relative paths resolve against `workdir`. When the file exists, is
/// textual and fits under the capture ceiling, the first
/// `embed_max_bytes` of content are embedded; otherwise only path, size and
/// type are recorded.
pub fn capture_artifact(workdir: &Path, path: &str, limits: FileScanLimits) -> FileArtifact {
    let resolved: PathBuf = if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        workdir.join(path)
    };

    let size_bytes = std::fs::metadata(&resolved).map(|m| m.len()).unwrap_or(0);
    let embeddable = is_textual(path) && size_bytes > 0 && size_bytes <= limits.capture_max_bytes;

    let (content, truncated) = if embeddable {
        match std::fs::File::open(&resolved) {
            Ok(file) => {
                let mut buffer = Vec::with_capacity(limits.embed_max_bytes);
                let mut handle = file.take(limits.embed_max_bytes as u64);
                match handle.read_to_end(&mut buffer) {
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&buffer).into_owned();
                        let truncated = size_bytes > limits.embed_max_bytes as u64;
                        (Some(text), truncated)
                    }
                    Err(_) => (None, false),
                }
            }
            Err(_) => (None, false),
        }
    } else {
        (None, false)
    };

    FileArtifact {
        path: path.to_string(),
        file_type: infer_file_type(path).to_string(),
        size_bytes,
        content,
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn prose_phrases_yield_paths() {
        let text = "Results saved to report.md and the raw dump was written to data/dump.csv.";
        let paths = scan_text_for_paths(text);
        assert!(paths.contains(&"report.md".to_string()));
        assert!(paths.contains(&"data/dump.csv".to_string()));
    }

    #[test]
    fn bare_tokens_need_known_extensions() {
        let paths = scan_text_for_paths("see output.txt but ignore example.com and v1.2");
        assert_eq!(paths, vec!["output.txt".to_string()]);
    }

    #[test]
    fn code_write_patterns() {
        let code = r#"
f = open("out.txt", "w")
g = open('append.log', 'a')
h = open("read_only.txt", "r")
Path("notes.md").write_text(body)
"#;
        let paths = scan_code_for_paths(code);
        assert!(paths.contains(&"out.txt".to_string()));
        assert!(paths.contains(&"append.log".to_string()));
        assert!(paths.contains(&"notes.md".to_string()));
        assert!(!paths.contains(&"read_only.txt".to_string()));
    }

    #[test]
    fn import_roots_deduplicated() {
        let code = r#"
import os
import os.path
from collections import defaultdict
import numpy as np
x = "import nothing"
"#;
        assert_eq!(extract_imports(code), vec!["os", "collections", "numpy"]);
    }

    #[test]
    fn no_imports_is_empty() {
        assert!(extract_imports("print('hello')").is_empty());
    }

    #[test]
    fn artifact_embeds_small_text_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("out.txt")).unwrap();
        file.write_all(b"hello").unwrap();

        let artifact = capture_artifact(
            dir.path(),
            "out.txt",
            FileScanLimits {
                capture_max_bytes: 1024 * 1024,
                embed_max_bytes: 5 * 1024,
            },
        );
        assert_eq!(artifact.size_bytes, 5);
        assert_eq!(artifact.content.as_deref(), Some("hello"));
        assert!(!artifact.truncated);
        assert_eq!(artifact.file_type, "text");
    }

    #[test]
    fn artifact_clips_to_embed_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("big.txt")).unwrap();
        file.write_all(&vec![b'a'; 100]).unwrap();

        let artifact = capture_artifact(
            dir.path(),
            "big.txt",
            FileScanLimits {
                capture_max_bytes: 1024,
                embed_max_bytes: 10,
            },
        );
        assert_eq!(artifact.size_bytes, 100);
        assert_eq!(artifact.content.as_deref(), Some("aaaaaaaaaa"));
        assert!(artifact.truncated);
    }

    #[test]
    fn oversized_and_binary_files_keep_metadata_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("huge.txt")).unwrap();
        file.write_all(&vec![b'a'; 64]).unwrap();
        let mut image = std::fs::File::create(dir.path().join("plot.png")).unwrap();
        image.write_all(&[0u8; 16]).unwrap();

        let limits = FileScanLimits {
            capture_max_bytes: 32,
            embed_max_bytes: 16,
        };
        let huge = capture_artifact(dir.path(), "huge.txt", limits);
        assert_eq!(huge.size_bytes, 64);
        assert!(huge.content.is_none());

        let png = capture_artifact(dir.path(), "plot.png", limits);
        assert_eq!(png.file_type, "image");
        assert!(png.content.is_none());
    }

    #[test]
    fn missing_file_records_zero_size() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = capture_artifact(
            dir.path(),
            "ghost.txt",
            FileScanLimits {
                capture_max_bytes: 1024,
                embed_max_bytes: 64,
            },
        );
        assert_eq!(artifact.size_bytes, 0);
        assert!(artifact.content.is_none());
    }
}
