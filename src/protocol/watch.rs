//! File-watch subscriptions forwarded to the service as
//! `workspace/didChangeWatchedFiles`.

use std::path::{Path, PathBuf};

use glob::Pattern;
use serde_json::{json, Value};

use crate::supervisor::error::SupervisorError;

/// LSP `FileChangeType`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Created = 1,
    Changed = 2,
    Deleted = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileChangeKind,
}

impl FileEvent {
    pub fn new(path: impl Into<PathBuf>, kind: FileChangeKind) -> Self {
        Self { path: path.into(), kind }
    }

    pub fn to_params(&self) -> Value {
        json!({
            "changes": [{
                "uri": file_uri(&self.path),
                "type": self.kind as u8,
            }]
        })
    }
}

/// Compiled watch patterns. Empty matches nothing.
#[derive(Debug, Clone, Default)]
pub struct FileWatch {
    sources: Vec<String>,
    patterns: Vec<Pattern>,
}

impl FileWatch {
    /// `{a,b}` alternatives are expanded before compiling, since `glob`
    /// does not support them natively.
    pub fn compile<S: AsRef<str>>(sources: &[S]) -> Result<Self, SupervisorError> {
        let mut patterns = Vec::new();
        for source in sources {
            for expanded in expand_braces(source.as_ref()) {
                let pattern = Pattern::new(&expanded).map_err(|e| {
                    SupervisorError::InvalidConfig(format!(
                        "bad watch pattern '{}': {}",
                        source.as_ref(),
                        e
                    ))
                })?;
                patterns.push(pattern);
            }
        }
        Ok(Self {
            sources: sources.iter().map(|s| s.as_ref().to_string()).collect(),
            patterns,
        })
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, path: &Path) -> bool {
        self.patterns.iter().any(|p| p.matches_path(path))
    }
}

/// Expand the first `{...}` group and recurse on each alternative.
fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };
    let Some(close) = pattern[open..].find('}').map(|i| open + i) else {
        return vec![pattern.to_string()];
    };

    let prefix = &pattern[..open];
    let suffix = &pattern[close + 1..];
    pattern[open + 1..close]
        .split(',')
        .flat_map(|alt| expand_braces(&format!("{}{}{}", prefix, alt, suffix)))
        .collect()
}

/// `file://` URI for an absolute path, percent-encoding everything outside
/// the unreserved set and `/`.
pub fn file_uri(path: &Path) -> String {
    let raw = path.to_string_lossy().replace('\\', "/");
    let mut uri = String::from("file://");
    if !raw.starts_with('/') {
        // Windows drive paths: file:///C:/...
        uri.push('/');
    }
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                uri.push(byte as char)
            }
            b':' if cfg!(windows) => uri.push(':'),
            _ => uri.push_str(&format!("%{:02X}", byte)),
        }
    }
    uri
}
