//! Deterministic on-disk layout: `<root>/<kind>/<group>/<title>.<ext>`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::Representation;

/// Longest sanitized path component, in characters.
pub const MAX_COMPONENT_LEN: usize = 80;

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Make `raw` safe as a single path component on any common filesystem.
///
/// Unsafe characters and whitespace become `_`, runs of `_` collapse, edge
/// `_`/`.` are trimmed and the result is capped at [`MAX_COMPONENT_LEN`].
/// The mapping is a pure function of its input and sanitizing an already
/// sanitized name returns it unchanged.
pub fn sanitize_component(raw: &str, fallback: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let mapped = match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() || c.is_whitespace() => '_',
            c => c,
        };
        if mapped == '_' && out.ends_with('_') {
            continue;
        }
        out.push(mapped);
    }

    let trimmed = trim_edges(&out);
    let truncated: String = trimmed.chars().take(MAX_COMPONENT_LEN).collect();
    let name = trim_edges(&truncated);

    if name.is_empty() {
        return fallback.to_string();
    }
    if is_reserved(name) {
        return format!("{}_", name);
    }
    name.to_string()
}

fn trim_edges(s: &str) -> &str {
    s.trim_matches(|c| c == '_' || c == '.')
}

fn is_reserved(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name);
    RESERVED_NAMES
        .iter()
        .any(|reserved| stem.eq_ignore_ascii_case(reserved))
}

/// Storage root and the paths derived from it.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for one representation kind within a group.
    pub fn group_dir(&self, representation: &Representation, group: &str) -> PathBuf {
        self.root
            .join(representation.kind().dir_name())
            .join(sanitize_component(group, "search_results"))
    }

    /// Final path of a representation for a given title.
    pub fn file_path(&self, representation: &Representation, group: &str, title: &str) -> PathBuf {
        self.group_dir(representation, group).join(format!(
            "{}.{}",
            sanitize_component(title, "untitled"),
            representation.extension()
        ))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

/// File stems handed out within one collection, per group.
///
/// The first video to claim a stem keeps it; a different video whose title
/// sanitizes to the same stem gets `<stem>_<video id>` instead, so two
/// candidates never share (and overwrite) one output file.
#[derive(Debug, Default)]
pub struct StemClaims {
    owners: Mutex<HashMap<(String, String), String>>,
}

impl StemClaims {
    pub fn claim(&self, group: &str, stem: &str, video_id: &str) -> String {
        let Ok(mut owners) = self.owners.lock() else {
            return disambiguate(stem, video_id);
        };

        let key = (group.to_string(), stem.to_string());
        match owners.get(&key) {
            None => {
                owners.insert(key, video_id.to_string());
                stem.to_string()
            }
            Some(owner) if owner == video_id => stem.to_string(),
            Some(_) => disambiguate(stem, video_id),
        }
    }
}

fn disambiguate(stem: &str, video_id: &str) -> String {
    let room = MAX_COMPONENT_LEN.saturating_sub(video_id.chars().count() + 1);
    let head: String = stem.chars().take(room).collect();
    let head = trim_edges(&head);
    if head.is_empty() {
        video_id.to_string()
    } else {
        format!("{}_{}", head, video_id)
    }
}
