//! Mapping from handles to object keys.
//!
//! Both layouts place the repository under a key prefix (`path`). A prefix
//! of `.` or the empty string stands for the bucket root.

use std::fmt;

use crate::error::BackendError;
use crate::handle::{FileType, Handle};

/// Maps handles to object keys and back to the key space of each file type.
pub trait KeyLayout: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Full object key for `h`.
    fn filename(&self, h: &Handle) -> String;

    /// Directory part of the object key for `h`.
    fn dirname(&self, h: &Handle) -> String;

    /// Key-space prefix holding all blobs of type `t`, and whether blobs
    /// are spread over subdirectories below it.
    fn basedir(&self, t: FileType) -> (String, bool);
}

/// Layout with pluralized directory names and packs fanned out by the
/// first two characters of their name.
#[derive(Debug, Clone)]
pub struct DefaultLayout {
    pub path: String,
}

impl DefaultLayout {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    fn dir(t: FileType) -> &'static str {
        match t {
            FileType::Pack => "data",
            FileType::Key => "keys",
            FileType::Lock => "locks",
            FileType::Snapshot => "snapshots",
            FileType::Index => "index",
            FileType::Config => "",
        }
    }
}

impl KeyLayout for DefaultLayout {
    fn name(&self) -> &'static str {
        "default"
    }

    fn filename(&self, h: &Handle) -> String {
        if h.file_type == FileType::Config {
            return join_path(&[&self.path, "config"]);
        }
        join_path(&[&self.dirname(h), &h.name])
    }

    fn dirname(&self, h: &Handle) -> String {
        let dir = Self::dir(h.file_type);
        if h.file_type == FileType::Pack {
            let fan: String = h.name.chars().take(2).collect();
            if fan.chars().count() == 2 {
                return join_path(&[&self.path, dir, &fan]);
            }
        }
        join_path(&[&self.path, dir])
    }

    fn basedir(&self, t: FileType) -> (String, bool) {
        (join_path(&[&self.path, Self::dir(t)]), t == FileType::Pack)
    }
}

/// Flat layout with singular directory names, as written by older
/// S3-style repositories.
#[derive(Debug, Clone)]
pub struct S3LegacyLayout {
    pub path: String,
}

impl S3LegacyLayout {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl KeyLayout for S3LegacyLayout {
    fn name(&self) -> &'static str {
        "s3legacy"
    }

    fn filename(&self, h: &Handle) -> String {
        if h.file_type == FileType::Config {
            return join_path(&[&self.path, "config"]);
        }
        join_path(&[&self.dirname(h), &h.name])
    }

    fn dirname(&self, h: &Handle) -> String {
        if h.file_type == FileType::Config {
            return clean_path(&self.path);
        }
        join_path(&[&self.path, h.file_type.as_str()])
    }

    fn basedir(&self, t: FileType) -> (String, bool) {
        if t == FileType::Config {
            return (clean_path(&self.path), false);
        }
        (join_path(&[&self.path, t.as_str()]), false)
    }
}

/// Look up a layout by its configured name. An empty name requests
/// auto-detection and yields `None`.
pub fn layout_by_name(name: &str, path: &str) -> Result<Option<Box<dyn KeyLayout>>, BackendError> {
    match name {
        "" => Ok(None),
        "default" => Ok(Some(Box::new(DefaultLayout::new(path)))),
        "s3legacy" => Ok(Some(Box::new(S3LegacyLayout::new(path)))),
        other => Err(BackendError::Config(format!("unknown backend layout: {}", other))),
    }
}

/// Lexically normalize a slash-separated path: collapse repeated
/// separators, drop `.` elements and resolve `..` against the preceding
/// element. An empty result becomes `.`.
pub fn clean_path(p: &str) -> String {
    let rooted = p.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|s| *s != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            s => parts.push(s),
        }
    }
    let joined = parts.join("/");
    if rooted {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Join path elements with `/` and clean the result. Object keys never
/// start with `./`, so a result of `.` alone is the only way the root shows up.
pub fn join_path(parts: &[&str]) -> String {
    let parts: Vec<&str> = parts.iter().copied().filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        return String::new();
    }
    clean_path(&parts.join("/"))
}

/// Final element of a slash-separated path.
pub fn base_name(p: &str) -> &str {
    let trimmed = p.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}
