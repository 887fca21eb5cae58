use std::fmt;
use std::str::FromStr;

use crate::error::BackendError;

/// Category of a repository blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Pack,
    Key,
    Lock,
    Snapshot,
    Index,
    Config,
}

impl FileType {
    /// Types that hold many named blobs, in the order a full delete walks them.
    pub const LISTABLE: [FileType; 5] = [
        FileType::Pack,
        FileType::Key,
        FileType::Lock,
        FileType::Snapshot,
        FileType::Index,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pack => "data",
            FileType::Key => "key",
            FileType::Lock => "lock",
            FileType::Snapshot => "snapshot",
            FileType::Index => "index",
            FileType::Config => "config",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data" | "pack" | "packs" => Ok(FileType::Pack),
            "key" | "keys" => Ok(FileType::Key),
            "lock" | "locks" => Ok(FileType::Lock),
            "snapshot" | "snapshots" => Ok(FileType::Snapshot),
            "index" => Ok(FileType::Index),
            "config" => Ok(FileType::Config),
            other => Err(format!("unknown file type: {}", other)),
        }
    }
}

/// Addresses one blob: its category plus an opaque name (usually a hex hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    pub file_type: FileType,
    pub name: String,
}

impl Handle {
    pub fn new(file_type: FileType, name: impl Into<String>) -> Self {
        Self { file_type, name: name.into() }
    }

    pub fn config() -> Self {
        Self::new(FileType::Config, "")
    }

    /// Reject names that would not map to a key of their own. A name is a
    /// single path element: non-empty, without `/`, and not `.` or `..`.
    pub fn check(&self) -> Result<(), BackendError> {
        if self.file_type == FileType::Config {
            return Ok(());
        }
        match self.name.as_str() {
            "" | "." | ".." => Err(BackendError::InvalidName(self.name.clone())),
            n if n.contains('/') => Err(BackendError::InvalidName(self.name.clone())),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.file_type == FileType::Config {
            return write!(f, "<{}>", self.file_type);
        }
        let short = match self.name.char_indices().nth(8) {
            Some((i, _)) => &self.name[..i],
            None => &self.name,
        };
        write!(f, "<{}/{}>", self.file_type, short)
    }
}

/// Name and size of a stored blob, always freshly queried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_parse() {
        assert_eq!("data".parse::<FileType>().unwrap(), FileType::Pack);
        assert_eq!("keys".parse::<FileType>().unwrap(), FileType::Key);
        assert_eq!("snapshot".parse::<FileType>().unwrap(), FileType::Snapshot);
        assert!("blob".parse::<FileType>().is_err());
    }

    #[test]
    fn test_handle_display() {
        let h = Handle::new(FileType::Pack, "0123456789abcdef");
        assert_eq!(h.to_string(), "<data/01234567>");
        assert_eq!(Handle::config().to_string(), "<config>");
        assert_eq!(Handle::new(FileType::Lock, "ab").to_string(), "<lock/ab>");
    }

    #[test]
    fn test_handle_display_non_ascii() {
        assert_eq!(Handle::new(FileType::Key, "1234567é9").to_string(), "<key/1234567é>");
        assert_eq!(Handle::new(FileType::Key, "日本語").to_string(), "<key/日本語>");
    }

    #[test]
    fn test_handle_check() {
        assert!(Handle::new(FileType::Pack, "abcd").check().is_ok());
        assert!(Handle::new(FileType::Key, "aé-blob").check().is_ok());
        assert!(Handle::config().check().is_ok());
        for bad in ["", ".", "..", "../locks/abc", "a/b", "/abs"] {
            let err = Handle::new(FileType::Key, bad).check().unwrap_err();
            assert!(matches!(err, BackendError::InvalidName(_)), "{:?}", bad);
        }
    }
}
