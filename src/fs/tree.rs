//! Directory listing types shared by the REST and WebSocket transports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A subdirectory entry inside a listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subdirectory {
    pub path: String,
    pub name: String,
}

/// A file entry inside a listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub path: String,
    pub name: String,
    pub permissions: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub owner: String,
    pub group: String,
}

/// One directory level: its files and immediate subdirectories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directory {
    pub path: String,
    pub name: String,
    pub files: Vec<FileSummary>,
    pub subdirectories: Vec<Subdirectory>,
}

impl Directory {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            name: std::path::Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.to_string()),
            files: Vec::new(),
            subdirectories: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.subdirectories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_name_is_basename() {
        assert_eq!(Directory::new("/srv/work/app").name, "app");
        assert_eq!(Directory::new("/").name, "/");
    }
}
