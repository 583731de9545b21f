//! The unit of migration: one remote file.

use serde::{Deserialize, Serialize};

/// One remote file, as produced by a crawl and stored in the checkpoint.
///
/// Field names on disk match the crawl caches and checkpoints written by
/// earlier versions of the tool, so existing state files keep working.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTarget {
    pub name: String,

    /// Slash-separated path relative to the crawl root, including `name`
    #[serde(rename = "path")]
    pub relative_path: String,

    #[serde(default)]
    pub size: Option<u64>,

    /// Informational only; never used to detect changes
    #[serde(rename = "lastModifiedDateTime", default)]
    pub last_modified: Option<String>,

    /// Provider-assigned item id
    #[serde(rename = "id", default)]
    pub remote_id: Option<String>,
}

impl FileTarget {
    /// Identity used for every match: path and name, nothing else.
    ///
    /// A file whose content changed but kept its name and location is
    /// therefore considered already migrated.
    pub fn identity(&self) -> (&str, &str) {
        (&self.relative_path, &self.name)
    }

    pub fn same_identity(&self, other: &FileTarget) -> bool {
        self.identity() == other.identity()
    }

    /// Size in bytes, treating an unknown size as empty
    pub fn byte_size(&self) -> u64 {
        self.size.unwrap_or(0)
    }

    /// Parent folder of the file relative to the crawl root ("" at the root)
    pub fn parent_path(&self) -> &str {
        match self.relative_path.rfind('/') {
            Some(idx) => &self.relative_path[..idx],
            None => "",
        }
    }
}

/// Join path segments with `/`, skipping empty segments and normalising
/// backslashes and stray separators.
pub fn join_path(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|p| p.split(['/', '\\']))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(path: &str, size: u64, modified: &str) -> FileTarget {
        FileTarget {
            name: path.rsplit('/').next().unwrap().to_string(),
            relative_path: path.to_string(),
            size: Some(size),
            last_modified: Some(modified.to_string()),
            remote_id: Some(format!("id-{}", path)),
        }
    }

    #[test]
    fn test_identity_ignores_size_and_timestamp() {
        let a = target("docs/report.pdf", 100, "2024-01-01T00:00:00Z");
        let b = target("docs/report.pdf", 999, "2025-06-01T00:00:00Z");
        assert!(a.same_identity(&b));

        let c = target("other/report.pdf", 100, "2024-01-01T00:00:00Z");
        assert!(!a.same_identity(&c));
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(target("a/b/c.txt", 1, "").parent_path(), "a/b");
        assert_eq!(target("c.txt", 1, "").parent_path(), "");
    }

    #[test]
    fn test_join_path_normalises_separators() {
        assert_eq!(join_path(&["", "a.txt"]), "a.txt");
        assert_eq!(join_path(&["root/", "sub\\dir", "f.txt"]), "root/sub/dir/f.txt");
        assert_eq!(join_path(&["", ""]), "");
    }

    #[test]
    fn test_serialized_field_names() {
        let json = serde_json::to_value(target("x/y.txt", 5, "t")).unwrap();
        assert_eq!(json["path"], "x/y.txt");
        assert_eq!(json["lastModifiedDateTime"], "t");
        assert_eq!(json["id"], "id-x/y.txt");

        let parsed: FileTarget =
            serde_json::from_str(r#"{"name":"n","path":"n","size":null}"#).unwrap();
        assert_eq!(parsed.byte_size(), 0);
        assert!(parsed.remote_id.is_none());
    }
}
