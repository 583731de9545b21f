//! Graph wire types.

use serde::{Deserialize, Serialize};

/// A `driveItem` as returned by the children listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    #[serde(default)]
    pub id: Option<String>,

    pub name: String,

    #[serde(default)]
    pub size: Option<u64>,

    #[serde(default)]
    pub last_modified_date_time: Option<String>,

    /// Present (possibly empty) on folders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<serde_json::Value>,

    /// Present on files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_reference: Option<ItemReference>,

    /// Pre-authenticated content URL (item metadata requests only)
    #[serde(
        rename = "@microsoft.graph.downloadUrl",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub download_url: Option<String>,
}

impl DriveItem {
    pub fn is_folder(&self) -> bool {
        self.folder.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemReference {
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub drive_id: Option<String>,
}

/// Response of `GET .../children`
#[derive(Debug, Clone, Deserialize)]
pub struct ChildrenPage {
    #[serde(default)]
    pub value: Vec<DriveItem>,

    /// Ignored: one page per folder is assumed
    #[serde(rename = "@odata.nextLink", default)]
    pub next_link: Option<String>,
}

/// Resumable upload session for one large file. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub upload_url: String,

    #[serde(default)]
    pub expiration_date_time: Option<String>,
}

/// Inclusive byte range of one chunk within a file of `total` bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ByteRange {
    /// Number of bytes covered
    pub fn chunk_len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` header value
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}
