//! In-memory [`RemoteDrive`] used by tests. Records every call.

use super::types::{ByteRange, DriveItem, ItemReference, UploadSession};
use super::{ByteStream, RemoteDrive};
use crate::utils::{MigratorError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{stream, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

const DOWNLOAD_PIECE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List(String),
    Download(String),
    Exists(String),
    CreateFolder(String),
    PutContent(String),
    CreateSession(String),
    UploadChunk(String, ByteRange),
}

impl Call {
    /// Calls that modify the drive
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Call::CreateFolder(_) | Call::PutContent(_) | Call::CreateSession(_) | Call::UploadChunk(..)
        )
    }
}

#[derive(Default)]
struct State {
    files: BTreeMap<String, Bytes>,
    folders: BTreeSet<String>,
    ids: HashMap<String, String>,
    sessions: HashMap<String, (String, BytesMut)>,
    calls: Vec<Call>,
    failing_writes: HashSet<String>,
    failing_listings: HashSet<String>,
    duplicate_listings: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryDrive {
    state: Mutex<State>,
}

fn normalize(path: &str) -> String {
    crate::target::join_path(&[path])
}

fn parent_of(path: &str) -> &str {
    path.rfind('/').map(|i| &path[..i]).unwrap_or("")
}

fn unavailable(path: &str) -> MigratorError {
    MigratorError::Api {
        status: 503,
        body: format!("injected failure for {}", path),
    }
}

impl MemoryDrive {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Add a file (and its parent folders); its id is `id-{path}`
    pub fn add_file(&self, path: &str, content: impl Into<Bytes>) {
        let path = normalize(path);
        let mut state = self.state();
        let mut parent = parent_of(&path).to_string();
        while !parent.is_empty() {
            state.folders.insert(parent.clone());
            parent = parent_of(&parent).to_string();
        }
        state.ids.insert(format!("id-{}", path), path.clone());
        state.files.insert(path, content.into());
    }

    pub fn add_folder(&self, path: &str) {
        let path = normalize(path);
        let mut state = self.state();
        let mut current = path;
        while !current.is_empty() {
            state.folders.insert(current.clone());
            current = parent_of(&current).to_string();
        }
    }

    /// Every upload to `path` fails with a 503
    pub fn fail_writes_to(&self, path: &str) {
        self.state().failing_writes.insert(normalize(path));
    }

    /// Listing `folder` fails with a 503
    pub fn fail_listing(&self, folder: &str) {
        self.state().failing_listings.insert(normalize(folder));
    }

    /// Listing `folder` returns each child twice
    pub fn duplicate_listing(&self, folder: &str) {
        self.state().duplicate_listings.insert(normalize(folder));
    }

    pub fn file(&self, path: &str) -> Option<Bytes> {
        self.state().files.get(&normalize(path)).cloned()
    }

    pub fn has_folder(&self, path: &str) -> bool {
        self.state().folders.contains(&normalize(path))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn write_calls(&self) -> usize {
        self.state().calls.iter().filter(|c| c.is_write()).count()
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }
}

#[async_trait]
impl RemoteDrive for MemoryDrive {
    async fn list_children(&self, folder: &str) -> Result<Vec<DriveItem>> {
        let folder = normalize(folder);
        self.record(Call::List(folder.clone()));
        let state = self.state();

        if state.failing_listings.contains(&folder) {
            return Err(unavailable(&folder));
        }
        if !folder.is_empty() && !state.folders.contains(&folder) {
            return Err(MigratorError::Api {
                status: 404,
                body: "itemNotFound".to_string(),
            });
        }

        let reference = Some(ItemReference {
            path: Some(format!("/drive/root:/{}", folder)),
            drive_id: None,
        });
        let mut items: Vec<DriveItem> = state
            .folders
            .iter()
            .filter(|f| parent_of(f) == folder)
            .map(|f| DriveItem {
                id: Some(format!("folder-{}", f)),
                name: f.rsplit('/').next().unwrap_or(f).to_string(),
                folder: Some(serde_json::json!({})),
                parent_reference: reference.clone(),
                ..DriveItem::default()
            })
            .collect();
        items.extend(
            state
                .files
                .iter()
                .filter(|(p, _)| parent_of(p) == folder)
                .map(|(p, content)| DriveItem {
                    id: Some(format!("id-{}", p)),
                    name: p.rsplit('/').next().unwrap_or(p).to_string(),
                    size: Some(content.len() as u64),
                    last_modified_date_time: Some("2024-03-01T09:00:00Z".to_string()),
                    file: Some(serde_json::json!({})),
                    parent_reference: reference.clone(),
                    ..DriveItem::default()
                }),
        );

        if state.duplicate_listings.contains(&folder) {
            let copy = items.clone();
            items.extend(copy);
        }
        Ok(items)
    }

    async fn open_download(&self, remote_id: Option<&str>, path: &str) -> Result<ByteStream> {
        let path = normalize(path);
        self.record(Call::Download(path.clone()));
        let state = self.state();

        let resolved = match remote_id {
            Some(id) => state.ids.get(id).cloned().unwrap_or(path),
            None => path,
        };
        let content = state.files.get(&resolved).cloned().ok_or(MigratorError::Api {
            status: 404,
            body: format!("{} not found", resolved),
        })?;

        let pieces: Vec<std::io::Result<Bytes>> = content
            .chunks(DOWNLOAD_PIECE)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(stream::iter(pieces).boxed())
    }

    async fn item_exists(&self, path: &str) -> Result<bool> {
        let path = normalize(path);
        self.record(Call::Exists(path.clone()));
        let state = self.state();
        Ok(state.folders.contains(&path) || state.files.contains_key(&path))
    }

    async fn create_folder(&self, parent: &str, name: &str) -> Result<()> {
        let path = crate::target::join_path(&[parent, name]);
        self.record(Call::CreateFolder(path.clone()));
        let mut state = self.state();
        let parent = normalize(parent);
        if !parent.is_empty() && !state.folders.contains(&parent) {
            return Err(MigratorError::Api {
                status: 404,
                body: format!("parent {} not found", parent),
            });
        }
        state.folders.insert(path);
        Ok(())
    }

    async fn put_content(&self, path: &str, mut body: ByteStream) -> Result<()> {
        let path = normalize(path);
        self.record(Call::PutContent(path.clone()));
        if self.state().failing_writes.contains(&path) {
            return Err(unavailable(&path));
        }

        let mut buf = BytesMut::new();
        while let Some(piece) = body.next().await {
            buf.extend_from_slice(&piece?);
        }
        self.state().files.insert(path, buf.freeze());
        Ok(())
    }

    async fn create_upload_session(&self, path: &str, _name: &str) -> Result<UploadSession> {
        let path = normalize(path);
        self.record(Call::CreateSession(path.clone()));
        let mut state = self.state();
        if state.failing_writes.contains(&path) {
            return Err(unavailable(&path));
        }

        let upload_url = format!("memory://upload/{}/{}", state.sessions.len(), path);
        state
            .sessions
            .insert(upload_url.clone(), (path, BytesMut::new()));
        Ok(UploadSession {
            upload_url,
            expiration_date_time: None,
        })
    }

    async fn upload_chunk(&self, session: &UploadSession, range: ByteRange, chunk: Bytes) -> Result<()> {
        let mut state = self.state();
        let (path, buf) = state
            .sessions
            .get_mut(&session.upload_url)
            .ok_or(MigratorError::Api {
                status: 404,
                body: "unknown upload session".to_string(),
            })?;
        let path = path.clone();

        if range.start != buf.len() as u64 || range.chunk_len() != chunk.len() as u64 {
            return Err(MigratorError::Api {
                status: 416,
                body: format!("unexpected range {}", range.content_range()),
            });
        }
        buf.extend_from_slice(&chunk);

        let complete = range.end + 1 == range.total;
        let content = if complete { Some(buf.split().freeze()) } else { None };
        if let Some(content) = content {
            state.sessions.remove(&session.upload_url);
            state.files.insert(path.clone(), content);
        }
        state.calls.push(Call::UploadChunk(path, range));
        Ok(())
    }
}
