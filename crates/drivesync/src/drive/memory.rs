//! In-memory drive
//!
//! Behaves like the Graph drive for the operations the engine uses: writing a
//! file creates missing parent folders, reads of absent items fail with
//! `NotFound`. Faults can be injected per operation or per path, and every
//! call is counted, so tests can assert on outbound traffic.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{DriveApi, DriveError, DriveItem, join_path};
use crate::runtime::lock;

/// Drive operations, for fault injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriveCall {
    FolderExists,
    CreateFolder,
    ReadFile,
    WriteFile,
    ListChildren,
    GetItemMetadata,
}

struct StoredFile {
    content: Vec<u8>,
    modified: DateTime<Utc>,
    version: u64,
}

struct Fault {
    call: Option<DriveCall>,
    path: Option<String>,
    error: DriveError,
    /// `None` fails every matching call
    remaining: Option<usize>,
}

impl Fault {
    fn matches(&self, call: DriveCall, path: &str) -> bool {
        self.call.is_none_or(|c| c == call) && self.path.as_deref().is_none_or(|p| p == path)
    }
}

#[derive(Default)]
struct DriveState {
    folders: BTreeSet<String>,
    files: BTreeMap<String, StoredFile>,
    faults: Vec<Fault>,
    calls: HashMap<DriveCall, usize>,
    next_version: u64,
}

impl DriveState {
    fn ensure_folders(&mut self, path: &str) {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = join_path(&current, segment);
            self.folders.insert(current.clone());
        }
    }

    fn folder_item(path: &str) -> DriveItem {
        DriveItem {
            id: format!("folder:{}", path),
            name: file_name(path).to_string(),
            size: 0,
            is_folder: true,
            download_url: None,
            last_modified: None,
        }
    }

    fn file_item(path: &str, file: &StoredFile) -> DriveItem {
        DriveItem {
            id: format!("file:{}", path),
            name: file_name(path).to_string(),
            size: file.content.len() as u64,
            is_folder: false,
            download_url: Some(format!("memory://download/{}?v={}", path, file.version)),
            last_modified: Some(file.modified),
        }
    }
}

/// Drive held entirely in memory
#[derive(Default)]
pub struct InMemoryDrive {
    state: Mutex<DriveState>,
    latency: Option<Duration>,
}

impl InMemoryDrive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, so concurrent callers overlap
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    // === Seeding and inspection ===

    /// Create a folder and its parents
    pub fn insert_folder(&self, path: &str) {
        lock(&self.state).ensure_folders(path.trim_matches('/'));
    }

    /// Store a file, creating its parent folders
    pub fn insert_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        let mut state = lock(&self.state);
        Self::store(&mut state, path.trim_matches('/'), content.into());
    }

    /// Content of a stored file
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.state)
            .files
            .get(path.trim_matches('/'))
            .map(|f| f.content.clone())
    }

    /// Content of a stored file parsed as JSON
    pub fn file_json(&self, path: &str) -> Option<serde_json::Value> {
        self.file(path)
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    pub fn has_folder(&self, path: &str) -> bool {
        lock(&self.state).folders.contains(path.trim_matches('/'))
    }

    /// Paths of all stored files
    pub fn file_paths(&self) -> Vec<String> {
        lock(&self.state).files.keys().cloned().collect()
    }

    // === Fault injection ===

    /// Fail every call of `call` with `error`
    pub fn fail_always(&self, call: DriveCall, error: DriveError) {
        self.push_fault(Some(call), None, error, None);
    }

    /// Fail the next `times` calls of `call` with `error`
    pub fn fail_times(&self, call: DriveCall, times: usize, error: DriveError) {
        self.push_fault(Some(call), None, error, Some(times));
    }

    /// Fail every call touching `path` with `error`
    pub fn fail_path(&self, path: &str, error: DriveError) {
        self.push_fault(None, Some(path.trim_matches('/').to_string()), error, None);
    }

    /// Fail every call with `error`
    pub fn fail_all(&self, error: DriveError) {
        self.push_fault(None, None, error, None);
    }

    pub fn clear_faults(&self) {
        lock(&self.state).faults.clear();
    }

    fn push_fault(
        &self,
        call: Option<DriveCall>,
        path: Option<String>,
        error: DriveError,
        remaining: Option<usize>,
    ) {
        lock(&self.state).faults.push(Fault {
            call,
            path,
            error,
            remaining,
        });
    }

    // === Call counting ===

    pub fn call_count(&self, call: DriveCall) -> usize {
        lock(&self.state).calls.get(&call).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.state).calls.values().sum()
    }

    pub fn reset_calls(&self) {
        lock(&self.state).calls.clear();
    }

    // === Internals ===

    /// Count the call, apply latency, then fire any matching fault
    fn begin(&self, call: DriveCall, path: &str) -> Result<(), DriveError> {
        *lock(&self.state).calls.entry(call).or_insert(0) += 1;

        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }

        let mut state = lock(&self.state);
        let Some(index) = state.faults.iter().position(|f| f.matches(call, path)) else {
            return Ok(());
        };

        let fault = &mut state.faults[index];
        let error = fault.error.clone();
        let exhausted = match fault.remaining.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            state.faults.remove(index);
        }
        Err(error)
    }

    fn store(state: &mut DriveState, path: &str, content: Vec<u8>) -> DriveItem {
        if let Some((parent, _)) = path.rsplit_once('/') {
            state.ensure_folders(parent);
        }
        state.next_version += 1;
        let file = StoredFile {
            content,
            modified: Utc::now(),
            version: state.next_version,
        };
        let item = DriveState::file_item(path, &file);
        state.files.insert(path.to_string(), file);
        item
    }
}

impl DriveApi for InMemoryDrive {
    fn folder_exists(&self, path: &str) -> Result<bool, DriveError> {
        let path = path.trim_matches('/');
        self.begin(DriveCall::FolderExists, path)?;
        Ok(path.is_empty() || lock(&self.state).folders.contains(path))
    }

    fn create_folder(&self, parent: &str, name: &str) -> Result<DriveItem, DriveError> {
        let path = join_path(parent, name);
        self.begin(DriveCall::CreateFolder, &path)?;

        let mut state = lock(&self.state);
        let parent = parent.trim_matches('/');
        if !parent.is_empty() && !state.folders.contains(parent) {
            return Err(DriveError::NotFound(parent.to_string()));
        }
        if state.files.contains_key(&path) {
            return Err(DriveError::Http {
                status: 409,
                message: format!("A file named {} already exists", path),
            });
        }
        state.folders.insert(path.clone());
        Ok(DriveState::folder_item(&path))
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, DriveError> {
        let path = path.trim_matches('/');
        self.begin(DriveCall::ReadFile, path)?;
        lock(&self.state)
            .files
            .get(path)
            .map(|f| f.content.clone())
            .ok_or_else(|| DriveError::NotFound(path.to_string()))
    }

    fn write_file(&self, path: &str, content: &[u8]) -> Result<DriveItem, DriveError> {
        let path = path.trim_matches('/');
        self.begin(DriveCall::WriteFile, path)?;
        let mut state = lock(&self.state);
        Ok(Self::store(&mut state, path, content.to_vec()))
    }

    fn list_children(&self, path: &str) -> Result<Vec<DriveItem>, DriveError> {
        let path = path.trim_matches('/');
        self.begin(DriveCall::ListChildren, path)?;

        let state = lock(&self.state);
        if !path.is_empty() && !state.folders.contains(path) {
            return Err(DriveError::NotFound(path.to_string()));
        }

        let is_child = |candidate: &str| parent_of(candidate) == path;
        let folders = state
            .folders
            .iter()
            .filter(|p| is_child(p.as_str()))
            .map(|p| DriveState::folder_item(p));
        let files = state
            .files
            .iter()
            .filter(|(p, _)| is_child(p.as_str()))
            .map(|(p, f)| DriveState::file_item(p, f));

        Ok(folders.chain(files).collect())
    }

    fn get_item_metadata(&self, path: &str) -> Result<DriveItem, DriveError> {
        let path = path.trim_matches('/');
        self.begin(DriveCall::GetItemMetadata, path)?;

        let state = lock(&self.state);
        if let Some(file) = state.files.get(path) {
            return Ok(DriveState::file_item(path, file));
        }
        if state.folders.contains(path) {
            return Ok(DriveState::folder_item(path));
        }
        Err(DriveError::NotFound(path.to_string()))
    }
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}
