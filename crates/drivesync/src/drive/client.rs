//! Microsoft Graph drive HTTP client
//!
//! Addresses items by path under the drive root (`/root:/{path}`).
//! Uses synchronous HTTP (ureq) to be executor-agnostic.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::debug;
use serde::Deserialize;
use serde_json::json;

use super::{DriveApi, DriveError, DriveItem, TokenSource, join_path};

/// Drive item as returned by Graph
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphItem {
    id: String,
    name: String,
    #[serde(default)]
    size: u64,
    folder: Option<serde_json::Value>,
    #[serde(rename = "@microsoft.graph.downloadUrl")]
    download_url: Option<String>,
    last_modified_date_time: Option<DateTime<Utc>>,
}

impl From<GraphItem> for DriveItem {
    fn from(item: GraphItem) -> Self {
        Self {
            id: item.id,
            name: item.name,
            size: item.size,
            is_folder: item.folder.is_some(),
            download_url: item.download_url,
            last_modified: item.last_modified_date_time,
        }
    }
}

/// One page of a children listing
#[derive(Debug, Deserialize)]
struct ChildrenPage {
    value: Vec<GraphItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// Graph drive client for the signed-in user's drive
pub struct GraphDriveClient {
    tokens: Arc<dyn TokenSource>,
    base_url: String,
}

impl GraphDriveClient {
    /// Graph API base URL for the signed-in user's drive
    const BASE_URL: &'static str = "https://graph.microsoft.com/v1.0/me/drive";

    pub fn new(tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            tokens,
            base_url: Self::BASE_URL.to_string(),
        }
    }

    /// Point the client at a different Graph-compatible endpoint
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// URL of the item at `path` (the root itself when empty)
    fn item_url(&self, path: &str) -> String {
        let path = path.trim_matches('/');
        if path.is_empty() {
            format!("{}/root", self.base_url)
        } else {
            format!("{}/root:/{}", self.base_url, encode_path(path))
        }
    }

    /// URL of a sub-resource of the item at `path` (`children`, `content`)
    fn item_resource_url(&self, path: &str, resource: &str) -> String {
        let path = path.trim_matches('/');
        if path.is_empty() {
            format!("{}/root/{}", self.base_url, resource)
        } else {
            format!("{}/root:/{}:/{}", self.base_url, encode_path(path), resource)
        }
    }

    fn authorization(&self) -> Result<String, DriveError> {
        Ok(format!("Bearer {}", self.tokens.bearer_token()?))
    }

    fn get_item(&self, path: &str) -> Result<GraphItem, DriveError> {
        let url = self.item_url(path);
        let mut response = ureq::get(&url)
            .header("Authorization", &self.authorization()?)
            .call()
            .map_err(|e| map_error(e, path))?;

        response
            .body_mut()
            .read_json()
            .map_err(|e| DriveError::Decode(format!("Failed to parse item {}: {}", path, e)))
    }
}

impl DriveApi for GraphDriveClient {
    fn folder_exists(&self, path: &str) -> Result<bool, DriveError> {
        match self.get_item(path) {
            Ok(item) => Ok(item.folder.is_some()),
            Err(DriveError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn create_folder(&self, parent: &str, name: &str) -> Result<DriveItem, DriveError> {
        let url = self.item_resource_url(parent, "children");
        let body = json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        });

        let result = ureq::post(&url)
            .header("Authorization", &self.authorization()?)
            .send_json(&body);

        match result {
            Ok(mut response) => {
                let item: GraphItem = response
                    .body_mut()
                    .read_json()
                    .map_err(|e| DriveError::Decode(format!("Failed to parse created folder: {}", e)))?;
                Ok(item.into())
            }
            Err(ureq::Error::StatusCode(409)) => {
                // Already there; a concurrent connect may have created it.
                debug!("[DRIVE] Folder {} already exists", join_path(parent, name));
                self.get_item_metadata(&join_path(parent, name))
            }
            Err(e) => Err(map_error(e, &join_path(parent, name))),
        }
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, DriveError> {
        let url = self.item_resource_url(path, "content");
        let mut response = ureq::get(&url)
            .header("Authorization", &self.authorization()?)
            .call()
            .map_err(|e| map_error(e, path))?;

        response
            .body_mut()
            .read_to_vec()
            .map_err(|e| DriveError::Connectivity(format!("Failed to read {}: {}", path, e)))
    }

    fn write_file(&self, path: &str, content: &[u8]) -> Result<DriveItem, DriveError> {
        let url = self.item_resource_url(path, "content");
        let mut response = ureq::put(&url)
            .header("Authorization", &self.authorization()?)
            .header("Content-Type", "application/octet-stream")
            .send(content)
            .map_err(|e| map_error(e, path))?;

        let item: GraphItem = response
            .body_mut()
            .read_json()
            .map_err(|e| DriveError::Decode(format!("Failed to parse upload response: {}", e)))?;
        Ok(item.into())
    }

    fn list_children(&self, path: &str) -> Result<Vec<DriveItem>, DriveError> {
        let mut items = Vec::new();
        let mut next = Some(self.item_resource_url(path, "children"));

        while let Some(url) = next {
            let mut response = ureq::get(&url)
                .header("Authorization", &self.authorization()?)
                .call()
                .map_err(|e| map_error(e, path))?;

            let page: ChildrenPage = response
                .body_mut()
                .read_json()
                .map_err(|e| DriveError::Decode(format!("Failed to parse listing of {}: {}", path, e)))?;

            items.extend(page.value.into_iter().map(DriveItem::from));
            next = page.next_link;
        }

        Ok(items)
    }

    fn get_item_metadata(&self, path: &str) -> Result<DriveItem, DriveError> {
        self.get_item(path).map(DriveItem::from)
    }
}

/// Percent-encode each path segment, keeping the separators
fn encode_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn map_error(error: ureq::Error, path: &str) -> DriveError {
    match error {
        ureq::Error::StatusCode(401) | ureq::Error::StatusCode(403) => {
            DriveError::Unauthorized(format!("Access denied for {}", path))
        }
        ureq::Error::StatusCode(404) => DriveError::NotFound(path.to_string()),
        ureq::Error::StatusCode(status) => DriveError::Http {
            status,
            message: format!("Request for {} failed", path),
        },
        other => DriveError::Connectivity(other.to_string()),
    }
}
