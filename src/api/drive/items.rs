use tracing::debug;

use super::{
    client::GraphClient,
    models::{DriveChildrenDto, DriveItemDto, RemoteItem},
    paths::{drive_path_url, path_segments, ROOT_MARKER},
};
use crate::error::{DriveError, DriveResult};

/// Expands thumbnails on listings so callers can render previews without a
/// second round-trip.
const LIST_QUERY: &str = "?$expand=thumbnails";

/// Stateless accessor for listings and item metadata. Every call needs a
/// valid session and goes to the network.
#[derive(Clone)]
pub struct DriveItems {
    client: GraphClient,
}

impl DriveItems {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &GraphClient {
        &self.client
    }

    /// Children of `folder_id`, or of the drive root when `None`. Follows
    /// `@odata.nextLink` until the listing is complete.
    pub async fn list_files(&self, folder_id: Option<&str>) -> DriveResult<Vec<RemoteItem>> {
        let url = match folder_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => self
                .client
                .drive_url(&format!("items/{id}/children{LIST_QUERY}")),
            None => self.client.drive_url(&format!("root/children{LIST_QUERY}")),
        };
        let what = folder_id.unwrap_or("root").to_string();
        self.collect_children(url, &what).await
    }

    pub async fn get_item_by_id(&self, item_id: &str) -> DriveResult<RemoteItem> {
        let item_id = require_id(item_id)?;
        let url = self.client.drive_url(&format!("items/{item_id}"));
        let dto: DriveItemDto = self.client.get_json(&url, item_id).await?;
        Ok(dto.into())
    }

    /// Looks an item up by its drive-relative path. Only a path without
    /// segments resolves to the root folder; `"root"` names a folder.
    pub async fn get_item_by_path(&self, path: &str) -> DriveResult<RemoteItem> {
        let url = if path_segments(path).is_empty() {
            self.client.drive_url("root")
        } else {
            self.client.drive_url(&drive_path_url(path, ""))
        };
        let dto: DriveItemDto = self.client.get_json(&url, path).await?;
        Ok(dto.into())
    }

    /// Resolves the short-lived download URL of a file, falling back to its
    /// web URL.
    pub async fn get_download_url(&self, item_id: &str) -> DriveResult<String> {
        let item = self.get_item_by_id(item_id).await?;
        item.download_url.or(item.web_url).ok_or_else(|| {
            DriveError::NotFound(format!("no download URL available for {item_id}"))
        })
    }

    /// Drive-relative path of an item, without a leading slash.
    pub async fn get_path_for_item(&self, item_id: &str) -> DriveResult<String> {
        let item = self.get_item_by_id(item_id).await?;
        Ok(item_path(item.parent_path.as_deref(), &item.name))
    }

    pub(crate) async fn collect_children(
        &self,
        first_url: String,
        what: &str,
    ) -> DriveResult<Vec<RemoteItem>> {
        let mut items = Vec::new();
        let mut next = Some(first_url);
        while let Some(url) = next {
            let page: DriveChildrenDto = self.client.get_json(&url, what).await?;
            items.extend(page.value.into_iter().map(RemoteItem::from));
            next = page.next_link;
            if next.is_some() {
                debug!(what, fetched = items.len(), "following nextLink");
            }
        }
        Ok(items)
    }
}

fn require_id(item_id: &str) -> DriveResult<&str> {
    let trimmed = item_id.trim();
    if trimmed.is_empty() {
        return Err(DriveError::InvalidInput("drive item id is required".to_string()));
    }
    Ok(trimmed)
}

pub(crate) fn item_path(parent_path: Option<&str>, name: &str) -> String {
    let parent = parent_path.unwrap_or_default();
    let parent = parent.strip_prefix(ROOT_MARKER).unwrap_or(parent);
    let joined = format!("{parent}/{name}");
    joined.strip_prefix('/').unwrap_or(&joined).to_string()
}
