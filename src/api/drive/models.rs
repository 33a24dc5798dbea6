use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Whether an item is a folder or a file, with the facet that goes with it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemKind {
    Folder { child_count: Option<i64> },
    File { mime_type: Option<String> },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Thumbnail {
    pub small: Option<String>,
    pub medium: Option<String>,
    pub large: Option<String>,
}

impl Thumbnail {
    /// Smallest available rendition.
    pub fn best_url(&self) -> Option<&str> {
        self.small
            .as_deref()
            .or(self.medium.as_deref())
            .or(self.large.as_deref())
    }
}

/// A OneDrive file or folder as returned by Graph. Never cached; every
/// lookup goes back to the network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteItem {
    pub id: String,
    pub name: String,
    pub size: Option<u64>,
    pub kind: ItemKind,
    pub last_modified: Option<DateTime<Utc>>,
    /// Parent path as Graph reports it, e.g. `/drive/root:/Documents`.
    pub parent_path: Option<String>,
    /// Short-lived pre-authenticated download URL; files only.
    pub download_url: Option<String>,
    pub web_url: Option<String>,
    pub thumbnails: Vec<Thumbnail>,
}

impl RemoteItem {
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, ItemKind::Folder { .. })
    }

    pub fn thumbnail_url(&self) -> Option<&str> {
        self.thumbnails.iter().find_map(Thumbnail::best_url)
    }
}

/// One step of the root-to-leaf trail for a folder path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Breadcrumb {
    pub path: String,
    pub name: String,
    pub id: String,
}

/// Result of a finished transfer.
#[derive(Clone, Debug)]
pub struct UploadReport {
    pub bytes_sent: u64,
    pub chunks: usize,
    /// The created item, when Graph returned one on the final request.
    pub item: Option<RemoteItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DriveItemDto {
    id: String,
    name: Option<String>,
    size: Option<u64>,
    last_modified_date_time: Option<DateTime<Utc>>,
    web_url: Option<String>,
    #[serde(rename = "@microsoft.graph.downloadUrl")]
    download_url: Option<String>,
    folder: Option<FolderFacetDto>,
    file: Option<FileFacetDto>,
    parent_reference: Option<ParentReferenceDto>,
    thumbnails: Option<Vec<ThumbnailSetDto>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FolderFacetDto {
    child_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileFacetDto {
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ParentReferenceDto {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ThumbnailSetDto {
    small: Option<ThumbnailDto>,
    medium: Option<ThumbnailDto>,
    large: Option<ThumbnailDto>,
}

#[derive(Debug, Deserialize)]
struct ThumbnailDto {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DriveChildrenDto {
    pub(crate) value: Vec<DriveItemDto>,
    #[serde(rename = "@odata.nextLink")]
    pub(crate) next_link: Option<String>,
}

impl From<DriveItemDto> for RemoteItem {
    fn from(value: DriveItemDto) -> Self {
        let kind = match value.folder {
            Some(folder) => ItemKind::Folder {
                child_count: folder.child_count,
            },
            None => ItemKind::File {
                mime_type: value.file.and_then(|f| f.mime_type),
            },
        };
        RemoteItem {
            name: value.name.unwrap_or_else(|| value.id.clone()),
            id: value.id,
            size: value.size,
            kind,
            last_modified: value.last_modified_date_time,
            parent_path: value.parent_reference.and_then(|p| p.path),
            download_url: value.download_url,
            web_url: value.web_url,
            thumbnails: value
                .thumbnails
                .unwrap_or_default()
                .into_iter()
                .map(|set| Thumbnail {
                    small: set.small.and_then(|t| t.url),
                    medium: set.medium.and_then(|t| t.url),
                    large: set.large.and_then(|t| t.url),
                })
                .collect(),
        }
    }
}
