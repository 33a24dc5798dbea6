use futures::{stream, StreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::warn;

use super::{
    items::DriveItems,
    models::{Breadcrumb, RemoteItem},
};
use crate::error::{DriveError, DriveResult};

/// Path Graph reports for the drive root in `parentReference.path`.
pub const ROOT_MARKER: &str = "/drive/root:";
pub const ROOT_NAME: &str = "Home";
pub const ROOT_ID: &str = "root";

/// Upper bound on concurrent lookups while building breadcrumbs.
const BREADCRUMB_FANOUT: usize = 8;

/// Characters left as-is inside a path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Collapses runs of `/` and drops one leading slash; `"/a//b/"` becomes
/// `"a/b/"`. Collapsing first keeps the function idempotent.
pub fn normalize_path(path: &str) -> String {
    let mut collapsed = String::with_capacity(path.len());
    let mut previous_slash = false;
    for c in path.chars() {
        if c == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        collapsed.push(c);
    }
    match collapsed.strip_prefix('/') {
        Some(rest) => rest.to_string(),
        None => collapsed,
    }
}

/// `""`, `"/"`, `"root"` and any path with no segments name the drive root.
pub fn is_root_path(path: &str) -> bool {
    let trimmed = path.trim();
    trimmed == ROOT_ID || path_segments(trimmed).is_empty()
}

pub(crate) fn path_segments(path: &str) -> Vec<String> {
    normalize_path(path)
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn encode_segments<S: AsRef<str>>(segments: &[S]) -> String {
    segments
        .iter()
        .map(|segment| utf8_percent_encode(segment.as_ref(), PATH_SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// `root:/a/b` or, with an action, `root:/a/b:/children`.
pub(crate) fn drive_path_url(path: &str, action: &str) -> String {
    let encoded = encode_segments(&path_segments(path));
    if action.is_empty() {
        format!("root:/{encoded}")
    } else {
        format!("root:/{encoded}:/{action}")
    }
}

fn root_breadcrumb() -> Breadcrumb {
    Breadcrumb {
        path: ROOT_MARKER.to_string(),
        name: ROOT_NAME.to_string(),
        id: ROOT_ID.to_string(),
    }
}

/// Turns slash-delimited paths into items, listings and breadcrumb trails.
#[derive(Clone)]
pub struct PathResolver {
    items: DriveItems,
}

impl PathResolver {
    pub fn new(items: DriveItems) -> Self {
        Self { items }
    }

    /// Resolves `path`. Any failure other than an auth challenge is reported
    /// as not-found.
    pub async fn get_item_by_path(&self, path: &str) -> DriveResult<RemoteItem> {
        let normalized = normalize_path(path);
        self.items
            .get_item_by_path(&normalized)
            .await
            .map_err(|err| match err {
                DriveError::Auth(_) | DriveError::NotFound(_) => err,
                other => DriveError::NotFound(format!("{path}: {other}")),
            })
    }

    pub async fn get_children_by_path(&self, path: &str) -> DriveResult<Vec<RemoteItem>> {
        if is_root_path(path) {
            return self.items.list_files(None).await;
        }
        let url = self
            .items
            .client()
            .drive_url(&drive_path_url(path, "children"));
        self.items.collect_children(url, path).await
    }

    /// Root-to-leaf breadcrumbs for `path`, one entry per resolvable prefix.
    ///
    /// Prefixes are resolved concurrently and reassembled in order. A prefix
    /// that fails to resolve is logged and left out, so the trail may have
    /// gaps but never changes order. Auth failures abort the whole call.
    pub async fn get_path_components(&self, path: &str) -> DriveResult<Vec<Breadcrumb>> {
        let mut breadcrumbs = vec![root_breadcrumb()];
        if is_root_path(path) {
            return Ok(breadcrumbs);
        }

        let segments = path_segments(path);
        let prefixes: Vec<(String, String)> = (1..=segments.len())
            .map(|depth| (segments[..depth].join("/"), segments[depth - 1].clone()))
            .collect();

        let resolved: Vec<(String, String, DriveResult<RemoteItem>)> = stream::iter(prefixes)
            .map(|(prefix, name)| async move {
                let item = self.get_item_by_path(&prefix).await;
                (prefix, name, item)
            })
            .buffered(BREADCRUMB_FANOUT)
            .collect()
            .await;

        for (prefix, name, item) in resolved {
            match item {
                Ok(item) => breadcrumbs.push(Breadcrumb {
                    path: prefix,
                    name,
                    id: item.id,
                }),
                Err(err @ DriveError::Auth(_)) => return Err(err),
                Err(err) => {
                    warn!(path = %prefix, error = %err, "failed to resolve path segment; omitting breadcrumb")
                }
            }
        }
        Ok(breadcrumbs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_one_leading_slash_and_collapses() {
        assert_eq!(normalize_path("/a//b/"), "a/b/");
        assert_eq!(normalize_path("a/b"), "a/b");
        assert_eq!(normalize_path("///a"), "a");
        assert_eq!(normalize_path(""), "");
        assert_eq!(normalize_path("/"), "");
        assert_eq!(normalize_path("a///b////c"), "a/b/c");
    }

    #[test]
    fn normalize_is_idempotent() {
        for input in [
            "", "/", "//", "a", "/a", "//a", "a//", "/a//b/", "x/y/z", "///x///y///", "é//ü",
        ] {
            let once = normalize_path(input);
            assert_eq!(normalize_path(&once), once, "input {input:?}");
        }
    }

    #[test]
    fn root_detection() {
        assert!(is_root_path(""));
        assert!(is_root_path("/"));
        assert!(is_root_path("//"));
        assert!(is_root_path("root"));
        assert!(!is_root_path("root/child"));
        assert!(!is_root_path("/Documents"));
    }

    #[test]
    fn segments_are_encoded_individually() {
        assert_eq!(
            drive_path_url("/My Docs//report v2.pdf", ""),
            "root:/My%20Docs/report%20v2.pdf"
        );
        assert_eq!(
            drive_path_url("a/b-c_d.e~f/", "children"),
            "root:/a/b-c_d.e~f:/children"
        );
        assert_eq!(drive_path_url("100%#?", ""), "root:/100%25%23%3F");
    }
}
