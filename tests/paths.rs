mod common;

use serde_json::json;

use common::{gateway_with, signed_in, test_config, MockServer};
use onedrive_gateway::api::drive::{Breadcrumb, ROOT_MARKER};

fn crumb(path: &str, name: &str, id: &str) -> Breadcrumb {
    Breadcrumb {
        path: path.to_string(),
        name: name.to_string(),
        id: id.to_string(),
    }
}

fn root() -> Breadcrumb {
    crumb(ROOT_MARKER, "Home", "root")
}

#[tokio::test]
async fn breadcrumbs_run_root_to_leaf() {
    let server = MockServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let gateway = signed_in(&server, &dir);
    server.add_folder("a", "A");
    server.add_folder("a/b", "B");
    server.add_folder("a/b/c", "C");

    let crumbs = gateway
        .paths()
        .get_path_components("/a//b/c/")
        .await
        .unwrap();
    assert_eq!(
        crumbs,
        vec![
            root(),
            crumb("a", "a", "A"),
            crumb("a/b", "b", "B"),
            crumb("a/b/c", "c", "C"),
        ]
    );
}

#[tokio::test]
async fn failed_prefix_leaves_a_gap() {
    let server = MockServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let gateway = signed_in(&server, &dir);
    server.add_folder("a", "A");
    server.add_folder("a/b", "B");
    server.add_folder("a/b/c", "C");
    server.fail_path("a/b");

    let crumbs = gateway.paths().get_path_components("a/b/c").await.unwrap();
    assert_eq!(
        crumbs,
        vec![root(), crumb("a", "a", "A"), crumb("a/b/c", "c", "C")]
    );
}

#[tokio::test]
async fn deep_paths_keep_order() {
    let server = MockServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let gateway = signed_in(&server, &dir);
    let segments: Vec<String> = (0..20).map(|i| format!("d{i}")).collect();
    for depth in 1..=segments.len() {
        let path = segments[..depth].join("/");
        server.add_folder(&path, &format!("id-{depth}"));
    }

    let crumbs = gateway
        .paths()
        .get_path_components(&segments.join("/"))
        .await
        .unwrap();
    assert_eq!(crumbs.len(), 21);
    for (depth, crumb) in crumbs.iter().enumerate().skip(1) {
        assert_eq!(crumb.id, format!("id-{depth}"));
        assert_eq!(crumb.name, segments[depth - 1]);
    }
}

#[tokio::test]
async fn root_paths_need_no_lookups() {
    let server = MockServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let gateway = signed_in(&server, &dir);

    for path in ["", "/", "root"] {
        let crumbs = gateway.paths().get_path_components(path).await.unwrap();
        assert_eq!(crumbs, vec![root()]);
    }
    assert!(server.drive_requests().is_empty());
}

#[tokio::test]
async fn breadcrumbs_need_a_session() {
    let server = MockServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let gateway = gateway_with(test_config(&server, &dir));
    server.add_folder("a", "A");

    let err = gateway.paths().get_path_components("a").await.unwrap_err();
    assert!(err.is_auth());
}

#[tokio::test]
async fn lookup_failures_surface_as_not_found() {
    let server = MockServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let gateway = signed_in(&server, &dir);
    server.add_folder("broken", "X");
    server.fail_path("broken");

    let err = gateway.paths().get_item_by_path("/broken").await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
    let err = gateway.paths().get_item_by_path("missing").await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

#[tokio::test]
async fn item_by_path_encodes_segments() {
    let server = MockServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let gateway = signed_in(&server, &dir);
    server.add_folder("My Docs/Q&A #1", "QA");

    let item = gateway
        .paths()
        .get_item_by_path("/My Docs//Q&A #1")
        .await
        .unwrap();
    assert_eq!(item.id, "QA");
    assert!(item.is_folder());

    let request = server.drive_requests().pop().unwrap();
    assert_eq!(request.raw_path, "/v1.0/me/drive/root:/My%20Docs/Q%26A%20%231");
    assert!(request
        .header("authorization")
        .is_some_and(|v| v == "Bearer access-0"));
}

#[tokio::test]
async fn children_by_path() {
    let server = MockServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let gateway = signed_in(&server, &dir);
    server.set_children(
        "path:Photos/2024",
        vec![vec![
            json!({ "id": "p1", "name": "beach.jpg", "size": 1200, "file": { "mimeType": "image/jpeg" } }),
            json!({ "id": "p2", "name": "raw", "folder": { "childCount": 4 } }),
        ]],
    );
    server.set_children(
        "root",
        vec![vec![json!({ "id": "top", "name": "Photos", "folder": { "childCount": 1 } })]],
    );

    let children = gateway
        .paths()
        .get_children_by_path("/Photos/2024/")
        .await
        .unwrap();
    let names: Vec<&str> = children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["beach.jpg", "raw"]);
    assert!(children[1].is_folder());

    let top = gateway.paths().get_children_by_path("/").await.unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].id, "top");
}

#[tokio::test]
async fn folder_named_root_is_looked_up_by_path() {
    let server = MockServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let gateway = signed_in(&server, &dir);
    server.add_folder("root", "NAMED-ROOT");
    server.add_folder("root/x", "X");

    let item = gateway.paths().get_item_by_path("root").await.unwrap();
    assert_eq!(item.id, "NAMED-ROOT");
    let request = server.drive_requests().pop().unwrap();
    assert_eq!(request.raw_path, "/v1.0/me/drive/root:/root");

    let crumbs = gateway.paths().get_path_components("root/x").await.unwrap();
    assert_eq!(
        crumbs,
        vec![root(), crumb("root", "root", "NAMED-ROOT"), crumb("root/x", "x", "X")]
    );

    let top = gateway.paths().get_item_by_path("/").await.unwrap();
    assert_eq!(top.id, "root");
}
