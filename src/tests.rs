// Whole requests through DavHandler, against MemStore and a local directory.
use std::sync::Arc;

use futures_util::StreamExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::store::memstore::MemStore;
use crate::store::ConnectionPool;
use crate::{DavBuilder, DavHandler, FileSystem, LockSystem, Sendfile};

// alice:secret
const AUTH: &str = "Basic YWxpY2U6c2VjcmV0";

struct Fixture {
    cache: tempfile::TempDir,
    store: Arc<MemStore>,
    dav: DavHandler,
}

fn fixture(ls: LockSystem) -> Fixture {
    fixture_with(|b| b.locksystem(ls))
}

fn fixture_with(configure: impl FnOnce(DavBuilder) -> DavBuilder) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let cache = tempfile::tempdir().unwrap();
    let store = MemStore::new();
    store.add_bucket("b");
    let builder = DavHandler::builder(FileSystem::object_store(
        ConnectionPool::single(store.clone()),
        cache.path(),
    ));
    let dav = configure(builder).build();
    Fixture {
        cache,
        store,
        dav,
    }
}

fn req(method: &str, path: &str) -> http::request::Builder {
    Request::builder()
        .method(method)
        .uri(path)
        .header("host", "localhost")
        .header("authorization", AUTH)
}

async fn send(dav: &DavHandler, req: Request<Body>) -> Response<Body> {
    dav.handle(req).await
}

async fn text(res: Response<Body>) -> String {
    let mut body = res.into_body();
    let mut data = Vec::new();
    while let Some(chunk) = body.next().await {
        data.extend_from_slice(&chunk.unwrap());
    }
    String::from_utf8(data).unwrap()
}

async fn put(dav: &DavHandler, path: &str, data: &str) -> Response<Body> {
    send(dav, req("PUT", path).body(Body::from(data)).unwrap()).await
}

#[tokio::test]
async fn needs_credentials() {
    let f = fixture(LockSystem::Fake);
    let anon = Request::builder()
        .method("GET")
        .uri("/b/")
        .body(Body::empty())
        .unwrap();
    let res = send(&f.dav, anon).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert!(res.headers().contains_key("www-authenticate"));

    let res = send(&f.dav, req("GET", "/b/").body(Body::empty()).unwrap()).await;
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn put_get_and_conditional_get() {
    let f = fixture(LockSystem::Fake);
    let res = put(&f.dav, "/b/hello.txt", "hello world").await;
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(f.store.contents("b", "hello.txt").unwrap(), "hello world");

    let res = put(&f.dav, "/b/hello.txt", "hello again").await;
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let res = send(&f.dav, req("GET", "/b/hello.txt").body(Body::empty()).unwrap()).await;
    assert_eq!(res.status(), StatusCode::OK);
    let etag = res.headers().get("etag").unwrap().clone();
    assert!(res.headers().contains_key("last-modified"));
    assert_eq!(text(res).await, "hello again");

    let res = send(
        &f.dav,
        req("GET", "/b/hello.txt")
            .header("if-none-match", etag.clone())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::NOT_MODIFIED);

    let res = send(
        &f.dav,
        req("PUT", "/b/hello.txt")
            .header("if-match", "\"not-the-etag\"")
            .body(Body::from("lost update"))
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::PRECONDITION_FAILED);
    assert_eq!(f.store.contents("b", "hello.txt").unwrap(), "hello again");

    let res = send(&f.dav, req("HEAD", "/b/hello.txt").body(Body::empty()).unwrap()).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers().get("content-length").unwrap(), "11");
    assert_eq!(text(res).await, "");
}

#[tokio::test]
async fn put_needs_parent() {
    let f = fixture(LockSystem::Fake);
    let res = put(&f.dav, "/b/missing/file", "x").await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let res = put(&f.dav, "/", "x").await;
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn mkcol() {
    let f = fixture(LockSystem::Fake);
    let mkcol = |path: &str| req("MKCOL", path).body(Body::empty()).unwrap();

    assert_eq!(send(&f.dav, mkcol("/b/a/b")).await.status(), StatusCode::CONFLICT);
    assert_eq!(send(&f.dav, mkcol("/b/a")).await.status(), StatusCode::CREATED);
    assert_eq!(
        send(&f.dav, mkcol("/b/a")).await.status(),
        StatusCode::METHOD_NOT_ALLOWED
    );
    assert_eq!(send(&f.dav, mkcol("/b/a/b")).await.status(), StatusCode::CREATED);
    assert_eq!(f.store.keys("b"), vec!["a/", "a/b/"]);

    // a new bucket.
    assert_eq!(send(&f.dav, mkcol("/fresh")).await.status(), StatusCode::CREATED);
    let res = send(
        &f.dav,
        req("MKCOL", "/b/c").body(Body::from("<x/>")).unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn propfind_depth_one() {
    let f = fixture(LockSystem::Fake);
    f.store.insert("b", "top.txt", "123");
    f.store.insert("b", "dir/inner.txt", "4567");

    let res = send(
        &f.dav,
        req("PROPFIND", "/b/")
            .header("depth", "1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::MULTI_STATUS);
    let xml = text(res).await;
    assert!(xml.contains("<D:href>/b/</D:href>"));
    assert!(xml.contains("<D:href>/b/dir/</D:href>"));
    assert!(xml.contains("<D:href>/b/top.txt</D:href>"));
    assert!(xml.contains("<D:getcontentlength>3</D:getcontentlength>"));
    assert!(!xml.contains("inner.txt"));

    let res = send(
        &f.dav,
        req("PROPFIND", "/")
            .header("depth", "1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::MULTI_STATUS);
    assert!(text(res).await.contains("<D:href>/b/</D:href>"));

    let res = send(
        &f.dav,
        req("PROPFIND", "/b/nope").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn proppatch_then_propfind() {
    let f = fixture(LockSystem::Fake);
    f.store.insert("b", "doc", "x");

    let patch = r#"<?xml version="1.0"?>
        <D:propertyupdate xmlns:D="DAV:" xmlns:Z="urn:example">
          <D:set><D:prop><Z:color>red</Z:color></D:prop></D:set>
        </D:propertyupdate>"#;
    let res = send(
        &f.dav,
        req("PROPPATCH", "/b/doc").body(Body::from(patch)).unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::MULTI_STATUS);
    assert!(text(res).await.contains("200 OK"));

    let find = r#"<?xml version="1.0"?>
        <D:propfind xmlns:D="DAV:" xmlns:Z="urn:example">
          <D:prop><Z:color/></D:prop>
        </D:propfind>"#;
    let res = send(
        &f.dav,
        req("PROPFIND", "/b/doc")
            .header("depth", "0")
            .body(Body::from(find))
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::MULTI_STATUS);
    assert!(text(res).await.contains(">red<"));
}

#[tokio::test]
async fn copy_overwrite() {
    let f = fixture(LockSystem::Fake);
    f.store.insert("b", "src", "source data");
    f.store.insert("b", "dst", "old data");

    let copy = |overwrite: &str| {
        req("COPY", "/b/src")
            .header("destination", "http://localhost/b/dst")
            .header("overwrite", overwrite)
            .body(Body::empty())
            .unwrap()
    };
    let res = send(&f.dav, copy("F")).await;
    assert_eq!(res.status(), StatusCode::PRECONDITION_FAILED);
    assert_eq!(f.store.contents("b", "dst").unwrap(), "old data");

    let res = send(&f.dav, copy("T")).await;
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(f.store.contents("b", "dst").unwrap(), "source data");
    assert_eq!(f.store.contents("b", "src").unwrap(), "source data");

    let res = send(
        &f.dav,
        req("COPY", "/b/src")
            .header("destination", "http://elsewhere.example/b/x")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
}


fn copymove(method: &str, from: &str, to: Option<&str>) -> http::request::Builder {
    let builder = req(method, from);
    match to {
        Some(to) => builder.header("destination", format!("http://localhost{to}")),
        None => builder,
    }
}

// leaf keys and their contents below a prefix, without the prefix.
fn files(store: &MemStore, prefix: &str) -> Vec<(String, String)> {
    store
        .keys("b")
        .into_iter()
        .filter(|k| k.starts_with(prefix) && !k.ends_with('/'))
        .map(|k| {
            let data = store.contents("b", &k).unwrap();
            let data = String::from_utf8(data.to_vec()).unwrap();
            (k[prefix.len()..].to_string(), data)
        })
        .collect()
}

#[tokio::test]
async fn copy_collection_depth_infinity() {
    let f = fixture(LockSystem::Fake);
    f.store.insert("b", "dir/a", "1");
    f.store.insert("b", "dir/sub/b", "2");
    f.store.insert("b", "dir/sub/deeper/c", "3");
    let before = files(&f.store, "dir/");

    let copy = copymove("COPY", "/b/dir", Some("/b/copy"));
    let res = send(&f.dav, copy.body(Body::empty()).unwrap()).await;
    assert_eq!(res.status(), StatusCode::CREATED);

    let res = send(&f.dav, req("DELETE", "/b/dir").body(Body::empty()).unwrap()).await;
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert!(files(&f.store, "dir/").is_empty());
    assert_eq!(files(&f.store, "copy/"), before);

    let res = send(&f.dav, req("GET", "/b/copy/sub/deeper/c").body(Body::empty()).unwrap()).await;
    assert_eq!(text(res).await, "3");
}

#[tokio::test]
async fn copy_collection_depth_zero() {
    let f = fixture(LockSystem::Fake);
    f.store.insert("b", "dir/a", "1");
    f.store.insert("b", "dir/sub/b", "2");

    let res = send(
        &f.dav,
        copymove("COPY", "/b/dir", Some("/b/empty"))
            .header("depth", "0")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let keys = f.store.keys("b");
    let copied: Vec<_> = keys.iter().filter(|k| k.starts_with("empty")).collect();
    assert_eq!(copied, vec!["empty/"]);
    assert_eq!(files(&f.store, "dir/").len(), 2);
}

#[tokio::test]
async fn copymove_bad_requests() {
    let f = fixture(LockSystem::Fake);
    f.store.insert("b", "dir/a", "1");
    f.store.insert("b", "file", "x");

    let res = send(
        &f.dav,
        copymove("MOVE", "/b/dir", Some("/b/moved"))
            .header("depth", "0")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = send(
        &f.dav,
        copymove("COPY", "/b/file", Some("/b/other"))
            .header("overwrite", "X")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    for method in ["COPY", "MOVE"] {
        let no_destination = copymove(method, "/b/file", None);
        let res = send(&f.dav, no_destination.body(Body::empty()).unwrap()).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{method}");
    }

    // nothing was touched.
    assert_eq!(f.store.keys("b"), vec!["dir/a", "file"]);
}

#[tokio::test]
async fn file_cannot_become_a_bucket() {
    let f = fixture(LockSystem::Fake);
    f.store.insert("b", "file", "x");

    for method in ["COPY", "MOVE"] {
        let to_bucket = copymove(method, "/b/file", Some("/x"));
        let res = send(&f.dav, to_bucket.body(Body::empty()).unwrap()).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN, "{method}");
    }
    assert_eq!(f.store.keys("b"), vec!["file"]);

    // a collection may.
    f.store.insert("b", "dir/a", "1");
    let to_bucket = copymove("COPY", "/b/dir", Some("/x"));
    let res = send(&f.dav, to_bucket.body(Body::empty()).unwrap()).await;
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(f.store.contents("x", "a").unwrap(), "1");
}

async fn move_dir_with(n: usize) {
    let f = fixture(LockSystem::Fake);
    if n == 0 {
        f.store.insert("b", "dir/", "");
    }
    for i in 0..n {
        f.store.insert("b", &format!("dir/f{i}"), format!("data {i}"));
    }

    let res = send(
        &f.dav,
        req("MOVE", "/b/dir")
            .header("destination", "/b/moved")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::CREATED, "{n} children");

    let mut expected = vec!["moved/".to_string()];
    expected.extend((0..n).map(|i| format!("moved/f{i}")));
    assert_eq!(f.store.keys("b"), expected);
    for i in 0..n {
        assert_eq!(
            f.store.contents("b", &format!("moved/f{i}")).unwrap(),
            format!("data {i}")
        );
    }
}

#[tokio::test]
async fn move_recursive() {
    move_dir_with(0).await;
    move_dir_with(1).await;
    move_dir_with(7).await;
}

#[tokio::test]
async fn move_into_itself() {
    let f = fixture(LockSystem::Fake);
    f.store.insert("b", "dir/f", "x");
    let res = send(
        &f.dav,
        req("MOVE", "/b/dir")
            .header("destination", "/b/dir/sub")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(f.store.keys("b"), vec!["dir/f"]);
}

#[tokio::test]
async fn delete_tree() {
    let f = fixture(LockSystem::Fake);
    f.store.insert("b", "dir/a", "1");
    f.store.insert("b", "dir/sub/b", "2");
    f.store.insert("b", "keep", "3");

    let res = send(&f.dav, req("DELETE", "/b/dir").body(Body::empty()).unwrap()).await;
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(f.store.keys("b"), vec!["keep"]);

    let res = send(&f.dav, req("DELETE", "/b/dir").body(Body::empty()).unwrap()).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let res = send(&f.dav, req("DELETE", "/").body(Body::empty()).unwrap()).await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn delete_hidden_subtree() {
    let f = fixture(LockSystem::Fake);
    // "d/x" is shown as a file, "d/x/y" is hidden behind it.
    f.store.insert("b", "d/", "");
    f.store.insert("b", "d/x", "leaf");
    f.store.insert("b", "d/x/y", "hidden");

    let res = send(&f.dav, req("DELETE", "/b/d").body(Body::empty()).unwrap()).await;
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert!(f.store.keys("b").is_empty());

    let res = send(
        &f.dav,
        req("PROPFIND", "/b/d")
            .header("depth", "0")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

fn cached(f: &Fixture, key: &str) -> std::path::PathBuf {
    f.cache.path().join("b").join(key)
}

#[tokio::test]
async fn sendfile_x_sendfile() {
    let f = fixture_with(|b| b.sendfile(Sendfile::XSendfile { escape: false }));
    f.store.insert("b", "big.bin", "0123456789");

    // HEAD does not need the bytes.
    let res = send(&f.dav, req("HEAD", "/b/big.bin").body(Body::empty()).unwrap()).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["content-length"], "10");
    assert!(res.headers().get("x-sendfile").is_none());
    assert!(!cached(&f, "big.bin").exists());

    let res = send(&f.dav, req("GET", "/b/big.bin").body(Body::empty()).unwrap()).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["content-length"], "10");
    let local = cached(&f, "big.bin");
    assert_eq!(res.headers()["x-sendfile"], local.to_str().unwrap());
    assert_eq!(std::fs::read(&local).unwrap(), b"0123456789");
    assert!(text(res).await.is_empty());
}

#[tokio::test]
async fn sendfile_x_accel_redirect() {
    let f = fixture_with(|b| {
        b.sendfile(Sendfile::XAccelRedirect {
            prefix: "/protected".to_string(),
        })
    });
    f.store.insert("b", "big.bin", "0123456789");

    let res = send(&f.dav, req("GET", "/b/big.bin").body(Body::empty()).unwrap()).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["content-length"], "10");
    assert_eq!(res.headers()["x-accel-charset"], "utf-8");
    let expected = format!("/protected{}", cached(&f, "big.bin").display());
    assert_eq!(res.headers()["x-accel-redirect"], expected.as_str());
    assert!(text(res).await.is_empty());
}

#[tokio::test]
async fn lock_unlock() {
    let f = fixture(LockSystem::Mem);
    f.store.insert("b", "locked.txt", "v1");

    let lockinfo = r#"<?xml version="1.0"?>
        <D:lockinfo xmlns:D="DAV:">
          <D:lockscope><D:exclusive/></D:lockscope>
          <D:locktype><D:write/></D:locktype>
          <D:owner>alice</D:owner>
        </D:lockinfo>"#;
    let res = send(
        &f.dav,
        req("LOCK", "/b/locked.txt")
            .header("timeout", "Second-600")
            .body(Body::from(lockinfo))
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::OK);
    let token = res
        .headers()
        .get("lock-token")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(text(res).await.contains("<D:timeout>Second-600</D:timeout>"));

    // a second exclusive lock conflicts.
    let res = send(
        &f.dav,
        req("LOCK", "/b/locked.txt").body(Body::from(lockinfo)).unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::LOCKED);

    let res = put(&f.dav, "/b/locked.txt", "v2").await;
    assert_eq!(res.status(), StatusCode::LOCKED);
    assert_eq!(f.store.contents("b", "locked.txt").unwrap(), "v1");

    let res = send(
        &f.dav,
        req("PUT", "/b/locked.txt")
            .header("if", format!("({token})"))
            .body(Body::from("v2"))
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(f.store.contents("b", "locked.txt").unwrap(), "v2");

    let unlock = || {
        req("UNLOCK", "/b/locked.txt")
            .header("lock-token", token.clone())
            .body(Body::empty())
            .unwrap()
    };
    assert_eq!(send(&f.dav, unlock()).await.status(), StatusCode::NO_CONTENT);
    assert_eq!(send(&f.dav, unlock()).await.status(), StatusCode::CONFLICT);

    let res = put(&f.dav, "/b/locked.txt", "v3").await;
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn lock_creates_resource() {
    let f = fixture(LockSystem::Mem);
    let lockinfo = r#"<D:lockinfo xmlns:D="DAV:">
          <D:lockscope><D:exclusive/></D:lockscope>
          <D:locktype><D:write/></D:locktype>
        </D:lockinfo>"#;
    let res = send(
        &f.dav,
        req("LOCK", "/b/new").body(Body::from(lockinfo)).unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    assert!(res.headers().contains_key("lock-token"));
    assert_eq!(f.store.contents("b", "new").unwrap(), "");
}

#[tokio::test]
async fn options() {
    let f = fixture(LockSystem::Fake);
    f.store.insert("b", "file", "x");
    let res = send(&f.dav, req("OPTIONS", "/b/file").body(Body::empty()).unwrap()).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers().get("dav").unwrap(), "1,2");
    let allow = res.headers().get("allow").unwrap().to_str().unwrap();
    assert!(allow.contains("PROPFIND"));
    assert!(!allow.contains("MKCOL"));
}

#[tokio::test]
async fn local_directory() {
    let dir = tempfile::tempdir().unwrap();
    let dav = DavHandler::builder(FileSystem::local(dir.path())).build();
    let local = |method: &str, path: &str, body: Body| {
        Request::builder()
            .method(method)
            .uri(path)
            .body(body)
            .unwrap()
    };

    let res = send(&dav, local("MKCOL", "/sub", Body::empty())).await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let res = send(&dav, local("PUT", "/sub/file.txt", Body::from("on disk"))).await;
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("sub/file.txt")).unwrap(),
        "on disk"
    );

    let res = send(&dav, local("GET", "/sub/file.txt", Body::empty())).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(text(res).await, "on disk");

    let res = send(&dav, local("GET", "/sub/", Body::empty())).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert!(text(res).await.contains("file.txt"));

    let res = send(&dav, local("DELETE", "/sub", Body::empty())).await;
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert!(!dir.path().join("sub").exists());
}
