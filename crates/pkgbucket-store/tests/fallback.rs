//! Download fallback against a fake public registry running in-process.

use pkgbucket_remote::{MemoryStore, Operation};
use pkgbucket_store::{Database, DownloadEvent, StoreConfig};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tiny_http::{Header, Response, Server};

/// Serves `/<package>/-/<file>` from a fixed table and records request paths.
struct FakeRegistry {
    url: String,
    requests: Arc<Mutex<Vec<String>>>,
    server: Arc<Server>,
    _handle: std::thread::JoinHandle<()>,
}

impl FakeRegistry {
    fn start(tarballs: Vec<(&'static str, Vec<u8>)>) -> Self {
        let server = Arc::new(Server::http("127.0.0.1:0").unwrap());
        let port = server.server_addr().to_ip().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let srv = Arc::clone(&server);
        let seen = Arc::clone(&requests);
        let handle = std::thread::spawn(move || {
            for req in srv.incoming_requests() {
                let url = req.url().to_owned();
                seen.lock().unwrap().push(url.clone());
                match tarballs.iter().find(|(path, _)| *path == url) {
                    Some((_, data)) => {
                        let header = Header::from_bytes("Content-Type", "application/octet-stream")
                            .unwrap();
                        let _ = req.respond(Response::from_data(data.clone()).with_header(header));
                    }
                    None => {
                        let _ = req.respond(Response::from_string("not found").with_status_code(404));
                    }
                }
            }
        });

        Self {
            url: format!("http://127.0.0.1:{port}"),
            requests,
            server,
            _handle: handle,
        }
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for FakeRegistry {
    fn drop(&mut self) {
        self.server.unblock();
    }
}

/// One-shot registry that answers the first request with a raw response
/// after `delay`, whatever its headers claim.
fn raw_registry(response: &'static str, delay: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => request.extend_from_slice(&buf[..n]),
            }
        }
        std::thread::sleep(delay);
        let _ = stream.write_all(response.as_bytes());
    });
    format!("http://127.0.0.1:{port}")
}

fn database(fallback: &str) -> (Arc<MemoryStore>, Database) {
    let store = Arc::new(MemoryStore::new());
    let mut config = StoreConfig::new("registry");
    config.key_prefix = "npm".to_owned();
    config.fallback_registry = fallback.to_owned();
    let db = Database::new(config, store.clone()).unwrap();
    (store, db)
}

#[tokio::test]
async fn missing_tarball_is_served_from_fallback() {
    let tarball = vec![42u8; 100 * 1024];
    let registry = FakeRegistry::start(vec![("/left-pad/-/left-pad-1.0.0.tgz", tarball.clone())]);
    let (store, db) = database(&registry.url);

    let mut reader = db.package("left-pad").read_tarball("left-pad-1.0.0.tgz");
    let mut events = Vec::new();
    let mut body = Vec::new();
    while let Some(event) = reader.next_event().await {
        match event {
            DownloadEvent::Data(chunk) => body.extend_from_slice(&chunk),
            DownloadEvent::End => {
                events.push("end");
                break;
            }
            DownloadEvent::ContentLength(len) => {
                assert_eq!(len, tarball.len() as u64);
                events.push("length");
            }
            DownloadEvent::Open => events.push("open"),
            DownloadEvent::Error(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(events, vec!["length", "open", "end"]);
    assert_eq!(body, tarball);
    assert_eq!(store.calls(Operation::Get), 1);
    assert_eq!(registry.requests(), vec!["/left-pad/-/left-pad-1.0.0.tgz"]);
}

#[tokio::test]
async fn stored_tarball_does_not_touch_fallback() {
    let registry = FakeRegistry::start(vec![]);
    let (store, db) = database(&registry.url);
    store.insert("npm/left-pad/left-pad-1.0.0.tgz", "from the bucket");

    let body = db
        .package("left-pad")
        .read_tarball("left-pad-1.0.0.tgz")
        .read_to_end()
        .await
        .unwrap();
    assert_eq!(&body[..], b"from the bucket");
    assert!(registry.requests().is_empty());
}

#[tokio::test]
async fn missing_everywhere_is_not_found() {
    let registry = FakeRegistry::start(vec![]);
    let (_store, db) = database(&registry.url);
    let err = db
        .package("left-pad")
        .read_tarball("left-pad-3.0.0.tgz")
        .read_to_end()
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.status(), 404);
    assert_eq!(registry.requests(), vec!["/left-pad/-/left-pad-3.0.0.tgz"]);
}

#[tokio::test]
async fn scoped_packages_use_full_name() {
    let registry = FakeRegistry::start(vec![("/@fleet/core/-/core-1.0.0.tgz", b"scoped".to_vec())]);
    let (_store, db) = database(&registry.url);
    let body = db
        .package("@fleet/core")
        .read_tarball("core-1.0.0.tgz")
        .read_to_end()
        .await
        .unwrap();
    assert_eq!(&body[..], b"scoped");
}

#[tokio::test]
async fn oversized_content_length_is_only_a_hint() {
    let url = raw_registry(
        "HTTP/1.1 200 OK\r\nContent-Length: 9000000000000000000\r\nConnection: close\r\n\r\nabc",
        Duration::ZERO,
    );
    let (_store, db) = database(&url);
    let result = db
        .package("left-pad")
        .read_tarball("left-pad-1.0.0.tgz")
        .read_to_end()
        .await;
    // The body ends early, so the transfer may fail, but it must fail as an error.
    match result {
        Ok(body) => assert_eq!(&body[..], b"abc"),
        Err(e) => assert!(e.status() == 500 || e.is_not_found(), "unexpected error: {e}"),
    }
}

#[tokio::test]
async fn abort_during_slow_fallback_emits_nothing() {
    let url = raw_registry(
        "HTTP/1.1 200 OK\r\nContent-Length: 3\r\nConnection: close\r\n\r\nabc",
        Duration::from_millis(800),
    );
    let (_store, db) = database(&url);
    let mut reader = db.package("left-pad").read_tarball("left-pad-1.0.0.tgz");
    tokio::time::sleep(Duration::from_millis(150)).await;
    reader.abort();

    let mut after_abort = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = reader.next_event().await {
            after_abort.push(format!("{event:?}"));
        }
    })
    .await
    .unwrap();
    assert!(after_abort.is_empty(), "events after abort: {after_abort:?}");
}
