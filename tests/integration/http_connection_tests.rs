//! `HttpConnection` against a minimal local HTTP responder.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serial_test::serial;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use adt_locksmith::config::{Credentials, GlobalConfig};
use adt_locksmith::connection::http::HttpConnection;
use adt_locksmith::connection::{Connection, HttpMethod, RequestSpec};
use adt_locksmith::models::session::{Session, SessionMode};
use adt_locksmith::persistence::session_store::SessionStore;
use adt_locksmith::AppError;

const TOKEN: &str = "FRESH-TOKEN";

#[derive(Debug, Clone)]
struct Seen {
    method: String,
    target: String,
    headers: BTreeMap<String, String>,
}

/// Serve one request per TCP connection. CSRF fetches get a token and a
/// session cookie; mutating requests need that token; `/missing` is a 404.
async fn spawn_server() -> (String, Arc<Mutex<Vec<Seen>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut reader = BufReader::new(read);
                let mut line = String::new();
                reader.read_line(&mut line).await.expect("request line");
                let mut parts = line.split_whitespace();
                let method = parts.next().unwrap_or_default().to_owned();
                let target = parts.next().unwrap_or_default().to_owned();

                let mut headers = BTreeMap::new();
                loop {
                    let mut header = String::new();
                    reader.read_line(&mut header).await.expect("header line");
                    let header = header.trim_end();
                    if header.is_empty() {
                        break;
                    }
                    if let Some((name, value)) = header.split_once(':') {
                        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
                    }
                }
                let length: usize = headers
                    .get("content-length")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                let mut body = vec![0; length];
                reader.read_exact(&mut body).await.expect("body");

                let response = if headers.get("x-csrf-token").map(String::as_str) == Some("fetch") {
                    format!(
                        "HTTP/1.1 200 OK\r\nx-csrf-token: {TOKEN}\r\nset-cookie: SAP_SESSIONID=abc; path=/; HttpOnly\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                    )
                } else if target.starts_with("/missing") {
                    "HTTP/1.1 404 Not Found\r\ncontent-length: 7\r\nconnection: close\r\n\r\nmissing".to_owned()
                } else if method != "GET"
                    && headers.get("x-csrf-token").map(String::as_str) != Some(TOKEN)
                {
                    "HTTP/1.1 403 Forbidden\r\nx-csrf-token: Required\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_owned()
                } else {
                    "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok".to_owned()
                };

                log.lock().unwrap().push(Seen {
                    method,
                    target,
                    headers,
                });
                let _ = write.write_all(response.as_bytes()).await;
                let _ = write.shutdown().await;
            });
        }
    });

    (format!("http://{addr}"), seen)
}

fn config(base_url: String) -> GlobalConfig {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let mut config = GlobalConfig::default_for(Some(base_url));
    config.client = Some("100".into());
    config.credentials = Credentials::Basic {
        username: "DEVELOPER".into(),
        password: "secret".into(),
    };
    config
}

#[tokio::test]
#[serial]
async fn mutating_request_fetches_csrf_and_persists_session() {
    let (base_url, seen) = spawn_server().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path());
    let session = store.create("s1", false).expect("session");

    let conn = HttpConnection::new(&config(base_url), store.clone(), session).expect("connection");
    let response = conn
        .make_request(RequestSpec::new(HttpMethod::Post, "/sap/bc/adt/oo/classes/zcl_test"))
        .await
        .expect("post");
    assert_eq!(response.data, "ok");

    let requests = seen.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].method, "GET");
    assert!(requests[0].target.starts_with("/sap/bc/adt/discovery"));
    assert_eq!(requests[1].method, "POST");
    assert!(requests[1].target.contains("sap-client=100"), "{}", requests[1].target);
    assert_eq!(requests[1].headers.get("x-csrf-token").map(String::as_str), Some(TOKEN));
    assert_eq!(
        requests[1].headers.get("cookie").map(String::as_str),
        Some("SAP_SESSIONID=abc")
    );
    assert_eq!(
        requests[1].headers.get("x-sap-adt-sessiontype").map(String::as_str),
        Some("stateless")
    );
    assert!(requests[1].headers.contains_key("authorization"));

    let stored = store.load("s1").expect("load").expect("present");
    assert_eq!(stored.csrf_token.as_deref(), Some(TOKEN));
    assert_eq!(stored.cookies, "SAP_SESSIONID=abc");
}

#[tokio::test]
#[serial]
async fn rejected_csrf_token_is_refetched_once() {
    let (base_url, seen) = spawn_server().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path());
    let mut session = Session::new("s2");
    session.set_csrf_token(Some("EXPIRED".into()));
    store.save(&session).expect("save");

    let conn = HttpConnection::new(&config(base_url), store.clone(), session).expect("connection");
    conn.set_session_mode(SessionMode::Stateful);
    conn.make_request(RequestSpec::new(HttpMethod::Put, "/sap/bc/adt/programs/programs/zr/source/main"))
        .await
        .expect("retried put");

    let methods: Vec<_> = seen.lock().unwrap().iter().map(|s| s.method.clone()).collect();
    assert_eq!(methods, vec!["PUT", "GET", "PUT"]);
    let last = seen.lock().unwrap().last().cloned().expect("last request");
    assert_eq!(
        last.headers.get("x-sap-adt-sessiontype").map(String::as_str),
        Some("stateful")
    );
    assert_eq!(
        store.load("s2").expect("load").expect("present").csrf_token.as_deref(),
        Some(TOKEN)
    );
}

#[tokio::test]
#[serial]
async fn non_success_status_is_remote_rejected() {
    let (base_url, _seen) = spawn_server().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path());
    let session = store.create("s3", false).expect("session");

    let conn = HttpConnection::new(&config(base_url), store, session).expect("connection");
    let err = conn
        .make_request(RequestSpec::new(HttpMethod::Get, "/missing"))
        .await
        .expect_err("404");
    assert!(matches!(err, AppError::RemoteRejected { status: 404, ref body } if body == "missing"));
}

#[tokio::test]
#[serial]
async fn unreachable_server_is_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path());
    let session = store.create("s4", false).expect("session");
    let conn =
        HttpConnection::new(&config(format!("http://{addr}")), store, session).expect("connection");

    let err = conn
        .make_request(RequestSpec::new(HttpMethod::Get, "/sap/bc/adt/discovery"))
        .await
        .expect_err("nothing listening");
    assert!(err.is_network());
}

#[tokio::test]
#[serial]
async fn reset_clears_and_persists_credentials() {
    let (base_url, _seen) = spawn_server().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path());
    let session = store.create("s5", false).expect("session");

    let conn = HttpConnection::new(&config(base_url), store.clone(), session).expect("connection");
    conn.make_request(RequestSpec::new(HttpMethod::Post, "/sap/bc/adt/activation"))
        .await
        .expect("post");
    conn.set_session_mode(SessionMode::Stateful);
    conn.reset().await.expect("reset");

    assert_eq!(conn.session_mode(), SessionMode::Stateless);
    let stored = store.load("s5").expect("load").expect("present");
    assert!(stored.cookies.is_empty());
    assert_eq!(stored.csrf_token, None);
}
