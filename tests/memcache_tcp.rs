//! Memcache backend against scripted TCP peers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tagcache::cache::{
    CacheError, ClientConfig, Invalidation, KeyPart, MemcacheClient, QueryOptions, SetOptions,
    derive,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

type Store = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// Minimal memcache server speaking the subset of the text protocol the
/// client uses: get, set, add, delete, flush_all, stats. Expiry is ignored.
async fn spawn_fake_memcache() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    let store: Store = Arc::new(Mutex::new(HashMap::new()));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(serve_connection(stream, store.clone()));
        }
    });
    addr
}

async fn serve_connection(stream: TcpStream, store: Store) {
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let parts: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        let reply = match parts.first().map(String::as_str) {
            Some("get") => {
                let key = &parts[1];
                match store.lock().await.get(key) {
                    Some(value) => {
                        let mut out = format!("VALUE {key} 0 {}\r\n", value.len()).into_bytes();
                        out.extend_from_slice(value);
                        out.extend_from_slice(b"\r\nEND\r\n");
                        out
                    }
                    None => b"END\r\n".to_vec(),
                }
            }
            Some(verb @ ("set" | "add")) => {
                let key = parts[1].clone();
                let len: usize = parts[4].parse().expect("length");
                let mut data = vec![0_u8; len + 2];
                if reader.read_exact(&mut data).await.is_err() {
                    return;
                }
                data.truncate(len);
                let mut store = store.lock().await;
                if verb == "set" || !store.contains_key(&key) {
                    store.insert(key, data);
                    b"STORED\r\n".to_vec()
                } else {
                    b"NOT_STORED\r\n".to_vec()
                }
            }
            Some("delete") => {
                if store.lock().await.remove(&parts[1]).is_some() {
                    b"DELETED\r\n".to_vec()
                } else {
                    b"NOT_FOUND\r\n".to_vec()
                }
            }
            Some("flush_all") => {
                store.lock().await.clear();
                b"OK\r\n".to_vec()
            }
            Some("stats") => {
                let items = store.lock().await.len();
                format!("STAT pid 1\r\nSTAT curr_items {items}\r\nEND\r\n").into_bytes()
            }
            _ => b"ERROR\r\n".to_vec(),
        };
        if reader.get_mut().write_all(&reply).await.is_err() {
            return;
        }
    }
}

fn config(server: String) -> ClientConfig {
    ClientConfig {
        servers: vec![server],
        default_lifetime: 60,
        timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

#[tokio::test]
async fn scenario_over_the_wire() {
    let server = spawn_fake_memcache().await;
    let cache = MemcacheClient::connect("pages", config(server)).expect("client");

    let composed = cache
        .set("v1", "a", SetOptions::new().ns("n"))
        .await
        .expect("set");
    assert_eq!(composed, derive(Some(&KeyPart::from("n")), &KeyPart::from("a")));

    let value: Option<String> = cache
        .query("a", QueryOptions::new().ns("n"))
        .await
        .expect("query");
    assert_eq!(value.as_deref(), Some("v1"));

    cache
        .invalidate(Invalidation::key("a").ns("n"))
        .await
        .expect("invalidate");
    let value: Option<String> = cache
        .query("a", QueryOptions::new().ns("n"))
        .await
        .expect("query");
    assert_eq!(value, None);
}

#[tokio::test]
async fn dependencies_and_flush_over_the_wire() {
    let server = spawn_fake_memcache().await;
    let cache = MemcacheClient::connect("pages", config(server.clone())).expect("client");

    for key in ["a", "b"] {
        cache
            .set(key, key, SetOptions::new().depends_on("posts"))
            .await
            .expect("set");
    }
    cache.set("c", "c", SetOptions::new()).await.expect("set");

    let removed = cache
        .invalidate(Invalidation::dependencies(["posts"]))
        .await
        .expect("invalidate");
    assert_eq!(removed, 2);

    let stats = cache.get_statistics().await;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].server, server);
    assert_eq!(stats[0].stats.get("curr_items").map(String::as_str), Some("1"));

    cache.invalidate_all().await.expect("flush");
    let c: Option<String> = cache.query("c", QueryOptions::new()).await.expect("query");
    assert_eq!(c, None);
}

#[tokio::test]
async fn refused_connection_is_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    drop(listener);

    let cache = MemcacheClient::connect("pages", config(addr.clone())).expect("client");
    let err = cache
        .query::<String>("a", QueryOptions::new())
        .await
        .expect_err("nothing listens");

    match err {
        CacheError::BackendUnavailable { server, op, .. } => {
            assert_eq!(server, addr);
            assert_eq!(op, "get");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let stats = cache.get_statistics().await;
    assert!(stats[0].error.is_some());
    assert!(stats[0].stats.is_empty());
}

#[tokio::test]
async fn silent_server_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let cache = MemcacheClient::connect("pages", config(addr)).expect("client");
    let err = cache
        .set("v", "a", SetOptions::new())
        .await
        .expect_err("server never answers");
    assert!(err.is_timeout());
    assert!(err.is_retryable());
}

#[tokio::test]
async fn queued_calls_share_the_timeout_budget() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let cache = Arc::new(MemcacheClient::connect("pages", config(addr)).expect("client"));
    let started_at = Instant::now();
    let calls = (0..3).map(|i| {
        let cache = cache.clone();
        tokio::spawn(async move { cache.set("v", format!("k{i}"), SetOptions::new()).await })
    });
    let results = futures::future::join_all(calls).await;
    let elapsed = started_at.elapsed();

    for result in results {
        let err = result.expect("join").expect_err("server never answers");
        assert!(err.is_timeout(), "unexpected error: {err:?}");
    }
    // Three serialized timeouts would take 600ms.
    assert!(elapsed < Duration::from_millis(450), "took {elapsed:?}");
}

#[tokio::test]
async fn index_append_over_the_wire_keeps_earlier_entries() {
    let server = spawn_fake_memcache().await;
    let cache = MemcacheClient::connect("pages", config(server)).expect("client");

    for key in ["a", "b", "c"] {
        cache
            .set(key, key, SetOptions::new().depends_on("posts"))
            .await
            .expect("set");
    }
    let removed = cache
        .invalidate(Invalidation::dependencies(["posts"]))
        .await
        .expect("invalidate");
    assert_eq!(removed, 3);
}

#[tokio::test]
async fn server_error_line_is_a_protocol_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            let _ = reader.read_line(&mut line).await;
            let _ = reader
                .get_mut()
                .write_all(b"SERVER_ERROR out of memory\r\n")
                .await;
        }
    });

    let cache = MemcacheClient::connect("pages", config(addr)).expect("client");
    let err = cache
        .invalidate(Invalidation::key("a"))
        .await
        .expect_err("server error");
    assert!(matches!(err, CacheError::Protocol { op: "delete", .. }));
    assert!(!err.is_retryable());
}
