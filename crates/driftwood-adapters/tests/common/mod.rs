//! Loopback Wisp server and HTTP backend shared by the integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use driftwood_adapters::engine::{ArtifactCache, ArtifactSource, EngineLoader, ENGINE_CACHE_NAME};
use driftwood_adapters::wisp::{CloseReason, Packet, Payload};
use driftwood_adapters::{RetryPolicy, Settings, SharedSettings, TunnelManager};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

pub const CREDIT: u32 = 32;
pub const GOOD_TOKEN: &str = "good-token";
/// Token whose `/api/users/me` answers with an HTML gateway error.
pub const OUTAGE_TOKEN: &str = "outage-token";

const TEST_ROOT: &[u8] = include_bytes!("../fixtures/test-root.pem");

struct StaticSource;

impl ArtifactSource for StaticSource {
    fn fetch<'a>(
        &'a self,
        _key: &'a str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<u8>>> + Send + 'a>> {
        Box::pin(async { Ok(TEST_ROOT.to_vec()) })
    }
}

/// What the Wisp server does with upcoming CONNECTs.
#[derive(Default)]
pub struct WispBehavior {
    /// Answer this many CONNECTs with a stream CLOSE(0x49).
    pub throttle_streams: AtomicUsize,
    /// Answer this many CONNECTs by closing stream 0 with 0x49.
    pub throttle_connections: AtomicUsize,
    /// Relay this many streams normally but end them with CLOSE(0x49).
    pub throttle_after_body: AtomicUsize,
    /// WebSocket connections accepted so far.
    pub connections: AtomicUsize,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub struct Harness {
    pub wisp_url: String,
    pub http_addr: SocketAddr,
    pub behavior: Arc<WispBehavior>,
    pub cache_root: tempfile::TempDir,
}

impl Harness {
    pub async fn start() -> Self {
        let http_addr = spawn_http_backend().await;
        let behavior = Arc::new(WispBehavior::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let wisp_url = format!("ws://{}/", listener.local_addr().unwrap());
        tokio::spawn(serve_wisp(listener, behavior.clone()));
        Self {
            wisp_url,
            http_addr,
            behavior,
            cache_root: tempfile::tempdir().unwrap(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.http_addr, path)
    }

    pub fn manager(&self, retry: RetryPolicy) -> Arc<TunnelManager> {
        let settings = SharedSettings::in_memory(Settings {
            wisp_server: self.wisp_url.clone(),
            ..Settings::default()
        });
        let loader = EngineLoader::new(
            ArtifactCache::open_in(self.cache_root.path(), ENGINE_CACHE_NAME),
            Arc::new(StaticSource),
            settings.clone(),
        );
        Arc::new(TunnelManager::new(settings, loader).with_retry_policy(retry))
    }
}

async fn serve_wisp(listener: TcpListener, behavior: Arc<WispBehavior>) {
    while let Ok((tcp, _)) = listener.accept().await {
        tokio::spawn(handle_wisp_connection(tcp, behavior.clone()));
    }
}

async fn handle_wisp_connection(tcp: TcpStream, behavior: Arc<WispBehavior>) {
    let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
        return;
    };
    behavior.connections.fetch_add(1, Ordering::SeqCst);

    let (mut sink, mut source) = ws.split();
    let (out, mut out_rx) = mpsc::unbounded_channel::<Packet>();
    tokio::spawn(async move {
        while let Some(packet) = out_rx.recv().await {
            if sink
                .send(Message::Binary(packet.encode().to_vec()))
                .await
                .is_err()
            {
                break;
            }
        }
    });
    let _ = out.send(Packet::continue_with(0, CREDIT));

    let mut upstreams: HashMap<u32, OwnedWriteHalf> = HashMap::new();
    while let Some(Ok(message)) = source.next().await {
        let Message::Binary(data) = message else {
            continue;
        };
        let Ok(packet) = Packet::decode(Bytes::from(data)) else {
            continue;
        };
        let id = packet.stream_id;
        match packet.payload {
            Payload::Connect { host, port, .. } => {
                if take_one(&behavior.throttle_connections) {
                    let _ = out.send(Packet::close(0, CloseReason::Throttled));
                    break;
                }
                if take_one(&behavior.throttle_streams) {
                    let _ = out.send(Packet::close(id, CloseReason::Throttled));
                    continue;
                }
                let Ok(target) = TcpStream::connect((host.as_str(), port)).await else {
                    let _ = out.send(Packet::close(id, CloseReason::Unreachable));
                    continue;
                };
                let (mut read, write) = target.into_split();
                upstreams.insert(id, write);
                let end_reason = if take_one(&behavior.throttle_after_body) {
                    CloseReason::Throttled
                } else {
                    CloseReason::Voluntary
                };
                let out = out.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    loop {
                        match read.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                let _ = out.send(Packet::data(id, Bytes::copy_from_slice(&buf[..n])));
                            }
                        }
                    }
                    let _ = out.send(Packet::close(id, end_reason));
                });
            }
            Payload::Data(bytes) => {
                if let Some(write) = upstreams.get_mut(&id) {
                    let _ = write.write_all(&bytes).await;
                }
                let _ = out.send(Packet::continue_with(id, CREDIT));
            }
            Payload::Close(_) => {
                upstreams.remove(&id);
            }
            Payload::Continue { .. } => {}
        }
    }
}

async fn spawn_http_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut chunk = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&chunk[..n]),
                    }
                }
                let reply = route(&String::from_utf8_lossy(&head));
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

fn route(head: &str) -> String {
    let mut request_line = head.lines().next().unwrap_or("").split_whitespace();
    let method = request_line.next().unwrap_or("GET");
    let path = request_line.next().unwrap_or("/");
    let cookie = header_value(head, "cookie");
    let port = header_value(head, "host").rsplit(':').next().unwrap_or("80");

    match path {
        "/hello" => reply("200 OK", &[("Content-Type", "text/plain")], "hello over wisp"),
        "/method" => reply("200 OK", &[], method),
        "/echo-cookie" => reply("200 OK", &[], cookie),
        "/redirect" => reply("302 Found", &[("Location", "/hello")], ""),
        "/submit" => reply("303 See Other", &[("Location", "/method")], ""),
        "/loop" => reply("302 Found", &[("Location", "/loop")], ""),
        "/to-cookie" => reply("302 Found", &[("Location", "/echo-cookie")], ""),
        "/offsite" => reply(
            "302 Found",
            &[("Location", format!("http://localhost:{port}/echo-cookie").as_str())],
            "",
        ),
        "/unframed" => "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nstreamed until close".to_string(),
        "/login" => reply(
            "302 Found",
            &[
                ("Set-Cookie", "csrf=abc; Path=/"),
                (
                    "Set-Cookie",
                    "__Secure-next-auth.session-token=good-token; Path=/; Secure; HttpOnly",
                ),
                ("Location", "/dashboard"),
            ],
            "",
        ),
        "/api/users/me" if cookie.contains(OUTAGE_TOKEN) => reply(
            "502 Bad Gateway",
            &[("Content-Type", "text/html")],
            "<html><body>502 Bad Gateway</body></html>",
        ),
        "/api/users/me" if cookie.contains(GOOD_TOKEN) => reply(
            "200 OK",
            &[("Content-Type", "application/json")],
            r#"{"id":"u-1","name":"Ada","isAdmin":false}"#,
        ),
        "/api/users/me" => reply(
            "401 Unauthorized",
            &[("Content-Type", "application/json")],
            r#"{"error":"Unauthorized"}"#,
        ),
        "/api/gallery" => reply(
            "200 OK",
            &[("Content-Type", "application/json")],
            r#"[{"projectID":"p-1","userId":"u-1","shipped":true,"rawHours":20}]"#,
        ),
        _ => reply("404 Not Found", &[], "missing"),
    }
}

fn header_value<'a>(head: &'a str, wanted: &str) -> &'a str {
    head.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case(wanted).then(|| value.trim())
        })
        .unwrap_or("")
}

fn reply(status: &str, headers: &[(&str, &str)], body: &str) -> String {
    let mut out = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    out.push_str(body);
    out
}
