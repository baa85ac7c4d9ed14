//! Minimal HTTP server for list download tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Clone)]
struct Behaviour {
    body: String,
    etag: Option<String>,
    status: Option<u16>,
    delay: Duration,
}

/// Serves one body with an optional ETag. Honors `If-None-Match`.
pub struct StubServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    conditional_hits: Arc<AtomicUsize>,
    behaviour: Arc<Mutex<Behaviour>>,
}

impl StubServer {
    pub async fn start(body: &str, etag: Option<&str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let conditional_hits = Arc::new(AtomicUsize::new(0));
        let behaviour = Arc::new(Mutex::new(Behaviour {
            body: body.to_string(),
            etag: etag.map(str::to_string),
            status: None,
            delay: Duration::ZERO,
        }));

        let (h, c, b) = (hits.clone(), conditional_hits.clone(), behaviour.clone());
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let (h, c, b) = (h.clone(), c.clone(), b.clone());
                tokio::spawn(async move {
                    handle(stream, h, c, b).await;
                });
            }
        });

        Self {
            addr,
            hits,
            conditional_hits,
            behaviour,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path.trim_start_matches('/'))
    }

    /// Requests received so far
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Requests that carried `If-None-Match`
    pub fn conditional_hits(&self) -> usize {
        self.conditional_hits.load(Ordering::SeqCst)
    }

    pub fn set_body(&self, body: &str, etag: Option<&str>) {
        let mut b = self.behaviour.lock().unwrap();
        b.body = body.to_string();
        b.etag = etag.map(str::to_string);
    }

    /// Answer every request with `status` and no body.
    pub fn fail_with(&self, status: u16) {
        self.behaviour.lock().unwrap().status = Some(status);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.behaviour.lock().unwrap().delay = delay;
    }
}

async fn handle(
    mut stream: TcpStream,
    hits: Arc<AtomicUsize>,
    conditional_hits: Arc<AtomicUsize>,
    behaviour: Arc<Mutex<Behaviour>>,
) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }
    hits.fetch_add(1, Ordering::SeqCst);

    let request = String::from_utf8_lossy(&request).to_string();
    let if_none_match = request.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.eq_ignore_ascii_case("if-none-match")
            .then(|| value.trim().to_string())
    });
    if if_none_match.is_some() {
        conditional_hits.fetch_add(1, Ordering::SeqCst);
    }

    let b = behaviour.lock().unwrap().clone();
    if !b.delay.is_zero() {
        tokio::time::sleep(b.delay).await;
    }

    let response = if let Some(status) = b.status {
        format!(
            "HTTP/1.1 {} Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status
        )
    } else if b.etag.is_some() && if_none_match == b.etag {
        "HTTP/1.1 304 Not Modified\r\nConnection: close\r\n\r\n".to_string()
    } else {
        let etag = b
            .etag
            .as_ref()
            .map(|e| format!("ETag: {}\r\n", e))
            .unwrap_or_default();
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            etag,
            b.body.len(),
            b.body
        )
    };
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
