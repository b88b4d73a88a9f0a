//! Minimal HTTP/1.1 server on a loopback socket
//!
//! Serves fixed bodies per path, honors `Range: bytes=N-` with a 206, and
//! records the headers of every request it sees. Runs on its own tokio
//! runtime so tests can stay synchronous.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use url::Url;

/// Response for one path
#[derive(Debug, Clone)]
pub struct Route {
    pub status: u16,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
    /// Send this many body bytes, then keep the connection open silently
    pub hang_after: Option<usize>,
}

impl Route {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            body,
            headers: Vec::new(),
            hang_after: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::ok(Vec::new())
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn hang_after(mut self, bytes: usize) -> Self {
        self.hang_after = Some(bytes);
        self
    }
}

/// A request as received; header names are lowercased
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub path: String,
    pub headers: HashMap<String, String>,
}

impl SeenRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

pub struct TestServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<SeenRequest>>>,
    runtime: Option<Runtime>,
}

impl TestServer {
    pub fn start(routes: Vec<(&str, Route)>) -> Self {
        let routes: Arc<HashMap<String, Route>> = Arc::new(
            routes
                .into_iter()
                .map(|(path, route)| (path.to_string(), route))
                .collect(),
        );
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .expect("server runtime");
        let listener = runtime
            .block_on(TcpListener::bind("127.0.0.1:0"))
            .expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        runtime.spawn(accept_loop(listener, routes, Arc::clone(&requests)));
        Self {
            addr,
            requests,
            runtime: Some(runtime),
        }
    }

    pub fn url(&self, path: &str) -> Url {
        Url::parse(&format!("http://{}/{}", self.addr, path)).expect("server url")
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    routes: Arc<HashMap<String, Route>>,
    requests: Arc<Mutex<Vec<SeenRequest>>>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        let routes = Arc::clone(&routes);
        let requests = Arc::clone(&requests);
        tokio::spawn(async move {
            let _ = serve(stream, routes, requests).await;
        });
    }
}

async fn serve(
    stream: TcpStream,
    routes: Arc<HashMap<String, Route>>,
    requests: Arc<Mutex<Vec<SeenRequest>>>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let path = line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .trim_start_matches('/')
        .to_string();

    let mut headers = HashMap::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    let request = SeenRequest {
        path: path.clone(),
        headers,
    };
    let range_start = request
        .header("range")
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.trim_end_matches('-').parse::<usize>().ok());
    requests.lock().unwrap().push(request);

    let mut stream = reader.into_inner();
    let Some(route) = routes.get(&path) else {
        stream
            .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
            .await?;
        return Ok(());
    };

    let total = route.body.len();
    let (status, body, content_range) = match range_start {
        Some(start) if route.status == 200 => {
            let start = start.min(total);
            let range = format!("bytes {}-{}/{}", start, total.saturating_sub(1), total);
            (206, &route.body[start..], Some(range))
        }
        _ => (route.status, &route.body[..], None),
    };

    let mut head = format!(
        "HTTP/1.1 {} {}\r\ncontent-length: {}\r\nconnection: close\r\n",
        status,
        reason(status),
        body.len()
    );
    if let Some(range) = content_range {
        head.push_str(&format!("content-range: {}\r\n", range));
    }
    for (name, value) in &route.headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await?;

    match route.hang_after {
        Some(limit) => {
            stream.write_all(&body[..limit.min(body.len())]).await?;
            stream.flush().await?;
            std::future::pending::<()>().await;
        }
        None => stream.write_all(body).await?,
    }
    stream.shutdown().await
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        404 => "Not Found",
        410 => "Gone",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
