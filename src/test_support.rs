//! In-process HTTP responder and converter stubs shared by the service tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[derive(Clone, Debug)]
pub enum Reply {
    /// Read the request, then close the socket without answering.
    Drop,
    Respond {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
    /// Announce `content_length`, send `prefix`, then go quiet until the
    /// client hangs up.
    Stall { prefix: Vec<u8>, content_length: u64 },
}

impl Reply {
    pub fn ok(body: Vec<u8>) -> Self {
        Reply::Respond {
            status: 200,
            headers: Vec::new(),
            body,
        }
    }

    pub fn html(body: &str) -> Self {
        Reply::ok(body.as_bytes().to_vec()).with_header("Content-Type", "text/html; charset=utf-8")
    }

    pub fn status(status: u16) -> Self {
        Reply::Respond {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn stall(prefix: Vec<u8>, content_length: u64) -> Self {
        Reply::Stall {
            prefix,
            content_length,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let Reply::Respond { headers, .. } = &mut self {
            headers.push((name.to_string(), value.to_string()));
        }
        self
    }
}

/// Answers connections with `replies` in order; the last reply repeats.
pub struct TestServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
}

impl TestServer {
    pub async fn start(replies: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let addr = listener.local_addr().expect("local addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let index = counter.fetch_add(1, Ordering::SeqCst);
                let reply = replies
                    .get(index)
                    .or_else(|| replies.last())
                    .cloned()
                    .unwrap_or(Reply::Drop);

                tokio::spawn(async move {
                    read_request_head(&mut socket).await;
                    match reply {
                        Reply::Drop => {}
                        Reply::Respond {
                            status,
                            headers,
                            body,
                        } => {
                            let head = response_head(status, body.len() as u64, &headers);
                            let _ = socket.write_all(head.as_bytes()).await;
                            let _ = socket.write_all(&body).await;
                            let _ = socket.flush().await;
                            let _ = socket.shutdown().await;
                        }
                        Reply::Stall {
                            prefix,
                            content_length,
                        } => {
                            let head = response_head(200, content_length, &[]);
                            let _ = socket.write_all(head.as_bytes()).await;
                            let _ = socket.write_all(&prefix).await;
                            let _ = socket.flush().await;
                            let mut sink = [0u8; 256];
                            while let Ok(read) = socket.read(&mut sink).await {
                                if read == 0 {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            base_url: format!("http://{}", addr),
            hits,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn read_request_head(socket: &mut tokio::net::TcpStream) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|window| window == b"\r\n\r\n") && request.len() < 64 * 1024 {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(read) => request.extend_from_slice(&buf[..read]),
        }
    }
}

fn response_head(status: u16, content_length: u64, headers: &[(String, String)]) -> String {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        reason(status),
        content_length
    );
    for (name, value) in headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");
    head
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

/// Client that ignores proxy settings from the environment.
pub fn test_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("test client")
}

/// Writes an executable shell script at `path`.
#[cfg(unix)]
pub fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create script dir");
    }
    std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    let mut perms = std::fs::metadata(path).expect("script metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).expect("chmod script");
}

/// Zip archive at `path` holding `entries` as `(name, contents)`.
pub fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    use std::io::Write;

    let file = std::fs::File::create(path).expect("create zip");
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default();
    for (name, contents) in entries {
        writer.start_file(*name, options).expect("start zip entry");
        writer.write_all(contents.as_bytes()).expect("write zip entry");
    }
    writer.finish().expect("finish zip");
}

/// Reports a fixed amount of free space everywhere.
pub struct FixedFreeSpace(pub u64);

impl crate::services::storage_service::FreeSpaceSource for FixedFreeSpace {
    fn available_bytes(&self, _path: &Path) -> Option<u64> {
        Some(self.0)
    }
}
