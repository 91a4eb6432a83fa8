use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{pin_mut, Stream, StreamExt};
use reqwest::header::CONTENT_DISPOSITION;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::sleep;

use crate::config::RomToolConfig;
use crate::errors::DownloadError;

pub const CHUNK_SIZE: usize = 1024 * 1024;
const DEFAULT_FILENAME: &str = "download.bin";

/// `(bytes_downloaded, total_bytes)`; `None` total means the server did not
/// announce a length.
pub type ProgressCallback = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;
/// Fired after a failed attempt's partial file was removed, before the next
/// attempt starts.
pub type RetryCallback = Arc<dyn Fn(usize, &DownloadError) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadControl {
    Running,
    Cancelled,
}

#[derive(Clone, Default)]
pub struct DownloadOptions {
    pub progress: Option<ProgressCallback>,
    pub filename_override: Option<String>,
    pub control: Option<watch::Receiver<DownloadControl>>,
    pub on_retry: Option<RetryCallback>,
}

#[derive(Clone, Debug)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub bytes: u64,
    pub attempts: usize,
}

#[derive(Clone, Debug)]
pub struct DownloadSettings {
    pub max_attempts: usize,
    pub retry_wait: Duration,
    pub chunk_size: usize,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_wait: Duration::from_millis(500),
            chunk_size: CHUNK_SIZE,
        }
    }
}

#[derive(Clone)]
pub struct DownloadService {
    client: reqwest::Client,
    settings: DownloadSettings,
}

impl DownloadService {
    pub fn new(client: reqwest::Client, settings: DownloadSettings) -> Self {
        let settings = DownloadSettings {
            max_attempts: settings.max_attempts.max(1),
            chunk_size: settings.chunk_size.max(1),
            ..settings
        };
        Self { client, settings }
    }

    pub fn from_config(config: &RomToolConfig) -> Self {
        // No total timeout: disc images take far longer than any sane limit.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(concat!("romtool/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let settings = DownloadSettings {
            max_attempts: config.download_max_attempts,
            retry_wait: Duration::from_millis(config.download_retry_wait_ms),
            chunk_size: CHUNK_SIZE,
        };
        Self::new(client, settings)
    }

    pub async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        options: DownloadOptions,
    ) -> Result<DownloadedFile, DownloadError> {
        tokio::fs::create_dir_all(dest_dir).await?;

        let max_attempts = self.settings.max_attempts;
        let mut last_error: Option<DownloadError> = None;

        for attempt in 1..=max_attempts {
            let mut partial: Option<PathBuf> = None;
            match self.attempt(url, dest_dir, &options, &mut partial).await {
                Ok((path, bytes)) => {
                    tracing::info!(
                        "downloaded {} ({} bytes) on attempt {}/{}",
                        path.display(),
                        bytes,
                        attempt,
                        max_attempts
                    );
                    return Ok(DownloadedFile {
                        path,
                        bytes,
                        attempts: attempt,
                    });
                }
                Err(DownloadError::Cancelled) => {
                    if let Some(path) = partial {
                        cleanup_partial(&path).await;
                    }
                    tracing::info!("download of {} cancelled", url);
                    return Err(DownloadError::Cancelled);
                }
                Err(err) => {
                    tracing::warn!(
                        "download attempt {}/{} for {} failed: {}",
                        attempt,
                        max_attempts,
                        url,
                        err
                    );
                    if let Some(path) = partial {
                        cleanup_partial(&path).await;
                    }
                    if attempt < max_attempts {
                        if let Some(on_retry) = options.on_retry.as_ref() {
                            on_retry(attempt, &err);
                        }
                        if !self.settings.retry_wait.is_zero() {
                            sleep(self.settings.retry_wait * attempt as u32).await;
                        }
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(DownloadError::Exhausted {
            attempts: max_attempts,
            last: Box::new(
                last_error.unwrap_or_else(|| DownloadError::Network("no attempt made".to_string())),
            ),
        })
    }

    async fn attempt(
        &self,
        url: &str,
        dest_dir: &Path,
        options: &DownloadOptions,
        partial: &mut Option<PathBuf>,
    ) -> Result<(PathBuf, u64), DownloadError> {
        if is_cancelled(options.control.as_ref()) {
            return Err(DownloadError::Cancelled);
        }

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let disposition = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let filename = resolve_filename(
            options.filename_override.as_deref(),
            disposition.as_deref(),
            url,
        );
        let path = dest_dir.join(&filename);
        *partial = Some(path.clone());

        let total = response.content_length();
        let mut file = tokio::fs::File::create(&path).await?;
        let written = write_chunked(
            response.bytes_stream(),
            &mut file,
            self.settings.chunk_size,
            total,
            options.progress.as_ref(),
            options.control.as_ref(),
        )
        .await?;
        file.sync_all().await?;

        Ok((path, written))
    }
}

/// Re-chunks `stream` into whole `chunk_size` writes. At most one chunk is
/// buffered; only the final write may be shorter.
pub async fn write_chunked<S, B, E, W>(
    stream: S,
    writer: &mut W,
    chunk_size: usize,
    total: Option<u64>,
    progress: Option<&ProgressCallback>,
    control: Option<&watch::Receiver<DownloadControl>>,
) -> Result<u64, DownloadError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<DownloadError>,
    W: AsyncWrite + Unpin,
{
    pin_mut!(stream);
    let mut watcher = control.cloned();
    let mut buffer: Vec<u8> = Vec::with_capacity(chunk_size);
    let mut written = 0u64;
    report(progress, written, total);

    loop {
        let next = match watcher.as_mut() {
            Some(rx) => tokio::select! {
                biased;
                _ = cancellation(rx) => return Err(DownloadError::Cancelled),
                piece = stream.next() => piece,
            },
            None => stream.next().await,
        };
        let Some(piece) = next else {
            break;
        };
        if is_cancelled(control) {
            return Err(DownloadError::Cancelled);
        }
        let piece = piece.map_err(Into::into)?;
        let mut data = piece.as_ref();

        while !data.is_empty() {
            let take = (chunk_size - buffer.len()).min(data.len());
            buffer.extend_from_slice(&data[..take]);
            data = &data[take..];

            if buffer.len() == chunk_size {
                if is_cancelled(control) {
                    return Err(DownloadError::Cancelled);
                }
                writer.write_all(&buffer).await?;
                written += buffer.len() as u64;
                buffer.clear();
                report(progress, written, total);
            }
        }
    }

    if !buffer.is_empty() {
        writer.write_all(&buffer).await?;
        written += buffer.len() as u64;
        report(progress, written, total);
    }
    writer.flush().await?;

    Ok(written)
}

fn report(progress: Option<&ProgressCallback>, downloaded: u64, total: Option<u64>) {
    if let Some(callback) = progress {
        callback(downloaded, total);
    }
}

fn is_cancelled(control: Option<&watch::Receiver<DownloadControl>>) -> bool {
    control
        .map(|rx| *rx.borrow() == DownloadControl::Cancelled)
        .unwrap_or(false)
}

/// Resolves once the control reads `Cancelled`. A dropped sender never
/// cancels.
async fn cancellation(rx: &mut watch::Receiver<DownloadControl>) {
    loop {
        if *rx.borrow_and_update() == DownloadControl::Cancelled {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn cleanup_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!("removed partial download {}", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(
            "could not remove partial download {}: {}",
            path.display(),
            err
        ),
    }
}

/// Output name, by priority: override, `Content-Disposition`, URL path,
/// `download.bin`. Always a bare file name.
pub fn resolve_filename(
    override_name: Option<&str>,
    disposition: Option<&str>,
    url: &str,
) -> String {
    override_name
        .and_then(sanitize_filename)
        .or_else(|| {
            disposition
                .and_then(filename_from_disposition)
                .and_then(|name| sanitize_filename(&name))
        })
        .or_else(|| filename_from_url(url).and_then(|name| sanitize_filename(&name)))
        .unwrap_or_else(|| DEFAULT_FILENAME.to_string())
}

fn filename_from_disposition(value: &str) -> Option<String> {
    let mut extended: Option<String> = None;
    for part in value.split(';') {
        let part = part.trim();
        let lower = part.to_ascii_lowercase();
        if lower.starts_with("filename=") {
            let name = part["filename=".len()..]
                .trim()
                .trim_matches('"')
                .trim_matches('\'');
            if !name.is_empty() {
                return Some(name.to_string());
            }
        } else if lower.starts_with("filename*=") {
            let raw = part["filename*=".len()..].trim().trim_matches('"');
            let encoded = raw.split_once("''").map(|(_, rest)| rest).unwrap_or(raw);
            if let Ok(decoded) = urlencoding::decode(encoded) {
                if !decoded.is_empty() {
                    extended = Some(decoded.into_owned());
                }
            }
        }
    }
    extended
}

fn filename_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.last()?.to_string();
    let decoded = urlencoding::decode(&segment).ok()?.into_owned();
    if decoded.is_empty() {
        None
    } else {
        Some(decoded)
    }
}

/// Strips directory components and characters that are reserved on
/// Windows.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let last = name.rsplit(|ch| ch == '/' || ch == '\\').next()?.trim();
    if last.is_empty() || last == "." || last == ".." {
        return None;
    }
    let cleaned: String = last
        .chars()
        .map(|ch| match ch {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0' => '_',
            _ => ch,
        })
        .collect();
    Some(cleaned)
}
