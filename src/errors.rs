use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::utils::format::format_gib;

#[derive(Error, Debug)]
pub enum RomToolError {
    #[error("Search error: {0}")]
    Search(#[from] SearchError),
    #[error("Download error: {0}")]
    Download(#[from] DownloadError),
    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl RomToolError {
    /// Message shown to the user when a pipeline run fails, prefixed by the
    /// failure category.
    pub fn user_message(&self) -> String {
        match self {
            RomToolError::Storage(StorageError::InsufficientSpace {
                required,
                available,
            }) => format!(
                "Not enough disk space.\nRequired: {}  |  Available: {}",
                format_gib(*required),
                format_gib(*available)
            ),
            RomToolError::Search(err) => format!("Search failed:\n{err}"),
            RomToolError::Download(err) => format!("Download failed:\n{err}"),
            RomToolError::Extraction(err) => format!("Extraction failed:\n{err}"),
            RomToolError::Conversion(err) => format!("Conversion failed:\n{err}"),
            RomToolError::Storage(err) => format!("Storage error:\n{err}"),
            RomToolError::Unexpected(details) => format!("Unexpected error:\n{details}"),
            other => format!("Error:\n{other}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("server returned HTTP {status} for {url}")]
    Http { status: u16, url: String },
    #[error("network error while fetching {url}: {reason}")]
    Network { url: String, reason: String },
    #[error("page was retrieved but no game entries could be parsed; the site structure may have changed")]
    NothingParsed,
    #[error("no download mirrors found on the detail page for '{title}'")]
    NoMirrors { title: String },
    #[error("no catalogue entries match '{query}'")]
    NoMatches { query: String },
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("server returned HTTP {status} for URL: {url}")]
    Http { status: u16, url: String },
    #[error("network error during download: {0}")]
    Network(String),
    #[error("I/O error writing download to disk: {0}")]
    Io(#[from] io::Error),
    #[error("download cancelled by user")]
    Cancelled,
    #[error("download failed after {attempts} attempts; last error: {last}")]
    Exhausted {
        attempts: usize,
        last: Box<DownloadError>,
    },
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        DownloadError::Network(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("archive not found: {0}")]
    NotFound(PathBuf),
    #[error("path traversal detected in archive member: {member}")]
    PathTraversal { member: String },
    #[error("corrupt or invalid {format} archive: {reason}")]
    Corrupt { format: String, reason: String },
    #[error("no extraction backend available for '{0}'; install 7-Zip or unrar")]
    NoBackend(String),
    #[error("{tool} failed: {details}")]
    Tool { tool: String, details: String },
    #[error("extraction succeeded but no .iso file was found in '{0}'")]
    NoDiscImage(String),
    #[error("I/O error during extraction: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("unknown conversion format: {0:?}")]
    UnknownFormat(String),
    #[error("conversion binary not found: {}; ensure the bin/ directory is present alongside the application", .0.display())]
    MissingBinary(PathBuf),
    #[error("could not create output directory {}: {source}", .path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to launch {tool}: {source}")]
    Launch {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("{tool} exceeded the {secs}s time limit and was terminated")]
    Timeout { tool: String, secs: u64 },
    #[error("{tool} exited with code {code}.\nSTDOUT: {stdout}\nSTDERR: {stderr}")]
    NonZeroExit {
        tool: String,
        code: String,
        stdout: String,
        stderr: String,
    },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("insufficient disk space: need {required} bytes, have {available} bytes free")]
    InsufficientSpace { required: u64, available: u64 },
    #[error("cannot determine free space for {}", .0.display())]
    SpaceUnknown(PathBuf),
    #[error("conversion produced no output in {}; the conversion tool may have failed silently", .0.display())]
    EmptySource(PathBuf),
    #[error("failed to move {} to {}: {reason}", .from.display(), .to.display())]
    Move {
        from: PathBuf,
        to: PathBuf,
        reason: String,
    },
    #[error("filesystem error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, RomToolError>;
