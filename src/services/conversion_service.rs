use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RomToolConfig;
use crate::errors::ConversionError;
use crate::models::ConversionFormat;
use crate::utils::format::output_excerpt;
use crate::utils::process::{executable_name, hide_console_window};

const OUTPUT_EXCERPT_CHARS: usize = 500;

/// Coarse percentage: 0 when the tool starts, 100 when it succeeds.
pub type ConversionProgress = Arc<dyn Fn(u8) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ConversionService {
    base_dir: PathBuf,
    timeout: Duration,
}

impl ConversionService {
    pub fn new(base_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            base_dir: base_dir.into(),
            timeout,
        }
    }

    pub fn from_config(config: &RomToolConfig) -> Self {
        Self::new(config.base_dir.clone(), config.convert_timeout())
    }

    pub fn tool_name(format: ConversionFormat) -> &'static str {
        match format {
            ConversionFormat::Xex => "exiso",
            ConversionFormat::God => "iso2god",
        }
    }

    pub fn binary_path(&self, format: ConversionFormat) -> PathBuf {
        self.base_dir
            .join("bin")
            .join(executable_name(Self::tool_name(format)))
    }

    /// Parses `format_name` first; an unknown name never starts a process.
    pub async fn convert_named(
        &self,
        iso: &Path,
        output_dir: &Path,
        format_name: &str,
        progress: Option<&ConversionProgress>,
    ) -> Result<PathBuf, ConversionError> {
        let format = format_name.parse::<ConversionFormat>()?;
        self.convert(iso, output_dir, format, progress).await
    }

    pub async fn convert(
        &self,
        iso: &Path,
        output_dir: &Path,
        format: ConversionFormat,
        progress: Option<&ConversionProgress>,
    ) -> Result<PathBuf, ConversionError> {
        let tool = Self::tool_name(format);
        let binary = self.binary_path(format);
        if !binary.is_file() {
            return Err(ConversionError::MissingBinary(binary));
        }

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|source| ConversionError::OutputDir {
                path: output_dir.to_path_buf(),
                source,
            })?;

        let args: Vec<OsString> = match format {
            ConversionFormat::Xex => vec![
                "-d".into(),
                output_dir.as_os_str().to_owned(),
                iso.as_os_str().to_owned(),
            ],
            ConversionFormat::God => vec![
                iso.as_os_str().to_owned(),
                output_dir.as_os_str().to_owned(),
                "--trim".into(),
            ],
        };

        let mut command = std::process::Command::new(&binary);
        hide_console_window(&mut command);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut command = tokio::process::Command::from(command);
        command.kill_on_drop(true);

        tracing::info!(
            "converting {} to {} with {}",
            iso.display(),
            format,
            binary.display()
        );
        if let Some(callback) = progress {
            callback(0);
        }

        let child = command.spawn().map_err(|source| ConversionError::Launch {
            tool: tool.to_string(),
            source,
        })?;

        // Dropping the timed-out future drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ConversionError::Launch {
                tool: tool.to_string(),
                source,
            })?,
            Err(_) => {
                tracing::error!("{} exceeded {:?}; killed", tool, self.timeout);
                return Err(ConversionError::Timeout {
                    tool: tool.to_string(),
                    secs: self.timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|code| code.to_string())
                .unwrap_or_else(|| "unknown (terminated by signal)".to_string());
            return Err(ConversionError::NonZeroExit {
                tool: tool.to_string(),
                code,
                stdout: output_excerpt(&output.stdout, OUTPUT_EXCERPT_CHARS),
                stderr: output_excerpt(&output.stderr, OUTPUT_EXCERPT_CHARS),
            });
        }

        if let Some(callback) = progress {
            callback(100);
        }
        tracing::info!("{} finished, output in {}", tool, output_dir.display());
        Ok(output_dir.to_path_buf())
    }
}
