use std::collections::HashMap;
use std::path::Path;

use chrono::Local;
use reqwest::Url;

use crate::commands::catalogue::list_catalogue;
use crate::errors::{Result, SearchError};
use crate::models::{ConversionFormat, InstallRequest, MirrorLink};
use crate::services::{run_batch, BatchEvent, BatchOutcome, PipelineEvent, Stage};
use crate::utils::format::format_bytes;
use crate::AppState;

/// Unknown-length downloads report once per this many bytes.
const UNSIZED_REPORT_STEP: u64 = 64 * 1024 * 1024;

/// A mirror for a bare URL, labelled with its decoded file name.
pub fn mirror_from_url(url: &str) -> MirrorLink {
    let label = Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()?
                .filter(|segment| !segment.is_empty())
                .last()
                .map(str::to_string)
        })
        .and_then(|segment| urlencoding::decode(&segment).ok().map(|name| name.into_owned()))
        .unwrap_or_else(|| url.to_string());
    MirrorLink {
        label,
        url: url.to_string(),
    }
}

/// Explicit URLs win; otherwise every catalogue entry matching `query`
/// becomes its own mirror.
pub async fn resolve_mirrors(
    state: &AppState,
    urls: &[String],
    query: Option<&str>,
) -> Result<Vec<MirrorLink>> {
    if !urls.is_empty() {
        return Ok(urls.iter().map(|url| mirror_from_url(url)).collect());
    }
    let query = query.unwrap_or_default();
    let matches = list_catalogue(state, Some(query)).await?;
    if matches.is_empty() {
        return Err(SearchError::NoMatches {
            query: query.to_string(),
        }
        .into());
    }
    Ok(matches.iter().map(|entry| entry.direct_mirror()).collect())
}

pub fn build_requests(
    mirrors: Vec<MirrorLink>,
    install_dir: &Path,
    format: ConversionFormat,
) -> Vec<InstallRequest> {
    mirrors
        .into_iter()
        .map(|mirror| InstallRequest {
            mirror,
            install_dir: install_dir.to_path_buf(),
            format,
        })
        .collect()
}

/// Runs every request in order, printing progress; Ctrl-C cancels the
/// running download and skips what is left.
pub async fn install_all(
    state: &AppState,
    requests: Vec<InstallRequest>,
) -> Result<Vec<BatchOutcome>> {
    let total = requests.len();
    let mut batch = run_batch(&state.pipeline, requests);
    let mut renderer = EventRenderer::default();
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = batch.next_event() => match event {
                Some(event) => {
                    if let Some(line) = renderer.render(&event, total) {
                        println!("{}", line);
                    }
                }
                None => break,
            },
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if signal.is_ok() {
                    println!("{}", timestamped("Cancelling; remaining items will be skipped"));
                    batch.cancel();
                }
            }
        }
    }

    batch.wait().await
}

pub fn timestamped(line: &str) -> String {
    format!("[{}] {}", Local::now().format("%H:%M:%S"), line)
}

/// Turns batch events into status lines, thinning download progress to
/// one line per 10%.
#[derive(Default)]
pub struct EventRenderer {
    last_bucket: HashMap<usize, u64>,
}

impl EventRenderer {
    pub fn render(&mut self, event: &BatchEvent, total: usize) -> Option<String> {
        let body = match &event.event {
            PipelineEvent::Stage(Stage::Done) => return None,
            PipelineEvent::Stage(stage) => format!("{}...", stage),
            PipelineEvent::Status(text) => text.clone(),
            PipelineEvent::Progress {
                downloaded,
                total: Some(size),
            } if *size > 0 => {
                let percent = downloaded.saturating_mul(100) / size;
                if !self.advance(event.index, percent / 10) {
                    return None;
                }
                format!(
                    "Downloaded {} of {} ({}%)",
                    format_bytes(*downloaded),
                    format_bytes(*size),
                    percent
                )
            }
            PipelineEvent::Progress { downloaded, .. } => {
                if !self.advance(event.index, downloaded / UNSIZED_REPORT_STEP) {
                    return None;
                }
                format!("Downloaded {}", format_bytes(*downloaded))
            }
            PipelineEvent::ConversionProgress(percent) => format!("Conversion {}%", percent),
            PipelineEvent::Finished(path) => format!("Finished: {}", path.display()),
            PipelineEvent::Failed { stage, message } => {
                format!("Failed while {}: {}", stage.to_string().to_lowercase(), message.replace('\n', " "))
            }
        };
        Some(timestamped(&format!("[{}/{}] {}", event.index + 1, total, body)))
    }

    fn advance(&mut self, index: usize, bucket: u64) -> bool {
        match self.last_bucket.get(&index) {
            Some(last) if *last == bucket => false,
            _ => {
                self.last_bucket.insert(index, bucket);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn event(index: usize, event: PipelineEvent) -> BatchEvent {
        BatchEvent { index, event }
    }

    #[test]
    fn mirror_label_is_decoded_file_name() {
        let mirror = mirror_from_url("https://cdn.example.test/x360/Halo%203%20(USA).zip");
        assert_eq!(mirror.label, "Halo 3 (USA).zip");

        let dir = mirror_from_url("https://cdn.example.test/games/forza/");
        assert_eq!(dir.label, "forza");

        assert_eq!(mirror_from_url("not a url").label, "not a url");
    }

    #[test]
    fn requests_share_destination_and_format() {
        let mirrors = vec![
            mirror_from_url("https://a.test/one.iso"),
            mirror_from_url("https://a.test/two.iso"),
        ];
        let requests = build_requests(mirrors, Path::new("/games"), ConversionFormat::God);
        assert_eq!(requests.len(), 2);
        assert!(requests
            .iter()
            .all(|r| r.install_dir == PathBuf::from("/games") && r.format == ConversionFormat::God));
        assert_eq!(requests[1].mirror.label, "two.iso");
    }

    #[test]
    fn progress_is_thinned_to_tenths() {
        let mut renderer = EventRenderer::default();
        let printed = (0..=100u64)
            .filter_map(|done| {
                renderer.render(
                    &event(
                        0,
                        PipelineEvent::Progress {
                            downloaded: done,
                            total: Some(100),
                        },
                    ),
                    2,
                )
            })
            .count();
        assert_eq!(printed, 11);

        let other_item = renderer.render(
            &event(
                1,
                PipelineEvent::Progress {
                    downloaded: 0,
                    total: Some(100),
                },
            ),
            2,
        );
        assert!(other_item.expect("new item reports").contains("[2/2]"));
    }

    #[test]
    fn failures_render_on_one_line() {
        let mut renderer = EventRenderer::default();
        let line = renderer
            .render(
                &event(
                    0,
                    PipelineEvent::Failed {
                        stage: Stage::Convert,
                        message: "Conversion failed:\nexiso exited with code 1".to_string(),
                    },
                ),
                1,
            )
            .expect("failure rendered");
        assert!(line.ends_with("[1/1] Failed while converting: Conversion failed: exiso exited with code 1"));
        assert!(renderer
            .render(&event(0, PipelineEvent::Stage(Stage::Done)), 1)
            .is_none());
    }
}
