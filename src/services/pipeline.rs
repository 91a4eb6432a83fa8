use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use uuid::Uuid;

use crate::config::RomToolConfig;
use crate::errors::{DownloadError, Result, RomToolError, StorageError};
use crate::models::InstallRequest;
use crate::services::conversion_service::{ConversionProgress, ConversionService};
use crate::services::download_service::{DownloadControl, DownloadOptions, DownloadService};
use crate::services::extraction_service::{is_archive, ExtractionService};
use crate::services::storage_service::StorageService;
use crate::utils::file::dir_size;
use crate::utils::format::{format_bytes, format_gib};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    SpaceCheck,
    Download,
    Extract,
    Convert,
    Install,
    Cleanup,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Init => "Preparing",
            Stage::SpaceCheck => "Checking disk space",
            Stage::Download => "Downloading",
            Stage::Extract => "Extracting",
            Stage::Convert => "Converting",
            Stage::Install => "Installing",
            Stage::Cleanup => "Cleaning up",
            Stage::Done => "Done",
            Stage::Failed => "Failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Stage(Stage),
    Status(String),
    Progress { downloaded: u64, total: Option<u64> },
    ConversionProgress(u8),
    Finished(PathBuf),
    Failed { stage: Stage, message: String },
}

/// Event sink for one run; also tracks the current stage so a panicking
/// run can still be attributed.
#[derive(Clone)]
struct Reporter {
    events: mpsc::UnboundedSender<PipelineEvent>,
    current_stage: Arc<Mutex<Stage>>,
}

impl Reporter {
    fn send(&self, event: PipelineEvent) {
        // A caller that stopped listening must not stop the run.
        let _ = self.events.send(event);
    }

    fn stage(&self, stage: Stage) {
        if let Ok(mut current) = self.current_stage.lock() {
            *current = stage;
        }
        tracing::info!("stage: {:?}", stage);
        self.send(PipelineEvent::Stage(stage));
    }

    fn status(&self, message: impl Into<String>) {
        self.send(PipelineEvent::Status(message.into()));
    }

    fn current(&self) -> Stage {
        self.current_stage
            .lock()
            .map(|stage| *stage)
            .unwrap_or(Stage::Init)
    }
}

#[derive(Clone)]
pub struct InstallPipeline {
    temp_root: PathBuf,
    size_estimate: u64,
    downloads: DownloadService,
    extraction: Arc<ExtractionService>,
    conversion: ConversionService,
    storage: StorageService,
}

impl InstallPipeline {
    pub fn new(config: &RomToolConfig) -> Self {
        Self::with_services(
            config.temp_root.clone(),
            config.fallback_size_estimate,
            DownloadService::from_config(config),
            ExtractionService::new(),
            ConversionService::from_config(config),
            StorageService::from_config(config),
        )
    }

    pub fn with_services(
        temp_root: PathBuf,
        size_estimate: u64,
        downloads: DownloadService,
        extraction: ExtractionService,
        conversion: ConversionService,
        storage: StorageService,
    ) -> Self {
        Self {
            temp_root,
            size_estimate,
            downloads,
            extraction: Arc::new(extraction),
            conversion,
            storage,
        }
    }

    /// Spawns one install run on the runtime and returns immediately.
    pub fn start(&self, request: InstallRequest) -> PipelineHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = watch::channel(DownloadControl::Running);
        let reporter = Reporter {
            events: events_tx,
            current_stage: Arc::new(Mutex::new(Stage::Init)),
        };

        let pipeline = self.clone();
        let run_reporter = reporter.clone();
        let task = tokio::spawn(async move { pipeline.run(request, run_reporter, control_rx).await });

        let join = tokio::spawn(async move {
            match task.await {
                Ok(result) => result,
                Err(err) => {
                    let details = join_failure_details(err);
                    tracing::error!("install task aborted: {}", details);
                    let failure = RomToolError::Unexpected(details);
                    reporter.send(PipelineEvent::Failed {
                        stage: reporter.current(),
                        message: failure.user_message(),
                    });
                    Err(failure)
                }
            }
        });

        PipelineHandle {
            events: events_rx,
            control: control_tx,
            join,
        }
    }

    async fn run(
        &self,
        request: InstallRequest,
        reporter: Reporter,
        control: watch::Receiver<DownloadControl>,
    ) -> Result<PathBuf> {
        let work_dir = self
            .temp_root
            .join(format!("romtool_{}", Uuid::new_v4().simple()));
        reporter.stage(Stage::Init);
        reporter.status(format!(
            "Installing {} as {} into {}",
            request.mirror.label,
            request.format,
            request.install_dir.display()
        ));

        match self.execute(&request, &work_dir, &reporter, control).await {
            Ok(installed) => {
                reporter.stage(Stage::Cleanup);
                let storage = self.storage.clone();
                let dir = work_dir.clone();
                let cleaned = tokio::task::spawn_blocking(move || storage.cleanup_temp(&dir))
                    .await
                    .unwrap_or(false);
                if !cleaned {
                    reporter.status(format!(
                        "Warning: could not remove temporary files at {}",
                        work_dir.display()
                    ));
                }
                reporter.stage(Stage::Done);
                reporter.status(format!("Installed to {}", installed.display()));
                reporter.send(PipelineEvent::Finished(installed.clone()));
                Ok(installed)
            }
            Err(err) => {
                let stage = reporter.current();
                tracing::error!(
                    "install of {} failed during {:?}: {} (temp files kept at {})",
                    request.mirror.label,
                    stage,
                    err,
                    work_dir.display()
                );
                if let Ok(mut current) = reporter.current_stage.lock() {
                    *current = Stage::Failed;
                }
                reporter.send(PipelineEvent::Failed {
                    stage,
                    message: err.user_message(),
                });
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        request: &InstallRequest,
        work_dir: &Path,
        reporter: &Reporter,
        control: watch::Receiver<DownloadControl>,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(work_dir).await?;
        tracing::debug!("work dir {}", work_dir.display());

        reporter.stage(Stage::SpaceCheck);
        let storage = self.storage.clone();
        let install_dir = request.install_dir.clone();
        let required = self.size_estimate;
        let available =
            tokio::task::spawn_blocking(move || storage.check_disk_space(&install_dir, required))
                .await
                .map_err(join_error)??;
        reporter.status(format!(
            "Disk space OK: {} free, {} reserved",
            format_gib(available),
            format_gib(required.saturating_add(self.storage.safety_buffer()))
        ));

        reporter.stage(Stage::Download);
        reporter.status(format!("Downloading {}", request.mirror.url));
        let progress_events = reporter.clone();
        let retry_events = reporter.clone();
        let options = DownloadOptions {
            progress: Some(Arc::new(move |downloaded: u64, total: Option<u64>| {
                progress_events.send(PipelineEvent::Progress { downloaded, total });
            })),
            filename_override: None,
            control: Some(control),
            on_retry: Some(Arc::new(move |attempt: usize, err: &DownloadError| {
                retry_events.status(format!(
                    "Download attempt {} failed ({}); retrying",
                    attempt, err
                ));
            })),
        };
        let downloaded = self
            .downloads
            .download(&request.mirror.url, work_dir, options)
            .await?;
        let file_name = downloaded
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        reporter.status(format!(
            "Downloaded {} ({})",
            file_name,
            format_bytes(downloaded.bytes)
        ));

        let iso = if is_archive(&downloaded.path) {
            reporter.stage(Stage::Extract);
            reporter.status(format!("Extracting {}", file_name));
            let extraction = self.extraction.clone();
            let archive = downloaded.path.clone();
            let extracted_dir = work_dir.join("extracted");
            tokio::task::spawn_blocking(move || {
                let dir = extraction.extract(&archive, &extracted_dir)?;
                extraction.locate_disc_image(&dir, &file_name)
            })
            .await
            .map_err(join_error)??
        } else {
            downloaded.path.clone()
        };

        reporter.stage(Stage::Convert);
        reporter.status(format!(
            "Converting {} to {}",
            iso.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            request.format
        ));
        let conversion_events = reporter.clone();
        let progress: ConversionProgress = Arc::new(move |percent: u8| {
            conversion_events.send(PipelineEvent::ConversionProgress(percent));
        });
        let converted_dir = work_dir.join("converted");
        self.conversion
            .convert(&iso, &converted_dir, request.format, Some(&progress))
            .await?;

        reporter.stage(Stage::Install);
        let storage = self.storage.clone();
        let install_dir = request.install_dir.clone();
        let (installed, size) = tokio::task::spawn_blocking(move || {
            let installed = storage.install(&converted_dir, &install_dir)?;
            let size = dir_size(&installed).unwrap_or(0);
            Ok::<_, StorageError>((installed, size))
        })
        .await
        .map_err(join_error)??;
        reporter.status(format!(
            "Moved {} into {}",
            format_bytes(size),
            installed.display()
        ));

        Ok(installed)
    }
}

fn join_error(err: JoinError) -> RomToolError {
    RomToolError::Unexpected(join_failure_details(err))
}

fn join_failure_details(err: JoinError) -> String {
    if err.is_panic() {
        panic_message(err.into_panic())
    } else {
        "install task was cancelled".to_string()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "install task panicked".to_string()
    }
}

/// Caller side of one run.
pub struct PipelineHandle {
    events: mpsc::UnboundedReceiver<PipelineEvent>,
    control: watch::Sender<DownloadControl>,
    join: JoinHandle<Result<PathBuf>>,
}

impl PipelineHandle {
    /// `None` once the run has finished and every event was delivered.
    pub async fn next_event(&mut self) -> Option<PipelineEvent> {
        self.events.recv().await
    }

    /// Stops the download at the next chunk boundary. Later stages are not
    /// interruptible.
    pub fn cancel(&self) {
        let _ = self.control.send(DownloadControl::Cancelled);
    }

    pub async fn wait(self) -> Result<PathBuf> {
        self.join.await.map_err(join_error)?
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchEvent {
    pub index: usize,
    pub event: PipelineEvent,
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub index: usize,
    pub label: String,
    /// Installed path, or the user-facing failure message.
    pub result: std::result::Result<PathBuf, String>,
}

pub struct BatchHandle {
    events: mpsc::UnboundedReceiver<BatchEvent>,
    cancel: watch::Sender<bool>,
    join: JoinHandle<Vec<BatchOutcome>>,
}

impl BatchHandle {
    pub async fn next_event(&mut self) -> Option<BatchEvent> {
        self.events.recv().await
    }

    /// Cancels the running item's download and skips the remaining items.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub async fn wait(self) -> Result<Vec<BatchOutcome>> {
        self.join.await.map_err(join_error)
    }
}

/// Installs `requests` one after another; a failed item does not stop the
/// rest.
pub fn run_batch(pipeline: &InstallPipeline, requests: Vec<InstallRequest>) -> BatchHandle {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    let pipeline = pipeline.clone();

    let join = tokio::spawn(async move {
        let total = requests.len();
        let mut outcomes = Vec::with_capacity(total);
        let mut cancelled = false;
        let mut listening = true;

        for (index, request) in requests.into_iter().enumerate() {
            let label = request.mirror.label.clone();
            if cancelled {
                outcomes.push(BatchOutcome {
                    index,
                    label,
                    result: Err("Skipped: batch cancelled".to_string()),
                });
                continue;
            }

            tracing::info!("batch item {}/{}: {}", index + 1, total, label);
            let mut handle = pipeline.start(request);
            loop {
                tokio::select! {
                    event = handle.next_event() => match event {
                        Some(event) => {
                            let _ = events_tx.send(BatchEvent { index, event });
                        }
                        None => break,
                    },
                    changed = cancel_rx.changed(), if listening && !cancelled => {
                        match changed {
                            Ok(()) if *cancel_rx.borrow() => {
                                cancelled = true;
                                handle.cancel();
                            }
                            Ok(()) => {}
                            Err(_) => listening = false,
                        }
                    }
                }
            }

            let result = handle.wait().await.map_err(|err| err.user_message());
            outcomes.push(BatchOutcome {
                index,
                label,
                result,
            });
        }

        outcomes
    });

    BatchHandle {
        events: events_rx,
        cancel: cancel_tx,
        join,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    use crate::models::{ConversionFormat, MirrorLink};
    use crate::services::download_service::{DownloadSettings, CHUNK_SIZE};
    use crate::test_support::{test_client, write_script, write_zip, FixedFreeSpace, Reply, TestServer};

    struct Fixture {
        temp: TempDir,
        pipeline: InstallPipeline,
    }

    impl Fixture {
        fn new(free_space: u64) -> Self {
            let temp = tempdir().expect("tempdir");
            let base = temp.path().join("base");
            write_script(
                &base.join("bin").join("exiso"),
                "mkdir -p \"$2/Game\" && cp \"$3\" \"$2/Game/default.xex\"",
            );
            write_script(
                &base.join("bin").join("iso2god"),
                "mkdir -p \"$2/4D5307E6/00007000\" && cp \"$1\" \"$2/4D5307E6/00007000/data\"",
            );
            let temp_root = temp.path().join("tmp");
            std::fs::create_dir_all(&temp_root).expect("create temp root");

            let pipeline = InstallPipeline::with_services(
                temp_root,
                1024,
                DownloadService::new(
                    test_client(),
                    DownloadSettings {
                        max_attempts: 3,
                        retry_wait: Duration::ZERO,
                        chunk_size: CHUNK_SIZE,
                    },
                ),
                ExtractionService::new(),
                ConversionService::new(&base, Duration::from_secs(30)),
                StorageService::new(Arc::new(FixedFreeSpace(free_space)), 512),
            );
            Self { temp, pipeline }
        }

        fn request(&self, url: String, format: ConversionFormat) -> InstallRequest {
            InstallRequest {
                mirror: MirrorLink {
                    label: "Test Game".to_string(),
                    url,
                },
                install_dir: self.temp.path().join("games"),
                format,
            }
        }

        fn work_dirs(&self) -> usize {
            std::fs::read_dir(self.temp.path().join("tmp"))
                .expect("read temp root")
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_name().to_string_lossy().starts_with("romtool_"))
                .count()
        }
    }

    async fn drain(handle: &mut PipelineHandle) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
        events
    }

    fn work_dir_entries(fixture: &Fixture) -> Vec<PathBuf> {
        std::fs::read_dir(fixture.temp.path().join("tmp"))
            .expect("read temp root")
            .filter_map(|entry| entry.ok())
            .flat_map(|work| std::fs::read_dir(work.path()).expect("read work dir"))
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect()
    }

    fn is_partial_progress(event: &PipelineEvent) -> bool {
        matches!(event, PipelineEvent::Progress { downloaded, .. } if *downloaded > 0)
    }

    fn stages(events: &[PipelineEvent]) -> Vec<Stage> {
        events
            .iter()
            .filter_map(|event| match event {
                PipelineEvent::Stage(stage) => Some(*stage),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn retries_then_installs_and_cleans_up() {
        let fixture = Fixture::new(u64::MAX);
        let server = TestServer::start(vec![
            Reply::Drop,
            Reply::Drop,
            Reply::ok(b"DISC-IMAGE".to_vec()),
        ])
        .await;

        let mut handle = fixture
            .pipeline
            .start(fixture.request(server.url("/Game.iso"), ConversionFormat::Xex));
        let events = drain(&mut handle).await;
        let installed = handle.wait().await.expect("install succeeds");

        let retries = events
            .iter()
            .filter(|event| matches!(event, PipelineEvent::Status(text) if text.contains("retrying")))
            .count();
        assert_eq!(retries, 2);
        assert_eq!(server.hits(), 3);
        assert_eq!(
            stages(&events),
            vec![
                Stage::Init,
                Stage::SpaceCheck,
                Stage::Download,
                Stage::Convert,
                Stage::Install,
                Stage::Cleanup,
                Stage::Done
            ]
        );
        assert!(events.contains(&PipelineEvent::Progress {
            downloaded: 10,
            total: Some(10)
        }));
        assert!(events.contains(&PipelineEvent::ConversionProgress(100)));
        assert_eq!(events.last(), Some(&PipelineEvent::Finished(installed.clone())));

        assert_eq!(installed, fixture.temp.path().join("games").join("Game"));
        assert_eq!(std::fs::read(installed.join("default.xex")).unwrap(), b"DISC-IMAGE");
        assert_eq!(fixture.work_dirs(), 0);
    }

    #[tokio::test]
    async fn insufficient_space_fails_before_any_request() {
        let fixture = Fixture::new(1024 + 511);
        let server = TestServer::start(vec![Reply::ok(b"never".to_vec())]).await;

        let mut handle = fixture
            .pipeline
            .start(fixture.request(server.url("/Game.iso"), ConversionFormat::Xex));
        let events = drain(&mut handle).await;
        let err = handle.wait().await.expect_err("not enough space");

        assert!(matches!(err, RomToolError::Storage(_)));
        match events.last() {
            Some(PipelineEvent::Failed { stage, message }) => {
                assert_eq!(*stage, Stage::SpaceCheck);
                assert!(message.starts_with("Not enough disk space."));
            }
            other => panic!("unexpected last event: {other:?}"),
        }
        assert_eq!(server.hits(), 0);
        assert_eq!(fixture.work_dirs(), 1);
        assert!(!fixture.temp.path().join("games").exists());
    }

    #[tokio::test]
    async fn archives_are_extracted_before_conversion() {
        let fixture = Fixture::new(u64::MAX);
        let archive = fixture.temp.path().join("payload.zip");
        write_zip(&archive, &[("Game (USA)/readme.txt", "hi"), ("Game (USA)/game.iso", "ISO")]);
        let body = std::fs::read(&archive).expect("read zip");
        let server = TestServer::start(vec![Reply::ok(body)]).await;

        let mut handle = fixture
            .pipeline
            .start(fixture.request(server.url("/Game%20(USA).zip"), ConversionFormat::God));
        let events = drain(&mut handle).await;
        let installed = handle.wait().await.expect("install succeeds");

        assert!(stages(&events).contains(&Stage::Extract));
        assert_eq!(installed, fixture.temp.path().join("games").join("4D5307E6"));
        assert_eq!(
            std::fs::read(installed.join("00007000").join("data")).unwrap(),
            b"ISO"
        );
    }

    #[tokio::test]
    async fn conversion_failure_keeps_temp_files() {
        let fixture = Fixture::new(u64::MAX);
        write_script(
            &fixture.temp.path().join("base").join("bin").join("exiso"),
            "echo 'bad image' >&2\nexit 2",
        );
        let server = TestServer::start(vec![Reply::ok(b"DISC".to_vec())]).await;

        let mut handle = fixture
            .pipeline
            .start(fixture.request(server.url("/Game.iso"), ConversionFormat::Xex));
        let events = drain(&mut handle).await;
        assert!(handle.wait().await.is_err());

        match events.last() {
            Some(PipelineEvent::Failed { stage, message }) => {
                assert_eq!(*stage, Stage::Convert);
                assert!(message.starts_with("Conversion failed:"));
                assert!(message.contains("bad image"));
            }
            other => panic!("unexpected last event: {other:?}"),
        }
        assert!(!stages(&events).contains(&Stage::Install));
        assert_eq!(fixture.work_dirs(), 1);
        assert!(!fixture.temp.path().join("games").exists());
    }

    #[tokio::test]
    async fn batch_continues_after_a_failed_item() {
        let fixture = Fixture::new(u64::MAX);
        let missing = TestServer::start(vec![Reply::status(404)]).await;
        let working = TestServer::start(vec![Reply::ok(b"DISC".to_vec())]).await;

        let requests = vec![
            fixture.request(missing.url("/Gone.iso"), ConversionFormat::Xex),
            fixture.request(working.url("/Game.iso"), ConversionFormat::Xex),
        ];
        let mut batch = run_batch(&fixture.pipeline, requests);

        let mut events = Vec::new();
        while let Some(event) = batch.next_event().await {
            events.push(event);
        }
        let outcomes = batch.wait().await.expect("batch completes");

        assert_eq!(outcomes.len(), 2);
        let first_error = outcomes[0].result.as_ref().expect_err("first item fails");
        assert!(first_error.starts_with("Download failed:"));
        assert!(first_error.contains("404"));
        assert_eq!(
            outcomes[1].result.as_ref().expect("second item installs"),
            &fixture.temp.path().join("games").join("Game")
        );

        let first_failed = events
            .iter()
            .position(|e| e.index == 0 && matches!(e.event, PipelineEvent::Failed { .. }))
            .expect("failure event for item 0");
        let second_started = events
            .iter()
            .position(|e| e.index == 1)
            .expect("events for item 1");
        assert!(first_failed < second_started);
        assert_eq!(missing.hits(), 3);
    }

    #[tokio::test]
    async fn cancel_during_download_fails_and_keeps_work_dir() {
        let fixture = Fixture::new(u64::MAX);
        let server = TestServer::start(vec![Reply::stall(vec![1u8; CHUNK_SIZE + 1], 8 * CHUNK_SIZE as u64)]).await;

        let mut handle = fixture
            .pipeline
            .start(fixture.request(server.url("/Big.iso"), ConversionFormat::Xex));
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            if is_partial_progress(&event) {
                handle.cancel();
            }
            events.push(event);
        }
        let err = handle.wait().await.expect_err("cancelled run fails");

        assert!(matches!(err, RomToolError::Download(DownloadError::Cancelled)));
        match events.last() {
            Some(PipelineEvent::Failed { stage, message }) => {
                assert_eq!(*stage, Stage::Download);
                assert!(message.starts_with("Download failed:"));
                assert!(message.contains("cancelled"));
            }
            other => panic!("unexpected last event: {other:?}"),
        }
        assert!(!stages(&events).contains(&Stage::Convert));
        assert_eq!(server.hits(), 1);
        assert_eq!(fixture.work_dirs(), 1);
        assert!(work_dir_entries(&fixture).is_empty());
    }

    #[tokio::test]
    async fn batch_cancel_skips_remaining_items() {
        let fixture = Fixture::new(u64::MAX);
        let slow = TestServer::start(vec![Reply::stall(vec![1u8; CHUNK_SIZE + 1], 8 * CHUNK_SIZE as u64)]).await;
        let never = TestServer::start(vec![Reply::ok(b"DISC".to_vec())]).await;

        let requests = vec![
            fixture.request(slow.url("/First.iso"), ConversionFormat::Xex),
            fixture.request(never.url("/Second.iso"), ConversionFormat::Xex),
            fixture.request(never.url("/Third.iso"), ConversionFormat::God),
        ];
        let mut batch = run_batch(&fixture.pipeline, requests);
        while let Some(event) = batch.next_event().await {
            if event.index == 0 && is_partial_progress(&event.event) {
                batch.cancel();
            }
        }
        let outcomes = batch.wait().await.expect("batch completes");

        assert_eq!(outcomes.len(), 3);
        let first_error = outcomes[0].result.as_ref().expect_err("first item cancelled");
        assert!(first_error.contains("cancelled"));
        for skipped in &outcomes[1..] {
            assert_eq!(skipped.result, Err("Skipped: batch cancelled".to_string()));
        }
        assert_eq!(never.hits(), 0);
        assert!(!fixture.temp.path().join("games").exists());
    }
}
