pub mod catalogue_service;
pub mod conversion_service;
pub mod download_service;
pub mod extraction_service;
pub mod pipeline;
pub mod storage_service;

pub use catalogue_service::CatalogueService;
pub use conversion_service::ConversionService;
pub use download_service::{DownloadControl, DownloadOptions, DownloadService};
pub use extraction_service::{ArchiveKind, ExtractionService, Extractor};
pub use pipeline::{
    run_batch, BatchEvent, BatchHandle, BatchOutcome, InstallPipeline, PipelineEvent,
    PipelineHandle, Stage,
};
pub use storage_service::{FreeSpaceSource, StorageService, SystemDisks};
