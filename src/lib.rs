pub mod config;
pub mod core;
pub mod database;

pub use config::{AppConfig, FeatureMode};
pub use core::image::ImageRecord;
pub use core::pipeline::{
    FolderRole, Pipeline, PipelineError, PipelineState, ScanPhase, ScanProgress, ScanSummary,
    SearchError,
};
pub use database::FeatureCache;
