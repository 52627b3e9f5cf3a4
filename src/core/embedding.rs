//! Deep image embeddings from an ONNX vision model.
//!
//! The model session is not safe to run from several threads at once, so
//! `EmbeddingService` keeps it behind a single mutex: decoding and
//! preprocessing run on the caller's thread, inference runs one call at a
//! time.

use crate::core::similarity::l2_normalize;
use image::{imageops::FilterType, DynamicImage};
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::Session;
use ort::value::Tensor;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid image dimensions: {width}x{height}")]
    Dimensions { width: u32, height: u32 },

    #[error("Failed to load model {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("Inference failed: {reason}")]
    Inference { reason: String },

    #[error("Model loader panicked: {reason}")]
    LoaderPanic { reason: String },

    #[error("Model returned an empty output")]
    EmptyOutput,

    #[error("Embedding model unavailable: {reason}")]
    Unavailable { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionTarget {
    Gpu,
    Cpu { threads: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelStatus {
    Uninitialized,
    Ready(ExecutionTarget),
    Unavailable(String),
}

/// A `[1, 3, size, size]` channel-major float tensor.
#[derive(Debug, Clone)]
pub struct ImageTensor {
    pub size: u32,
    pub data: Vec<f32>,
}

/// A loaded vision model. `run` takes `&mut self`; callers serialize.
pub trait FeatureModel: Send {
    fn run(&mut self, input: ImageTensor) -> Result<Vec<f32>, EmbeddingError>;
}

/// Builds a model session for a given execution target.
pub trait ModelLoader: Send + Sync {
    fn load(&self, target: ExecutionTarget) -> Result<Box<dyn FeatureModel>, EmbeddingError>;
}

/// Stretch-resize to `size`x`size` and normalize with ImageNet statistics.
pub fn preprocess(img: &DynamicImage, size: u32) -> Result<ImageTensor, EmbeddingError> {
    if img.width() == 0 || img.height() == 0 || size == 0 {
        return Err(EmbeddingError::Dimensions {
            width: img.width(),
            height: img.height(),
        });
    }

    let rgb = img.resize_exact(size, size, FilterType::Triangle).to_rgb8();
    let plane = size as usize * size as usize;
    let mut data = vec![0.0f32; plane * 3];
    for (i, pixel) in rgb.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = (pixel[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }

    Ok(ImageTensor { size, data })
}

pub struct OnnxLoader {
    model_path: PathBuf,
}

impl OnnxLoader {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
        }
    }

    fn load_error(&self, reason: impl std::fmt::Display) -> EmbeddingError {
        EmbeddingError::ModelLoad {
            path: self.model_path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

impl ModelLoader for OnnxLoader {
    fn load(&self, target: ExecutionTarget) -> Result<Box<dyn FeatureModel>, EmbeddingError> {
        if !self.model_path.exists() {
            return Err(self.load_error("model file not found"));
        }

        let builder = Session::builder().map_err(|e| self.load_error(e))?;
        let builder = match target {
            ExecutionTarget::Gpu => builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .build()
                    .error_on_failure()])
                .map_err(|e| self.load_error(e))?,
            ExecutionTarget::Cpu { threads } => builder
                .with_intra_threads(threads)
                .map_err(|e| self.load_error(e))?,
        };
        let session = builder
            .commit_from_file(&self.model_path)
            .map_err(|e| self.load_error(e))?;

        let name = self
            .model_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("onnx-model")
            .to_string();
        log::debug!("Loaded model {} on {:?}", name, target);

        Ok(Box::new(OnnxModel { session }))
    }
}

pub struct OnnxModel {
    session: Session,
}

impl FeatureModel for OnnxModel {
    fn run(&mut self, input: ImageTensor) -> Result<Vec<f32>, EmbeddingError> {
        let side = input.size as i64;
        let tensor = Tensor::from_array((vec![1i64, 3, side, side], input.data)).map_err(|e| {
            EmbeddingError::Inference {
                reason: format!("tensor creation error: {e}"),
            }
        })?;

        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| EmbeddingError::Inference {
                reason: e.to_string(),
            })?;

        let (_name, output) = outputs.iter().next().ok_or(EmbeddingError::EmptyOutput)?;
        let (_shape, data) =
            output
                .try_extract_tensor::<f32>()
                .map_err(|e| EmbeddingError::Inference {
                    reason: format!("tensor extraction failed: {e}"),
                })?;

        Ok(data.to_vec())
    }
}

struct SessionSlot {
    model: Option<Box<dyn FeatureModel>>,
    status: ModelStatus,
}

/// Owns the model session and serializes every call into it.
pub struct EmbeddingService {
    loader: Box<dyn ModelLoader>,
    prefer_gpu: bool,
    input_size: u32,
    ready: AtomicBool,
    slot: Mutex<SessionSlot>,
}

impl EmbeddingService {
    pub fn new(loader: Box<dyn ModelLoader>, input_size: u32, prefer_gpu: bool) -> Self {
        Self {
            loader,
            prefer_gpu,
            input_size,
            ready: AtomicBool::new(false),
            slot: Mutex::new(SessionSlot {
                model: None,
                status: ModelStatus::Uninitialized,
            }),
        }
    }

    pub fn onnx(model_path: impl Into<PathBuf>, input_size: u32, prefer_gpu: bool) -> Self {
        Self::new(Box::new(OnnxLoader::new(model_path)), input_size, prefer_gpu)
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    pub fn status(&self) -> ModelStatus {
        self.lock().status.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Load the session, trying the GPU first and then the CPU.
    ///
    /// Safe to call concurrently; only the first caller does the work. A
    /// failed load is remembered until `dispose`.
    pub fn initialize(&self) -> Result<(), EmbeddingError> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut slot = self.lock();
        match &slot.status {
            ModelStatus::Ready(_) => return Ok(()),
            ModelStatus::Unavailable(reason) => {
                return Err(EmbeddingError::Unavailable {
                    reason: reason.clone(),
                })
            }
            ModelStatus::Uninitialized => {}
        }

        let mut targets = Vec::with_capacity(2);
        if self.prefer_gpu {
            targets.push(ExecutionTarget::Gpu);
        }
        targets.push(ExecutionTarget::Cpu {
            threads: num_cpus::get(),
        });

        let mut last_error = String::from("no execution target attempted");
        for target in targets {
            // The ONNX runtime panics when its shared library is missing.
            let loaded = catch_panic(
                || self.loader.load(target),
                |reason| EmbeddingError::LoaderPanic { reason },
            );
            match loaded {
                Ok(model) => {
                    slot.model = Some(model);
                    slot.status = ModelStatus::Ready(target);
                    self.ready.store(true, Ordering::Release);
                    log::info!("Embedding model ready on {:?}", target);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("Embedding model failed to load on {:?}: {}", target, e);
                    last_error = e.to_string();
                }
            }
        }

        log::error!("critical: embedding model unavailable: {}", last_error);
        slot.status = ModelStatus::Unavailable(last_error.clone());
        Err(EmbeddingError::Unavailable { reason: last_error })
    }

    /// Decode, preprocess and embed the image at `path`.
    pub fn extract(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError> {
        let img = image::open(path).map_err(|e| {
            log::warn!("Failed to decode {} for embedding: {}", path.display(), e);
            EmbeddingError::from(e)
        })?;

        self.extract_image(&img).map_err(|e| {
            log::warn!(
                "Embedding extraction failed for {} ({}x{}): {}",
                path.display(),
                img.width(),
                img.height(),
                e
            );
            e
        })
    }

    pub fn extract_image(&self, img: &DynamicImage) -> Result<Vec<f32>, EmbeddingError> {
        self.initialize()?;
        let tensor = preprocess(img, self.input_size())?;

        let mut output = {
            let mut slot = self.lock();
            let model = slot.model.as_mut().ok_or_else(|| EmbeddingError::Unavailable {
                reason: "model disposed".to_string(),
            })?;
            catch_panic(
                || model.run(tensor),
                |reason| EmbeddingError::Inference {
                    reason: format!("model panicked: {reason}"),
                },
            )?
        };

        if output.is_empty() {
            return Err(EmbeddingError::EmptyOutput);
        }
        l2_normalize(&mut output);
        Ok(output)
    }

    /// Drop the session. The next `initialize` loads it again.
    pub fn dispose(&self) {
        let mut slot = self.lock();
        slot.model = None;
        slot.status = ModelStatus::Uninitialized;
        self.ready.store(false, Ordering::Release);
    }

    /// The slot holds no invariant a panic can break halfway, so a poisoned
    /// lock is taken over as is.
    fn lock(&self) -> MutexGuard<'_, SessionSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn catch_panic<T>(
    f: impl FnOnce() -> Result<T, EmbeddingError>,
    on_panic: impl FnOnce(String) -> EmbeddingError,
) -> Result<T, EmbeddingError> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(on_panic(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    /// Embeds an image as its three per-channel tensor means. Panics if two
    /// calls overlap.
    pub struct ChannelMeanModel {
        delay: Duration,
        empty: bool,
        panic_on_run: bool,
        in_flight: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
    }

    impl FeatureModel for ChannelMeanModel {
        fn run(&mut self, input: ImageTensor) -> Result<Vec<f32>, EmbeddingError> {
            if self.panic_on_run {
                panic!("inference crashed");
            }
            assert!(
                !self.in_flight.swap(true, Ordering::SeqCst),
                "overlapping inference"
            );
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);

            let plane = input.size as usize * input.size as usize;
            let output = if self.empty {
                Vec::new()
            } else {
                input
                    .data
                    .chunks_exact(plane)
                    .map(|channel| channel.iter().sum::<f32>() / plane as f32)
                    .collect()
            };

            self.in_flight.store(false, Ordering::SeqCst);
            Ok(output)
        }
    }

    #[derive(Clone, Default)]
    pub struct StubLoader {
        pub delay: Duration,
        pub empty: bool,
        pub fail_gpu: bool,
        pub fail_cpu: bool,
        pub panic_on_load: bool,
        pub panic_on_run: bool,
        pub attempts: Arc<Mutex<Vec<ExecutionTarget>>>,
        pub calls: Arc<AtomicUsize>,
        pub in_flight: Arc<AtomicBool>,
    }

    impl StubLoader {
        pub fn attempts(&self) -> Vec<ExecutionTarget> {
            self.attempts.lock().unwrap().clone()
        }

        pub fn service(&self, input_size: u32) -> EmbeddingService {
            EmbeddingService::new(Box::new(self.clone()), input_size, true)
        }
    }

    impl ModelLoader for StubLoader {
        fn load(&self, target: ExecutionTarget) -> Result<Box<dyn FeatureModel>, EmbeddingError> {
            self.attempts.lock().unwrap().push(target);
            if self.panic_on_load {
                panic!("An error occurred while attempting to load the ONNX Runtime binary");
            }
            let fail = match target {
                ExecutionTarget::Gpu => self.fail_gpu,
                ExecutionTarget::Cpu { .. } => self.fail_cpu,
            };
            if fail {
                return Err(EmbeddingError::ModelLoad {
                    path: "stub".to_string(),
                    reason: format!("{:?} not available", target),
                });
            }
            Ok(Box::new(ChannelMeanModel {
                delay: self.delay,
                empty: self.empty,
                panic_on_run: self.panic_on_run,
                in_flight: self.in_flight.clone(),
                calls: self.calls.clone(),
            }))
        }
    }
}
