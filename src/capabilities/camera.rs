use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, RgbaImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::bridge::{CapabilityBridge, Provider, ProviderSource};
use super::geolocation::PositionOptions;
use crate::model::{Clock, LatLon, UnixTimeMs};
use crate::state::StateCell;

pub const MAX_IMAGE_SIZE_BYTES: usize = 20 * 1024 * 1024;
pub const DEFAULT_JPEG_QUALITY: u8 = 85;
pub const DEFAULT_MAX_DIMENSION: u32 = 2048;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    Front,
    #[default]
    Back,
}

impl CameraFacing {
    pub fn flipped(self) -> Self {
        match self {
            CameraFacing::Front => CameraFacing::Back,
            CameraFacing::Back => CameraFacing::Front,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Jpeg,
    Png,
    WebP,
}

impl ImageFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::WebP => "image/webp",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::WebP => "webp",
        }
    }

    pub fn supports_quality(&self) -> bool {
        matches!(self, ImageFormat::Jpeg)
    }

    pub fn from_magic_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }

        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(ImageFormat::Jpeg);
        }

        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Some(ImageFormat::Png);
        }

        if data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
            return Some(ImageFormat::WebP);
        }

        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureConfig {
    pub facing: CameraFacing,
    pub format: ImageFormat,
    pub quality: u8,
    pub max_width: u32,
    pub max_height: u32,
    pub max_file_size: usize,
    pub tag_location: bool,
    pub location_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            facing: CameraFacing::Back,
            format: ImageFormat::Jpeg,
            quality: DEFAULT_JPEG_QUALITY,
            max_width: DEFAULT_MAX_DIMENSION,
            max_height: DEFAULT_MAX_DIMENSION,
            max_file_size: MAX_IMAGE_SIZE_BYTES,
            tag_location: true,
            location_timeout_ms: 5_000,
        }
    }
}

impl CaptureConfig {
    pub fn with_facing(mut self, facing: CameraFacing) -> Self {
        self.facing = facing;
        self
    }

    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.clamp(1, 100);
        self
    }

    pub fn with_max_dimensions(mut self, width: u32, height: u32) -> Self {
        self.max_width = width.max(1);
        self.max_height = height.max(1);
        self
    }

    pub fn with_max_file_size(mut self, max_bytes: usize) -> Self {
        self.max_file_size = max_bytes.min(MAX_IMAGE_SIZE_BYTES);
        self
    }

    pub fn with_location_timeout(mut self, timeout_ms: u64) -> Self {
        self.location_timeout_ms = timeout_ms.clamp(100, 60_000);
        self
    }

    pub fn without_location(mut self) -> Self {
        self.tag_location = false;
        self
    }

    pub fn validated(mut self) -> Self {
        self.quality = self.quality.clamp(1, 100);
        self.max_width = self.max_width.max(1);
        self.max_height = self.max_height.max(1);
        self.max_file_size = self.max_file_size.clamp(1, MAX_IMAGE_SIZE_BYTES);
        self.location_timeout_ms = self.location_timeout_ms.clamp(100, 60_000);
        self
    }

    fn position_options(&self) -> PositionOptions {
        PositionOptions {
            enable_high_accuracy: false,
            timeout_ms: self.location_timeout_ms,
            maximum_age_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedImage {
    data: Vec<u8>,
    format: ImageFormat,
    width: u32,
    height: u32,
    capture_time: UnixTimeMs,
}

impl CapturedImage {
    pub fn new(
        data: Vec<u8>,
        format: ImageFormat,
        width: u32,
        height: u32,
        capture_time: UnixTimeMs,
    ) -> Result<Self, CameraError> {
        if data.is_empty() {
            return Err(CameraError::InvalidImage {
                reason: "image data is empty".to_string(),
            });
        }

        if data.len() > MAX_IMAGE_SIZE_BYTES {
            return Err(CameraError::ImageTooLarge {
                size: data.len(),
                max: MAX_IMAGE_SIZE_BYTES,
            });
        }

        if let Some(detected) = ImageFormat::from_magic_bytes(&data) {
            if detected != format {
                return Err(CameraError::InvalidImage {
                    reason: format!(
                        "format mismatch: declared {:?} but detected {:?}",
                        format, detected
                    ),
                });
            }
        }

        Ok(Self {
            data,
            format,
            width,
            height,
            capture_time,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn file_size(&self) -> usize {
        self.data.len()
    }

    pub fn capture_time(&self) -> UnixTimeMs {
        self.capture_time
    }
}

/// What a provider hands back from a capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraFrame {
    /// RGBA8 pixels read from a video frame.
    Raw { width: u32, height: u32, rgba: Vec<u8> },
    /// Already-encoded photo from a native plugin.
    Encoded(CapturedImage),
}

/// Normalized capture artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoResult {
    pub data_url: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub captured_at: UnixTimeMs,
    pub location: Option<LatLon>,
    pub source: ProviderSource,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraState {
    #[default]
    Uninitialized,
    Initialized,
    Streaming,
    Capturing,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,

    #[error("camera not supported on this platform")]
    NotSupported,

    #[error("cannot {operation} while camera is {state:?}")]
    InvalidState {
        state: CameraState,
        operation: &'static str,
    },

    #[error("capture failed: {reason}")]
    CaptureFailed { reason: String },

    #[error("stream failed: {reason}")]
    StreamFailed { reason: String },

    #[error("image too large: {size} bytes exceeds maximum of {max} bytes")]
    ImageTooLarge { size: usize, max: usize },

    #[error("invalid image: {reason}")]
    InvalidImage { reason: String },

    #[error("format {format:?} not supported on this device")]
    FormatNotSupported { format: ImageFormat },

    #[error("encoding to {format:?} failed: {reason}")]
    Encode { format: ImageFormat, reason: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CameraError {
    pub fn is_permission_error(&self) -> bool {
        matches!(self, CameraError::PermissionDenied)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CameraError::CaptureFailed { .. } | CameraError::StreamFailed { .. }
        )
    }
}

#[async_trait]
pub trait CameraProvider: Provider {
    async fn start_stream(&self, facing: CameraFacing) -> Result<(), CameraError>;

    async fn capture(&self, config: &CaptureConfig) -> Result<CameraFrame, CameraError>;

    async fn stop_stream(&self) -> Result<(), CameraError>;
}

/// Encodes RGBA pixels, shrinking to fit the configured bounds first.
pub fn encode_frame(
    frame: CameraFrame,
    config: &CaptureConfig,
    captured_at: UnixTimeMs,
) -> Result<CapturedImage, CameraError> {
    let image = match frame {
        CameraFrame::Encoded(image) => image,
        CameraFrame::Raw { width, height, rgba } => {
            let buffer = RgbaImage::from_raw(width, height, rgba).ok_or_else(|| {
                CameraError::InvalidImage {
                    reason: format!("pixel buffer does not match {}x{}", width, height),
                }
            })?;
            let mut img = DynamicImage::ImageRgba8(buffer);
            if width > config.max_width || height > config.max_height {
                img = img.resize(
                    config.max_width,
                    config.max_height,
                    image::imageops::FilterType::Triangle,
                );
            }
            let data = encode_image(&img, config.format, config.quality)?;
            CapturedImage::new(data, config.format, img.width(), img.height(), captured_at)?
        }
    };

    if image.file_size() > config.max_file_size {
        return Err(CameraError::ImageTooLarge {
            size: image.file_size(),
            max: config.max_file_size,
        });
    }

    Ok(image)
}

fn encode_image(img: &DynamicImage, format: ImageFormat, quality: u8) -> Result<Vec<u8>, CameraError> {
    let (width, height) = (img.width(), img.height());
    if width == 0 || height == 0 {
        return Err(CameraError::InvalidImage {
            reason: "zero dimension".into(),
        });
    }

    let mut buffer = Cursor::new(Vec::new());
    let result = match format {
        ImageFormat::Jpeg => {
            let rgb = img.to_rgb8();
            JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).write_image(
                rgb.as_raw(),
                width,
                height,
                ExtendedColorType::Rgb8,
            )
        }
        ImageFormat::Png => {
            let rgba = img.to_rgba8();
            PngEncoder::new(&mut buffer).write_image(rgba.as_raw(), width, height, ExtendedColorType::Rgba8)
        }
        ImageFormat::WebP => {
            let rgba = img.to_rgba8();
            WebPEncoder::new_lossless(&mut buffer).write_image(
                rgba.as_raw(),
                width,
                height,
                ExtendedColorType::Rgba8,
            )
        }
    };

    result.map_err(|e| CameraError::Encode {
        format,
        reason: e.to_string(),
    })?;
    Ok(buffer.into_inner())
}

pub fn to_data_url(image: &CapturedImage) -> String {
    format!(
        "data:{};base64,{}",
        image.format().mime_type(),
        STANDARD.encode(image.data())
    )
}

struct CameraInner {
    state: CameraState,
    facing: CameraFacing,
    active: Option<Arc<dyn CameraProvider>>,
}

/// Puts the camera back to `Streaming` however a capture ends.
struct CaptureGuard<'a> {
    inner: &'a Mutex<CameraInner>,
    state: &'a StateCell<CameraState>,
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.state == CameraState::Capturing {
                inner.state = CameraState::Streaming;
                self.state.set(CameraState::Streaming);
            }
        }
    }
}

pub struct CameraCapture {
    bridge: Arc<CapabilityBridge>,
    clock: Arc<dyn Clock>,
    config: CaptureConfig,
    inner: Mutex<CameraInner>,
    state: StateCell<CameraState>,
    last_photo: StateCell<Option<PhotoResult>>,
}

impl CameraCapture {
    pub fn new(bridge: Arc<CapabilityBridge>, clock: Arc<dyn Clock>, config: CaptureConfig) -> Self {
        let config = config.validated();
        Self {
            bridge,
            clock,
            inner: Mutex::new(CameraInner {
                state: CameraState::Uninitialized,
                facing: config.facing,
                active: None,
            }),
            config,
            state: StateCell::new(CameraState::Uninitialized),
            last_photo: StateCell::new(None),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, CameraInner>, CameraError> {
        self.inner.lock().map_err(|_| CameraError::Internal {
            message: "camera state poisoned".into(),
        })
    }

    fn transition(&self, inner: &mut CameraInner, to: CameraState) {
        debug!(from = ?inner.state, to = ?to, "camera state");
        inner.state = to;
        self.state.set(to);
    }

    pub fn state(&self) -> CameraState {
        self.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CameraState> {
        self.state.subscribe()
    }

    pub fn facing(&self) -> CameraFacing {
        self.lock().map(|inner| inner.facing).unwrap_or(self.config.facing)
    }

    pub fn last_photo(&self) -> Option<PhotoResult> {
        self.last_photo.get()
    }

    pub fn subscribe_photo(&self) -> watch::Receiver<Option<PhotoResult>> {
        self.last_photo.subscribe()
    }

    pub fn clear_last_photo(&self) {
        self.last_photo.set(None);
    }

    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), CameraError> {
        if self.state() != CameraState::Uninitialized {
            return Ok(());
        }

        let source = self.bridge.camera().probe().await.ok_or(CameraError::NotSupported)?;

        let mut inner = self.lock()?;
        if inner.state == CameraState::Uninitialized {
            self.transition(&mut inner, CameraState::Initialized);
        }
        info!(?source, "camera initialized");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn start_stream(&self, facing: CameraFacing) -> Result<ProviderSource, CameraError> {
        let previous = {
            let mut inner = self.lock()?;
            match inner.state {
                CameraState::Initialized => None,
                CameraState::Streaming => inner.active.take(),
                state => {
                    return Err(CameraError::InvalidState {
                        state,
                        operation: "start stream",
                    })
                }
            }
        };

        if let Some(previous) = previous {
            if let Err(e) = previous.stop_stream().await {
                warn!(error = %e, "failed to stop previous stream");
            }
        }

        let result = self
            .bridge
            .camera()
            .run(|p| async move {
                p.start_stream(facing).await?;
                Ok::<_, CameraError>(p)
            })
            .await;

        let mut inner = self.lock()?;
        match result {
            Ok((provider, source)) => {
                inner.facing = facing;
                inner.active = Some(provider);
                self.transition(&mut inner, CameraState::Streaming);
                info!(?source, ?facing, "stream started");
                Ok(source)
            }
            Err(e) => {
                inner.active = None;
                self.transition(&mut inner, CameraState::Initialized);
                Err(e.into_error(|_| CameraError::NotSupported))
            }
        }
    }

    pub async fn switch_camera(&self) -> Result<CameraFacing, CameraError> {
        let facing = {
            let inner = self.lock()?;
            if inner.state != CameraState::Streaming {
                return Err(CameraError::InvalidState {
                    state: inner.state,
                    operation: "switch camera",
                });
            }
            inner.facing.flipped()
        };
        self.start_stream(facing).await?;
        Ok(facing)
    }

    #[instrument(skip(self))]
    pub async fn stop_stream(&self) -> Result<(), CameraError> {
        let active = {
            let mut inner = self.lock()?;
            match inner.state {
                CameraState::Streaming => {
                    self.transition(&mut inner, CameraState::Initialized);
                    inner.active.take()
                }
                CameraState::Capturing => {
                    return Err(CameraError::InvalidState {
                        state: CameraState::Capturing,
                        operation: "stop stream",
                    })
                }
                _ => None,
            }
        };

        if let Some(active) = active {
            if let Err(e) = active.stop_stream().await {
                warn!(error = %e, "provider failed to stop stream");
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn capture(&self) -> Result<PhotoResult, CameraError> {
        let (_guard, active) = {
            let mut inner = self.lock()?;
            if inner.state != CameraState::Streaming {
                return Err(CameraError::InvalidState {
                    state: inner.state,
                    operation: "capture",
                });
            }
            self.transition(&mut inner, CameraState::Capturing);
            let guard = CaptureGuard {
                inner: &self.inner,
                state: &self.state,
            };
            (guard, inner.active.clone())
        };

        let config = &self.config;
        let (frame, source) = match active {
            // The provider that owns the stream answers first.
            Some(provider) => match provider.capture(config).await {
                Ok(frame) => (frame, provider.source()),
                Err(e) => {
                    debug!(provider = provider.name(), error = %e, "streaming camera failed, trying others");
                    self.bridge
                        .camera()
                        .without(&provider)
                        .run(|p| async move { p.capture(config).await })
                        .await
                        .map_err(|ladder| ladder.into_error(|_| e))?
                }
            },
            None => self
                .bridge
                .camera()
                .run(|p| async move { p.capture(config).await })
                .await
                .map_err(|e| e.into_error(|_| CameraError::NotSupported))?,
        };

        let captured_at = self.clock.now_ms();
        let encode_config = self.config.clone();
        let image = tokio::task::spawn_blocking(move || encode_frame(frame, &encode_config, captured_at))
            .await
            .map_err(|e| CameraError::Internal {
                message: format!("encoder task failed: {}", e),
            })??;

        let location = if self.config.tag_location {
            let wait = Duration::from_millis(self.config.location_timeout_ms);
            let options = self.config.position_options();
            match tokio::time::timeout(wait, self.bridge.current_position(&options)).await {
                Ok(Ok(position)) => Some(position.coords),
                Ok(Err(e)) => {
                    debug!(error = %e, "photo left untagged");
                    None
                }
                Err(_) => {
                    debug!(timeout_ms = self.config.location_timeout_ms, "location timed out, photo left untagged");
                    None
                }
            }
        } else {
            None
        };

        let photo = PhotoResult {
            data_url: to_data_url(&image),
            mime_type: image.format().mime_type().to_string(),
            format: image.format(),
            width: image.width(),
            height: image.height(),
            captured_at,
            location,
            source,
            bytes: image.into_data(),
        };

        info!(
            width = photo.width,
            height = photo.height,
            bytes = photo.bytes.len(),
            ?source,
            "photo captured"
        );
        self.last_photo.set(Some(photo.clone()));
        Ok(photo)
    }
}
