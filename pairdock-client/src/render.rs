use std::{
    io::Cursor,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use image::{ImageFormat, Rgba, RgbaImage};
use qrcode::{Color, EcLevel, QrCode};
use thiserror::Error;
use tokio::{runtime::Handle, sync::mpsc};
use tracing::{debug, warn};

pub const DEFAULT_DIMENSION_PX: u32 = 200;
pub const DEFAULT_QUIET_ZONE_MODULES: u32 = 2;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("qr encoding failed: {0}")]
    Encode(#[from] qrcode::types::QrError),
    #[error("bitmap encoding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("payload could not be built: {0}")]
    Payload(#[from] pairdock_core::PayloadError),
    #[error("render worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    /// Target edge length; the output is the largest whole-module multiple
    /// that fits, and never smaller than one pixel per module.
    pub dimension: u32,
    pub quiet_zone_modules: u32,
    pub foreground: [u8; 4],
    pub background: [u8; 4],
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_DIMENSION_PX,
            quiet_zone_modules: DEFAULT_QUIET_ZONE_MODULES,
            foreground: [255, 255, 255, 255],
            background: [0, 0, 0, 255],
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct RenderedBitmap {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Debug for RenderedBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderedBitmap")
            .field("png_bytes", &self.png.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// Text to bitmap. Called from a blocking worker, so implementations may be
/// slow but must not touch display state.
pub trait CodeEncoder: Send + Sync + 'static {
    fn encode(&self, text: &str, options: &RenderOptions) -> Result<RenderedBitmap, RenderError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QrPngEncoder;

impl CodeEncoder for QrPngEncoder {
    fn encode(&self, text: &str, options: &RenderOptions) -> Result<RenderedBitmap, RenderError> {
        if text.is_empty() {
            return Err(RenderError::EmptyPayload);
        }

        let code = QrCode::with_error_correction_level(text.as_bytes(), EcLevel::M)?;
        let modules = u32::try_from(code.width())
            .map_err(|_| RenderError::Worker("qr code too wide".to_owned()))?;
        let colors = code.to_colors();

        let quiet = options.quiet_zone_modules;
        let total_modules = modules + quiet * 2;
        let scale = (options.dimension / total_modules).max(1);
        let side = total_modules * scale;
        let fg = Rgba(options.foreground);
        let bg = Rgba(options.background);

        let image = RgbaImage::from_fn(side, side, |x, y| {
            let mx = x / scale;
            let my = y / scale;
            if mx < quiet || my < quiet || mx >= quiet + modules || my >= quiet + modules {
                return bg;
            }
            let index = ((my - quiet) * modules + (mx - quiet)) as usize;
            match colors[index] {
                Color::Dark => fg,
                Color::Light => bg,
            }
        });

        let mut png = Vec::new();
        image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
        Ok(RenderedBitmap {
            png,
            width: side,
            height: side,
        })
    }
}

#[derive(Debug)]
pub struct RenderOutcome {
    pub token: u64,
    pub payload: String,
    pub result: Result<RenderedBitmap, RenderError>,
}

/// Renders payloads off the calling thread.
///
/// Each request is stamped with a token from a single counter. Outcomes are
/// delivered on the channel in completion order; [`CodeDisplay::apply`]
/// drops any outcome whose token is no longer the latest.
#[derive(Clone)]
pub struct CodeRenderer {
    encoder: Arc<dyn CodeEncoder>,
    options: RenderOptions,
    latest: Arc<AtomicU64>,
    runtime: Handle,
    outcomes: mpsc::UnboundedSender<RenderOutcome>,
}

impl CodeRenderer {
    pub fn new(
        encoder: Arc<dyn CodeEncoder>,
        options: RenderOptions,
        runtime: Handle,
        outcomes: mpsc::UnboundedSender<RenderOutcome>,
    ) -> Self {
        Self {
            encoder,
            options,
            latest: Arc::new(AtomicU64::new(0)),
            runtime,
            outcomes,
        }
    }

    pub fn request_render(&self, payload: impl Into<String>) -> u64 {
        let payload = payload.into();
        self.request_render_with(move || Ok(payload))
    }

    /// Like [`CodeRenderer::request_render`], but the payload itself is
    /// composed on the blocking worker, so anything slow it needs (such as
    /// issuing a secret) stays off the calling thread.
    pub fn request_render_with<F>(&self, compose: F) -> u64
    where
        F: FnOnce() -> Result<String, RenderError> + Send + 'static,
    {
        let token = self.invalidate();
        let encoder = Arc::clone(&self.encoder);
        let options = self.options;
        let outcomes = self.outcomes.clone();

        debug!(token, "render requested");
        self.runtime.spawn(async move {
            let work = tokio::task::spawn_blocking(move || {
                let payload = compose()?;
                let bitmap = encoder.encode(&payload, &options)?;
                Ok::<_, RenderError>((payload, bitmap))
            });
            let (payload, result) = match work.await {
                Ok(Ok((payload, bitmap))) => (payload, Ok(bitmap)),
                Ok(Err(err)) => (String::new(), Err(err)),
                Err(err) => (String::new(), Err(RenderError::Worker(err.to_string()))),
            };
            if outcomes
                .send(RenderOutcome {
                    token,
                    payload,
                    result,
                })
                .is_err()
            {
                debug!(token, "render finished after display closed");
            }
        });
        token
    }

    /// Issues a token without rendering, voiding every request in flight.
    pub fn invalidate(&self) -> u64 {
        self.latest.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn latest_token(&self) -> u64 {
        self.latest.load(Ordering::Acquire)
    }

    pub fn is_current(&self, token: u64) -> bool {
        token == self.latest_token()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayedCode {
    pub token: u64,
    pub payload: String,
    pub bitmap: RenderedBitmap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    Applied,
    Stale,
    Failed,
}

/// The code currently on screen. Owned by the display context.
#[derive(Debug, Default)]
pub struct CodeDisplay {
    current: Option<DisplayedCode>,
}

impl CodeDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&DisplayedCode> {
        self.current.as_ref()
    }

    pub fn clear(&mut self) {
        self.current = None;
    }

    pub fn apply(&mut self, outcome: RenderOutcome, renderer: &CodeRenderer) -> ApplyResult {
        let RenderOutcome {
            token,
            payload,
            result,
        } = outcome;

        if !renderer.is_current(token) {
            debug!(token, latest = renderer.latest_token(), "discarding stale render");
            return ApplyResult::Stale;
        }

        match result {
            Ok(bitmap) => {
                debug!(token, width = bitmap.width, "render applied");
                self.current = Some(DisplayedCode {
                    token,
                    payload,
                    bitmap,
                });
                ApplyResult::Applied
            }
            Err(err) => {
                // Keep whatever is on screen.
                warn!(token, "code generation failed: {}", err);
                ApplyResult::Failed
            }
        }
    }
}
