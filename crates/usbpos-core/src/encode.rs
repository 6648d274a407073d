//! Contracts for the rendering and encoding collaborators.
//!
//! The core never interprets printer commands. It hands job content to an
//! [`Encoder`] (and, for rendered text, a [`Renderer`] first) and writes
//! whatever bytes come back.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::Job;

/// Monochrome bitmap, one byte per pixel, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Bitmap {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, EncodeError> {
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(EncodeError::InvalidBitmap {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }
}

/// Content handed to an encoder.
#[derive(Debug, Clone, Copy)]
pub enum Content<'a> {
    Text(&'a str),
    Bitmap(&'a Bitmap),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageMode {
    Column,
    #[default]
    Raster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dithering {
    #[default]
    Threshold,
    Bayer,
    FloydSteinberg,
    Atkinson,
}

/// Encoder options passed through untouched by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeOptions {
    pub image_mode: ImageMode,
    pub code_page: String,
    pub embedded: bool,
    /// Paper width in characters.
    pub width: u16,
    pub dithering: Dithering,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            image_mode: ImageMode::Raster,
            code_page: "auto".to_string(),
            embedded: false,
            width: 42,
            dithering: Dithering::Threshold,
        }
    }
}

/// Font used by a renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FontSettings {
    pub family: String,
    pub size_px: u32,
    /// Canvas width in dots.
    pub canvas_width: u32,
}

impl Default for FontSettings {
    fn default() -> Self {
        Self {
            family: "sans-serif".to_string(),
            size_px: 42,
            canvas_width: 384,
        }
    }
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("{collaborator} does not support {what}")]
    Unsupported {
        collaborator: &'static str,
        what: &'static str,
    },

    #[error("Bitmap has {actual} pixels, expected {expected}")]
    InvalidBitmap { expected: usize, actual: usize },

    #[error("{0}")]
    Failed(String),
}

/// Turns content into printer bytes. Must be pure.
pub trait Encoder: Send + Sync {
    fn encode(&self, content: &Content<'_>, options: &EncodeOptions) -> Result<Vec<u8>, EncodeError>;
}

/// Rasterizes text. Must be pure.
pub trait Renderer: Send + Sync {
    fn render(&self, text: &str, font: &FontSettings) -> Result<Bitmap, EncodeError>;
}

/// Sends text as UTF-8 followed by a line feed; rejects bitmaps.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextEncoder;

impl Encoder for PlainTextEncoder {
    fn encode(&self, content: &Content<'_>, _options: &EncodeOptions) -> Result<Vec<u8>, EncodeError> {
        match content {
            Content::Text(text) => {
                let mut bytes = Vec::with_capacity(text.len() + 1);
                bytes.extend_from_slice(text.as_bytes());
                bytes.push(b'\n');
                Ok(bytes)
            }
            Content::Bitmap(_) => Err(EncodeError::Unsupported {
                collaborator: "PlainTextEncoder",
                what: "bitmaps",
            }),
        }
    }
}

/// Placeholder renderer for setups without text rasterization.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRenderer;

impl Renderer for NoRenderer {
    fn render(&self, _text: &str, _font: &FontSettings) -> Result<Bitmap, EncodeError> {
        Err(EncodeError::Unsupported {
            collaborator: "NoRenderer",
            what: "text rendering",
        })
    }
}

/// Dispatches a job to the collaborators matching its kind.
#[derive(Clone)]
pub struct JobEncoder {
    encoder: Arc<dyn Encoder>,
    renderer: Arc<dyn Renderer>,
    options: EncodeOptions,
    font: FontSettings,
}

impl fmt::Debug for JobEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobEncoder")
            .field("options", &self.options)
            .field("font", &self.font)
            .finish_non_exhaustive()
    }
}

impl Default for JobEncoder {
    fn default() -> Self {
        Self::new(Arc::new(PlainTextEncoder), Arc::new(NoRenderer))
    }
}

impl JobEncoder {
    pub fn new(encoder: Arc<dyn Encoder>, renderer: Arc<dyn Renderer>) -> Self {
        Self {
            encoder,
            renderer,
            options: EncodeOptions::default(),
            font: FontSettings::default(),
        }
    }

    pub fn with_options(mut self, options: EncodeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_font(mut self, font: FontSettings) -> Self {
        self.font = font;
        self
    }

    /// Produce the byte buffer for one job.
    pub fn encode(&self, job: &Job) -> Result<Vec<u8>, EncodeError> {
        match job {
            Job::Text(text) => self.encoder.encode(&Content::Text(text), &self.options),
            Job::RenderedText(text) => {
                // Only the first line fits the rendered canvas.
                let line = text.split(['\r', '\n']).next().unwrap_or_default();
                let bitmap = self.renderer.render(line, &self.font)?;
                self.encoder.encode(&Content::Bitmap(&bitmap), &self.options)
            }
            Job::Image(bitmap) => self.encoder.encode(&Content::Bitmap(bitmap), &self.options),
        }
    }
}
