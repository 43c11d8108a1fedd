use crate::{config::OverlayConfig, prediction::Prediction};
use ab_glyph::{FontArc, InvalidFont, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_text_mut},
    rect::Rect,
};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Predictions at or below this confidence are neither drawn nor reported.
pub const CONFIDENCE_THRESHOLD_PERCENT: f64 = 50.0;

const MAGENTA: Rgb<u8> = Rgb([255, 0, 255]);

static DEFAULT_FONT: &[u8] = include_bytes!("../assets/fonts/DejaVuSans.ttf");

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("Failed to read font {path:?}: {source}")]
    FontRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse font: {0}")]
    InvalidFont(#[from] InvalidFont),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelBox {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl PixelBox {
    fn corners(&self) -> [(f64, f64); 4] {
        let right = self.left + self.width;
        let bottom = self.top + self.height;
        [
            (self.left, self.top),
            (right, self.top),
            (right, bottom),
            (self.left, bottom),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub name: String,
    pub confidence_percent: f64,
    pub pixel_box: PixelBox,
}

impl Detection {
    /// Scales a prediction onto an image of `image_width` x `image_height`
    /// pixels, or returns `None` when it does not clear the threshold.
    pub fn from_prediction(
        prediction: &Prediction,
        image_width: u32,
        image_height: u32,
    ) -> Option<Self> {
        let confidence_percent = prediction.confidence_percent();
        if confidence_percent <= CONFIDENCE_THRESHOLD_PERCENT {
            return None;
        }

        let width = f64::from(image_width);
        let height = f64::from(image_height);
        let bbox = &prediction.bounding_box;

        Some(Self {
            name: prediction.tag_name.clone(),
            confidence_percent,
            pixel_box: PixelBox {
                left: bbox.left * width,
                top: bbox.top * height,
                width: bbox.width * width,
                height: bbox.height * height,
            },
        })
    }

    pub fn label(&self) -> String {
        format!("{}: {}", self.name, self.accuracy())
    }

    pub fn accuracy(&self) -> String {
        format!("{:.2}%", self.confidence_percent)
    }

    pub fn summary(&self) -> DetectionSummary {
        DetectionSummary {
            name: self.name.clone(),
            accuracy: self.accuracy(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionSummary {
    pub name: String,
    pub accuracy: String,
}

/// Keeps the predictions above the threshold, in input order.
pub fn select_detections(
    predictions: &[Prediction],
    image_width: u32,
    image_height: u32,
) -> Vec<Detection> {
    predictions
        .iter()
        .filter_map(|prediction| Detection::from_prediction(prediction, image_width, image_height))
        .collect()
}

#[derive(Clone)]
pub struct OverlayRenderer {
    font: FontArc,
    label_scale: PxScale,
}

impl OverlayRenderer {
    pub fn new(font: FontArc, label_scale: f32) -> Self {
        Self {
            font,
            label_scale: PxScale::from(label_scale),
        }
    }

    pub fn with_default_font(label_scale: f32) -> Result<Self, OverlayError> {
        let font = FontArc::try_from_slice(DEFAULT_FONT)?;
        Ok(Self::new(font, label_scale))
    }

    pub fn from_config(config: &OverlayConfig) -> Result<Self, OverlayError> {
        let Some(path) = &config.font_path else {
            return Self::with_default_font(config.label_scale);
        };

        let data = std::fs::read(path).map_err(|source| OverlayError::FontRead {
            path: path.clone(),
            source,
        })?;
        let font = FontArc::try_from_vec(data)?;
        tracing::info!("Loaded label font from {:?}", path);

        Ok(Self::new(font, config.label_scale))
    }

    /// Draws every detection above the threshold onto `image` and returns
    /// the matching summaries. Width maps to the x axis, height to y.
    pub fn render(&self, image: &mut RgbImage, predictions: &[Prediction]) -> Vec<DetectionSummary> {
        let (image_width, image_height) = image.dimensions();
        let detections = select_detections(predictions, image_width, image_height);
        let stroke = (image_width / 100).max(1);

        for detection in &detections {
            self.annotate(image, detection, stroke);
        }

        tracing::debug!(
            "Rendered {} of {} predictions",
            detections.len(),
            predictions.len()
        );

        detections.iter().map(Detection::summary).collect()
    }

    fn annotate(&self, image: &mut RgbImage, detection: &Detection, stroke: u32) {
        let corners = detection.pixel_box.corners();
        for (i, from) in corners.iter().enumerate() {
            let to = corners[(i + 1) % corners.len()];
            stroke_segment(image, *from, to, stroke);
        }

        let (image_width, image_height) = image.dimensions();
        draw_text_mut(
            image,
            MAGENTA,
            label_origin(detection.pixel_box.left, image_width),
            label_origin(detection.pixel_box.top, image_height),
            self.label_scale,
            &self.font,
            &detection.label(),
        );
    }
}

// Box edges are axis aligned, so each one is a filled rectangle `stroke`
// pixels thick, clipped to the image.
fn stroke_segment(image: &mut RgbImage, from: (f64, f64), to: (f64, f64), stroke: u32) {
    let offset = f64::from(stroke / 2);
    let thickness = f64::from(stroke);

    let left = clip(from.0.min(to.0) - offset, image.width());
    let right = clip(from.0.max(to.0) - offset + thickness, image.width());
    let top = clip(from.1.min(to.1) - offset, image.height());
    let bottom = clip(from.1.max(to.1) - offset + thickness, image.height());

    if right <= left || bottom <= top {
        return;
    }

    let rect = Rect::at(left as i32, top as i32).of_size(right - left, bottom - top);
    draw_filled_rect_mut(image, rect, MAGENTA);
}

fn clip(coordinate: f64, limit: u32) -> u32 {
    // NaN saturates to 0
    coordinate.round().clamp(0.0, f64::from(limit)) as u32
}

// Text layout adds glyph offsets to the origin, so it has to stay well
// inside i32 even when the box lies far outside the image.
fn label_origin(coordinate: f64, limit: u32) -> i32 {
    let limit = f64::from(limit);
    coordinate.clamp(-limit, limit) as i32
}
