//! Canonical annotation model shared by every OCR backend
//!
//! Each backend reports text regions in its own shape; adapters normalize them
//! into [`Annotation`] values before anything is rendered or compared.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lowest accepted confidence score
pub const MIN_CONFIDENCE: f32 = 0.0;
/// Highest accepted confidence score
pub const MAX_CONFIDENCE: f32 = 100.0;

/// Reasons an annotation cannot be constructed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("polygon must have exactly 4 points, got {0}")]
    PointCount(usize),
    #[error("polygon point {index} is not finite: ({x}, {y})")]
    NonFinitePoint { index: usize, x: f32, y: f32 },
    #[error("confidence {0} is outside [0, 100]")]
    ConfidenceOutOfRange(f32),
}

/// A point in source-image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl From<(f32, f32)> for Point {
    fn from((x, y): (f32, f32)) -> Self {
        Self { x, y }
    }
}

impl From<[f32; 2]> for Point {
    fn from([x, y]: [f32; 2]) -> Self {
        Self { x, y }
    }
}

/// Corner indices of a [`Polygon`]
pub const TOP_LEFT: usize = 0;
pub const TOP_RIGHT: usize = 1;
pub const BOTTOM_RIGHT: usize = 2;
pub const BOTTOM_LEFT: usize = 3;

/// Four-corner region in top-left, top-right, bottom-right, bottom-left order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Polygon([Point; 4]);

impl Polygon {
    /// Build a polygon from any sequence of points, requiring exactly four
    /// finite points. The order is taken as given.
    pub fn try_from_points<P>(points: impl IntoIterator<Item = P>) -> Result<Self, ValidationError>
    where
        P: Into<Point>,
    {
        let points: Vec<Point> = points.into_iter().map(Into::into).collect();
        let corners: [Point; 4] = points
            .as_slice()
            .try_into()
            .map_err(|_| ValidationError::PointCount(points.len()))?;

        for (index, p) in corners.iter().enumerate() {
            if !p.x.is_finite() || !p.y.is_finite() {
                return Err(ValidationError::NonFinitePoint { index, x: p.x, y: p.y });
            }
        }

        Ok(Self(corners))
    }

    /// Expand two opposite corners of an axis-aligned box into four corners.
    ///
    /// Either diagonal works: the corners are normalized with min/max so the
    /// result is always TL, TR, BR, BL.
    pub fn from_corners(a: Point, b: Point) -> Result<Self, ValidationError> {
        let (x0, x1) = (a.x.min(b.x), a.x.max(b.x));
        let (y0, y1) = (a.y.min(b.y), a.y.max(b.y));
        Self::try_from_points([
            Point::new(x0, y0),
            Point::new(x1, y0),
            Point::new(x1, y1),
            Point::new(x0, y1),
        ])
    }

    pub fn points(&self) -> &[Point; 4] {
        &self.0
    }

    /// Axis-aligned bounds as (min_x, min_y, max_x, max_y)
    pub fn bounds(&self) -> (f32, f32, f32, f32) {
        self.0.iter().fold(
            (f32::INFINITY, f32::INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY),
            |(min_x, min_y, max_x, max_y), p| {
                (min_x.min(p.x), min_y.min(p.y), max_x.max(p.x), max_y.max(p.y))
            },
        )
    }

    /// Shoelace area
    pub fn area(&self) -> f32 {
        let mut sum = 0.0;
        for i in 0..4 {
            let j = (i + 1) % 4;
            sum += self.0[i].x * self.0[j].y - self.0[j].x * self.0[i].y;
        }
        sum.abs() / 2.0
    }
}

/// One recognized text region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    polygon: Polygon,
    text: String,
    /// `None` when the backend does not report a score. Never encoded as 0.
    confidence: Option<f32>,
}

impl Annotation {
    /// Validate and build an annotation. Text is trimmed.
    pub fn new(
        polygon: Polygon,
        text: impl AsRef<str>,
        confidence: Option<f32>,
    ) -> Result<Self, ValidationError> {
        if let Some(c) = confidence {
            if !(MIN_CONFIDENCE..=MAX_CONFIDENCE).contains(&c) {
                return Err(ValidationError::ConfidenceOutOfRange(c));
            }
        }

        Ok(Self {
            polygon,
            text: text.as_ref().trim().to_string(),
            confidence,
        })
    }

    pub fn polygon(&self) -> &Polygon {
        &self.polygon
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn confidence(&self) -> Option<f32> {
        self.confidence
    }
}

/// Output of one `recognize` call
#[derive(Debug, Clone, Default)]
pub struct RecognitionResult {
    /// Annotations in the engine's detection order
    pub annotations: Vec<Annotation>,
    /// Engine-native payload, kept for diagnostic display only
    pub raw: serde_json::Value,
}
