//! Overlay Presentation Layer
//!
//! Draws a source image and its annotations onto a [`Surface`]. Every render
//! starts from a fresh copy of the source image, so annotations from a
//! previous recognition never survive into the next one.

pub mod widgets;

use ab_glyph::FontVec;
use image::{DynamicImage, RgbaImage};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::OverlaySettings;
use crate::overlay::widgets::{draw_label, fill_polygon, stroke_polygon, AnnotationStyle, LabelAnchor};
use crate::vision::{Annotation, Point, TOP_LEFT, TOP_RIGHT};

/// Fonts tried when no font path is configured
const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/opentype/noto/NotoSansCJK-Regular.ttc",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// A resizable RGBA drawing surface
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Surface {
    pixels: RgbaImage,
}

/// Surface shared between the harness and an engine that draws onto it
pub type SharedSurface = Arc<Mutex<Surface>>;

impl Surface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedSurface {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Replace the contents (and size) with `image`
    pub fn load(&mut self, image: &DynamicImage) {
        self.pixels = image.to_rgba8();
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.width() == 0 || self.pixels.height() == 0
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut RgbaImage {
        &mut self.pixels
    }

    /// Write the surface as an image file (format from the extension)
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        self.pixels.save(path)?;
        Ok(())
    }
}

/// What a render call drew
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderReport {
    pub width: u32,
    pub height: u32,
    /// Polygons outlined (one per annotation)
    pub polygons: usize,
    /// Text and confidence labels drawn
    pub labels: usize,
}

/// Draws images plus annotations onto surfaces
pub struct OverlayRenderer {
    style: AnnotationStyle,
    font: Option<FontVec>,
}

impl OverlayRenderer {
    /// Renderer without labels
    pub fn new(style: AnnotationStyle) -> Self {
        Self { style, font: None }
    }

    /// Renderer configured from settings, loading the label font if one is available
    pub fn from_settings(settings: &OverlaySettings) -> Self {
        let font = match &settings.font_path {
            Some(path) => load_font(path),
            None => find_system_font(),
        };
        if font.is_none() {
            debug!("No label font available, overlay labels will be skipped");
        }

        Self {
            style: AnnotationStyle::from(settings),
            font,
        }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Redraw `surface` from `image` and draw every annotation in order
    pub fn render(
        &self,
        surface: &mut Surface,
        image: &DynamicImage,
        annotations: &[Annotation],
    ) -> RenderReport {
        surface.load(image);
        let (width, height) = surface.dimensions();
        let canvas = surface.pixels_mut();

        let mut report = RenderReport {
            width,
            height,
            ..Default::default()
        };

        for annotation in annotations {
            let polygon = annotation.polygon();
            fill_polygon(canvas, polygon, self.style.fill);
            stroke_polygon(canvas, polygon, self.style.stroke, self.style.stroke_width);
            report.polygons += 1;

            let Some(font) = &self.font else {
                continue;
            };

            for label in plan_labels(annotation) {
                draw_label(canvas, font, &self.style, label.at.x, label.at.y, label.anchor, &label.text);
                report.labels += 1;
            }
        }

        debug!(
            "Rendered {} annotations onto {}x{} surface ({} labels)",
            report.polygons, width, height, report.labels
        );
        report
    }
}

/// One label to draw next to an annotation
#[derive(Debug, Clone, PartialEq)]
pub struct LabelPlan {
    pub text: String,
    pub at: Point,
    pub anchor: LabelAnchor,
}

/// Labels for one annotation: the text near the first corner, and the
/// confidence near the second corner when it is present and nonzero.
pub fn plan_labels(annotation: &Annotation) -> Vec<LabelPlan> {
    let points = annotation.polygon().points();
    let mut labels = Vec::with_capacity(2);

    if !annotation.text().is_empty() {
        labels.push(LabelPlan {
            text: annotation.text().to_string(),
            at: points[TOP_LEFT],
            anchor: LabelAnchor::Left,
        });
    }

    if let Some(confidence) = annotation.confidence().filter(|c| *c > 0.0) {
        labels.push(LabelPlan {
            text: format!("{confidence:.1}"),
            at: points[TOP_RIGHT],
            anchor: LabelAnchor::Right,
        });
    }

    labels
}

fn load_font(path: &Path) -> Option<FontVec> {
    match std::fs::read(path) {
        Ok(data) => match FontVec::try_from_vec(data) {
            Ok(font) => {
                info!("Loaded label font: {}", path.display());
                Some(font)
            }
            Err(e) => {
                warn!("Failed to parse font {}: {}", path.display(), e);
                None
            }
        },
        Err(e) => {
            warn!("Failed to read font {}: {}", path.display(), e);
            None
        }
    }
}

fn find_system_font() -> Option<FontVec> {
    SYSTEM_FONTS.iter().find_map(|path| {
        let data = std::fs::read(path).ok()?;
        let font = FontVec::try_from_vec(data).ok()?;
        debug!("Using system font: {}", path);
        Some(font)
    })
}
