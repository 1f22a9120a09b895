//! Drawing primitives for the annotation overlay

use ab_glyph::{FontVec, PxScale};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{
    draw_filled_rect_mut, draw_line_segment_mut, draw_polygon_mut, draw_text_mut, text_size, Blend,
};
use imageproc::rect::Rect;

use crate::config::OverlaySettings;
use crate::vision::Polygon;

/// Colors and sizes used when drawing annotations
#[derive(Debug, Clone)]
pub struct AnnotationStyle {
    /// Polygon outline color (RGBA)
    pub stroke: [u8; 4],
    /// Polygon fill color (RGBA, alpha-blended)
    pub fill: [u8; 4],
    /// Label text color (RGBA)
    pub label_text: [u8; 4],
    /// Label background color (RGBA, alpha-blended)
    pub label_background: [u8; 4],
    /// Outline thickness in pixels
    pub stroke_width: u32,
    /// Label font size in pixels
    pub font_scale: f32,
}

impl Default for AnnotationStyle {
    fn default() -> Self {
        Self {
            stroke: [0, 200, 0, 255],
            fill: [0, 200, 0, 48],
            label_text: [255, 255, 255, 255],
            label_background: [0, 0, 0, 160],
            stroke_width: 2,
            font_scale: 16.0,
        }
    }
}

impl From<&OverlaySettings> for AnnotationStyle {
    fn from(settings: &OverlaySettings) -> Self {
        Self {
            stroke: settings.stroke_color,
            fill: settings.fill_color,
            label_text: settings.label_color,
            label_background: settings.label_background,
            stroke_width: settings.stroke_width.max(1),
            font_scale: settings.font_scale,
        }
    }
}

/// Fill a polygon with alpha blending. Returns false for degenerate polygons.
pub fn fill_polygon(image: &mut RgbaImage, polygon: &Polygon, color: [u8; 4]) -> bool {
    let points: Vec<imageproc::point::Point<i32>> = polygon
        .points()
        .iter()
        .map(|p| imageproc::point::Point::new(p.x.round() as i32, p.y.round() as i32))
        .collect();

    // draw_polygon_mut rejects closed or collapsed input
    if points[0] == points[points.len() - 1] || polygon.area() < 1.0 {
        return false;
    }

    let mut canvas = Blend(std::mem::take(image));
    draw_polygon_mut(&mut canvas, &points, Rgba(color));
    *image = canvas.0;
    true
}

/// Stroke the closed outline of a polygon
pub fn stroke_polygon(image: &mut RgbaImage, polygon: &Polygon, color: [u8; 4], width: u32) {
    let pts = polygon.points();
    let half = (width as f32 - 1.0) / 2.0;
    let steps = width.max(1);

    for i in 0..pts.len() {
        let a = pts[i];
        let b = pts[(i + 1) % pts.len()];
        for step in 0..steps {
            let offset = step as f32 - half;
            draw_line_segment_mut(image, (a.x + offset, a.y), (b.x + offset, b.y), Rgba(color));
            draw_line_segment_mut(image, (a.x, a.y + offset), (b.x, b.y + offset), Rgba(color));
        }
    }
}

/// Where a label sits relative to its anchor point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelAnchor {
    /// Label starts at the anchor and extends right
    Left,
    /// Label ends at the anchor
    Right,
}

/// Draw a text label on a translucent background just above `(x, y)`
pub fn draw_label(
    image: &mut RgbaImage,
    font: &FontVec,
    style: &AnnotationStyle,
    x: f32,
    y: f32,
    anchor: LabelAnchor,
    text: &str,
) {
    if text.is_empty() {
        return;
    }

    let scale = PxScale::from(style.font_scale);
    let (w, h) = text_size(scale, font, text);
    let pad = 2;

    let left = match anchor {
        LabelAnchor::Left => x.round() as i32,
        LabelAnchor::Right => x.round() as i32 - w as i32 - 2 * pad,
    }
    .max(0);
    let top = (y.round() as i32 - h as i32 - 2 * pad).max(0);

    let mut canvas = Blend(std::mem::take(image));
    draw_filled_rect_mut(
        &mut canvas,
        Rect::at(left, top).of_size(w + 2 * pad as u32, h + 2 * pad as u32),
        Rgba(style.label_background),
    );
    *image = canvas.0;

    draw_text_mut(image, Rgba(style.label_text), left + pad, top + pad, scale, font, text);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::Point;

    fn white(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([255, 255, 255, 255]))
    }

    #[test]
    fn test_default_style() {
        let style = AnnotationStyle::default();
        assert_eq!(style.stroke_width, 2);
        assert!(style.fill[3] < 255, "fill should be translucent");
    }

    #[test]
    fn test_fill_polygon_blends_interior() {
        let mut img = white(20, 20);
        let poly = Polygon::from_corners(Point::new(4.0, 4.0), Point::new(15.0, 15.0)).unwrap();

        assert!(fill_polygon(&mut img, &poly, [0, 0, 255, 128]));
        let center = img.get_pixel(10, 10);
        assert!(center[0] < 255 && center[2] == 255);
        // Outside untouched
        assert_eq!(*img.get_pixel(1, 1), Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn test_fill_skips_degenerate_polygon() {
        let mut img = white(10, 10);
        let poly = Polygon::from_corners(Point::new(3.0, 3.0), Point::new(3.0, 3.0)).unwrap();
        assert!(!fill_polygon(&mut img, &poly, [0, 0, 0, 255]));
        assert_eq!(img, white(10, 10));
    }

    #[test]
    fn test_stroke_polygon_marks_edges() {
        let mut img = white(20, 20);
        let poly = Polygon::from_corners(Point::new(2.0, 2.0), Point::new(17.0, 17.0)).unwrap();

        stroke_polygon(&mut img, &poly, [255, 0, 0, 255], 1);
        assert_eq!(*img.get_pixel(10, 2), Rgba([255, 0, 0, 255]));
        assert_eq!(*img.get_pixel(17, 10), Rgba([255, 0, 0, 255]));
        assert_eq!(*img.get_pixel(10, 10), Rgba([255, 255, 255, 255]));
    }
}
