//! Detection and recognition post-processing
//!
//! Turns the DB probability map into oriented text quads and decodes CTC
//! recognizer output into strings.

use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use ndarray::ArrayView2;

use crate::config::PaddleSettings;

/// Four corners in pixel coordinates
pub type Quad = [[f32; 2]; 4];

/// Boxes shorter than this (on their short side) are discarded
const MIN_BOX_SIDE: f32 = 3.0;

/// Rows whose top edges are closer than this are read left to right
const SAME_ROW_TOLERANCE: f32 = 10.0;

/// DB post-processing parameters
#[derive(Debug, Clone)]
pub struct DetectionParams {
    /// Probability threshold for the binary map
    pub threshold: f32,
    /// Minimum mean probability inside a box
    pub box_threshold: f32,
    /// Box expansion ratio
    pub unclip_ratio: f32,
    pub max_candidates: usize,
}

impl From<&PaddleSettings> for DetectionParams {
    fn from(settings: &PaddleSettings) -> Self {
        Self {
            threshold: settings.det_threshold,
            box_threshold: settings.box_threshold,
            unclip_ratio: settings.unclip_ratio,
            max_candidates: settings.max_candidates,
        }
    }
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self::from(&PaddleSettings::default())
    }
}

/// Oriented rectangle: center, side lengths, and the direction of `width`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinAreaRect {
    pub center: [f32; 2],
    pub width: f32,
    pub height: f32,
    /// Radians
    pub angle: f32,
}

impl MinAreaRect {
    pub fn min_side(&self) -> f32 {
        self.width.min(self.height)
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn perimeter(&self) -> f32 {
        2.0 * (self.width + self.height)
    }

    /// Corners in TL, TR, BR, BL order
    pub fn corners(&self) -> Quad {
        let (sin, cos) = self.angle.sin_cos();
        let (hw, hh) = (self.width / 2.0, self.height / 2.0);
        let [cx, cy] = self.center;
        let corner = |sx: f32, sy: f32| {
            [
                cx + sx * hw * cos - sy * hh * sin,
                cy + sx * hw * sin + sy * hh * cos,
            ]
        };
        order_corners([
            corner(-1.0, -1.0),
            corner(1.0, -1.0),
            corner(1.0, 1.0),
            corner(-1.0, 1.0),
        ])
    }

    /// Grow every side outward by `area * ratio / perimeter`
    pub fn unclip(&self, ratio: f32) -> Self {
        let perimeter = self.perimeter();
        if perimeter <= f32::EPSILON {
            return *self;
        }
        let distance = self.area() * ratio / perimeter;
        Self {
            width: self.width + 2.0 * distance,
            height: self.height + 2.0 * distance,
            ..*self
        }
    }
}

fn cross(o: [f32; 2], a: [f32; 2], b: [f32; 2]) -> f32 {
    (a[0] - o[0]) * (b[1] - o[1]) - (a[1] - o[1]) * (b[0] - o[0])
}

/// Convex hull (monotone chain), counter-clockwise without repeated endpoints
pub fn convex_hull(points: &[[f32; 2]]) -> Vec<[f32; 2]> {
    let mut pts = points.to_vec();
    pts.sort_by(|a, b| a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1])));
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }

    let mut hull: Vec<[f32; 2]> = Vec::with_capacity(pts.len() * 2);
    for pass in [pts.clone(), pts.iter().rev().copied().collect()] {
        let start = hull.len();
        for p in pass {
            while hull.len() >= start + 2 && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0.0 {
                hull.pop();
            }
            hull.push(p);
        }
        hull.pop();
    }
    hull
}

/// Minimum-area enclosing rectangle by rotating calipers over the hull
pub fn min_area_rect(points: &[[f32; 2]]) -> Option<MinAreaRect> {
    let hull = convex_hull(points);
    if hull.is_empty() {
        return None;
    }

    if hull.len() < 3 {
        let (min_x, min_y, max_x, max_y) = bounds(&hull);
        return Some(MinAreaRect {
            center: [(min_x + max_x) / 2.0, (min_y + max_y) / 2.0],
            width: max_x - min_x,
            height: max_y - min_y,
            angle: 0.0,
        });
    }

    let mut best: Option<MinAreaRect> = None;
    let n = hull.len();
    for i in 0..n {
        let a = hull[i];
        let b = hull[(i + 1) % n];
        let (ex, ey) = (b[0] - a[0], b[1] - a[1]);
        let len = (ex * ex + ey * ey).sqrt();
        if len < f32::EPSILON {
            continue;
        }
        let (ux, uy) = (ex / len, ey / len);
        let (vx, vy) = (-uy, ux);

        let (mut min_u, mut max_u, mut min_v, mut max_v) =
            (f32::MAX, f32::MIN, f32::MAX, f32::MIN);
        for p in &hull {
            let (dx, dy) = (p[0] - a[0], p[1] - a[1]);
            let pu = dx * ux + dy * uy;
            let pv = dx * vx + dy * vy;
            min_u = min_u.min(pu);
            max_u = max_u.max(pu);
            min_v = min_v.min(pv);
            max_v = max_v.max(pv);
        }

        let rect = {
            let cu = (min_u + max_u) / 2.0;
            let cv = (min_v + max_v) / 2.0;
            MinAreaRect {
                center: [a[0] + cu * ux + cv * vx, a[1] + cu * uy + cv * vy],
                width: max_u - min_u,
                height: max_v - min_v,
                angle: uy.atan2(ux),
            }
        };

        if best.map_or(true, |b| rect.area() < b.area()) {
            best = Some(rect);
        }
    }

    best
}

fn bounds(points: &[[f32; 2]]) -> (f32, f32, f32, f32) {
    points.iter().fold(
        (f32::INFINITY, f32::INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY),
        |(x0, y0, x1, y1), p| (x0.min(p[0]), y0.min(p[1]), x1.max(p[0]), y1.max(p[1])),
    )
}

/// Order four corners as TL, TR, BR, BL.
///
/// The two leftmost points form the left edge (upper one is TL), the two
/// rightmost form the right edge (upper one is TR).
pub fn order_corners(points: Quad) -> Quad {
    let mut pts = points;
    pts.sort_by(|a, b| a[0].total_cmp(&b[0]));

    let (tl, bl) = if pts[0][1] <= pts[1][1] { (pts[0], pts[1]) } else { (pts[1], pts[0]) };
    let (tr, br) = if pts[2][1] <= pts[3][1] { (pts[2], pts[3]) } else { (pts[3], pts[2]) };
    [tl, tr, br, bl]
}

fn inside_convex(quad: &Quad, x: f32, y: f32) -> bool {
    let mut sign = 0.0f32;
    for i in 0..4 {
        let c = cross(quad[i], quad[(i + 1) % 4], [x, y]);
        if c.abs() <= f32::EPSILON {
            continue;
        }
        if sign == 0.0 {
            sign = c.signum();
        } else if c.signum() != sign {
            return false;
        }
    }
    true
}

/// Mean probability of the map inside `quad`
pub fn box_score(pred: &ArrayView2<f32>, quad: &Quad) -> f32 {
    let (h, w) = pred.dim();
    if h == 0 || w == 0 {
        return 0.0;
    }
    let (x0, y0, x1, y1) = bounds(quad);
    let clamp = |v: f32, max: usize| (v.max(0.0) as usize).min(max - 1);
    let (x0, x1) = (clamp(x0.floor(), w), clamp(x1.ceil(), w));
    let (y0, y1) = (clamp(y0.floor(), h), clamp(y1.ceil(), h));

    let mut sum = 0.0;
    let mut count = 0usize;
    for y in y0..=y1 {
        for x in x0..=x1 {
            if inside_convex(quad, x as f32 + 0.5, y as f32 + 0.5) || inside_convex(quad, x as f32, y as f32) {
                sum += pred[[y, x]];
                count += 1;
            }
        }
    }

    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}

/// Extract text quads from a DB probability map of size (map_h, map_w),
/// scaled back into a source image of `src_w` x `src_h` pixels and sorted
/// in reading order.
pub fn boxes_from_bitmap(
    pred: ArrayView2<f32>,
    params: &DetectionParams,
    src_w: u32,
    src_h: u32,
) -> Vec<Quad> {
    let (map_h, map_w) = pred.dim();
    if map_h == 0 || map_w == 0 {
        return Vec::new();
    }

    let mut mask = GrayImage::new(map_w as u32, map_h as u32);
    for ((y, x), &p) in pred.indexed_iter() {
        if p > params.threshold {
            mask.put_pixel(x as u32, y as u32, Luma([255]));
        }
    }

    let scale_x = src_w as f32 / map_w as f32;
    let scale_y = src_h as f32 / map_h as f32;

    let mut quads = Vec::new();
    let contours = find_contours::<i32>(&mask);
    for contour in contours
        .iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .take(params.max_candidates)
    {
        let points: Vec<[f32; 2]> = contour
            .points
            .iter()
            .map(|p| [p.x as f32, p.y as f32])
            .collect();

        let Some(rect) = min_area_rect(&points) else {
            continue;
        };
        if rect.min_side() < MIN_BOX_SIDE {
            continue;
        }

        let score = box_score(&pred, &rect.corners());
        if score < params.box_threshold {
            continue;
        }

        let expanded = rect.unclip(params.unclip_ratio);
        if expanded.min_side() < MIN_BOX_SIDE + 2.0 {
            continue;
        }

        let quad = expanded.corners().map(|[x, y]| {
            [
                (x * scale_x).round().clamp(0.0, src_w as f32),
                (y * scale_y).round().clamp(0.0, src_h as f32),
            ]
        });

        let (x0, y0, x1, y1) = bounds(&quad);
        if x1 - x0 <= MIN_BOX_SIDE || y1 - y0 <= MIN_BOX_SIDE {
            continue;
        }
        quads.push(quad);
    }

    sort_reading_order(&mut quads);
    quads
}

/// Top to bottom; boxes on roughly the same row left to right
pub fn sort_reading_order(quads: &mut [Quad]) {
    quads.sort_by(|a, b| a[0][1].total_cmp(&b[0][1]).then(a[0][0].total_cmp(&b[0][0])));

    // Boxes within the row tolerance are swapped into x order
    for i in 0..quads.len() {
        for j in (1..=i).rev() {
            let (prev, cur) = (quads[j - 1], quads[j]);
            if (cur[0][1] - prev[0][1]).abs() < SAME_ROW_TOLERANCE && cur[0][0] < prev[0][0] {
                quads.swap(j - 1, j);
            } else {
                break;
            }
        }
    }
}

/// Recognizer character table. Index 0 is the CTC blank; a trailing space
/// entry follows the dictionary lines.
#[derive(Debug, Clone)]
pub struct CharDictionary {
    chars: Vec<String>,
}

impl CharDictionary {
    pub fn from_text(text: &str) -> Self {
        let mut chars = vec![String::new()];
        chars.extend(
            text.lines()
                .map(|l| l.trim_end_matches('\r'))
                .filter(|l| !l.is_empty())
                .map(str::to_string),
        );
        chars.push(" ".to_string());
        Self { chars }
    }

    /// Number of classes including blank and space
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.len() <= 2
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.chars.get(index).map(String::as_str)
    }
}

/// Greedy CTC decode of one (time_steps, classes) prediction.
///
/// Returns the text and the mean probability of the emitted characters.
pub fn ctc_greedy_decode(pred: ArrayView2<f32>, dict: &CharDictionary) -> (String, f32) {
    let mut text = String::new();
    let mut scores = Vec::new();
    let mut previous = 0usize;

    for step in pred.outer_iter() {
        let (index, prob) = step
            .iter()
            .copied()
            .enumerate()
            .fold((0usize, f32::MIN), |best, (i, p)| if p > best.1 { (i, p) } else { best });

        if index != 0 && index != previous {
            if let Some(ch) = dict.get(index) {
                text.push_str(ch);
                scores.push(prob);
            }
        }
        previous = index;
    }

    let confidence = if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f32>() / scores.len() as f32
    };
    (text, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn approx(a: [f32; 2], b: [f32; 2]) -> bool {
        (a[0] - b[0]).abs() < 1e-3 && (a[1] - b[1]).abs() < 1e-3
    }

    #[test]
    fn test_order_corners_from_any_permutation() {
        let expected = [[0.0, 0.0], [10.0, 1.0], [9.0, 5.0], [-1.0, 4.0]];
        let shuffled = [expected[2], expected[0], expected[3], expected[1]];
        assert_eq!(order_corners(shuffled), expected);
    }

    #[test]
    fn test_convex_hull_drops_interior_points() {
        let pts = [[0.0, 0.0], [4.0, 0.0], [4.0, 4.0], [0.0, 4.0], [2.0, 2.0], [1.0, 3.0]];
        let hull = convex_hull(&pts);
        assert_eq!(hull.len(), 4);
        assert!(!hull.contains(&[2.0, 2.0]));
    }

    #[test]
    fn test_min_area_rect_axis_aligned() {
        let pts = [[2.0, 3.0], [12.0, 3.0], [12.0, 8.0], [2.0, 8.0], [7.0, 5.0]];
        let rect = min_area_rect(&pts).unwrap();
        assert!((rect.area() - 50.0).abs() < 1e-3);

        let corners = rect.corners();
        assert!(approx(corners[0], [2.0, 3.0]));
        assert!(approx(corners[1], [12.0, 3.0]));
        assert!(approx(corners[2], [12.0, 8.0]));
        assert!(approx(corners[3], [2.0, 8.0]));
    }

    #[test]
    fn test_min_area_rect_rotated() {
        // Diamond: a square of side sqrt(2) * 5 rotated 45 degrees
        let pts = [[5.0, 0.0], [10.0, 5.0], [5.0, 10.0], [0.0, 5.0]];
        let rect = min_area_rect(&pts).unwrap();
        assert!((rect.area() - 50.0).abs() < 1e-2);
        assert!(approx(rect.center, [5.0, 5.0]));
    }

    #[test]
    fn test_unclip_grows_each_side() {
        let rect = MinAreaRect {
            center: [0.0, 0.0],
            width: 20.0,
            height: 10.0,
            angle: 0.0,
        };
        // area 200 * 1.5 / perimeter 60 = 5
        let grown = rect.unclip(1.5);
        assert!((grown.width - 30.0).abs() < 1e-4);
        assert!((grown.height - 20.0).abs() < 1e-4);
    }

    #[test]
    fn test_box_score_mean_inside_quad() {
        let mut pred = Array2::<f32>::zeros((10, 10));
        for y in 2..6 {
            for x in 2..8 {
                pred[[y, x]] = 1.0;
            }
        }
        let inside = [[2.0, 2.0], [7.0, 2.0], [7.0, 5.0], [2.0, 5.0]];
        assert!(box_score(&pred.view(), &inside) > 0.99);

        let outside = [[0.0, 7.0], [9.0, 7.0], [9.0, 9.0], [0.0, 9.0]];
        assert!(box_score(&pred.view(), &outside) < 0.01);
    }

    #[test]
    fn test_boxes_from_bitmap_finds_text_rows() {
        // Two text rows on a 40x20 map, source image is twice as large
        let mut pred = Array2::<f32>::zeros((20, 40));
        for y in 2..7 {
            for x in 4..30 {
                pred[[y, x]] = 0.9;
            }
        }
        for y in 11..16 {
            for x in 6..36 {
                pred[[y, x]] = 0.9;
            }
        }

        let quads = boxes_from_bitmap(pred.view(), &DetectionParams::default(), 80, 40);
        assert_eq!(quads.len(), 2);

        // Reading order: upper row first, scaled into source coordinates
        assert!(quads[0][0][1] < quads[1][0][1]);
        let (x0, y0, x1, y1) = bounds(&quads[0]);
        assert!(x0 <= 8.0 && x1 >= 58.0);
        assert!(y0 <= 4.0 && y1 >= 12.0);

        // Corners come out TL, TR, BR, BL
        for quad in &quads {
            assert_eq!(order_corners(*quad), *quad);
        }
    }

    #[test]
    fn test_boxes_from_bitmap_skips_specks() {
        let mut pred = Array2::<f32>::zeros((20, 20));
        pred[[5, 5]] = 1.0;
        pred[[5, 6]] = 1.0;
        assert!(boxes_from_bitmap(pred.view(), &DetectionParams::default(), 20, 20).is_empty());
    }

    #[test]
    fn test_sort_reading_order_same_row() {
        let left = [[10.0, 22.0], [20.0, 22.0], [20.0, 30.0], [10.0, 30.0]];
        let right = [[50.0, 20.0], [60.0, 20.0], [60.0, 30.0], [50.0, 30.0]];
        let below = [[0.0, 60.0], [10.0, 60.0], [10.0, 70.0], [0.0, 70.0]];

        let mut quads = vec![below, right, left];
        sort_reading_order(&mut quads);
        assert_eq!(quads, vec![left, right, below]);
    }

    #[test]
    fn test_dictionary_layout() {
        let dict = CharDictionary::from_text("a\nb\r\nc\n");
        assert_eq!(dict.len(), 5);
        assert_eq!(dict.get(0), Some(""));
        assert_eq!(dict.get(2), Some("b"));
        assert_eq!(dict.get(4), Some(" "));
        assert!(!dict.is_empty());
    }

    #[test]
    fn test_ctc_greedy_decode_collapses_repeats_and_blanks() {
        let dict = CharDictionary::from_text("h\ni\n");
        // classes: blank, h, i, space
        let steps = [1usize, 1, 0, 2, 2, 0, 3, 1];
        let mut pred = Array2::<f32>::from_elem((steps.len(), dict.len()), 0.05);
        for (t, &c) in steps.iter().enumerate() {
            pred[[t, c]] = 0.8;
        }

        let (text, confidence) = ctc_greedy_decode(pred.view(), &dict);
        assert_eq!(text, "hi h");
        assert!((confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_ctc_all_blank() {
        let dict = CharDictionary::from_text("a\n");
        let mut pred = Array2::<f32>::zeros((4, dict.len()));
        pred.column_mut(0).fill(1.0);
        assert_eq!(ctc_greedy_decode(pred.view(), &dict), (String::new(), 0.0));
    }
}
