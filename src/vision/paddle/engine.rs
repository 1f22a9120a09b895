//! PaddleOCR pipeline on ONNX Runtime
//!
//! Detection (DBNet) finds oriented text quads, each quad is rectified with a
//! perspective warp, and the recognizer (CRNN) reads the crops in batches.

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::imageops;
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use ndarray::{Axis, Ix3, Ix4};
use ort::{
    inputs,
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::PaddleSettings;
use crate::overlay::widgets::stroke_polygon;
use crate::overlay::SharedSurface;
use crate::vision::annotation::Polygon;
use crate::vision::source::SourceImage;

use super::models::{ModelManager, ModelPaths};
use super::postprocess::{boxes_from_bitmap, ctc_greedy_decode, CharDictionary, DetectionParams, Quad};
use super::preprocess::{preprocess_for_detection, preprocess_for_recognition};
use super::{PaddleBackend, PaddleOutput, PaddleSession};

/// Crops at least this much taller than wide are treated as vertical text
const VERTICAL_RATIO: f32 = 1.5;

const DIAGNOSTIC_COLOR: [u8; 4] = [230, 30, 30, 255];

/// Backend that downloads the models on first load and runs them in-process
pub struct OnnxPaddle {
    settings: PaddleSettings,
    models_dir: PathBuf,
}

impl OnnxPaddle {
    pub fn new(settings: PaddleSettings, models_dir: PathBuf) -> Self {
        Self {
            settings,
            models_dir,
        }
    }
}

#[async_trait]
impl PaddleBackend for OnnxPaddle {
    async fn load(&self) -> Result<Arc<dyn PaddleSession>> {
        let manager = ModelManager::new(self.models_dir.clone(), self.settings.language.as_str());
        let paths = manager.ensure_all().await?;

        let settings = self.settings.clone();
        let pipeline = tokio::task::spawn_blocking(move || Pipeline::load(&paths, &settings))
            .await??;

        Ok(Arc::new(OnnxPaddleSession {
            pipeline: Arc::new(pipeline),
        }))
    }
}

fn load_session(model_path: &Path, threads: usize) -> Result<Session> {
    info!("Loading ONNX model from {:?}", model_path);

    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(threads)?
        .commit_from_file(model_path)
        .context("Failed to load ONNX model")?;

    let input_names: Vec<&str> = session.inputs.iter().map(|i| i.name.as_str()).collect();
    let output_names: Vec<&str> = session.outputs.iter().map(|o| o.name.as_str()).collect();
    debug!("Model loaded. Inputs: {:?}, Outputs: {:?}", input_names, output_names);

    Ok(session)
}

struct Pipeline {
    detector: Mutex<Session>,
    recognizer: Mutex<Session>,
    dictionary: CharDictionary,
    params: DetectionParams,
    limit_side_len: u32,
    rec_height: u32,
    rec_batch_size: usize,
}

impl Pipeline {
    fn load(paths: &ModelPaths, settings: &PaddleSettings) -> Result<Self> {
        let threads = settings.threads.max(1);
        let detector = load_session(&paths.detection, threads)?;
        let recognizer = load_session(&paths.recognition, threads)?;

        let dict_text = std::fs::read_to_string(&paths.dictionary)
            .with_context(|| format!("Failed to read dictionary {:?}", paths.dictionary))?;
        let dictionary = CharDictionary::from_text(&dict_text);
        if dictionary.is_empty() {
            anyhow::bail!("Character dictionary {:?} is empty", paths.dictionary);
        }
        info!("Loaded {} recognition classes", dictionary.len());

        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
            dictionary,
            params: DetectionParams::from(settings),
            limit_side_len: settings.limit_side_len.max(32),
            rec_height: settings.rec_image_height.max(8),
            rec_batch_size: settings.rec_batch_size.max(1),
        })
    }

    fn run(&self, image: &DynamicImage) -> Result<(Vec<Quad>, Vec<String>)> {
        let rgb = image.to_rgb8();

        let quads = self.detect(&rgb)?;
        let crops: Vec<RgbImage> = quads.iter().map(|q| rotate_crop(&rgb, q)).collect();
        let texts = self.recognize_crops(&crops)?;

        Ok((quads, texts))
    }

    fn detect(&self, rgb: &RgbImage) -> Result<Vec<Quad>> {
        let input = preprocess_for_detection(rgb, self.limit_side_len);

        let pred = {
            let tensor = TensorRef::from_array_view(&input)?;
            let mut session = self.detector.lock();
            let outputs = session
                .run(inputs![tensor])
                .context("Detection inference failed")?;
            outputs[0]
                .try_extract_array::<f32>()?
                .into_owned()
                .into_dimensionality::<Ix4>()
                .context("Unexpected detection output shape")?
        };

        let map = pred.index_axis(Axis(0), 0);
        let map = map.index_axis(Axis(0), 0);
        let quads = boxes_from_bitmap(map, &self.params, rgb.width(), rgb.height());
        debug!("Detected {} text regions", quads.len());
        Ok(quads)
    }

    fn recognize_crops(&self, crops: &[RgbImage]) -> Result<Vec<String>> {
        let mut texts = vec![String::new(); crops.len()];
        if crops.is_empty() {
            return Ok(texts);
        }

        // Similar widths batch together with less padding
        let mut order: Vec<usize> = (0..crops.len()).collect();
        order.sort_by(|&a, &b| aspect(&crops[a]).total_cmp(&aspect(&crops[b])));

        for chunk in order.chunks(self.rec_batch_size) {
            let batch: Vec<&RgbImage> = chunk.iter().map(|&i| &crops[i]).collect();
            let tensor = preprocess_for_recognition(&batch, self.rec_height);

            let pred = {
                let input = TensorRef::from_array_view(&tensor)?;
                let mut session = self.recognizer.lock();
                let outputs = session
                    .run(inputs![input])
                    .context("Recognition inference failed")?;
                outputs[0]
                    .try_extract_array::<f32>()?
                    .into_owned()
                    .into_dimensionality::<Ix3>()
                    .context("Unexpected recognition output shape")?
            };

            for (row, &index) in chunk.iter().enumerate() {
                let (text, score) = ctc_greedy_decode(pred.index_axis(Axis(0), row), &self.dictionary);
                debug!("Region {}: {:?} ({:.3})", index, text, score);
                texts[index] = text;
            }
        }

        Ok(texts)
    }
}

fn aspect(image: &RgbImage) -> f32 {
    image.width() as f32 / image.height().max(1) as f32
}

fn distance(a: [f32; 2], b: [f32; 2]) -> f32 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

/// Rectify a TL/TR/BR/BL quad into an upright crop
fn rotate_crop(image: &RgbImage, quad: &Quad) -> RgbImage {
    let [tl, tr, br, bl] = *quad;
    let width = distance(tl, tr).max(distance(bl, br)).round().max(1.0) as u32;
    let height = distance(tl, bl).max(distance(tr, br)).round().max(1.0) as u32;

    let mut crop = RgbImage::new(width, height);
    let from = quad.map(|[x, y]| (x, y));
    let to = [
        (0.0, 0.0),
        (width as f32, 0.0),
        (width as f32, height as f32),
        (0.0, height as f32),
    ];

    match Projection::from_control_points(from, to) {
        Some(projection) => {
            warp_into(image, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut crop);
        }
        None => {
            // Collinear corners: fall back to the axis-aligned bounds
            let x = tl[0].min(bl[0]).max(0.0) as u32;
            let y = tl[1].min(tr[1]).max(0.0) as u32;
            let w = width.min(image.width().saturating_sub(x)).max(1);
            let h = height.min(image.height().saturating_sub(y)).max(1);
            crop = imageops::crop_imm(image, x, y, w, h).to_image();
        }
    }

    if crop.height() as f32 >= crop.width() as f32 * VERTICAL_RATIO {
        crop = imageops::rotate270(&crop);
    }
    crop
}

/// Draw detected quads over the source image
fn draw_diagnostics(surface: &SharedSurface, image: &DynamicImage, quads: &[Quad]) {
    let mut surface = surface.lock();
    surface.load(image);
    for quad in quads {
        if let Ok(polygon) = Polygon::try_from_points(quad.iter().copied()) {
            stroke_polygon(surface.pixels_mut(), &polygon, DIAGNOSTIC_COLOR, 2);
        }
    }
}

/// A loaded model set. Inference runs on the blocking pool.
pub struct OnnxPaddleSession {
    pipeline: Arc<Pipeline>,
}

#[async_trait]
impl PaddleSession for OnnxPaddleSession {
    async fn recognize(&self, image: Arc<SourceImage>, diagnostics: SharedSurface) -> Result<PaddleOutput> {
        let pipeline = self.pipeline.clone();

        tokio::task::spawn_blocking(move || -> Result<PaddleOutput> {
            let (quads, text) = pipeline.run(image.image())?;
            draw_diagnostics(&diagnostics, image.image(), &quads);

            Ok(PaddleOutput {
                points: quads.iter().map(|q| q.to_vec()).collect(),
                text,
            })
        })
        .await?
    }
}
