use image::imageops::FilterType;
use image::{ImageFormat, Rgb, RgbImage};
use tracing::debug;
use wastecam_common::frame::PixelFormat;
use wastecam_common::prediction::ClassificationResult;

use crate::camera::Frame;

/// Status code for a model whose output does not match its label count.
pub const MODEL_OUTPUT_MISMATCH: i32 = -100;
/// Status code for an input buffer of the wrong shape.
pub const MODEL_INPUT_MISMATCH: i32 = -101;

/// The on-device inference model, treated as an opaque scoring function.
pub trait Classifier: Send + Sync {
    /// Category names, in the order `invoke` scores them.
    fn labels(&self) -> &[String];

    /// Width and height of the RGB input the model expects.
    fn input_size(&self) -> (u32, u32);

    /// Score interleaved RGB values in `[0, 1]`. Any non-zero status is an error.
    fn invoke(&self, input: &[f32]) -> Result<Vec<f32>, i32>;

    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("frame conversion failed: {0}")]
    ConversionFailed(String),
    #[error("model returned status {0}")]
    ModelError(i32),
}

/// A frame converted to the model's input format, independent of the capture buffer.
#[derive(Debug, Clone)]
pub struct ModelInput {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

pub struct ClassificationStage {
    model: Box<dyn Classifier>,
}

impl ClassificationStage {
    pub fn new(model: Box<dyn Classifier>) -> Self {
        Self { model }
    }

    pub fn labels(&self) -> &[String] {
        self.model.labels()
    }

    /// Convert the frame, release it, then run the model over the converted input.
    pub fn classify(&self, frame: Frame<'_>) -> Result<ClassificationResult, ClassifyError> {
        let input = self.prepare(frame)?;
        self.infer(&input)
    }

    fn prepare(&self, frame: Frame<'_>) -> Result<ModelInput, ClassifyError> {
        let (width, height) = self.model.input_size();
        let converted = to_model_input(&frame, width, height);
        frame.release();
        converted
    }

    fn infer(&self, input: &ModelInput) -> Result<ClassificationResult, ClassifyError> {
        if (input.width, input.height) != self.model.input_size()
            || input.data.len() != (input.width * input.height * 3) as usize
        {
            debug!(
                model = self.model.name(),
                width = input.width,
                height = input.height,
                values = input.data.len(),
                "converted input does not match the model"
            );
            return Err(ClassifyError::ModelError(MODEL_INPUT_MISMATCH));
        }

        let scores = self
            .model
            .invoke(&input.data)
            .map_err(ClassifyError::ModelError)?;

        let labels = self.model.labels();
        if scores.len() != labels.len() {
            debug!(
                model = self.model.name(),
                scores = scores.len(),
                labels = labels.len(),
                "model output does not match label count"
            );
            return Err(ClassifyError::ModelError(MODEL_OUTPUT_MISMATCH));
        }

        Ok(ClassificationResult::from_scores(labels, &scores))
    }
}

/// Decode the frame's native format into RGB, resize to the model input and
/// normalize to `[0, 1]`.
pub fn to_model_input(frame: &Frame<'_>, width: u32, height: u32) -> Result<ModelInput, ClassifyError> {
    let rgb = decode_rgb(frame)?;
    let rgb = if rgb.dimensions() == (width, height) {
        rgb
    } else {
        image::imageops::resize(&rgb, width, height, FilterType::Triangle)
    };

    let data = rgb.into_raw().into_iter().map(|v| v as f32 / 255.0).collect();
    Ok(ModelInput {
        width,
        height,
        data,
    })
}

fn decode_rgb(frame: &Frame<'_>) -> Result<RgbImage, ClassifyError> {
    if frame.is_empty() {
        return Err(ClassifyError::ConversionFailed("empty frame".into()));
    }
    let format = frame.format();
    if format == PixelFormat::Jpeg {
        return image::load_from_memory_with_format(frame.data(), ImageFormat::Jpeg)
            .map(|img| img.to_rgb8())
            .map_err(|e| ClassifyError::ConversionFailed(e.to_string()));
    }

    let (width, height) = (frame.width(), frame.height());
    if width == 0 || height == 0 {
        return Err(ClassifyError::ConversionFailed(format!(
            "{format} frame without dimensions"
        )));
    }
    let expected = format.raw_len(width, height).unwrap_or_default();
    if frame.len() != expected {
        return Err(ClassifyError::ConversionFailed(format!(
            "{format} frame of {width}x{height} needs {expected} bytes, got {}",
            frame.len()
        )));
    }

    let data = frame.data();
    let pixels: Vec<u8> = match format {
        PixelFormat::Rgb888 => data.to_vec(),
        PixelFormat::Rgb565 => data
            .chunks_exact(2)
            .flat_map(|px| rgb565_to_rgb888(u16::from_be_bytes([px[0], px[1]])).0)
            .collect(),
        PixelFormat::Grayscale => data.iter().flat_map(|&y| [y, y, y]).collect(),
        PixelFormat::Jpeg => unreachable!("handled above"),
    };

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| ClassifyError::ConversionFailed("pixel buffer size mismatch".into()))
}

fn rgb565_to_rgb888(v: u16) -> Rgb<u8> {
    let r = ((v >> 11) & 0x1F) as u8;
    let g = ((v >> 5) & 0x3F) as u8;
    let b = (v & 0x1F) as u8;
    Rgb([(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)])
}

/// Deterministic stand-in for the exported waste model.
///
/// Each label gets a signature colour spread evenly around the hue wheel.
/// A frame scores by the softmax of the negative distance between its mean
/// colour and each signature.
pub struct ColorSignatureModel {
    labels: Vec<String>,
    signatures: Vec<[f32; 3]>,
    input: (u32, u32),
    temperature: f32,
}

impl ColorSignatureModel {
    pub fn new(labels: Vec<String>, input_width: u32, input_height: u32) -> Self {
        let n = labels.len().max(1);
        let signatures = (0..labels.len())
            .map(|i| hue_to_rgb(i as f32 / n as f32))
            .collect();
        Self {
            labels,
            signatures,
            input: (input_width, input_height),
            temperature: 0.1,
        }
    }
}

fn hue_to_rgb(hue: f32) -> [f32; 3] {
    let h = (hue.fract() * 6.0).max(0.0);
    let x = 1.0 - ((h % 2.0) - 1.0).abs();
    match h as u32 {
        0 => [1.0, x, 0.0],
        1 => [x, 1.0, 0.0],
        2 => [0.0, 1.0, x],
        3 => [0.0, x, 1.0],
        4 => [x, 0.0, 1.0],
        _ => [1.0, 0.0, x],
    }
}

impl Classifier for ColorSignatureModel {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn input_size(&self) -> (u32, u32) {
        self.input
    }

    fn invoke(&self, input: &[f32]) -> Result<Vec<f32>, i32> {
        let (w, h) = self.input;
        if input.len() != (w * h * 3) as usize || input.is_empty() {
            return Err(MODEL_INPUT_MISMATCH);
        }

        let pixels = (input.len() / 3) as f32;
        let mut mean = [0f32; 3];
        for px in input.chunks_exact(3) {
            for (m, v) in mean.iter_mut().zip(px) {
                *m += v;
            }
        }
        for m in &mut mean {
            *m /= pixels;
        }

        let logits: Vec<f32> = self
            .signatures
            .iter()
            .map(|sig| {
                let dist = sig
                    .iter()
                    .zip(&mean)
                    .map(|(s, m)| (s - m) * (s - m))
                    .sum::<f32>()
                    .sqrt();
                -dist / self.temperature
            })
            .collect();

        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        Ok(exps.into_iter().map(|e| e / sum).collect())
    }

    fn name(&self) -> &str {
        "color-signature"
    }
}
