use ab_glyph::{FontRef, PxScale};
use crate::detect::{DetectError, Detection, Detector};
use candle_core::{DType, Device, Tensor};
use candle_onnx::{onnx, read_file, simple_eval};
use hf_hub::api::sync::Api;
use image::{imageops::FilterType, DynamicImage, Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

const INPUT_SIZE: u32 = 640;
const BOX_FIELDS: usize = 4;
const LABEL_FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_PADDING: i32 = 2;

pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

const PALETTE: [[u8; 3]; 6] = [
    [255, 56, 56],
    [56, 255, 56],
    [56, 56, 255],
    [255, 178, 29],
    [207, 56, 255],
    [29, 222, 255],
];

/// One decoded box, in frame pixel coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct BoxDetection {
    pub class_id: usize,
    pub score: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoxDetection {
    pub fn class_name(&self) -> &'static str {
        COCO_CLASSES.get(self.class_id).copied().unwrap_or("unknown")
    }

    fn iou(&self, other: &BoxDetection) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.width * self.height + other.width * other.height - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// YOLOv8 ONNX detector evaluated on the CPU with candle.
pub struct YoloDetector {
    model: onnx::ModelProto,
    input_name: String,
    output_name: String,
    device: Device,
    confidence: f32,
    iou: f32,
    font: FontRef<'static>,
}

impl YoloDetector {
    /// Loads `model` from disk, or fetches it from the Hugging Face `repo`
    /// when no such file exists locally.
    pub fn load(model: &str, repo: &str, confidence: f32, iou: f32) -> Result<Self, DetectError> {
        let path = resolve_model(model, repo)?;
        info!(path = %path.display(), "loading detection model");
        let mut proto = read_file(&path).map_err(|e| DetectError::Model(e.to_string()))?;
        pad_maxpool_inputs(&mut proto);
        bypass_resize(&mut proto);
        let graph = proto
            .graph
            .as_ref()
            .ok_or_else(|| DetectError::Model("model graph missing".to_string()))?;
        let input_name = graph
            .input
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| DetectError::Model("model has no inputs".to_string()))?;
        let output_name = graph
            .output
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| DetectError::Model("model has no outputs".to_string()))?;
        debug!(input = %input_name, output = %output_name, "model graph ready");
        Ok(Self {
            model: proto,
            input_name,
            output_name,
            device: Device::Cpu,
            confidence,
            iou,
            font: label_font()?,
        })
    }

    fn prepare(&self, frame: &RgbImage) -> Result<Tensor, DetectError> {
        let resized = DynamicImage::ImageRgb8(frame.clone()).resize_exact(
            INPUT_SIZE,
            INPUT_SIZE,
            FilterType::CatmullRom,
        );
        let data = resized.into_rgb8().into_raw();
        let size = INPUT_SIZE as usize;
        let tensor = Tensor::from_vec(data, (size, size, 3), &self.device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(1.0 / 255.0, 0.0)?
            .unsqueeze(0)?;
        Ok(tensor)
    }
}

impl Detector for YoloDetector {
    fn detect(&self, frame: &RgbImage) -> Result<Detection, DetectError> {
        let input = self.prepare(frame)?;
        let mut inputs = HashMap::new();
        inputs.insert(self.input_name.clone(), input);
        let mut outputs = simple_eval(&self.model, inputs)?;
        let output = outputs
            .remove(&self.output_name)
            .ok_or_else(|| DetectError::Inference("model output missing".to_string()))?;
        let boxes = decode_output(
            &output,
            frame.width(),
            frame.height(),
            self.confidence,
            self.iou,
        )?;
        trace!(boxes = boxes.len(), "frame decoded");
        let mut annotated = frame.clone();
        annotate(&mut annotated, &boxes, &self.font);
        let labels = boxes.iter().map(|b| b.class_name().to_string()).collect();
        Ok(Detection { annotated, labels })
    }
}

fn resolve_model(model: &str, repo: &str) -> Result<PathBuf, DetectError> {
    if Path::new(model).exists() {
        return Ok(PathBuf::from(model));
    }
    info!(model, repo, "model not found locally, downloading");
    Api::new()
        .and_then(|api| api.model(repo.to_string()).get(model))
        .map_err(|e| DetectError::Download(e.to_string()))
}

/// Decodes a `[1, 4 + classes, anchors]` YOLOv8 output into boxes scaled to
/// a `frame_w`×`frame_h` frame, after per-class non-maximum suppression.
pub fn decode_output(
    output: &Tensor,
    frame_w: u32,
    frame_h: u32,
    confidence: f32,
    iou: f32,
) -> Result<Vec<BoxDetection>, DetectError> {
    let dims = output.dims();
    if dims.len() != 3 || dims[1] <= BOX_FIELDS {
        return Err(DetectError::Inference(format!(
            "unexpected output shape {dims:?}"
        )));
    }
    let rows = output.squeeze(0)?.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let anchors = dims[2];
    let scale_x = frame_w as f32 / INPUT_SIZE as f32;
    let scale_y = frame_h as f32 / INPUT_SIZE as f32;

    let mut boxes = Vec::new();
    for i in 0..anchors {
        let best = rows[BOX_FIELDS..]
            .iter()
            .enumerate()
            .map(|(class_id, row)| (class_id, row[i]))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        let Some((class_id, score)) = best else {
            continue;
        };
        if score < confidence {
            continue;
        }
        let (cx, cy, w, h) = (rows[0][i], rows[1][i], rows[2][i], rows[3][i]);
        boxes.push(BoxDetection {
            class_id,
            score,
            x: (cx - w / 2.0) * scale_x,
            y: (cy - h / 2.0) * scale_y,
            width: w * scale_x,
            height: h * scale_y,
        });
    }
    Ok(non_max_suppression(boxes, iou))
}

fn non_max_suppression(mut boxes: Vec<BoxDetection>, iou: f32) -> Vec<BoxDetection> {
    boxes.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    let mut kept: Vec<BoxDetection> = Vec::new();
    for candidate in boxes {
        let overlaps = kept
            .iter()
            .any(|k| k.class_id == candidate.class_id && k.iou(&candidate) >= iou);
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

/// Font used for box labels.
pub fn label_font() -> Result<FontRef<'static>, DetectError> {
    FontRef::try_from_slice(LABEL_FONT)
        .map_err(|e| DetectError::Model(format!("label font: {e}")))
}

/// Draws a two pixel outline per box, coloured by class, with the class
/// name and score on a filled tag above it.
pub fn annotate(image: &mut RgbImage, boxes: &[BoxDetection], font: &FontRef) {
    if image.width() == 0 || image.height() == 0 {
        return;
    }
    let (img_w, img_h) = (image.width() as f32, image.height() as f32);
    for b in boxes {
        let x0 = b.x.clamp(0.0, img_w - 1.0);
        let y0 = b.y.clamp(0.0, img_h - 1.0);
        let x1 = (b.x + b.width).clamp(0.0, img_w - 1.0);
        let y1 = (b.y + b.height).clamp(0.0, img_h - 1.0);
        let (w, h) = ((x1 - x0) as u32, (y1 - y0) as u32);
        if w < 3 || h < 3 {
            continue;
        }
        let color = Rgb(PALETTE[b.class_id % PALETTE.len()]);
        draw_hollow_rect_mut(image, Rect::at(x0 as i32, y0 as i32).of_size(w, h), color);
        draw_hollow_rect_mut(
            image,
            Rect::at(x0 as i32 + 1, y0 as i32 + 1).of_size(w - 2, h - 2),
            color,
        );
        draw_label(image, (x0 as i32, y0 as i32), b, color, font);
    }
}

fn draw_label(
    image: &mut RgbImage,
    corner: (i32, i32),
    b: &BoxDetection,
    color: Rgb<u8>,
    font: &FontRef,
) {
    let label = format!("{} {:.2}", b.class_name(), b.score);
    let scale = PxScale::from(LABEL_FONT_SIZE);
    let (text_w, text_h) = text_size(scale, font, &label);
    let tag_h = text_h as i32 + 2 * LABEL_PADDING;
    let tag_x = corner.0;
    let tag_y = (corner.1 - tag_h).max(0);
    let tag_w = (text_w as i32 + 2 * LABEL_PADDING).min(image.width() as i32 - tag_x);
    if tag_w <= 0 {
        return;
    }
    draw_filled_rect_mut(
        image,
        Rect::at(tag_x, tag_y).of_size(tag_w as u32, tag_h as u32),
        color,
    );
    draw_text_mut(
        image,
        Rgb([255, 255, 255]),
        tag_x + LABEL_PADDING,
        tag_y + LABEL_PADDING,
        scale,
        font,
        &label,
    );
}

// candle-onnx does not support padded MaxPool; move the padding into an
// explicit Pad node in front of it.
fn pad_maxpool_inputs(model: &mut onnx::ModelProto) {
    let Some(graph) = model.graph.as_mut() else {
        return;
    };
    let mut nodes = Vec::with_capacity(graph.node.len());
    for mut node in std::mem::take(&mut graph.node) {
        let pads = if node.op_type == "MaxPool" {
            node.attribute
                .iter_mut()
                .find(|attr| {
                    attr.name == "pads" && attr.ints.len() == 4 && attr.ints.iter().any(|&v| v != 0)
                })
                .map(|attr| std::mem::replace(&mut attr.ints, vec![0; 4]))
        } else {
            None
        };
        if let Some(pads) = pads {
            let pads_name = format!("{}_pads", node.name);
            let padded = format!("{}_padded", node.name);
            let full = vec![0, 0, pads[0], pads[1], 0, 0, pads[2], pads[3]];
            graph.initializer.push(onnx::TensorProto {
                name: pads_name.clone(),
                dims: vec![full.len() as i64],
                data_type: onnx::tensor_proto::DataType::Int64 as i32,
                int64_data: full,
                ..Default::default()
            });
            nodes.push(onnx::NodeProto {
                input: vec![node.input[0].clone(), pads_name],
                output: vec![padded.clone()],
                name: format!("{}_pad", node.name),
                op_type: "Pad".to_string(),
                attribute: vec![onnx::AttributeProto {
                    name: "mode".to_string(),
                    r#type: onnx::attribute_proto::AttributeType::String as i32,
                    s: b"reflect".to_vec(),
                    ..Default::default()
                }],
                ..Default::default()
            });
            node.input[0] = padded;
        }
        nodes.push(node);
    }
    graph.node = nodes;
}

// The exported upsampling nodes are evaluated as identity by candle-onnx.
fn bypass_resize(model: &mut onnx::ModelProto) {
    let Some(graph) = model.graph.as_mut() else {
        return;
    };
    for node in graph.node.iter_mut().filter(|n| n.op_type == "Resize") {
        if let Some(first) = node.input.first().cloned() {
            node.op_type = "Identity".to_string();
            node.input = vec![first];
        }
    }
}
