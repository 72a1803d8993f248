// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/rknn.rs - 基于 RKNN 运行时的预测器
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::Path;

use image::{GrayImage, Luma, RgbImage, imageops::FilterType};
use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use tracing::{debug, error, info};

use crate::model::{
  DetectBox, DetectResult, DetectVariant, EngineSpec, LabelMap, Model, ModelError, PanopticResult,
  Prediction, Predictor, PredictorFactory, Thresholds, Variant, nms,
};

// RK3588 有三个 NPU 核心
const NPU_CORE_COUNT: i64 = 3;

const YOLO_INPUT_W: u32 = 640;
const YOLO_INPUT_H: u32 = 640;
const YOLO_CLASS_NUM: usize = 80;

const YOLOP_INPUT_W: u32 = 640;
const YOLOP_INPUT_H: u32 = 640;
const YOLOP_NUM_OUTPUTS: u32 = 3;
const YOLOP_MASK_ON: u8 = 255;

const PPSEG_INPUT_W: u32 = 1024;
const PPSEG_INPUT_H: u32 = 512;

/// 一个已加载到 NPU 上的引擎
struct RknnEngine {
  context: Context,
  num_outputs: u32,
}

impl RknnEngine {
  fn load(path: &Path) -> Result<Self, ModelError> {
    info!("加载模型文件: {}", path.display());
    let model_data = std::fs::read(path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&model_data, InitFlags::default())?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!("查询 SDK 版本失败: {}", e);
        return Err(e.into());
      }
    }

    let num_inputs = context.num_inputs()?;
    let num_outputs = context.num_outputs()?;
    debug!("模型输入数量: {}", num_inputs);
    debug!("模型输出数量: {}", num_outputs);

    if num_inputs != 1 {
      return Err(ModelError::InvalidOutput(format!(
        "预期模型输入数量为 1, 实际为 {}",
        num_inputs
      )));
    }

    Ok(Self {
      context,
      num_outputs,
    })
  }

  fn expect_outputs(&self, at_least: u32) -> Result<(), ModelError> {
    if self.num_outputs < at_least {
      return Err(ModelError::InvalidOutput(format!(
        "预期模型输出数量至少为 {}, 实际为 {}",
        at_least, self.num_outputs
      )));
    }
    Ok(())
  }

  fn run(&self, input: &[u8]) -> Result<rknpu::Output, ModelError> {
    debug!("设置模型输入");
    self
      .context
      .set_input(0, input, TensorFormat::NHWC, TensorType::UInt8)?;

    debug!("执行模型推理");
    self.context.run()?;

    debug!("获取模型输出");
    Ok(self.context.get_outputs()?)
  }
}

/// 缩放到模型输入尺寸，返回 NHWC 排列的原始像素
fn preprocess(image: &RgbImage, width: u32, height: u32) -> Vec<u8> {
  image::imageops::resize(image, width, height, FilterType::Triangle).into_raw()
}

fn tensor(output: &rknpu::Output, index: usize) -> Result<&[f32], ModelError> {
  output.get_f32(index).map_err(|e| {
    error!("获取第 {} 个输出失败: {}", index, e);
    ModelError::from(e)
  })
}

/// 把模型输入坐标系下的中心框映射回源图像
struct BoxScaler {
  sx: f32,
  sy: f32,
  max_x: f32,
  max_y: f32,
}

impl BoxScaler {
  fn new(source: &RgbImage, input_w: u32, input_h: u32) -> Self {
    Self {
      sx: source.width() as f32 / input_w as f32,
      sy: source.height() as f32 / input_h as f32,
      max_x: source.width().saturating_sub(1) as f32,
      max_y: source.height().saturating_sub(1) as f32,
    }
  }

  fn to_box(&self, cx: f32, cy: f32, w: f32, h: f32, class_id: u32, confidence: f32) -> DetectBox {
    DetectBox {
      left: ((cx - w / 2.0) * self.sx).clamp(0.0, self.max_x),
      top: ((cy - h / 2.0) * self.sy).clamp(0.0, self.max_y),
      right: ((cx + w / 2.0) * self.sx).clamp(0.0, self.max_x),
      bottom: ((cy + h / 2.0) * self.sy).clamp(0.0, self.max_y),
      class_id,
      confidence,
    }
  }
}

fn argmax(scores: impl Iterator<Item = f32>) -> (usize, f32) {
  scores
    .enumerate()
    .fold((0, f32::MIN), |best, (i, s)| if s > best.1 { (i, s) } else { best })
}

/// `[N, 5 + C]`：cx, cy, w, h, objectness, 类别分数
fn decode_anchor_based(
  data: &[f32],
  num_classes: usize,
  thresholds: &Thresholds,
  scaler: &BoxScaler,
) -> Result<Vec<DetectBox>, ModelError> {
  let stride = 5 + num_classes;
  if data.len() % stride != 0 {
    return Err(ModelError::InvalidOutput(format!(
      "检测输出长度 {} 不是 {} 的整数倍",
      data.len(),
      stride
    )));
  }

  let mut boxes = Vec::new();
  for row in data.chunks_exact(stride) {
    let objectness = row[4];
    if objectness < thresholds.confidence {
      continue;
    }
    let (class_id, class_score) = argmax(row[5..].iter().copied());
    let confidence = objectness * class_score;
    if confidence < thresholds.confidence {
      continue;
    }
    boxes.push(scaler.to_box(row[0], row[1], row[2], row[3], class_id as u32, confidence));
  }
  Ok(boxes)
}

/// `[4 + C, N]`：按通道排列，无 objectness
fn decode_anchor_free(
  data: &[f32],
  num_classes: usize,
  thresholds: &Thresholds,
  scaler: &BoxScaler,
) -> Result<Vec<DetectBox>, ModelError> {
  let channels = 4 + num_classes;
  if data.len() % channels != 0 {
    return Err(ModelError::InvalidOutput(format!(
      "检测输出长度 {} 不是 {} 的整数倍",
      data.len(),
      channels
    )));
  }

  let anchors = data.len() / channels;
  let mut boxes = Vec::new();
  for i in 0..anchors {
    let (class_id, confidence) =
      argmax((0..num_classes).map(|c| data[(4 + c) * anchors + i]));
    if confidence < thresholds.confidence {
      continue;
    }
    boxes.push(scaler.to_box(
      data[i],
      data[anchors + i],
      data[2 * anchors + i],
      data[3 * anchors + i],
      class_id as u32,
      confidence,
    ));
  }
  Ok(boxes)
}

/// 分割头输出转成前景掩码，`[2, H, W]` 取 argmax，`[H, W]` 按 0.5 二值化
fn segment_mask(data: &[f32], width: u32, height: u32) -> Result<GrayImage, ModelError> {
  let plane = width as usize * height as usize;
  let foreground: Box<dyn Fn(usize) -> bool + '_> = if data.len() == 2 * plane {
    Box::new(move |i| data[plane + i] > data[i])
  } else if data.len() == plane {
    Box::new(move |i| data[i] > 0.5)
  } else {
    return Err(ModelError::InvalidOutput(format!(
      "分割输出长度 {} 与 {}x{} 不匹配",
      data.len(),
      width,
      height
    )));
  };

  Ok(GrayImage::from_fn(width, height, |x, y| {
    let i = y as usize * width as usize + x as usize;
    Luma([if foreground(i) { YOLOP_MASK_ON } else { 0 }])
  }))
}

pub struct YoloPredictor {
  engine: RknnEngine,
  variant: DetectVariant,
  thresholds: Thresholds,
}

impl Model for YoloPredictor {
  type Input = RgbImage;
  type Output = Prediction;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let data = preprocess(input, YOLO_INPUT_W, YOLO_INPUT_H);
    let output = self.engine.run(&data)?;
    let scaler = BoxScaler::new(input, YOLO_INPUT_W, YOLO_INPUT_H);
    let raw = tensor(&output, 0)?;

    let boxes = if self.variant.anchor_free() {
      decode_anchor_free(raw, YOLO_CLASS_NUM, &self.thresholds, &scaler)?
    } else {
      decode_anchor_based(raw, YOLO_CLASS_NUM, &self.thresholds, &scaler)?
    };
    let boxes = nms(boxes, self.thresholds.nms);
    debug!("检测到 {} 个物体", boxes.len());

    Ok(Prediction::Detection(boxes.into()))
  }
}

pub struct YoloPPredictor {
  engine: RknnEngine,
  thresholds: Thresholds,
}

impl Model for YoloPPredictor {
  type Input = RgbImage;
  type Output = Prediction;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let data = preprocess(input, YOLOP_INPUT_W, YOLOP_INPUT_H);
    let output = self.engine.run(&data)?;
    let scaler = BoxScaler::new(input, YOLOP_INPUT_W, YOLOP_INPUT_H);

    let boxes = decode_anchor_based(tensor(&output, 0)?, 1, &self.thresholds, &scaler)?;
    let boxes = nms(boxes, self.thresholds.nms);

    let (w, h) = input.dimensions();
    let drive = segment_mask(tensor(&output, 1)?, YOLOP_INPUT_W, YOLOP_INPUT_H)?;
    let lane = segment_mask(tensor(&output, 2)?, YOLOP_INPUT_W, YOLOP_INPUT_H)?;
    debug!("检测到 {} 辆车", boxes.len());

    Ok(Prediction::PanopticDriving(PanopticResult {
      boxes: DetectResult::from(boxes),
      drive_mask: image::imageops::resize(&drive, w, h, FilterType::Nearest),
      lane_mask: image::imageops::resize(&lane, w, h, FilterType::Nearest),
    }))
  }
}

pub struct PpSegPredictor {
  engine: RknnEngine,
}

impl Model for PpSegPredictor {
  type Input = RgbImage;
  type Output = Prediction;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let data = preprocess(input, PPSEG_INPUT_W, PPSEG_INPUT_H);
    let output = self.engine.run(&data)?;
    let raw = tensor(&output, 0)?;

    let plane = PPSEG_INPUT_W as usize * PPSEG_INPUT_H as usize;
    if raw.is_empty() || raw.len() % plane != 0 {
      return Err(ModelError::InvalidOutput(format!(
        "分割输出长度 {} 与 {}x{} 不匹配",
        raw.len(),
        PPSEG_INPUT_W,
        PPSEG_INPUT_H
      )));
    }
    let classes = raw.len() / plane;

    // 单通道输出已经是类别号
    let labels: Vec<u8> = if classes == 1 {
      raw.iter().map(|&v| v.clamp(0.0, 255.0) as u8).collect()
    } else {
      (0..plane)
        .map(|i| argmax((0..classes).map(|c| raw[c * plane + i])).0 as u8)
        .collect()
    };

    let map = LabelMap::new(PPSEG_INPUT_W, PPSEG_INPUT_H, labels)
      .ok_or_else(|| ModelError::InvalidOutput("标签图尺寸错误".to_string()))?;
    Ok(Prediction::Segmentation(
      map.resize_nearest(input.width(), input.height()),
    ))
  }
}

/// 设备号只做范围校验，不绑定到具体核心
fn device_exists(device_id: i64) -> bool {
  (0..NPU_CORE_COUNT).contains(&device_id)
}

/// 从引擎文件创建 RKNN 预测器
#[derive(Debug, Default)]
pub struct RknnFactory;

impl RknnFactory {
  fn build(&self, spec: &EngineSpec) -> Result<Predictor, ModelError> {
    let engine = RknnEngine::load(&spec.engine_path)?;
    let predictor: Predictor = match spec.variant {
      Variant::Detection(variant) => {
        engine.expect_outputs(1)?;
        Box::new(YoloPredictor {
          engine,
          variant,
          thresholds: spec.thresholds,
        })
      }
      Variant::PanopticDriving(_) => {
        engine.expect_outputs(YOLOP_NUM_OUTPUTS)?;
        Box::new(YoloPPredictor {
          engine,
          thresholds: spec.thresholds,
        })
      }
      Variant::Segmentation => {
        engine.expect_outputs(1)?;
        Box::new(PpSegPredictor { engine })
      }
    };
    Ok(predictor)
  }
}

impl PredictorFactory for RknnFactory {
  fn create(&self, spec: &EngineSpec) -> Option<Predictor> {
    if !device_exists(spec.device_id) {
      error!(
        "设备不可用: NPU 核心 {} 不存在 (共 {} 个)",
        spec.device_id, NPU_CORE_COUNT
      );
      return None;
    }
    // 上下文按默认标志创建，核心由运行时调度
    debug!("设备号 {} 有效", spec.device_id);

    match self.build(spec) {
      Ok(predictor) => {
        info!("{} 模型加载完成: {}", spec.variant, spec.engine_path.display());
        Some(predictor)
      }
      Err(e) => {
        error!("无法创建预测器 {}: {}", spec.engine_path.display(), e);
        None
      }
    }
  }
}
