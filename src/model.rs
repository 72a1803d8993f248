// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型族、推理结果与预测器网关
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

use std::fmt;
use std::path::PathBuf;

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};
use thiserror::Error;

pub mod labels;

#[cfg(feature = "rknpu")]
mod rknn;
#[cfg(feature = "rknpu")]
pub use self::rknn::RknnFactory;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

impl<M: Model + ?Sized> Model for Box<M> {
  type Input = M::Input;
  type Output = M::Output;
  type Error = M::Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    (**self).infer(input)
  }
}

impl<M: Model + ?Sized> Model for &M {
  type Input = M::Input;
  type Output = M::Output;
  type Error = M::Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    (**self).infer(input)
  }
}

/// 模型族，决定推理结果的形状
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
  Detection,
  PanopticDriving,
  Segmentation,
  Tracking,
}

impl Family {
  /// 根据任务名解析模型族
  pub fn from_task_name(name: &str) -> Option<Self> {
    match name {
      "yolo" | "detection" => Some(Family::Detection),
      "yolop" | "panoptic_driving" => Some(Family::PanopticDriving),
      "seg" | "ppseg" | "segmentation" => Some(Family::Segmentation),
      "track" | "tracking" => Some(Family::Tracking),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Family::Detection => "detection",
      Family::PanopticDriving => "panoptic_driving",
      Family::Segmentation => "segmentation",
      Family::Tracking => "tracking",
    }
  }

  /// 配置中承载型号标签的字段名
  pub fn variant_key(&self) -> Option<&'static str> {
    match self {
      Family::Detection | Family::Tracking => Some("yolo_type"),
      Family::PanopticDriving => Some("yolop_type"),
      Family::Segmentation => None,
    }
  }
}

impl fmt::Display for Family {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectVariant {
  V5,
  V7,
  V8,
  X,
  V11,
}

impl DetectVariant {
  pub fn parse(tag: &str) -> Option<Self> {
    let tag = tag.trim().to_ascii_lowercase();
    let tag = tag.strip_prefix("yolo").unwrap_or(tag.as_str());
    match tag {
      "v5" | "5" => Some(DetectVariant::V5),
      "v7" | "7" => Some(DetectVariant::V7),
      "v8" | "8" => Some(DetectVariant::V8),
      "x" => Some(DetectVariant::X),
      "v11" | "11" => Some(DetectVariant::V11),
      _ => None,
    }
  }

  /// v8 之后的检测头不再输出 objectness，张量布局为 `[4 + C, N]`
  pub fn anchor_free(&self) -> bool {
    matches!(self, DetectVariant::V8 | DetectVariant::V11)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PanopticVariant {
  V1,
  V2,
}

impl PanopticVariant {
  pub fn parse(tag: &str) -> Option<Self> {
    match tag.trim().to_ascii_lowercase().as_str() {
      "v1" | "yolop" => Some(PanopticVariant::V1),
      "v2" | "yolopv2" => Some(PanopticVariant::V2),
      _ => None,
    }
  }
}

/// 模型族内的具体型号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
  Detection(DetectVariant),
  PanopticDriving(PanopticVariant),
  Segmentation,
}

impl Variant {
  /// 按模型族解析型号标签；`None` 表示该族不认识这个标签
  pub fn resolve(family: Family, tag: Option<&str>) -> Option<Self> {
    match family {
      Family::Detection | Family::Tracking => {
        tag.and_then(DetectVariant::parse).map(Variant::Detection)
      }
      Family::PanopticDriving => match tag {
        None => Some(Variant::PanopticDriving(PanopticVariant::V1)),
        Some(tag) => PanopticVariant::parse(tag).map(Variant::PanopticDriving),
      },
      Family::Segmentation => Some(Variant::Segmentation),
    }
  }
}

impl fmt::Display for Variant {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Variant::Detection(v) => write!(f, "yolo-{:?}", v),
      Variant::PanopticDriving(v) => write!(f, "yolop-{:?}", v),
      Variant::Segmentation => f.write_str("ppseg"),
    }
  }
}

/// 检测框，坐标为源图像像素坐标
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectBox {
  pub left: f32,
  pub top: f32,
  pub right: f32,
  pub bottom: f32,
  pub class_id: u32,
  pub confidence: f32,
}

#[derive(Debug, Clone, Default)]
pub struct DetectResult {
  pub items: Box<[DetectBox]>,
}

impl DetectResult {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}

impl From<Vec<DetectBox>> for DetectResult {
  fn from(items: Vec<DetectBox>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

/// 语义分割标签图，每个像素一个类别号
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap(GrayImage);

impl LabelMap {
  /// 数据长度必须等于 `width * height`
  pub fn new(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
    GrayImage::from_raw(width, height, data).map(Self)
  }

  pub fn filled(width: u32, height: u32, class_id: u8) -> Self {
    Self(GrayImage::from_pixel(width, height, Luma([class_id])))
  }

  pub fn width(&self) -> u32 {
    self.0.width()
  }

  pub fn height(&self) -> u32 {
    self.0.height()
  }

  pub fn get(&self, x: u32, y: u32) -> u8 {
    self.0.get_pixel(x, y).0[0]
  }

  /// 最近邻缩放到指定尺寸
  pub fn resize_nearest(&self, width: u32, height: u32) -> Self {
    if (width, height) == self.0.dimensions() {
      return self.clone();
    }
    Self(imageops::resize(&self.0, width, height, FilterType::Nearest))
  }
}

impl From<GrayImage> for LabelMap {
  fn from(image: GrayImage) -> Self {
    Self(image)
  }
}

/// 全景驾驶感知结果：检测框、可行驶区域、车道线
#[derive(Debug, Clone)]
pub struct PanopticResult {
  pub boxes: DetectResult,
  pub drive_mask: GrayImage,
  pub lane_mask: GrayImage,
}

/// 预测器输出，按产生它的模型族打标签
#[derive(Debug, Clone)]
pub enum Prediction {
  Segmentation(LabelMap),
  Detection(DetectResult),
  PanopticDriving(PanopticResult),
}

impl Prediction {
  pub fn family(&self) -> Family {
    match self {
      Prediction::Segmentation(_) => Family::Segmentation,
      Prediction::Detection(_) => Family::Detection,
      Prediction::PanopticDriving(_) => Family::PanopticDriving,
    }
  }
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[cfg(feature = "rknpu")]
  #[error("RKNN 错误: {0}")]
  RknnError(rknpu::Error),
  #[error("模型输出无效: {0}")]
  InvalidOutput(String),
}

#[cfg(feature = "rknpu")]
impl From<rknpu::Error> for ModelError {
  fn from(err: rknpu::Error) -> Self {
    ModelError::RknnError(err)
  }
}

/// 后处理阈值，创建预测器时确定，之后的每次推理都使用它
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
  pub confidence: f32,
  pub nms: f32,
}

impl Thresholds {
  pub fn for_family(family: Family) -> Self {
    match family {
      Family::PanopticDriving => Thresholds {
        confidence: 0.4,
        nms: 0.5,
      },
      _ => Thresholds {
        confidence: 0.25,
        nms: 0.5,
      },
    }
  }
}

/// 创建预测器所需的全部参数
#[derive(Debug, Clone)]
pub struct EngineSpec {
  pub engine_path: PathBuf,
  pub family: Family,
  pub variant: Variant,
  pub device_id: i64,
  pub thresholds: Thresholds,
}

pub type Predictor = Box<dyn Model<Input = RgbImage, Output = Prediction, Error = ModelError>>;

/// 预测器网关：加载失败或设备不可用时返回 `None`
pub trait PredictorFactory {
  fn create(&self, spec: &EngineSpec) -> Option<Predictor>;
}

/// 未编译任何推理后端时使用
#[derive(Debug, Default)]
pub struct NullFactory;

impl PredictorFactory for NullFactory {
  fn create(&self, spec: &EngineSpec) -> Option<Predictor> {
    tracing::error!(
      "未编译推理后端，无法加载引擎: {}",
      spec.engine_path.display()
    );
    None
  }
}

/// 默认的预测器网关
pub fn default_factory() -> Box<dyn PredictorFactory> {
  #[cfg(feature = "rknpu")]
  {
    Box::new(RknnFactory::default())
  }
  #[cfg(not(feature = "rknpu"))]
  {
    Box::new(NullFactory)
  }
}

/// 类别无关的 IoU
pub fn iou(a: &DetectBox, b: &DetectBox) -> f32 {
  let x1 = a.left.max(b.left);
  let y1 = a.top.max(b.top);
  let x2 = a.right.min(b.right);
  let y2 = a.bottom.min(b.bottom);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a.right - a.left).max(0.0) * (a.bottom - a.top).max(0.0);
  let area_b = (b.right - b.left).max(0.0) * (b.bottom - b.top).max(0.0);
  let union = area_a + area_b - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

/// 按类别做非极大值抑制，结果按置信度降序
pub fn nms(mut boxes: Vec<DetectBox>, threshold: f32) -> Vec<DetectBox> {
  boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

  let mut keep: Vec<DetectBox> = Vec::with_capacity(boxes.len());
  for candidate in boxes {
    let suppressed = keep
      .iter()
      .any(|kept| kept.class_id == candidate.class_id && iou(kept, &candidate) > threshold);
    if !suppressed {
      keep.push(candidate);
    }
  }
  keep
}

#[cfg(test)]
mod tests {
  use super::*;

  fn boxed(left: f32, top: f32, right: f32, bottom: f32, class_id: u32, confidence: f32) -> DetectBox {
    DetectBox {
      left,
      top,
      right,
      bottom,
      class_id,
      confidence,
    }
  }

  #[test]
  fn task_names_resolve_to_families() {
    assert_eq!(Family::from_task_name("yolo"), Some(Family::Detection));
    assert_eq!(Family::from_task_name("yolop"), Some(Family::PanopticDriving));
    assert_eq!(Family::from_task_name("seg"), Some(Family::Segmentation));
    assert_eq!(Family::from_task_name("tracking"), Some(Family::Tracking));
    assert_eq!(Family::from_task_name("YOLO"), None);
    assert_eq!(Family::from_task_name("classify"), None);
  }

  #[test]
  fn detect_variants_accept_common_spellings() {
    assert_eq!(DetectVariant::parse("v5"), Some(DetectVariant::V5));
    assert_eq!(DetectVariant::parse("YOLOv8"), Some(DetectVariant::V8));
    assert_eq!(DetectVariant::parse("x"), Some(DetectVariant::X));
    assert_eq!(DetectVariant::parse("v6"), None);
    assert!(DetectVariant::V11.anchor_free());
    assert!(!DetectVariant::V7.anchor_free());
  }

  #[test]
  fn variant_resolution_per_family() {
    assert_eq!(
      Variant::resolve(Family::Detection, Some("v7")),
      Some(Variant::Detection(DetectVariant::V7))
    );
    assert_eq!(Variant::resolve(Family::Detection, Some("v99")), None);
    assert_eq!(
      Variant::resolve(Family::PanopticDriving, None),
      Some(Variant::PanopticDriving(PanopticVariant::V1))
    );
    assert_eq!(Variant::resolve(Family::PanopticDriving, Some("v3")), None);
    assert_eq!(
      Variant::resolve(Family::Segmentation, Some("anything")),
      Some(Variant::Segmentation)
    );
  }

  #[test]
  fn label_map_rejects_wrong_length() {
    assert!(LabelMap::new(2, 2, vec![0; 3]).is_none());
    assert!(LabelMap::new(2, 2, vec![0; 4]).is_some());
  }

  #[test]
  fn label_map_nearest_resize() {
    let map = LabelMap::new(2, 1, vec![1, 2]).unwrap();
    let resized = map.resize_nearest(4, 2);
    assert_eq!(resized.width(), 4);
    assert_eq!(resized.height(), 2);
    assert_eq!(resized.get(0, 0), 1);
    assert_eq!(resized.get(0, 1), 1);
    assert_eq!(resized.get(3, 0), 2);
    assert_eq!(resized.get(3, 1), 2);
    assert_eq!(map.resize_nearest(2, 1), map);
  }

  #[test]
  fn label_map_wraps_gray_image() {
    let map = LabelMap::from(GrayImage::from_fn(3, 2, |x, y| Luma([(x + 3 * y) as u8])));
    assert_eq!((map.width(), map.height()), (3, 2));
    assert_eq!(map.get(2, 1), 5);
    assert_eq!(LabelMap::new(3, 2, (0..6).collect()), Some(map));
  }

  #[test]
  fn nms_suppresses_overlapping_boxes_of_same_class() {
    let boxes = vec![
      boxed(0.0, 0.0, 10.0, 10.0, 0, 0.6),
      boxed(1.0, 1.0, 10.0, 10.0, 0, 0.9),
      boxed(1.0, 1.0, 10.0, 10.0, 1, 0.5),
      boxed(50.0, 50.0, 60.0, 60.0, 0, 0.3),
    ];
    let kept = nms(boxes, 0.5);
    assert_eq!(kept.len(), 3);
    assert_eq!(kept[0].confidence, 0.9);
    assert_eq!(kept[1].class_id, 1);
    assert_eq!(kept[2].left, 50.0);
  }

  #[test]
  fn iou_of_disjoint_boxes_is_zero() {
    let a = boxed(0.0, 0.0, 1.0, 1.0, 0, 1.0);
    let b = boxed(2.0, 2.0, 3.0, 3.0, 0, 1.0);
    assert_eq!(iou(&a, &b), 0.0);
    assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
  }
}
