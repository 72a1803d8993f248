// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/draw.rs - 推理结果可视化
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

use ab_glyph::{FontArc, PxScale};
use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::debug;

use crate::model::{DetectBox, DetectResult, Family, Prediction, labels::label_name};
use crate::output::{OutputError, colormap::blend_overlay};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_PADDING: i32 = 4;
const LABEL_TEXT_COLOR: [u8; 3] = [0, 0, 0];

const DETECTION_THICKNESS: i32 = 3;
const PANOPTIC_THICKNESS: i32 = 2;
const PANOPTIC_COLOR: [u8; 3] = [255, 0, 0];
const CLASS_COLOR_COUNT: usize = 80;

/// 可视化产物：叠加图，以及全景驾驶结果的两张掩码
#[derive(Debug, Clone)]
pub struct Visual {
  pub overlay: RgbImage,
  pub masks: Option<(GrayImage, GrayImage)>,
}

#[derive(Clone)]
pub struct Draw {
  font: Option<FontArc>,
  font_scale: PxScale,
  class_colors: Vec<Rgb<u8>>,
}

impl Default for Draw {
  fn default() -> Self {
    Self::new(None)
  }
}

impl std::fmt::Debug for Draw {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Draw")
      .field("labels", &self.font.is_some())
      .finish()
  }
}

impl Draw {
  /// 没有字体时只绘制边框，不绘制标签
  pub fn new(font: Option<FontArc>) -> Self {
    // 每个 COCO 类别一种颜色
    let class_colors = (0..CLASS_COLOR_COUNT)
      .map(|i| {
        let hue = (i as f32 / CLASS_COLOR_COUNT as f32) * 360.0;
        hsv_to_rgb(hue, 0.8, 0.9)
      })
      .collect();

    Self {
      font,
      font_scale: PxScale::from(LABEL_FONT_SIZE),
      class_colors,
    }
  }

  pub fn with_font_file(path: &Path) -> Result<Self, OutputError> {
    let data = std::fs::read(path).map_err(|source| OutputError::IoError {
      path: path.to_path_buf(),
      source,
    })?;
    let font = FontArc::try_from_vec(data)
      .map_err(|e| OutputError::FontError(format!("{}: {}", path.display(), e)))?;
    debug!("已加载标签字体: {}", path.display());
    Ok(Self::new(Some(font)))
  }

  pub fn class_color(&self, class_id: u32) -> Rgb<u8> {
    self.class_colors[class_id as usize % self.class_colors.len()]
  }

  /// 生成可视化产物，不修改源图像
  pub fn visualize(&self, source: &RgbImage, prediction: &Prediction) -> Visual {
    match prediction {
      Prediction::Segmentation(labels) => Visual {
        overlay: blend_overlay(source, labels),
        masks: None,
      },
      Prediction::Detection(result) => {
        let mut overlay = source.clone();
        self.draw_detections(&mut overlay, result);
        Visual {
          overlay,
          masks: None,
        }
      }
      Prediction::PanopticDriving(result) => {
        let mut overlay = source.clone();
        for item in result.boxes.items.iter() {
          draw_box(&mut overlay, item, Rgb(PANOPTIC_COLOR), PANOPTIC_THICKNESS);
        }
        Visual {
          overlay,
          masks: Some((result.drive_mask.clone(), result.lane_mask.clone())),
        }
      }
    }
  }

  /// 按结果中的顺序绘制检测框，后绘制的覆盖先绘制的
  pub fn draw_detections(&self, image: &mut RgbImage, result: &DetectResult) {
    for item in result.items.iter() {
      let color = self.class_color(item.class_id);
      draw_box(image, item, color, DETECTION_THICKNESS);
      if let Some(font) = &self.font {
        self.draw_label(image, item, color, font);
      }
    }
  }

  fn draw_label(&self, image: &mut RgbImage, item: &DetectBox, color: Rgb<u8>, font: &FontArc) {
    let caption = format!(
      "{} {:.2}",
      label_name(Family::Detection, item.class_id),
      item.confidence
    );
    let (text_w, text_h) = text_size(self.font_scale, font, &caption);

    // 标签背景放在边框上方，贴不下时放进框内
    let left = item.left.round() as i32;
    let top = item.top.round() as i32;
    let bg_h = text_h as i32 + 2 * LABEL_PADDING;
    let bg_y = if top - bg_h >= 0 { top - bg_h } else { top };
    let bg_w = (text_w as i32 + 2 * LABEL_PADDING).min(image.width() as i32 - left);
    if bg_w <= 0 || bg_h <= 0 {
      return;
    }

    let rect = Rect::at(left, bg_y).of_size(bg_w as u32, bg_h as u32);
    draw_filled_rect_mut(image, rect, color);
    draw_text_mut(
      image,
      Rgb(LABEL_TEXT_COLOR),
      left + LABEL_PADDING,
      bg_y + LABEL_PADDING,
      self.font_scale,
      font,
      &caption,
    );
  }
}

/// 绘制边框，线宽向框内增长，外沿恰好落在 (left, top)-(right, bottom)
pub fn draw_box(image: &mut RgbImage, item: &DetectBox, color: Rgb<u8>, thickness: i32) {
  let (w, h) = (image.width() as i32, image.height() as i32);
  if w == 0 || h == 0 {
    return;
  }

  let x_min = (item.left.round() as i32).clamp(0, w - 1);
  let y_min = (item.top.round() as i32).clamp(0, h - 1);
  let x_max = (item.right.round() as i32).clamp(0, w - 1);
  let y_max = (item.bottom.round() as i32).clamp(0, h - 1);

  if x_min > x_max || y_min > y_max {
    return;
  }

  for t in 0..thickness {
    let rect_w = x_max - x_min + 1 - 2 * t;
    let rect_h = y_max - y_min + 1 - 2 * t;
    if rect_w <= 0 || rect_h <= 0 {
      break;
    }
    let rect = Rect::at(x_min + t, y_min + t).of_size(rect_w as u32, rect_h as u32);
    draw_hollow_rect_mut(image, rect, color);
  }
}

/// HSV 转 RGB
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = match h {
    h if h < 60.0 => (c, x, 0.0),
    h if h < 120.0 => (x, c, 0.0),
    h if h < 180.0 => (0.0, c, x),
    h if h < 240.0 => (0.0, x, c),
    h if h < 300.0 => (x, 0.0, c),
    _ => (c, 0.0, x),
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}
