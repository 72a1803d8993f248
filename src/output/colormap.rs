// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/colormap.rs - 分割结果调色板与叠加
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

use image::{Rgb, RgbImage};

use crate::model::LabelMap;

/// 叠加时颜色图的权重，源图像权重为 `1 - OVERLAY_ALPHA`
pub const OVERLAY_ALPHA: f32 = 0.7;

const CITYSCAPES: [[u8; 3]; 19] = [
  [128, 64, 128],  // road
  [244, 35, 232],  // sidewalk
  [70, 70, 70],    // building
  [102, 102, 156], // wall
  [190, 153, 153], // fence
  [153, 153, 153], // pole
  [250, 170, 30],  // traffic light
  [220, 220, 0],   // traffic sign
  [107, 142, 35],  // vegetation
  [152, 251, 152], // terrain
  [70, 130, 180],  // sky
  [220, 20, 60],   // person
  [255, 0, 0],     // rider
  [0, 0, 142],     // car
  [0, 0, 70],      // truck
  [0, 60, 100],    // bus
  [0, 80, 100],    // train
  [0, 0, 230],     // motorcycle
  [119, 11, 32],   // bicycle
];

// 前 19 类使用 Cityscapes 配色，其余按 PASCAL VOC 的位交织规则生成
const fn build_color_map() -> [[u8; 3]; 256] {
  let mut map = [[0u8; 3]; 256];
  let mut i = 0;
  while i < 256 {
    let mut id = i;
    let mut rgb = [0u8; 3];
    let mut bit = 0;
    while bit < 8 {
      rgb[0] |= ((id & 1) << (7 - bit)) as u8;
      rgb[1] |= (((id >> 1) & 1) << (7 - bit)) as u8;
      rgb[2] |= (((id >> 2) & 1) << (7 - bit)) as u8;
      id >>= 3;
      bit += 1;
    }
    map[i] = rgb;
    i += 1;
  }

  let mut k = 0;
  while k < CITYSCAPES.len() {
    map[k] = CITYSCAPES[k];
    k += 1;
  }
  map
}

/// 类别号到 RGB 颜色的全局查找表
pub static COLOR_MAP: [[u8; 3]; 256] = build_color_map();

pub fn class_color(class_id: u8) -> [u8; 3] {
  COLOR_MAP[class_id as usize]
}

fn blend_channel(source: u8, color: u8) -> u8 {
  ((1.0 - OVERLAY_ALPHA) * source as f32 + OVERLAY_ALPHA * color as f32)
    .round()
    .clamp(0.0, 255.0) as u8
}

/// 把标签图上色后与源图混合，输出与源图同尺寸
pub fn blend_overlay(source: &RgbImage, labels: &LabelMap) -> RgbImage {
  let (width, height) = source.dimensions();
  let labels = labels.resize_nearest(width, height);

  RgbImage::from_fn(width, height, |x, y| {
    let src = source.get_pixel(x, y);
    let color = class_color(labels.get(x, y));
    Rgb([
      blend_channel(src[0], color[0]),
      blend_channel(src[1], color[1]),
      blend_channel(src[2], color[2]),
    ])
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn table_starts_with_cityscapes_palette() {
    assert_eq!(class_color(0), [128, 64, 128]);
    assert_eq!(class_color(13), [0, 0, 142]);
    assert_eq!(class_color(18), [119, 11, 32]);
  }

  #[test]
  fn table_tail_follows_voc_palette() {
    assert_eq!(COLOR_MAP[19], [128, 192, 0]);
    assert_eq!(COLOR_MAP[20], [0, 64, 128]);
    assert_eq!(COLOR_MAP[255], [224, 224, 192]);
  }

  #[test]
  fn uniform_label_map_blends_componentwise() {
    let source = RgbImage::from_fn(6, 4, |x, y| Rgb([(x * 40) as u8, (y * 60) as u8, 200]));
    let labels = LabelMap::filled(6, 4, 2);
    let overlay = blend_overlay(&source, &labels);

    assert_eq!(overlay.dimensions(), source.dimensions());
    let color = class_color(2);
    for (x, y, px) in overlay.enumerate_pixels() {
      let src = source.get_pixel(x, y);
      for c in 0..3 {
        let expected = (0.3 * src[c] as f32 + 0.7 * color[c] as f32).round() as i32;
        assert!((px[c] as i32 - expected).abs() <= 1);
      }
    }
  }

  #[test]
  fn smaller_label_map_is_scaled_to_source() {
    let source = RgbImage::from_pixel(8, 8, Rgb([0, 0, 0]));
    let labels = LabelMap::new(2, 1, vec![0, 13]).unwrap();
    let overlay = blend_overlay(&source, &labels);
    assert_eq!(overlay.dimensions(), (8, 8));
    assert_eq!(overlay.get_pixel(0, 7), &Rgb([90, 45, 90]));
    assert_eq!(overlay.get_pixel(7, 0), &Rgb([0, 0, 99]));
  }
}
