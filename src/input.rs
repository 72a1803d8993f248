// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input.rs - 图像集合输入
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

use std::path::{Path, PathBuf};

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::utils::file_base_name;

/// 参与枚举的图像扩展名（不区分大小写）
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

#[derive(Error, Debug)]
pub enum InputError {
  #[error("无法打开图片文件 {path}: {source}")]
  Open {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("无法解码图片文件 {path}: {source}")]
  Decode {
    path: PathBuf,
    source: image::ImageError,
  },
}

/// 一张已解码的输入图像及其来源路径
#[derive(Debug, Clone)]
pub struct ImageFrame {
  pub path: PathBuf,
  pub image: RgbImage,
}

impl ImageFrame {
  /// 不含目录和扩展名的文件名，用于派生输出路径
  pub fn base_name(&self) -> String {
    let path = self.path.to_string_lossy();
    file_base_name(&path, false).to_string()
  }
}

impl AsRef<RgbImage> for ImageFrame {
  fn as_ref(&self) -> &RgbImage {
    &self.image
  }
}

/// 读取并解码单张图片
pub fn load_image(path: &Path) -> Result<ImageFrame, InputError> {
  let image = ImageReader::open(path)
    .map_err(|source| InputError::Open {
      path: path.to_path_buf(),
      source,
    })?
    .decode()
    .map_err(|source| InputError::Decode {
      path: path.to_path_buf(),
      source,
    })?
    .to_rgb8();

  Ok(ImageFrame {
    path: path.to_path_buf(),
    image,
  })
}

fn has_image_extension(path: &Path) -> bool {
  path
    .extension()
    .map(|ext| {
      let ext = ext.to_string_lossy().to_lowercase();
      IMAGE_EXTENSIONS.contains(&ext.as_str())
    })
    .unwrap_or(false)
}

/// 递归枚举目录下的图像文件，按路径排序
pub fn list_image_files(dir: &Path) -> Vec<PathBuf> {
  let mut files: Vec<PathBuf> = WalkDir::new(dir)
    .into_iter()
    .filter_map(|entry| match entry {
      Ok(entry) => Some(entry),
      Err(e) => {
        warn!("无法读取目录项: {}", e);
        None
      }
    })
    .filter(|entry| entry.file_type().is_file())
    .map(|entry| entry.into_path())
    .filter(|path| has_image_extension(path))
    .collect();
  files.sort();
  files
}

/// 非空的图像集合
#[derive(Debug, Clone)]
pub struct ImageSet {
  frames: Vec<ImageFrame>,
}

impl ImageSet {
  /// 枚举并解码目录中的图像
  ///
  /// 解码失败的文件被跳过；没有任何可用图像时返回 `None`，
  /// 调用方应把它当作正常的“无输入”情形处理。
  pub fn load_dir(dir: &Path) -> Option<Self> {
    let files = list_image_files(dir);
    if files.is_empty() {
      warn!("输入目录中没有图像文件: {}", dir.display());
      return None;
    }
    debug!("找到 {} 个图像文件", files.len());

    let frames: Vec<ImageFrame> = files
      .iter()
      .filter_map(|path| match load_image(path) {
        Ok(frame) => Some(frame),
        Err(e) => {
          warn!("{}", e);
          None
        }
      })
      .collect();

    if frames.is_empty() {
      warn!("目录中没有可解码的图像: {}", dir.display());
      return None;
    }

    info!("已加载 {} 张图像: {}", frames.len(), dir.display());
    Some(Self { frames })
  }

  pub fn from_frames(frames: Vec<ImageFrame>) -> Option<Self> {
    if frames.is_empty() {
      None
    } else {
      Some(Self { frames })
    }
  }

  pub fn len(&self) -> usize {
    self.frames.len()
  }

  pub fn is_empty(&self) -> bool {
    self.frames.is_empty()
  }

  pub fn frames(&self) -> &[ImageFrame] {
    &self.frames
  }

  /// 取出图像并循环补齐到 `target` 张
  pub fn into_batch(self, target: usize) -> Vec<RgbImage> {
    let mut images: Vec<RgbImage> = self.frames.into_iter().map(|frame| frame.image).collect();
    pad_to_batch(&mut images, target);
    images
  }
}

impl IntoIterator for ImageSet {
  type Item = ImageFrame;
  type IntoIter = std::vec::IntoIter<ImageFrame>;

  fn into_iter(self) -> Self::IntoIter {
    self.frames.into_iter()
  }
}

/// 不足 `target` 时按 `items[i % len]` 循环追加；`items` 为空时不做任何事
pub fn pad_to_batch<T: Clone>(items: &mut Vec<T>, target: usize) {
  let len = items.len();
  if len == 0 {
    return;
  }
  for i in len..target {
    let item = items[i % len].clone();
    items.push(item);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  use image::Rgb;

  fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("shanan-input-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
  }

  #[test]
  fn pad_repeats_cyclically() {
    let mut items = vec![1, 2, 3];
    pad_to_batch(&mut items, 8);
    assert_eq!(items, vec![1, 2, 3, 1, 2, 3, 1, 2]);
  }

  #[test]
  fn pad_keeps_longer_inputs() {
    for k in 1..12 {
      let original: Vec<usize> = (0..k).collect();
      let mut items = original.clone();
      pad_to_batch(&mut items, 8);
      assert_eq!(items.len(), k.max(8));
      assert_eq!(&items[..k], &original[..]);
      for (i, item) in items.iter().enumerate().skip(k) {
        assert_eq!(*item, original[i % k]);
      }
    }
  }

  #[test]
  fn pad_on_empty_is_noop() {
    let mut items: Vec<u8> = Vec::new();
    pad_to_batch(&mut items, 8);
    assert!(items.is_empty());
  }

  #[test]
  fn extension_filter_is_case_insensitive() {
    assert!(has_image_extension(Path::new("a/b.JPG")));
    assert!(has_image_extension(Path::new("b.png")));
    assert!(!has_image_extension(Path::new("b.txt")));
    assert!(!has_image_extension(Path::new("jpg")));
  }

  #[test]
  fn load_dir_skips_undecodable_files_and_recurses() {
    let dir = scratch_dir("mixed");
    std::fs::create_dir_all(dir.join("nested")).unwrap();
    RgbImage::from_pixel(4, 3, Rgb([1, 2, 3]))
      .save(dir.join("a.png"))
      .unwrap();
    RgbImage::from_pixel(4, 3, Rgb([4, 5, 6]))
      .save(dir.join("nested").join("b.PNG"))
      .unwrap();
    std::fs::write(dir.join("broken.jpg"), b"not an image").unwrap();
    std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();

    let set = ImageSet::load_dir(&dir).expect("two decodable images");
    assert_eq!(set.len(), 2);
    assert_eq!(set.frames()[0].base_name(), "a");

    let batch = set.into_batch(8);
    assert_eq!(batch.len(), 8);
    assert_eq!(batch[2].get_pixel(0, 0), &Rgb([1, 2, 3]));
    assert_eq!(batch[3].get_pixel(0, 0), &Rgb([4, 5, 6]));

    let _ = std::fs::remove_dir_all(&dir);
  }

  #[test]
  fn load_dir_without_images_signals_no_input() {
    let dir = scratch_dir("empty");
    std::fs::write(dir.join("broken.jpg"), b"garbage").unwrap();
    assert!(ImageSet::load_dir(&dir).is_none());
    assert!(ImageSet::load_dir(&dir.join("missing")).is_none());
    let _ = std::fs::remove_dir_all(&dir);
  }
}
