// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output.rs - 输出定义
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

use image::{GrayImage, RgbImage};
use thiserror::Error;
use tracing::{info, warn};

use crate::utils::ensure_parent_dir;

/// 把一次推理结果持久化，返回实际写入的文件路径
pub trait Render<Frame, Output> {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<Vec<PathBuf>, Self::Error>;
}

pub mod colormap;
pub mod draw;

mod directory_output;
mod save_image_file;

pub use self::directory_output::DirectoryOutput;
pub use self::draw::{Draw, Visual};
pub use self::save_image_file::SaveImageFileOutput;

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("I/O 错误 {path}: {source}")]
  IoError {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("图像写入错误 {path}: {source}")]
  ImageError {
    path: PathBuf,
    source: image::ImageError,
  },
  #[error("字体无效: {0}")]
  FontError(String),
}

pub(crate) fn create_dir(dir: &Path) -> Result<(), OutputError> {
  std::fs::create_dir_all(dir).map_err(|source| OutputError::IoError {
    path: dir.to_path_buf(),
    source,
  })
}

fn save_rgb(image: &RgbImage, path: &Path) -> Result<(), OutputError> {
  ensure_parent_dir(path).map_err(|source| OutputError::IoError {
    path: path.to_path_buf(),
    source,
  })?;
  image.save(path).map_err(|source| OutputError::ImageError {
    path: path.to_path_buf(),
    source,
  })
}

fn save_gray(image: &GrayImage, path: &Path) -> Result<(), OutputError> {
  ensure_parent_dir(path).map_err(|source| OutputError::IoError {
    path: path.to_path_buf(),
    source,
  })?;
  image.save(path).map_err(|source| OutputError::ImageError {
    path: path.to_path_buf(),
    source,
  })
}

/// 一个待写出的图像及其目标路径
pub(crate) enum Artifact<'a> {
  Rgb(&'a RgbImage, PathBuf),
  Gray(&'a GrayImage, PathBuf),
}

impl Artifact<'_> {
  fn path(&self) -> &Path {
    match self {
      Artifact::Rgb(_, path) | Artifact::Gray(_, path) => path,
    }
  }

  fn save(&self) -> Result<(), OutputError> {
    match self {
      Artifact::Rgb(image, path) => save_rgb(image, path),
      Artifact::Gray(image, path) => save_gray(image, path),
    }
  }
}

/// 按顺序写出一组图像
///
/// 任何一张写入失败时，删除本组中已写出的文件和写了一半的目标文件，
/// 不留下不完整的结果。
pub(crate) fn save_all(artifacts: Vec<Artifact<'_>>) -> Result<Vec<PathBuf>, OutputError> {
  let mut written = Vec::with_capacity(artifacts.len());
  for artifact in artifacts {
    if let Err(e) = artifact.save() {
      if artifact.path().is_file() {
        written.push(artifact.path().to_path_buf());
      }
      discard(&written);
      return Err(e);
    }
    let (Artifact::Rgb(_, path) | Artifact::Gray(_, path)) = artifact;
    written.push(path);
  }
  Ok(written)
}

fn discard(paths: &[PathBuf]) {
  for path in paths {
    if let Err(e) = std::fs::remove_file(path) {
      warn!("无法删除不完整的输出 {}: {}", path.display(), e);
    }
  }
}

pub(crate) fn log_saved(paths: &[PathBuf]) {
  let joined = paths
    .iter()
    .map(|p| p.display().to_string())
    .collect::<Vec<_>>()
    .join(", ");
  info!("保存到 {}", joined);
}
