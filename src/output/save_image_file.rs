// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/save_image_file.rs - 保存图像文件
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

use crate::{
  input::ImageFrame,
  model::Prediction,
  output::{Artifact, Draw, OutputError, Render, log_saved, save_all},
  utils::{PanopticPaths, file_base_name},
};

/// 写入到一个指定的文件路径
///
/// 全景驾驶结果的两张掩码写在同一目录下，文件名为
/// `drive_<stem>.jpg` 与 `lane_<stem>.jpg`。
pub struct SaveImageFileOutput {
  path: PathBuf,
  draw: Draw,
}

impl SaveImageFileOutput {
  pub fn new(path: impl Into<PathBuf>, draw: Draw) -> Self {
    Self {
      path: path.into(),
      draw,
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Render<ImageFrame, Prediction> for SaveImageFileOutput {
  type Error = OutputError;

  fn render_result(
    &self,
    frame: &ImageFrame,
    result: &Prediction,
  ) -> Result<Vec<PathBuf>, Self::Error> {
    let visual = self.draw.visualize(&frame.image, result);

    let mut artifacts = vec![Artifact::Rgb(&visual.overlay, self.path.clone())];
    if let Some((drive, lane)) = &visual.masks {
      let dir = self.path.parent().unwrap_or(Path::new(""));
      let path = self.path.to_string_lossy();
      let paths = PanopticPaths::in_dir(dir, file_base_name(&path, false));
      artifacts.push(Artifact::Gray(drive, paths.drive));
      artifacts.push(Artifact::Gray(lane, paths.lane));
    }

    let written = save_all(artifacts)?;
    log_saved(&written);
    Ok(written)
  }
}
