// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/directory_output.rs - 目录输出
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

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::{
  input::ImageFrame,
  model::Prediction,
  output::{Artifact, Draw, OutputError, Render, create_dir, log_saved, save_all},
  utils::{PanopticPaths, image_output_path},
};

/// 按输入文件名把结果写入目录
///
/// 普通结果写为 `<dir>/<base>.jpg`；全景驾驶结果额外写出
/// `<dir>/drive_<base>.jpg` 与 `<dir>/lane_<base>.jpg`。
///
/// 设置了输入根目录时，输入文件相对它的子目录在输出目录下保留。
/// 同一目录中文件名仍然冲突的结果改名为 `<base>_1`、`<base>_2` ……
pub struct DirectoryOutput {
  directory: PathBuf,
  input_root: Option<PathBuf>,
  draw: Draw,
  claimed: RefCell<HashSet<PathBuf>>,
}

impl DirectoryOutput {
  pub fn new(directory: impl Into<PathBuf>, draw: Draw) -> Self {
    Self {
      directory: directory.into(),
      input_root: None,
      draw,
      claimed: RefCell::default(),
    }
  }

  pub fn with_input_root(mut self, root: impl Into<PathBuf>) -> Self {
    self.input_root = Some(root.into());
    self
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  fn target_dir(&self, frame: &ImageFrame) -> PathBuf {
    let nested = self
      .input_root
      .as_deref()
      .and_then(|root| frame.path.strip_prefix(root).ok())
      .and_then(Path::parent)
      .filter(|rel| !rel.as_os_str().is_empty());
    match nested {
      Some(rel) => self.directory.join(rel),
      None => self.directory.clone(),
    }
  }

  fn claim_base(&self, dir: &Path, base: &str) -> String {
    let mut claimed = self.claimed.borrow_mut();
    let mut candidate = base.to_string();
    let mut suffix = 0;
    while !claimed.insert(dir.join(&candidate)) {
      suffix += 1;
      candidate = format!("{base}_{suffix}");
    }
    if suffix > 0 {
      warn!(
        "输出文件名冲突: {} 改写为 {}",
        dir.join(base).display(),
        dir.join(&candidate).display()
      );
    }
    candidate
  }
}

impl Render<ImageFrame, Prediction> for DirectoryOutput {
  type Error = OutputError;

  fn render_result(
    &self,
    frame: &ImageFrame,
    result: &Prediction,
  ) -> Result<Vec<PathBuf>, Self::Error> {
    let visual = self.draw.visualize(&frame.image, result);
    let dir = self.target_dir(frame);
    create_dir(&dir)?;

    let base = self.claim_base(&dir, &frame.base_name());
    let artifacts = match &visual.masks {
      Some((drive, lane)) => {
        let paths = PanopticPaths::in_dir(&dir, &base);
        vec![
          Artifact::Rgb(&visual.overlay, paths.image),
          Artifact::Gray(drive, paths.drive),
          Artifact::Gray(lane, paths.lane),
        ]
      }
      None => vec![Artifact::Rgb(&visual.overlay, image_output_path(&dir, &base))],
    };

    let written = save_all(artifacts)?;
    log_saved(&written);
    Ok(written)
  }
}
