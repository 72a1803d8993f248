// 该文件是 Shanan （山南西风） 项目的一部分。
// src/utils.rs - 路径工具
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

const OUTPUT_EXTENSION: &str = "jpg";
const DRIVE_PREFIX: &str = "drive_";
const LANE_PREFIX: &str = "lane_";

/// 提取文件名
///
/// `/` 与 `\` 都视为目录分隔符。`include_suffix` 为 `false` 时去掉最后一个
/// `.` 及其之后的部分，但只有当这个 `.` 位于最后一个分隔符之后、且不是文件名
/// 的第一个字符时才生效，因此 `.hidden` 保持不变。
///
/// ```
/// use shanan_bench::utils::file_base_name;
///
/// assert_eq!(file_base_name("data/images/0001.jpg", false), "0001");
/// assert_eq!(file_base_name("data/images/0001.jpg", true), "0001.jpg");
/// assert_eq!(file_base_name("a.d/noext", false), "noext");
/// ```
pub fn file_base_name(path: &str, include_suffix: bool) -> &str {
  let start = path.rfind(['/', '\\']).map(|p| p + 1).unwrap_or(0);
  let name = &path[start..];
  if include_suffix {
    return name;
  }
  match name.rfind('.') {
    Some(dot) if dot > 0 => &name[..dot],
    _ => name,
  }
}

/// 全景驾驶结果的三个输出路径：标注图、可行驶区域、车道线
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanopticPaths {
  pub image: PathBuf,
  pub drive: PathBuf,
  pub lane: PathBuf,
}

impl PanopticPaths {
  pub fn in_dir(dir: &Path, base: &str) -> Self {
    Self {
      image: dir.join(format!("{base}.{OUTPUT_EXTENSION}")),
      drive: dir.join(format!("{DRIVE_PREFIX}{base}.{OUTPUT_EXTENSION}")),
      lane: dir.join(format!("{LANE_PREFIX}{base}.{OUTPUT_EXTENSION}")),
    }
  }

  pub fn to_vec(&self) -> Vec<PathBuf> {
    vec![self.image.clone(), self.drive.clone(), self.lane.clone()]
  }
}

/// 单图输出路径 `<dir>/<base>.jpg`
pub fn image_output_path(dir: &Path, base: &str) -> PathBuf {
  dir.join(format!("{base}.{OUTPUT_EXTENSION}"))
}

/// 创建输出文件的父目录（如有必要）
pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
  if let Some(parent) = path.parent()
    && !parent.as_os_str().is_empty()
  {
    std::fs::create_dir_all(parent)?;
  }
  Ok(())
}
