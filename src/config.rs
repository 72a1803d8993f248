// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 任务配置文档
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

//! 配置文档可以是 JSON 或 YAML（扩展名为 `.yaml`/`.yml` 时），顶层是一个对象：
//!
//! ```json
//! {
//!   "font_file": "assets/DejaVuSans.ttf",
//!   "tasks": [
//!     {
//!       "task": "seg",
//!       "subtasks": [
//!         { "type": "performance", "engine_file": "ppseg.rknn", "gpuid": 0, "input_dir": "images" }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! 等价的 YAML：
//!
//! ```yaml
//! font_file: assets/DejaVuSans.ttf
//! tasks:
//!   - task: seg
//!     subtasks:
//!       - { type: performance, engine_file: ppseg.rknn, gpuid: 0, input_dir: images }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::{Map, Value};
use thiserror::Error;

/// 文档级错误，任何一个都会终止整次运行
#[derive(Error, Debug)]
pub enum DocumentError {
  #[error("无法读取配置文件 {path}: {source}")]
  Read {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("配置文档格式错误: {0}")]
  Syntax(#[from] serde_json::Error),
  #[error("YAML 配置文档格式错误: {0}")]
  YamlSyntax(#[from] serde_yaml::Error),
  #[error("配置文档顶层必须是对象")]
  NotAnObject,
  #[error("配置文档缺少 `tasks`")]
  MissingTasks,
  #[error("`tasks` 必须是数组")]
  TasksNotSequence,
  #[error("`font_file` 必须是字符串")]
  FontNotString,
}

/// 字段级错误，只影响所在的任务或子任务
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("{at}: 缺少字段 `{field}`")]
  MissingField { at: Location, field: &'static str },
  #[error("{at}: 字段 `{field}` 应为{expected}")]
  WrongType {
    at: Location,
    field: &'static str,
    expected: &'static str,
  },
  #[error("{at}: 字段 `{field}` 取值无效: {reason}")]
  InvalidValue {
    at: Location,
    field: &'static str,
    reason: String,
  },
  #[error("{at}: 不是对象")]
  NotAnObject { at: Location },
}

/// 配置中的位置，下标从 0 开始
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
  pub task: usize,
  pub subtask: Option<usize>,
}

impl fmt::Display for Location {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.subtask {
      Some(subtask) => write!(f, "tasks[{}].subtasks[{}]", self.task, subtask),
      None => write!(f, "tasks[{}]", self.task),
    }
  }
}

/// 解析后的配置文档，运行期间只读
#[derive(Debug, Clone)]
pub struct TaskSpec {
  tasks: Vec<Value>,
  font_file: Option<PathBuf>,
}

impl FromStr for TaskSpec {
  type Err = DocumentError;

  fn from_str(text: &str) -> Result<Self, Self::Err> {
    Self::from_value(serde_json::from_str(text)?)
  }
}

impl TaskSpec {
  /// 解析 YAML 文档，结果与等价的 JSON 文档相同
  pub fn from_yaml(text: &str) -> Result<Self, DocumentError> {
    Self::from_value(serde_yaml::from_str(text)?)
  }

  fn from_value(root: Value) -> Result<Self, DocumentError> {
    let root = root.as_object().ok_or(DocumentError::NotAnObject)?;

    let tasks = match root.get("tasks") {
      None => return Err(DocumentError::MissingTasks),
      Some(Value::Array(tasks)) => tasks.clone(),
      Some(_) => return Err(DocumentError::TasksNotSequence),
    };

    let font_file = match root.get("font_file") {
      None | Some(Value::Null) => None,
      Some(Value::String(path)) => Some(PathBuf::from(path)),
      Some(_) => return Err(DocumentError::FontNotString),
    };

    Ok(Self { tasks, font_file })
  }

  /// 读取配置文件，`.yaml`/`.yml` 按 YAML 解析，其余按 JSON 解析
  pub fn load(path: &Path) -> Result<Self, DocumentError> {
    let text = std::fs::read_to_string(path).map_err(|source| DocumentError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    if is_yaml(path) {
      Self::from_yaml(&text)
    } else {
      text.parse()
    }
  }

  pub fn font_file(&self) -> Option<&Path> {
    self.font_file.as_deref()
  }

  pub fn len(&self) -> usize {
    self.tasks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tasks.is_empty()
  }

  /// 按声明顺序遍历任务
  pub fn tasks(&self) -> impl Iterator<Item = Node<'_>> {
    self.tasks.iter().enumerate().map(|(index, value)| Node {
      at: Location {
        task: index,
        subtask: None,
      },
      value,
    })
  }
}

fn is_yaml(path: &Path) -> bool {
  path
    .extension()
    .map(|ext| {
      let ext = ext.to_string_lossy().to_lowercase();
      ext == "yaml" || ext == "yml"
    })
    .unwrap_or(false)
}

/// 配置树中的一个对象节点，提供带类型检查的字段访问
#[derive(Debug, Clone, Copy)]
pub struct Node<'a> {
  at: Location,
  value: &'a Value,
}

impl<'a> Node<'a> {
  pub fn location(&self) -> Location {
    self.at
  }

  fn object(&self) -> Result<&'a Map<String, Value>, ConfigError> {
    self
      .value
      .as_object()
      .ok_or(ConfigError::NotAnObject { at: self.at })
  }

  fn field(&self, field: &'static str) -> Result<Option<&'a Value>, ConfigError> {
    Ok(self.object()?.get(field).filter(|v| !v.is_null()))
  }

  fn missing(&self, field: &'static str) -> ConfigError {
    ConfigError::MissingField { at: self.at, field }
  }

  fn wrong_type(&self, field: &'static str, expected: &'static str) -> ConfigError {
    ConfigError::WrongType {
      at: self.at,
      field,
      expected,
    }
  }

  pub fn invalid(&self, field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
      at: self.at,
      field,
      reason: reason.into(),
    }
  }

  pub fn opt_str(&self, field: &'static str) -> Result<Option<&'a str>, ConfigError> {
    match self.field(field)? {
      None => Ok(None),
      Some(value) => value
        .as_str()
        .map(Some)
        .ok_or_else(|| self.wrong_type(field, "字符串")),
    }
  }

  pub fn str(&self, field: &'static str) -> Result<&'a str, ConfigError> {
    self.opt_str(field)?.ok_or_else(|| self.missing(field))
  }

  pub fn path(&self, field: &'static str) -> Result<PathBuf, ConfigError> {
    self.str(field).map(PathBuf::from)
  }

  pub fn opt_int(&self, field: &'static str) -> Result<Option<i64>, ConfigError> {
    match self.field(field)? {
      None => Ok(None),
      Some(value) => value
        .as_i64()
        .map(Some)
        .ok_or_else(|| self.wrong_type(field, "整数")),
    }
  }

  pub fn int(&self, field: &'static str) -> Result<i64, ConfigError> {
    self.opt_int(field)?.ok_or_else(|| self.missing(field))
  }

  /// 非负整数，缺省时使用 `default`
  pub fn count_or(&self, field: &'static str, default: usize) -> Result<usize, ConfigError> {
    match self.opt_int(field)? {
      None => Ok(default),
      Some(n) => usize::try_from(n).map_err(|_| self.invalid(field, format!("{} 不是非负整数", n))),
    }
  }

  pub fn opt_f32(&self, field: &'static str) -> Result<Option<f32>, ConfigError> {
    match self.field(field)? {
      None => Ok(None),
      Some(value) => value
        .as_f64()
        .map(|v| Some(v as f32))
        .ok_or_else(|| self.wrong_type(field, "数值")),
    }
  }

  /// 子节点数组，每个元素带上自己的位置
  pub fn subtasks(&self) -> Result<Vec<Node<'a>>, ConfigError> {
    let field = "subtasks";
    let items = self
      .field(field)?
      .ok_or_else(|| self.missing(field))?
      .as_array()
      .ok_or_else(|| self.wrong_type(field, "数组"))?;

    Ok(
      items
        .iter()
        .enumerate()
        .map(|(index, value)| Node {
          at: Location {
            task: self.at.task,
            subtask: Some(index),
          },
          value,
        })
        .collect(),
    )
  }
}
