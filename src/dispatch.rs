// 该文件是 Shanan （山南西风） 项目的一部分。
// src/dispatch.rs - 任务分发
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

//! 按声明顺序执行配置中的每个子任务。
//!
//! 未知的任务名和子任务类型只记录后跳过；缺失或类型错误的字段、
//! 引擎加载失败、输入解码失败只让当前子任务失败；型号标签无法识别时
//! 整次运行终止。

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
  config::{ConfigError, Location, Node, TaskSpec},
  input::{ImageSet, InputError, load_image},
  model::{EngineSpec, Family, Predictor, PredictorFactory, Thresholds, Variant},
  output::{DirectoryOutput, Draw, SaveImageFileOutput},
  task::{
    BatchTask, BenchmarkConfig, BenchmarkReport, BenchmarkTask, OneShotTask, StopFlag, Task,
    TaskError,
  },
};

pub const DEFAULT_BATCH_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtaskKind {
  Performance,
  BatchInference,
  SingleInference,
  TrackVideo,
}

impl SubtaskKind {
  pub fn parse(tag: &str) -> Option<Self> {
    match tag {
      "performance" => Some(SubtaskKind::Performance),
      "batch_inference" => Some(SubtaskKind::BatchInference),
      "single_inference" => Some(SubtaskKind::SingleInference),
      "track_video" => Some(SubtaskKind::TrackVideo),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      SubtaskKind::Performance => "performance",
      SubtaskKind::BatchInference => "batch_inference",
      SubtaskKind::SingleInference => "single_inference",
      SubtaskKind::TrackVideo => "track_video",
    }
  }
}

impl fmt::Display for SubtaskKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Error, Debug)]
pub enum SubtaskError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error("{at}: 模型族 {family} 无法识别型号 `{tag}`")]
  UnknownVariant {
    at: Location,
    family: Family,
    tag: String,
  },
  #[error("{at}: 无法为引擎 {} 创建预测器", .engine.display())]
  PredictorUnavailable { at: Location, engine: PathBuf },
  #[error("{at}: {source}")]
  Input { at: Location, source: InputError },
  #[error("{at}: {source}")]
  Task { at: Location, source: TaskError },
  #[error("{at}: 无法写入性能报告 {}: {source}", .path.display())]
  Report {
    at: Location,
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("{at}: 不支持视频跟踪 ({})", .video.display())]
  Unsupported { at: Location, video: PathBuf },
}

impl SubtaskError {
  /// 型号无法识别或收到中断时，终止整次运行
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      SubtaskError::UnknownVariant { .. }
        | SubtaskError::Task {
          source: TaskError::Interrupted,
          ..
        }
    )
  }
}

#[derive(Error, Debug)]
pub enum DispatchError {
  #[error("运行终止: {0}")]
  Fatal(SubtaskError),
  #[error("运行被中断")]
  Interrupted,
}

/// 子任务正常结束时的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtaskOutcome {
  Completed,
  /// 输入目录中没有可用图像，未创建预测器
  NoInput,
  /// 未知的子任务类型
  Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
  pub completed: usize,
  pub skipped: usize,
  pub failed: usize,
}

enum Sink {
  File(PathBuf),
  Directory(PathBuf),
}

struct Subtask<'a> {
  node: Node<'a>,
  family: Family,
  kind: SubtaskKind,
}

impl Subtask<'_> {
  fn at(&self) -> Location {
    self.node.location()
  }
}

type Handler = fn(&Dispatcher, &Subtask<'_>) -> Result<SubtaskOutcome, SubtaskError>;

const DISPATCH_TABLE: &[(Family, SubtaskKind, Handler)] = &[
  (Family::Detection, SubtaskKind::Performance, Dispatcher::performance),
  (Family::Detection, SubtaskKind::BatchInference, Dispatcher::batch_inference),
  (Family::Detection, SubtaskKind::SingleInference, Dispatcher::single_inference),
  (Family::PanopticDriving, SubtaskKind::Performance, Dispatcher::performance),
  (Family::PanopticDriving, SubtaskKind::BatchInference, Dispatcher::batch_inference),
  (Family::PanopticDriving, SubtaskKind::SingleInference, Dispatcher::single_inference),
  (Family::Segmentation, SubtaskKind::Performance, Dispatcher::performance),
  (Family::Segmentation, SubtaskKind::BatchInference, Dispatcher::batch_inference),
  (Family::Segmentation, SubtaskKind::SingleInference, Dispatcher::single_inference),
  (Family::Tracking, SubtaskKind::TrackVideo, Dispatcher::track_video),
];

fn lookup(family: Family, kind: SubtaskKind) -> Option<Handler> {
  DISPATCH_TABLE
    .iter()
    .find(|(f, k, _)| *f == family && *k == kind)
    .map(|(_, _, handler)| *handler)
}

pub struct Dispatcher {
  factory: Box<dyn PredictorFactory>,
  draw: Draw,
  stop: Option<StopFlag>,
}

impl Dispatcher {
  pub fn new(factory: Box<dyn PredictorFactory>, draw: Draw) -> Self {
    Self {
      factory,
      draw,
      stop: None,
    }
  }

  pub fn with_stop_flag(mut self, stop: Option<StopFlag>) -> Self {
    self.stop = stop;
    self
  }

  fn interrupted(&self) -> bool {
    self.stop.as_ref().is_some_and(StopFlag::is_stopped)
  }

  /// 依次执行所有任务
  pub fn run(&self, spec: &TaskSpec) -> Result<RunSummary, DispatchError> {
    let mut summary = RunSummary::default();

    for task in spec.tasks() {
      let at = task.location();
      let name = match task.str("task") {
        Ok(name) => name,
        Err(e) => {
          error!("{}", e);
          summary.failed += 1;
          continue;
        }
      };
      let Some(family) = Family::from_task_name(name) else {
        error!("{}: 未知的任务 `{}`，跳过", at, name);
        summary.skipped += 1;
        continue;
      };
      let subtasks = match task.subtasks() {
        Ok(subtasks) => subtasks,
        Err(e) => {
          error!("{}", e);
          summary.failed += 1;
          continue;
        }
      };
      info!("{}: 任务 `{}` ({})，{} 个子任务", at, name, family, subtasks.len());

      for node in subtasks {
        if self.interrupted() {
          warn!("中断信号接收，停止执行剩余子任务");
          return Err(DispatchError::Interrupted);
        }

        match self.run_subtask(family, node) {
          Ok(SubtaskOutcome::Completed) => summary.completed += 1,
          Ok(SubtaskOutcome::NoInput | SubtaskOutcome::Skipped) => summary.skipped += 1,
          Err(e) if e.is_fatal() => {
            error!("{}", e);
            return match e {
              SubtaskError::Task {
                source: TaskError::Interrupted,
                ..
              } => Err(DispatchError::Interrupted),
              e => Err(DispatchError::Fatal(e)),
            };
          }
          Err(e) => {
            error!("{}", e);
            summary.failed += 1;
          }
        }
      }
    }

    info!(
      "运行结束: 完成 {}，跳过 {}，失败 {}",
      summary.completed, summary.skipped, summary.failed
    );
    Ok(summary)
  }

  fn run_subtask(&self, family: Family, node: Node<'_>) -> Result<SubtaskOutcome, SubtaskError> {
    let at = node.location();
    let tag = node.str("type")?;
    let Some(kind) = SubtaskKind::parse(tag) else {
      error!("{}: 未知的子任务类型 `{}`，跳过", at, tag);
      return Ok(SubtaskOutcome::Skipped);
    };
    let Some(handler) = lookup(family, kind) else {
      error!("{}: 任务 {} 不支持子任务类型 `{}`，跳过", at, family, kind);
      return Ok(SubtaskOutcome::Skipped);
    };

    info!("{}: 开始子任务 {}", at, kind);
    let subtask = Subtask { node, family, kind };
    let outcome = handler(self, &subtask)?;
    if outcome == SubtaskOutcome::NoInput {
      warn!("{}: 没有可用的输入图像，跳过 {}", at, subtask.kind);
    }
    Ok(outcome)
  }

  /// 型号解析在任何资源操作之前完成
  fn resolve_variant(sub: &Subtask<'_>) -> Result<Variant, SubtaskError> {
    let tag = match (sub.family, sub.family.variant_key()) {
      (Family::PanopticDriving, Some(key)) => sub.node.opt_str(key)?,
      (_, Some(key)) => Some(sub.node.str(key)?),
      (_, None) => None,
    };
    Variant::resolve(sub.family, tag).ok_or_else(|| SubtaskError::UnknownVariant {
      at: sub.at(),
      family: sub.family,
      tag: tag.unwrap_or_default().to_string(),
    })
  }

  fn engine_spec(sub: &Subtask<'_>) -> Result<EngineSpec, SubtaskError> {
    let variant = Self::resolve_variant(sub)?;
    let node = &sub.node;
    let defaults = Thresholds::for_family(sub.family);

    Ok(EngineSpec {
      engine_path: node.path("engine_file")?,
      family: sub.family,
      variant,
      device_id: node.int("gpuid")?,
      thresholds: Thresholds {
        confidence: node
          .opt_f32("confidence_threshold")?
          .unwrap_or(defaults.confidence),
        nms: node.opt_f32("nms_threshold")?.unwrap_or(defaults.nms),
      },
    })
  }

  fn create_predictor(&self, sub: &Subtask<'_>, spec: &EngineSpec) -> Result<Predictor, SubtaskError> {
    info!(
      "{}: 加载引擎 {} ({}，设备 {})",
      sub.at(),
      spec.engine_path.display(),
      spec.variant,
      spec.device_id
    );
    self
      .factory
      .create(spec)
      .ok_or_else(|| SubtaskError::PredictorUnavailable {
        at: sub.at(),
        engine: spec.engine_path.clone(),
      })
  }

  fn task_error(sub: &Subtask<'_>) -> impl FnOnce(TaskError) -> SubtaskError {
    let at = sub.at();
    move |source| SubtaskError::Task { at, source }
  }

  fn performance(&self, sub: &Subtask<'_>) -> Result<SubtaskOutcome, SubtaskError> {
    let spec = Self::engine_spec(sub)?;
    let node = &sub.node;
    let input_dir = node.path("input_dir")?;
    let batch_size = node.count_or("batch_size", DEFAULT_BATCH_SIZE)?;
    let defaults = BenchmarkConfig::default();
    let config = BenchmarkConfig {
      warmup: node.count_or("warmup", defaults.warmup)?,
      trials: node.count_or("trials", defaults.trials)?,
    };
    let report_file = node.opt_str("report_file")?.map(PathBuf::from);

    let Some(images) = ImageSet::load_dir(&input_dir) else {
      return Ok(SubtaskOutcome::NoInput);
    };
    let batch = images.into_batch(batch_size);

    let predictor = self.create_predictor(sub, &spec)?;
    let stats = BenchmarkTask::new(config)
      .with_stop_flag(self.stop.clone())
      .run_task(&batch[..], &predictor, ())
      .map_err(Self::task_error(sub))?;

    let engine = spec.engine_path.display();
    warn!(
      "{}: {} 平均耗时 {:.3} ms/张，FPS {:.2} (batch {}，预热 {}，计时 {})",
      sub.at(),
      engine,
      stats.avg_ms,
      stats.fps,
      stats.batch_size,
      config.warmup,
      config.trials
    );
    println!(
      "Average time for {}: {:.3} ms, FPS: {:.2}",
      engine, stats.avg_ms, stats.fps
    );

    if let Some(path) = report_file {
      let report = BenchmarkReport::new(
        &spec.engine_path,
        spec.family,
        spec.variant,
        spec.device_id,
        config,
        stats,
      );
      report.save(&path).map_err(|source| SubtaskError::Report {
        at: sub.at(),
        path: path.clone(),
        source,
      })?;
      info!("性能报告已保存到 {}", path.display());
    }

    Ok(SubtaskOutcome::Completed)
  }

  fn single_inference(&self, sub: &Subtask<'_>) -> Result<SubtaskOutcome, SubtaskError> {
    let spec = Self::engine_spec(sub)?;
    let node = &sub.node;
    let input_img = node.path("input_img")?;
    // 全景驾驶结果是三张图，写到目录
    let sink = match sub.family {
      Family::PanopticDriving => Sink::Directory(node.path("output_dir")?),
      _ => Sink::File(node.path("output_img_path")?),
    };

    let frame = load_image(&input_img).map_err(|source| SubtaskError::Input {
      at: sub.at(),
      source,
    })?;
    let predictor = self.create_predictor(sub, &spec)?;

    let draw = self.draw.clone();
    let written = match sink {
      Sink::Directory(dir) => {
        OneShotTask.run_task([frame], &predictor, DirectoryOutput::new(dir, draw))
      }
      Sink::File(path) => {
        OneShotTask.run_task([frame], &predictor, SaveImageFileOutput::new(path, draw))
      }
    }
    .map_err(Self::task_error(sub))?;

    info!("{}: 写出 {} 个文件", sub.at(), written.len());
    Ok(SubtaskOutcome::Completed)
  }

  fn batch_inference(&self, sub: &Subtask<'_>) -> Result<SubtaskOutcome, SubtaskError> {
    let spec = Self::engine_spec(sub)?;
    let node = &sub.node;
    let input_dir = node.path("input_dir")?;
    let output_dir = node.path("output_dir")?;

    let Some(images) = ImageSet::load_dir(&input_dir) else {
      return Ok(SubtaskOutcome::NoInput);
    };
    let predictor = self.create_predictor(sub, &spec)?;

    let outcome = BatchTask::default()
      .with_stop_flag(self.stop.clone())
      .run_task(
        images,
        &predictor,
        DirectoryOutput::new(output_dir, self.draw.clone()).with_input_root(&input_dir),
      )
      .map_err(Self::task_error(sub))?;

    if outcome.failed > 0 {
      warn!("{}: {} 张图像处理失败", sub.at(), outcome.failed);
    }
    Ok(SubtaskOutcome::Completed)
  }

  /// 只校验配置；视频解码与跟踪不在本程序范围内
  fn track_video(&self, sub: &Subtask<'_>) -> Result<SubtaskOutcome, SubtaskError> {
    Self::engine_spec(sub)?;
    let video = sub.node.path("video_file")?;
    sub.node.path("output_save_path")?;
    Err(SubtaskError::Unsupported { at: sub.at(), video })
  }
}
