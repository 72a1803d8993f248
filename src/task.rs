// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 任务执行：单次推理、批量推理与性能测试
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
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use std::{error::Error as StdError, thread};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{model::Model, output::Render};

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum TaskError {
  #[error("没有输入帧")]
  NoInput,
  #[error("推理失败: {0}")]
  Infer(#[source] BoxError),
  #[error("渲染失败: {0}")]
  Render(#[source] BoxError),
  #[error("任务被中断")]
  Interrupted,
}

pub trait Task<I, M, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error>;
}

/// 进程级中断标志，由 Ctrl-C 置位
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn stop(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_stopped(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }

  fn check(flag: Option<&StopFlag>) -> Result<(), TaskError> {
    match flag {
      Some(flag) if flag.is_stopped() => Err(TaskError::Interrupted),
      _ => Ok(()),
    }
  }
}

/// 安装 Ctrl-C 处理函数
///
/// 第一次中断只置位标志，由任务在迭代之间检查；30 秒内没有退出，
/// 或者再次收到中断时，直接结束进程。
pub fn install_interrupt_handler() -> Result<StopFlag, ctrlc::Error> {
  let flag = StopFlag::new();
  let handler_flag = flag.clone();
  ctrlc::set_handler(move || {
    if handler_flag.0.swap(true, Ordering::SeqCst) {
      warn!("再次收到中断信号，强制退出");
      std::process::exit(130);
    }
    info!("收到中断信号，准备退出...");
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(130);
    });
  })?;
  Ok(flag)
}

/// 对第一帧推理一次并渲染，返回写出的文件
pub struct OneShotTask;

impl<F, MI, D, ME, RE, I, M, O> Task<I, M, O> for OneShotTask
where
  F: AsRef<MI>,
  ME: StdError + Send + Sync + 'static,
  RE: StdError + Send + Sync + 'static,
  I: IntoIterator<Item = F>,
  M: Model<Input = MI, Output = D, Error = ME>,
  O: Render<F, D, Error = RE>,
{
  type Output = Vec<PathBuf>;
  type Error = TaskError;

  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let frame = input.into_iter().next().ok_or(TaskError::NoInput)?;
    info!("输入帧获取成功，开始推理...");
    let now = Instant::now();
    let result = model
      .infer(frame.as_ref())
      .map_err(|e| TaskError::Infer(e.into()))?;
    info!("推理完成，耗时: {:.2?}", now.elapsed());
    let written = output
      .render_result(&frame, &result)
      .map_err(|e| TaskError::Render(e.into()))?;
    info!("渲染完成，耗时: {:.2?}", now.elapsed());

    Ok(written)
  }
}

/// 批量推理的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
  pub succeeded: usize,
  pub failed: usize,
  pub written: Vec<PathBuf>,
}

/// 逐帧推理并渲染，单帧失败只记录，不中止任务
#[derive(Debug, Default)]
pub struct BatchTask {
  stop: Option<StopFlag>,
}

impl BatchTask {
  pub fn with_stop_flag(mut self, stop: Option<StopFlag>) -> Self {
    self.stop = stop;
    self
  }
}

impl<F, MI, D, ME, RE, I, M, O> Task<I, M, O> for BatchTask
where
  F: AsRef<MI>,
  ME: StdError + Send + Sync + 'static,
  RE: StdError + Send + Sync + 'static,
  I: IntoIterator<Item = F>,
  M: Model<Input = MI, Output = D, Error = ME>,
  O: Render<F, D, Error = RE>,
{
  type Output = BatchOutcome;
  type Error = TaskError;

  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始批量任务...");
    let mut outcome = BatchOutcome::default();
    for (index, frame) in input.into_iter().enumerate() {
      StopFlag::check(self.stop.as_ref())?;
      debug!("处理第 {} 帧图像", index);

      let result = match model.infer(frame.as_ref()) {
        Ok(result) => result,
        Err(e) => {
          warn!("第 {} 帧推理失败: {}", index, e);
          outcome.failed += 1;
          continue;
        }
      };
      match output.render_result(&frame, &result) {
        Ok(written) => {
          outcome.succeeded += 1;
          outcome.written.extend(written);
        }
        Err(e) => {
          warn!("第 {} 帧渲染失败: {}", index, e);
          outcome.failed += 1;
        }
      }
    }

    if outcome.succeeded + outcome.failed == 0 {
      return Err(TaskError::NoInput);
    }
    info!(
      "批量任务完成: 成功 {} 帧，失败 {} 帧",
      outcome.succeeded, outcome.failed
    );
    Ok(outcome)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BenchmarkConfig {
  pub warmup: usize,
  pub trials: usize,
}

impl Default for BenchmarkConfig {
  fn default() -> Self {
    Self {
      warmup: 10,
      trials: 100,
    }
  }
}

/// 计时结果，只保留均值
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BenchmarkStats {
  pub batch_size: usize,
  pub total_ms: f64,
  pub avg_ms: f64,
  pub fps: f64,
}

impl BenchmarkStats {
  /// 平均值按 `total / trials / batch_len` 计算
  pub fn from_elapsed(elapsed: Duration, trials: usize, batch_size: usize) -> Self {
    let total_ms = elapsed.as_secs_f64() * 1000.0;
    let avg_ms = if trials == 0 || batch_size == 0 {
      0.0
    } else {
      total_ms / trials as f64 / batch_size as f64
    };
    let fps = if avg_ms > 0.0 { 1000.0 / avg_ms } else { 0.0 };
    Self {
      batch_size,
      total_ms,
      avg_ms,
      fps,
    }
  }
}

/// 预热后重复推理并计时
///
/// 预热与计时阶段都按 `batch[i % len]` 取输入；整个计时循环只测一次墙钟时间。
#[derive(Debug, Default)]
pub struct BenchmarkTask {
  config: BenchmarkConfig,
  stop: Option<StopFlag>,
}

impl BenchmarkTask {
  pub fn new(config: BenchmarkConfig) -> Self {
    Self { config, stop: None }
  }

  pub fn with_stop_flag(mut self, stop: Option<StopFlag>) -> Self {
    self.stop = stop;
    self
  }
}

impl<'a, F, D, ME, M> Task<&'a [F], M, ()> for BenchmarkTask
where
  ME: StdError + Send + Sync + 'static,
  M: Model<Input = F, Output = D, Error = ME>,
{
  type Output = BenchmarkStats;
  type Error = TaskError;

  fn run_task(self, batch: &'a [F], model: M, _output: ()) -> Result<Self::Output, Self::Error> {
    if batch.is_empty() {
      return Err(TaskError::NoInput);
    }
    let stop = self.stop.as_ref();
    let infer = |i: usize| -> Result<(), TaskError> {
      model
        .infer(&batch[i % batch.len()])
        .map(drop)
        .map_err(|e| TaskError::Infer(e.into()))
    };

    info!("预热 {} 次...", self.config.warmup);
    for i in 0..self.config.warmup {
      StopFlag::check(stop)?;
      infer(i)?;
    }

    info!("计时 {} 次...", self.config.trials);
    let now = Instant::now();
    for i in 0..self.config.trials {
      StopFlag::check(stop)?;
      infer(i)?;
    }
    let elapsed = now.elapsed();

    Ok(BenchmarkStats::from_elapsed(
      elapsed,
      self.config.trials,
      batch.len(),
    ))
  }
}

/// 写入 JSON 的性能测试报告
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
  pub engine: String,
  pub family: String,
  pub variant: String,
  pub device_id: i64,
  #[serde(flatten)]
  pub config: BenchmarkConfig,
  #[serde(flatten)]
  pub stats: BenchmarkStats,
  pub timestamp: String,
}

impl BenchmarkReport {
  pub fn new(
    engine: &Path,
    family: impl ToString,
    variant: impl ToString,
    device_id: i64,
    config: BenchmarkConfig,
    stats: BenchmarkStats,
  ) -> Self {
    Self {
      engine: engine.display().to_string(),
      family: family.to_string(),
      variant: variant.to_string(),
      device_id,
      config,
      stats,
      timestamp: chrono::Utc::now().to_rfc3339(),
    }
  }

  pub fn save(&self, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
    crate::utils::ensure_parent_dir(path)?;
    std::fs::write(path, json)
  }
}
