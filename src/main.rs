// 该文件是 Shanan （山南西风） 项目的一部分。
// src/main.rs - 项目主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

mod args;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use shanan_bench::{
  config::TaskSpec,
  dispatch::{DispatchError, Dispatcher},
  model::default_factory,
  output::Draw,
  task::install_interrupt_handler,
};

const EXIT_INTERRUPTED: u8 = 130;

fn main() -> ExitCode {
  let args = match args::Args::try_parse() {
    Ok(args) => args,
    Err(e) if e.use_stderr() => {
      let _ = e.print();
      return ExitCode::FAILURE;
    }
    Err(e) => e.exit(),
  };

  tracing_subscriber::fmt()
    .with_max_level(args.log_level())
    .init();

  match run(&args) {
    Ok(code) => code,
    Err(e) => {
      error!("{:#}", e);
      ExitCode::FAILURE
    }
  }
}

fn run(args: &args::Args) -> Result<ExitCode> {
  info!("配置文件: {}", args.config.display());
  let spec = TaskSpec::load(&args.config)
    .with_context(|| format!("无法加载配置 {}", args.config.display()))?;
  info!("共 {} 个任务", spec.len());

  let draw = match spec.font_file() {
    Some(path) => Draw::with_font_file(path).unwrap_or_else(|e| {
      warn!("无法加载字体，标签将不被绘制: {}", e);
      Draw::default()
    }),
    None => Draw::default(),
  };

  let stop = match install_interrupt_handler() {
    Ok(stop) => Some(stop),
    Err(e) => {
      warn!("无法设置 Ctrl-C 处理函数: {}", e);
      None
    }
  };

  let dispatcher = Dispatcher::new(default_factory(), draw).with_stop_flag(stop);
  match dispatcher.run(&spec) {
    Ok(summary) => {
      if summary.failed > 0 || summary.skipped > 0 {
        warn!(
          "{} 个子任务失败，{} 个被跳过",
          summary.failed, summary.skipped
        );
      }
      Ok(ExitCode::SUCCESS)
    }
    Err(DispatchError::Interrupted) => {
      warn!("运行被中断");
      Ok(ExitCode::from(EXIT_INTERRUPTED))
    }
    Err(e) => Err(e.into()),
  }
}
