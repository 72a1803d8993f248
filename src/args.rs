// 该文件是 Shanan （山南西风） 项目的一部分。
// src/args.rs - 项目参数配置
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use clap::Parser;
use tracing::Level;

/// Shanan 推理基准测试
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 任务配置文件（JSON，或扩展名为 .yaml/.yml 的 YAML）
  #[arg(value_name = "CONFIG")]
  pub config: PathBuf,

  /// 日志详细程度，可重复：-v 为 debug，-vv 为 trace
  #[arg(short, long, action = clap::ArgAction::Count)]
  pub verbose: u8,
}

impl Args {
  pub fn log_level(&self) -> Level {
    match self.verbose {
      0 => Level::INFO,
      1 => Level::DEBUG,
      _ => Level::TRACE,
    }
  }
}
