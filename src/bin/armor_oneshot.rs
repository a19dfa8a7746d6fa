// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/armor_oneshot.rs - 单帧装甲板检测
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

use anyhow::Result;
use clap::Parser;

use shanan_armor::{
  args::CommonArgs,
  task::{OneShotTask, Task},
};

/// 采集一帧并输出装甲板检测与位姿
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub common: CommonArgs,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let setup = args.common.setup()?;

  OneShotTask::default()
    .with_roi(setup.roi)
    .run_task(setup.camera, setup.pipeline, setup.output)?;

  Ok(())
}
