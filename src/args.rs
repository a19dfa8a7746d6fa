// 该文件是 Shanan （山南西风） 项目的一部分。
// src/args.rs - 命令行参数
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use tracing::info;
use url::Url;

use crate::{
  FromUrl,
  camera::{Camera, CameraRegistry, CameraWrapper},
  config::Config,
  geometry::Rect,
  inference::BackendWrapper,
  output::OutputWrapper,
  pipeline::ArmorPipeline,
};

/// 两个可执行文件共用的参数
#[derive(Args, Debug)]
pub struct CommonArgs {
  /// TOML 配置文件，缺省时使用内置默认值
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,
  /// 推理模型，覆盖配置文件中的 `[model] path`
  #[arg(long, value_name = "MODEL")]
  pub model: Option<Url>,
  /// 输入来源
  /// - 图片或目录: image:///path/to/frames?loop
  /// - V4L2: v4l:///dev/video0?width=1280&height=1024
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 结果输出
  /// - 日志: log://?always
  /// - JSON Lines: jsonl:///path/to/result.jsonl
  /// - 逐帧保存图像: dir:///path/to/frames?detected
  #[arg(long, value_name = "OUTPUT", default_value = "log://")]
  pub output: Url,
  /// 感兴趣区域，覆盖配置文件中的 `[capture] roi`
  #[arg(long, value_name = "X,Y,W,H", value_parser = parse_roi)]
  pub roi: Option<Rect>,
}

/// 由参数组装出的运行环境
pub struct Setup {
  pub camera: Camera<CameraWrapper>,
  pub pipeline: ArmorPipeline<BackendWrapper>,
  pub output: OutputWrapper,
  pub roi: Option<Rect>,
}

impl CommonArgs {
  pub fn load_config(&self) -> Result<Config> {
    let mut config = match &self.config {
      Some(path) => {
        info!("配置文件: {}", path.display());
        Config::load(path)?
      }
      None => Config::default(),
    };
    if let Some(model) = &self.model {
      config.model.path = model.to_string();
    }
    if let Some(roi) = self.roi {
      config.capture.roi = Some([roi.x, roi.y, roi.width, roi.height]);
    }
    config.validate()?;
    Ok(config)
  }

  pub fn setup(&self) -> Result<Setup> {
    let config = self.load_config()?;

    let model_url = config.model_url()?;
    info!("模型: {} ({})", model_url, config.model.device);
    info!("输入来源: {}", self.input);
    info!("输出路径: {}", self.output);

    let backend = BackendWrapper::from_url(&model_url)?;
    let pipeline =
      ArmorPipeline::new(backend, config.detector()?)?.with_pose_estimator(config.pose_estimator()?);

    let registry = CameraRegistry::new();
    let camera = registry
      .register(CameraWrapper::from_url(&self.input)?)?
      .with_grab_timeout(config.capture.grab_timeout());
    camera.set_exposure(config.capture.exposure_us)?;
    camera.set_gain(config.capture.gain)?;

    let output = OutputWrapper::from_url(&self.output)?;

    Ok(Setup {
      camera,
      pipeline,
      output,
      roi: config.capture.roi(),
    })
  }
}

pub fn parse_roi(s: &str) -> Result<Rect, String> {
  let values = s
    .split(',')
    .map(|v| v.trim().parse::<i32>())
    .collect::<Result<Vec<_>, _>>()
    .map_err(|e| format!("感兴趣区域应为 x,y,w,h: {}", e))?;
  match values.as_slice() {
    &[x, y, w, h] if w > 0 && h > 0 => Ok(Rect::new(x, y, w, h)),
    _ => Err(format!("感兴趣区域应为 x,y,w,h 且宽高为正, 实际为 {}", s)),
  }
}
