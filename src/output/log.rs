// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/log.rs - 日志输出
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

use image::RgbImage;
use tracing::info;
use url::Url;

use super::{OutputError, Render};
use crate::{FromUrl, FromUrlWithScheme, pipeline::FrameResult};

/// 每个检测输出一行 `info!` 日志
///
/// `log://`，带 `always` 参数时没有检测的帧也会输出。
#[derive(Debug, Default)]
pub struct LogOutput {
  always: bool,
}

impl FromUrlWithScheme for LogOutput {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogOutput {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch(url.scheme().to_string()));
    }
    Ok(LogOutput {
      always: url.query_pairs().any(|(k, _)| k == "always"),
    })
  }
}

impl Render<RgbImage, FrameResult> for LogOutput {
  type Error = OutputError;

  fn render_result(&self, _frame: &RgbImage, result: &FrameResult) -> Result<(), Self::Error> {
    if result.is_empty() {
      if self.always {
        info!("区域 {:?} 内没有检测到装甲板", result.roi);
      }
      return Ok(());
    }

    for (i, armor) in result.detections.iter().enumerate() {
      let det = &armor.detection;
      match &armor.pose {
        Some(pose) => info!(
          "[{}] 类别 {} 颜色 {:?} 置信度 {:.3} 框 {:?} 距离 {:.1} pitch {:.2} yaw {:.2} roll {:.2}",
          i,
          det.class_id,
          det.color,
          det.confidence,
          det.bbox,
          pose.distance,
          pose.pitch,
          pose.yaw,
          pose.roll
        ),
        None => info!(
          "[{}] 类别 {} 颜色 {:?} 置信度 {:.3} 框 {:?}",
          i, det.class_id, det.color, det.confidence, det.bbox
        ),
      }
    }
    Ok(())
  }
}
