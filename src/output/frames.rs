// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/frames.rs - 逐帧保存图像
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

use std::{
  path::{Path, PathBuf},
  sync::Mutex,
};

use image::RgbImage;
use tracing::debug;
use url::Url;

use super::{OutputError, Render};
use crate::{FromUrl, FromUrlWithScheme, pipeline::FrameResult};

/// 把原始帧依次保存为 `0.jpg`、`1.jpg`……，用于采集标定或回放素材
///
/// `dir:///path/to/frames`，带 `detected` 参数时只保存有检测的帧。
pub struct FrameDirectoryOutput {
  directory: PathBuf,
  detected_only: bool,
  counter: Mutex<u64>,
}

impl FromUrlWithScheme for FrameDirectoryOutput {
  const SCHEME: &'static str = "dir";
}

impl FromUrl for FrameDirectoryOutput {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch(url.scheme().to_string()));
    }
    let mut output = Self::create(Path::new(url.path()))?;
    output.detected_only = url.query_pairs().any(|(k, _)| k == "detected");
    Ok(output)
  }
}

impl FrameDirectoryOutput {
  pub fn create(directory: &Path) -> Result<Self, OutputError> {
    std::fs::create_dir_all(directory)?;
    Ok(Self {
      directory: directory.to_path_buf(),
      detected_only: false,
      counter: Mutex::new(0),
    })
  }

  fn next_path(&self) -> Result<PathBuf, OutputError> {
    let mut counter = self.counter.lock().map_err(|_| OutputError::Poisoned)?;
    let path = self.directory.join(format!("{}.jpg", *counter));
    *counter += 1;
    Ok(path)
  }
}

impl Render<RgbImage, FrameResult> for FrameDirectoryOutput {
  type Error = OutputError;

  fn render_result(&self, frame: &RgbImage, result: &FrameResult) -> Result<(), Self::Error> {
    if self.detected_only && result.is_empty() {
      return Ok(());
    }
    let path = self.next_path()?;
    frame.save(&path)?;
    debug!("保存帧: {}", path.display());
    Ok(())
  }
}
