// 该文件是 Shanan （山南西风） 项目的一部分。
// src/inference/replay.rs - 离线张量回放
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

use tracing::{debug, error, info};
use url::Url;

use super::{InferenceBackend, InferenceError, shape_from_url};
use crate::{FromUrl, FromUrlWithScheme, model::OutputTensor};

/// 对每一帧都返回同一个预先录制的输出张量
///
/// 文件为小端 `f32` 的行主序数据，形状由 URL 的 `shape` 参数给出：
/// `tensor:///path/to/output.bin?shape=25200x22`。
#[derive(Debug, Clone)]
pub struct ReplayBackend {
  tensor: OutputTensor,
  bound: bool,
}

impl ReplayBackend {
  pub fn new(tensor: OutputTensor) -> Self {
    Self {
      tensor,
      bound: false,
    }
  }

  pub fn from_le_bytes(rows: usize, cols: usize, bytes: &[u8]) -> Result<Self, InferenceError> {
    if bytes.len() != rows * cols * 4 {
      return Err(InferenceError::OutputMismatch {
        expected: (rows, cols),
        actual: bytes.len() / 4,
      });
    }
    let data = bytes
      .chunks_exact(4)
      .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
      .collect();
    let tensor = OutputTensor::new(rows, cols, data).map_err(|_| InferenceError::OutputMismatch {
      expected: (rows, cols),
      actual: bytes.len() / 4,
    })?;
    Ok(Self::new(tensor))
  }
}

impl FromUrlWithScheme for ReplayBackend {
  const SCHEME: &'static str = "tensor";
}

impl FromUrl for ReplayBackend {
  type Error = InferenceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(InferenceError::SchemeMismatch(url.scheme().to_string()));
    }

    let (rows, cols) = shape_from_url(url)?;
    info!("加载回放张量: {} ({}x{})", url.path(), rows, cols);
    let bytes = std::fs::read(url.path())?;
    debug!("张量文件大小: {} 字节", bytes.len());
    Self::from_le_bytes(rows, cols, &bytes)
  }
}

impl InferenceBackend for ReplayBackend {
  fn output_shape(&self) -> (usize, usize) {
    self.tensor.shape()
  }

  fn bind_input(&mut self, _input: &[u8]) -> Result<(), InferenceError> {
    self.bound = true;
    Ok(())
  }

  fn run(&mut self) -> Result<OutputTensor, InferenceError> {
    if !std::mem::take(&mut self.bound) {
      return Err(InferenceError::InputNotBound);
    }
    Ok(self.tensor.clone())
  }
}
