// 该文件是 Shanan （山南西风） 项目的一部分。
// src/inference.rs - 推理运行时边界
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

use std::{fmt, str::FromStr, sync::Mutex};

use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, model::OutputTensor};

mod replay;
pub use self::replay::ReplayBackend;

#[cfg(feature = "rknpu")]
mod rknn;
#[cfg(feature = "rknpu")]
pub use self::rknn::RknnBackend;

#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("URI 参数无效: {0}")]
  InvalidUrl(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("输出张量形状不匹配: 期望 {expected:?}, 实际长度 {actual}")]
  OutputMismatch { expected: (usize, usize), actual: usize },
  #[error("推理前未绑定输入")]
  InputNotBound,
  #[error("推理会话锁已中毒")]
  Poisoned,
  #[cfg(feature = "rknpu")]
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, rknpu::Error),
  #[cfg(feature = "rknpu")]
  #[error("RKNN 错误: {0}")]
  RknnError(rknpu::Error),
}

/// 推理运行时：绑定一帧输入、执行、读出单个二维输出张量
pub trait InferenceBackend {
  /// 模型声明的输出形状 `(rows, cols)`
  fn output_shape(&self) -> (usize, usize);
  fn bind_input(&mut self, input: &[u8]) -> Result<(), InferenceError>;
  fn run(&mut self) -> Result<OutputTensor, InferenceError>;
}

/// 对推理运行时的串行访问
///
/// 运行时一次只能处理一帧，绑定、执行与读出在同一把锁内完成。
pub struct InferenceSession<B> {
  backend: Mutex<B>,
  output_shape: (usize, usize),
}

impl<B: InferenceBackend> InferenceSession<B> {
  pub fn new(backend: B) -> Self {
    let output_shape = backend.output_shape();
    Self {
      backend: Mutex::new(backend),
      output_shape,
    }
  }

  pub fn output_shape(&self) -> (usize, usize) {
    self.output_shape
  }

  /// `input` 为 NHWC 排布的 RGB `u8` 数据
  pub fn infer(&self, input: &[u8]) -> Result<OutputTensor, InferenceError> {
    let mut backend = self
      .backend
      .lock()
      .map_err(|_| InferenceError::Poisoned)?;
    debug!("绑定模型输入, {} 字节", input.len());
    backend.bind_input(input)?;
    backend.run()
  }
}

/// 由 URL 选择的推理运行时
pub enum BackendWrapper {
  Replay(ReplayBackend),
  #[cfg(feature = "rknpu")]
  Rknn(RknnBackend),
}

impl FromUrl for BackendWrapper {
  type Error = InferenceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      ReplayBackend::SCHEME => Ok(BackendWrapper::Replay(ReplayBackend::from_url(url)?)),
      #[cfg(feature = "rknpu")]
      RknnBackend::SCHEME => Ok(BackendWrapper::Rknn(RknnBackend::from_url(url)?)),
      other => Err(InferenceError::SchemeMismatch(other.to_string())),
    }
  }
}

impl InferenceBackend for BackendWrapper {
  fn output_shape(&self) -> (usize, usize) {
    match self {
      BackendWrapper::Replay(b) => b.output_shape(),
      #[cfg(feature = "rknpu")]
      BackendWrapper::Rknn(b) => b.output_shape(),
    }
  }

  fn bind_input(&mut self, input: &[u8]) -> Result<(), InferenceError> {
    match self {
      BackendWrapper::Replay(b) => b.bind_input(input),
      #[cfg(feature = "rknpu")]
      BackendWrapper::Rknn(b) => b.bind_input(input),
    }
  }

  fn run(&mut self) -> Result<OutputTensor, InferenceError> {
    match self {
      BackendWrapper::Replay(b) => b.run(),
      #[cfg(feature = "rknpu")]
      BackendWrapper::Rknn(b) => b.run(),
    }
  }
}

/// NPU 核心选择，取值与 RKNN 核心掩码一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NpuCore {
  /// 由驱动调度
  #[default]
  Auto,
  Core0,
  Core1,
  Core2,
  Core01,
  Core012,
}

impl NpuCore {
  pub const NAMES: [&'static str; 6] = ["npu", "npu0", "npu1", "npu2", "npu01", "npu012"];

  pub fn mask(self) -> u32 {
    match self {
      NpuCore::Auto => 0,
      NpuCore::Core0 => 1,
      NpuCore::Core1 => 2,
      NpuCore::Core2 => 4,
      NpuCore::Core01 => 3,
      NpuCore::Core012 => 7,
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      NpuCore::Auto => "npu",
      NpuCore::Core0 => "npu0",
      NpuCore::Core1 => "npu1",
      NpuCore::Core2 => "npu2",
      NpuCore::Core01 => "npu01",
      NpuCore::Core012 => "npu012",
    }
  }
}

impl FromStr for NpuCore {
  type Err = InferenceError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "npu" | "auto" => Ok(NpuCore::Auto),
      "npu0" => Ok(NpuCore::Core0),
      "npu1" => Ok(NpuCore::Core1),
      "npu2" => Ok(NpuCore::Core2),
      "npu01" => Ok(NpuCore::Core01),
      "npu012" | "npu_all" => Ok(NpuCore::Core012),
      other => Err(InferenceError::InvalidUrl(format!(
        "不支持的推理设备 {}, 可选 {}",
        other,
        NpuCore::NAMES.join(", ")
      ))),
    }
  }
}

impl fmt::Display for NpuCore {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// 解析 `?core=` 查询参数，缺省由驱动调度
pub(crate) fn core_from_url(url: &Url) -> Result<NpuCore, InferenceError> {
  match url.query_pairs().find(|(k, _)| k == "core") {
    Some((_, v)) => v.parse(),
    None => Ok(NpuCore::Auto),
  }
}

/// 解析 `?shape=RxC` 查询参数
pub(crate) fn shape_from_url(url: &Url) -> Result<(usize, usize), InferenceError> {
  let shape = url
    .query_pairs()
    .find(|(k, _)| k == "shape")
    .map(|(_, v)| v.into_owned())
    .ok_or_else(|| InferenceError::InvalidUrl("缺少 shape 参数".into()))?;

  let parsed = shape
    .split_once(['x', 'X'])
    .and_then(|(r, c)| Some((r.trim().parse().ok()?, c.trim().parse().ok()?)));
  match parsed {
    Some((rows, cols)) if rows > 0 && cols > 0 => Ok((rows, cols)),
    _ => Err(InferenceError::InvalidUrl(format!(
      "shape 参数应为 RxC, 实际为 {}",
      shape
    ))),
  }
}
