// 该文件是 Shanan （山南西风） 项目的一部分。
// src/inference/rknn.rs - RKNN NPU 推理运行时
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

use rknpu::{Context, InitFlags, TensorType};
use tracing::{debug, error, info};
use url::Url;

use super::{InferenceBackend, InferenceError, NpuCore, core_from_url, shape_from_url};
use crate::{FromUrl, FromUrlWithScheme, model::OutputTensor};

const RKNN_NUM_INPUTS: u32 = 1;
const RKNN_NUM_OUTPUTS: u32 = 1;

impl From<rknpu::Error> for InferenceError {
  fn from(err: rknpu::Error) -> Self {
    InferenceError::RknnError(err)
  }
}

impl InferenceError {
  pub fn invalid(msg: &str, e: rknpu::Error) -> Self {
    InferenceError::ModelInvalid(msg.to_string(), e)
  }
}

/// 单输入单输出的 RKNN 模型
///
/// `rknn:///path/to/armor.rknn?shape=25200x22&core=npu0`，`shape` 为模型输出的二维形状，
/// `core` 为可选的 NPU 核心。
pub struct RknnBackend {
  context: Context,
  output_shape: (usize, usize),
  bound: bool,
}

impl FromUrlWithScheme for RknnBackend {
  const SCHEME: &'static str = "rknn";
}

impl FromUrl for RknnBackend {
  type Error = InferenceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(InferenceError::SchemeMismatch(url.scheme().to_string()));
    }
    let output_shape = shape_from_url(url)?;
    let core = core_from_url(url)?;
    Self::load(url.path(), output_shape, InitFlags::default(), core)
  }
}

impl RknnBackend {
  pub fn load(
    model_path: &str,
    output_shape: (usize, usize),
    flags: InitFlags,
    core: NpuCore,
  ) -> Result<Self, InferenceError> {
    info!("加载模型文件: {}", model_path);
    let model_data = std::fs::read(model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&model_data, flags)?;
    if core != NpuCore::Auto {
      info!("绑定 NPU 核心: {} (掩码 {:#x})", core, core.mask());
      context.set_core_mask(core.mask())?;
    }

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!("查询 SDK 版本失败: {}", e);
        return Err(InferenceError::invalid("无法查询 SDK 版本", e));
      }
    }

    let num_inputs = context
      .num_inputs()
      .map_err(|e| InferenceError::invalid("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| InferenceError::invalid("无法获取输出数量", e))?;

    if num_inputs != RKNN_NUM_INPUTS || num_outputs != RKNN_NUM_OUTPUTS {
      let msg = format!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        RKNN_NUM_INPUTS, RKNN_NUM_OUTPUTS, num_inputs, num_outputs
      );
      error!("{}", msg);
      return Err(InferenceError::invalid(&msg, rknpu::Error::InvalidModel));
    }

    info!("模型加载完成, 输出形状 {:?}", output_shape);
    Ok(Self {
      context,
      output_shape,
      bound: false,
    })
  }
}

impl InferenceBackend for RknnBackend {
  fn output_shape(&self) -> (usize, usize) {
    self.output_shape
  }

  fn bind_input(&mut self, input: &[u8]) -> Result<(), InferenceError> {
    self
      .context
      .set_input(0, input, rknpu::TensorFormat::NHWC, TensorType::UInt8)?;
    self.bound = true;
    Ok(())
  }

  fn run(&mut self) -> Result<OutputTensor, InferenceError> {
    if !std::mem::take(&mut self.bound) {
      return Err(InferenceError::InputNotBound);
    }
    self.context.run()?;

    let output = self.context.get_outputs()?;
    let data = output.get_f32(0)?;
    let (rows, cols) = self.output_shape;
    OutputTensor::new(rows, cols, data.to_vec()).map_err(|_| InferenceError::OutputMismatch {
      expected: self.output_shape,
      actual: data.len(),
    })
  }
}
