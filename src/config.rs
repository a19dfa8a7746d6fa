// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 配置文件
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

use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use thiserror::Error;
use tracing::error;
use url::Url;

use crate::{
  camera::{DEFAULT_EXPOSURE_US, DEFAULT_GAIN, DEFAULT_GRAB_TIMEOUT},
  geometry::Rect,
  inference::{InferenceError, NpuCore},
  model::{
    AnchorBoxConfig, AnchorBoxDetector, DecodeError, DetectorKind, DetectorWrapper, FourPointConfig,
    FourPointOnlyDetector,
  },
  pose::{
    CameraCalibration, LARGE_ARMOR_SIZE, PoseError, PoseEstimator, SMALL_ARMOR_SIZE, TargetModel,
  },
};

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("配置解析错误: {0}")]
  ParseError(#[from] toml::de::Error),
  #[error("模型 URL 无效: {0}")]
  UrlError(#[from] url::ParseError),
  #[error("检测器配置无效: {0}")]
  DecodeError(#[from] DecodeError),
  #[error("位姿配置无效: {0}")]
  PoseError(#[from] PoseError),
  #[error("推理配置无效: {0}")]
  InferenceError(#[from] InferenceError),
  #[error("配置无效: {0}")]
  Invalid(String),
}

#[derive(Debug, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub model: ModelConfig,
  #[serde(default)]
  pub detector: DetectorOverrides,
  #[serde(default)]
  pub target: TargetConfig,
  #[serde(default)]
  pub camera: CalibrationConfig,
  #[serde(default)]
  pub capture: CaptureConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
  /// 推理运行时 URL，`rknn:///…?shape=RxC` 或 `tensor:///…?shape=RxC`
  #[serde(default = "default_model_path")]
  pub path: String,
  /// NPU 核心：`npu`（自动）、`npu0`、`npu1`、`npu2`、`npu01`、`npu012`
  #[serde(default = "default_device")]
  pub device: String,
  #[serde(default)]
  pub kind: DetectorKind,
}

fn default_model_path() -> String {
  "rknn:///opt/shanan/armor.rknn?shape=25200x22".to_string()
}
fn default_device() -> String {
  "npu".to_string()
}

impl Default for ModelConfig {
  fn default() -> Self {
    Self {
      path: default_model_path(),
      device: default_device(),
      kind: DetectorKind::default(),
    }
  }
}

/// 覆盖检测器默认值，未给出的字段沿用所选编码的默认值
#[derive(Debug, Default, Deserialize, Clone)]
pub struct DetectorOverrides {
  pub input_size: Option<u32>,
  pub anchors: Option<usize>,
  pub channels: Option<usize>,
  pub class_confidence: Option<f32>,
  pub box_confidence: Option<f32>,
  pub nms_iou: Option<f32>,
  /// 负数表示不排除任何类别
  pub excluded_class: Option<i64>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetPreset {
  Large,
  Small,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct TargetConfig {
  pub preset: Option<TargetPreset>,
  /// 毫米，优先于 `preset`
  pub width: Option<f64>,
  pub height: Option<f64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CalibrationConfig {
  /// 3x3 内参矩阵，行主序
  #[serde(default = "default_camera_matrix")]
  pub matrix: [[f64; 3]; 3],
  /// k1, k2, p1, p2, k3[, k4, k5, k6]
  #[serde(default = "default_distortion")]
  pub distortion: Vec<f64>,
}

fn default_camera_matrix() -> [[f64; 3]; 3] {
  [
    [2.3331e+03, -1.6808, 690.8069],
    [0.0, 2.3271e+03, 554.0654],
    [0.0, 0.0, 1.0],
  ]
}
fn default_distortion() -> Vec<f64> {
  vec![-0.1382, 0.5323, 0.0012, -0.0023, 0.0]
}

impl Default for CalibrationConfig {
  fn default() -> Self {
    Self {
      matrix: default_camera_matrix(),
      distortion: default_distortion(),
    }
  }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
  #[serde(default = "default_exposure_us")]
  pub exposure_us: u32,
  #[serde(default = "default_gain")]
  pub gain: f32,
  #[serde(default = "default_grab_timeout_ms")]
  pub grab_timeout_ms: u64,
  /// `[x, y, width, height]`，缺省为整幅图像
  pub roi: Option<[i32; 4]>,
}

fn default_exposure_us() -> u32 {
  DEFAULT_EXPOSURE_US
}
fn default_gain() -> f32 {
  DEFAULT_GAIN
}
fn default_grab_timeout_ms() -> u64 {
  DEFAULT_GRAB_TIMEOUT.as_millis() as u64
}

impl Default for CaptureConfig {
  fn default() -> Self {
    Self {
      exposure_us: default_exposure_us(),
      gain: default_gain(),
      grab_timeout_ms: default_grab_timeout_ms(),
      roi: None,
    }
  }
}

impl CaptureConfig {
  pub fn grab_timeout(&self) -> Duration {
    Duration::from_millis(self.grab_timeout_ms)
  }

  pub fn roi(&self) -> Option<Rect> {
    self.roi.map(|[x, y, w, h]| Rect::new(x, y, w, h))
  }
}

impl Config {
  /// 读取并校验配置文件
  pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
    let content = fs::read_to_string(path)?;
    Self::parse(&content)
  }

  pub fn parse(content: &str) -> Result<Self, ConfigError> {
    let config: Config = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    let checks = || -> Result<(), ConfigError> {
      self.model_url()?;
      self.detector()?;
      self.pose_estimator()?;
      if !(self.capture.gain.is_finite() && self.capture.gain >= 0.0) {
        return Err(ConfigError::Invalid(format!(
          "增益必须为非负数, 实际为 {}",
          self.capture.gain
        )));
      }
      if let Some(roi) = self.capture.roi()
        && roi.is_empty()
      {
        return Err(ConfigError::Invalid(format!("感兴趣区域为空: {:?}", roi)));
      }
      Ok(())
    };
    checks().inspect_err(|e| error!("配置校验失败: {}", e))
  }

  pub fn npu_core(&self) -> Result<NpuCore, ConfigError> {
    Ok(self.model.device.parse()?)
  }

  /// 模型 URL，未显式给出 `core` 时按 `device` 补上
  pub fn model_url(&self) -> Result<Url, ConfigError> {
    let mut url = Url::parse(&self.model.path)?;
    let core = self.npu_core()?;
    if core != NpuCore::Auto && !url.query_pairs().any(|(k, _)| k == "core") {
      url.query_pairs_mut().append_pair("core", core.name());
    }
    Ok(url)
  }

  pub fn detector(&self) -> Result<DetectorWrapper, ConfigError> {
    let o = &self.detector;
    let detector = match self.model.kind {
      DetectorKind::AnchorBox => {
        let defaults = AnchorBoxConfig::default();
        AnchorBoxDetector::new(AnchorBoxConfig {
          input_size: o.input_size.unwrap_or(defaults.input_size),
          anchors: o.anchors.unwrap_or(defaults.anchors),
          channels: o.channels.unwrap_or(defaults.channels),
          class_confidence: o.class_confidence.unwrap_or(defaults.class_confidence),
          nms_iou: o.nms_iou.unwrap_or(defaults.nms_iou),
        })?
        .into()
      }
      DetectorKind::FourPoint => {
        let defaults = FourPointConfig::default();
        let excluded_class = match o.excluded_class {
          Some(c) if c < 0 => None,
          Some(c) => Some(c as usize),
          None => defaults.excluded_class,
        };
        FourPointOnlyDetector::new(FourPointConfig {
          input_size: o.input_size.unwrap_or(defaults.input_size),
          anchors: o.anchors.unwrap_or(defaults.anchors),
          channels: o.channels.unwrap_or(defaults.channels),
          box_confidence: o.box_confidence.unwrap_or(defaults.box_confidence),
          class_confidence: o.class_confidence.unwrap_or(defaults.class_confidence),
          nms_iou: o.nms_iou.unwrap_or(defaults.nms_iou),
          excluded_class,
        })?
        .into()
      }
    };
    Ok(detector)
  }

  pub fn target_model(&self) -> Result<TargetModel, ConfigError> {
    let (preset_width, preset_height) = match self.target.preset {
      Some(TargetPreset::Small) => SMALL_ARMOR_SIZE,
      Some(TargetPreset::Large) | None => LARGE_ARMOR_SIZE,
    };
    Ok(TargetModel::new(
      self.target.width.unwrap_or(preset_width),
      self.target.height.unwrap_or(preset_height),
    )?)
  }

  pub fn pose_estimator(&self) -> Result<PoseEstimator, ConfigError> {
    let calibration = CameraCalibration::new(self.camera.matrix, &self.camera.distortion)?;
    Ok(PoseEstimator::new(self.target_model()?, calibration))
  }
}
