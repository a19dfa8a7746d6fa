// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型输出解码
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

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
  geometry::{Keypoint, Rect},
  letterbox::Letterbox,
};

mod anchor_box;
mod four_point;
pub mod nms;
pub mod remap;

pub use self::anchor_box::{AnchorBoxConfig, AnchorBoxDetector};
pub use self::four_point::{FourPointConfig, FourPointOnlyDetector};
pub use self::remap::KeypointPolicy;

/// 装甲板检测结果
///
/// 角点顺序固定为 左上、左下、右下、右上。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  /// 类别，-1 表示未设置
  pub class_id: i32,
  /// 颜色类别（仅四点模型输出）
  pub color: Option<u32>,
  pub confidence: f32,
  pub bbox: Rect,
  pub keypoints: Option<[Keypoint; 4]>,
}

impl Default for Detection {
  fn default() -> Self {
    Self {
      class_id: -1,
      color: None,
      confidence: 0.0,
      bbox: Rect::default(),
      keypoints: None,
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
  #[error("输出张量形状不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  ShapeMismatch {
    expected: (usize, usize),
    actual: (usize, usize),
  },
  #[error("输出张量长度不匹配: 期望 {expected}, 实际 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("解码器配置无效: {0}")]
  InvalidConfig(String),
}

/// 稠密二维输出张量（行主序）
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
  rows: usize,
  cols: usize,
  data: Box<[f32]>,
}

impl OutputTensor {
  pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self, DecodeError> {
    if data.len() != rows * cols {
      return Err(DecodeError::LengthMismatch {
        expected: rows * cols,
        actual: data.len(),
      });
    }
    Ok(Self {
      rows,
      cols,
      data: data.into_boxed_slice(),
    })
  }

  pub fn zeros(rows: usize, cols: usize) -> Self {
    Self {
      rows,
      cols,
      data: vec![0.0; rows * cols].into_boxed_slice(),
    }
  }

  pub fn shape(&self) -> (usize, usize) {
    (self.rows, self.cols)
  }

  pub fn at(&self, row: usize, col: usize) -> f32 {
    self.data[row * self.cols + col]
  }

  pub fn set(&mut self, row: usize, col: usize, value: f32) {
    self.data[row * self.cols + col] = value;
  }

  pub fn row(&self, row: usize) -> &[f32] {
    &self.data[row * self.cols..(row + 1) * self.cols]
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }
}

/// 模型声明的输出布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
  /// `[channels, anchors]`，每列一个锚框
  ChannelsFirst { channels: usize, anchors: usize },
  /// `[anchors, channels]`，每行一个锚框
  AnchorsFirst { anchors: usize, channels: usize },
}

impl TensorLayout {
  pub fn shape(&self) -> (usize, usize) {
    match *self {
      TensorLayout::ChannelsFirst { channels, anchors } => (channels, anchors),
      TensorLayout::AnchorsFirst { anchors, channels } => (anchors, channels),
    }
  }

  pub fn check(&self, tensor: &OutputTensor) -> Result<(), DecodeError> {
    if tensor.shape() != self.shape() {
      return Err(DecodeError::ShapeMismatch {
        expected: self.shape(),
        actual: tensor.shape(),
      });
    }
    Ok(())
  }
}

/// 检测器能力：将一个输出张量解码为候选检测
pub trait Detector {
  fn layout(&self) -> TensorLayout;
  /// 模型输入的正方形边长
  fn input_size(&self) -> u32;
  /// 类别置信度阈值，同时作为 NMS 的门限
  fn class_confidence(&self) -> f32;
  fn nms_iou(&self) -> f32;
  fn keypoint_policy(&self) -> KeypointPolicy;

  /// 解码所有候选，坐标为感兴趣区域内的像素坐标
  ///
  /// 没有锚框通过阈值时返回空列表。
  fn decode(
    &self,
    tensor: &OutputTensor,
    letterbox: &Letterbox,
  ) -> Result<Vec<Detection>, DecodeError>;
}

/// 模型输出编码类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
  /// 带框与关键点置信度的输出（yolov8-pose 类）
  AnchorBox,
  /// 仅四角点的输出（yolov5 四点类）
  #[default]
  FourPoint,
}

pub enum DetectorWrapper {
  AnchorBox(AnchorBoxDetector),
  FourPoint(FourPointOnlyDetector),
}

impl From<AnchorBoxDetector> for DetectorWrapper {
  fn from(detector: AnchorBoxDetector) -> Self {
    DetectorWrapper::AnchorBox(detector)
  }
}

impl From<FourPointOnlyDetector> for DetectorWrapper {
  fn from(detector: FourPointOnlyDetector) -> Self {
    DetectorWrapper::FourPoint(detector)
  }
}

impl DetectorWrapper {
  pub fn kind(&self) -> DetectorKind {
    match self {
      DetectorWrapper::AnchorBox(_) => DetectorKind::AnchorBox,
      DetectorWrapper::FourPoint(_) => DetectorKind::FourPoint,
    }
  }
}

impl Detector for DetectorWrapper {
  fn layout(&self) -> TensorLayout {
    match self {
      DetectorWrapper::AnchorBox(d) => d.layout(),
      DetectorWrapper::FourPoint(d) => d.layout(),
    }
  }

  fn input_size(&self) -> u32 {
    match self {
      DetectorWrapper::AnchorBox(d) => d.input_size(),
      DetectorWrapper::FourPoint(d) => d.input_size(),
    }
  }

  fn class_confidence(&self) -> f32 {
    match self {
      DetectorWrapper::AnchorBox(d) => d.class_confidence(),
      DetectorWrapper::FourPoint(d) => d.class_confidence(),
    }
  }

  fn nms_iou(&self) -> f32 {
    match self {
      DetectorWrapper::AnchorBox(d) => d.nms_iou(),
      DetectorWrapper::FourPoint(d) => d.nms_iou(),
    }
  }

  fn keypoint_policy(&self) -> KeypointPolicy {
    match self {
      DetectorWrapper::AnchorBox(d) => d.keypoint_policy(),
      DetectorWrapper::FourPoint(d) => d.keypoint_policy(),
    }
  }

  fn decode(
    &self,
    tensor: &OutputTensor,
    letterbox: &Letterbox,
  ) -> Result<Vec<Detection>, DecodeError> {
    match self {
      DetectorWrapper::AnchorBox(d) => d.decode(tensor, letterbox),
      DetectorWrapper::FourPoint(d) => d.decode(tensor, letterbox),
    }
  }
}

/// 数值稳定的 sigmoid
pub fn sigmoid(x: f32) -> f32 {
  if x > 0.0 {
    1.0 / (1.0 + (-x).exp())
  } else {
    let e = x.exp();
    e / (1.0 + e)
  }
}

/// 最大值及其索引，相等时取第一个
fn arg_max<I: IntoIterator<Item = f32>>(values: I) -> Option<(usize, f32)> {
  let mut best: Option<(usize, f32)> = None;
  for (idx, value) in values.into_iter().enumerate() {
    if !value.is_finite() {
      continue;
    }
    match best {
      Some((_, best_value)) if value <= best_value => {}
      _ => best = Some((idx, value)),
    }
  }
  best
}

fn check_threshold(name: &str, value: f32) -> Result<(), DecodeError> {
  if (0.0..=1.0).contains(&value) {
    Ok(())
  } else {
    Err(DecodeError::InvalidConfig(format!(
      "{} 必须位于 [0, 1], 实际为 {}",
      name, value
    )))
  }
}
