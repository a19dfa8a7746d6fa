// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/four_point.rs - 四点模型解码
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

use std::ops::Range;

use tracing::debug;

use super::{
  DecodeError, Detection, Detector, KeypointPolicy, OutputTensor, TensorLayout, arg_max,
  check_threshold, sigmoid,
};
use crate::{
  geometry::{Keypoint, Rect},
  letterbox::Letterbox,
};

const FOUR_POINT_NUM_KEYPOINTS: usize = 4;
const FOUR_POINT_OBJECTNESS_COL: usize = 8;
/// 颜色得分，第 12 列（紫色）不参与
const FOUR_POINT_COLOR_COLS: Range<usize> = 9..12;
const FOUR_POINT_CLASS_COLS: Range<usize> = 13..22;

/// 四点模型默认排除的类别编号
pub const FOUR_POINT_EXCLUDED_CLASS: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct FourPointConfig {
  pub input_size: u32,
  pub anchors: usize,
  pub channels: usize,
  /// 先验框置信度阈值（sigmoid 之后）
  pub box_confidence: f32,
  pub class_confidence: f32,
  pub nms_iou: f32,
  /// 被整体排除的类别，`None` 表示不排除
  pub excluded_class: Option<usize>,
}

impl Default for FourPointConfig {
  fn default() -> Self {
    Self {
      input_size: 640,
      anchors: 25200,
      channels: 22,
      box_confidence: 0.65,
      class_confidence: 0.5,
      nms_iou: 0.4,
      excluded_class: Some(FOUR_POINT_EXCLUDED_CLASS),
    }
  }
}

/// 输出布局为 `[anchors, channels]` 的纯四点模型
///
/// 每个锚框：`0..8` 为四个角点的 `(x, y)`，`8` 为目标置信度 logit，
/// `9..12` 为颜色得分，`13..22` 为类别得分。该编码没有原生的框。
#[derive(Debug, Clone)]
pub struct FourPointOnlyDetector {
  config: FourPointConfig,
}

impl FourPointOnlyDetector {
  pub fn new(config: FourPointConfig) -> Result<Self, DecodeError> {
    if config.channels < FOUR_POINT_CLASS_COLS.end {
      return Err(DecodeError::InvalidConfig(format!(
        "通道数至少为 {}, 实际为 {}",
        FOUR_POINT_CLASS_COLS.end, config.channels
      )));
    }
    if config.input_size == 0 || config.anchors == 0 {
      return Err(DecodeError::InvalidConfig("输入尺寸与锚框数目必须为正".into()));
    }
    check_threshold("box_confidence", config.box_confidence)?;
    check_threshold("class_confidence", config.class_confidence)?;
    check_threshold("nms_iou", config.nms_iou)?;
    Ok(Self { config })
  }

  pub fn config(&self) -> &FourPointConfig {
    &self.config
  }
}

impl Detector for FourPointOnlyDetector {
  fn layout(&self) -> TensorLayout {
    TensorLayout::AnchorsFirst {
      anchors: self.config.anchors,
      channels: self.config.channels,
    }
  }

  fn input_size(&self) -> u32 {
    self.config.input_size
  }

  fn class_confidence(&self) -> f32 {
    self.config.class_confidence
  }

  fn nms_iou(&self) -> f32 {
    self.config.nms_iou
  }

  fn keypoint_policy(&self) -> KeypointPolicy {
    KeypointPolicy::RequireInside
  }

  fn decode(
    &self,
    tensor: &OutputTensor,
    letterbox: &Letterbox,
  ) -> Result<Vec<Detection>, DecodeError> {
    self.layout().check(tensor)?;

    let mut candidates = Vec::new();
    'anchors: for anchor in 0..self.config.anchors {
      let row = tensor.row(anchor);

      let box_confidence = sigmoid(row[FOUR_POINT_OBJECTNESS_COL]);
      if box_confidence.is_nan() || box_confidence < self.config.box_confidence {
        continue;
      }
      if !row[..2 * FOUR_POINT_NUM_KEYPOINTS].iter().all(|v| v.is_finite()) {
        continue;
      }

      let (Some((color, _)), Some((class_id, class_score))) = (
        arg_max(row[FOUR_POINT_COLOR_COLS].iter().copied()),
        arg_max(row[FOUR_POINT_CLASS_COLS].iter().copied()),
      ) else {
        continue;
      };
      if self.config.excluded_class == Some(class_id) {
        continue;
      }

      let confidence = box_confidence * sigmoid(class_score);
      if confidence.is_nan() || confidence < self.config.class_confidence {
        continue;
      }

      // 四个角点必须全部落在感兴趣区域内
      let mut keypoints = [Keypoint::new(0, 0, 1.0); FOUR_POINT_NUM_KEYPOINTS];
      for (k, keypoint) in keypoints.iter_mut().enumerate() {
        let (x, y) = letterbox.to_source_pixel(row[2 * k], row[2 * k + 1]);
        if !letterbox.contains_source(x, y) {
          continue 'anchors;
        }
        *keypoint = Keypoint::new(x, y, 1.0);
      }

      let Some(bbox) = Rect::bounding(keypoints.iter().map(|k| (k.x, k.y))) else {
        continue;
      };

      candidates.push(Detection {
        class_id: class_id as i32,
        color: Some(color as u32),
        confidence,
        bbox,
        keypoints: Some(keypoints),
      });
    }

    debug!("解码得到 {} 个候选", candidates.len());
    Ok(candidates)
  }
}
