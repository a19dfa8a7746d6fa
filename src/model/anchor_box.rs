// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/anchor_box.rs - 带框关键点模型解码
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
  check_threshold,
};
use crate::{
  geometry::{Keypoint, Rect},
  letterbox::Letterbox,
};

/// 类别置信度所在的通道
const ANCHOR_BOX_CLASS_ROWS: Range<usize> = 4..14;
/// 第一个关键点所在的通道，每个关键点占 (x, y, conf) 三个通道
const ANCHOR_BOX_KEYPOINT_ROW: usize = 14;
const ANCHOR_BOX_KEYPOINT_STRIDE: usize = 3;
const ANCHOR_BOX_NUM_KEYPOINTS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct AnchorBoxConfig {
  pub input_size: u32,
  pub anchors: usize,
  pub channels: usize,
  pub class_confidence: f32,
  pub nms_iou: f32,
}

impl Default for AnchorBoxConfig {
  fn default() -> Self {
    Self {
      input_size: 320,
      anchors: 2100,
      channels: 26,
      class_confidence: 0.5,
      nms_iou: 0.4,
    }
  }
}

/// 输出布局为 `[channels, anchors]` 的框 + 四关键点模型
///
/// 每个锚框：`0..4` 为中心点与宽高，`4..14` 为类别置信度，
/// 之后依次是四个关键点的 `(x, y, conf)`。
#[derive(Debug, Clone)]
pub struct AnchorBoxDetector {
  config: AnchorBoxConfig,
}

impl AnchorBoxDetector {
  pub fn new(config: AnchorBoxConfig) -> Result<Self, DecodeError> {
    let required = ANCHOR_BOX_KEYPOINT_ROW + ANCHOR_BOX_NUM_KEYPOINTS * ANCHOR_BOX_KEYPOINT_STRIDE;
    if config.channels < required {
      return Err(DecodeError::InvalidConfig(format!(
        "通道数至少为 {}, 实际为 {}",
        required, config.channels
      )));
    }
    if config.input_size == 0 || config.anchors == 0 {
      return Err(DecodeError::InvalidConfig("输入尺寸与锚框数目必须为正".into()));
    }
    check_threshold("class_confidence", config.class_confidence)?;
    check_threshold("nms_iou", config.nms_iou)?;
    Ok(Self { config })
  }

  pub fn config(&self) -> &AnchorBoxConfig {
    &self.config
  }
}

impl Detector for AnchorBoxDetector {
  fn layout(&self) -> TensorLayout {
    TensorLayout::ChannelsFirst {
      channels: self.config.channels,
      anchors: self.config.anchors,
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
    KeypointPolicy::Clamp
  }

  fn decode(
    &self,
    tensor: &OutputTensor,
    letterbox: &Letterbox,
  ) -> Result<Vec<Detection>, DecodeError> {
    self.layout().check(tensor)?;

    let mut candidates = Vec::new();
    for anchor in 0..self.config.anchors {
      let Some((class_id, class_conf)) =
        arg_max(ANCHOR_BOX_CLASS_ROWS.map(|row| tensor.at(row, anchor)))
      else {
        continue;
      };

      if class_conf < self.config.class_confidence {
        continue;
      }

      let cx = tensor.at(0, anchor);
      let cy = tensor.at(1, anchor);
      let w = tensor.at(2, anchor);
      let h = tensor.at(3, anchor);
      let keypoint_finite = (0..ANCHOR_BOX_NUM_KEYPOINTS).all(|k| {
        let row = ANCHOR_BOX_KEYPOINT_ROW + k * ANCHOR_BOX_KEYPOINT_STRIDE;
        tensor.at(row, anchor).is_finite() && tensor.at(row + 1, anchor).is_finite()
      });
      if !([cx, cy, w, h].iter().all(|v| v.is_finite()) && keypoint_finite) {
        continue;
      }

      let (left, top) = letterbox.to_source_pixel(cx - 0.5 * w, cy - 0.5 * h);
      let bbox = Rect::new(
        left,
        top,
        letterbox.round_length(w),
        letterbox.round_length(h),
      );

      let keypoints: [Keypoint; ANCHOR_BOX_NUM_KEYPOINTS] = std::array::from_fn(|k| {
        let row = ANCHOR_BOX_KEYPOINT_ROW + k * ANCHOR_BOX_KEYPOINT_STRIDE;
        let (x, y) = letterbox.to_source_pixel(tensor.at(row, anchor), tensor.at(row + 1, anchor));
        Keypoint::new(x, y, tensor.at(row + 2, anchor))
      });

      candidates.push(Detection {
        class_id: class_id as i32,
        color: None,
        confidence: class_conf,
        bbox,
        keypoints: Some(keypoints),
      });
    }

    debug!("解码得到 {} 个候选", candidates.len());
    Ok(candidates)
  }
}
