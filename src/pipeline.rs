// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline.rs - 单帧检测与位姿流水线
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

use std::time::Instant;

use image::{RgbImage, imageops};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  geometry::Rect,
  inference::{InferenceBackend, InferenceError, InferenceSession},
  letterbox::{Letterbox, LetterboxError},
  model::{DecodeError, Detection, Detector, DetectorWrapper, nms::nms, remap::remap},
  pose::{PoseEstimate, PoseEstimator},
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("模型输出形状 {actual:?} 与解码器期望 {expected:?} 不一致")]
  ShapeMismatch {
    expected: (usize, usize),
    actual: (usize, usize),
  },
  #[error("推理错误: {0}")]
  InferenceError(#[from] InferenceError),
  #[error("解码错误: {0}")]
  DecodeError(#[from] DecodeError),
  #[error("预处理错误: {0}")]
  LetterboxError(#[from] LetterboxError),
}

/// 一个装甲板检测及其位姿
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArmorDetection {
  #[serde(flatten)]
  pub detection: Detection,
  /// 未配置位姿解算或位姿无法确定时为空
  pub pose: Option<PoseEstimate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameResult {
  /// 实际参与检测的区域（请求区域与图像的交集）
  pub roi: Rect,
  pub detections: Vec<ArmorDetection>,
}

impl FrameResult {
  fn empty(roi: Rect) -> Self {
    Self {
      roi,
      detections: Vec::new(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.detections.is_empty()
  }

  pub fn len(&self) -> usize {
    self.detections.len()
  }
}

/// 裁剪 → 等比缩放 → 推理 → 解码 → NMS → 坐标还原 → 位姿
pub struct ArmorPipeline<B> {
  session: InferenceSession<B>,
  detector: DetectorWrapper,
  pose: Option<PoseEstimator>,
}

impl<B: InferenceBackend> ArmorPipeline<B> {
  pub fn new(backend: B, detector: DetectorWrapper) -> Result<Self, PipelineError> {
    let session = InferenceSession::new(backend);
    let expected = detector.layout().shape();
    if session.output_shape() != expected {
      return Err(PipelineError::ShapeMismatch {
        expected,
        actual: session.output_shape(),
      });
    }
    Ok(Self {
      session,
      detector,
      pose: None,
    })
  }

  pub fn with_pose_estimator(mut self, pose: PoseEstimator) -> Self {
    self.pose = Some(pose);
    self
  }

  pub fn detector(&self) -> &DetectorWrapper {
    &self.detector
  }

  pub fn pose_estimator(&self) -> Option<&PoseEstimator> {
    self.pose.as_ref()
  }

  /// 以整幅图像为感兴趣区域
  pub fn process_full(&self, image: &RgbImage) -> Result<FrameResult, PipelineError> {
    let (width, height) = image.dimensions();
    self.process(image, Rect::from_size(width, height))
  }

  /// 处理一帧
  ///
  /// 空帧、区域在图像外、区域过于狭长都只会得到空结果；只有推理失败或
  /// 输出与解码器不一致才返回错误。
  pub fn process(&self, image: &RgbImage, roi: Rect) -> Result<FrameResult, PipelineError> {
    let start = Instant::now();
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
      warn!("输入帧为空, 跳过");
      return Ok(FrameResult::empty(Rect::default()));
    }

    let region = roi.intersect(&Rect::from_size(width, height));
    if region.is_empty() {
      warn!("感兴趣区域 {:?} 位于 {}x{} 图像之外", roi, width, height);
      return Ok(FrameResult::empty(region));
    }

    let letterbox = match Letterbox::new(
      region.width as u32,
      region.height as u32,
      self.detector.input_size(),
    ) {
      Ok(letterbox) => letterbox,
      Err(e) => {
        warn!("跳过该帧: {}", e);
        return Ok(FrameResult::empty(region));
      }
    };

    let view = imageops::crop_imm(
      image,
      region.x as u32,
      region.y as u32,
      region.width as u32,
      region.height as u32,
    )
    .to_image();
    let input = letterbox.apply(&view)?;

    let tensor = self.session.infer(input.as_raw())?;
    let candidates = self.detector.decode(&tensor, &letterbox)?;
    let kept = nms(
      &candidates,
      self.detector.class_confidence(),
      self.detector.nms_iou(),
    );
    debug!("候选 {} 个, NMS 后保留 {} 个", candidates.len(), kept.len());

    let detections = remap(
      &candidates,
      &kept,
      &region,
      width,
      height,
      self.detector.keypoint_policy(),
    )
    .into_iter()
    .map(|detection| {
      let pose = self.solve_pose(&detection);
      ArmorDetection { detection, pose }
    })
    .collect::<Vec<_>>();

    debug!(
      "输出 {} 个检测, 耗时 {:.2?}",
      detections.len(),
      start.elapsed()
    );
    Ok(FrameResult {
      roi: region,
      detections,
    })
  }

  fn solve_pose(&self, detection: &Detection) -> Option<PoseEstimate> {
    let estimator = self.pose.as_ref()?;
    let keypoints = detection.keypoints.as_ref()?;
    match estimator.estimate(keypoints) {
      Ok(pose) => Some(pose),
      Err(e) => {
        warn!("位姿解算失败 {:?}: {}", detection.bbox, e);
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    inference::ReplayBackend,
    model::{AnchorBoxConfig, AnchorBoxDetector, FourPointConfig, FourPointOnlyDetector, OutputTensor},
  };

  fn four_point(anchors: usize) -> DetectorWrapper {
    FourPointOnlyDetector::new(FourPointConfig {
      anchors,
      ..FourPointConfig::default()
    })
    .unwrap()
    .into()
  }

  #[test]
  fn test_rejects_mismatched_backend_shape() {
    let backend = ReplayBackend::new(OutputTensor::zeros(22, 4));
    assert!(matches!(
      ArmorPipeline::new(backend, four_point(4)),
      Err(PipelineError::ShapeMismatch { .. })
    ));

    let detector: DetectorWrapper = AnchorBoxDetector::new(AnchorBoxConfig {
      anchors: 4,
      ..AnchorBoxConfig::default()
    })
    .unwrap()
    .into();
    let backend = ReplayBackend::new(OutputTensor::zeros(26, 4));
    assert!(ArmorPipeline::new(backend, detector).is_ok());
  }

  #[test]
  fn test_empty_frame_yields_no_detections() {
    let backend = ReplayBackend::new(OutputTensor::zeros(4, 22));
    let pipeline = ArmorPipeline::new(backend, four_point(4)).unwrap();
    let result = pipeline.process_full(&RgbImage::new(0, 0)).unwrap();
    assert!(result.is_empty());
  }

  #[test]
  fn test_thin_region_yields_no_detections() {
    let backend = ReplayBackend::new(OutputTensor::zeros(4, 22));
    let pipeline = ArmorPipeline::new(backend, four_point(4)).unwrap();
    let image = RgbImage::new(4000, 4000);
    let result = pipeline.process(&image, Rect::new(0, 0, 4000, 1)).unwrap();
    assert!(result.is_empty());
    assert_eq!(result.roi, Rect::new(0, 0, 4000, 1));
  }
}
