// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/pipeline.rs - 流水线端到端测试
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

use approx::assert_relative_eq;
use image::RgbImage;
use nalgebra::Vector3;

use shanan_armor::{
  config::Config,
  geometry::Rect,
  inference::ReplayBackend,
  letterbox::Letterbox,
  model::{
    AnchorBoxConfig, AnchorBoxDetector, FourPointConfig, FourPointOnlyDetector, OutputTensor,
  },
  pipeline::ArmorPipeline,
  pose::PoseEstimator,
};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 1024;
const ANCHORS: usize = 8;
const CHANNELS: usize = 22;
const TRUE_TRANSLATION: [f64; 3] = [100.0, -50.0, 3000.0];

fn estimator() -> PoseEstimator {
  Config::default().pose_estimator().unwrap()
}

/// 按已知位姿投影出的四个角点（全图像素坐标）
fn projected_corners() -> [(f64, f64); 4] {
  let estimator = estimator();
  let t = Vector3::from(TRUE_TRANSLATION);
  estimator.target().corners().map(|c| {
    let p = estimator.calibration().project(&(c + t)).unwrap();
    (p.x, p.y)
  })
}

fn write_anchor(
  tensor: &mut OutputTensor,
  anchor: usize,
  corners: [(f32, f32); 4],
  objectness: f32,
  class: usize,
  class_logit: f32,
) {
  for (k, (x, y)) in corners.iter().enumerate() {
    tensor.set(anchor, 2 * k, *x);
    tensor.set(anchor, 2 * k + 1, *y);
  }
  tensor.set(anchor, 8, objectness);
  tensor.set(anchor, 10, 3.0);
  tensor.set(anchor, 13 + class, class_logit);
}

/// 在区域 `roi` 上构造模型输出
fn plate_tensor(roi: Rect) -> OutputTensor {
  let letterbox = Letterbox::new(roi.width as u32, roi.height as u32, 640).unwrap();
  let model_corners = projected_corners().map(|(u, v)| {
    letterbox.to_model((u - roi.x as f64) as f32, (v - roi.y as f64) as f32)
  });
  let shifted = model_corners.map(|(x, y)| (x + 1.0, y + 1.0));

  let mut tensor = OutputTensor::zeros(ANCHORS, CHANNELS);
  write_anchor(&mut tensor, 0, model_corners, 4.0, 3, 5.0);
  // 同一目标的重复框，置信度较低
  write_anchor(&mut tensor, 1, shifted, 3.0, 3, 4.0);
  // 被排除的类别
  write_anchor(&mut tensor, 2, shifted, 4.0, 8, 6.0);
  tensor
}

fn pipeline(tensor: OutputTensor) -> ArmorPipeline<ReplayBackend> {
  let detector = FourPointOnlyDetector::new(FourPointConfig {
    anchors: ANCHORS,
    ..FourPointConfig::default()
  })
  .unwrap();
  ArmorPipeline::new(ReplayBackend::new(tensor), detector.into())
    .unwrap()
    .with_pose_estimator(estimator())
}

#[test]
fn test_plate_detection_and_pose() {
  let image = RgbImage::new(WIDTH, HEIGHT);
  let result = pipeline(plate_tensor(Rect::from_size(WIDTH, HEIGHT)))
    .process_full(&image)
    .unwrap();

  assert_eq!(result.roi, Rect::from_size(WIDTH, HEIGHT));
  assert_eq!(result.len(), 1);
  let armor = &result.detections[0];
  assert_eq!(armor.detection.class_id, 3);
  assert_eq!(armor.detection.color, Some(1));

  let keypoints = armor.detection.keypoints.unwrap();
  for (k, (u, v)) in keypoints.iter().zip(projected_corners()) {
    assert!((k.x as f64 - u).abs() <= 1.0, "{} vs {}", k.x, u);
    assert!((k.y as f64 - v).abs() <= 1.0, "{} vs {}", k.y, v);
  }

  let pose = armor.pose.as_ref().unwrap();
  let truth = Vector3::from(TRUE_TRANSLATION).norm();
  assert_relative_eq!(pose.distance, truth, max_relative = 0.02);
  assert!(pose.translation[2] > 0.0);
  assert!(pose.reprojection_error < 2.0);
}

#[test]
fn test_region_offsets_are_restored() {
  let image = RgbImage::new(WIDTH, HEIGHT);
  let roi = Rect::new(200, 100, 800, 800);
  let result = pipeline(plate_tensor(roi)).process(&image, roi).unwrap();
  assert_eq!(result.roi, roi);
  assert_eq!(result.len(), 1);

  let keypoints = result.detections[0].detection.keypoints.unwrap();
  for (k, (u, v)) in keypoints.iter().zip(projected_corners()) {
    assert!((k.x as f64 - u).abs() <= 1.0);
    assert!((k.y as f64 - v).abs() <= 1.0);
  }
  let bbox = result.detections[0].detection.bbox;
  assert!(roi.contains(bbox.x, bbox.y));
}

#[test]
fn test_region_outside_image_is_empty() {
  let image = RgbImage::new(WIDTH, HEIGHT);
  let result = pipeline(plate_tensor(Rect::from_size(WIDTH, HEIGHT)))
    .process(&image, Rect::new(2000, 2000, 100, 100))
    .unwrap();
  assert!(result.is_empty());
}

#[test]
fn test_silent_tensor_is_empty() {
  let image = RgbImage::new(WIDTH, HEIGHT);
  let result = pipeline(OutputTensor::zeros(ANCHORS, CHANNELS))
    .process_full(&image)
    .unwrap();
  assert!(result.is_empty());
  assert_eq!(result.roi, Rect::from_size(WIDTH, HEIGHT));
}

#[test]
fn test_without_pose_estimator() {
  let detector = FourPointOnlyDetector::new(FourPointConfig {
    anchors: ANCHORS,
    ..FourPointConfig::default()
  })
  .unwrap();
  let pipeline = ArmorPipeline::new(
    ReplayBackend::new(plate_tensor(Rect::from_size(WIDTH, HEIGHT))),
    detector.into(),
  )
  .unwrap();
  let result = pipeline.process_full(&RgbImage::new(WIDTH, HEIGHT)).unwrap();
  assert_eq!(result.len(), 1);
  assert!(result.detections[0].pose.is_none());
}

/// 框 + 关键点模型的输出：`[26, 2100]`，输入 320
fn anchor_box_pipeline(tensor: OutputTensor) -> ArmorPipeline<ReplayBackend> {
  let detector = AnchorBoxDetector::new(AnchorBoxConfig::default()).unwrap();
  ArmorPipeline::new(ReplayBackend::new(tensor), detector.into())
    .unwrap()
    .with_pose_estimator(estimator())
}

fn anchor_box_tensor() -> OutputTensor {
  let config = AnchorBoxConfig::default();
  OutputTensor::zeros(config.channels, config.anchors)
}

#[test]
fn test_anchor_box_detection_and_pose() {
  let image = RgbImage::new(WIDTH, HEIGHT);
  let letterbox = Letterbox::new(WIDTH, HEIGHT, 320).unwrap();
  let corners = projected_corners().map(|(u, v)| letterbox.to_model(u as f32, v as f32));

  let (min_x, max_x) = corners
    .iter()
    .fold((f32::MAX, f32::MIN), |(lo, hi), (x, _)| (lo.min(*x), hi.max(*x)));
  let (min_y, max_y) = corners
    .iter()
    .fold((f32::MAX, f32::MIN), |(lo, hi), (_, y)| (lo.min(*y), hi.max(*y)));

  let mut tensor = anchor_box_tensor();
  let anchor = 1234;
  tensor.set(0, anchor, 0.5 * (min_x + max_x));
  tensor.set(1, anchor, 0.5 * (min_y + max_y));
  tensor.set(2, anchor, max_x - min_x);
  tensor.set(3, anchor, max_y - min_y);
  tensor.set(4 + 2, anchor, 0.85);
  for (k, (x, y)) in corners.iter().enumerate() {
    tensor.set(14 + 3 * k, anchor, *x);
    tensor.set(15 + 3 * k, anchor, *y);
    tensor.set(16 + 3 * k, anchor, 0.9);
  }

  let result = anchor_box_pipeline(tensor).process_full(&image).unwrap();
  assert_eq!(result.len(), 1);
  let armor = &result.detections[0];
  assert_eq!(armor.detection.class_id, 2);
  assert_eq!(armor.detection.color, None);
  assert_relative_eq!(armor.detection.confidence, 0.85);

  // 模型坐标每单位对应 4 个像素
  let keypoints = armor.detection.keypoints.unwrap();
  for (k, (u, v)) in keypoints.iter().zip(projected_corners()) {
    assert!((k.x as f64 - u).abs() <= 4.0, "{} vs {}", k.x, u);
    assert!((k.y as f64 - v).abs() <= 4.0, "{} vs {}", k.y, v);
    assert_relative_eq!(k.score, 0.9);
  }

  let pose = armor.pose.as_ref().unwrap();
  let truth = Vector3::from(TRUE_TRANSLATION).norm();
  assert_relative_eq!(pose.distance, truth, max_relative = 0.05);
  assert!(pose.translation[2] > 0.0);
}

#[test]
fn test_infinite_box_center_is_skipped() {
  let image = RgbImage::new(WIDTH, HEIGHT);
  let mut tensor = anchor_box_tensor();
  tensor.set(0, 0, f32::INFINITY);
  tensor.set(1, 0, 100.0);
  tensor.set(2, 0, 20.0);
  tensor.set(3, 0, 20.0);
  tensor.set(5, 0, 0.9);

  let result = anchor_box_pipeline(tensor).process_full(&image).unwrap();
  assert!(result.is_empty());
}

#[test]
fn test_nan_tensor_is_empty() {
  let image = RgbImage::new(WIDTH, HEIGHT);

  let config = AnchorBoxConfig::default();
  let nan = OutputTensor::new(
    config.channels,
    config.anchors,
    vec![f32::NAN; config.channels * config.anchors],
  )
  .unwrap();
  assert!(anchor_box_pipeline(nan).process_full(&image).unwrap().is_empty());

  let nan = OutputTensor::new(ANCHORS, CHANNELS, vec![f32::NAN; ANCHORS * CHANNELS]).unwrap();
  assert!(pipeline(nan).process_full(&image).unwrap().is_empty());
}
