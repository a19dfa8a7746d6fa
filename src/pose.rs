// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pose.rs - 装甲板位姿解算
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

use nalgebra::{Matrix2, Matrix2x3, Matrix3, Vector2, Vector3};
use serde::Serialize;
use thiserror::Error;

use crate::geometry::Keypoint;

mod pnp;

/// 大装甲板尺寸（毫米）
pub const LARGE_ARMOR_SIZE: (f64, f64) = (225.0, 55.0);
/// 小装甲板尺寸（毫米）
pub const SMALL_ARMOR_SIZE: (f64, f64) = (135.0, 55.0);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoseError {
  #[error("位姿无法确定: {0}")]
  Indeterminate(&'static str),
  #[error("目标模型无效: {0}")]
  InvalidTarget(String),
  #[error("相机标定无效: {0}")]
  InvalidCalibration(String),
}

/// 装甲板的三维模型，位于 z = 0 平面，原点在中心
///
/// 角点顺序与关键点一致：左上、左下、右下、右上。
#[derive(Debug, Clone, PartialEq)]
pub struct TargetModel {
  width: f64,
  height: f64,
  corners: [Vector3<f64>; 4],
}

impl TargetModel {
  pub fn new(width: f64, height: f64) -> Result<Self, PoseError> {
    if !(width.is_finite() && height.is_finite() && width > 0.0 && height > 0.0) {
      return Err(PoseError::InvalidTarget(format!(
        "尺寸必须为正: {}x{}",
        width, height
      )));
    }
    Ok(Self::with_size(width, height))
  }

  fn with_size(width: f64, height: f64) -> Self {
    let (hw, hh) = (width / 2.0, height / 2.0);
    Self {
      width,
      height,
      corners: [
        Vector3::new(-hw, -hh, 0.0),
        Vector3::new(-hw, hh, 0.0),
        Vector3::new(hw, hh, 0.0),
        Vector3::new(hw, -hh, 0.0),
      ],
    }
  }

  pub fn large_armor() -> Self {
    Self::with_size(LARGE_ARMOR_SIZE.0, LARGE_ARMOR_SIZE.1)
  }

  pub fn small_armor() -> Self {
    Self::with_size(SMALL_ARMOR_SIZE.0, SMALL_ARMOR_SIZE.1)
  }

  pub fn width(&self) -> f64 {
    self.width
  }

  pub fn height(&self) -> f64 {
    self.height
  }

  pub fn corners(&self) -> &[Vector3<f64>; 4] {
    &self.corners
  }
}

/// 相机内参与畸变
///
/// 畸变系数按 OpenCV 顺序 `k1, k2, p1, p2, k3[, k4, k5, k6]`。
#[derive(Debug, Clone, PartialEq)]
pub struct CameraCalibration {
  matrix: Matrix3<f64>,
  matrix_inv: Matrix3<f64>,
  distortion: [f64; 8],
}

impl CameraCalibration {
  pub fn new(matrix: [[f64; 3]; 3], distortion: &[f64]) -> Result<Self, PoseError> {
    if distortion.len() != 5 && distortion.len() != 8 {
      return Err(PoseError::InvalidCalibration(format!(
        "畸变系数数量必须为 5 或 8, 实际为 {}",
        distortion.len()
      )));
    }
    if matrix.iter().flatten().chain(distortion).any(|v| !v.is_finite()) {
      return Err(PoseError::InvalidCalibration("存在非有限数值".into()));
    }

    let matrix = Matrix3::from_fn(|r, c| matrix[r][c]);
    if matrix[(0, 0)].abs() < 1e-12 || matrix[(1, 1)].abs() < 1e-12 {
      return Err(PoseError::InvalidCalibration("焦距不能为 0".into()));
    }
    let matrix_inv = matrix
      .try_inverse()
      .ok_or_else(|| PoseError::InvalidCalibration("内参矩阵不可逆".into()))?;

    let mut coeffs = [0.0; 8];
    coeffs[..distortion.len()].copy_from_slice(distortion);

    Ok(Self {
      matrix,
      matrix_inv,
      distortion: coeffs,
    })
  }

  /// 无畸变的针孔相机
  pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64) -> Result<Self, PoseError> {
    Self::new([[fx, 0.0, cx], [0.0, fy, cy], [0.0, 0.0, 1.0]], &[0.0; 5])
  }

  pub fn matrix(&self) -> &Matrix3<f64> {
    &self.matrix
  }

  /// 对归一化坐标施加畸变
  fn distort(&self, p: Vector2<f64>) -> Vector2<f64> {
    let [k1, k2, p1, p2, k3, k4, k5, k6] = self.distortion;
    let (x, y) = (p.x, p.y);
    let r2 = x * x + y * y;
    let r4 = r2 * r2;
    let r6 = r4 * r2;
    let radial = (1.0 + k1 * r2 + k2 * r4 + k3 * r6) / (1.0 + k4 * r2 + k5 * r4 + k6 * r6);
    Vector2::new(
      x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
      y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
    )
  }

  /// 相机坐标系下的点投影到像素，点在相机后方时返回 `None`
  pub fn project(&self, p: &Vector3<f64>) -> Option<Vector2<f64>> {
    if p.z <= f64::EPSILON {
      return None;
    }
    let d = self.distort(Vector2::new(p.x / p.z, p.y / p.z));
    let pixel = self.matrix * Vector3::new(d.x, d.y, 1.0);
    Some(Vector2::new(pixel.x / pixel.z, pixel.y / pixel.z))
  }

  /// 投影及像素对相机坐标的雅可比 `∂(u, v) / ∂(X, Y, Z)`
  pub(crate) fn project_with_jacobian(
    &self,
    p: &Vector3<f64>,
  ) -> Option<(Vector2<f64>, Matrix2x3<f64>)> {
    if p.z <= f64::EPSILON {
      return None;
    }
    let inv_z = 1.0 / p.z;
    let (x, y) = (p.x * inv_z, p.y * inv_z);
    let d_normalized = Matrix2x3::new(inv_z, 0.0, -x * inv_z, 0.0, inv_z, -y * inv_z);

    let [k1, k2, p1, p2, k3, k4, k5, k6] = self.distortion;
    let r2 = x * x + y * y;
    let r4 = r2 * r2;
    let r6 = r4 * r2;
    let num = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;
    let den = 1.0 + k4 * r2 + k5 * r4 + k6 * r6;
    let radial = num / den;
    // d(radial) / d(r2)
    let d_radial =
      ((k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4) * den - num * (k4 + 2.0 * k5 * r2 + 3.0 * k6 * r4))
        / (den * den);
    let d_distort = Matrix2::new(
      radial + 2.0 * x * x * d_radial + 2.0 * p1 * y + 6.0 * p2 * x,
      2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y,
      2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y,
      radial + 2.0 * y * y * d_radial + 6.0 * p1 * y + 2.0 * p2 * x,
    );

    let d = self.distort(Vector2::new(x, y));
    let q = self.matrix * Vector3::new(d.x, d.y, 1.0);
    let k = &self.matrix;
    let w2 = q.z * q.z;
    let d_pixel = Matrix2::new(
      (k[(0, 0)] * q.z - q.x * k[(2, 0)]) / w2,
      (k[(0, 1)] * q.z - q.x * k[(2, 1)]) / w2,
      (k[(1, 0)] * q.z - q.y * k[(2, 0)]) / w2,
      (k[(1, 1)] * q.z - q.y * k[(2, 1)]) / w2,
    );

    Some((
      Vector2::new(q.x / q.z, q.y / q.z),
      d_pixel * d_distort * d_normalized,
    ))
  }

  /// 像素坐标 → 去畸变的归一化坐标（定点迭代）
  pub fn undistort(&self, pixel: Vector2<f64>) -> Vector2<f64> {
    const UNDISTORT_ITERS: usize = 20;

    let h = self.matrix_inv * Vector3::new(pixel.x, pixel.y, 1.0);
    let (x0, y0) = (h.x / h.z, h.y / h.z);
    let [k1, k2, p1, p2, k3, k4, k5, k6] = self.distortion;

    let (mut x, mut y) = (x0, y0);
    for _ in 0..UNDISTORT_ITERS {
      let r2 = x * x + y * y;
      let r4 = r2 * r2;
      let r6 = r4 * r2;
      let icdist = (1.0 + k4 * r2 + k5 * r4 + k6 * r6) / (1.0 + k1 * r2 + k2 * r4 + k3 * r6);
      if !icdist.is_finite() {
        break;
      }
      let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
      let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
      x = (x0 - dx) * icdist;
      y = (y0 - dy) * icdist;
    }
    Vector2::new(x, y)
  }
}

/// 单帧位姿解算结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoseEstimate {
  /// 旋转向量（Rodrigues）
  pub rotation_vector: [f64; 3],
  /// 旋转矩阵，行主序
  pub rotation: [[f64; 3]; 3],
  /// 平移向量，单位与目标模型一致
  pub translation: [f64; 3],
  pub distance: f64,
  /// 欧拉角（度）
  pub pitch: f64,
  pub yaw: f64,
  pub roll: f64,
  /// 重投影均方根误差（像素）
  pub reprojection_error: f64,
}

/// 无状态的 PnP 位姿解算器，每次调用都从头求解
#[derive(Debug, Clone)]
pub struct PoseEstimator {
  target: TargetModel,
  calibration: CameraCalibration,
}

impl PoseEstimator {
  pub fn new(target: TargetModel, calibration: CameraCalibration) -> Self {
    Self {
      target,
      calibration,
    }
  }

  pub fn target(&self) -> &TargetModel {
    &self.target
  }

  pub fn calibration(&self) -> &CameraCalibration {
    &self.calibration
  }

  /// 由四个有序关键点求解位姿
  pub fn estimate(&self, keypoints: &[Keypoint; 4]) -> Result<PoseEstimate, PoseError> {
    self.estimate_points(&keypoints.map(|k| [k.x as f64, k.y as f64]))
  }

  /// 由四个有序的亚像素图像点求解位姿
  pub fn estimate_points(&self, image_points: &[[f64; 2]; 4]) -> Result<PoseEstimate, PoseError> {
    let pixels = image_points.map(|[x, y]| Vector2::new(x, y));
    let solution = pnp::solve(self.target.corners(), &pixels, &self.calibration)?;

    let rotation = rodrigues(&solution.rvec);
    let (pitch, yaw, roll) = euler_degrees(&rotation);

    Ok(PoseEstimate {
      rotation_vector: solution.rvec.into(),
      rotation: std::array::from_fn(|r| std::array::from_fn(|c| rotation[(r, c)])),
      translation: solution.tvec.into(),
      distance: solution.tvec.norm(),
      pitch,
      yaw,
      roll,
      reprojection_error: solution.rms,
    })
  }
}

/// 旋转向量 → 旋转矩阵（Rodrigues 公式）
pub fn rodrigues(rvec: &Vector3<f64>) -> Matrix3<f64> {
  let theta = rvec.norm();
  if theta < f64::EPSILON {
    return Matrix3::identity();
  }

  let k = rvec / theta;
  let (s, c) = theta.sin_cos();
  let skew = Matrix3::new(0.0, -k.z, k.y, k.z, 0.0, -k.x, -k.y, k.x, 0.0);
  Matrix3::identity() * c + (k * k.transpose()) * (1.0 - c) + skew * s
}

/// 由旋转矩阵提取 (pitch, yaw, roll)，单位为度
///
/// `pitch = asin(-R[1][2])`，`yaw = atan2(R[0][2], R[2][2])`，`roll = atan2(R[1][0], R[1][1])`。
pub fn euler_degrees(rotation: &Matrix3<f64>) -> (f64, f64, f64) {
  let pitch = (-rotation[(1, 2)]).clamp(-1.0, 1.0).asin();
  let yaw = rotation[(0, 2)].atan2(rotation[(2, 2)]);
  let roll = rotation[(1, 0)].atan2(rotation[(1, 1)]);
  (pitch.to_degrees(), yaw.to_degrees(), roll.to_degrees())
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;
  use nalgebra::Rotation3;

  /// 原始部署使用的工业相机标定
  fn deployed_calibration() -> CameraCalibration {
    CameraCalibration::new(
      [
        [2.3331e+03, -1.6808, 690.8069],
        [0.0, 2.3271e+03, 554.0654],
        [0.0, 0.0, 1.0],
      ],
      &[-0.1382, 0.5323, 0.0012, -0.0023, 0.0],
    )
    .unwrap()
  }

  fn project_target(
    target: &TargetModel,
    calibration: &CameraCalibration,
    rvec: &Vector3<f64>,
    tvec: &Vector3<f64>,
  ) -> [[f64; 2]; 4] {
    let r = rodrigues(rvec);
    target.corners().map(|corner| {
      let p = calibration.project(&(r * corner + tvec)).unwrap();
      [p.x, p.y]
    })
  }

  #[test]
  fn test_rodrigues_matches_axis_angle() {
    let rvec = Vector3::new(0.3, -0.2, 0.7);
    let expected = Rotation3::from_scaled_axis(rvec);
    assert_relative_eq!(rodrigues(&rvec), *expected.matrix(), epsilon = 1e-12);
    assert_relative_eq!(rodrigues(&Vector3::zeros()), Matrix3::identity());
  }

  #[test]
  fn test_rodrigues_is_orthonormal() {
    let r = rodrigues(&Vector3::new(1.2, 0.4, -2.1));
    assert_relative_eq!(r * r.transpose(), Matrix3::identity(), epsilon = 1e-12);
    assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
  }

  #[test]
  fn test_euler_axes() {
    let yaw = Rotation3::from_axis_angle(&Vector3::y_axis(), 30f64.to_radians());
    let (p, y, r) = euler_degrees(yaw.matrix());
    assert_relative_eq!(y, 30.0, epsilon = 1e-9);
    assert_relative_eq!(p, 0.0, epsilon = 1e-9);
    assert_relative_eq!(r, 0.0, epsilon = 1e-9);

    let pitch = Rotation3::from_axis_angle(&Vector3::x_axis(), 20f64.to_radians());
    let (p, _, _) = euler_degrees(pitch.matrix());
    assert_relative_eq!(p, 20.0, epsilon = 1e-9);

    let roll = Rotation3::from_axis_angle(&Vector3::z_axis(), -15f64.to_radians());
    let (_, _, r) = euler_degrees(roll.matrix());
    assert_relative_eq!(r, -15.0, epsilon = 1e-9);
  }

  #[test]
  fn test_target_corner_order() {
    let target = TargetModel::large_armor();
    let c = target.corners();
    assert_eq!(c[0], Vector3::new(-112.5, -27.5, 0.0));
    assert_eq!(c[1], Vector3::new(-112.5, 27.5, 0.0));
    assert_eq!(c[2], Vector3::new(112.5, 27.5, 0.0));
    assert_eq!(c[3], Vector3::new(112.5, -27.5, 0.0));
    assert!(TargetModel::new(0.0, 55.0).is_err());
  }

  #[test]
  fn test_calibration_rejects_bad_distortion() {
    let k = [[1000.0, 0.0, 320.0], [0.0, 1000.0, 240.0], [0.0, 0.0, 1.0]];
    assert!(CameraCalibration::new(k, &[0.0; 4]).is_err());
    assert!(CameraCalibration::new(k, &[0.0; 8]).is_ok());
    let zero_focal = [[0.0, 0.0, 320.0], [0.0, 1000.0, 240.0], [0.0, 0.0, 1.0]];
    assert!(CameraCalibration::new(zero_focal, &[0.0; 5]).is_err());
  }

  #[test]
  fn test_undistort_inverts_distort() {
    let calibration = deployed_calibration();
    let p = Vector3::new(0.05, -0.03, 1.0);
    let pixel = calibration.project(&p).unwrap();
    let normalized = calibration.undistort(pixel);
    assert_relative_eq!(normalized.x, 0.05, epsilon = 1e-9);
    assert_relative_eq!(normalized.y, -0.03, epsilon = 1e-9);
  }

  #[test]
  fn test_synthetic_ground_truth_pinhole() {
    let target = TargetModel::large_armor();
    let calibration = CameraCalibration::pinhole(1000.0, 1000.0, 640.0, 512.0).unwrap();
    let rvec = Vector3::new(0.1, -0.3, 0.05);
    let tvec = Vector3::new(50.0, -30.0, 1500.0);
    let points = project_target(&target, &calibration, &rvec, &tvec);

    let estimator = PoseEstimator::new(target, calibration);
    let pose = estimator.estimate_points(&points).unwrap();

    assert_relative_eq!(Vector3::from(pose.rotation_vector), rvec, epsilon = 1e-6);
    assert_relative_eq!(Vector3::from(pose.translation), tvec, epsilon = 1e-4);
    assert_relative_eq!(pose.distance, tvec.norm(), epsilon = 1e-4);
    assert!(pose.reprojection_error < 1e-6);

    let (pitch, yaw, roll) = euler_degrees(&rodrigues(&rvec));
    assert_relative_eq!(pose.pitch, pitch, epsilon = 1e-4);
    assert_relative_eq!(pose.yaw, yaw, epsilon = 1e-4);
    assert_relative_eq!(pose.roll, roll, epsilon = 1e-4);
  }

  #[test]
  fn test_synthetic_ground_truth_with_distortion() {
    let target = TargetModel::small_armor();
    let calibration = deployed_calibration();
    let rvec = Vector3::new(-0.2, 0.4, 0.1);
    let tvec = Vector3::new(-120.0, 80.0, 3000.0);
    let points = project_target(&target, &calibration, &rvec, &tvec);

    let estimator = PoseEstimator::new(target, calibration);
    let pose = estimator.estimate_points(&points).unwrap();

    assert_relative_eq!(Vector3::from(pose.rotation_vector), rvec, epsilon = 1e-6);
    assert_relative_eq!(Vector3::from(pose.translation), tvec, epsilon = 1e-3);
  }

  #[test]
  fn test_steep_viewing_angles() {
    let target = TargetModel::large_armor();
    let calibration = deployed_calibration();
    let tvec = Vector3::new(30.0, -20.0, 2500.0);
    for yaw in (0..=75).step_by(15) {
      for pitch in (-20..=15).step_by(5) {
        let rotation = Rotation3::from_axis_angle(&Vector3::y_axis(), (yaw as f64).to_radians())
          * Rotation3::from_axis_angle(&Vector3::x_axis(), (pitch as f64).to_radians());
        let rvec = rotation.scaled_axis();
        let points = project_target(&target, &calibration, &rvec, &tvec);

        let estimator = PoseEstimator::new(target.clone(), calibration.clone());
        let pose = estimator.estimate_points(&points).unwrap();
        let recovered = rodrigues(&Vector3::from(pose.rotation_vector));
        assert_relative_eq!(recovered, *rotation.matrix(), epsilon = 1e-8);
        assert_relative_eq!(Vector3::from(pose.translation), tvec, epsilon = 1e-6);
        assert!(pose.reprojection_error < 1e-6, "yaw {} pitch {}", yaw, pitch);
      }
    }
  }

  #[test]
  fn test_frontal_plate() {
    let target = TargetModel::large_armor();
    let calibration = CameraCalibration::pinhole(800.0, 800.0, 320.0, 240.0).unwrap();
    let points = project_target(
      &target,
      &calibration,
      &Vector3::zeros(),
      &Vector3::new(0.0, 0.0, 1000.0),
    );
    let pose = PoseEstimator::new(target, calibration)
      .estimate_points(&points)
      .unwrap();
    assert_relative_eq!(pose.distance, 1000.0, epsilon = 1e-4);
    assert_relative_eq!(pose.pitch, 0.0, epsilon = 1e-5);
    assert_relative_eq!(pose.yaw, 0.0, epsilon = 1e-5);
    assert_relative_eq!(pose.roll, 0.0, epsilon = 1e-5);
  }

  #[test]
  fn test_integer_keypoints_close_to_truth() {
    let target = TargetModel::large_armor();
    let calibration = CameraCalibration::pinhole(1200.0, 1200.0, 640.0, 512.0).unwrap();
    let tvec = Vector3::new(30.0, 10.0, 2000.0);
    let points = project_target(&target, &calibration, &Vector3::new(0.0, 0.2, 0.0), &tvec);
    let keypoints = points.map(|[x, y]| Keypoint::new(x.round() as i32, y.round() as i32, 1.0));

    let pose = PoseEstimator::new(target, calibration)
      .estimate(&keypoints)
      .unwrap();
    assert!((pose.distance - tvec.norm()).abs() / tvec.norm() < 0.02);
  }

  #[test]
  fn test_collinear_points_are_indeterminate() {
    let estimator = PoseEstimator::new(
      TargetModel::large_armor(),
      CameraCalibration::pinhole(1000.0, 1000.0, 640.0, 512.0).unwrap(),
    );
    let collinear = [[100.0, 100.0], [150.0, 100.0], [200.0, 100.0], [250.0, 100.0]];
    assert!(matches!(
      estimator.estimate_points(&collinear),
      Err(PoseError::Indeterminate(_))
    ));
    let nearly = [[100.0, 100.0], [150.0, 100.2], [200.0, 100.0], [250.0, 100.1]];
    assert!(estimator.estimate_points(&nearly).is_err());
    let coincident = [[100.0, 100.0]; 4];
    assert!(estimator.estimate_points(&coincident).is_err());
  }
}
