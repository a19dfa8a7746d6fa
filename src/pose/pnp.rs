// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pose/pnp.rs - 平面四点 PnP 求解
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

//! 先用单应矩阵分解得到初值，再用 Levenberg-Marquardt 最小化重投影误差。

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{
  DMatrix, DVector, Dyn, Matrix3, Owned, Rotation3, SMatrix, SymmetricEigen, Vector2, Vector3,
};
use tracing::trace;

use super::{CameraCalibration, PoseError, rodrigues};

/// 三点构成的三角形面积（两倍）相对最大点距平方的下限
const COLLINEAR_RATIO: f64 = 1e-3;

pub(super) struct Solution {
  pub rvec: Vector3<f64>,
  pub tvec: Vector3<f64>,
  /// 重投影均方根误差（像素）
  pub rms: f64,
}

pub(super) fn solve(
  object: &[Vector3<f64>; 4],
  pixels: &[Vector2<f64>; 4],
  calibration: &CameraCalibration,
) -> Result<Solution, PoseError> {
  if pixels.iter().any(|p| !(p.x.is_finite() && p.y.is_finite())) {
    return Err(PoseError::Indeterminate("图像点包含非有限数值"));
  }

  let normalized = pixels.map(|p| calibration.undistort(p));
  check_non_collinear(&normalized)?;

  let plane = object.map(|p| Vector2::new(p.x, p.y));
  let homography = homography_dlt(&plane, &normalized)?;
  let (rvec, tvec) = decompose_homography(&homography)?;

  let seed = PlanarPose::new(object, pixels, calibration, &rvec, &tvec);
  let seed_cost = seed
    .cost()
    .ok_or(PoseError::Indeterminate("初值位于相机后方"))?;

  let (refined, report) = LevenbergMarquardt::new().minimize(seed.clone());
  trace!(
    "LM 结束: {:?}, 评估 {} 次",
    report.termination, report.number_of_evaluations
  );
  // 迭代失败或变差时保留初值
  let pose = match refined.cost() {
    Some(cost) if report.termination.was_successful() && cost <= seed_cost => refined,
    _ => seed,
  };

  let rvec = pose.rvec();
  let tvec = pose.tvec();
  let cost = pose.cost().ok_or(PoseError::Indeterminate("目标位于相机后方"))?;
  if !(rvec.iter().chain(tvec.iter()).all(|v| v.is_finite()) && cost.is_finite()) {
    return Err(PoseError::Indeterminate("迭代发散"));
  }
  if tvec.z <= 0.0 {
    return Err(PoseError::Indeterminate("目标位于相机后方"));
  }

  Ok(Solution {
    rvec,
    tvec,
    rms: (cost / pixels.len() as f64).sqrt(),
  })
}

/// 平面目标的重投影最小二乘问题
///
/// 参数为 `[rx, ry, rz, tx, ty, tz]`，残差为四个角点的像素误差。
#[derive(Clone)]
struct PlanarPose<'a> {
  object: &'a [Vector3<f64>; 4],
  pixels: &'a [Vector2<f64>; 4],
  calibration: &'a CameraCalibration,
  params: DVector<f64>,
}

impl<'a> PlanarPose<'a> {
  fn new(
    object: &'a [Vector3<f64>; 4],
    pixels: &'a [Vector2<f64>; 4],
    calibration: &'a CameraCalibration,
    rvec: &Vector3<f64>,
    tvec: &Vector3<f64>,
  ) -> Self {
    Self {
      object,
      pixels,
      calibration,
      params: DVector::from_iterator(6, rvec.iter().chain(tvec.iter()).copied()),
    }
  }

  fn rvec(&self) -> Vector3<f64> {
    self.params.fixed_rows::<3>(0).into_owned()
  }

  fn tvec(&self) -> Vector3<f64> {
    self.params.fixed_rows::<3>(3).into_owned()
  }

  /// 残差平方和
  fn cost(&self) -> Option<f64> {
    self.residuals().map(|r| r.norm_squared())
  }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for PlanarPose<'_> {
  type ParameterStorage = Owned<f64, Dyn>;
  type ResidualStorage = Owned<f64, Dyn>;
  type JacobianStorage = Owned<f64, Dyn, Dyn>;

  fn set_params(&mut self, x: &DVector<f64>) {
    self.params.copy_from(x);
  }

  fn params(&self) -> DVector<f64> {
    self.params.clone()
  }

  fn residuals(&self) -> Option<DVector<f64>> {
    let rotation = rodrigues(&self.rvec());
    let translation = self.tvec();

    let mut residuals = DVector::zeros(2 * self.object.len());
    for (i, (point, pixel)) in self.object.iter().zip(self.pixels.iter()).enumerate() {
      let projected = self.calibration.project(&(rotation * point + translation))?;
      residuals[2 * i] = projected.x - pixel.x;
      residuals[2 * i + 1] = projected.y - pixel.y;
    }
    Some(residuals)
  }

  fn jacobian(&self) -> Option<DMatrix<f64>> {
    let rvec = self.rvec();
    let rotation = rodrigues(&rvec);
    let translation = self.tvec();
    let right = right_jacobian(&rvec);

    let mut jacobian = DMatrix::zeros(2 * self.object.len(), 6);
    for (i, point) in self.object.iter().enumerate() {
      let (_, d_pixel) = self
        .calibration
        .project_with_jacobian(&(rotation * point + translation))?;
      // ∂(R X) / ∂ω = -R [X]× J_r(ω)
      let d_rotation = d_pixel * (-rotation * point.cross_matrix() * right);
      jacobian
        .fixed_view_mut::<2, 3>(2 * i, 0)
        .copy_from(&d_rotation);
      jacobian.fixed_view_mut::<2, 3>(2 * i, 3).copy_from(&d_pixel);
    }
    Some(jacobian)
  }
}

/// SO(3) 右雅可比
fn right_jacobian(rvec: &Vector3<f64>) -> Matrix3<f64> {
  let theta2 = rvec.norm_squared();
  let skew = rvec.cross_matrix();
  let (a, b) = if theta2 < 1e-12 {
    (0.5 - theta2 / 24.0, 1.0 / 6.0 - theta2 / 120.0)
  } else {
    let theta = theta2.sqrt();
    (
      (1.0 - theta.cos()) / theta2,
      (theta - theta.sin()) / (theta2 * theta),
    )
  };
  Matrix3::identity() - skew * a + skew * skew * b
}

/// 任意三点近似共线即视为退化
fn check_non_collinear(points: &[Vector2<f64>; 4]) -> Result<(), PoseError> {
  let mut scale: f64 = 0.0;
  for i in 0..4 {
    for j in i + 1..4 {
      scale = scale.max((points[i] - points[j]).norm_squared());
    }
  }
  if scale < 1e-18 {
    return Err(PoseError::Indeterminate("图像点重合"));
  }

  const TRIPLES: [(usize, usize, usize); 4] = [(0, 1, 2), (0, 1, 3), (0, 2, 3), (1, 2, 3)];
  for (a, b, c) in TRIPLES {
    let u = points[b] - points[a];
    let v = points[c] - points[a];
    if (u.x * v.y - u.y * v.x).abs() < COLLINEAR_RATIO * scale {
      return Err(PoseError::Indeterminate("图像点共线"));
    }
  }
  Ok(())
}

/// 平移到质心并缩放，使平均距离为 √2
fn hartley_normalize(points: &[Vector2<f64>; 4]) -> (Matrix3<f64>, [Vector2<f64>; 4]) {
  let centroid = points.iter().sum::<Vector2<f64>>() / 4.0;
  let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / 4.0;
  let s = if mean_dist > 1e-15 {
    std::f64::consts::SQRT_2 / mean_dist
  } else {
    1.0
  };
  let t = Matrix3::new(
    s,
    0.0,
    -s * centroid.x,
    0.0,
    s,
    -s * centroid.y,
    0.0,
    0.0,
    1.0,
  );
  (t, points.map(|p| (p - centroid) * s))
}

/// 直接线性变换估计 `dst ≈ H * src`
fn homography_dlt(
  src: &[Vector2<f64>; 4],
  dst: &[Vector2<f64>; 4],
) -> Result<Matrix3<f64>, PoseError> {
  let (t_src, src_n) = hartley_normalize(src);
  let (t_dst, dst_n) = hartley_normalize(dst);

  let mut a = SMatrix::<f64, 8, 9>::zeros();
  for (i, (s, d)) in src_n.iter().zip(dst_n.iter()).enumerate() {
    let r = 2 * i;
    a[(r, 3)] = -s.x;
    a[(r, 4)] = -s.y;
    a[(r, 5)] = -1.0;
    a[(r, 6)] = d.y * s.x;
    a[(r, 7)] = d.y * s.y;
    a[(r, 8)] = d.y;

    a[(r + 1, 0)] = s.x;
    a[(r + 1, 1)] = s.y;
    a[(r + 1, 2)] = 1.0;
    a[(r + 1, 6)] = -d.x * s.x;
    a[(r + 1, 7)] = -d.x * s.y;
    a[(r + 1, 8)] = -d.x;
  }

  // AᵀA 最小特征值对应的特征向量即为解
  let eig = SymmetricEigen::new(a.transpose() * a);
  let min_idx = eig
    .eigenvalues
    .iter()
    .enumerate()
    .min_by(|(_, x), (_, y)| x.abs().total_cmp(&y.abs()))
    .map(|(i, _)| i)
    .unwrap_or(0);
  let h = eig.eigenvectors.column(min_idx);
  let h_norm = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

  let t_dst_inv = t_dst
    .try_inverse()
    .ok_or(PoseError::Indeterminate("归一化矩阵不可逆"))?;
  let homography = t_dst_inv * h_norm * t_src;
  if homography.iter().any(|v| !v.is_finite()) {
    return Err(PoseError::Indeterminate("单应矩阵数值异常"));
  }
  Ok(homography)
}

/// 由归一化相机坐标下的单应矩阵恢复 `R`、`t`，保证目标位于相机前方
fn decompose_homography(h: &Matrix3<f64>) -> Result<(Vector3<f64>, Vector3<f64>), PoseError> {
  let h1 = h.column(0).into_owned();
  let h2 = h.column(1).into_owned();
  let h3 = h.column(2).into_owned();

  let norm = h1.norm() + h2.norm();
  if norm < 1e-15 {
    return Err(PoseError::Indeterminate("单应矩阵退化"));
  }
  let mut lambda = 2.0 / norm;
  if h3.z * lambda < 0.0 {
    lambda = -lambda;
  }

  let r1 = h1 * lambda;
  let r2 = h2 * lambda;
  let r3 = r1.cross(&r2);
  let near = Matrix3::from_columns(&[r1, r2, r3]);

  // 投影到最近的旋转矩阵
  let svd = near.svd(true, true);
  let (Some(mut u), Some(v_t)) = (svd.u, svd.v_t) else {
    return Err(PoseError::Indeterminate("SVD 分解失败"));
  };
  if (u * v_t).determinant() < 0.0 {
    for v in u.column_mut(2).iter_mut() {
      *v = -*v;
    }
  }
  let rotation = Rotation3::from_matrix_unchecked(u * v_t);

  Ok((rotation.scaled_axis(), h3 * lambda))
}
