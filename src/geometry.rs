// 该文件是 Shanan （山南西风） 项目的一部分。
// src/geometry.rs - 像素矩形与关键点
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

use serde::Serialize;

/// 整数像素矩形，左上角 + 宽高
///
/// 右、下边界为开区间，即 `[x, x + width) × [y, y + height)`。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Rect {
  pub x: i32,
  pub y: i32,
  pub width: i32,
  pub height: i32,
}

impl Rect {
  pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
    Self {
      x,
      y,
      width,
      height,
    }
  }

  /// 以图像尺寸构造边界矩形
  pub fn from_size(width: u32, height: u32) -> Self {
    Self::new(0, 0, width as i32, height as i32)
  }

  /// 右边界（开区间），溢出时饱和
  pub fn right(&self) -> i32 {
    self.x.saturating_add(self.width)
  }

  pub fn bottom(&self) -> i32 {
    self.y.saturating_add(self.height)
  }

  /// 面积，宽或高非正时为 0
  pub fn area(&self) -> i64 {
    if self.width <= 0 || self.height <= 0 {
      0
    } else {
      self.width as i64 * self.height as i64
    }
  }

  pub fn is_empty(&self) -> bool {
    self.area() == 0
  }

  /// 两矩形求交，不相交时返回空矩形
  pub fn intersect(&self, other: &Rect) -> Rect {
    let x1 = self.x.max(other.x);
    let y1 = self.y.max(other.y);
    let x2 = self.right().min(other.right());
    let y2 = self.bottom().min(other.bottom());

    if x2 <= x1 || y2 <= y1 {
      Rect::default()
    } else {
      Rect::new(x1, y1, x2.saturating_sub(x1), y2.saturating_sub(y1))
    }
  }

  pub fn contains(&self, x: i32, y: i32) -> bool {
    x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
  }

  pub fn translate(&self, dx: i32, dy: i32) -> Rect {
    Rect::new(
      self.x.saturating_add(dx),
      self.y.saturating_add(dy),
      self.width,
      self.height,
    )
  }

  /// 计算两个矩形的 IoU
  pub fn iou(&self, other: &Rect) -> f32 {
    let intersection = self.intersect(other).area();
    let union = self.area() + other.area() - intersection;

    if union > 0 {
      intersection as f32 / union as f32
    } else {
      0.0
    }
  }

  /// 包围一组整数点的最小矩形，点集为空时返回 `None`
  ///
  /// 与像素网格一致：单个点的包围矩形宽高均为 1。
  pub fn bounding<I>(points: I) -> Option<Rect>
  where
    I: IntoIterator<Item = (i32, i32)>,
  {
    let mut iter = points.into_iter();
    let (x0, y0) = iter.next()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (x0, y0, x0, y0);
    for (x, y) in iter {
      min_x = min_x.min(x);
      min_y = min_y.min(y);
      max_x = max_x.max(x);
      max_y = max_y.max(y);
    }
    Some(Rect::new(
      min_x,
      min_y,
      max_x.saturating_sub(min_x).saturating_add(1),
      max_y.saturating_sub(min_y).saturating_add(1),
    ))
  }
}

/// 装甲板角点
///
/// 坐标为整像素，`score` 为关键点置信度（四点模型恒为 1）。
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Keypoint {
  pub x: i32,
  pub y: i32,
  pub score: f32,
}

impl Keypoint {
  pub fn new(x: i32, y: i32, score: f32) -> Self {
    Self { x, y, score }
  }

  pub fn translate(&self, dx: i32, dy: i32) -> Keypoint {
    Keypoint::new(
      self.x.saturating_add(dx),
      self.y.saturating_add(dy),
      self.score,
    )
  }
}
