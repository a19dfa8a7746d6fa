// 该文件是 Shanan （山南西风） 项目的一部分。
// src/letterbox.rs - 等比缩放与填充
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

use image::{Rgb, RgbImage, imageops};
use thiserror::Error;

/// 填充区域的灰度值
pub const LETTERBOX_FILL: u8 = 124;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LetterboxError {
  #[error("区域过于狭长: {width}x{height} 缩放到 {target_size} 后为空")]
  Degenerate {
    width: u32,
    height: u32,
    target_size: u32,
  },
  #[error("图像尺寸不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  SizeMismatch {
    expected: (u32, u32),
    actual: (u32, u32),
  },
}

/// 从感兴趣区域到模型输入的等比缩放映射
///
/// 缩放后的图像放置在 `target_size × target_size` 画布的 `(pad_x, pad_y)` 处，
/// 整除余下的一个像素落在右侧/下侧。构造后不可变，解码与重映射共用同一份。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  scale: f32,
  pad_x: u32,
  pad_y: u32,
  new_width: u32,
  new_height: u32,
  source_width: u32,
  source_height: u32,
  target_size: u32,
}

impl Letterbox {
  pub fn new(source_width: u32, source_height: u32, target_size: u32) -> Result<Self, LetterboxError> {
    let degenerate = LetterboxError::Degenerate {
      width: source_width,
      height: source_height,
      target_size,
    };
    if source_width == 0 || source_height == 0 {
      return Err(degenerate);
    }

    let scale = (target_size as f32 / source_width as f32)
      .min(target_size as f32 / source_height as f32);
    let new_width = (source_width as f32 * scale) as u32;
    let new_height = (source_height as f32 * scale) as u32;

    if new_width == 0 || new_height == 0 {
      return Err(degenerate);
    }

    Ok(Self {
      scale,
      pad_x: target_size.saturating_sub(new_width) / 2,
      pad_y: target_size.saturating_sub(new_height) / 2,
      new_width,
      new_height,
      source_width,
      source_height,
      target_size,
    })
  }

  pub fn scale(&self) -> f32 {
    self.scale
  }

  pub fn pad_x(&self) -> u32 {
    self.pad_x
  }

  pub fn pad_y(&self) -> u32 {
    self.pad_y
  }

  pub fn new_size(&self) -> (u32, u32) {
    (self.new_width, self.new_height)
  }

  pub fn source_size(&self) -> (u32, u32) {
    (self.source_width, self.source_height)
  }

  pub fn target_size(&self) -> u32 {
    self.target_size
  }

  /// 模型坐标 → 区域坐标，结果不小于 0
  pub fn to_source(&self, px: f32, py: f32) -> (f32, f32) {
    let x = (px - self.pad_x as f32) / self.scale;
    let y = (py - self.pad_y as f32) / self.scale;
    (x.max(0.0), y.max(0.0))
  }

  /// 模型坐标 → 区域整像素坐标（四舍五入）
  pub fn to_source_pixel(&self, px: f32, py: f32) -> (i32, i32) {
    (
      self.round_source(px - self.pad_x as f32),
      self.round_source(py - self.pad_y as f32),
    )
  }

  /// 已减去填充的模型长度 → 区域整像素，负值截为 0
  pub(crate) fn round_source(&self, unpadded: f32) -> i32 {
    (unpadded / self.scale + 0.5).max(0.0) as i32
  }

  /// 模型长度（宽、高）→ 区域像素长度（四舍五入）
  pub(crate) fn round_length(&self, length: f32) -> i32 {
    (length / self.scale + 0.5) as i32
  }

  /// 区域坐标 → 模型坐标
  pub fn to_model(&self, x: f32, y: f32) -> (f32, f32) {
    (
      x * self.scale + self.pad_x as f32,
      y * self.scale + self.pad_y as f32,
    )
  }

  /// 区域局部像素坐标是否落在区域内
  pub fn contains_source(&self, x: i32, y: i32) -> bool {
    x >= 0 && y >= 0 && (x as u32) < self.source_width && (y as u32) < self.source_height
  }

  /// 将区域图像缩放并填充为模型输入
  pub fn apply(&self, view: &RgbImage) -> Result<RgbImage, LetterboxError> {
    if view.dimensions() != (self.source_width, self.source_height) {
      return Err(LetterboxError::SizeMismatch {
        expected: (self.source_width, self.source_height),
        actual: view.dimensions(),
      });
    }

    let resized = imageops::resize(
      view,
      self.new_width,
      self.new_height,
      imageops::FilterType::Triangle,
    );

    let mut canvas = RgbImage::from_pixel(
      self.target_size,
      self.target_size,
      Rgb([LETTERBOX_FILL; 3]),
    );
    imageops::replace(&mut canvas, &resized, self.pad_x as i64, self.pad_y as i64);

    Ok(canvas)
  }
}
