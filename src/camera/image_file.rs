// 该文件是 Shanan （山南西风） 项目的一部分。
// src/camera/image_file.rs - 图像文件回放相机
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

use std::{
  collections::VecDeque,
  path::{Path, PathBuf},
  time::Duration,
};

use image::{ImageReader, RgbImage};
use tracing::{debug, error, info};
use url::Url;

use super::{CameraDevice, CameraError};
use crate::{FromUrl, FromUrlWithScheme};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "webp"];

/// 将一张图像或一个目录中的图像依次作为帧输出
///
/// `image:///path/to/frame.png` 或 `image:///path/to/dir?loop`，
/// 带 `loop` 参数时循环回放。曝光与增益设置对文件无意义，直接忽略。
#[derive(Debug)]
pub struct ImageFileCamera {
  frames: VecDeque<PathBuf>,
  looping: bool,
}

impl FromUrlWithScheme for ImageFileCamera {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileCamera {
  type Error = CameraError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(CameraError::SchemeMismatch(url.scheme().to_string()));
    }

    let looping = url.query_pairs().any(|(k, _)| k == "loop");
    Self::open(Path::new(url.path()), looping)
  }
}

impl ImageFileCamera {
  pub fn open(path: &Path, looping: bool) -> Result<Self, CameraError> {
    let frames: VecDeque<PathBuf> = if path.is_dir() {
      let mut entries = std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_image(p))
        .collect::<Vec<_>>();
      entries.sort();
      entries.into()
    } else {
      VecDeque::from([path.to_path_buf()])
    };

    if frames.is_empty() {
      return Err(CameraError::NoFrames(path.display().to_string()));
    }
    info!("图像回放源: {} 帧, 循环: {}", frames.len(), looping);
    Ok(Self { frames, looping })
  }
}

fn is_image(path: &Path) -> bool {
  path
    .extension()
    .and_then(|e| e.to_str())
    .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
    .unwrap_or(false)
}

impl CameraDevice for ImageFileCamera {
  fn capture(&mut self, _timeout: Duration) -> Result<RgbImage, CameraError> {
    let path = self.frames.pop_front().ok_or(CameraError::Exhausted)?;
    debug!("读取图像帧: {}", path.display());
    let image = ImageReader::open(&path)?.decode()?.into_rgb8();
    if self.looping {
      self.frames.push_back(path);
    }
    Ok(image)
  }

  fn set_exposure(&mut self, _exposure_us: u32) -> Result<(), CameraError> {
    Ok(())
  }

  fn set_gain(&mut self, _gain: f32) -> Result<(), CameraError> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  fn write_frame(dir: &Path, name: &str, value: u8) -> PathBuf {
    let path = dir.join(name);
    RgbImage::from_pixel(8, 6, Rgb([value, 0, 0]))
      .save(&path)
      .unwrap();
    path
  }

  #[test]
  fn test_directory_in_name_order() {
    let dir = tempfile::tempdir().unwrap();
    write_frame(dir.path(), "b.png", 20);
    write_frame(dir.path(), "a.png", 10);
    std::fs::write(dir.path().join("notes.txt"), "not a frame").unwrap();

    let url = Url::parse(&format!("image://{}", dir.path().display())).unwrap();
    let mut camera = ImageFileCamera::from_url(&url).unwrap();
    let timeout = Duration::from_millis(10);
    assert_eq!(camera.capture(timeout).unwrap().get_pixel(0, 0)[0], 10);
    assert_eq!(camera.capture(timeout).unwrap().get_pixel(0, 0)[0], 20);
    assert!(matches!(camera.capture(timeout), Err(CameraError::Exhausted)));
  }

  #[test]
  fn test_single_file_loops() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_frame(dir.path(), "frame.png", 42);

    let mut camera = ImageFileCamera::open(&path, true).unwrap();
    for _ in 0..3 {
      let frame = camera.capture(Duration::ZERO).unwrap();
      assert_eq!(frame.dimensions(), (8, 6));
    }
  }

  #[test]
  fn test_empty_directory() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
      ImageFileCamera::open(dir.path(), false),
      Err(CameraError::NoFrames(_))
    ));
  }

  #[test]
  fn test_scheme_mismatch() {
    let url = Url::parse("v4l:///dev/video0").unwrap();
    assert!(matches!(
      ImageFileCamera::from_url(&url),
      Err(CameraError::SchemeMismatch(_))
    ));
  }
}
