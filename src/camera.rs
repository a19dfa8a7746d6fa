// 该文件是 Shanan （山南西风） 项目的一部分。
// src/camera.rs - 相机采集边界
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
  sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use image::RgbImage;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

mod image_file;
pub use self::image_file::ImageFileCamera;

#[cfg(feature = "v4l_camera")]
mod v4l_device;
#[cfg(feature = "v4l_camera")]
pub use self::v4l_device::V4lCamera;

/// 打开相机时应用的曝光时间（微秒）
pub const DEFAULT_EXPOSURE_US: u32 = 40000;
pub const DEFAULT_GAIN: f32 = 5.0;
pub const DEFAULT_GRAB_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Error, Debug)]
pub enum CameraError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("没有可用的图像: {0}")]
  NoFrames(String),
  #[error("帧数据无效: {0}")]
  InvalidFrame(String),
  #[error("采集源已结束")]
  Exhausted,
  #[error("相机锁已中毒")]
  Poisoned,
}

/// 相机设备：带超时的采集与曝光、增益设置
pub trait CameraDevice: Send {
  fn capture(&mut self, timeout: Duration) -> Result<RgbImage, CameraError>;
  fn set_exposure(&mut self, exposure_us: u32) -> Result<(), CameraError>;
  fn set_gain(&mut self, gain: f32) -> Result<(), CameraError>;
}

/// 已注册的相机
///
/// 采集与参数设置共用一把锁，可在采集线程与操作员线程之间共享。
pub struct Camera<D> {
  id: usize,
  device: Mutex<D>,
  grab_timeout: Duration,
}

impl<D: CameraDevice> Camera<D> {
  pub fn id(&self) -> usize {
    self.id
  }

  pub fn with_grab_timeout(mut self, timeout: Duration) -> Self {
    self.grab_timeout = timeout;
    self
  }

  /// 采集一帧，失败时记录警告并返回错误
  pub fn grab(&self) -> Result<RgbImage, CameraError> {
    let mut device = self.device.lock().map_err(|_| CameraError::Poisoned)?;
    match device.capture(self.grab_timeout) {
      Err(CameraError::Exhausted) => Err(CameraError::Exhausted),
      Err(e) => {
        warn!("相机 {} 采集失败: {}", self.id, e);
        Err(e)
      }
      frame => frame,
    }
  }

  pub fn set_exposure(&self, exposure_us: u32) -> Result<(), CameraError> {
    let mut device = self.device.lock().map_err(|_| CameraError::Poisoned)?;
    device.set_exposure(exposure_us)?;
    info!("相机 {} 曝光时间设置为 {} us", self.id, exposure_us);
    Ok(())
  }

  pub fn set_gain(&self, gain: f32) -> Result<(), CameraError> {
    let mut device = self.device.lock().map_err(|_| CameraError::Poisoned)?;
    device.set_gain(gain)?;
    info!("相机 {} 增益设置为 {}", self.id, gain);
    Ok(())
  }
}

/// 相机实例编号分配
#[derive(Debug, Default)]
pub struct CameraRegistry {
  next_id: AtomicUsize,
}

impl CameraRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// 分配编号并应用默认曝光与增益
  pub fn register<D: CameraDevice>(&self, mut device: D) -> Result<Camera<D>, CameraError> {
    device.set_exposure(DEFAULT_EXPOSURE_US)?;
    device.set_gain(DEFAULT_GAIN)?;

    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    info!(
      "相机 {} 已打开, 曝光 {} us, 增益 {}",
      id, DEFAULT_EXPOSURE_US, DEFAULT_GAIN
    );
    Ok(Camera {
      id,
      device: Mutex::new(device),
      grab_timeout: DEFAULT_GRAB_TIMEOUT,
    })
  }

  /// 已注册的相机数量
  pub fn count(&self) -> usize {
    self.next_id.load(Ordering::Relaxed)
  }
}

/// 由 URL 选择的相机设备
pub enum CameraWrapper {
  ImageFile(ImageFileCamera),
  #[cfg(feature = "v4l_camera")]
  V4l(V4lCamera),
}

impl FromUrl for CameraWrapper {
  type Error = CameraError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      ImageFileCamera::SCHEME => Ok(CameraWrapper::ImageFile(ImageFileCamera::from_url(url)?)),
      #[cfg(feature = "v4l_camera")]
      V4lCamera::SCHEME => Ok(CameraWrapper::V4l(V4lCamera::from_url(url)?)),
      other => Err(CameraError::SchemeMismatch(other.to_string())),
    }
  }
}

impl CameraDevice for CameraWrapper {
  fn capture(&mut self, timeout: Duration) -> Result<RgbImage, CameraError> {
    match self {
      CameraWrapper::ImageFile(d) => d.capture(timeout),
      #[cfg(feature = "v4l_camera")]
      CameraWrapper::V4l(d) => d.capture(timeout),
    }
  }

  fn set_exposure(&mut self, exposure_us: u32) -> Result<(), CameraError> {
    match self {
      CameraWrapper::ImageFile(d) => d.set_exposure(exposure_us),
      #[cfg(feature = "v4l_camera")]
      CameraWrapper::V4l(d) => d.set_exposure(exposure_us),
    }
  }

  fn set_gain(&mut self, gain: f32) -> Result<(), CameraError> {
    match self {
      CameraWrapper::ImageFile(d) => d.set_gain(gain),
      #[cfg(feature = "v4l_camera")]
      CameraWrapper::V4l(d) => d.set_gain(gain),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[derive(Default)]
  struct FakeDevice {
    exposure: u32,
    gain: f32,
    remaining: usize,
    fail_next: bool,
  }

  impl CameraDevice for FakeDevice {
    fn capture(&mut self, _timeout: Duration) -> Result<RgbImage, CameraError> {
      if std::mem::take(&mut self.fail_next) {
        return Err(CameraError::InvalidFrame("超时".into()));
      }
      if self.remaining == 0 {
        return Err(CameraError::Exhausted);
      }
      self.remaining -= 1;
      Ok(RgbImage::new(4, 3))
    }

    fn set_exposure(&mut self, exposure_us: u32) -> Result<(), CameraError> {
      self.exposure = exposure_us;
      Ok(())
    }

    fn set_gain(&mut self, gain: f32) -> Result<(), CameraError> {
      self.gain = gain;
      Ok(())
    }
  }

  #[test]
  fn test_register_applies_defaults_and_numbers() {
    let registry = CameraRegistry::new();
    let first = registry.register(FakeDevice::default()).unwrap();
    let second = registry.register(FakeDevice::default()).unwrap();
    assert_eq!((first.id(), second.id()), (0, 1));
    assert_eq!(registry.count(), 2);

    let device = first.device.lock().unwrap();
    assert_eq!(device.exposure, DEFAULT_EXPOSURE_US);
    assert_eq!(device.gain, DEFAULT_GAIN);
  }

  #[test]
  fn test_grab_reports_failure_then_recovers() {
    let registry = CameraRegistry::new();
    let camera = registry
      .register(FakeDevice {
        remaining: 1,
        fail_next: true,
        ..FakeDevice::default()
      })
      .unwrap();
    assert!(matches!(camera.grab(), Err(CameraError::InvalidFrame(_))));
    assert_eq!(camera.grab().unwrap().dimensions(), (4, 3));
    assert!(matches!(camera.grab(), Err(CameraError::Exhausted)));
  }

  #[test]
  fn test_setters_shared_across_threads() {
    let registry = CameraRegistry::new();
    let camera = Arc::new(registry.register(FakeDevice::default()).unwrap());
    let handle = {
      let camera = Arc::clone(&camera);
      std::thread::spawn(move || camera.set_exposure(12000))
    };
    handle.join().unwrap().unwrap();
    camera.set_gain(2.5).unwrap();

    let device = camera.device.lock().unwrap();
    assert_eq!(device.exposure, 12000);
    assert_eq!(device.gain, 2.5);
  }

  #[test]
  fn test_wrapper_opens_image_source() {
    let dir = tempfile::tempdir().unwrap();
    RgbImage::new(6, 5).save(dir.path().join("a.png")).unwrap();

    let url = Url::parse(&format!("image://{}", dir.path().display())).unwrap();
    let mut wrapper = CameraWrapper::from_url(&url).unwrap();
    assert!(matches!(wrapper, CameraWrapper::ImageFile(_)));
    wrapper.set_exposure(1000).unwrap();
    wrapper.set_gain(1.0).unwrap();
    let frame = wrapper.capture(DEFAULT_GRAB_TIMEOUT).unwrap();
    assert_eq!(frame.dimensions(), (6, 5));
    assert!(matches!(
      wrapper.capture(DEFAULT_GRAB_TIMEOUT),
      Err(CameraError::Exhausted)
    ));

    let url = Url::parse("gige://camera0").unwrap();
    assert!(matches!(
      CameraWrapper::from_url(&url),
      Err(CameraError::SchemeMismatch(_))
    ));
  }
}
