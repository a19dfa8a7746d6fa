// 该文件是 Shanan （山南西风） 项目的一部分。
// src/camera/v4l_device.rs - V4L2 工业相机
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

use std::{pin::Pin, time::Duration};

use image::RgbImage;
use tracing::{debug, error, info};
use url::Url;
use v4l::{
  FourCC,
  buffer::Type,
  control::{Control, Value},
  io::{mmap::Stream, traits::CaptureStream},
  prelude::*,
  video::Capture,
};

use super::{CameraDevice, CameraError};
use crate::{FromUrl, FromUrlWithScheme};

/// V4L2_CID_EXPOSURE_ABSOLUTE，单位 100 微秒
const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const V4L2_CID_GAIN: u32 = 0x0098_0913;
const V4L_DEFAULT_WIDTH: u32 = 640;
const V4L_DEFAULT_HEIGHT: u32 = 480;
const V4L_BUFFER_COUNT: u32 = 4;

/// YUYV 输出的 V4L2 相机
///
/// `v4l:///dev/video0?width=1280&height=1024`。
/// 捕获流引用设备，设备用 `Pin<Box>` 固定在堆上，保证地址不变。
pub struct V4lCamera {
  device: Pin<Box<Device>>,
  stream: Option<Stream<'static>>,
  width: u32,
  height: u32,
  timeout: Option<Duration>,
}

impl FromUrlWithScheme for V4lCamera {
  const SCHEME: &'static str = "v4l";
}

impl FromUrl for V4lCamera {
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

    let device_path = if url.path().is_empty() || url.path() == "/" {
      "/dev/video0".to_string()
    } else {
      url.path().to_string()
    };
    let query = |key: &str, default: u32| -> u32 {
      url
        .query_pairs()
        .find(|(k, _)| k == key)
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(default)
    };

    Self::open(
      &device_path,
      query("width", V4L_DEFAULT_WIDTH),
      query("height", V4L_DEFAULT_HEIGHT),
    )
  }
}

impl V4lCamera {
  pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
    info!("打开 V4L2 设备: {}", device_path);
    let device = Box::pin(Device::with_path(device_path)?);

    let mut format = device.format()?;
    format.width = width;
    format.height = height;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device.set_format(&format)?;
    if format.fourcc != FourCC::new(b"YUYV") {
      return Err(CameraError::InvalidFrame(format!(
        "设备不支持 YUYV, 实际格式 {}",
        format.fourcc
      )));
    }
    debug!("V4L2 格式: {}x{} {}", format.width, format.height, format.fourcc);

    let mut camera = Self {
      device,
      stream: None,
      width: format.width,
      height: format.height,
      timeout: None,
    };

    // SAFETY: device 被 Pin<Box> 固定在堆上不会移动；
    // stream 与 device 存放在同一结构体中，Drop 时先释放 stream
    let device_ref: &Device = &camera.device;
    let stream = unsafe {
      let device_static: &'static Device = std::mem::transmute(device_ref);
      Stream::with_buffers(device_static, Type::VideoCapture, V4L_BUFFER_COUNT)?
    };
    camera.stream = Some(stream);
    Ok(camera)
  }

  fn set_integer_control(&self, id: u32, value: i64) -> Result<(), CameraError> {
    self.device.set_control(Control {
      id,
      value: Value::Integer(value),
    })?;
    Ok(())
  }
}

impl Drop for V4lCamera {
  fn drop(&mut self) {
    self.stream.take();
  }
}

/// YUYV (4:2:2) 转 RGB，BT.601
pub(crate) fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
  let mut rgb = Vec::with_capacity((width * height * 3) as usize);

  for chunk in yuyv.chunks_exact(4) {
    let u = chunk[1] as f32 - 128.0;
    let v = chunk[3] as f32 - 128.0;
    for y in [chunk[0] as f32, chunk[2] as f32] {
      let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);
    }
  }

  rgb
}

impl CameraDevice for V4lCamera {
  fn capture(&mut self, timeout: Duration) -> Result<RgbImage, CameraError> {
    let stream = self.stream.as_mut().ok_or(CameraError::Exhausted)?;
    if self.timeout != Some(timeout) {
      stream.set_timeout(timeout);
      self.timeout = Some(timeout);
    }

    let (buffer, _meta) = stream.next()?;
    let rgb = yuyv_to_rgb(buffer, self.width, self.height);
    RgbImage::from_raw(self.width, self.height, rgb).ok_or_else(|| {
      CameraError::InvalidFrame(format!(
        "缓冲区大小 {} 与 {}x{} 不符",
        buffer.len(),
        self.width,
        self.height
      ))
    })
  }

  fn set_exposure(&mut self, exposure_us: u32) -> Result<(), CameraError> {
    self.set_integer_control(V4L2_CID_EXPOSURE_ABSOLUTE, (exposure_us / 100).max(1) as i64)
  }

  fn set_gain(&mut self, gain: f32) -> Result<(), CameraError> {
    self.set_integer_control(V4L2_CID_GAIN, gain.round() as i64)
  }
}
