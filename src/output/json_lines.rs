// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/json_lines.rs - JSON Lines 结果记录
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
  fs::{File, OpenOptions},
  io::{BufWriter, Write},
  path::Path,
  sync::Mutex,
};

use chrono::{SecondsFormat, Utc};
use image::RgbImage;
use serde::Serialize;
use tracing::info;
use url::Url;

use super::{OutputError, Render};
use crate::{FromUrl, FromUrlWithScheme, pipeline::FrameResult};

#[derive(Serialize)]
struct FrameRecord<'a> {
  timestamp: String,
  frame: u64,
  width: u32,
  height: u32,
  #[serde(flatten)]
  result: &'a FrameResult,
}

struct Sink {
  writer: BufWriter<File>,
  frame: u64,
}

/// 每帧一行 JSON，追加写入文件
///
/// `jsonl:///path/to/result.jsonl`。
pub struct JsonLinesOutput {
  sink: Mutex<Sink>,
}

impl FromUrlWithScheme for JsonLinesOutput {
  const SCHEME: &'static str = "jsonl";
}

impl FromUrl for JsonLinesOutput {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch(url.scheme().to_string()));
    }
    Self::create(Path::new(url.path()))
  }
}

impl JsonLinesOutput {
  pub fn create(path: &Path) -> Result<Self, OutputError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    info!("检测结果写入: {}", path.display());
    Ok(Self {
      sink: Mutex::new(Sink {
        writer: BufWriter::new(file),
        frame: 0,
      }),
    })
  }
}

impl Render<RgbImage, FrameResult> for JsonLinesOutput {
  type Error = OutputError;

  fn render_result(&self, frame: &RgbImage, result: &FrameResult) -> Result<(), Self::Error> {
    let mut sink = self.sink.lock().map_err(|_| OutputError::Poisoned)?;
    let record = FrameRecord {
      timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
      frame: sink.frame,
      width: frame.width(),
      height: frame.height(),
      result,
    };
    serde_json::to_writer(&mut sink.writer, &record)?;
    sink.writer.write_all(b"\n")?;
    sink.writer.flush()?;
    sink.frame += 1;
    Ok(())
  }
}
