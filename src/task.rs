// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 任务定义
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
  io::BufRead,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    mpsc::{self, RecvTimeoutError, Sender},
  },
  thread,
  time::{Duration, Instant},
};

use image::RgbImage;
use tracing::{info, warn};

use crate::{
  camera::{Camera, CameraDevice, CameraError},
  geometry::Rect,
  inference::InferenceBackend,
  output::Render,
  pipeline::{ArmorPipeline, FrameResult},
};

/// 采集线程与处理线程之间最多缓存的帧数
const FRAME_QUEUE_DEPTH: usize = 2;
/// 等待新帧时检查退出信号的间隔
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

/// 采集一帧，检测并输出
#[derive(Default, Debug)]
pub struct OneShotTask {
  roi: Option<Rect>,
}

impl OneShotTask {
  pub fn with_roi(mut self, roi: Option<Rect>) -> Self {
    self.roi = roi;
    self
  }
}

impl<D, B, O> Task<Camera<D>, ArmorPipeline<B>, O> for OneShotTask
where
  D: CameraDevice,
  B: InferenceBackend,
  O: Render<RgbImage, FrameResult>,
  O::Error: std::error::Error + Sync + Send + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, camera: Camera<D>, pipeline: ArmorPipeline<B>, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = camera.grab()?;
    info!("输入帧获取成功，开始检测...");
    let now = Instant::now();
    let result = process(&pipeline, &frame, self.roi)?;
    info!("检测完成，{} 个目标，耗时: {:.2?}", result.len(), now.elapsed());
    output.render_result(&frame, &result)?;
    Ok(())
  }
}

/// 采集线程 → 有界队列 → 处理线程
#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  roi: Option<Rect>,
  exposure_control: bool,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_roi(mut self, roi: Option<Rect>) -> Self {
    self.roi = roi;
    self
  }

  /// 从标准输入读取曝光时间
  pub fn with_exposure_control(mut self, enabled: bool) -> Self {
    self.exposure_control = enabled;
    self
  }
}

impl<D, B, O> Task<Camera<D>, ArmorPipeline<B>, O> for ContinuousTask
where
  D: CameraDevice + 'static,
  B: InferenceBackend,
  O: Render<RgbImage, FrameResult>,
  O::Error: std::error::Error + Sync + Send + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, camera: Camera<D>, pipeline: ArmorPipeline<B>, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let camera = Arc::new(camera);
    let running = Arc::new(AtomicBool::new(true));
    let (stop_tx, stop_rx) = mpsc::channel();

    let interrupt = stop_tx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = interrupt.send(());
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    }) {
      warn!("无法注册中断处理: {}", e);
    }

    if self.exposure_control {
      let camera = camera.clone();
      let stop = stop_tx.clone();
      // 标准输入阻塞读取，线程随进程结束
      thread::spawn(move || {
        let stdin = std::io::stdin();
        exposure_control_loop(stdin.lock(), &camera, &stop);
      });
    }

    let (frame_tx, frame_rx) = mpsc::sync_channel(FRAME_QUEUE_DEPTH);
    let producer = {
      let camera = camera.clone();
      let running = running.clone();
      thread::spawn(move || {
        while running.load(Ordering::Acquire) {
          match camera.grab() {
            Ok(frame) => {
              if frame_tx.send(frame).is_err() {
                break;
              }
            }
            Err(CameraError::Exhausted) => {
              info!("相机 {} 没有更多帧", camera.id());
              break;
            }
            // 已在 grab 中记录
            Err(_) => continue,
          }
        }
      })
    };

    let mut frame_index = 0;
    let mut now = Instant::now();
    let outcome = loop {
      if stop_rx.try_recv().is_ok() {
        warn!("收到退出信号，退出任务循环");
        break Ok(());
      }
      let frame = match frame_rx.recv_timeout(POLL_INTERVAL) {
        Ok(frame) => frame,
        Err(RecvTimeoutError::Timeout) => continue,
        Err(RecvTimeoutError::Disconnected) => break Ok(()),
      };

      frame_index += 1;
      info!("处理第 {} 帧图像", frame_index);
      let result = match process(&pipeline, &frame, self.roi) {
        Ok(result) => result,
        Err(e) => break Err(e),
      };
      let elapsed_a = now.elapsed();
      if let Err(e) = output.render_result(&frame, &result) {
        break Err(e.into());
      }
      let elapsed_b = now.elapsed();
      now = Instant::now();
      info!(
        "检测完成，{} 个目标，耗时: {:.2?} / {:.2?}",
        result.len(),
        elapsed_a,
        elapsed_b
      );
      if self.frame_number.is_some_and(|n| frame_index >= n) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break Ok(());
      }
    };

    running.store(false, Ordering::Release);
    drop(frame_rx);
    if producer.join().is_err() {
      warn!("采集线程异常退出");
    }

    info!("任务完成，共处理 {} 帧", frame_index);
    outcome
  }
}

fn process<B: InferenceBackend>(
  pipeline: &ArmorPipeline<B>,
  frame: &RgbImage,
  roi: Option<Rect>,
) -> anyhow::Result<FrameResult> {
  let result = match roi {
    Some(roi) => pipeline.process(frame, roi)?,
    None => pipeline.process_full(frame)?,
  };
  Ok(result)
}

/// 逐行读取曝光时间（微秒）
///
/// `0` 请求退出，无法解析的输入会被忽略。
pub fn exposure_control_loop<R: BufRead, D: CameraDevice>(
  reader: R,
  camera: &Camera<D>,
  stop: &Sender<()>,
) {
  for line in reader.lines() {
    let line = match line {
      Ok(line) => line,
      Err(e) => {
        warn!("读取标准输入失败: {}", e);
        break;
      }
    };
    let text = line.trim();
    if text.is_empty() {
      continue;
    }
    match text.parse::<u32>() {
      Ok(0) => {
        info!("操作员请求退出");
        let _ = stop.send(());
        break;
      }
      Ok(exposure) => {
        if let Err(e) = camera.set_exposure(exposure) {
          warn!("设置曝光失败: {}", e);
        }
      }
      Err(_) => warn!("无效的曝光时间输入: {:?}", text),
    }
  }
}
