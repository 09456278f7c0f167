// 该文件是 Paizhao （牌照） 项目的一部分。
// src/capture.rs - 帧缓冲与连续采集
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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  frame::Frame,
  input::{FrameSourceFactory, InputError},
};

/// 读帧失败后的等待时间
pub const READ_RETRY_INTERVAL: Duration = Duration::from_millis(100);
/// 每帧发布后的间隔
pub const FRAME_INTERVAL: Duration = Duration::from_millis(30);

/// 单槽帧缓冲
///
/// 采集线程整体替换槽中的帧，读取方拿到的是某一时刻完整帧的句柄。
#[derive(Debug, Default)]
pub struct CaptureBuffer {
  slot: Mutex<Option<Arc<Frame>>>,
}

impl CaptureBuffer {
  pub fn new() -> Self {
    Self::default()
  }

  /// 发布最新帧，覆盖旧帧
  pub fn publish(&self, frame: Frame) {
    let frame = Arc::new(frame);
    let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
    *slot = Some(frame);
  }

  /// 取当前最新帧
  pub fn latest(&self) -> Option<Arc<Frame>> {
    self
      .slot
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn is_empty(&self) -> bool {
    self.latest().is_none()
  }

  pub fn clear(&self) {
    self
      .slot
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
  }
}

#[derive(Error, Debug)]
pub enum CaptureError {
  #[error("无法打开摄像头: {0}")]
  Open(#[from] InputError),
  #[error("采集线程启动失败: {0}")]
  Spawn(std::io::Error),
  #[error("采集线程在打开设备前退出")]
  ThreadExited,
}

/// 采集线程的时间参数
#[derive(Debug, Clone, Copy)]
pub struct CaptureTiming {
  pub retry_interval: Duration,
  pub frame_interval: Duration,
}

impl Default for CaptureTiming {
  fn default() -> Self {
    Self {
      retry_interval: READ_RETRY_INTERVAL,
      frame_interval: FRAME_INTERVAL,
    }
  }
}

/// 正在运行的采集线程
pub struct CaptureHandle {
  stop: Arc<AtomicBool>,
  handle: Option<JoinHandle<()>>,
}

impl CaptureHandle {
  /// 启动采集线程
  ///
  /// 设备在线程内打开，打开失败会直接返回错误，采集保持关闭。
  pub fn spawn(
    factory: Arc<dyn FrameSourceFactory>,
    buffer: Arc<CaptureBuffer>,
    timing: CaptureTiming,
  ) -> Result<Self, CaptureError> {
    let stop = Arc::new(AtomicBool::new(false));
    let (opened_tx, opened_rx) = mpsc::channel::<Result<(), InputError>>();

    let thread_stop = stop.clone();
    let handle = thread::Builder::new()
      .name("capture".to_string())
      .spawn(move || {
        let mut source = match factory.open() {
          Ok(source) => {
            let _ = opened_tx.send(Ok(()));
            source
          }
          Err(e) => {
            let _ = opened_tx.send(Err(e));
            return;
          }
        };
        drop(opened_tx);

        info!(
          "采集线程开始运行: {}x{}",
          source.width(),
          source.height()
        );
        while !thread_stop.load(Ordering::Acquire) {
          match source.read_frame() {
            Ok(frame) => {
              debug!("采集到第 {} 帧", frame.index());
              buffer.publish(frame);
              thread::sleep(timing.frame_interval);
            }
            Err(e) => {
              warn!("读取帧失败, 稍后重试: {}", e);
              thread::sleep(timing.retry_interval);
            }
          }
        }
        info!("采集线程退出");
      })
      .map_err(CaptureError::Spawn)?;

    match opened_rx.recv() {
      Ok(Ok(())) => Ok(Self {
        stop,
        handle: Some(handle),
      }),
      Ok(Err(e)) => {
        let _ = handle.join();
        Err(CaptureError::Open(e))
      }
      Err(_) => {
        let _ = handle.join();
        Err(CaptureError::ThreadExited)
      }
    }
  }

  pub fn is_running(&self) -> bool {
    self
      .handle
      .as_ref()
      .map(|handle| !handle.is_finished())
      .unwrap_or(false)
  }

  /// 停止采集并等待线程退出，设备随线程释放
  pub fn stop(mut self) {
    self.shutdown();
  }

  fn shutdown(&mut self) {
    self.stop.store(true, Ordering::Release);
    if let Some(handle) = self.handle.take() {
      if handle.join().is_err() {
        warn!("采集线程异常退出");
      }
    }
  }
}

impl Drop for CaptureHandle {
  fn drop(&mut self) {
    self.shutdown();
  }
}
