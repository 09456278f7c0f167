// 该文件是 Paizhao （牌照） 项目的一部分。
// src/service.rs - 对外命令接口
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

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::mpsc::Receiver;

use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
  capture::{CaptureBuffer, CaptureError, CaptureHandle, CaptureTiming},
  config::PlateConfig,
  frame::Frame,
  input::{FrameSourceFactory, UrlSourceFactory},
  ocr::TextRecognizer,
  output::{ArtifactWriter, OutputError},
  pipeline::DetectionPipeline,
  record::DetectionRecord,
  store::{HistoryRow, PlateStore, StoreError},
  task::{DetectionTasks, Dispatcher, Scheduler, ServiceEvent, TriggerError, TriggerKind},
};

#[derive(Error, Debug)]
pub enum ServiceError {
  #[error("帧来源 URL 无效: {0}")]
  SourceUrl(#[from] url::ParseError),
  #[error("采集错误: {0}")]
  Capture(#[from] CaptureError),
  #[error("采集已经在运行")]
  AlreadyCapturing,
  #[error("无法触发识别: {0}")]
  Trigger(#[from] TriggerError),
  #[error("数据库操作失败: {0}")]
  Store(#[from] StoreError),
  #[error("输出目录错误: {0}")]
  Output(#[from] OutputError),
  #[error("后台线程启动失败: {0}")]
  Spawn(std::io::Error),
}

/// 当前平台打开目录所用的程序
pub fn platform_opener() -> &'static str {
  if cfg!(target_os = "windows") {
    "explorer"
  } else if cfg!(target_os = "macos") {
    "open"
  } else {
    "xdg-open"
  }
}

/// 用 `opener` 打开目录，返回是否成功启动
pub fn open_location(opener: &str, path: &Path) -> bool {
  match Command::new(opener).arg(path).spawn() {
    Ok(_) => true,
    Err(e) => {
      warn!("无法用 {} 打开 {}: {}", opener, path.display(), e);
      false
    }
  }
}

/// 解析目录的绝对路径并用 `opener` 打开，打开失败时仍返回路径
pub fn open_directory(opener: &str, dir: &Path) -> Result<PathBuf, ServiceError> {
  let path =
    std::fs::canonicalize(dir).map_err(|e| ServiceError::Output(OutputError::IoError(e)))?;
  if open_location(opener, &path) {
    info!("已打开目录: {}", path.display());
  }
  Ok(path)
}

fn logged<T>(operation: &str, result: Result<T, StoreError>) -> Result<T, ServiceError> {
  result.map_err(|e| {
    error!("{} 失败: {}", operation, e);
    ServiceError::Store(e)
  })
}

/// 采集、识别与记录管理的命令接口
///
/// 每个命令都立即返回，不会阻塞采集线程；识别结果通过事件接收端送达。
pub struct PlateService {
  store: Arc<PlateStore>,
  buffer: Arc<CaptureBuffer>,
  capture: Option<CaptureHandle>,
  capture_timing: CaptureTiming,
  scheduler: Scheduler,
  dispatcher: Option<Dispatcher>,
  artifacts_dir: PathBuf,
}

impl PlateService {
  /// 打开数据库并启动识别线程
  pub fn new(
    config: &PlateConfig,
    recognizer: Box<dyn TextRecognizer>,
  ) -> Result<(Self, Receiver<ServiceEvent>), ServiceError> {
    let store = Arc::new(PlateStore::open(&config.database)?);
    Self::with_store(config, recognizer, store)
  }

  pub fn with_store(
    config: &PlateConfig,
    recognizer: Box<dyn TextRecognizer>,
    store: Arc<PlateStore>,
  ) -> Result<(Self, Receiver<ServiceEvent>), ServiceError> {
    let writer = ArtifactWriter::new(&config.artifacts_dir)?;
    let pipeline = DetectionPipeline::new(
      config.cascade.clone(),
      config.detect,
      recognizer,
      writer,
      store.clone(),
    );
    let buffer = Arc::new(CaptureBuffer::new());
    let DetectionTasks {
      scheduler,
      dispatcher,
      events,
    } = Scheduler::spawn(pipeline, buffer.clone(), config.scheduler)
      .map_err(ServiceError::Spawn)?;

    let service = Self {
      store,
      buffer,
      capture: None,
      capture_timing: config.capture,
      scheduler,
      dispatcher: Some(dispatcher),
      artifacts_dir: config.artifacts_dir.clone(),
    };
    Ok((service, events))
  }

  /// 开始采集并开启自动识别，设备打开失败时采集保持关闭
  pub fn start_capture(&mut self, factory: Arc<dyn FrameSourceFactory>) -> Result<(), ServiceError> {
    if self.capture.is_some() {
      return Err(ServiceError::AlreadyCapturing);
    }

    let handle = CaptureHandle::spawn(factory, self.buffer.clone(), self.capture_timing)
      .inspect_err(|e| error!("启动采集失败: {}", e))?;
    self.capture = Some(handle);
    self.scheduler.arm();
    info!("采集已开始");
    Ok(())
  }

  /// 按 URL 打开帧来源并开始采集
  pub fn start_source(&mut self, url: &str) -> Result<(), ServiceError> {
    let url = Url::parse(url)?;
    self.start_capture(Arc::new(UrlSourceFactory::new(url)))
  }

  /// 停止采集与自动识别，返回之前是否在采集
  pub fn stop_capture(&mut self) -> bool {
    let Some(handle) = self.capture.take() else {
      return false;
    };
    self.scheduler.disarm();
    handle.stop();
    self.buffer.clear();
    info!("采集已停止");
    true
  }

  pub fn is_capturing(&self) -> bool {
    self.capture.is_some()
  }

  /// 最新帧，用于预览
  pub fn latest_frame(&self) -> Option<Arc<Frame>> {
    self.buffer.latest()
  }

  /// 手动触发一次识别
  pub fn trigger(&self) -> Result<(), ServiceError> {
    let dispatcher = self.dispatcher.as_ref().ok_or(TriggerError::WorkerGone)?;
    dispatcher.fire(TriggerKind::Manual).inspect_err(|e| {
      info!("手动识别未触发: {}", e);
    })?;
    Ok(())
  }

  pub fn list_recent(&self, limit: usize) -> Result<Vec<DetectionRecord>, ServiceError> {
    logged("读取最近记录", self.store.list_recent(limit))
  }

  pub fn list_all(&self) -> Result<Vec<DetectionRecord>, ServiceError> {
    logged("读取全部记录", self.store.list_all())
  }

  pub fn delete(&self, id: i64) -> Result<bool, ServiceError> {
    logged("删除记录", self.store.delete(id))
  }

  pub fn rename_text(&self, id: i64, old: &str, new: &str) -> Result<bool, ServiceError> {
    logged("修改车牌文字", self.store.rename_text(id, old, new))
  }

  pub fn history(&self, limit: Option<usize>) -> Result<Vec<HistoryRow>, ServiceError> {
    logged("读取历史", self.store.history(limit))
  }

  /// 用系统文件管理器打开图像目录，打开失败时仍返回目录路径
  pub fn open_artifacts_location(&self) -> Result<PathBuf, ServiceError> {
    open_directory(platform_opener(), &self.artifacts_dir)
  }
}

impl Drop for PlateService {
  fn drop(&mut self) {
    self.stop_capture();
    self.dispatcher.take();
    self.scheduler.shutdown();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::input::{FrameSource, InputError};
  use crate::model::CascadeLocation;
  use crate::testing::{FixedText, stump_cascade};

  fn config(dir: &Path) -> PlateConfig {
    let cascade = dir.join("cascade.xml");
    std::fs::write(&cascade, stump_cascade(24, 8, 1.0)).unwrap();
    PlateConfig {
      cascade: CascadeLocation {
        primary: cascade,
        fallback: dir.join("missing.xml"),
      },
      artifacts_dir: dir.join("artifacts"),
      database: dir.join("plates.db"),
      ..PlateConfig::default()
    }
  }

  #[test]
  fn trigger_without_capture_has_no_frame() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _events) = PlateService::new(&config(dir.path()), Box::new(FixedText("A1"))).unwrap();
    assert!(matches!(
      service.trigger(),
      Err(ServiceError::Trigger(TriggerError::NoFrame))
    ));
    assert!(service.list_all().unwrap().is_empty());
  }

  #[test]
  fn failed_open_leaves_capture_off() {
    let dir = tempfile::tempdir().unwrap();
    let (mut service, _events) =
      PlateService::new(&config(dir.path()), Box::new(FixedText("A1"))).unwrap();
    let factory = || -> Result<Box<dyn FrameSource>, InputError> {
      Err(InputError::SchemeMismatch("camera".to_string()))
    };
    assert!(matches!(
      service.start_capture(Arc::new(factory)),
      Err(ServiceError::Capture(CaptureError::Open(_)))
    ));
    assert!(!service.is_capturing());
    assert!(!service.stop_capture());
  }

  #[test]
  fn bad_source_url_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (mut service, _events) =
      PlateService::new(&config(dir.path()), Box::new(FixedText("A1"))).unwrap();
    assert!(matches!(
      service.start_source("not a url"),
      Err(ServiceError::SourceUrl(_))
    ));
  }

  #[test]
  fn missing_opener_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    assert!(!open_location("paizhao-no-such-opener", dir.path()));
  }

  #[test]
  fn open_directory_resolves_path_even_without_opener() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("plates");
    std::fs::create_dir(&nested).unwrap();
    let resolved = open_directory("paizhao-no-such-opener", &nested.join("..").join("plates")).unwrap();
    assert_eq!(resolved, std::fs::canonicalize(&nested).unwrap());
    assert!(matches!(
      open_directory("paizhao-no-such-opener", &dir.path().join("absent")),
      Err(ServiceError::Output(_))
    ));
  }
}
