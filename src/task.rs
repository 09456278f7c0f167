// 该文件是 Paizhao （牌照） 项目的一部分。
// src/task.rs - 识别任务调度
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

//! 识别任务
//!
//! 同一时刻最多只有一次识别在运行：触发方用 `busy` 标志抢占，
//! 再把帧放入深度为 1 的队列交给唯一的识别线程。识别线程完成后清除标志，
//! 并把结果发给调度线程，由调度线程转发给界面。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  capture::CaptureBuffer,
  frame::Frame,
  input::FrameSource,
  pipeline::{DetectionPipeline, DetectionReport, PipelineError},
};

pub trait Task<I, P>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, pipeline: P) -> Result<Self::Output, Self::Error>;
}

/// 读取一帧并识别一次
pub struct OneShotTask;

impl<'p, S: FrameSource> Task<S, &'p mut DetectionPipeline> for OneShotTask {
  type Output = DetectionReport;
  type Error = anyhow::Error;

  fn run_task(
    self,
    mut input: S,
    pipeline: &'p mut DetectionPipeline,
  ) -> Result<DetectionReport, Self::Error> {
    info!("开始任务...");
    let frame = input.read_frame()?;
    info!("输入帧获取成功，开始识别...");
    let report = pipeline.run(&frame)?;
    info!("识别完成，耗时: {:.2?}", report.elapsed);
    Ok(report)
  }
}

/// 触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
  Auto,
  Manual,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerError {
  #[error("上一次识别尚未完成")]
  Busy,
  #[error("还没有可用的帧")]
  NoFrame,
  #[error("识别线程已退出")]
  WorkerGone,
}

/// 发给界面的事件
#[derive(Debug)]
pub enum ServiceEvent {
  DetectionCompleted {
    kind: TriggerKind,
    report: Box<DetectionReport>,
  },
  DetectionFailed {
    kind: TriggerKind,
    error: String,
  },
  TriggerSkipped {
    kind: TriggerKind,
    reason: TriggerError,
  },
}

struct WorkItem {
  kind: TriggerKind,
  frame: Arc<Frame>,
}

enum SchedulerMessage {
  Arm,
  Disarm,
  Finished {
    kind: TriggerKind,
    outcome: Result<DetectionReport, PipelineError>,
  },
  Shutdown,
}

/// 识别触发器，可以在任意线程中克隆使用
#[derive(Clone)]
pub struct Dispatcher {
  busy: Arc<AtomicBool>,
  buffer: Arc<CaptureBuffer>,
  work_tx: SyncSender<WorkItem>,
}

impl Dispatcher {
  /// 用当前最新帧发起一次识别，不等待识别完成
  pub fn fire(&self, kind: TriggerKind) -> Result<(), TriggerError> {
    if self.busy.swap(true, Ordering::AcqRel) {
      return Err(TriggerError::Busy);
    }

    let Some(frame) = self.buffer.latest() else {
      self.busy.store(false, Ordering::Release);
      return Err(TriggerError::NoFrame);
    };

    debug!("{:?} 触发识别, 帧 {}", kind, frame.index());
    match self.work_tx.try_send(WorkItem { kind, frame }) {
      Ok(()) => Ok(()),
      Err(TrySendError::Full(_)) => Err(TriggerError::Busy),
      Err(TrySendError::Disconnected(_)) => {
        self.busy.store(false, Ordering::Release);
        Err(TriggerError::WorkerGone)
      }
    }
  }

  pub fn is_busy(&self) -> bool {
    self.busy.load(Ordering::Acquire)
  }
}

/// 自动触发的时间参数
#[derive(Debug, Clone, Copy)]
pub struct SchedulerTiming {
  /// 开始采集后第一次自动识别前的等待
  pub initial_delay: Duration,
  pub period: Duration,
  /// 缓冲区还没有帧时的重试间隔
  pub no_frame_retry: Duration,
}

impl Default for SchedulerTiming {
  fn default() -> Self {
    Self {
      initial_delay: Duration::from_secs(2),
      period: Duration::from_secs(5),
      no_frame_retry: Duration::from_secs(1),
    }
  }
}

/// 调度线程与识别线程
pub struct Scheduler {
  tx: Sender<SchedulerMessage>,
  handle: Option<JoinHandle<()>>,
}

/// `Scheduler::spawn` 的返回值
pub struct DetectionTasks {
  pub scheduler: Scheduler,
  pub dispatcher: Dispatcher,
  pub events: Receiver<ServiceEvent>,
}

impl Scheduler {
  pub fn spawn(
    pipeline: DetectionPipeline,
    buffer: Arc<CaptureBuffer>,
    timing: SchedulerTiming,
  ) -> std::io::Result<DetectionTasks> {
    let busy = Arc::new(AtomicBool::new(false));
    let (work_tx, work_rx) = mpsc::sync_channel::<WorkItem>(1);
    let (tx, rx) = mpsc::channel::<SchedulerMessage>();
    let (event_tx, event_rx) = mpsc::channel::<ServiceEvent>();

    let worker = {
      let busy = busy.clone();
      let done_tx = tx.clone();
      thread::Builder::new()
        .name("detection".to_string())
        .spawn(move || worker_loop(pipeline, work_rx, busy, done_tx))?
    };

    let dispatcher = Dispatcher {
      busy,
      buffer,
      work_tx,
    };

    let handle = {
      let dispatcher = dispatcher.clone();
      thread::Builder::new()
        .name("scheduler".to_string())
        .spawn(move || scheduler_loop(rx, dispatcher, event_tx, timing, worker))?
    };

    Ok(DetectionTasks {
      scheduler: Scheduler {
        tx,
        handle: Some(handle),
      },
      dispatcher,
      events: event_rx,
    })
  }

  /// 开始自动识别
  pub fn arm(&self) {
    let _ = self.tx.send(SchedulerMessage::Arm);
  }

  /// 停止自动识别，正在进行的识别照常完成
  pub fn disarm(&self) {
    let _ = self.tx.send(SchedulerMessage::Disarm);
  }

  /// 退出调度线程并等待识别线程结束
  ///
  /// 调用前须丢弃所有 `Dispatcher` 副本，否则识别线程不会退出。
  pub fn shutdown(&mut self) {
    let _ = self.tx.send(SchedulerMessage::Shutdown);
    if let Some(handle) = self.handle.take() {
      if handle.join().is_err() {
        warn!("调度线程异常退出");
      }
    }
  }
}

impl Drop for Scheduler {
  fn drop(&mut self) {
    self.shutdown();
  }
}

fn worker_loop(
  mut pipeline: DetectionPipeline,
  work_rx: Receiver<WorkItem>,
  busy: Arc<AtomicBool>,
  done_tx: Sender<SchedulerMessage>,
) {
  info!("识别线程开始运行");
  while let Ok(item) = work_rx.recv() {
    let outcome = pipeline.run(&item.frame);
    busy.store(false, Ordering::Release);
    if done_tx
      .send(SchedulerMessage::Finished {
        kind: item.kind,
        outcome,
      })
      .is_err()
    {
      break;
    }
  }
  info!("识别线程退出");
}

fn scheduler_loop(
  rx: Receiver<SchedulerMessage>,
  dispatcher: Dispatcher,
  events: Sender<ServiceEvent>,
  timing: SchedulerTiming,
  worker: JoinHandle<()>,
) {
  let mut next_tick: Option<Instant> = None;

  loop {
    let message = match next_tick {
      Some(deadline) => {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
          Ok(message) => Some(message),
          Err(RecvTimeoutError::Timeout) => None,
          Err(RecvTimeoutError::Disconnected) => break,
        }
      }
      None => match rx.recv() {
        Ok(message) => Some(message),
        Err(_) => break,
      },
    };

    match message {
      None => {
        next_tick = Some(match dispatcher.fire(TriggerKind::Auto) {
          Ok(()) => Instant::now() + timing.period,
          Err(TriggerError::NoFrame) => {
            debug!("缓冲区还没有帧, 稍后重试");
            Instant::now() + timing.no_frame_retry
          }
          Err(reason) => {
            debug!("跳过自动识别: {}", reason);
            let _ = events.send(ServiceEvent::TriggerSkipped {
              kind: TriggerKind::Auto,
              reason,
            });
            Instant::now() + timing.period
          }
        });
      }
      Some(SchedulerMessage::Arm) => {
        info!("自动识别已开启");
        next_tick = Some(Instant::now() + timing.initial_delay);
      }
      Some(SchedulerMessage::Disarm) => {
        info!("自动识别已关闭");
        next_tick = None;
      }
      Some(SchedulerMessage::Finished { kind, outcome }) => {
        let event = match outcome {
          Ok(report) => ServiceEvent::DetectionCompleted {
            kind,
            report: Box::new(report),
          },
          Err(e) => {
            error!("识别失败: {}", e);
            ServiceEvent::DetectionFailed {
              kind,
              error: e.to_string(),
            }
          }
        };
        let _ = events.send(event);
      }
      Some(SchedulerMessage::Shutdown) => break,
    }
  }

  drop(dispatcher);
  if worker.join().is_err() {
    warn!("识别线程异常退出");
  }
  info!("调度线程退出");
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ocr::{OcrError, TextRecognizer};
  use crate::store::PlateStore;
  use crate::testing::{FixedText, pipeline_in, plate_frame};
  use image::GrayImage;
  use std::sync::Mutex;

  const WAIT: Duration = Duration::from_secs(10);

  /// 每次识别都要等测试放行
  struct Gate(Mutex<Receiver<()>>);

  impl TextRecognizer for Gate {
    fn recognize(&self, _: &GrayImage) -> Result<String, OcrError> {
      let _ = self.0.lock().unwrap().recv();
      Ok("GATE1".to_string())
    }
  }

  fn fast_timing() -> SchedulerTiming {
    SchedulerTiming {
      initial_delay: Duration::from_millis(10),
      period: Duration::from_millis(20),
      no_frame_retry: Duration::from_millis(5),
    }
  }

  #[test]
  fn empty_buffer_reports_no_frame() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PlateStore::open_in_memory().unwrap());
    let pipeline = pipeline_in(dir.path(), 1.0, Box::new(FixedText("AB1")), store);
    let buffer = Arc::new(CaptureBuffer::new());
    let DetectionTasks {
      mut scheduler,
      dispatcher,
      ..
    } = Scheduler::spawn(pipeline, buffer, fast_timing()).unwrap();

    assert_eq!(dispatcher.fire(TriggerKind::Manual), Err(TriggerError::NoFrame));
    assert!(!dispatcher.is_busy());

    drop(dispatcher);
    scheduler.shutdown();
  }

  #[test]
  fn second_trigger_while_running_is_busy() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PlateStore::open_in_memory().unwrap());
    let (release_tx, release_rx) = mpsc::channel();
    let pipeline = pipeline_in(
      dir.path(),
      1.0,
      Box::new(Gate(Mutex::new(release_rx))),
      store.clone(),
    );
    let buffer = Arc::new(CaptureBuffer::new());
    buffer.publish(plate_frame(1));
    let DetectionTasks {
      mut scheduler,
      dispatcher,
      events,
    } = Scheduler::spawn(pipeline, buffer, fast_timing()).unwrap();

    assert_eq!(dispatcher.fire(TriggerKind::Manual), Ok(()));
    assert_eq!(dispatcher.fire(TriggerKind::Manual), Err(TriggerError::Busy));

    release_tx.send(()).unwrap();
    match events.recv_timeout(WAIT).unwrap() {
      ServiceEvent::DetectionCompleted { kind, report } => {
        assert_eq!(kind, TriggerKind::Manual);
        assert_eq!(report.record.plate_count, 1);
        assert!(report.record_id.is_some());
      }
      other => panic!("unexpected event: {:?}", other),
    }
    assert!(!dispatcher.is_busy());

    // 空闲后可以再次触发
    release_tx.send(()).unwrap();
    assert_eq!(dispatcher.fire(TriggerKind::Manual), Ok(()));
    assert!(matches!(
      events.recv_timeout(WAIT).unwrap(),
      ServiceEvent::DetectionCompleted { .. }
    ));
    assert_eq!(store.list_all().unwrap().len(), 2);

    drop(dispatcher);
    scheduler.shutdown();
  }

  #[test]
  fn armed_scheduler_waits_for_first_frame() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PlateStore::open_in_memory().unwrap());
    let pipeline = pipeline_in(dir.path(), 1.0, Box::new(FixedText("AUTO1")), store);
    let buffer = Arc::new(CaptureBuffer::new());
    let DetectionTasks {
      mut scheduler,
      dispatcher,
      events,
    } = Scheduler::spawn(pipeline, buffer.clone(), fast_timing()).unwrap();

    scheduler.arm();
    thread::sleep(Duration::from_millis(30));
    buffer.publish(plate_frame(7));

    // 识别较慢时后续的自动触发会被跳过，先到的可能是跳过事件
    let report = loop {
      match events.recv_timeout(WAIT).unwrap() {
        ServiceEvent::DetectionCompleted { kind, report } => {
          assert_eq!(kind, TriggerKind::Auto);
          break report;
        }
        ServiceEvent::TriggerSkipped { reason, .. } => assert_eq!(reason, TriggerError::Busy),
        other => panic!("unexpected event: {:?}", other),
      }
    };
    assert_eq!(report.plates[0].text, "AUTO1");

    scheduler.disarm();
    drop(dispatcher);
    scheduler.shutdown();
  }

  #[test]
  fn pipeline_failure_is_reported_as_event() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PlateStore::open_in_memory().unwrap());
    let pipeline = pipeline_in(dir.path(), 1.0, Box::new(FixedText("X")), store);
    std::fs::remove_file(dir.path().join("cascade.xml")).unwrap();
    let buffer = Arc::new(CaptureBuffer::new());
    buffer.publish(plate_frame(1));
    let DetectionTasks {
      mut scheduler,
      dispatcher,
      events,
    } = Scheduler::spawn(pipeline, buffer, fast_timing()).unwrap();

    dispatcher.fire(TriggerKind::Manual).unwrap();
    match events.recv_timeout(WAIT).unwrap() {
      ServiceEvent::DetectionFailed { kind, error } => {
        assert_eq!(kind, TriggerKind::Manual);
        assert!(error.contains("cascade.xml"));
      }
      other => panic!("unexpected event: {:?}", other),
    }

    drop(dispatcher);
    scheduler.shutdown();
  }
}
