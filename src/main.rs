// 该文件是 Paizhao （牌照） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use std::io::BufRead;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use paizhao::{
  FromUrl,
  config::PlateConfig,
  input::{InputWrapper, camera_url},
  ocr::TesseractOcr,
  output::ArtifactWriter,
  pipeline::{DetectionPipeline, DetectionReport},
  service::{PlateService, ServiceError, open_directory, platform_opener},
  store::PlateStore,
  task::{OneShotTask, ServiceEvent, Task},
};

use args::{Args, Command};

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(200);

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let database = args.database;

  match args.command {
    Command::Run {
      engine,
      input,
      camera,
      duration,
    } => {
      let source = match camera {
        Some(index) => camera_url(index)?,
        None => input,
      };
      let mut config = engine.to_config(database);
      config.camera = source.to_string();
      run(&config, duration)
    }
    Command::Detect {
      engine,
      input,
      json,
    } => detect(&engine.to_config(database), &input, json),
    Command::List { limit, all, json } => {
      let store = PlateStore::open(&database)?;
      let records = if all {
        store.list_all()?
      } else {
        store.list_recent(limit)?
      };
      if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
      } else if records.is_empty() {
        println!("没有检测记录");
      } else {
        for record in &records {
          println!(
            "#{} {} ({} 个车牌)",
            record.id.unwrap_or_default(),
            record.timestamp,
            record.plate_count
          );
          for line in record.summary.lines() {
            println!("    {}", line);
          }
        }
      }
      Ok(())
    }
    Command::History { limit, json } => {
      let store = PlateStore::open(&database)?;
      let rows = store.history(limit)?;
      if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
      } else {
        println!("{:>6}  {:<10}  {:<8}  {:<16}  {:>6}  文件", "ID", "日期", "时间", "车牌", "数量");
        for row in &rows {
          println!(
            "{:>6}  {:<10}  {:<8}  {:<16}  {:>6}  {}",
            row.id, row.date, row.time, row.plate, row.plate_count, row.filename
          );
        }
      }
      Ok(())
    }
    Command::Delete { id } => {
      let store = PlateStore::open(&database)?;
      if store.delete(id)? {
        println!("已删除记录 {}", id);
      } else {
        println!("记录 {} 不存在", id);
      }
      Ok(())
    }
    Command::Rename { id, old, new } => {
      let store = PlateStore::open(&database)?;
      if store.rename_text(id, &old, &new)? {
        println!("记录 {} 中的车牌 {} 已改为 {}", id, old, new);
      } else {
        println!("记录 {} 中没有车牌 {}", id, old);
      }
      Ok(())
    }
    Command::Open { artifacts } => {
      let path = open_directory(platform_opener(), &artifacts)?;
      println!("{}", path.display());
      Ok(())
    }
  }
}

/// 启动时校验 OCR 资源
fn recognizer(config: &PlateConfig) -> Result<TesseractOcr> {
  Ok(TesseractOcr::new(&config.tesseract, &config.tessdata)?)
}

fn print_report(report: &DetectionReport) {
  match report.record_id {
    Some(id) => println!("已保存记录 {}", id),
    None => println!("记录未保存"),
  }
  println!("{}", report.summary());
  for plate in &report.plates {
    if let Some(path) = &plate.source_filename {
      println!("    {} -> {}", plate.text, path.display());
    }
  }
  for warning in &report.warnings {
    warn!("{}", warning);
  }
}

fn detect(config: &PlateConfig, input: &Url, json: bool) -> Result<()> {
  let ocr = recognizer(config)?;
  let store = Arc::new(PlateStore::open(&config.database)?);
  let writer = ArtifactWriter::new(&config.artifacts_dir)?;
  let mut pipeline = DetectionPipeline::new(
    config.cascade.clone(),
    config.detect,
    Box::new(ocr),
    writer,
    store,
  );

  let source = InputWrapper::from_url(input)?;
  let report = OneShotTask.run_task(source, &mut pipeline)?;
  if json {
    println!("{}", serde_json::to_string_pretty(&report.record)?);
  } else {
    print_report(&report);
  }
  Ok(())
}

fn run(config: &PlateConfig, duration: Option<u64>) -> Result<()> {
  let ocr = recognizer(config)?;
  let (mut service, events) = PlateService::new(config, Box::new(ocr))?;
  service.start_source(&config.camera)?;
  info!("开始采集: {}", config.camera);

  let (stop_tx, stop_rx) = mpsc::channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = stop_tx.send(());
  })?;

  // 回车触发一次手动识别
  let (manual_tx, manual_rx) = mpsc::channel();
  thread::Builder::new()
    .name("stdin".to_string())
    .spawn(move || {
      for _ in std::io::stdin().lock().lines() {
        if manual_tx.send(()).is_err() {
          break;
        }
      }
    })?;

  let deadline = duration.map(|secs| Instant::now() + Duration::from_secs(secs));
  loop {
    if stop_rx.try_recv().is_ok() {
      break;
    }
    if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
      info!("达到指定运行时长, 退出");
      break;
    }
    if manual_rx.try_recv().is_ok() {
      match service.trigger() {
        Ok(()) => info!("手动识别已触发"),
        Err(ServiceError::Trigger(reason)) => println!("无法识别: {}", reason),
        Err(e) => return Err(e.into()),
      }
    }

    match events.recv_timeout(EVENT_POLL_INTERVAL) {
      Ok(ServiceEvent::DetectionCompleted { kind, report }) => {
        info!("{:?} 识别完成", kind);
        print_report(&report);
      }
      Ok(ServiceEvent::DetectionFailed { kind, error }) => {
        println!("{:?} 识别失败: {}", kind, error);
      }
      Ok(ServiceEvent::TriggerSkipped { kind, reason }) => {
        info!("{:?} 识别跳过: {}", kind, reason);
      }
      Err(RecvTimeoutError::Timeout) => {}
      Err(RecvTimeoutError::Disconnected) => break,
    }
  }

  service.stop_capture();
  print_recent(&service, config.recent_limit);
  Ok(())
}

fn print_recent(service: &PlateService, limit: usize) {
  match service.list_recent(limit) {
    Ok(records) => {
      println!("最近 {} 条记录:", records.len());
      for record in records {
        println!(
          "#{} {} {}",
          record.id.unwrap_or_default(),
          record.timestamp,
          record.summary.lines().next().unwrap_or_default()
        );
      }
    }
    Err(e) => warn!("无法读取最近记录: {}", e),
  }
}
