// 该文件是 Paizhao （牌照） 项目的一部分。
// src/pipeline.rs - 车牌识别流水线
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

use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  frame::Frame,
  model::{CascadeError, CascadeLocation, DetectParams, Model, PlateDetector},
  ocr::{TextRecognizer, recognize_plate},
  output::{ArtifactWriter, draw::annotate, timestamp_tag},
  process::RegionProcessor,
  record::{DetectionBatch, DetectionRecord, DetectionRecordBuilder, ProcessedPlate},
  store::PlateStore,
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("级联模型错误: {0}")]
  Cascade(#[from] CascadeError),
}

/// 一次识别的结果
#[derive(Debug, Clone)]
pub struct DetectionReport {
  /// 数据库 id，保存失败时为 None
  pub record_id: Option<i64>,
  pub record: DetectionRecord,
  pub plates: Vec<ProcessedPlate>,
  /// 不影响整体结果的问题，例如单个车牌识别失败
  pub warnings: Vec<String>,
  /// 标注了候选框的帧
  pub annotated: RgbImage,
  pub elapsed: Duration,
}

impl DetectionReport {
  pub fn summary(&self) -> &str {
    &self.record.summary
  }
}

/// 检测、裁剪、识别、组装记录、入库
pub struct DetectionPipeline {
  location: CascadeLocation,
  params: DetectParams,
  detector: Option<PlateDetector>,
  processor: RegionProcessor,
  recognizer: Box<dyn TextRecognizer>,
  writer: ArtifactWriter,
  builder: DetectionRecordBuilder,
  store: Arc<PlateStore>,
}

impl DetectionPipeline {
  pub fn new(
    location: CascadeLocation,
    params: DetectParams,
    recognizer: Box<dyn TextRecognizer>,
    writer: ArtifactWriter,
    store: Arc<PlateStore>,
  ) -> Self {
    Self {
      location,
      params,
      detector: None,
      processor: RegionProcessor::new(),
      recognizer,
      builder: DetectionRecordBuilder::new(writer.clone()),
      writer,
      store,
    }
  }

  /// 模型在第一次成功加载后缓存，加载失败只影响本次运行
  fn detector(&mut self) -> Result<&PlateDetector, PipelineError> {
    let detector = match self.detector.take() {
      Some(detector) => detector,
      None => PlateDetector::load(&self.location, self.params)?,
    };
    Ok(self.detector.insert(detector))
  }

  pub fn run(&mut self, frame: &Frame) -> Result<DetectionReport, PipelineError> {
    let started = Instant::now();
    let tag = timestamp_tag(&frame.captured_at());
    let rgb = frame.to_rgb_image();

    let captured = self.writer.captured_path(&tag);
    if let Err(e) = self.writer.write_rgb(&captured, &rgb) {
      warn!("原始帧写入失败: {}", e);
    }

    let result = self.detect_and_record(frame, &rgb, &tag, started);
    self.writer.remove(&captured);
    result
  }

  fn detect_and_record(
    &mut self,
    frame: &Frame,
    rgb: &RgbImage,
    tag: &str,
    started: Instant,
  ) -> Result<DetectionReport, PipelineError> {
    let gray = frame.to_gray();
    let candidates = self.detector()?.infer(&gray)?;
    info!("第 {} 帧检测到 {} 个候选车牌", frame.index(), candidates.len());

    let mut warnings = Vec::new();
    let mut plates = Vec::with_capacity(candidates.len());
    for (i, region) in self
      .processor
      .process_all(rgb, &candidates)
      .into_iter()
      .enumerate()
    {
      let recognition = recognize_plate(self.recognizer.as_ref(), &region.binary, i + 1);
      debug!("候选框 {:?} 识别为 {}", region.candidate, recognition.text);
      warnings.extend(recognition.warning);
      plates.push(ProcessedPlate {
        text: recognition.text,
        bbox: region.candidate,
        source_filename: None,
        binary: region.binary,
      });
    }

    let built = self.builder.build(DetectionBatch {
      captured_at: frame.captured_at(),
      plates,
    });
    warnings.extend(built.warnings);

    let annotated = annotate(rgb, &candidates);
    let processed = self.writer.processed_path(tag);
    match self.writer.write_rgb(&processed, &annotated) {
      Ok(()) => self.writer.remove(&processed),
      Err(e) => warn!("标注帧写入失败: {}", e),
    }

    let mut record = built.record;
    let record_id = match self.store.insert(&record) {
      Ok(id) => Some(id),
      Err(e) => {
        error!("检测记录保存失败: {}", e);
        warnings.push(format!("record not saved: {}", e));
        None
      }
    };
    record.id = record_id;

    let elapsed = started.elapsed();
    info!("识别完成, 耗时: {:.2?}", elapsed);

    Ok(DetectionReport {
      record_id,
      record,
      plates: built.plates,
      warnings,
      annotated,
      elapsed,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{FixedText, pipeline_in, plate_frame};

  #[test]
  fn failed_insert_still_reports() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PlateStore::open_in_memory().unwrap());
    let mut pipeline = pipeline_in(dir.path(), 1.0, Box::new(FixedText("AB12")), store.clone());
    store.drop_table();

    let report = pipeline.run(&plate_frame(1)).unwrap();
    assert_eq!(report.record_id, None);
    assert_eq!(report.record.id, None);
    assert_eq!(report.plates[0].text, "AB12");
    assert_eq!(report.record.plate_count, 1);
    assert!(report.warnings.iter().any(|w| w.starts_with("record not saved")));
  }

  #[test]
  fn cascade_is_loaded_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PlateStore::open_in_memory().unwrap());
    let mut pipeline = pipeline_in(dir.path(), 1.0, Box::new(FixedText("AB12")), store.clone());

    assert!(pipeline.run(&plate_frame(1)).unwrap().record_id.is_some());
    std::fs::remove_file(dir.path().join("cascade.xml")).unwrap();
    assert!(pipeline.run(&plate_frame(2)).unwrap().record_id.is_some());
    assert_eq!(store.list_all().unwrap().len(), 2);
  }
}
