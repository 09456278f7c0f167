// 该文件是 Paizhao （牌照） 项目的一部分。
// src/record.rs - 识别结果记录
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

use std::collections::BTreeMap;
use std::path::PathBuf;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Local};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  model::PlateCandidate,
  output::{ArtifactWriter, timestamp_tag},
};

const PLATE_PREFIX: &str = "plate_";
const FILENAME_PREFIX: &str = "filename_";

#[derive(Error, Debug)]
pub enum RecordError {
  #[error("车牌数据 JSON 解析失败: {0}")]
  Json(#[from] serde_json::Error),
  #[error("车牌图像 base64 解码失败: {0}")]
  Base64(#[from] base64::DecodeError),
}

/// 识别完成的单个车牌
#[derive(Debug, Clone)]
pub struct ProcessedPlate {
  pub text: String,
  pub bbox: PlateCandidate,
  /// 车牌图像文件，写入失败时为 None
  pub source_filename: Option<PathBuf>,
  pub binary: GrayImage,
}

/// 一次触发得到的所有车牌，顺序与检测顺序一致
#[derive(Debug, Clone)]
pub struct DetectionBatch {
  pub captured_at: DateTime<Local>,
  pub plates: Vec<ProcessedPlate>,
}

/// 以车牌文字为键的图像表
///
/// `plate_<text>` 保存图像文件的 base64，`filename_<text>` 保存文件名。
/// 同一批次中文字相同的车牌，后者覆盖前者。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlateImages(BTreeMap<String, String>);

impl PlateImages {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, text: &str, image: &[u8], filename: &str) {
    self
      .0
      .insert(format!("{}{}", PLATE_PREFIX, text), STANDARD.encode(image));
    self
      .0
      .insert(format!("{}{}", FILENAME_PREFIX, text), filename.to_string());
  }

  pub fn contains(&self, text: &str) -> bool {
    self.0.contains_key(&format!("{}{}", PLATE_PREFIX, text))
  }

  pub fn image(&self, text: &str) -> Result<Option<Vec<u8>>, RecordError> {
    self
      .0
      .get(&format!("{}{}", PLATE_PREFIX, text))
      .map(|encoded| STANDARD.decode(encoded))
      .transpose()
      .map_err(RecordError::from)
  }

  pub fn filename(&self, text: &str) -> Option<&str> {
    self
      .0
      .get(&format!("{}{}", FILENAME_PREFIX, text))
      .map(String::as_str)
  }

  /// 所有车牌文字，按键排序
  pub fn texts(&self) -> impl Iterator<Item = &str> {
    self.0.keys().filter_map(|key| key.strip_prefix(PLATE_PREFIX))
  }

  pub fn plate_len(&self) -> usize {
    self.texts().count()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.0.keys().map(String::as_str)
  }

  /// 重命名车牌文字，`plate_<old>` 不存在时返回 false 且不做任何修改
  pub fn rename(&mut self, old: &str, new: &str) -> bool {
    let Some(image) = self.0.remove(&format!("{}{}", PLATE_PREFIX, old)) else {
      return false;
    };
    let filename = self.0.remove(&format!("{}{}", FILENAME_PREFIX, old));
    self.0.insert(format!("{}{}", PLATE_PREFIX, new), image);
    if let Some(filename) = filename {
      self.0.insert(format!("{}{}", FILENAME_PREFIX, new), filename);
    }
    true
  }

  /// 编码为 JSON 字节
  pub fn to_blob(&self) -> Result<Vec<u8>, RecordError> {
    Ok(serde_json::to_vec(self)?)
  }

  /// 从 JSON 字节解码，空数据视为空表
  pub fn from_blob(blob: &[u8]) -> Result<Self, RecordError> {
    if blob.is_empty() {
      return Ok(Self::new());
    }
    Ok(serde_json::from_slice(blob)?)
  }
}

/// 持久化的检测记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRecord {
  /// 写入数据库后分配
  pub id: Option<i64>,
  /// ISO-8601 本地时间，精确到微秒
  pub timestamp: String,
  pub plate_count: i64,
  pub plate_images: PlateImages,
  pub summary: String,
}

/// 记录时间戳
pub fn iso_timestamp(time: &DateTime<Local>) -> String {
  time.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// 摘要文本：首行为总数，之后每行一个车牌
pub fn summary(plates: &[ProcessedPlate]) -> String {
  let mut lines = vec![format!("Plates detected: {}", plates.len())];
  lines.extend(plates.iter().map(|plate| {
    format!(
      "Plate {}: {}x{}px at ({}, {})",
      plate.text, plate.bbox.width, plate.bbox.height, plate.bbox.x, plate.bbox.y
    )
  }));
  lines.join("\n")
}

/// 替换摘要中所有 `Plate <old>:`
pub fn rename_in_summary(summary: &str, old: &str, new: &str) -> String {
  summary.replace(&format!("Plate {}:", old), &format!("Plate {}:", new))
}

/// 构建结果
#[derive(Debug, Clone)]
pub struct BuiltRecord {
  pub record: DetectionRecord,
  /// 已填写 `source_filename` 的车牌
  pub plates: Vec<ProcessedPlate>,
  pub warnings: Vec<String>,
}

/// 把一个批次写成车牌图像文件并组装成记录
pub struct DetectionRecordBuilder {
  writer: ArtifactWriter,
}

impl DetectionRecordBuilder {
  pub fn new(writer: ArtifactWriter) -> Self {
    Self { writer }
  }

  pub fn build(&self, batch: DetectionBatch) -> BuiltRecord {
    let tag = timestamp_tag(&batch.captured_at);
    let mut images = PlateImages::new();
    let mut warnings = Vec::new();
    let mut plates = Vec::with_capacity(batch.plates.len());

    for mut plate in batch.plates {
      let path = self.writer.plate_path(&tag, &plate.text);
      let written = self
        .writer
        .write_gray(&path, &plate.binary)
        .map_err(|e| e.to_string())
        .and_then(|_| std::fs::read(&path).map_err(|e| e.to_string()));

      match written {
        Ok(bytes) => {
          let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
          if images.contains(&plate.text) {
            debug!("车牌文字 {} 重复, 覆盖之前的图像", plate.text);
          }
          images.insert(&plate.text, &bytes, &filename);
          plate.source_filename = Some(path);
        }
        Err(e) => {
          warn!("车牌 {} 图像写入失败: {}", plate.text, e);
          warnings.push(format!("plate {}: image not saved: {}", plate.text, e));
          plate.source_filename = None;
        }
      }
      plates.push(plate);
    }

    let record = DetectionRecord {
      id: None,
      timestamp: iso_timestamp(&Local::now()),
      plate_count: plates.len() as i64,
      plate_images: images,
      summary: summary(&plates),
    };

    BuiltRecord {
      record,
      plates,
      warnings,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn plate(text: &str, x: i32) -> ProcessedPlate {
    ProcessedPlate {
      text: text.to_string(),
      bbox: PlateCandidate::new(x, 20, 120, 40),
      source_filename: None,
      binary: GrayImage::from_pixel(12, 4, image::Luma([255])),
    }
  }

  fn builder(dir: &std::path::Path) -> DetectionRecordBuilder {
    DetectionRecordBuilder::new(ArtifactWriter::new(dir).unwrap())
  }

  #[test]
  fn summary_lists_every_plate() {
    let plates = vec![plate("AB123", 10), plate("Unknown_2", 300)];
    assert_eq!(
      summary(&plates),
      "Plates detected: 2\nPlate AB123: 120x40px at (10, 20)\nPlate Unknown_2: 120x40px at (300, 20)"
    );
    assert_eq!(summary(&[]), "Plates detected: 0");
  }

  #[test]
  fn summary_rename_replaces_every_occurrence() {
    let text = "Plates detected: 2\nPlate AB: 1x1px at (0, 0)\nPlate AB: 2x2px at (1, 1)\nPlate ABC: 3x3px at (2, 2)";
    let renamed = rename_in_summary(text, "AB", "ZZ");
    assert_eq!(renamed.matches("Plate ZZ:").count(), 2);
    assert!(renamed.contains("Plate ABC:"));
  }

  #[test]
  fn distinct_texts_give_one_key_pair_each() {
    let dir = tempfile::tempdir().unwrap();
    let batch = DetectionBatch {
      captured_at: Local::now(),
      plates: vec![plate("AAA111", 0), plate("BBB222", 200), plate("CCC333", 400)],
    };
    let built = builder(dir.path()).build(batch);
    assert_eq!(built.record.plate_count, 3);
    assert_eq!(built.record.plate_images.plate_len(), 3);
    assert!(built.plates.iter().all(|p| p.source_filename.is_some()));

    let blob = built.record.plate_images.to_blob().unwrap();
    let decoded = PlateImages::from_blob(&blob).unwrap();
    assert_eq!(decoded.plate_len(), 3);
    let bytes = decoded.image("BBB222").unwrap().unwrap();
    let source = built.plates[1].source_filename.as_ref().unwrap();
    assert_eq!(bytes, std::fs::read(source).unwrap());
    // 只保存文件名，不含目录
    let filename = decoded.filename("BBB222").unwrap();
    assert!(filename.starts_with("plate_") && filename.ends_with("_BBB222.jpg"));
    assert_eq!(Some(filename), source.file_name().and_then(|name| name.to_str()));
  }

  #[test]
  fn shared_text_collapses_keys_but_keeps_count() {
    let dir = tempfile::tempdir().unwrap();
    let batch = DetectionBatch {
      captured_at: Local::now(),
      plates: vec![plate("SAME", 0), plate("SAME", 200)],
    };
    let built = builder(dir.path()).build(batch);
    assert_eq!(built.record.plate_count, 2);
    assert_eq!(built.record.plate_images.plate_len(), 1);
    assert_eq!(built.record.plate_images.keys().count(), 2);
  }

  #[test]
  fn unwritable_plate_is_left_out_of_the_map() {
    let dir = tempfile::tempdir().unwrap();
    let writer = ArtifactWriter::new(dir.path().join("gone")).unwrap();
    std::fs::remove_dir(writer.directory()).unwrap();
    let batch = DetectionBatch {
      captured_at: Local::now(),
      plates: vec![plate("AB123", 0)],
    };
    let built = DetectionRecordBuilder::new(writer).build(batch);
    assert_eq!(built.record.plate_count, 1);
    assert!(built.record.plate_images.is_empty());
    assert_eq!(built.warnings.len(), 1);
    assert!(built.record.summary.contains("Plate AB123:"));
  }

  #[test]
  fn rename_moves_both_keys_only() {
    let mut images = PlateImages::new();
    images.insert("ABC123", b"one", "plate_a.jpg");
    images.insert("KEEP1", b"two", "plate_b.jpg");

    assert!(!images.rename("MISSING", "X"));
    assert!(images.rename("ABC123", "XYZ789"));
    assert!(!images.contains("ABC123"));
    assert_eq!(images.filename("XYZ789"), Some("plate_a.jpg"));
    assert_eq!(images.image("XYZ789").unwrap(), Some(b"one".to_vec()));
    assert_eq!(images.filename("KEEP1"), Some("plate_b.jpg"));
  }

  #[test]
  fn empty_blob_is_empty_map() {
    assert!(PlateImages::from_blob(b"").unwrap().is_empty());
    assert!(PlateImages::from_blob(b"{}").unwrap().is_empty());
    assert!(PlateImages::from_blob(b"not json").is_err());
  }

  #[test]
  fn timestamp_has_microseconds() {
    use chrono::TimeZone;
    let time = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    assert_eq!(iso_timestamp(&time), "2024-01-02T03:04:05.000000");
  }
}
