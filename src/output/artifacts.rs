// 该文件是 Paizhao （牌照） 项目的一部分。
// src/output/artifacts.rs - 识别过程中的图像文件
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

use chrono::{DateTime, Local};
use image::{GrayImage, RgbImage};
use tracing::{debug, warn};

use crate::output::OutputError;

/// 文件名中使用的时间戳，精确到秒
pub fn timestamp_tag(time: &DateTime<Local>) -> String {
  time.format("%Y%m%d_%H%M%S").to_string()
}

/// 图像文件目录
///
/// 原始帧 `captured_*` 与标注帧 `processed_*` 在一次识别结束后删除，
/// 车牌二值图 `plate_*` 会保留，并由数据库记录引用。
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
  directory: PathBuf,
}

impl ArtifactWriter {
  pub fn new(directory: impl Into<PathBuf>) -> Result<Self, OutputError> {
    let directory = directory.into();
    if !directory.as_os_str().is_empty() {
      std::fs::create_dir_all(&directory)?;
    }
    Ok(Self { directory })
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  pub fn captured_path(&self, tag: &str) -> PathBuf {
    self.directory.join(format!("captured_{}.jpg", tag))
  }

  pub fn plate_path(&self, tag: &str, text: &str) -> PathBuf {
    self.directory.join(format!("plate_{}_{}.jpg", tag, text))
  }

  pub fn processed_path(&self, tag: &str) -> PathBuf {
    self.directory.join(format!("processed_{}.jpg", tag))
  }

  pub fn write_rgb(&self, path: &Path, image: &RgbImage) -> Result<(), OutputError> {
    image.save(path)?;
    debug!("写入图像文件: {}", path.display());
    Ok(())
  }

  pub fn write_gray(&self, path: &Path, image: &GrayImage) -> Result<(), OutputError> {
    image.save(path)?;
    debug!("写入图像文件: {}", path.display());
    Ok(())
  }

  /// 删除临时文件，文件不存在时什么也不做
  pub fn remove(&self, path: &Path) {
    match std::fs::remove_file(path) {
      Ok(()) => debug!("删除临时文件: {}", path.display()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => warn!("删除临时文件 {} 失败: {}", path.display(), e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn names_carry_timestamp_and_text() {
    let time = Local.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
    let tag = timestamp_tag(&time);
    assert_eq!(tag, "20240305_070809");

    let writer = ArtifactWriter::new("").unwrap();
    assert_eq!(
      writer.plate_path(&tag, "AB123"),
      PathBuf::from("plate_20240305_070809_AB123.jpg")
    );
    assert_eq!(
      writer.captured_path(&tag),
      PathBuf::from("captured_20240305_070809.jpg")
    );
    assert_eq!(
      writer.processed_path(&tag),
      PathBuf::from("processed_20240305_070809.jpg")
    );
  }

  #[test]
  fn creates_directory_and_removes_files() {
    let dir = tempfile::tempdir().unwrap();
    let writer = ArtifactWriter::new(dir.path().join("artifacts")).unwrap();
    assert!(writer.directory().is_dir());

    let path = writer.captured_path("x");
    writer.write_rgb(&path, &RgbImage::new(4, 4)).unwrap();
    assert!(path.is_file());
    writer.remove(&path);
    assert!(!path.exists());
    // 再次删除不报错
    writer.remove(&path);
  }
}
