// 该文件是 Paizhao （牌照） 项目的一部分。
// src/config.rs - 运行配置
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

use std::path::PathBuf;

use crate::{
  capture::CaptureTiming,
  model::{CascadeLocation, DetectParams},
  store::DEFAULT_DATABASE,
  task::SchedulerTiming,
};

/// 默认摄像头
pub const DEFAULT_CAMERA: &str = "v4l:///dev/video0";
/// 默认 tesseract 可执行文件，按 PATH 查找
pub const DEFAULT_TESSERACT: &str = "tesseract";
/// 未设置 TESSDATA_PREFIX 时使用的语言数据目录
pub const DEFAULT_TESSDATA: &str = "/usr/share/tesseract-ocr/5/tessdata";
/// 最近记录默认条数
pub const DEFAULT_RECENT_LIMIT: usize = 20;

#[derive(Debug, Clone)]
pub struct PlateConfig {
  /// 帧来源 URL，例如 `v4l:///dev/video0` 或 `image:///tmp/car.jpg`
  pub camera: String,
  pub cascade: CascadeLocation,
  pub detect: DetectParams,
  pub tesseract: PathBuf,
  pub tessdata: PathBuf,
  /// 车牌图像等文件的目录
  pub artifacts_dir: PathBuf,
  pub database: PathBuf,
  pub capture: CaptureTiming,
  pub scheduler: SchedulerTiming,
  pub recent_limit: usize,
}

/// 语言数据目录：优先 TESSDATA_PREFIX
pub fn default_tessdata() -> PathBuf {
  std::env::var_os("TESSDATA_PREFIX")
    .map(PathBuf::from)
    .unwrap_or_else(|| PathBuf::from(DEFAULT_TESSDATA))
}

impl Default for PlateConfig {
  fn default() -> Self {
    Self {
      camera: DEFAULT_CAMERA.to_string(),
      cascade: CascadeLocation::default(),
      detect: DetectParams::default(),
      tesseract: PathBuf::from(DEFAULT_TESSERACT),
      tessdata: default_tessdata(),
      artifacts_dir: PathBuf::from("."),
      database: PathBuf::from(DEFAULT_DATABASE),
      capture: CaptureTiming::default(),
      scheduler: SchedulerTiming::default(),
      recent_limit: DEFAULT_RECENT_LIMIT,
    }
  }
}
