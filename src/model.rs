// 该文件是 Paizhao （牌照） 项目的一部分。
// src/model.rs - 模型
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

use image::GrayImage;
use serde::Serialize;
use tracing::{debug, info};

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 候选车牌区域，单位为源帧像素
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlateCandidate {
  pub x: i32,
  pub y: i32,
  pub width: i32,
  pub height: i32,
}

impl PlateCandidate {
  pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
    Self {
      x,
      y,
      width,
      height,
    }
  }
}

/// 多尺度检测参数
#[derive(Debug, Clone, Copy)]
pub struct DetectParams {
  /// 图像金字塔每层的缩放比例
  pub scale_factor: f64,
  /// 候选框至少需要的相邻框数量
  pub min_neighbors: usize,
}

impl Default for DetectParams {
  fn default() -> Self {
    Self {
      scale_factor: 1.2,
      min_neighbors: 5,
    }
  }
}

mod cascade;
pub use self::cascade::{CascadeClassifier, CascadeError, group_rectangles};

/// 级联分类器模型文件位置：首选路径与备用路径
#[derive(Debug, Clone)]
pub struct CascadeLocation {
  pub primary: PathBuf,
  pub fallback: PathBuf,
}

impl Default for CascadeLocation {
  fn default() -> Self {
    Self {
      primary: PathBuf::from("haarcascades/haarcascade_russian_plate_number.xml"),
      fallback: PathBuf::from("haarcascade_russian_plate_number.xml"),
    }
  }
}

impl CascadeLocation {
  /// 找到第一个存在的模型文件
  pub fn resolve(&self) -> Result<&Path, CascadeError> {
    for path in [&self.primary, &self.fallback] {
      if path.is_file() {
        debug!("使用级联模型文件: {}", path.display());
        return Ok(path.as_path());
      }
    }
    Err(CascadeError::NotFound {
      primary: self.primary.clone(),
      fallback: self.fallback.clone(),
    })
  }
}

/// 车牌检测器
pub struct PlateDetector {
  classifier: CascadeClassifier,
  params: DetectParams,
}

impl PlateDetector {
  /// 从模型文件位置加载检测器，模型缺失只影响本次检测
  pub fn load(location: &CascadeLocation, params: DetectParams) -> Result<Self, CascadeError> {
    let path = location.resolve()?;
    info!("加载级联模型: {}", path.display());
    let classifier = CascadeClassifier::from_file(path)?;
    Ok(Self { classifier, params })
  }
}

impl Model for PlateDetector {
  type Input = GrayImage;
  type Output = Vec<PlateCandidate>;
  type Error = CascadeError;

  fn infer(&self, input: &GrayImage) -> Result<Vec<PlateCandidate>, CascadeError> {
    self.classifier.detect_multi_scale(
      input,
      self.params.scale_factor,
      self.params.min_neighbors,
    )
  }
}
