// 该文件是 Paizhao （牌照） 项目的一部分。
// src/process.rs - 车牌区域裁剪与二值化
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

use image::{GrayImage, Luma, Rgb, RgbImage, imageops};
use imageproc::contrast::{ThresholdType, otsu_level, threshold};
use imageproc::morphology::{Mask, grayscale_dilate, grayscale_erode};
use tracing::debug;

use crate::{frame::rgb_image_to_gray, model::PlateCandidate};

/// 纵向边距占帧高的比例
const VERTICAL_MARGIN_RATIO: f64 = 0.02;
/// 横向边距占帧宽的比例
const HORIZONTAL_MARGIN_RATIO: f64 = 0.025;

/// 裁剪边距 (纵向, 横向)
pub fn margins(frame_height: u32, frame_width: u32) -> (i32, i32) {
  (
    (frame_height as f64 * VERTICAL_MARGIN_RATIO).floor() as i32,
    (frame_width as f64 * HORIZONTAL_MARGIN_RATIO).floor() as i32,
  )
}

/// 计算裁剪区域 (x, y, w, h)，结果落在帧内且至少 1x1
///
/// 调用方保证帧非空。
pub fn crop_bounds(
  frame_width: u32,
  frame_height: u32,
  candidate: &PlateCandidate,
  margins: (i32, i32),
) -> (u32, u32, u32, u32) {
  let (vertical, horizontal) = margins;
  let (fw, fh) = (frame_width as i64, frame_height as i64);

  let span = |start: i64, end: i64, limit: i64| -> (u32, u32) {
    let lo = start.clamp(0, limit - 1);
    let hi = end.clamp(0, limit);
    if hi <= lo {
      (lo as u32, 1)
    } else {
      (lo as u32, (hi - lo) as u32)
    }
  };

  let x = candidate.x as i64;
  let y = candidate.y as i64;
  let (cx, cw) = span(
    x + horizontal as i64,
    x + candidate.width as i64 - horizontal as i64,
    fw,
  );
  let (cy, ch) = span(
    y + vertical as i64,
    y + candidate.height as i64 - vertical as i64,
    fh,
  );
  (cx, cy, cw, ch)
}

/// 处理后的车牌区域
#[derive(Debug, Clone)]
pub struct PlateRegion {
  pub candidate: PlateCandidate,
  /// 只含 0 与 255 的二值图
  pub binary: GrayImage,
}

/// 车牌区域处理：裁剪、形态学归一、灰度化、Otsu 二值化
#[derive(Debug, Default, Clone, Copy)]
pub struct RegionProcessor;

impl RegionProcessor {
  pub fn new() -> Self {
    Self
  }

  /// 处理一个候选框，`frame` 必须非空
  pub fn process(&self, frame: &RgbImage, candidate: PlateCandidate) -> PlateRegion {
    let (width, height) = frame.dimensions();
    let (x, y, w, h) = crop_bounds(width, height, &candidate, margins(height, width));
    debug!(
      "裁剪车牌区域 {}x{} @ ({}, {})，候选框 {:?}",
      w, h, x, y, candidate
    );

    let cropped = imageops::crop_imm(frame, x, y, w, h).to_image();
    let normalized = close_per_channel(&cropped);
    let gray = rgb_image_to_gray(&normalized);
    let level = otsu_level(&gray);
    let binary = threshold(&gray, level, ThresholdType::Binary);

    PlateRegion { candidate, binary }
  }

  pub fn process_all(&self, frame: &RgbImage, candidates: &[PlateCandidate]) -> Vec<PlateRegion> {
    candidates
      .iter()
      .map(|candidate| self.process(frame, *candidate))
      .collect()
  }
}

/// 逐通道先膨胀后腐蚀，结构元为 1x1，保留原灰度
fn close_per_channel(image: &RgbImage) -> RgbImage {
  let (width, height) = image.dimensions();
  let mask = Mask::square(0);
  let planes: Vec<GrayImage> = (0..3)
    .map(|c| {
      let plane = GrayImage::from_fn(width, height, |x, y| Luma([image.get_pixel(x, y)[c]]));
      grayscale_erode(&grayscale_dilate(&plane, &mask), &mask)
    })
    .collect();

  RgbImage::from_fn(width, height, |x, y| {
    Rgb([
      planes[0].get_pixel(x, y)[0],
      planes[1].get_pixel(x, y)[0],
      planes[2].get_pixel(x, y)[0],
    ])
  })
}
