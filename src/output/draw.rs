// 该文件是 Paizhao （牌照） 项目的一部分。
// src/output/draw.rs - 检测结果可视化
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

use image::{Rgb, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

use crate::model::PlateCandidate;

const BOX_COLOR: [u8; 3] = [0, 255, 0]; // 绿色
const BOX_THICKNESS: i32 = 2;

/// 在图像上为每个候选框绘制 2 像素宽的边框
pub fn draw_candidates(image: &mut RgbImage, candidates: &[PlateCandidate]) {
  for candidate in candidates {
    // 边框向内加粗
    for t in 0..BOX_THICKNESS {
      let width = candidate.width - 2 * t;
      let height = candidate.height - 2 * t;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(candidate.x + t, candidate.y + t).of_size(width as u32, height as u32);
      draw_hollow_rect_mut(image, rect, Rgb(BOX_COLOR));
    }
  }
}

/// 复制一份帧并绘制候选框
pub fn annotate(frame: &RgbImage, candidates: &[PlateCandidate]) -> RgbImage {
  let mut image = frame.clone();
  draw_candidates(&mut image, candidates);
  image
}
