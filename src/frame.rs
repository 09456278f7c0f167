// 该文件是 Paizhao （牌照） 项目的一部分。
// src/frame.rs - RGB 帧定义
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

use chrono::{DateTime, Local};
use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use thiserror::Error;

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
}

/// 一帧摄像头图像
///
/// 帧在采集线程中构造完毕后才会被发布，之后只读。
#[derive(Debug, Clone)]
pub struct Frame {
  data: Box<[u8]>,
  width: u32,
  height: u32,
  index: u64,
  captured_at: DateTime<Local>,
}

impl Frame {
  pub fn from_rgb(
    data: Vec<u8>,
    width: u32,
    height: u32,
    index: u64,
  ) -> Result<Self, FrameError> {
    let expected = RGB_CHANNELS * width as usize * height as usize;
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into_boxed_slice(),
      width,
      height,
      index,
      captured_at: Local::now(),
    })
  }

  pub fn from_rgb_image(image: RgbImage, index: u64) -> Self {
    let (width, height) = image.dimensions();
    Self {
      data: image.into_raw().into_boxed_slice(),
      width,
      height,
      index,
      captured_at: Local::now(),
    }
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn index(&self) -> u64 {
    self.index
  }

  pub fn captured_at(&self) -> DateTime<Local> {
    self.captured_at
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }

  pub fn to_rgb_image(&self) -> RgbImage {
    let width = self.width as usize;
    let data = &self.data;
    ImageBuffer::from_fn(self.width, self.height, |x, y| {
      let idx = (y as usize * width + x as usize) * RGB_CHANNELS;
      Rgb([data[idx], data[idx + 1], data[idx + 2]])
    })
  }

  /// 转为灰度图，系数与 OpenCV 的 RGB2GRAY 定点实现一致
  pub fn to_gray(&self) -> GrayImage {
    let width = self.width as usize;
    let data = &self.data;
    ImageBuffer::from_fn(self.width, self.height, |x, y| {
      let idx = (y as usize * width + x as usize) * RGB_CHANNELS;
      Luma([rgb_to_luma(data[idx], data[idx + 1], data[idx + 2])])
    })
  }
}

/// BT.601 亮度，14 位定点
pub fn rgb_to_luma(r: u8, g: u8, b: u8) -> u8 {
  const R_W: u32 = 4899;
  const G_W: u32 = 9617;
  const B_W: u32 = 1868;
  const SHIFT: u32 = 14;

  let y = (r as u32 * R_W + g as u32 * G_W + b as u32 * B_W + (1 << (SHIFT - 1))) >> SHIFT;
  y.min(255) as u8
}

/// RGB 图像转灰度
pub fn rgb_image_to_gray(image: &RgbImage) -> GrayImage {
  ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
    let Rgb([r, g, b]) = *image.get_pixel(x, y);
    Luma([rgb_to_luma(r, g, b)])
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_short_buffer() {
    let err = Frame::from_rgb(vec![0; 10], 4, 4, 0).unwrap_err();
    assert!(matches!(
      err,
      FrameError::LengthMismatch {
        expected: 48,
        actual: 10
      }
    ));
  }

  #[test]
  fn gray_matches_bt601_weights() {
    assert_eq!(rgb_to_luma(0, 0, 0), 0);
    assert_eq!(rgb_to_luma(255, 255, 255), 255);
    // 0.299 * 255 = 76.2
    assert_eq!(rgb_to_luma(255, 0, 0), 76);
    // 0.587 * 255 = 149.7
    assert_eq!(rgb_to_luma(0, 255, 0), 150);
  }

  #[test]
  fn rgb_image_round_trip_keeps_pixels() {
    let mut image = RgbImage::new(3, 2);
    image.put_pixel(2, 1, Rgb([10, 20, 30]));
    let frame = Frame::from_rgb_image(image.clone(), 7);
    assert_eq!(frame.index(), 7);
    assert_eq!(frame.to_rgb_image(), image);
    assert_eq!(frame.to_gray().dimensions(), (3, 2));
  }
}
