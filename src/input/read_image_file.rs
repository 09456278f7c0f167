// 该文件是 Paizhao （牌照） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  input::{FrameSource, InputError},
  url_file_path,
};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

/// 把一张静态图片当作摄像头，每次读取都返回同一帧
pub struct ImageFileInput {
  image: RgbImage,
  frame_index: u64,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let path = url_file_path(url);
    debug!("读取图像文件: {}", path);
    let image = ImageReader::open(&path)?.with_guessed_format()?.decode()?;

    Ok(ImageFileInput {
      image: image.to_rgb8(),
      frame_index: 0,
    })
  }
}

impl ImageFileInput {
  pub fn from_image(image: RgbImage) -> Self {
    Self {
      image,
      frame_index: 0,
    }
  }
}

impl FrameSource for ImageFileInput {
  fn read_frame(&mut self) -> Result<Frame, InputError> {
    let frame = Frame::from_rgb_image(self.image.clone(), self.frame_index);
    self.frame_index += 1;
    Ok(frame)
  }

  fn width(&self) -> u32 {
    self.image.width()
  }

  fn height(&self) -> u32 {
    self.image.height()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  #[test]
  fn replays_the_same_image_with_increasing_index() {
    let image = RgbImage::from_pixel(4, 3, Rgb([1, 2, 3]));
    let mut input = ImageFileInput::from_image(image);
    let first = input.read_frame().unwrap();
    let second = input.read_frame().unwrap();
    assert_eq!(first.index(), 0);
    assert_eq!(second.index(), 1);
    assert_eq!(first.as_bytes(), second.as_bytes());
    assert_eq!((input.width(), input.height()), (4, 3));
  }

  #[test]
  fn loads_image_from_file_url() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frame one.png");
    RgbImage::from_pixel(5, 2, Rgb([9, 9, 9])).save(&path).unwrap();

    let url = Url::from_file_path(&path).unwrap();
    let url = Url::parse(&url.as_str().replacen("file:", "image:", 1)).unwrap();
    let mut input = ImageFileInput::from_url(&url).unwrap();
    let frame = input.read_frame().unwrap();
    assert_eq!((frame.width(), frame.height()), (5, 2));
  }

  #[test]
  fn wrong_scheme_fails() {
    let url = Url::parse("v4l:///dev/video0").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&url),
      Err(ImageFileInputError::SchemaMismatch)
    ));
  }
}
