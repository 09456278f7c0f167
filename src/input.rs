// 该文件是 Paizhao （牌照） 项目的一部分。
// src/input.rs - 视频/图像输入
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

use thiserror::Error;
use url::Url;

use crate::{FromUrl, frame::Frame};

/// 摄像头请求的分辨率
pub const CAPTURE_WIDTH: u32 = 640;
pub const CAPTURE_HEIGHT: u32 = 480;

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "v4l_camera")]
mod v4l_camera;
#[cfg(feature = "v4l_camera")]
pub use self::v4l_camera::{V4lCamera, V4lCameraError};

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("Image file input error: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "v4l_camera")]
  #[error("V4L camera error: {0}")]
  V4lCameraError(#[from] V4lCameraError),
  #[error("URI scheme mismatch: {0}")]
  SchemeMismatch(String),
}

/// 帧来源：摄像头或其他可连续读取帧的设备
///
/// 读取失败不代表设备不可用，调用方可以稍后重试。
pub trait FrameSource {
  fn read_frame(&mut self) -> Result<Frame, InputError>;

  fn width(&self) -> u32;

  fn height(&self) -> u32;
}

/// 在采集线程内部打开帧来源
///
/// 设备句柄只在采集线程中存在，停止采集时随线程一起释放。
pub trait FrameSourceFactory: Send + Sync {
  fn open(&self) -> Result<Box<dyn FrameSource>, InputError>;
}

impl<F> FrameSourceFactory for F
where
  F: Fn() -> Result<Box<dyn FrameSource>, InputError> + Send + Sync,
{
  fn open(&self) -> Result<Box<dyn FrameSource>, InputError> {
    self()
  }
}

pub enum InputWrapper {
  #[cfg(feature = "v4l_camera")]
  V4lCamera(V4lCamera),
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "v4l_camera")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == V4lCamera::SCHEME {
        let input = V4lCamera::from_url(url)?;
        return Ok(InputWrapper::V4lCamera(input));
      }
    }
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::SCHEME {
        let input = ImageFileInput::from_url(url)?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
    }
    Err(InputError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl FrameSource for InputWrapper {
  fn read_frame(&mut self) -> Result<Frame, InputError> {
    match self {
      #[cfg(feature = "v4l_camera")]
      InputWrapper::V4lCamera(input) => input.read_frame(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.read_frame(),
    }
  }

  fn width(&self) -> u32 {
    match self {
      #[cfg(feature = "v4l_camera")]
      InputWrapper::V4lCamera(input) => input.width(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.width(),
    }
  }

  fn height(&self) -> u32 {
    match self {
      #[cfg(feature = "v4l_camera")]
      InputWrapper::V4lCamera(input) => input.height(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.height(),
    }
  }
}

/// 以 URL 描述的帧来源，每次 `open` 都重新打开设备
#[derive(Debug, Clone)]
pub struct UrlSourceFactory {
  url: Url,
}

impl UrlSourceFactory {
  pub fn new(url: Url) -> Self {
    Self { url }
  }
}

impl FrameSourceFactory for UrlSourceFactory {
  fn open(&self) -> Result<Box<dyn FrameSource>, InputError> {
    let input = InputWrapper::from_url(&self.url)?;
    Ok(Box::new(input))
  }
}

/// 摄像头序号对应的 V4L2 设备 URL
pub fn camera_url(index: usize) -> Result<Url, url::ParseError> {
  Url::parse(&format!("v4l:///dev/video{}", index))
}
