// 该文件是 Paizhao （牌照） 项目的一部分。
// src/input/v4l_camera.rs - V4L2 摄像头输入
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

use std::pin::Pin;

use thiserror::Error;
use tracing::{error, info};
use url::Url;
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  input::{CAPTURE_HEIGHT, CAPTURE_WIDTH, FrameSource, InputError},
  url_file_path,
};

const V4L_BUFFER_COUNT: u32 = 4;

#[derive(Error, Debug)]
pub enum V4lCameraError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("无法打开设备 {0}: {1}")]
  OpenDevice(String, std::io::Error),
  #[error("设备格式设置失败: {0}")]
  Format(std::io::Error),
  #[error("无法创建捕获流: {0}")]
  Stream(std::io::Error),
  #[error("无法捕获帧: {0}")]
  Capture(std::io::Error),
  #[error("不支持的像素格式: {0}")]
  UnsupportedPixelFormat(String),
  #[error("帧数据长度异常: 期望 {expected}, 实际 {actual}")]
  BufferSize { expected: usize, actual: usize },
}

/// V4L2 摄像头
///
/// v4l 的 Stream 需要引用 Device，这里用 Pin<Box<Device>> 固定设备地址，
/// 让同一结构体里的 Stream 可以安全地持有它的引用。
pub struct V4lCamera {
  /// 捕获流，必须先于 device 释放
  stream: Option<Stream<'static>>,
  device: Pin<Box<Device>>,
  device_path: String,
  frame_index: u64,
  width: u32,
  height: u32,
}

impl FromUrlWithScheme for V4lCamera {
  const SCHEME: &'static str = "v4l";
}

impl FromUrl for V4lCamera {
  type Error = V4lCameraError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(V4lCameraError::SchemaMismatch);
    }

    // v4l:///dev/video0
    let device_path = {
      let path = url_file_path(url);
      if path.is_empty() || path == "/" {
        "/dev/video0".to_string()
      } else {
        path
      }
    };

    Self::open(&device_path)
  }
}

impl V4lCamera {
  /// 打开摄像头并请求 640x480 YUYV 格式
  pub fn open(device_path: &str) -> Result<Self, V4lCameraError> {
    let device = Box::pin(
      Device::with_path(device_path)
        .map_err(|e| V4lCameraError::OpenDevice(device_path.to_string(), e))?,
    );

    let mut format = device.format().map_err(V4lCameraError::Format)?;
    format.width = CAPTURE_WIDTH;
    format.height = CAPTURE_HEIGHT;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device.set_format(&format).map_err(V4lCameraError::Format)?;

    if format.fourcc != FourCC::new(b"YUYV") {
      return Err(V4lCameraError::UnsupportedPixelFormat(
        format.fourcc.to_string(),
      ));
    }

    info!(
      "摄像头已打开: {} {}x{}",
      device_path, format.width, format.height
    );

    let mut camera = Self {
      stream: None,
      device,
      device_path: device_path.to_string(),
      frame_index: 0,
      width: format.width,
      height: format.height,
    };

    // SAFETY: device 被 Pin<Box> 固定在堆上不会移动；stream 与 device 同属一个结构体，
    // 并且在 Drop 中先于 device 释放
    let device_ref: &Device = &camera.device;
    let stream = unsafe {
      let device_static: &'static Device = std::mem::transmute(device_ref);
      Stream::with_buffers(device_static, Type::VideoCapture, V4L_BUFFER_COUNT)
        .map_err(V4lCameraError::Stream)?
    };
    camera.stream = Some(stream);

    Ok(camera)
  }

  /// 将 YUYV 格式转换为 RGB
  fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);

    for chunk in yuyv.chunks_exact(4) {
      let y0 = chunk[0] as f32;
      let u = chunk[1] as f32 - 128.0;
      let y1 = chunk[2] as f32;
      let v = chunk[3] as f32 - 128.0;

      for y in [y0, y1] {
        let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
        let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
        let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
        rgb.extend_from_slice(&[r, g, b]);
      }
    }

    rgb
  }
}

impl Drop for V4lCamera {
  fn drop(&mut self) {
    // 确保 stream 在 device 之前被 drop
    self.stream.take();
    info!("摄像头已释放: {}", self.device_path);
  }
}

impl FrameSource for V4lCamera {
  fn read_frame(&mut self) -> Result<Frame, InputError> {
    let (width, height) = (self.width, self.height);
    let stream = self
      .stream
      .as_mut()
      .ok_or_else(|| V4lCameraError::Capture(std::io::ErrorKind::NotConnected.into()))?;

    let (buffer, _meta) = stream.next().map_err(V4lCameraError::Capture)?;
    let expected = (width * height * 2) as usize;
    if buffer.len() < expected {
      return Err(
        V4lCameraError::BufferSize {
          expected,
          actual: buffer.len(),
        }
        .into(),
      );
    }

    let rgb = Self::yuyv_to_rgb(&buffer[..expected], width, height);
    let frame = Frame::from_rgb(rgb, width, height, self.frame_index).map_err(|e| {
      V4lCameraError::Capture(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    self.frame_index += 1;
    Ok(frame)
  }

  fn width(&self) -> u32 {
    self.width
  }

  fn height(&self) -> u32 {
    self.height
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn yuyv_gray_pair_converts_to_two_gray_pixels() {
    let rgb = V4lCamera::yuyv_to_rgb(&[100, 128, 200, 128], 2, 1);
    assert_eq!(rgb, vec![100, 100, 100, 200, 200, 200]);
  }
}
