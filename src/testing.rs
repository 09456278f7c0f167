// 该文件是 Paizhao （牌照） 项目的一部分。
// src/testing.rs - 单元测试共用的构件
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

use std::path::Path;
use std::sync::Arc;

use image::{GrayImage, Rgb, RgbImage};

use crate::{
  frame::Frame,
  model::{CascadeLocation, DetectParams},
  ocr::{OcrError, TextRecognizer},
  output::ArtifactWriter,
  pipeline::DetectionPipeline,
  store::PlateStore,
};

/// 单 stage 单树桩的级联，叶子值决定窗口是否全部通过
pub fn stump_cascade(width: u32, height: u32, leaf: f32) -> String {
  format!(
    r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier">
  <stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>{height}</height>
  <width>{width}</width>
  <stageParams><maxWeakCount>1</maxWeakCount></stageParams>
  <featureParams><maxCatCount>0</maxCatCount></featureParams>
  <stageNum>1</stageNum>
  <stages>
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>0 -1 0 0.</internalNodes>
          <leafValues>{leaf} {leaf}</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>0 0 2 2 -1.</_>
        <_>2 0 2 2 1.</_></rects></_></features></cascade>
</opencv_storage>
"#
  )
}

/// 在 28x10 帧上恰好得到候选框 (2, 1, 24, 8) 的帧
pub fn plate_frame(index: u64) -> Frame {
  Frame::from_rgb_image(RgbImage::from_pixel(28, 10, Rgb([90, 90, 90])), index)
}

/// 返回固定文字的识别器
pub struct FixedText(pub &'static str);

impl TextRecognizer for FixedText {
  fn recognize(&self, _: &GrayImage) -> Result<String, OcrError> {
    Ok(self.0.to_string())
  }
}

/// 在 `dir` 下构建一条完整的流水线，`leaf` 为正时每帧都能检测到车牌
pub fn pipeline_in(
  dir: &Path,
  leaf: f32,
  recognizer: Box<dyn TextRecognizer>,
  store: Arc<PlateStore>,
) -> DetectionPipeline {
  let cascade = dir.join("cascade.xml");
  std::fs::write(&cascade, stump_cascade(24, 8, leaf)).unwrap();
  let location = CascadeLocation {
    primary: cascade,
    fallback: dir.join("missing.xml"),
  };
  let writer = ArtifactWriter::new(dir.join("artifacts")).unwrap();
  DetectionPipeline::new(
    location,
    DetectParams::default(),
    recognizer,
    writer,
    store,
  )
}
