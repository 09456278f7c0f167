// 该文件是 Paizhao （牌照） 项目的一部分。
// src/model/cascade.rs - Haar 级联分类器
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

//! OpenCV 新版 `<cascade>` XML 格式的 Haar 级联分类器。
//!
//! 检测流程与 `CascadeClassifier::detectMultiScale` 相同：逐层缩小图像，
//! 在每层上以固定窗口滑动，窗口通过全部 stage 即为候选，最后按相邻关系合并。

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use image::{GrayImage, Luma, imageops::FilterType};
use imageproc::definitions::Image;
use imageproc::integral_image::{integral_image, integral_squared_image};
use roxmltree::{Document, Node};
use thiserror::Error;
use tracing::debug;

use crate::model::PlateCandidate;

/// 加载时从 stage 阈值中减去的容差
const THRESHOLD_EPS: f32 = 1e-5;
/// 合并候选框时的相似度系数
const GROUP_EPS: f64 = 0.2;

#[derive(Error, Debug)]
pub enum CascadeError {
  #[error("找不到级联模型文件: {} 与 {} 均不存在", primary.display(), fallback.display())]
  NotFound { primary: PathBuf, fallback: PathBuf },
  #[error("读取模型文件失败: {0}")]
  Io(#[from] std::io::Error),
  #[error("模型 XML 解析失败: {0}")]
  Xml(#[from] roxmltree::Error),
  #[error("模型格式错误: {0}")]
  Format(String),
  #[error("不支持的模型: {0}")]
  Unsupported(String),
  #[error("缩放比例必须大于 1, 实际为 {0}")]
  InvalidScale(f64),
}

#[derive(Debug, Clone, Copy)]
struct HaarRect {
  x: u32,
  y: u32,
  width: u32,
  height: u32,
  weight: f64,
}

#[derive(Debug, Clone)]
struct HaarFeature {
  rects: Vec<HaarRect>,
}

#[derive(Debug, Clone, Copy)]
struct TreeNode {
  /// 小于阈值时的去向，<= 0 表示叶子序号取反
  left: i32,
  right: i32,
  feature: usize,
  threshold: f64,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
  nodes: Vec<TreeNode>,
  leaves: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Stage {
  threshold: f64,
  classifiers: Vec<WeakClassifier>,
}

/// 积分图与平方积分图，尺寸比原图多一行一列
struct IntegralImages {
  sum: Image<Luma<u64>>,
  sq_sum: Image<Luma<u64>>,
}

impl IntegralImages {
  fn new(image: &GrayImage) -> Self {
    Self {
      sum: integral_image(image),
      sq_sum: integral_squared_image(image),
    }
  }

  fn rect_sum(table: &Image<Luma<u64>>, x: u32, y: u32, width: u32, height: u32) -> u64 {
    let tl = table.get_pixel(x, y)[0];
    let tr = table.get_pixel(x + width, y)[0];
    let bl = table.get_pixel(x, y + height)[0];
    let br = table.get_pixel(x + width, y + height)[0];
    (br + tl) - (tr + bl)
  }

  fn sum(&self, x: u32, y: u32, width: u32, height: u32) -> u64 {
    Self::rect_sum(&self.sum, x, y, width, height)
  }

  fn sq_sum(&self, x: u32, y: u32, width: u32, height: u32) -> u64 {
    Self::rect_sum(&self.sq_sum, x, y, width, height)
  }
}

impl HaarFeature {
  fn evaluate(&self, integral: &IntegralImages, x: u32, y: u32) -> f64 {
    self
      .rects
      .iter()
      .map(|r| r.weight * integral.sum(x + r.x, y + r.y, r.width, r.height) as f64)
      .sum()
  }
}

#[derive(Debug, Clone)]
pub struct CascadeClassifier {
  window_width: u32,
  window_height: u32,
  stages: Vec<Stage>,
  features: Vec<HaarFeature>,
}

fn elements<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
  node.children().filter(|n| n.is_element())
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Result<Node<'a, 'input>, CascadeError> {
  elements(node)
    .find(|n| n.has_tag_name(name))
    .ok_or_else(|| CascadeError::Format(format!("<{}> 缺少子节点 <{}>", node.tag_name().name(), name)))
}

fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Result<&'a str, CascadeError> {
  Ok(child(node, name)?.text().unwrap_or("").trim())
}

fn numbers(text: &str, what: &str) -> Result<Vec<f64>, CascadeError> {
  text
    .split_whitespace()
    .map(|s| {
      s.parse::<f64>()
        .map_err(|_| CascadeError::Format(format!("{} 中的数值无效: {}", what, s)))
    })
    .collect()
}

fn single_number(node: Node, name: &str) -> Result<f64, CascadeError> {
  let values = numbers(child_text(node, name)?, name)?;
  match values.as_slice() {
    [value] => Ok(*value),
    _ => Err(CascadeError::Format(format!("<{}> 应当只有一个数值", name))),
  }
}

impl CascadeClassifier {
  pub fn from_file(path: &Path) -> Result<Self, CascadeError> {
    let text = std::fs::read_to_string(path)?;
    Self::from_xml(&text)
  }

  pub fn from_xml(text: &str) -> Result<Self, CascadeError> {
    let doc = Document::parse(text)?;
    let cascade = elements(doc.root_element())
      .find(|n| n.has_tag_name("cascade"))
      .ok_or_else(|| {
        CascadeError::Unsupported("缺少 <cascade> 节点, 仅支持新版 OpenCV 级联格式".to_string())
      })?;

    let stage_type = child_text(cascade, "stageType")?;
    if stage_type != "BOOST" {
      return Err(CascadeError::Unsupported(format!("stage 类型 {}", stage_type)));
    }
    let feature_type = child_text(cascade, "featureType")?;
    if feature_type != "HAAR" {
      return Err(CascadeError::Unsupported(format!("特征类型 {}", feature_type)));
    }

    let window_width = single_number(cascade, "width")? as u32;
    let window_height = single_number(cascade, "height")? as u32;
    if window_width < 3 || window_height < 3 {
      return Err(CascadeError::Format(format!(
        "检测窗口过小: {}x{}",
        window_width, window_height
      )));
    }

    let features = elements(child(cascade, "features")?)
      .map(|node| Self::parse_feature(node, window_width, window_height))
      .collect::<Result<Vec<_>, _>>()?;

    let stages = elements(child(cascade, "stages")?)
      .map(|node| Self::parse_stage(node, features.len()))
      .collect::<Result<Vec<_>, _>>()?;

    if stages.is_empty() {
      return Err(CascadeError::Format("模型没有任何 stage".to_string()));
    }

    debug!(
      "级联模型: 窗口 {}x{}, {} 个 stage, {} 个特征",
      window_width,
      window_height,
      stages.len(),
      features.len()
    );

    Ok(Self {
      window_width,
      window_height,
      stages,
      features,
    })
  }

  fn parse_feature(node: Node, window_width: u32, window_height: u32) -> Result<HaarFeature, CascadeError> {
    if let Ok(tilted) = child_text(node, "tilted") {
      if tilted != "0" {
        return Err(CascadeError::Unsupported("倾斜 Haar 特征".to_string()));
      }
    }

    let mut rects = Vec::new();
    for rect in elements(child(node, "rects")?) {
      let values = numbers(rect.text().unwrap_or(""), "rects")?;
      let [x, y, width, height, weight] = values.as_slice() else {
        return Err(CascadeError::Format("矩形特征需要 5 个数值".to_string()));
      };
      if *x < 0.0 || *y < 0.0 || *width <= 0.0 || *height <= 0.0 {
        return Err(CascadeError::Format("矩形特征坐标无效".to_string()));
      }
      let rect = HaarRect {
        x: *x as u32,
        y: *y as u32,
        width: *width as u32,
        height: *height as u32,
        weight: *weight,
      };
      if rect.x + rect.width > window_width || rect.y + rect.height > window_height {
        return Err(CascadeError::Format("矩形特征超出检测窗口".to_string()));
      }
      rects.push(rect);
    }

    if rects.is_empty() {
      return Err(CascadeError::Format("特征没有矩形".to_string()));
    }
    Ok(HaarFeature { rects })
  }

  fn parse_stage(node: Node, feature_count: usize) -> Result<Stage, CascadeError> {
    let threshold = single_number(node, "stageThreshold")? as f32 - THRESHOLD_EPS;

    let mut classifiers = Vec::new();
    for weak in elements(child(node, "weakClassifiers")?) {
      let internal = numbers(child_text(weak, "internalNodes")?, "internalNodes")?;
      let leaves = numbers(child_text(weak, "leafValues")?, "leafValues")?;
      if internal.is_empty() || internal.len() % 4 != 0 {
        return Err(CascadeError::Format("internalNodes 长度必须是 4 的倍数".to_string()));
      }

      let nodes: Vec<TreeNode> = internal
        .chunks_exact(4)
        .map(|chunk| TreeNode {
          left: chunk[0] as i32,
          right: chunk[1] as i32,
          feature: chunk[2] as usize,
          threshold: chunk[3] as f32 as f64,
        })
        .collect();

      for (idx, node) in nodes.iter().enumerate() {
        if node.feature >= feature_count {
          return Err(CascadeError::Format(format!("特征序号越界: {}", node.feature)));
        }
        for next in [node.left, node.right] {
          let valid = if next <= 0 {
            ((-next) as usize) < leaves.len()
          } else {
            (next as usize) > idx && (next as usize) < nodes.len()
          };
          if !valid {
            return Err(CascadeError::Format(format!("决策树节点引用无效: {}", next)));
          }
        }
      }

      classifiers.push(WeakClassifier { nodes, leaves });
    }

    Ok(Stage {
      threshold: threshold as f64,
      classifiers,
    })
  }

  pub fn window_size(&self) -> (u32, u32) {
    (self.window_width, self.window_height)
  }

  /// 窗口方差归一化系数，统计区域为窗口内缩一个像素
  fn variance_norm_factor(&self, integral: &IntegralImages, x: u32, y: u32) -> f64 {
    let (nx, ny) = (x + 1, y + 1);
    let (nw, nh) = (self.window_width - 2, self.window_height - 2);
    let area = (nw * nh) as f64;
    let sum = integral.sum(nx, ny, nw, nh) as f64;
    let sq_sum = integral.sq_sum(nx, ny, nw, nh) as f64;
    let nf = area * sq_sum - sum * sum;
    let nf = if nf > 0.0 { nf.sqrt() } else { 1.0 };
    1.0 / nf
  }

  /// 通过全部 stage 返回 1，否则返回被拒绝的 stage 序号的相反数
  fn run_at(&self, integral: &IntegralImages, x: u32, y: u32) -> i32 {
    let norm = self.variance_norm_factor(integral, x, y);

    for (stage_idx, stage) in self.stages.iter().enumerate() {
      let mut sum = 0.0;
      for weak in &stage.classifiers {
        let mut idx = 0usize;
        let leaf = loop {
          let node = &weak.nodes[idx];
          let value = self.features[node.feature].evaluate(integral, x, y) * norm;
          let next = if value < node.threshold {
            node.left
          } else {
            node.right
          };
          if next <= 0 {
            break weak.leaves[(-next) as usize];
          }
          idx = next as usize;
        };
        sum += leaf;
      }
      if sum < stage.threshold {
        return -(stage_idx as i32);
      }
    }
    1
  }

  /// 多尺度检测，返回合并后的候选框
  pub fn detect_multi_scale(
    &self,
    image: &GrayImage,
    scale_factor: f64,
    min_neighbors: usize,
  ) -> Result<Vec<PlateCandidate>, CascadeError> {
    if scale_factor.is_nan() || scale_factor <= 1.0 {
      return Err(CascadeError::InvalidScale(scale_factor));
    }

    let (image_width, image_height) = image.dimensions();
    let mut raw = Vec::new();
    let mut factor = 1.0f64;

    loop {
      let scaled_width = (image_width as f64 / factor).round() as u32;
      let scaled_height = (image_height as f64 / factor).round() as u32;
      if scaled_width < self.window_width || scaled_height < self.window_height {
        break;
      }
      let window_width = (self.window_width as f64 * factor).round() as i32;
      let window_height = (self.window_height as f64 * factor).round() as i32;

      let scaled: Cow<GrayImage> = if scaled_width == image_width && scaled_height == image_height {
        Cow::Borrowed(image)
      } else {
        Cow::Owned(image::imageops::resize(
          image,
          scaled_width,
          scaled_height,
          FilterType::Triangle,
        ))
      };
      let integral = IntegralImages::new(&scaled);

      let step = if factor > 2.0 { 1 } else { 2 };
      let range_x = scaled_width - self.window_width + 1;
      let range_y = scaled_height - self.window_height + 1;

      let mut y = 0;
      while y < range_y {
        let mut x = 0;
        while x < range_x {
          let result = self.run_at(&integral, x, y);
          if result > 0 {
            raw.push(PlateCandidate::new(
              (x as f64 * factor).round() as i32,
              (y as f64 * factor).round() as i32,
              window_width,
              window_height,
            ));
          } else if result == 0 {
            // 第一个 stage 就被拒绝，跳过相邻窗口
            x += step;
          }
          x += step;
        }
        y += step;
      }

      factor *= scale_factor;
    }

    debug!("级联检测原始候选框 {} 个", raw.len());
    Ok(group_rectangles(raw, min_neighbors, GROUP_EPS))
  }
}

fn similar(a: &PlateCandidate, b: &PlateCandidate, eps: f64) -> bool {
  let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
  ((a.x - b.x).abs() as f64) <= delta
    && ((a.y - b.y).abs() as f64) <= delta
    && ((a.x + a.width - b.x - b.width).abs() as f64) <= delta
    && ((a.y + a.height - b.y - b.height).abs() as f64) <= delta
}

fn find_root(parent: &mut [usize], mut i: usize) -> usize {
  while parent[i] != i {
    parent[i] = parent[parent[i]];
    i = parent[i];
  }
  i
}

/// 按相似关系划分等价类，类序号按首次出现的顺序分配
fn partition(rects: &[PlateCandidate], eps: f64) -> (Vec<usize>, usize) {
  let n = rects.len();
  let mut parent: Vec<usize> = (0..n).collect();

  for i in 0..n {
    for j in (i + 1)..n {
      if similar(&rects[i], &rects[j], eps) {
        let (ri, rj) = (find_root(&mut parent, i), find_root(&mut parent, j));
        if ri != rj {
          parent[rj] = ri;
        }
      }
    }
  }

  let mut class_of_root = vec![usize::MAX; n];
  let mut labels = Vec::with_capacity(n);
  let mut classes = 0;
  for i in 0..n {
    let root = find_root(&mut parent, i);
    if class_of_root[root] == usize::MAX {
      class_of_root[root] = classes;
      classes += 1;
    }
    labels.push(class_of_root[root]);
  }
  (labels, classes)
}

/// 合并相邻候选框
///
/// 每类框取平均，相邻数不超过 `group_threshold` 的类被丢弃，
/// 被更可信的大框包含的小框也被丢弃。`group_threshold` 为 0 时原样返回。
pub fn group_rectangles(
  rects: Vec<PlateCandidate>,
  group_threshold: usize,
  eps: f64,
) -> Vec<PlateCandidate> {
  if group_threshold == 0 || rects.is_empty() {
    return rects;
  }

  let (labels, classes) = partition(&rects, eps);
  let mut sums = vec![[0i64; 4]; classes];
  let mut counts = vec![0usize; classes];
  for (rect, &label) in rects.iter().zip(&labels) {
    let sum = &mut sums[label];
    sum[0] += rect.x as i64;
    sum[1] += rect.y as i64;
    sum[2] += rect.width as i64;
    sum[3] += rect.height as i64;
    counts[label] += 1;
  }

  let averaged: Vec<PlateCandidate> = sums
    .iter()
    .zip(&counts)
    .map(|(sum, &count)| {
      let s = 1.0 / count as f64;
      PlateCandidate::new(
        (sum[0] as f64 * s).round() as i32,
        (sum[1] as f64 * s).round() as i32,
        (sum[2] as f64 * s).round() as i32,
        (sum[3] as f64 * s).round() as i32,
      )
    })
    .collect();

  let mut grouped = Vec::new();
  for (i, r1) in averaged.iter().enumerate() {
    let n1 = counts[i];
    if n1 <= group_threshold {
      continue;
    }

    let nested = averaged.iter().enumerate().any(|(j, r2)| {
      let n2 = counts[j];
      if j == i || n2 <= group_threshold {
        return false;
      }
      let dx = (r2.width as f64 * eps).round() as i32;
      let dy = (r2.height as f64 * eps).round() as i32;
      r1.x >= r2.x - dx
        && r1.y >= r2.y - dy
        && r1.x + r1.width <= r2.x + r2.width + dx
        && r1.y + r1.height <= r2.y + r2.height + dy
        && (n2 > n1.max(3) || n1 < 3)
    });

    if !nested {
      grouped.push(*r1);
    }
  }
  grouped
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::stump_cascade;

  #[test]
  fn parses_window_and_stages() {
    let cascade = CascadeClassifier::from_xml(&stump_cascade(24, 8, 1.0)).unwrap();
    assert_eq!(cascade.window_size(), (24, 8));
    assert_eq!(cascade.stages.len(), 1);
    assert_eq!(cascade.features[0].rects.len(), 2);
  }

  #[test]
  fn old_format_is_rejected() {
    let xml = r#"<opencv_storage><haarcascade type_id="opencv-haar-classifier"/></opencv_storage>"#;
    assert!(matches!(
      CascadeClassifier::from_xml(xml),
      Err(CascadeError::Unsupported(_))
    ));
  }

  #[test]
  fn feature_outside_window_is_rejected() {
    let xml = stump_cascade(24, 8, 1.0).replace("2 0 2 2 1.", "23 0 2 2 1.");
    assert!(matches!(
      CascadeClassifier::from_xml(&xml),
      Err(CascadeError::Format(_))
    ));
  }

  #[test]
  fn always_pass_window_groups_into_one_candidate() {
    let cascade = CascadeClassifier::from_xml(&stump_cascade(24, 8, 1.0)).unwrap();
    let image = GrayImage::from_pixel(28, 10, Luma([128]));
    let found = cascade.detect_multi_scale(&image, 1.2, 5).unwrap();
    assert_eq!(found, vec![PlateCandidate::new(2, 1, 24, 8)]);
  }

  #[test]
  fn always_reject_yields_nothing() {
    let cascade = CascadeClassifier::from_xml(&stump_cascade(24, 8, -1.0)).unwrap();
    let image = GrayImage::from_pixel(64, 32, Luma([30]));
    assert!(cascade.detect_multi_scale(&image, 1.2, 5).unwrap().is_empty());
  }

  #[test]
  fn image_smaller_than_window_yields_nothing() {
    let cascade = CascadeClassifier::from_xml(&stump_cascade(24, 8, 1.0)).unwrap();
    let image = GrayImage::new(20, 20);
    assert!(cascade.detect_multi_scale(&image, 1.2, 0).unwrap().is_empty());
  }

  #[test]
  fn scale_factor_must_grow() {
    let cascade = CascadeClassifier::from_xml(&stump_cascade(24, 8, 1.0)).unwrap();
    assert!(matches!(
      cascade.detect_multi_scale(&GrayImage::new(30, 10), 1.0, 0),
      Err(CascadeError::InvalidScale(_))
    ));
  }

  #[test]
  fn sparse_groups_are_dropped() {
    let rects = vec![
      PlateCandidate::new(0, 0, 20, 10),
      PlateCandidate::new(1, 0, 20, 10),
      PlateCandidate::new(200, 200, 20, 10),
    ];
    assert!(group_rectangles(rects.clone(), 2, GROUP_EPS).is_empty());
    assert_eq!(
      group_rectangles(rects, 1, GROUP_EPS),
      vec![PlateCandidate::new(1, 0, 20, 10)]
    );
  }

  #[test]
  fn nested_weak_group_is_suppressed() {
    let mut rects = vec![PlateCandidate::new(0, 0, 100, 50); 6];
    rects.extend(vec![PlateCandidate::new(20, 10, 40, 20); 2]);
    let grouped = group_rectangles(rects, 1, GROUP_EPS);
    assert_eq!(grouped, vec![PlateCandidate::new(0, 0, 100, 50)]);
  }

  #[test]
  fn zero_threshold_returns_input_unchanged() {
    let rects = vec![PlateCandidate::new(5, 5, 10, 10)];
    assert_eq!(group_rectangles(rects.clone(), 0, GROUP_EPS), rects);
  }
}
