// 该文件是 Paizhao （牌照） 项目的一部分。
// src/ocr.rs - 车牌文字识别
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
use std::process::Command;

use image::GrayImage;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

/// 车牌允许出现的字符
pub const PLATE_WHITELIST: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
/// 识别语言
pub const OCR_LANGUAGE: &str = "eng";
/// 单词模式
const PAGE_SEG_MODE: &str = "8";

#[derive(Error, Debug)]
pub enum OcrError {
  #[error("找不到 tesseract 可执行文件: {0}")]
  ExecutableNotFound(PathBuf),
  #[error("找不到 tessdata 目录: {0}")]
  TessdataNotFound(PathBuf),
  #[error("tessdata 目录缺少语言数据: {0}")]
  LanguageDataMissing(PathBuf),
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
  #[error("图像编码失败: {0}")]
  Image(#[from] image::ImageError),
  #[error("tesseract 执行失败 ({status}): {stderr}")]
  Failed { status: String, stderr: String },
}

/// 文字识别引擎
pub trait TextRecognizer: Send {
  /// 识别二值图中的文字，返回引擎原始输出
  fn recognize(&self, image: &GrayImage) -> Result<String, OcrError>;
}

/// 调用外部 tesseract 进程
#[derive(Debug, Clone)]
pub struct TesseractOcr {
  executable: PathBuf,
  tessdata: PathBuf,
}

/// 在 PATH 中查找裸命令名
fn find_in_path(name: &Path) -> Option<PathBuf> {
  let paths = std::env::var_os("PATH")?;
  std::env::split_paths(&paths)
    .flat_map(|dir| {
      let candidate = dir.join(name);
      let with_exe = candidate.with_extension(std::env::consts::EXE_EXTENSION);
      [candidate, with_exe]
    })
    .find(|candidate| candidate.is_file())
}

fn resolve_executable(executable: &Path) -> Option<PathBuf> {
  if executable.is_file() {
    return Some(executable.to_path_buf());
  }
  let bare = executable.components().count() == 1 && !executable.is_absolute();
  if bare { find_in_path(executable) } else { None }
}

impl TesseractOcr {
  /// 校验可执行文件与语言数据，二者缺一都会返回指明缺失资源的错误
  pub fn new(executable: impl AsRef<Path>, tessdata: impl AsRef<Path>) -> Result<Self, OcrError> {
    let executable = executable.as_ref();
    let tessdata = tessdata.as_ref();

    let resolved = resolve_executable(executable)
      .ok_or_else(|| OcrError::ExecutableNotFound(executable.to_path_buf()))?;
    if !tessdata.is_dir() {
      return Err(OcrError::TessdataNotFound(tessdata.to_path_buf()));
    }
    let language = tessdata.join(format!("{}.traineddata", OCR_LANGUAGE));
    if !language.is_file() {
      return Err(OcrError::LanguageDataMissing(language));
    }

    info!(
      "OCR 引擎: {} (tessdata: {})",
      resolved.display(),
      tessdata.display()
    );
    Ok(Self {
      executable: resolved,
      tessdata: tessdata.to_path_buf(),
    })
  }
}

impl TextRecognizer for TesseractOcr {
  fn recognize(&self, image: &GrayImage) -> Result<String, OcrError> {
    let input = NamedTempFile::with_suffix(".png")?;
    image.save(input.path())?;

    let output = Command::new(&self.executable)
      .arg(input.path())
      .arg("stdout")
      .arg("--tessdata-dir")
      .arg(&self.tessdata)
      .arg("-l")
      .arg(OCR_LANGUAGE)
      .arg("--psm")
      .arg(PAGE_SEG_MODE)
      .arg("-c")
      .arg(format!("tessedit_char_whitelist={}", PLATE_WHITELIST))
      .output()?;

    if !output.status.success() {
      return Err(OcrError::Failed {
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }

    let text = String::from_utf8_lossy(&output.stdout).to_string();
    debug!("tesseract 输出: {:?}", text);
    Ok(text)
  }
}

/// 只保留字母与数字
pub fn sanitize(raw: &str) -> String {
  raw
    .chars()
    .filter(|c| c.is_alphanumeric())
    .collect::<String>()
    .trim()
    .to_string()
}

/// 单个车牌的识别结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recognition {
  pub text: String,
  /// 识别失败时的提示，不影响同批次的其他车牌
  pub warning: Option<String>,
}

/// 识别第 `index` 个车牌（从 1 开始），空结果与失败都替换为占位文字
pub fn recognize_plate(
  recognizer: &dyn TextRecognizer,
  image: &GrayImage,
  index: usize,
) -> Recognition {
  match recognizer.recognize(image) {
    Ok(raw) => {
      let text = sanitize(&raw);
      if text.is_empty() {
        Recognition {
          text: format!("Unknown_{}", index),
          warning: None,
        }
      } else {
        Recognition {
          text,
          warning: None,
        }
      }
    }
    Err(e) => {
      warn!("第 {} 个车牌识别失败: {}", index, e);
      Recognition {
        text: format!("OCR_Failed_{}", index),
        warning: Some(format!("plate {}: {}", index, e)),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;

  struct Fixed(&'static str);

  impl TextRecognizer for Fixed {
    fn recognize(&self, _: &GrayImage) -> Result<String, OcrError> {
      Ok(self.0.to_string())
    }
  }

  struct Broken;

  impl TextRecognizer for Broken {
    fn recognize(&self, _: &GrayImage) -> Result<String, OcrError> {
      Err(OcrError::Failed {
        status: "exit status: 1".to_string(),
        stderr: "boom".to_string(),
      })
    }
  }

  fn tessdata_dir(root: &Path) -> PathBuf {
    let dir = root.join("tessdata");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("eng.traineddata"), b"fake").unwrap();
    dir
  }

  #[test]
  fn sanitize_keeps_alphanumerics() {
    assert_eq!(sanitize(" AB-12 3\n"), "AB123");
    assert_eq!(sanitize(" .,\n"), "");
  }

  #[test]
  fn empty_text_becomes_unknown() {
    let image = GrayImage::new(2, 2);
    let result = recognize_plate(&Fixed("  \n"), &image, 2);
    assert_eq!(result.text, "Unknown_2");
    assert!(result.warning.is_none());
  }

  #[test]
  fn failure_becomes_placeholder_with_warning() {
    let image = GrayImage::new(2, 2);
    let result = recognize_plate(&Broken, &image, 1);
    assert_eq!(result.text, "OCR_Failed_1");
    assert!(result.warning.unwrap().contains("boom"));
  }

  #[test]
  fn recognized_text_is_sanitized() {
    let image = GrayImage::new(2, 2);
    let result = recognize_plate(&Fixed("AB 123\n"), &image, 1);
    assert_eq!(result.text, "AB123");
  }

  #[test]
  fn missing_executable_is_named() {
    let dir = tempfile::tempdir().unwrap();
    let tessdata = tessdata_dir(dir.path());
    let missing = dir.path().join("no-such-tesseract");
    match TesseractOcr::new(&missing, &tessdata) {
      Err(OcrError::ExecutableNotFound(path)) => assert_eq!(path, missing),
      other => panic!("unexpected: {:?}", other),
    }
  }

  #[test]
  fn missing_language_data_is_named() {
    let dir = tempfile::tempdir().unwrap();
    let exe = dir.path().join("tesseract");
    fs::write(&exe, b"").unwrap();
    let tessdata = dir.path().join("tessdata");
    fs::create_dir_all(&tessdata).unwrap();
    match TesseractOcr::new(&exe, &tessdata) {
      Err(OcrError::LanguageDataMissing(path)) => {
        assert!(path.ends_with("eng.traineddata"))
      }
      other => panic!("unexpected: {:?}", other),
    }
    assert!(matches!(
      TesseractOcr::new(&exe, dir.path().join("absent")),
      Err(OcrError::TessdataNotFound(_))
    ));
  }

  #[cfg(unix)]
  fn fake_tesseract(root: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let exe = root.join("fake-tesseract");
    fs::write(&exe, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
    exe
  }

  #[cfg(unix)]
  #[test]
  fn runs_external_engine() {
    let dir = tempfile::tempdir().unwrap();
    let tessdata = tessdata_dir(dir.path());
    let exe = fake_tesseract(dir.path(), "echo ' XY-789 '");
    let ocr = TesseractOcr::new(&exe, &tessdata).unwrap();
    let result = recognize_plate(&ocr, &GrayImage::new(8, 4), 1);
    assert_eq!(result.text, "XY789");
  }

  #[cfg(unix)]
  #[test]
  fn engine_exit_code_is_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let tessdata = tessdata_dir(dir.path());
    let exe = fake_tesseract(dir.path(), "echo bad >&2; exit 3");
    let ocr = TesseractOcr::new(&exe, &tessdata).unwrap();
    assert!(matches!(
      ocr.recognize(&GrayImage::new(8, 4)),
      Err(OcrError::Failed { .. })
    ));
  }
}
