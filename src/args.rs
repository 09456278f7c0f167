// 该文件是 Paizhao （牌照） 项目的一部分。
// src/args.rs - 项目参数配置
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

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use url::Url;

use paizhao::{
  config::{DEFAULT_CAMERA, DEFAULT_RECENT_LIMIT, DEFAULT_TESSERACT, PlateConfig, default_tessdata},
  model::{CascadeLocation, DetectParams},
  store::DEFAULT_DATABASE,
};

/// Paizhao 车牌采集与识别
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 数据库文件路径
  #[arg(long, global = true, default_value = DEFAULT_DATABASE, value_name = "FILE")]
  pub database: PathBuf,

  #[command(subcommand)]
  pub command: Command,
}

/// 识别相关参数
#[derive(clap::Args, Debug)]
pub struct EngineArgs {
  /// 级联模型文件路径
  #[arg(long, value_name = "FILE")]
  pub cascade: Option<PathBuf>,

  /// 首选路径不存在时使用的级联模型文件
  #[arg(long, value_name = "FILE")]
  pub cascade_fallback: Option<PathBuf>,

  /// 图像金字塔缩放比例
  #[arg(long, default_value = "1.2", value_name = "FACTOR")]
  pub scale_factor: f64,

  /// 候选框最少相邻数
  #[arg(long, default_value = "5", value_name = "COUNT")]
  pub min_neighbors: usize,

  /// tesseract 可执行文件（路径或 PATH 中的命令名）
  #[arg(long, default_value = DEFAULT_TESSERACT, value_name = "EXE")]
  pub tesseract: PathBuf,

  /// 包含 eng.traineddata 的目录，默认取 TESSDATA_PREFIX
  #[arg(long, value_name = "DIR")]
  pub tessdata: Option<PathBuf>,

  /// 车牌图像保存目录
  #[arg(long, default_value = ".", value_name = "DIR")]
  pub artifacts: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// 连续采集，每 5 秒自动识别一次；按回车手动识别
  Run {
    #[command(flatten)]
    engine: EngineArgs,

    /// 帧来源，例如 v4l:///dev/video0 或 image:///tmp/car.jpg
    #[arg(long, default_value = DEFAULT_CAMERA, value_name = "SOURCE")]
    input: Url,

    /// 摄像头序号，给出时覆盖 --input
    #[arg(long, value_name = "INDEX")]
    camera: Option<usize>,

    /// 运行秒数，不给出时运行到 Ctrl-C
    #[arg(long, value_name = "SECONDS")]
    duration: Option<u64>,
  },

  /// 对单张图像识别一次并入库
  Detect {
    #[command(flatten)]
    engine: EngineArgs,

    /// 图像来源，例如 image:///tmp/car.jpg
    #[arg(long, value_name = "SOURCE")]
    input: Url,

    /// 以 JSON 输出记录
    #[arg(long)]
    json: bool,
  },

  /// 列出检测记录，时间倒序
  List {
    /// 最近记录条数
    #[arg(long, default_value_t = DEFAULT_RECENT_LIMIT, value_name = "COUNT")]
    limit: usize,

    /// 列出全部记录
    #[arg(long)]
    all: bool,

    #[arg(long)]
    json: bool,
  },

  /// 按车牌展开的历史
  History {
    #[arg(long, value_name = "COUNT")]
    limit: Option<usize>,

    #[arg(long)]
    json: bool,
  },

  /// 删除一条记录
  Delete { id: i64 },

  /// 修改记录中的车牌文字
  Rename { id: i64, old: String, new: String },

  /// 打开车牌图像目录
  Open {
    #[arg(long, default_value = ".", value_name = "DIR")]
    artifacts: PathBuf,
  },
}

impl EngineArgs {
  pub fn to_config(&self, database: PathBuf) -> PlateConfig {
    let defaults = CascadeLocation::default();
    PlateConfig {
      cascade: CascadeLocation {
        primary: self.cascade.clone().unwrap_or(defaults.primary),
        fallback: self.cascade_fallback.clone().unwrap_or(defaults.fallback),
      },
      detect: DetectParams {
        scale_factor: self.scale_factor,
        min_neighbors: self.min_neighbors,
      },
      tesseract: self.tesseract.clone(),
      tessdata: self.tessdata.clone().unwrap_or_else(default_tessdata),
      artifacts_dir: self.artifacts.clone(),
      database,
      ..PlateConfig::default()
    }
  }
}
