// 该文件是 Paizhao （牌照） 项目的一部分。
// src/store.rs - 检测记录数据库
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
use std::sync::{Mutex, PoisonError};

use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::record::{DetectionRecord, PlateImages, RecordError, rename_in_summary};

/// 默认数据库文件
pub const DEFAULT_DATABASE: &str = "license_plates.db";

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS detections (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  timestamp TEXT NOT NULL,
  plates_count INTEGER,
  plate_images BLOB,
  detection_data TEXT
)";

const SELECT_COLUMNS: &str =
  "SELECT id, timestamp, plates_count, plate_images, detection_data FROM detections";

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("数据库错误: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("记录数据损坏: {0}")]
  Record(#[from] RecordError),
}

/// 历史表中的一行，每个车牌一行
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryRow {
  pub id: i64,
  pub date: String,
  pub time: String,
  pub plate: String,
  pub filename: String,
  pub plate_count: i64,
}

type RawRow = (i64, String, Option<i64>, Option<Vec<u8>>, Option<String>);

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

/// 图像表无法解析时记录警告并按空表返回，不影响其他行
fn decode(raw: RawRow) -> DetectionRecord {
  let (id, timestamp, count, blob, summary) = raw;
  let plate_images = match PlateImages::from_blob(blob.as_deref().unwrap_or_default()) {
    Ok(images) => images,
    Err(e) => {
      warn!("记录 {} 的车牌图像无法解析: {}", id, e);
      PlateImages::new()
    }
  };
  DetectionRecord {
    id: Some(id),
    timestamp,
    plate_count: count.unwrap_or(0),
    plate_images,
    summary: summary.unwrap_or_default(),
  }
}

/// 拆分时间戳为日期与时间
fn split_timestamp(timestamp: &str) -> (String, String) {
  match NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f") {
    Ok(time) => (
      time.format("%Y-%m-%d").to_string(),
      time.format("%H:%M:%S").to_string(),
    ),
    Err(_) => (timestamp.to_string(), String::new()),
  }
}

/// 检测记录数据库
pub struct PlateStore {
  conn: Mutex<Connection>,
}

impl PlateStore {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
    let path = path.as_ref();
    info!("打开数据库: {}", path.display());
    Self::with_connection(Connection::open(path)?)
  }

  pub fn open_in_memory() -> Result<Self, StoreError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self, StoreError> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.init_schema()?;
    Ok(store)
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
    self.conn.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// 建表，可重复执行
  pub fn init_schema(&self) -> Result<(), StoreError> {
    self.lock().execute(CREATE_TABLE, [])?;
    Ok(())
  }

  /// 写入记录，返回新 id
  pub fn insert(&self, record: &DetectionRecord) -> Result<i64, StoreError> {
    let blob = record.plate_images.to_blob()?;
    let conn = self.lock();
    conn.execute(
      "INSERT INTO detections (timestamp, plates_count, plate_images, detection_data)
       VALUES (?1, ?2, ?3, ?4)",
      params![record.timestamp, record.plate_count, blob, record.summary],
    )?;
    let id = conn.last_insert_rowid();
    info!("检测记录已保存, ID: {}", id);
    Ok(id)
  }

  fn query(&self, limit: Option<usize>) -> Result<Vec<DetectionRecord>, StoreError> {
    let conn = self.lock();
    let sql = format!("{} ORDER BY timestamp DESC, id DESC LIMIT ?1", SELECT_COLUMNS);
    // LIMIT -1 表示不限
    let limit = limit.map(|n| n as i64).unwrap_or(-1);
    let mut stmt = conn.prepare(&sql)?;
    let raws = stmt
      .query_map(params![limit], read_raw)?
      .collect::<Result<Vec<_>, _>>()?;
    Ok(raws.into_iter().map(decode).collect())
  }

  /// 最近的 `limit` 条记录，时间倒序
  pub fn list_recent(&self, limit: usize) -> Result<Vec<DetectionRecord>, StoreError> {
    self.query(Some(limit))
  }

  pub fn list_all(&self) -> Result<Vec<DetectionRecord>, StoreError> {
    self.query(None)
  }

  pub fn get(&self, id: i64) -> Result<Option<DetectionRecord>, StoreError> {
    let conn = self.lock();
    let sql = format!("{} WHERE id = ?1", SELECT_COLUMNS);
    let raw = conn.query_row(&sql, params![id], read_raw).optional()?;
    Ok(raw.map(decode))
  }

  /// 删除记录，返回是否确实删除了一行
  pub fn delete(&self, id: i64) -> Result<bool, StoreError> {
    let removed = self
      .lock()
      .execute("DELETE FROM detections WHERE id = ?1", params![id])?;
    debug!("删除记录 {}: {} 行", id, removed);
    Ok(removed > 0)
  }

  /// 在一个事务中重命名记录里的车牌文字
  ///
  /// 记录或 `plate_<old>` 不存在时返回 false，数据库不变。
  pub fn rename_text(&self, id: i64, old: &str, new: &str) -> Result<bool, StoreError> {
    let mut conn = self.lock();
    let tx = conn.transaction()?;

    let row: Option<(Option<Vec<u8>>, Option<String>)> = tx
      .query_row(
        "SELECT plate_images, detection_data FROM detections WHERE id = ?1",
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;
    let Some((blob, summary)) = row else {
      return Ok(false);
    };

    let mut images = PlateImages::from_blob(blob.as_deref().unwrap_or_default())?;
    if !images.rename(old, new) {
      return Ok(false);
    }
    let summary = rename_in_summary(&summary.unwrap_or_default(), old, new);

    tx.execute(
      "UPDATE detections SET plate_images = ?1, detection_data = ?2 WHERE id = ?3",
      params![images.to_blob()?, summary, id],
    )?;
    tx.commit()?;
    info!("记录 {} 的车牌 {} 已改为 {}", id, old, new);
    Ok(true)
  }

  /// 删除数据表，之后的写入都会失败
  #[cfg(test)]
  pub(crate) fn drop_table(&self) {
    self.lock().execute("DROP TABLE detections", []).unwrap();
  }

  /// 按车牌展开的历史，`limit` 为空时包含全部记录
  pub fn history(&self, limit: Option<usize>) -> Result<Vec<HistoryRow>, StoreError> {
    let mut rows = Vec::new();
    for record in self.query(limit)? {
      let id = record.id.unwrap_or_default();
      let (date, time) = split_timestamp(&record.timestamp);
      let texts: Vec<&str> = record.plate_images.texts().collect();

      if texts.is_empty() {
        rows.push(HistoryRow {
          id,
          date,
          time,
          plate: "-".to_string(),
          filename: "No plates".to_string(),
          plate_count: record.plate_count,
        });
        continue;
      }

      for text in texts {
        rows.push(HistoryRow {
          id,
          date: date.clone(),
          time: time.clone(),
          plate: text.to_string(),
          filename: record
            .plate_images
            .filename(text)
            .unwrap_or("Unknown")
            .to_string(),
          plate_count: record.plate_count,
        });
      }
    }
    Ok(rows)
  }
}
