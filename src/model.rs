// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 检测结果
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

use std::fmt;

mod coco;
pub use self::coco::COCO_CLASSES;

/// 单个检测框，坐标为模型输入尺寸下的绝对像素坐标
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
  pub x1: f32,
  pub y1: f32,
  pub x2: f32,
  pub y2: f32,
  pub score: f32,
  pub class_id: usize,
}

impl Detection {
  /// [x_min, y_min, x_max, y_max]
  pub fn bbox(&self) -> [f32; 4] {
    [self.x1, self.y1, self.x2, self.y2]
  }

  pub fn label<'a>(&self, class_names: &[&'a str]) -> &'a str {
    class_names.get(self.class_id).copied().unwrap_or("unknown")
  }
}

/// 按置信度降序排列的检测结果
#[derive(Debug, Clone, Default)]
pub struct DetectResult {
  pub items: Box<[Detection]>,
}

impl DetectResult {
  pub fn empty() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
    self.items.iter()
  }

  pub fn labeled<'a>(&'a self, class_names: &'a [&'a str]) -> LabeledResult<'a> {
    LabeledResult {
      result: self,
      class_names,
    }
  }
}

impl From<Vec<Detection>> for DetectResult {
  fn from(items: Vec<Detection>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

impl<'a> IntoIterator for &'a DetectResult {
  type Item = &'a Detection;
  type IntoIter = std::slice::Iter<'a, Detection>;

  fn into_iter(self) -> Self::IntoIter {
    self.items.iter()
  }
}

/// 带类别名的结果，用于日志输出
pub struct LabeledResult<'a> {
  result: &'a DetectResult,
  class_names: &'a [&'a str],
}

impl fmt::Display for LabeledResult<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "--- Top Detections ---")?;
    for (idx, det) in self.result.iter().enumerate() {
      writeln!(
        f,
        "Det {}: {} ({:.2}%) | Box: [{:.1}, {:.1}, {:.1}, {:.1}]",
        idx + 1,
        det.label(self.class_names),
        det.score * 100.0,
        det.x1,
        det.y1,
        det.x2,
        det.y2
      )?;
    }
    Ok(())
  }
}
