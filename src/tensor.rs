// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tensor.rs - 定点张量视图
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

use std::collections::{BTreeMap, HashMap};

use crate::quant::exponent_scale;

/// 每个检测头的 (回归, 分类) 输出名，按 stride 8/16/32 排列
pub const OUTPUT_KEYS: [(&str, &str); 3] = [
  ("one2one_p3_box", "one2one_p3_cls"),
  ("one2one_p4_box", "one2one_p4_cls"),
  ("one2one_p5_box", "one2one_p5_cls"),
];

/// 模型输入张量，NHWC 布局的 int8 缓冲区
#[derive(Debug)]
pub struct InputTensor<'a> {
  shape: [usize; 4],
  exponent: i32,
  data: &'a mut [i8],
}

impl<'a> InputTensor<'a> {
  /// `shape` 为 `[batch, height, width, channels]`
  pub fn new(shape: [usize; 4], exponent: i32, data: &'a mut [i8]) -> Self {
    Self {
      shape,
      exponent,
      data,
    }
  }

  pub fn shape(&self) -> [usize; 4] {
    self.shape
  }

  pub fn height(&self) -> usize {
    self.shape[1]
  }

  pub fn width(&self) -> usize {
    self.shape[2]
  }

  pub fn channels(&self) -> usize {
    self.shape[3]
  }

  pub fn exponent(&self) -> i32 {
    self.exponent
  }

  pub fn data(&self) -> &[i8] {
    &*self.data
  }

  pub fn data_mut(&mut self) -> &mut [i8] {
    &mut *self.data
  }
}

/// 按元素位宽区分的原始数据
#[derive(Debug, Clone, Copy)]
pub enum TensorData<'a> {
  I8(&'a [i8]),
  I16(&'a [i16]),
}

impl TensorData<'_> {
  pub fn len(&self) -> usize {
    match self {
      TensorData::I8(data) => data.len(),
      TensorData::I16(data) => data.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn bits(&self) -> u32 {
    match self {
      TensorData::I8(_) => 8,
      TensorData::I16(_) => 16,
    }
  }
}

/// 模型输出张量，`value = raw * 2^exponent`
#[derive(Debug, Clone, Copy)]
pub struct OutputTensor<'a> {
  shape: [usize; 4],
  exponent: i32,
  data: TensorData<'a>,
}

impl<'a> OutputTensor<'a> {
  pub fn new(shape: [usize; 4], exponent: i32, data: TensorData<'a>) -> Self {
    Self {
      shape,
      exponent,
      data,
    }
  }

  pub fn shape(&self) -> [usize; 4] {
    self.shape
  }

  pub fn exponent(&self) -> i32 {
    self.exponent
  }

  pub fn scale(&self) -> f32 {
    exponent_scale(self.exponent)
  }

  pub fn data(&self) -> TensorData<'a> {
    self.data
  }
}

pub type InputMap<'a> = BTreeMap<String, InputTensor<'a>>;
pub type OutputMap<'a> = HashMap<String, OutputTensor<'a>>;
