// 该文件是 Shanan （山南西风） 项目的一部分。
// src/quant.rs - 定点量化工具
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

use num_traits::AsPrimitive;

/// 查找表要求的输入张量指数，即 scale = 2^-7 = 1/128
pub const INPUT_EXPONENT: i32 = -7;

const INPUT_MULTIPLIER: f32 = 128.0;
const LUT_SIZE: usize = 256;

/// 像素到 int8 输入的量化查找表
///
/// 每一项等于 `clamp(round(i / 255 * 128), -128, 127)`，与逐像素浮点计算结果完全一致。
/// 仅在输入张量指数为 [`INPUT_EXPONENT`] 时有效。
#[derive(Debug, Clone)]
pub struct QuantizationLut {
  table: [i8; LUT_SIZE],
}

impl Default for QuantizationLut {
  fn default() -> Self {
    Self::new()
  }
}

impl QuantizationLut {
  pub fn new() -> Self {
    let mut table = [0i8; LUT_SIZE];
    for (i, slot) in table.iter_mut().enumerate() {
      let normalized = i as f32 / 255.0;
      let value = (normalized * INPUT_MULTIPLIER).round() as i32;
      *slot = value.clamp(i8::MIN as i32, i8::MAX as i32) as i8;
    }
    Self { table }
  }

  #[inline]
  pub fn lookup(&self, pixel: u8) -> i8 {
    self.table[pixel as usize]
  }

  /// 按字节顺序量化，`dst` 长度不足时多余的输入被忽略
  pub fn quantize_into(&self, src: &[u8], dst: &mut [i8]) {
    for (out, &pixel) in dst.iter_mut().zip(src) {
      *out = self.table[pixel as usize];
    }
  }
}

/// 定点张量元素（8 位或 16 位有符号整数）
pub trait QuantElem: Copy + AsPrimitive<f32> + AsPrimitive<i32> {
  /// 是否可以在整数域中提前拒绝低分类别
  const FAST_REJECT: bool;
}

impl QuantElem for i8 {
  const FAST_REJECT: bool = true;
}

// 16 位张量的整数阈值没有经过验证，总是走浮点路径
impl QuantElem for i16 {
  const FAST_REJECT: bool = false;
}

/// `2^exponent`
#[inline]
pub fn exponent_scale(exponent: i32) -> f32 {
  2.0f32.powi(exponent)
}

#[inline]
pub fn dequantize<T: QuantElem>(raw: T, scale: f32) -> f32 {
  AsPrimitive::<f32>::as_(raw) * scale
}

#[inline]
pub fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

/// sigmoid 的反函数: `-ln(1/p - 1)`
#[inline]
pub fn logit(p: f32) -> f32 {
  -(1.0 / p - 1.0).ln()
}

/// 将置信度阈值换算到分类张量的整数域: `floor(logit(conf) / scale)`
///
/// 原始值 `raw <= threshold` 时，`sigmoid(raw * scale) <= conf`，可以跳过浮点计算。
/// 超出 i32 范围时饱和。
pub fn integer_threshold(conf_thresh: f32, scale: f32) -> i32 {
  (logit(conf_thresh) / scale).floor() as i32
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;

  #[test]
  fn lut_matches_float_formula_for_every_pixel() {
    let lut = QuantizationLut::new();
    for i in 0..=255u8 {
      let expected = ((i as f64 / 255.0) * 128.0).round().clamp(-128.0, 127.0) as i8;
      assert_eq!(lut.lookup(i), expected, "pixel {}", i);
    }
  }

  #[test]
  fn lut_endpoints() {
    let lut = QuantizationLut::new();
    assert_eq!(lut.lookup(0), 0);
    assert_eq!(lut.lookup(1), 1);
    // 255 / 255 * 128 = 128 超出 int8，被截断
    assert_eq!(lut.lookup(255), 127);
    assert_eq!(lut.lookup(254), 127);
  }

  #[test]
  fn quantize_into_preserves_order() {
    let lut = QuantizationLut::new();
    let src = [0u8, 255, 128, 64];
    let mut dst = [0i8; 4];
    lut.quantize_into(&src, &mut dst);
    assert_eq!(dst, [0, 127, 64, 32]);
  }

  #[test]
  fn logit_inverts_sigmoid() {
    for p in [0.05f32, 0.1, 0.25, 0.5, 0.9] {
      assert_relative_eq!(sigmoid(logit(p)), p, epsilon = 1e-6);
    }
  }

  #[test]
  fn integer_threshold_for_default_confidence() {
    // logit(0.1) = -2.1972, / 2^-4 = -35.16
    assert_eq!(integer_threshold(0.1, exponent_scale(-4)), -36);
    assert_eq!(integer_threshold(0.5, exponent_scale(-4)), 0);
  }

  #[test]
  fn integer_threshold_implies_rejection() {
    let scale = exponent_scale(-5);
    let conf = 0.25;
    let t = integer_threshold(conf, scale);
    assert!(sigmoid(dequantize(t as i8, scale)) <= conf);
    assert!(sigmoid(dequantize((t + 1) as i8, scale)) > conf);
  }

  #[test]
  fn dequantize_both_widths() {
    assert_relative_eq!(dequantize(-64i8, exponent_scale(-6)), -1.0);
    assert_relative_eq!(dequantize(1024i16, exponent_scale(-10)), 1.0);
  }
}
