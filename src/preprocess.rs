// 该文件是 Shanan （山南西风） 项目的一部分。
// src/preprocess.rs - 输入预处理
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

use std::borrow::Cow;

use image::{RgbImage, imageops::FilterType};
use tracing::{debug, error};

use crate::{
  processor::ProcessorError,
  quant::{INPUT_EXPONENT, QuantizationLut},
  tensor::InputTensor,
};

/// 三个检测头的下采样倍数
pub const STRIDES: [usize; 3] = [8, 16, 32];

const RGB_CHANNELS: usize = 3;

/// 每个检测头的方形网格边长，`grid[i] = input_width / STRIDES[i]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GridSizes([usize; 3]);

impl GridSizes {
  pub fn from_input_width(input_width: usize) -> Self {
    Self(STRIDES.map(|stride| input_width / stride))
  }

  pub fn as_array(&self) -> [usize; 3] {
    self.0
  }

  /// 所有网格都非空时才能解码
  pub fn is_ready(&self) -> bool {
    self.0.iter().all(|&grid| grid > 0)
  }

  /// (grid, stride) 对
  pub fn layers(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
    self.0.iter().copied().zip(STRIDES)
  }
}

/// 外部图像变换，将 `src` 重采样写入已分配好尺寸的 `dst`
pub trait ImageTransform {
  fn transform(&self, src: &RgbImage, dst: &mut RgbImage);
}

/// 基于 `image::imageops::resize` 的 CPU 实现
#[derive(Debug, Clone, Copy)]
pub struct CpuResize {
  filter: FilterType,
}

impl Default for CpuResize {
  fn default() -> Self {
    Self {
      filter: FilterType::Triangle,
    }
  }
}

impl ImageTransform for CpuResize {
  fn transform(&self, src: &RgbImage, dst: &mut RgbImage) {
    let resized = image::imageops::resize(src, dst.width(), dst.height(), self.filter);
    dst.copy_from_slice(resized.as_raw());
  }
}

/// 尺寸已匹配时原样借出；否则分配新图像并交给 `transform` 重采样，调用者拥有返回的缓冲区
pub fn resize<'a, T: ImageTransform + ?Sized>(
  image: &'a RgbImage,
  model_width: u32,
  model_height: u32,
  transform: &T,
) -> Cow<'a, RgbImage> {
  if image.dimensions() == (model_width, model_height) {
    return Cow::Borrowed(image);
  }

  debug!(
    "缩放图像 {}x{} -> {}x{}",
    image.width(),
    image.height(),
    model_width,
    model_height
  );
  let mut resized = RgbImage::new(model_width, model_height);
  transform.transform(image, &mut resized);
  Cow::Owned(resized)
}

/// 校验输入指数，计算网格尺寸，并通过查找表把图像量化进输入张量
///
/// 指数不是 -7 时查找表的结果无意义，直接返回致命错误。
pub fn preprocess(
  lut: &QuantizationLut,
  image: &RgbImage,
  input: &mut InputTensor<'_>,
) -> Result<GridSizes, ProcessorError> {
  let exponent = input.exponent();
  if exponent != INPUT_EXPONENT {
    error!(
      "模型输入指数 {} 与查找表量化不兼容 (期望 {})",
      exponent, INPUT_EXPONENT
    );
    return Err(ProcessorError::ExponentMismatch { exponent });
  }

  let (width, height) = image.dimensions();
  let expected = (input.height(), input.width(), input.channels());
  if expected != (height as usize, width as usize, RGB_CHANNELS) {
    error!(
      "图像尺寸 {}x{}x{} 与输入张量 {:?} 不匹配",
      height,
      width,
      RGB_CHANNELS,
      input.shape()
    );
    return Err(ProcessorError::ShapeMismatch {
      name: "input".to_string(),
      expected: input.height() * input.width() * input.channels(),
      actual: image.as_raw().len(),
    });
  }

  let raw = image.as_raw();
  if input.data().len() < raw.len() {
    error!(
      "输入张量缓冲区过小: {} < {}",
      input.data().len(),
      raw.len()
    );
    return Err(ProcessorError::ShapeMismatch {
      name: "input".to_string(),
      expected: raw.len(),
      actual: input.data().len(),
    });
  }

  let grids = GridSizes::from_input_width(input.width());
  debug!("网格尺寸: {:?}", grids.as_array());

  lut.quantize_into(raw, input.data_mut());

  Ok(grids)
}

#[cfg(test)]
mod tests {
  use super::*;

  struct FillTransform(u8);

  impl ImageTransform for FillTransform {
    fn transform(&self, _src: &RgbImage, dst: &mut RgbImage) {
      dst.fill(self.0);
    }
  }

  fn input_buffer(width: usize, height: usize) -> Vec<i8> {
    vec![0i8; width * height * RGB_CHANNELS]
  }

  #[test]
  fn grid_sizes_for_common_widths() {
    assert_eq!(GridSizes::from_input_width(640).as_array(), [80, 40, 20]);
    assert_eq!(GridSizes::from_input_width(512).as_array(), [64, 32, 16]);
    assert!(GridSizes::from_input_width(640).is_ready());
    assert!(!GridSizes::default().is_ready());
    assert!(!GridSizes::from_input_width(16).is_ready());
  }

  #[test]
  fn resize_is_noop_when_dimensions_match() {
    let image = RgbImage::new(64, 48);
    let first = resize(&image, 64, 48, &FillTransform(9));
    assert!(matches!(first, Cow::Borrowed(_)));
    assert!(std::ptr::eq(&*first, &image));

    let second = resize(&*first, 64, 48, &FillTransform(9));
    assert!(std::ptr::eq(&*second, &image));
    assert!(second.iter().all(|&b| b == 0));
  }

  #[test]
  fn resize_allocates_model_sized_buffer() {
    let image = RgbImage::new(100, 50);
    let resized = resize(&image, 64, 64, &FillTransform(7));
    assert!(matches!(resized, Cow::Owned(_)));
    assert_eq!(resized.dimensions(), (64, 64));
    assert!(resized.iter().all(|&b| b == 7));
  }

  #[test]
  fn cpu_resize_writes_into_destination() {
    let image = RgbImage::from_pixel(10, 10, image::Rgb([255, 0, 128]));
    let resized = resize(&image, 4, 4, &CpuResize::default());
    assert_eq!(resized.dimensions(), (4, 4));
    assert_eq!(resized.get_pixel(2, 2).0, [255, 0, 128]);
  }

  #[test]
  fn preprocess_quantizes_interleaved_pixels() {
    let lut = QuantizationLut::new();
    let mut image = RgbImage::new(32, 32);
    image.put_pixel(0, 0, image::Rgb([255, 128, 0]));
    image.put_pixel(1, 0, image::Rgb([64, 2, 1]));

    let mut buffer = input_buffer(32, 32);
    let mut input = InputTensor::new([1, 32, 32, 3], -7, &mut buffer);
    let grids = preprocess(&lut, &image, &mut input).unwrap();

    assert_eq!(grids.as_array(), [4, 2, 1]);
    assert_eq!(&buffer[..6], &[127, 64, 0, 32, 1, 1]);
  }

  #[test]
  fn preprocess_accepts_only_exponent_minus_seven() {
    let lut = QuantizationLut::new();
    let image = RgbImage::new(32, 32);
    for exponent in [-6, -8, i32::MAX, i32::MIN] {
      let mut buffer = input_buffer(32, 32);
      let mut input = InputTensor::new([1, 32, 32, 3], exponent, &mut buffer);
      let err = preprocess(&lut, &image, &mut input).unwrap_err();
      assert!(matches!(err, ProcessorError::ExponentMismatch { exponent: e } if e == exponent));
      assert!(err.is_fatal());
    }
  }

  #[test]
  fn preprocess_rejects_unresized_image() {
    let lut = QuantizationLut::new();
    let image = RgbImage::new(40, 32);
    let mut buffer = input_buffer(32, 32);
    let mut input = InputTensor::new([1, 32, 32, 3], -7, &mut buffer);
    let err = preprocess(&lut, &image, &mut input).unwrap_err();
    assert!(matches!(err, ProcessorError::ShapeMismatch { .. }));
  }
}
