// 该文件是 Shanan （山南西风） 项目的一部分。
// src/processor.rs - YOLO26 量化前后处理器
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

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  decode::decode_layers,
  model::{COCO_CLASSES, DetectResult},
  preprocess::{self, CpuResize, GridSizes, ImageTransform},
  quant::QuantizationLut,
  rank::rank,
  tensor::{InputMap, InputTensor, OutputMap},
};

pub const DEFAULT_TARGET_K: usize = 32;
pub const DEFAULT_CONF_THRESH: f32 = 0.10;

#[derive(Error, Debug)]
pub enum ProcessorError {
  #[error("模型输入指数 {exponent} 与查找表量化不兼容 (期望 -7)")]
  ExponentMismatch { exponent: i32 },
  #[error("缺少模型输出: {0}")]
  MissingOutput(String),
  #[error("缺少模型输入")]
  MissingInput,
  #[error("张量 {name} 大小不匹配: 期望 {expected}, 实际 {actual}")]
  ShapeMismatch {
    name: String,
    expected: usize,
    actual: usize,
  },
  #[error("配置无效: {0}")]
  InvalidConfig(String),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

impl ProcessorError {
  /// 模型与处理器不兼容，继续处理会得到错误结果
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      ProcessorError::ExponentMismatch { .. }
        | ProcessorError::MissingOutput(_)
        | ProcessorError::MissingInput
        | ProcessorError::ShapeMismatch { .. }
    )
  }
}

pub struct Yolo26ProcessorBuilder {
  target_k: usize,
  conf_thresh: f32,
  class_names: &'static [&'static str],
  transform: Box<dyn ImageTransform>,
  fast_reject: bool,
}

impl Default for Yolo26ProcessorBuilder {
  fn default() -> Self {
    Self {
      target_k: DEFAULT_TARGET_K,
      conf_thresh: DEFAULT_CONF_THRESH,
      class_names: &COCO_CLASSES,
      transform: Box::new(CpuResize::default()),
      fast_reject: true,
    }
  }
}

impl FromUrlWithScheme for Yolo26ProcessorBuilder {
  const SCHEME: &'static str = "yolo26";
}

impl FromUrl for Yolo26ProcessorBuilder {
  type Error = ProcessorError;

  /// `yolo26://default?target_k=32&conf_thresh=0.1`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ProcessorError::SchemeMismatch(format!(
        "期望方案 '{}', 实际方案 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let mut builder = Self::default();
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "target_k" => {
          let k = value.parse::<usize>().map_err(|e| {
            ProcessorError::InvalidConfig(format!("target_k '{}' 无法解析: {}", value, e))
          })?;
          builder = builder.target_k(k);
        }
        "conf_thresh" => {
          let thresh = value.parse::<f32>().map_err(|e| {
            ProcessorError::InvalidConfig(format!("conf_thresh '{}' 无法解析: {}", value, e))
          })?;
          builder = builder.conf_thresh(thresh);
        }
        other => warn!("忽略未知参数: {}={}", other, value),
      }
    }
    Ok(builder)
  }
}

impl Yolo26ProcessorBuilder {
  pub fn target_k(mut self, target_k: usize) -> Self {
    self.target_k = target_k;
    self
  }

  pub fn conf_thresh(mut self, conf_thresh: f32) -> Self {
    self.conf_thresh = conf_thresh;
    self
  }

  pub fn class_names(mut self, class_names: &'static [&'static str]) -> Self {
    self.class_names = class_names;
    self
  }

  pub fn transform<T: ImageTransform + 'static>(mut self, transform: T) -> Self {
    self.transform = Box::new(transform);
    self
  }

  /// 关闭后每个类别都计算 sigmoid，只用于对照验证
  #[cfg(test)]
  pub(crate) fn fast_reject(mut self, enabled: bool) -> Self {
    self.fast_reject = enabled;
    self
  }

  pub fn build(self) -> Result<Yolo26Processor, ProcessorError> {
    if self.target_k == 0 {
      return Err(ProcessorError::InvalidConfig(
        "target_k 必须大于 0".to_string(),
      ));
    }
    if !(self.conf_thresh.is_finite() && self.conf_thresh > 0.0 && self.conf_thresh < 1.0) {
      return Err(ProcessorError::InvalidConfig(format!(
        "conf_thresh 必须在 (0, 1) 之间, 实际为 {}",
        self.conf_thresh
      )));
    }

    debug!(
      "创建处理器: target_k={}, conf_thresh={}, 类别数={}",
      self.target_k,
      self.conf_thresh,
      self.class_names.len()
    );

    Ok(self.assemble())
  }

  fn assemble(self) -> Yolo26Processor {
    Yolo26Processor {
      target_k: self.target_k,
      conf_thresh: self.conf_thresh,
      class_names: self.class_names,
      transform: self.transform,
      fast_reject: self.fast_reject,
      lut: QuantizationLut::new(),
    }
  }
}

/// YOLO26 一对一检测头的量化前后处理
///
/// 配置和查找表在构造后只读；网格尺寸由 [`Yolo26Processor::preprocess`] 返回，
/// 再显式传给 [`Yolo26Processor::postprocess`]。
pub struct Yolo26Processor {
  target_k: usize,
  conf_thresh: f32,
  class_names: &'static [&'static str],
  transform: Box<dyn ImageTransform>,
  fast_reject: bool,
  lut: QuantizationLut,
}

/// 与 `Yolo26Processor::builder().build()` 等价，默认参数总是合法
impl Default for Yolo26Processor {
  fn default() -> Self {
    Yolo26ProcessorBuilder::default().assemble()
  }
}

impl Yolo26Processor {
  pub fn builder() -> Yolo26ProcessorBuilder {
    Yolo26ProcessorBuilder::default()
  }

  pub fn target_k(&self) -> usize {
    self.target_k
  }

  pub fn conf_thresh(&self) -> f32 {
    self.conf_thresh
  }

  pub fn class_names(&self) -> &'static [&'static str] {
    self.class_names
  }

  pub fn resize<'a>(
    &self,
    image: &'a RgbImage,
    model_width: u32,
    model_height: u32,
  ) -> Cow<'a, RgbImage> {
    preprocess::resize(image, model_width, model_height, self.transform.as_ref())
  }

  /// 按第一个输入张量的 [N, H, W, C] 形状缩放
  pub fn resize_for_inputs<'a>(&self, image: &'a RgbImage, inputs: &InputMap<'_>) -> Cow<'a, RgbImage> {
    match inputs.values().next() {
      Some(input) => self.resize(image, input.width() as u32, input.height() as u32),
      None => Cow::Borrowed(image),
    }
  }

  pub fn preprocess(
    &self,
    image: &RgbImage,
    input: &mut InputTensor<'_>,
  ) -> Result<GridSizes, ProcessorError> {
    preprocess::preprocess(&self.lut, image, input)
  }

  /// 使用映射中的第一个输入张量
  pub fn preprocess_inputs(
    &self,
    image: &RgbImage,
    inputs: &mut InputMap<'_>,
  ) -> Result<GridSizes, ProcessorError> {
    let input = inputs.values_mut().next().ok_or_else(|| {
      error!("模型没有输入张量");
      ProcessorError::MissingInput
    })?;
    self.preprocess(image, input)
  }

  /// 解码三个检测头并取前 `target_k` 个结果
  ///
  /// `grids` 未就绪时记录错误并返回空结果；缺少输出或张量过小是致命错误。
  pub fn postprocess(
    &self,
    outputs: &OutputMap<'_>,
    grids: GridSizes,
  ) -> Result<DetectResult, ProcessorError> {
    if !grids.is_ready() {
      error!("网格尺寸未初始化，请先调用 preprocess()");
      return Ok(DetectResult::empty());
    }

    let mut candidates = Vec::with_capacity(self.target_k * 2);
    decode_layers(
      outputs,
      grids,
      self.conf_thresh,
      self.fast_reject,
      &mut candidates,
    )?;
    debug!("候选框数量: {}", candidates.len());

    Ok(rank(candidates, self.target_k).into())
  }
}
