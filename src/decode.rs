// 该文件是 Shanan （山南西风） 项目的一部分。
// src/decode.rs - 多尺度网格解码
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

//! 一对一检测头解码。
//!
//! 性能约定：对 int8 分类张量，先在整数域比较 `raw <= t_int`，命中则跳过该类别的
//! 反量化和 sigmoid。`t_int = floor(logit(conf) / scale)`，被跳过的类别必然满足
//! `sigmoid(raw * scale) <= conf`，因此保留下来的网格与逐类别计算 sigmoid 的结果一致，
//! 只是耗时不同。

use num_traits::AsPrimitive;
use tracing::{debug, error};

use crate::{
  model::Detection,
  preprocess::GridSizes,
  processor::ProcessorError,
  quant::{QuantElem, dequantize, integer_threshold, sigmoid},
  tensor::{OUTPUT_KEYS, OutputMap, OutputTensor, TensorData},
};

pub const NUM_CLASSES: usize = 80;
const BOX_DIMS: usize = 4;

/// 单个检测头的解码参数
#[derive(Debug, Clone, Copy)]
struct LayerParams {
  grid: usize,
  stride: f32,
  cls_scale: f32,
  box_scale: f32,
  conf_thresh: f32,
  cls_thresh: i32,
  fast_reject: bool,
}

fn lookup<'o, 'a>(outputs: &'o OutputMap<'a>, key: &str) -> Result<&'o OutputTensor<'a>, ProcessorError> {
  outputs.get(key).ok_or_else(|| {
    error!("模型缺少输出张量: {}", key);
    ProcessorError::MissingOutput(key.to_string())
  })
}

/// 张量形状必须是 `[_, grid, grid, dims]`，且缓冲区足够容纳
fn check_shape(key: &str, tensor: &OutputTensor<'_>, grid: usize, dims: usize) -> Result<(), ProcessorError> {
  let [_, h, w, c] = tensor.shape();
  let expected = grid * grid * dims;
  if [h, w, c] != [grid, grid, dims] {
    error!(
      "输出张量 {} 形状不匹配: 期望 [_, {}, {}, {}], 实际 {:?}",
      key,
      grid,
      grid,
      dims,
      tensor.shape()
    );
    return Err(ProcessorError::ShapeMismatch {
      name: key.to_string(),
      expected,
      actual: h * w * c,
    });
  }

  let actual = tensor.data().len();
  if actual < expected {
    error!("输出张量 {} 过小: 期望 {}, 实际 {}", key, expected, actual);
    return Err(ProcessorError::ShapeMismatch {
      name: key.to_string(),
      expected,
      actual,
    });
  }
  Ok(())
}

/// 依次解码 stride 8/16/32 三个检测头，候选框按检测头、行优先顺序追加到 `candidates`
pub fn decode_layers(
  outputs: &OutputMap<'_>,
  grids: GridSizes,
  conf_thresh: f32,
  fast_reject: bool,
  candidates: &mut Vec<Detection>,
) -> Result<(), ProcessorError> {
  // 先确认六个输出都存在，避免解码到一半才失败
  let mut heads = Vec::with_capacity(OUTPUT_KEYS.len());
  for &(box_key, cls_key) in OUTPUT_KEYS.iter() {
    heads.push((lookup(outputs, box_key)?, lookup(outputs, cls_key)?));
  }

  for ((boxes, classes), ((grid, stride), &(box_key, cls_key))) in heads
    .into_iter()
    .zip(grids.layers().zip(OUTPUT_KEYS.iter()))
  {
    check_shape(box_key, boxes, grid, BOX_DIMS)?;
    check_shape(cls_key, classes, grid, NUM_CLASSES)?;

    let cls_scale = classes.scale();
    let params = LayerParams {
      grid,
      stride: stride as f32,
      cls_scale,
      box_scale: boxes.scale(),
      conf_thresh,
      cls_thresh: integer_threshold(conf_thresh, cls_scale),
      fast_reject,
    };
    debug!(
      "检测头 stride={}: 网格 {}x{}, 分类 {} 位 / 2^{}, 回归 {} 位 / 2^{}, 整数阈值 {}",
      stride,
      grid,
      grid,
      classes.data().bits(),
      classes.exponent(),
      boxes.data().bits(),
      boxes.exponent(),
      params.cls_thresh
    );

    let before = candidates.len();
    match classes.data() {
      TensorData::I8(cls) => decode_with_boxes(cls, boxes.data(), &params, candidates),
      TensorData::I16(cls) => decode_with_boxes(cls, boxes.data(), &params, candidates),
    }
    debug!(
      "检测头 stride={}: {} 个候选框",
      stride,
      candidates.len() - before
    );
  }

  Ok(())
}

fn decode_with_boxes<C: QuantElem>(
  cls: &[C],
  boxes: TensorData<'_>,
  params: &LayerParams,
  candidates: &mut Vec<Detection>,
) {
  match boxes {
    TensorData::I8(boxes) => decode_layer(cls, boxes, params, candidates),
    TensorData::I16(boxes) => decode_layer(cls, boxes, params, candidates),
  }
}

fn decode_layer<C: QuantElem, B: QuantElem>(
  cls: &[C],
  boxes: &[B],
  params: &LayerParams,
  candidates: &mut Vec<Detection>,
) {
  let fast_reject = params.fast_reject && C::FAST_REJECT;
  let grid = params.grid;

  for h in 0..grid {
    for w in 0..grid {
      let cell = h * grid + w; // NHWC
      let scores = &cls[cell * NUM_CLASSES..(cell + 1) * NUM_CLASSES];

      let Some((class_id, score)) = best_class(scores, params, fast_reject) else {
        continue;
      };
      if score < params.conf_thresh {
        continue;
      }

      let offset = cell * BOX_DIMS;
      let [d_l, d_t, d_r, d_b] = [0, 1, 2, 3].map(|i| dequantize(boxes[offset + i], params.box_scale));

      let cx = w as f32 + 0.5;
      let cy = h as f32 + 0.5;
      candidates.push(Detection {
        x1: (cx - d_l) * params.stride,
        y1: (cy - d_t) * params.stride,
        x2: (cx + d_r) * params.stride,
        y2: (cy + d_b) * params.stride,
        score,
        class_id,
      });
    }
  }
}

/// 返回分数最高的 (类别, sigmoid 分数)，相同分数取先出现者；所有类别都被整数阈值拒绝时返回 None
#[inline]
fn best_class<C: QuantElem>(scores: &[C], params: &LayerParams, fast_reject: bool) -> Option<(usize, f32)> {
  let mut best: Option<(usize, f32)> = None;
  for (class_id, &raw) in scores.iter().enumerate() {
    if fast_reject && AsPrimitive::<i32>::as_(raw) <= params.cls_thresh {
      continue;
    }
    let score = sigmoid(dequantize(raw, params.cls_scale));
    if best.is_none_or(|(_, max)| score > max) {
      best = Some((class_id, score));
    }
  }
  best
}
