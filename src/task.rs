// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 单帧处理流程
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

use std::{
  fmt,
  time::{Duration, Instant},
};

use image::RgbImage;
use tracing::{info, warn};

use crate::{
  model::DetectResult,
  processor::Yolo26Processor,
  tensor::{InputTensor, OutputMap},
};

/// 外部推理引擎，负责张量分配和执行
pub trait Engine {
  type Error: std::error::Error + Send + Sync + 'static;

  fn input(&mut self) -> InputTensor<'_>;
  fn run(&mut self) -> Result<(), Self::Error>;
  fn outputs(&self) -> OutputMap<'_>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Timings {
  pub preprocess: Duration,
  pub inference: Duration,
  pub postprocess: Duration,
}

impl Timings {
  pub fn total(&self) -> Duration {
    self.preprocess + self.inference + self.postprocess
  }
}

impl fmt::Display for Timings {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "Timings:")?;
    writeln!(f, "  Pre-process:  {} ms", self.preprocess.as_millis())?;
    writeln!(f, "  Inference:    {} ms", self.inference.as_millis())?;
    writeln!(f, "  Post-process: {} ms", self.postprocess.as_millis())?;
    writeln!(f, "  Total:        {} ms", self.total().as_millis())
  }
}

#[derive(Debug, Clone)]
pub struct FrameReport {
  pub result: DetectResult,
  pub timings: Timings,
}

/// 缩放 -> 预处理 -> 推理 -> 后处理，一帧完成后才返回
pub struct OneShotTask;

impl OneShotTask {
  pub fn run_frame<E: Engine>(
    &self,
    processor: &Yolo26Processor,
    engine: &mut E,
    image: &RgbImage,
  ) -> anyhow::Result<FrameReport> {
    let now = Instant::now();
    let grids = {
      let mut input = engine.input();
      let resized = processor.resize(image, input.width() as u32, input.height() as u32);
      processor.preprocess(&resized, &mut input)?
    };
    let preprocess = now.elapsed();

    let now = Instant::now();
    engine.run()?;
    let inference = now.elapsed();

    let now = Instant::now();
    let result = processor.postprocess(&engine.outputs(), grids)?;
    let postprocess = now.elapsed();

    let timings = Timings {
      preprocess,
      inference,
      postprocess,
    };
    info!(
      "帧处理完成: 预处理 {:.2?}, 推理 {:.2?}, 后处理 {:.2?}, {} 个目标",
      preprocess,
      inference,
      postprocess,
      result.len()
    );

    Ok(FrameReport { result, timings })
  }
}

/// 重复处理同一帧，统计平均耗时
pub struct RepeatShotTask {
  repeat_times: usize,
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    Self { repeat_times: 100 }
  }
}

impl RepeatShotTask {
  const WARMUP: usize = 2;

  pub fn with_repeat_times(mut self, repeat_times: usize) -> Self {
    self.repeat_times = repeat_times.max(Self::WARMUP + 1);
    self
  }

  /// 返回最后一帧的结果，耗时为去掉预热帧后的平均值
  pub fn run_frames<E: Engine>(
    &self,
    processor: &Yolo26Processor,
    engine: &mut E,
    image: &RgbImage,
  ) -> anyhow::Result<FrameReport> {
    let mut reports = Vec::with_capacity(self.repeat_times);
    for i in 0..self.repeat_times {
      let report = OneShotTask.run_frame(processor, engine, image)?;
      info!("({}) 总耗时: {:.2?}", i, report.timings.total());
      reports.push(report);
    }

    let measured = &reports[Self::WARMUP..];
    let mut timings = Timings::default();
    for report in measured {
      timings.preprocess += report.timings.preprocess;
      timings.inference += report.timings.inference;
      timings.postprocess += report.timings.postprocess;
    }
    let n = measured.len() as u32;
    timings.preprocess /= n;
    timings.inference /= n;
    timings.postprocess /= n;
    warn!("平均耗时: {:.2?}", timings.total());

    let result = reports
      .pop()
      .map(|report| report.result)
      .unwrap_or_default();
    Ok(FrameReport { result, timings })
  }
}
