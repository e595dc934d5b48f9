// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/decode_dump.rs - 回放导出的模型输出并解码
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
  convert::Infallible,
  path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use image::{ImageReader, RgbImage};
use serde_json::{Value, json};
use tracing::{debug, info};
use url::Url;

use shanan_quant::{
  FromUrl, Yolo26ProcessorBuilder,
  task::{Engine, OneShotTask},
  tensor::{InputTensor, OutputMap, OutputTensor, TensorData},
};

/// 使用导出的张量文件回放 YOLO26 后处理
///
/// 清单格式:
/// {
///   "input": { "shape": [1, 512, 512, 3], "exponent": -7 },
///   "outputs": {
///     "one2one_p3_box": { "file": "p3_box.bin", "dtype": "int8", "exponent": -4, "shape": [1, 64, 64, 4] },
///     ...
///   }
/// }
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 张量清单 JSON 文件
  #[arg(long, value_name = "FILE")]
  pub manifest: PathBuf,
  /// 输入图像，缺省时使用全黑图像
  #[arg(long, value_name = "IMAGE")]
  pub image: Option<PathBuf>,
  /// 处理器配置
  #[arg(long, value_name = "MODEL", default_value = "yolo26://default")]
  pub model: Url,
  /// 以 JSON 输出检测结果
  #[arg(long)]
  pub json: bool,
}

enum Storage {
  I8(Vec<i8>),
  I16(Vec<i16>),
}

struct DumpedOutput {
  name: String,
  shape: [usize; 4],
  exponent: i32,
  storage: Storage,
}

/// 把导出的输出张量当作推理结果的引擎
struct DumpEngine {
  input_shape: [usize; 4],
  input_exponent: i32,
  input: Vec<i8>,
  outputs: Vec<DumpedOutput>,
}

impl Engine for DumpEngine {
  type Error = Infallible;

  fn input(&mut self) -> InputTensor<'_> {
    InputTensor::new(self.input_shape, self.input_exponent, &mut self.input)
  }

  fn run(&mut self) -> Result<(), Self::Error> {
    debug!("回放 {} 个导出的输出张量", self.outputs.len());
    Ok(())
  }

  fn outputs(&self) -> OutputMap<'_> {
    self
      .outputs
      .iter()
      .map(|output| {
        let data = match &output.storage {
          Storage::I8(data) => TensorData::I8(data),
          Storage::I16(data) => TensorData::I16(data),
        };
        (
          output.name.clone(),
          OutputTensor::new(output.shape, output.exponent, data),
        )
      })
      .collect()
  }
}

fn parse_shape(value: &Value) -> Result<[usize; 4]> {
  let dims = value
    .as_array()
    .ok_or_else(|| anyhow!("shape 必须是数组"))?
    .iter()
    .map(|dim| dim.as_u64().map(|d| d as usize))
    .collect::<Option<Vec<_>>>()
    .ok_or_else(|| anyhow!("shape 必须是非负整数"))?;
  dims
    .try_into()
    .map_err(|dims: Vec<usize>| anyhow!("shape 必须有 4 维, 实际 {}", dims.len()))
}

fn parse_exponent(value: &Value) -> Result<i32> {
  let exponent = value
    .as_i64()
    .ok_or_else(|| anyhow!("exponent 必须是整数"))?;
  Ok(i32::try_from(exponent)?)
}

fn read_output(dir: &Path, name: &str, spec: &Value) -> Result<DumpedOutput> {
  let file = spec["file"]
    .as_str()
    .ok_or_else(|| anyhow!("{} 缺少 file", name))?;
  let path = dir.join(file);
  let bytes = std::fs::read(&path).with_context(|| format!("无法读取 {}", path.display()))?;
  let shape = parse_shape(&spec["shape"]).with_context(|| format!("{} 的 shape 无效", name))?;
  let exponent = parse_exponent(&spec["exponent"]).with_context(|| format!("{} 的 exponent 无效", name))?;

  let storage = match spec["dtype"].as_str().unwrap_or("int8") {
    "int8" => Storage::I8(bytes.iter().map(|&b| b as i8).collect()),
    "int16" => {
      if bytes.len() % 2 != 0 {
        bail!("{} 的字节数 {} 不是 2 的倍数", name, bytes.len());
      }
      Storage::I16(
        bytes
          .chunks_exact(2)
          .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
          .collect(),
      )
    }
    other => bail!("{} 的 dtype '{}' 不受支持", name, other),
  };
  debug!("读取 {}: {:?}, 2^{}, {} 字节", name, shape, exponent, bytes.len());

  Ok(DumpedOutput {
    name: name.to_string(),
    shape,
    exponent,
    storage,
  })
}

fn load_engine(manifest_path: &Path) -> Result<DumpEngine> {
  let text = std::fs::read_to_string(manifest_path)
    .with_context(|| format!("无法读取清单 {}", manifest_path.display()))?;
  let manifest: Value = serde_json::from_str(&text)?;
  let dir = manifest_path.parent().unwrap_or(Path::new("."));

  let input_shape = parse_shape(&manifest["input"]["shape"]).context("输入 shape 无效")?;
  let input_exponent = parse_exponent(&manifest["input"]["exponent"]).context("输入 exponent 无效")?;
  let input = vec![0i8; input_shape.iter().product()];

  let outputs = manifest["outputs"]
    .as_object()
    .ok_or_else(|| anyhow!("清单缺少 outputs"))?
    .iter()
    .map(|(name, spec)| read_output(dir, name, spec))
    .collect::<Result<Vec<_>>>()?;

  Ok(DumpEngine {
    input_shape,
    input_exponent,
    input,
    outputs,
  })
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("张量清单: {}", args.manifest.display());
  info!("处理器配置: {}", args.model);

  let processor = Yolo26ProcessorBuilder::from_url(&args.model)?.build()?;
  let mut engine = load_engine(&args.manifest)?;

  let image: RgbImage = match &args.image {
    Some(path) => ImageReader::open(path)?.decode()?.into(),
    None => {
      let [_, height, width, _] = engine.input_shape;
      RgbImage::new(width as u32, height as u32)
    }
  };

  let report = OneShotTask.run_frame(&processor, &mut engine, &image)?;

  if args.json {
    let detections: Vec<Value> = report
      .result
      .iter()
      .map(|det| {
        json!({
          "class_id": det.class_id,
          "label": det.label(processor.class_names()),
          "score": det.score,
          "bbox": det.bbox(),
        })
      })
      .collect();
    println!("{}", serde_json::to_string_pretty(&detections)?);
  } else {
    print!("{}", report.timings);
    println!();
    print!("{}", report.result.labeled(processor.class_names()));
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  /// 测试用的临时目录，离开作用域时删除
  struct ScratchDir(PathBuf);

  impl ScratchDir {
    fn new(name: &str) -> Self {
      let dir = std::env::temp_dir().join(format!("decode-dump-{}-{}", std::process::id(), name));
      let _ = std::fs::remove_dir_all(&dir);
      std::fs::create_dir_all(&dir).unwrap();
      Self(dir)
    }

    fn write(&self, file: &str, bytes: &[u8]) {
      std::fs::write(self.0.join(file), bytes).unwrap();
    }

    fn manifest(&self, outputs: Value) -> PathBuf {
      let manifest = json!({
        "input": { "shape": [1, 32, 32, 3], "exponent": -7 },
        "outputs": outputs,
      });
      let path = self.0.join("manifest.json");
      std::fs::write(&path, manifest.to_string()).unwrap();
      path
    }
  }

  impl Drop for ScratchDir {
    fn drop(&mut self) {
      let _ = std::fs::remove_dir_all(&self.0);
    }
  }

  fn le_bytes(values: &[i16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
  }

  fn error_text(result: Result<DumpEngine>) -> String {
    match result {
      Ok(_) => panic!("清单应当被拒绝"),
      Err(err) => format!("{:#}", err),
    }
  }

  #[test]
  fn loads_int16_class_tensor_as_little_endian() {
    let dir = ScratchDir::new("int16");
    let mut cls = vec![i16::MIN; 80];
    cls[0] = 3000;
    cls[1] = -3000;
    cls[79] = 0x0102;
    dir.write("cls.bin", &le_bytes(&cls));
    dir.write("box.bin", &[1, 2, 0xff, 4]);
    let path = dir.manifest(json!({
      "one2one_p5_cls": { "file": "cls.bin", "dtype": "int16", "exponent": -10, "shape": [1, 1, 1, 80] },
      "one2one_p5_box": { "file": "box.bin", "exponent": -2, "shape": [1, 1, 1, 4] },
    }));

    let mut engine = load_engine(&path).unwrap();
    assert_eq!(engine.input_shape, [1, 32, 32, 3]);
    assert_eq!(engine.input().exponent(), -7);
    assert_eq!(engine.input.len(), 32 * 32 * 3);

    let outputs = engine.outputs();
    let cls_tensor = &outputs["one2one_p5_cls"];
    assert_eq!(cls_tensor.shape(), [1, 1, 1, 80]);
    assert_eq!(cls_tensor.exponent(), -10);
    match cls_tensor.data() {
      TensorData::I16(values) => {
        assert_eq!(values.len(), 80);
        assert_eq!(&values[..3], &[3000, -3000, i16::MIN]);
        assert_eq!(values[79], 0x0102);
      }
      TensorData::I8(_) => panic!("int16 张量被读成 int8"),
    }

    // 缺省 dtype 为 int8
    match outputs["one2one_p5_box"].data() {
      TensorData::I8(values) => assert_eq!(values, &[1, 2, -1, 4]),
      TensorData::I16(_) => panic!("int8 张量被读成 int16"),
    }
  }

  #[test]
  fn replays_int16_outputs_through_pipeline() {
    let dir = ScratchDir::new("replay");
    let mut outputs = serde_json::Map::new();
    for (grid, level) in [(4, "p3"), (2, "p4"), (1, "p5")] {
      let mut cls = vec![i16::MIN; grid * grid * 80];
      if level == "p5" {
        cls[42] = 3000;
      }
      dir.write(&format!("{}_cls.bin", level), &le_bytes(&cls));
      dir.write(&format!("{}_box.bin", level), &vec![1u8; grid * grid * 4]);
      outputs.insert(
        format!("one2one_{}_cls", level),
        json!({ "file": format!("{}_cls.bin", level), "dtype": "int16", "exponent": -10, "shape": [1, grid, grid, 80] }),
      );
      outputs.insert(
        format!("one2one_{}_box", level),
        json!({ "file": format!("{}_box.bin", level), "dtype": "int8", "exponent": 0, "shape": [1, grid, grid, 4] }),
      );
    }
    let path = dir.manifest(Value::Object(outputs));

    let processor = Yolo26ProcessorBuilder::default().build().unwrap();
    let mut engine = load_engine(&path).unwrap();
    let image = RgbImage::new(32, 32);
    let report = OneShotTask.run_frame(&processor, &mut engine, &image).unwrap();

    assert_eq!(report.result.len(), 1);
    let det = &report.result.items[0];
    assert_eq!(det.class_id, 42);
    assert_eq!(det.bbox(), [-16.0, -16.0, 48.0, 48.0]);
  }

  #[test]
  fn rejects_odd_length_int16_file() {
    let dir = ScratchDir::new("odd");
    dir.write("cls.bin", &[0u8; 161]);
    let path = dir.manifest(json!({
      "one2one_p5_cls": { "file": "cls.bin", "dtype": "int16", "exponent": -10, "shape": [1, 1, 1, 80] },
    }));
    assert!(error_text(load_engine(&path)).contains("不是 2 的倍数"));
  }

  #[test]
  fn rejects_unsupported_dtype() {
    let dir = ScratchDir::new("dtype");
    dir.write("cls.bin", &[0u8; 320]);
    let path = dir.manifest(json!({
      "one2one_p5_cls": { "file": "cls.bin", "dtype": "float", "exponent": 0, "shape": [1, 1, 1, 80] },
    }));
    assert!(error_text(load_engine(&path)).contains("'float' 不受支持"));
  }

  #[test]
  fn rejects_shape_without_four_dims() {
    let dir = ScratchDir::new("shape");
    dir.write("cls.bin", &[0u8; 80]);
    let path = dir.manifest(json!({
      "one2one_p5_cls": { "file": "cls.bin", "dtype": "int8", "exponent": -4, "shape": [1, 1, 80] },
    }));
    assert!(error_text(load_engine(&path)).contains("4 维"));

    assert!(parse_shape(&json!([1, 20, 20, 80])).is_ok());
    assert!(parse_shape(&json!([1, -1, 20, 80])).is_err());
    assert!(parse_shape(&json!("1x20x20x80")).is_err());
  }

  #[test]
  fn rejects_exponent_out_of_range() {
    assert_eq!(parse_exponent(&json!(-7)).unwrap(), -7);
    assert!(parse_exponent(&json!(1u64 << 40)).is_err());
    assert!(parse_exponent(&json!(-4.5)).is_err());
  }
}
