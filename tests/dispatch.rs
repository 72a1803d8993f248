// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/dispatch.rs - 任务分发集成测试
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

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use image::{GrayImage, Luma, Rgb, RgbImage};
use serde_json::{Value, json};

use shanan_bench::{
  config::TaskSpec,
  dispatch::{DispatchError, Dispatcher, RunSummary, SubtaskError},
  model::{
    DetectBox, DetectResult, EngineSpec, Family, LabelMap, Model, ModelError, PanopticResult,
    Prediction, Predictor, PredictorFactory,
  },
  output::Draw,
  task::StopFlag,
};

#[derive(Default, Clone)]
struct Counters {
  created: Rc<Cell<usize>>,
  inferred: Rc<Cell<usize>>,
}

struct MockPredictor {
  family: Family,
  inferred: Rc<Cell<usize>>,
}

impl Model for MockPredictor {
  type Input = RgbImage;
  type Output = Prediction;
  type Error = ModelError;

  fn infer(&self, input: &RgbImage) -> Result<Prediction, ModelError> {
    self.inferred.set(self.inferred.get() + 1);
    let (width, height) = input.dimensions();
    let boxes = DetectResult::from(vec![DetectBox {
      left: 1.0,
      top: 1.0,
      right: 6.0,
      bottom: 6.0,
      class_id: 2,
      confidence: 0.75,
    }]);
    Ok(match self.family {
      Family::Segmentation => Prediction::Segmentation(LabelMap::filled(width, height, 1)),
      Family::PanopticDriving => Prediction::PanopticDriving(PanopticResult {
        boxes,
        drive_mask: GrayImage::from_pixel(width, height, Luma([255])),
        lane_mask: GrayImage::from_pixel(width, height, Luma([0])),
      }),
      _ => Prediction::Detection(boxes),
    })
  }
}

struct MockFactory {
  counters: Counters,
  available: bool,
}

impl PredictorFactory for MockFactory {
  fn create(&self, spec: &EngineSpec) -> Option<Predictor> {
    self.counters.created.set(self.counters.created.get() + 1);
    if !self.available {
      return None;
    }
    Some(Box::new(MockPredictor {
      family: spec.family,
      inferred: self.counters.inferred.clone(),
    }))
  }
}

fn dispatcher(counters: &Counters, available: bool) -> Dispatcher {
  let factory = MockFactory {
    counters: counters.clone(),
    available,
  };
  Dispatcher::new(Box::new(factory), Draw::default())
}

fn scratch_dir(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(format!("shanan-dispatch-{}-{}", name, std::process::id()));
  let _ = std::fs::remove_dir_all(&dir);
  std::fs::create_dir_all(&dir).unwrap();
  dir
}

fn write_png(path: &Path) {
  std::fs::create_dir_all(path.parent().unwrap()).unwrap();
  RgbImage::from_pixel(16, 12, Rgb([40, 80, 120]))
    .save(path)
    .unwrap();
}

fn spec(document: Value) -> TaskSpec {
  document.to_string().parse().unwrap()
}

fn p(path: &Path) -> String {
  path.to_string_lossy().into_owned()
}

fn files_in(dir: &Path) -> Vec<PathBuf> {
  let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
    .map(|entries| entries.map(|e| e.unwrap().path()).collect())
    .unwrap_or_default();
  files.sort();
  files
}

#[test]
fn segmentation_single_inference_writes_exactly_one_file() {
  let dir = scratch_dir("single");
  let input = dir.join("in").join("road.png");
  write_png(&input);
  let output = dir.join("out").join("overlay.jpg");

  let counters = Counters::default();
  let summary = dispatcher(&counters, true)
    .run(&spec(json!({
      "tasks": [{
        "task": "seg",
        "subtasks": [{
          "type": "single_inference",
          "engine_file": "ppseg.rknn",
          "gpuid": 0,
          "input_img": p(&input),
          "output_img_path": p(&output),
        }]
      }]
    })))
    .unwrap();

  assert_eq!(
    summary,
    RunSummary {
      completed: 1,
      skipped: 0,
      failed: 0
    }
  );
  assert_eq!(counters.created.get(), 1);
  assert_eq!(counters.inferred.get(), 1);
  assert_eq!(files_in(&dir.join("out")), vec![output.clone()]);
  let saved = image::open(&output).unwrap();
  assert_eq!((saved.width(), saved.height()), (16, 12));

  let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn unknown_tags_are_skipped_and_later_subtasks_still_run() {
  let dir = scratch_dir("unknown");
  let input = dir.join("a.png");
  write_png(&input);
  let output = dir.join("out.jpg");

  let counters = Counters::default();
  let summary = dispatcher(&counters, true)
    .run(&spec(json!({
      "tasks": [
        { "task": "classify", "subtasks": [] },
        {
          "task": "yolo",
          "subtasks": [
            { "type": "train", "yolo_type": "v5" },
            {
              "type": "single_inference",
              "yolo_type": "v5",
              "engine_file": "yolov5.rknn",
              "gpuid": 0,
              "input_img": p(&input),
              "output_img_path": p(&output),
            }
          ]
        }
      ]
    })))
    .unwrap();

  assert_eq!(summary.skipped, 2);
  assert_eq!(summary.completed, 1);
  assert_eq!(summary.failed, 0);
  assert!(output.is_file());

  let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn empty_input_directory_never_creates_a_predictor() {
  let dir = scratch_dir("empty");
  let input = dir.join("images");
  std::fs::create_dir_all(&input).unwrap();
  std::fs::write(input.join("notes.txt"), b"not an image").unwrap();
  std::fs::write(input.join("broken.jpg"), b"not a jpeg either").unwrap();

  let counters = Counters::default();
  let summary = dispatcher(&counters, true)
    .run(&spec(json!({
      "tasks": [{
        "task": "seg",
        "subtasks": [
          { "type": "performance", "engine_file": "ppseg.rknn", "gpuid": 0, "input_dir": p(&input) },
          { "type": "batch_inference", "engine_file": "ppseg.rknn", "gpuid": 0,
            "input_dir": p(&dir.join("missing")), "output_dir": p(&dir.join("out")) }
        ]
      }]
    })))
    .unwrap();

  assert_eq!(summary.skipped, 2);
  assert_eq!(counters.created.get(), 0);
  assert_eq!(counters.inferred.get(), 0);

  let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn performance_runs_warmup_plus_trials_and_writes_report() {
  let dir = scratch_dir("performance");
  write_png(&dir.join("images").join("0.png"));
  write_png(&dir.join("images").join("1.png"));
  let report = dir.join("reports").join("seg.json");

  let counters = Counters::default();
  let summary = dispatcher(&counters, true)
    .run(&spec(json!({
      "tasks": [{
        "task": "segmentation",
        "subtasks": [{
          "type": "performance",
          "engine_file": "ppseg.rknn",
          "gpuid": 1,
          "input_dir": p(&dir.join("images")),
          "batch_size": 4,
          "warmup": 2,
          "trials": 3,
          "report_file": p(&report),
        }]
      }]
    })))
    .unwrap();

  assert_eq!(summary.completed, 1);
  assert_eq!(counters.created.get(), 1);
  assert_eq!(counters.inferred.get(), 5);

  let value: Value = serde_json::from_str(&std::fs::read_to_string(&report).unwrap()).unwrap();
  assert_eq!(value["batch_size"], 4);
  assert_eq!(value["trials"], 3);
  assert_eq!(value["device_id"], 1);
  assert_eq!(value["family"], "segmentation");

  let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn panoptic_batch_inference_writes_three_artifacts_per_image() {
  let dir = scratch_dir("panoptic");
  write_png(&dir.join("in").join("f1.png"));
  write_png(&dir.join("in").join("f2.png"));
  let out = dir.join("out");

  let counters = Counters::default();
  let summary = dispatcher(&counters, true)
    .run(&spec(json!({
      "tasks": [{
        "task": "yolop",
        "subtasks": [{
          "type": "batch_inference",
          "engine_file": "yolop.rknn",
          "gpuid": 0,
          "input_dir": p(&dir.join("in")),
          "output_dir": p(&out),
        }]
      }]
    })))
    .unwrap();

  assert_eq!(summary.completed, 1);
  assert_eq!(counters.inferred.get(), 2);
  let names: Vec<String> = files_in(&out)
    .iter()
    .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
    .collect();
  assert_eq!(
    names,
    vec![
      "drive_f1.jpg",
      "drive_f2.jpg",
      "f1.jpg",
      "f2.jpg",
      "lane_f1.jpg",
      "lane_f2.jpg"
    ]
  );

  let _ = std::fs::remove_dir_all(&dir);
}

fn names_in(dir: &Path) -> Vec<String> {
  files_in(dir)
    .iter()
    .filter(|path| path.is_file())
    .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
    .collect()
}

#[test]
fn same_named_images_in_sibling_directories_all_survive() {
  let dir = scratch_dir("siblings");
  let input = dir.join("in");
  write_png(&input.join("a").join("x.png"));
  write_png(&input.join("b").join("x.png"));
  write_png(&input.join("x.jpg"));
  write_png(&input.join("x.png"));
  let out = dir.join("out");

  let counters = Counters::default();
  let summary = dispatcher(&counters, true)
    .run(&spec(json!({
      "tasks": [{
        "task": "seg",
        "subtasks": [{
          "type": "batch_inference",
          "engine_file": "ppseg.rknn",
          "gpuid": 0,
          "input_dir": p(&input),
          "output_dir": p(&out),
        }]
      }]
    })))
    .unwrap();

  assert_eq!(
    summary,
    RunSummary {
      completed: 1,
      skipped: 0,
      failed: 0
    }
  );
  assert_eq!(counters.inferred.get(), 4);
  assert_eq!(names_in(&out.join("a")), vec!["x.jpg"]);
  assert_eq!(names_in(&out.join("b")), vec!["x.jpg"]);
  assert_eq!(names_in(&out), vec!["x.jpg", "x_1.jpg"]);

  let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn unknown_variant_aborts_the_run() {
  let counters = Counters::default();
  let result = dispatcher(&counters, true).run(&spec(json!({
    "tasks": [{
      "task": "yolo",
      "subtasks": [
        { "type": "performance", "yolo_type": "v99", "engine_file": "y.rknn", "gpuid": 0, "input_dir": "." },
        { "type": "performance", "yolo_type": "v5", "engine_file": "y.rknn", "gpuid": 0, "input_dir": "." }
      ]
    }]
  })));

  match result {
    Err(DispatchError::Fatal(SubtaskError::UnknownVariant { tag, .. })) => assert_eq!(tag, "v99"),
    other => panic!("unexpected result: {:?}", other),
  }
  assert_eq!(counters.created.get(), 0);
}

#[test]
fn field_and_resource_errors_only_fail_their_subtask() {
  let dir = scratch_dir("recoverable");
  let input = dir.join("a.png");
  write_png(&input);

  let counters = Counters::default();
  let summary = dispatcher(&counters, false)
    .run(&spec(json!({
      "tasks": [
        {
          "task": "yolo",
          "subtasks": [
            // 缺少 yolo_type
            { "type": "single_inference", "engine_file": "y.rknn", "gpuid": 0 },
            // gpuid 类型错误
            { "type": "single_inference", "yolo_type": "v8", "engine_file": "y.rknn", "gpuid": "0" },
            // 引擎无法加载
            { "type": "single_inference", "yolo_type": "v8", "engine_file": "y.rknn", "gpuid": 0,
              "input_img": p(&input), "output_img_path": p(&dir.join("o.jpg")) }
          ]
        },
        {
          "task": "track",
          "subtasks": [
            { "type": "track_video", "yolo_type": "v5", "engine_file": "y.rknn", "gpuid": 0,
              "video_file": "in.mp4", "output_save_path": "out.mp4" }
          ]
        }
      ]
    })))
    .unwrap();

  assert_eq!(
    summary,
    RunSummary {
      completed: 0,
      skipped: 0,
      failed: 4
    }
  );
  assert_eq!(counters.created.get(), 1);
  assert!(!dir.join("o.jpg").exists());

  let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn stop_flag_interrupts_before_the_next_subtask() {
  let counters = Counters::default();
  let stop = StopFlag::new();
  stop.stop();
  let result = dispatcher(&counters, true)
    .with_stop_flag(Some(stop))
    .run(&spec(json!({
      "tasks": [{
        "task": "seg",
        "subtasks": [{ "type": "performance", "engine_file": "s.rknn", "gpuid": 0, "input_dir": "." }]
      }]
    })));
  assert!(matches!(result, Err(DispatchError::Interrupted)));
  assert_eq!(counters.created.get(), 0);
}
