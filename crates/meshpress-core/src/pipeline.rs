//! Pipeline scheduler
//!
//! Runs the enabled steps in a fixed order over one in-memory document:
//!
//! `repair-input, clean, merge, simplify, quantize, draco, texture,
//! repair-output`
//!
//! The two repair phases always run. Each step is timed, reports structured
//! statistics, and emits progress events. The first failing step stops the
//! run: later steps do not execute and no output file is written. A
//! cancellation token and an optional deadline are honored between steps.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::{
    clean, draco, glb, merge, quantize, sanitize, simplify, texture, CleanOptions, CleanStats,
    DracoOptions, DracoStats, GeometryFixResult, MergeOptions, MergeStats, OptimizeError,
    QuantizeOptions, QuantizeStats, Result, SimplifyOptions, SimplifyStats, TextureMode,
    TextureOptions, TextureStats,
};

/// The fixed step order. Repair phases are unconditional.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    RepairInput,
    Clean,
    Merge,
    Simplify,
    Quantize,
    Draco,
    Texture,
    RepairOutput,
}

impl Step {
    pub const ORDER: [Step; 8] = [
        Step::RepairInput,
        Step::Clean,
        Step::Merge,
        Step::Simplify,
        Step::Quantize,
        Step::Draco,
        Step::Texture,
        Step::RepairOutput,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Step::RepairInput => "repair-input",
            Step::Clean => "clean",
            Step::Merge => "merge",
            Step::Simplify => "simplify",
            Step::Quantize => "quantize",
            Step::Draco => "draco",
            Step::Texture => "texture",
            Step::RepairOutput => "repair-output",
        }
    }
}

/// Full configuration object, one group per step.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptimizeOptions {
    pub clean: CleanOptions,
    pub merge: MergeOptions,
    pub simplify: SimplifyOptions,
    pub quantize: QuantizeOptions,
    pub draco: DracoOptions,
    pub texture: TextureOptions,
}

/// Convenience presets composing the per-step options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Preset {
    Fast,
    Balanced,
    Maximum,
}

impl Preset {
    pub fn from_name(name: &str) -> Option<Preset> {
        match name {
            "fast" => Some(Preset::Fast),
            "balanced" => Some(Preset::Balanced),
            "maximum" => Some(Preset::Maximum),
            _ => None,
        }
    }
}

impl OptimizeOptions {
    /// Parse the service configuration object.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| OptimizeError::InvalidOptions {
            field: "options",
            expected: "a valid configuration object",
            received: e.to_string(),
        })
    }

    pub fn preset(preset: Preset) -> Self {
        let mut options = OptimizeOptions::default();
        options.clean.enabled = true;
        match preset {
            Preset::Fast => {
                options.draco.enabled = true;
                options.draco.compression_level = 3;
            }
            Preset::Balanced => {
                options.merge.enabled = true;
                options.simplify.enabled = true;
                options.simplify.target_ratio = Some(0.75);
                options.draco.enabled = true;
                options.draco.compression_level = 7;
                options.texture.enabled = true;
                options.texture.mode = TextureMode::Etc1s;
                options.texture.quality = Some(128);
            }
            Preset::Maximum => {
                options.merge.enabled = true;
                options.simplify.enabled = true;
                options.simplify.target_ratio = Some(0.5);
                options.simplify.error = 0.02;
                options.draco.enabled = true;
                options.draco.compression_level = 10;
                options.texture.enabled = true;
                options.texture.mode = TextureMode::Etc1s;
                options.texture.quality = Some(80);
            }
        }
        options
    }

    fn step_enabled(&self, step: Step) -> bool {
        match step {
            Step::RepairInput | Step::RepairOutput => true,
            Step::Clean => self.clean.enabled,
            Step::Merge => self.merge.enabled,
            Step::Simplify => self.simplify.enabled,
            Step::Quantize => self.quantize.enabled,
            Step::Draco => self.draco.enabled,
            Step::Texture => self.texture.enabled,
        }
    }

    /// Steps selected for execution, in pipeline order.
    pub fn plan(&self) -> Vec<Step> {
        Step::ORDER
            .into_iter()
            .filter(|step| self.step_enabled(*step))
            .collect()
    }
}

/// Structured statistics of one executed step
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum StepStats {
    Repair(GeometryFixResult),
    Clean(CleanStats),
    Merge(MergeStats),
    Simplify(SimplifyStats),
    Quantize(QuantizeStats),
    Draco(DracoStats),
    Texture(TextureStats),
}

/// Outcome of one executed step
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<StepStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Start,
    Done,
    Error,
}

/// One progress event; two per executed step.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub step: String,
    pub status: ProgressStatus,
    pub index: usize,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Shared cancellation flag, checked at step boundaries.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Execution controls: cancellation and an optional total deadline.
#[derive(Clone, Debug, Default)]
pub struct PipelineControl {
    pub cancel: CancelToken,
    pub deadline: Option<Duration>,
}

/// The failure that stopped a run, with the originating error kept intact.
#[derive(Debug)]
pub struct StepFailure {
    pub step: String,
    pub error: OptimizeError,
}

/// Result of one pipeline run. Step results are ordered and include the
/// failing step, so callers can see where a run stopped.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub success: bool,
    pub cancelled: bool,
    pub processing_time_ms: u64,
    pub original_size: u64,
    pub optimized_size: u64,
    pub compression_ratio: f64,
    pub steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub failure: Option<StepFailure>,
}

type ProgressSink<'a> = &'a mut dyn FnMut(&ProgressEvent);

/// Run the pipeline over `input_path`, writing `output_path` on success.
///
/// Errors before the pipeline starts (unreadable or invalid input) are
/// returned as `Err`; step failures and cancellation produce an `Ok` report
/// with `success: false` and the collected step results.
pub fn execute(
    input_path: &Path,
    output_path: &Path,
    options: &OptimizeOptions,
    progress: Option<ProgressSink<'_>>,
) -> Result<PipelineReport> {
    execute_with_control(
        input_path,
        output_path,
        options,
        progress,
        &PipelineControl::default(),
    )
}

pub fn execute_with_control(
    input_path: &Path,
    output_path: &Path,
    options: &OptimizeOptions,
    mut progress: Option<ProgressSink<'_>>,
    control: &PipelineControl,
) -> Result<PipelineReport> {
    let started = Instant::now();
    let mut report = PipelineReport::default();

    let mut doc = glb::read(input_path)?;
    report.original_size = std::fs::metadata(input_path).map(|m| m.len()).unwrap_or(0);
    info!(
        "pipeline: read {} ({} bytes)",
        input_path.display(),
        report.original_size
    );

    let plan = options.plan();
    let total = plan.len();

    for (index, step) in plan.iter().enumerate() {
        if control.cancel.is_cancelled()
            || control
                .deadline
                .map(|d| started.elapsed() >= d)
                .unwrap_or(false)
        {
            report.cancelled = true;
            report.error = Some(OptimizeError::Cancelled.to_string());
            report.failure = Some(StepFailure {
                step: step.name().to_string(),
                error: OptimizeError::Cancelled,
            });
            report.processing_time_ms = started.elapsed().as_millis() as u64;
            info!("pipeline: cancelled before {}", step.name());
            return Ok(report);
        }

        emit(&mut progress, ProgressEvent {
            step: step.name().to_string(),
            status: ProgressStatus::Start,
            index,
            total,
            duration_ms: None,
            error: None,
        });

        let step_started = Instant::now();
        let outcome = run_step(&mut doc, *step, options);
        let duration_ms = step_started.elapsed().as_millis() as u64;

        match outcome {
            Ok(stats) => {
                debug!("pipeline: {} done in {}ms", step.name(), duration_ms);
                report.steps.push(StepResult {
                    step: step.name().to_string(),
                    success: true,
                    duration_ms,
                    stats: Some(stats),
                    error: None,
                });
                emit(&mut progress, ProgressEvent {
                    step: step.name().to_string(),
                    status: ProgressStatus::Done,
                    index,
                    total,
                    duration_ms: Some(duration_ms),
                    error: None,
                });
            }
            Err(error) => {
                let message = error.to_string();
                report.steps.push(StepResult {
                    step: step.name().to_string(),
                    success: false,
                    duration_ms,
                    stats: None,
                    error: Some(message.clone()),
                });
                emit(&mut progress, ProgressEvent {
                    step: step.name().to_string(),
                    status: ProgressStatus::Error,
                    index,
                    total,
                    duration_ms: Some(duration_ms),
                    error: Some(message.clone()),
                });
                report.failed_step = Some(step.name().to_string());
                report.error = Some(message);
                report.failure = Some(StepFailure {
                    step: step.name().to_string(),
                    error,
                });
                report.processing_time_ms = started.elapsed().as_millis() as u64;
                info!("pipeline: {} failed, stopping", step.name());
                return Ok(report);
            }
        }
    }

    match glb::write(output_path, &mut doc) {
        Ok(written) => {
            report.optimized_size = written;
            report.success = true;
        }
        Err(error) => {
            report.failed_step = Some("write".to_string());
            report.error = Some(error.to_string());
            report.failure = Some(StepFailure {
                step: "write".to_string(),
                error,
            });
        }
    }

    report.compression_ratio = if report.original_size == 0 {
        1.0
    } else {
        report.optimized_size as f64 / report.original_size as f64
    };
    report.processing_time_ms = started.elapsed().as_millis() as u64;
    info!(
        "pipeline: finished in {}ms, {} -> {} bytes",
        report.processing_time_ms, report.original_size, report.optimized_size
    );
    Ok(report)
}

fn emit(progress: &mut Option<ProgressSink<'_>>, event: ProgressEvent) {
    if let Some(sink) = progress {
        sink(&event);
    }
}

/// Dispatch one step. Errors other than option validation are folded into
/// the step's failure kind so each step surfaces at most one error kind.
fn run_step(doc: &mut Document, step: Step, options: &OptimizeOptions) -> Result<StepStats> {
    let result = match step {
        Step::RepairInput => sanitize::repair_input(doc).map(StepStats::Repair),
        Step::RepairOutput => sanitize::repair_output(doc).map(StepStats::Repair),
        Step::Clean => clean::clean(doc, &options.clean).map(StepStats::Clean),
        Step::Merge => merge::merge(doc, &options.merge).map(StepStats::Merge),
        Step::Simplify => simplify::simplify(doc, &options.simplify).map(StepStats::Simplify),
        Step::Quantize => quantize::quantize(doc, &options.quantize).map(StepStats::Quantize),
        Step::Draco => draco::compress(doc, &options.draco).map(StepStats::Draco),
        Step::Texture => {
            texture::compress_textures(doc, &options.texture).map(StepStats::Texture)
        }
    };
    result.map_err(|error| {
        if matches!(
            error,
            OptimizeError::InvalidOptions { .. }
                | OptimizeError::OptimizationFailed { .. }
                | OptimizeError::Cancelled
        ) {
            error
        } else {
            OptimizeError::OptimizationFailed {
                step: step.name(),
                message: error.to_string(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Planning ====================

    #[test]
    fn test_plan_always_includes_repair_phases() {
        let options = OptimizeOptions::default();
        let plan = options.plan();
        assert_eq!(plan, vec![Step::RepairInput, Step::RepairOutput]);
    }

    #[test]
    fn test_plan_orders_enabled_steps() {
        let mut options = OptimizeOptions::default();
        options.texture.enabled = true;
        options.clean.enabled = true;
        options.simplify.enabled = true;
        let plan = options.plan();
        assert_eq!(
            plan,
            vec![
                Step::RepairInput,
                Step::Clean,
                Step::Simplify,
                Step::Texture,
                Step::RepairOutput,
            ]
        );
    }

    // ==================== Presets ====================

    #[test]
    fn test_fast_preset() {
        let options = OptimizeOptions::preset(Preset::Fast);
        assert!(options.clean.enabled);
        assert!(options.draco.enabled);
        assert_eq!(options.draco.compression_level, 3);
        assert!(!options.simplify.enabled);
        assert!(!options.texture.enabled);
    }

    #[test]
    fn test_balanced_preset() {
        let options = OptimizeOptions::preset(Preset::Balanced);
        assert!(options.merge.enabled);
        assert_eq!(options.simplify.target_ratio, Some(0.75));
        assert_eq!(options.draco.compression_level, 7);
        assert_eq!(options.texture.quality, Some(128));
    }

    #[test]
    fn test_maximum_preset() {
        let options = OptimizeOptions::preset(Preset::Maximum);
        assert_eq!(options.simplify.target_ratio, Some(0.5));
        assert!((options.simplify.error - 0.02).abs() < 1e-6);
        assert_eq!(options.draco.compression_level, 10);
        assert_eq!(options.texture.quality, Some(80));
    }

    #[test]
    fn test_preset_lookup_by_name() {
        assert_eq!(Preset::from_name("fast"), Some(Preset::Fast));
        assert_eq!(Preset::from_name("balanced"), Some(Preset::Balanced));
        assert_eq!(Preset::from_name("maximum"), Some(Preset::Maximum));
        assert_eq!(Preset::from_name("ultra"), None);
    }

    // ==================== Options parsing ====================

    #[test]
    fn test_options_parse_camel_case() {
        let options = OptimizeOptions::from_json(
            r#"{
                "clean": {"enabled": true, "removeUnusedNodes": false},
                "simplify": {"enabled": true, "targetRatio": 0.5, "lockBorder": true},
                "draco": {"enabled": true, "compressionLevel": 9, "quantizePosition": 16}
            }"#,
        )
        .unwrap();
        assert!(options.clean.enabled);
        assert!(!options.clean.remove_unused_nodes);
        assert!(options.clean.remove_unused_materials);
        assert_eq!(options.simplify.target_ratio, Some(0.5));
        assert!(options.simplify.lock_border);
        assert_eq!(options.draco.compression_level, 9);
        assert_eq!(options.draco.quantize_position, 16);
    }

    #[test]
    fn test_options_parse_rejects_unknown_texture_mode() {
        let err = OptimizeOptions::from_json(r#"{"texture": {"enabled": true, "mode": "ASTC"}}"#)
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidOptions");
    }

    #[test]
    fn test_options_parse_rejects_fractional_target_count() {
        let err = OptimizeOptions::from_json(
            r#"{"simplify": {"enabled": true, "targetCount": 10.5}}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "InvalidOptions");
    }

    #[test]
    fn test_empty_options_object_is_default() {
        let options = OptimizeOptions::from_json("{}").unwrap();
        assert!(options.plan().len() == 2);
    }

    // ==================== Cancellation ====================

    #[test]
    fn test_cancel_token_shared_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
