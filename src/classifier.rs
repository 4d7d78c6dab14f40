//! Classifier adapter (spec.md §4.7): buffers the last W samples, runs
//! strided inference through an `InferenceEngine` boundary, and accumulates
//! per-session votes. Never blocks the pipeline past one inference step and
//! degrades to a no-op when no runtime is available.

use crate::error::ClassifierUnavailableReason;
use crate::types::ImuSample;
use std::collections::{HashMap, VecDeque};

pub const WINDOW_SAMPLES: usize = 250;
const CHANNELS: usize = 6;

/// The inference runtime/model-metadata collaborator boundary (spec.md §6).
pub trait InferenceEngine {
    fn invoke(&self, input: &Tensor) -> Result<InferenceOutput, String>;
    fn metadata(&self) -> &ModelMetadata;
}

#[derive(Clone, Debug)]
pub struct ModelMetadata {
    pub labels: Vec<String>,
    pub window_samples: usize,
    pub norm_mean: [f64; CHANNELS],
    pub norm_std: [f64; CHANNELS],
    pub confidence_threshold: f64,
}

/// A [1, W, 6] input tensor built from the ring buffer in insertion order.
#[derive(Clone, Debug)]
pub struct Tensor {
    pub data: Vec<f32>,
    pub shape: (usize, usize, usize),
}

/// Runtime-flexible inference output (spec.md §9 design note): callers
/// never branch on dtype, they just call `to_probabilities`.
#[derive(Clone, Debug)]
pub enum InferenceOutput {
    Float32(Vec<f32>),
    UInt8 {
        data: Vec<u8>,
        scale: f32,
        zero_point: i32,
    },
    Int8 {
        data: Vec<i8>,
        scale: f32,
        zero_point: i32,
    },
}

impl InferenceOutput {
    pub fn to_probabilities(&self) -> Vec<f32> {
        match self {
            InferenceOutput::Float32(v) => v.clone(),
            InferenceOutput::UInt8 { data, scale, zero_point } => data
                .iter()
                .map(|&v| (v as i32 - zero_point) as f32 * scale)
                .collect(),
            InferenceOutput::Int8 { data, scale, zero_point } => data
                .iter()
                .map(|&v| (v as i32 - zero_point) as f32 * scale)
                .collect(),
        }
    }
}

/// No real inference runtime is vendored (out of scope per spec.md §1); this
/// is the only `InferenceEngine` this crate ships, and it always reports
/// `runtime_missing` so the adapter degrades to a no-op.
pub struct UnavailableEngine {
    metadata: ModelMetadata,
}

impl UnavailableEngine {
    pub fn new() -> Self {
        Self {
            metadata: ModelMetadata {
                labels: Vec::new(),
                window_samples: WINDOW_SAMPLES,
                norm_mean: [0.0; CHANNELS],
                norm_std: [1.0; CHANNELS],
                confidence_threshold: 0.6,
            },
        }
    }
}

impl Default for UnavailableEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceEngine for UnavailableEngine {
    fn invoke(&self, _input: &Tensor) -> Result<InferenceOutput, String> {
        Err("runtime_missing".to_string())
    }

    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }
}

pub struct VoteTally {
    summed_confidence: HashMap<String, f64>,
    best_confidence: HashMap<String, f64>,
}

impl VoteTally {
    fn new() -> Self {
        Self {
            summed_confidence: HashMap::new(),
            best_confidence: HashMap::new(),
        }
    }

    pub fn record(&mut self, label: &str, confidence: f64) {
        *self.summed_confidence.entry(label.to_string()).or_insert(0.0) += confidence;
        let best = self.best_confidence.entry(label.to_string()).or_insert(0.0);
        if confidence > *best {
            *best = confidence;
        }
    }

    /// (argmax-by-summed-confidence label, best-confidence-for-that-label).
    pub fn session_prediction(&self) -> Option<(String, f64)> {
        let (label, _) = self
            .summed_confidence
            .iter()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())?;
        let best = *self.best_confidence.get(label).unwrap_or(&0.0);
        Some((label.clone(), best))
    }
}

impl Default for VoteTally {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ClassifierAdapter {
    engine: Box<dyn InferenceEngine + Send + Sync>,
    buffer: VecDeque<ImuSample>,
    sample_counter: u64,
    last_inference_counter: u64,
    stride: usize,
    votes: VoteTally,
    unavailable: Option<ClassifierUnavailableReason>,
}

impl ClassifierAdapter {
    pub fn new(engine: Box<dyn InferenceEngine + Send + Sync>, stride: usize) -> Self {
        Self {
            engine,
            buffer: VecDeque::with_capacity(WINDOW_SAMPLES),
            sample_counter: 0,
            last_inference_counter: 0,
            stride,
            votes: VoteTally::new(),
            unavailable: None,
        }
    }

    pub fn unavailable(&self) -> Option<&ClassifierUnavailableReason> {
        self.unavailable.as_ref()
    }

    pub fn reset_votes(&mut self) {
        self.votes = VoteTally::new();
    }

    pub fn session_prediction(&self) -> Option<(String, f64)> {
        self.votes.session_prediction()
    }

    /// Pushes one sample; runs one inference step if the buffer is full and
    /// the stride has elapsed. Returns the per-tick label/confidence if an
    /// inference ran this tick.
    pub fn on_sample(&mut self, sample: ImuSample) -> Option<(String, f64)> {
        self.buffer.push_back(sample);
        while self.buffer.len() > WINDOW_SAMPLES {
            self.buffer.pop_front();
        }
        self.sample_counter += 1;

        if self.buffer.len() < WINDOW_SAMPLES {
            return None;
        }
        if self.sample_counter - self.last_inference_counter < self.stride as u64 {
            return None;
        }
        self.last_inference_counter = self.sample_counter;

        let metadata = self.engine.metadata().clone();
        let tensor = build_tensor(&self.buffer, &metadata);

        match self.engine.invoke(&tensor) {
            Ok(output) => {
                let probs = output.to_probabilities();
                let (argmax, confidence) = argmax_softmax(&probs);
                let label = if confidence < metadata.confidence_threshold {
                    "unknown".to_string()
                } else {
                    metadata
                        .labels
                        .get(argmax)
                        .cloned()
                        .unwrap_or_else(|| "unknown".to_string())
                };
                if label != "unknown" {
                    self.votes.record(&label, confidence as f64);
                }
                Some((label, confidence as f64))
            }
            Err(detail) => {
                let reason = classify_failure(&detail);
                log::warn!("classifier inference failed: {reason}");
                self.unavailable = Some(reason);
                None
            }
        }
    }
}

fn classify_failure(detail: &str) -> ClassifierUnavailableReason {
    match detail {
        "runtime_missing" => ClassifierUnavailableReason::RuntimeMissing,
        "model_not_found" => ClassifierUnavailableReason::ModelNotFound,
        other => ClassifierUnavailableReason::InitFailed {
            detail: other.to_string(),
        },
    }
}

fn build_tensor(buffer: &VecDeque<ImuSample>, metadata: &ModelMetadata) -> Tensor {
    let mut data = Vec::with_capacity(buffer.len() * CHANNELS);
    for s in buffer {
        let raw = [s.ax, s.ay, s.az, s.gx, s.gy, s.gz];
        for (i, v) in raw.iter().enumerate() {
            let normalized = (v - metadata.norm_mean[i]) / metadata.norm_std[i].max(1e-9);
            data.push(normalized as f32);
        }
    }
    Tensor {
        data,
        shape: (1, buffer.len(), CHANNELS),
    }
}

fn argmax_softmax(logits: &[f32]) -> (usize, f32) {
    if logits.is_empty() {
        return (0, 0.0);
    }
    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();
    let probs: Vec<f32> = exps.iter().map(|&v| v / sum.max(1e-9)).collect();
    let (idx, &confidence) = probs
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
        .unwrap();
    (idx, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_engine_is_a_pure_no_op() {
        let mut adapter = ClassifierAdapter::new(Box::new(UnavailableEngine::new()), 25);
        for i in 0..300 {
            let result = adapter.on_sample(ImuSample::new(i as f64 * 0.02, 0.0, 0.0, 9.81, 0.0, 0.0, 0.0));
            assert!(result.is_none());
        }
        assert!(adapter.unavailable().is_some());
        assert!(adapter.session_prediction().is_none());
    }

    #[test]
    fn session_prediction_argmax_by_summed_confidence() {
        let mut tally = VoteTally::new();
        for (label, conf) in [
            ("A", 0.7), ("A", 0.8), ("B", 0.9), ("A", 0.75), ("B", 0.6),
            ("A", 0.65), ("B", 0.7), ("A", 0.8), ("A", 0.72), ("B", 0.65),
        ] {
            tally.record(label, conf);
        }
        let (label, best) = tally.session_prediction().unwrap();
        assert_eq!(label, "A");
        assert!((best - 0.8).abs() < 1e-9);
    }

    #[test]
    fn dequantization_is_dtype_transparent() {
        let f32_out = InferenceOutput::Float32(vec![0.1, 0.9]);
        let u8_out = InferenceOutput::UInt8 {
            data: vec![10, 20],
            scale: 0.01,
            zero_point: 0,
        };
        assert_eq!(f32_out.to_probabilities().len(), 2);
        assert_eq!(u8_out.to_probabilities().len(), 2);
    }
}
