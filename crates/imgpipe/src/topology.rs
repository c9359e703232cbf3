//! Static wiring of stages through named queues.
//!
//! Stages only know their own input queue, output queue and envelope keys,
//! so adding or dropping a stage is an edit to this table and nothing else.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::envelope::EnvelopeKey;
use crate::error::TopologyError;
use crate::transform::TransformSpec;

pub const DEFAULT_HEAD_QUEUE: &str = "upload_queue";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub input_queue: String,
    /// `None` marks the terminal stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_queue: Option<String>,
    pub source_key: EnvelopeKey,
    pub output_key: EnvelopeKey,
    pub transform: TransformSpec,
    pub output_directory: PathBuf,
    /// Unacknowledged messages a single replica may hold.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: u16,
}

fn default_concurrency_limit() -> u16 {
    1
}

impl StageSpec {
    pub fn new(
        name: impl Into<String>,
        input_queue: impl Into<String>,
        output_queue: Option<String>,
        source_key: EnvelopeKey,
        output_key: EnvelopeKey,
        transform: TransformSpec,
        output_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            input_queue: input_queue.into(),
            output_queue,
            source_key,
            output_key,
            transform,
            output_directory: output_directory.into(),
            concurrency_limit: default_concurrency_limit(),
        }
    }

    pub fn with_concurrency_limit(mut self, limit: u16) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.output_queue.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    /// Queue ingress publishes new envelopes to.
    #[serde(default = "default_head_queue")]
    pub head_queue: String,
    /// Where rejected envelopes are parked. Without one they are dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_queue: Option<String>,
    pub stages: Vec<StageSpec>,
}

fn default_head_queue() -> String {
    DEFAULT_HEAD_QUEUE.to_string()
}

impl Default for Topology {
    fn default() -> Self {
        Self::default_pipeline()
    }
}

impl Topology {
    /// resize -> blur -> watermark.
    pub fn default_pipeline() -> Self {
        Self {
            head_queue: default_head_queue(),
            dead_letter_queue: None,
            stages: vec![
                StageSpec::new(
                    "resize",
                    DEFAULT_HEAD_QUEUE,
                    Some("blur_queue".to_string()),
                    EnvelopeKey::OriginalPath,
                    EnvelopeKey::ResizedPath,
                    TransformSpec::Resize { width: 640 },
                    "resized_images",
                ),
                StageSpec::new(
                    "blur",
                    "blur_queue",
                    Some("watermark_queue".to_string()),
                    EnvelopeKey::CurrentPath,
                    EnvelopeKey::BlurredPath,
                    TransformSpec::Blur { radius: 5.0 },
                    "blurred",
                ),
                StageSpec::new(
                    "watermark",
                    "watermark_queue",
                    None,
                    EnvelopeKey::CurrentPath,
                    EnvelopeKey::WatermarkedPath,
                    TransformSpec::Watermark {
                        text: "SDE Project".to_string(),
                        font: None,
                    },
                    "watermarked_images",
                ),
            ],
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Every queue the pipeline touches: head first, then each stage output,
    /// then the dead-letter queue.
    pub fn queues(&self) -> Vec<String> {
        let mut queues = Vec::new();
        let mut seen = HashSet::new();

        let chain = self
            .ordered()
            .unwrap_or_else(|_| self.stages.iter().collect());
        let candidates = std::iter::once(&self.head_queue)
            .chain(chain.iter().map(|s| &s.input_queue))
            .chain(chain.iter().filter_map(|s| s.output_queue.as_ref()))
            .chain(self.dead_letter_queue.iter());

        for queue in candidates {
            if seen.insert(queue.clone()) {
                queues.push(queue.clone());
            }
        }
        queues
    }

    /// Stages in the order an envelope visits them.
    pub fn ordered(&self) -> Result<Vec<&StageSpec>, TopologyError> {
        let by_input = self.consumers()?;

        let mut order = Vec::with_capacity(self.stages.len());
        let mut visited = HashSet::new();
        let mut queue = Some(self.head_queue.as_str());

        if !by_input.contains_key(self.head_queue.as_str()) {
            return Err(TopologyError::HeadNotConsumed(self.head_queue.clone()));
        }

        while let Some(name) = queue {
            let stage = match by_input.get(name) {
                Some(stage) => *stage,
                None => {
                    // Predecessor published here but nobody listens.
                    let publisher = order
                        .last()
                        .map(|s: &&StageSpec| s.name.clone())
                        .unwrap_or_default();
                    return Err(TopologyError::DanglingOutput {
                        stage: publisher,
                        queue: name.to_string(),
                    });
                }
            };

            if !visited.insert(stage.name.as_str()) {
                return Err(TopologyError::Cycle(stage.name.clone()));
            }

            order.push(stage);
            queue = stage.output_queue.as_deref();
        }

        if let Some(orphan) = self
            .stages
            .iter()
            .find(|s| !visited.contains(s.name.as_str()))
        {
            return Err(TopologyError::Unreachable(orphan.name.clone()));
        }

        Ok(order)
    }

    fn consumers(&self) -> Result<HashMap<&str, &StageSpec>, TopologyError> {
        let mut by_input: HashMap<&str, &StageSpec> = HashMap::new();
        for stage in &self.stages {
            if let Some(existing) = by_input.insert(stage.input_queue.as_str(), stage) {
                return Err(TopologyError::SharedInputQueue {
                    queue: stage.input_queue.clone(),
                    first: existing.name.clone(),
                    second: stage.name.clone(),
                });
            }
        }
        Ok(by_input)
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.stages.is_empty() {
            return Err(TopologyError::Empty);
        }
        if self.head_queue.trim().is_empty() {
            return Err(TopologyError::EmptyHeadQueue);
        }

        let mut names = HashSet::new();
        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(TopologyError::DuplicateStage(stage.name.clone()));
            }
            if !stage.output_key.is_stage_output() {
                return Err(TopologyError::InvalidOutputKey {
                    stage: stage.name.clone(),
                    key: stage.output_key.to_string(),
                });
            }
            if stage.concurrency_limit == 0 {
                return Err(TopologyError::ZeroConcurrency(stage.name.clone()));
            }
        }

        // Walking the chain covers reachability, cycles, dangling outputs
        // and, since the walk ends at the first stage without an output,
        // the single-terminal rule.
        self.ordered()?;

        if let Some(dlq) = &self.dead_letter_queue {
            let collides = *dlq == self.head_queue
                || self.stages.iter().any(|s| {
                    s.input_queue == *dlq || s.output_queue.as_deref() == Some(dlq.as_str())
                });
            if collides {
                return Err(TopologyError::DeadLetterCollision(dlq.clone()));
            }
        }

        Ok(())
    }

    /// Splices `stage` in right after `upstream`.
    ///
    /// The new stage takes over the upstream's old output queue and the
    /// upstream is pointed at the new stage's input queue. The downstream
    /// stage is left exactly as it was.
    pub fn insert_after(&mut self, upstream: &str, mut stage: StageSpec) -> Result<(), TopologyError> {
        let position = self
            .stages
            .iter()
            .position(|s| s.name == upstream)
            .ok_or_else(|| TopologyError::UnknownStage(upstream.to_string()))?;

        let mut edited = self.clone();
        stage.output_queue = edited.stages[position].output_queue.take();
        edited.stages[position].output_queue = Some(stage.input_queue.clone());
        edited.stages.insert(position + 1, stage);

        edited.validate()?;
        *self = edited;
        Ok(())
    }

    /// Unlinks a stage, connecting its predecessor straight to its output.
    pub fn remove(&mut self, name: &str) -> Result<StageSpec, TopologyError> {
        let position = self
            .stages
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| TopologyError::UnknownStage(name.to_string()))?;

        let mut edited = self.clone();
        let removed = edited.stages.remove(position);

        if removed.input_queue == edited.head_queue {
            match &removed.output_queue {
                Some(next) => edited.head_queue = next.clone(),
                None => return Err(TopologyError::Empty),
            }
        } else if let Some(predecessor) = edited
            .stages
            .iter_mut()
            .find(|s| s.output_queue.as_deref() == Some(removed.input_queue.as_str()))
        {
            predecessor.output_queue = removed.output_queue.clone();
        }

        edited.validate()?;
        *self = edited;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blur_stage() -> StageSpec {
        StageSpec::new(
            "blur",
            "blur_queue",
            None,
            EnvelopeKey::CurrentPath,
            EnvelopeKey::BlurredPath,
            TransformSpec::Blur { radius: 5.0 },
            "blurred",
        )
    }

    #[test]
    fn test_default_pipeline_is_valid() {
        let topology = Topology::default_pipeline();
        topology.validate().unwrap();

        let names: Vec<&str> = topology
            .ordered()
            .unwrap()
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["resize", "blur", "watermark"]);
        assert!(topology.stage("watermark").unwrap().is_terminal());
    }

    #[test]
    fn test_queues_in_pipeline_order() {
        let mut topology = Topology::default_pipeline();
        topology.dead_letter_queue = Some("failed_queue".to_string());

        assert_eq!(
            topology.queues(),
            vec!["upload_queue", "blur_queue", "watermark_queue", "failed_queue"]
        );
    }

    #[test]
    fn test_remove_then_insert_blur_leaves_neighbours_alone() {
        let mut topology = Topology::default_pipeline();
        let watermark_before = topology.stage("watermark").unwrap().clone();

        topology.remove("blur").unwrap();
        assert_eq!(
            topology.stage("resize").unwrap().output_queue.as_deref(),
            Some("watermark_queue")
        );
        assert_eq!(topology.stage("watermark").unwrap(), &watermark_before);

        topology.insert_after("resize", blur_stage()).unwrap();
        assert_eq!(
            topology.stage("resize").unwrap().output_queue.as_deref(),
            Some("blur_queue")
        );
        assert_eq!(
            topology.stage("blur").unwrap().output_queue.as_deref(),
            Some("watermark_queue")
        );
        assert_eq!(topology.stage("watermark").unwrap(), &watermark_before);
        assert_eq!(topology, Topology::default_pipeline());
    }

    #[test]
    fn test_remove_head_stage_moves_head_queue() {
        let mut topology = Topology::default_pipeline();
        topology.remove("resize").unwrap();

        assert_eq!(topology.head_queue, "blur_queue");
        topology.validate().unwrap();
    }

    #[test]
    fn test_remove_terminal_makes_predecessor_terminal() {
        let mut topology = Topology::default_pipeline();
        topology.remove("watermark").unwrap();

        assert!(topology.stage("blur").unwrap().is_terminal());
    }

    #[test]
    fn test_failed_edit_leaves_topology_unchanged() {
        let mut topology = Topology::default_pipeline();
        let mut clash = blur_stage();
        clash.name = "blur-two".to_string();
        clash.input_queue = "watermark_queue".to_string();

        let result = topology.insert_after("resize", clash);
        assert!(result.is_err());
        assert_eq!(topology, Topology::default_pipeline());
    }

    #[test]
    fn test_unknown_stage_edit() {
        let mut topology = Topology::default_pipeline();
        assert_eq!(
            topology.remove("sharpen"),
            Err(TopologyError::UnknownStage("sharpen".to_string()))
        );
    }

    #[test]
    fn test_empty_topology_rejected() {
        let topology = Topology {
            head_queue: "q".to_string(),
            dead_letter_queue: None,
            stages: vec![],
        };
        assert_eq!(topology.validate(), Err(TopologyError::Empty));
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let mut topology = Topology::default_pipeline();
        topology.stages[1].name = "resize".to_string();
        assert_eq!(
            topology.validate(),
            Err(TopologyError::DuplicateStage("resize".to_string()))
        );
    }

    #[test]
    fn test_output_key_must_belong_to_a_stage() {
        let mut topology = Topology::default_pipeline();
        topology.stages[0].output_key = EnvelopeKey::OriginalPath;
        assert!(matches!(
            topology.validate(),
            Err(TopologyError::InvalidOutputKey { .. })
        ));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut topology = Topology::default_pipeline();
        topology.stages[2].concurrency_limit = 0;
        assert_eq!(
            topology.validate(),
            Err(TopologyError::ZeroConcurrency("watermark".to_string()))
        );
    }

    #[test]
    fn test_dangling_output_rejected() {
        let mut topology = Topology::default_pipeline();
        topology.stages[2].output_queue = Some("final_queue".to_string());
        assert_eq!(
            topology.validate(),
            Err(TopologyError::DanglingOutput {
                stage: "watermark".to_string(),
                queue: "final_queue".to_string(),
            })
        );
    }

    #[test]
    fn test_cycle_rejected() {
        let mut topology = Topology::default_pipeline();
        topology.stages[2].output_queue = Some("blur_queue".to_string());
        assert_eq!(
            topology.validate(),
            Err(TopologyError::Cycle("blur".to_string()))
        );
    }

    #[test]
    fn test_unreachable_stage_rejected() {
        let mut topology = Topology::default_pipeline();
        topology.stages[0].output_queue = None;
        assert_eq!(
            topology.validate(),
            Err(TopologyError::Unreachable("blur".to_string()))
        );
    }

    #[test]
    fn test_head_must_be_consumed() {
        let mut topology = Topology::default_pipeline();
        topology.head_queue = "inbox".to_string();
        assert_eq!(
            topology.validate(),
            Err(TopologyError::HeadNotConsumed("inbox".to_string()))
        );
    }

    #[test]
    fn test_dead_letter_cannot_be_stage_queue() {
        let mut topology = Topology::default_pipeline();
        topology.dead_letter_queue = Some("blur_queue".to_string());
        assert_eq!(
            topology.validate(),
            Err(TopologyError::DeadLetterCollision("blur_queue".to_string()))
        );
    }

    #[test]
    fn test_topology_json_shape() {
        let json = serde_json::json!({
            "head_queue": "in",
            "stages": [{
                "name": "resize",
                "input_queue": "in",
                "source_key": "original_path",
                "output_key": "resized_path",
                "transform": {"kind": "resize", "width": 320},
                "output_directory": "out"
            }]
        });
        let topology: Topology = serde_json::from_value(json).unwrap();

        topology.validate().unwrap();
        let stage = &topology.stages[0];
        assert_eq!(stage.concurrency_limit, 1);
        assert!(stage.is_terminal());
        assert_eq!(stage.transform, TransformSpec::Resize { width: 320 });
    }
}
