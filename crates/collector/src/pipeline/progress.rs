//! Per-image progress ticks.
//!
//! Each image advances a 10-step counter; a tick is published at every stage
//! boundary so observers can draw a fine-grained bar.

use crate::bus::{title_topic, ProgressBus};
use crate::events::BusEvent;
use std::path::PathBuf;
use std::sync::Arc;

/// Steps per image.
pub const TOTAL_STEPS: u32 = 10;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Detect,
    Ocr,
    Inpaint,
    Translate,
    Render,
    Export,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Detect,
        Stage::Ocr,
        Stage::Inpaint,
        Stage::Translate,
        Stage::Render,
        Stage::Export,
    ];

    /// Counter value once this stage has finished.
    pub fn step(self) -> u32 {
        match self {
            Stage::Detect => 2,
            Stage::Ocr => 4,
            Stage::Inpaint => 5,
            Stage::Translate => 7,
            Stage::Render => 9,
            Stage::Export => TOTAL_STEPS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Detect => "detect",
            Stage::Ocr => "ocr",
            Stage::Inpaint => "inpaint",
            Stage::Translate => "translate",
            Stage::Render => "render",
            Stage::Export => "export",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Publishes pipeline events for one chapter on its title topic.
#[derive(Clone)]
pub struct ProgressReporter {
    bus: Arc<ProgressBus>,
    topic: String,
    title_id: String,
    chapter_index: u32,
}

impl ProgressReporter {
    pub fn new(bus: Arc<ProgressBus>, title_id: &str, chapter_index: u32) -> Self {
        Self {
            bus,
            topic: title_topic(title_id),
            title_id: title_id.to_string(),
            chapter_index,
        }
    }

    fn tick(&self, image_index: usize, step: u32, new_stage: bool) {
        self.bus.publish(
            &self.topic,
            BusEvent::ImageProgress {
                title_id: self.title_id.clone(),
                chapter_index: self.chapter_index,
                image_index,
                step,
                total_steps: TOTAL_STEPS,
                new_stage,
            },
        );
    }

    /// Image `image_index` is about to enter its first stage.
    pub fn image_started(&self, image_index: usize) {
        self.tick(image_index, 0, true);
    }

    pub fn stage_done(&self, image_index: usize, stage: Stage) {
        self.tick(image_index, stage.step(), false);
    }

    pub fn skipped(&self, image_index: usize, path: PathBuf, reason: &str) {
        self.bus.publish(
            &self.topic,
            BusEvent::ImageSkipped {
                title_id: self.title_id.clone(),
                chapter_index: self.chapter_index,
                image_index,
                path,
                reason: reason.to_string(),
            },
        );
    }

    pub fn processed(&self, image_index: usize, artifact: PathBuf) {
        self.bus.publish(
            &self.topic,
            BusEvent::ImageProcessed {
                title_id: self.title_id.clone(),
                chapter_index: self.chapter_index,
                image_index,
                artifact,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_increase_to_total() {
        let steps: Vec<u32> = Stage::ALL.iter().map(|s| s.step()).collect();
        assert!(steps.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*steps.last().unwrap(), TOTAL_STEPS);
        assert!(steps[0] > 0);
    }

    #[tokio::test]
    async fn test_reporter_publishes_on_title_topic() {
        let bus = Arc::new(ProgressBus::default());
        let mut rx = bus.subscribe(&title_topic("T1"));
        let reporter = ProgressReporter::new(bus, "T1", 4);

        reporter.image_started(2);
        reporter.stage_done(2, Stage::Ocr);

        assert_eq!(
            rx.recv().await.unwrap(),
            BusEvent::ImageProgress {
                title_id: "T1".into(),
                chapter_index: 4,
                image_index: 2,
                step: 0,
                total_steps: TOTAL_STEPS,
                new_stage: true,
            }
        );
        match rx.recv().await.unwrap() {
            BusEvent::ImageProgress { step, new_stage, .. } => {
                assert_eq!(step, 4);
                assert!(!new_stage);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
