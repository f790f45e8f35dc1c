use tracing::warn;

use pandar_types::PolarPoint;

use crate::{ForegroundExtractor, FrameMetrics, FrameResult};

/// How per-extractor masks combine into the output mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// The mask of the extractor named `primary_name`, else the first.
    Primary,
    /// Bitwise OR of all masks.
    Union,
    /// Bitwise AND of all masks.
    Intersection,
    /// Bit set iff a strict majority of extractors set it.
    Majority,
}

/// One merged frame plus everything needed to compare the constituents.
#[derive(Debug, Clone)]
pub struct HybridFrame {
    pub merged: Vec<bool>,
    pub per_extractor: Vec<FrameResult>,
    /// Fraction of identical bits between the first two extractors, for
    /// migration monitoring. `None` with fewer than two extractors.
    pub agreement_01: Option<f32>,
}

/// Runs an ordered list of extractors over each frame and merges their
/// masks. A failing extractor contributes an all-background mask and does
/// not abort the frame.
pub struct HybridExtractor {
    extractors: Vec<Box<dyn ForegroundExtractor>>,
    merge_mode: MergeMode,
    primary_name: Option<String>,
}

impl HybridExtractor {
    pub fn new(
        extractors: Vec<Box<dyn ForegroundExtractor>>,
        merge_mode: MergeMode,
        primary_name: Option<String>,
    ) -> Self {
        assert!(!extractors.is_empty());
        Self {
            extractors,
            merge_mode,
            primary_name,
        }
    }

    pub fn process_hybrid(&mut self, points: &[PolarPoint], now_ns: i64) -> HybridFrame {
        let n = points.len();
        let mut per_extractor = Vec::with_capacity(self.extractors.len());
        for extractor in self.extractors.iter_mut() {
            let mut result = extractor.process_frame(points, now_ns);
            if result.error.is_some() || result.mask.len() != n {
                if result.error.is_none() {
                    result.error = Some(format!(
                        "mask length {} does not match {} points",
                        result.mask.len(),
                        n
                    ));
                }
                warn!(
                    "extractor {} failed: {}",
                    result.algorithm,
                    result.error.as_deref().unwrap_or("unknown")
                );
                result.mask = vec![false; n];
            }
            per_extractor.push(result);
        }

        let merged = self.merge(&per_extractor, n);
        let agreement_01 = if per_extractor.len() >= 2 {
            Some(agreement(&per_extractor[0].mask, &per_extractor[1].mask))
        } else {
            None
        };

        HybridFrame {
            merged,
            per_extractor,
            agreement_01,
        }
    }

    fn merge(&self, results: &[FrameResult], n: usize) -> Vec<bool> {
        match self.merge_mode {
            MergeMode::Primary => {
                let primary = self
                    .primary_name
                    .as_deref()
                    .and_then(|name| results.iter().find(|r| r.algorithm == name))
                    .unwrap_or(&results[0]);
                primary.mask.clone()
            }
            MergeMode::Union => {
                let mut mask = vec![false; n];
                for r in results {
                    for (m, &b) in mask.iter_mut().zip(r.mask.iter()) {
                        *m |= b;
                    }
                }
                mask
            }
            MergeMode::Intersection => {
                let mut mask = vec![true; n];
                for r in results {
                    for (m, &b) in mask.iter_mut().zip(r.mask.iter()) {
                        *m &= b;
                    }
                }
                mask
            }
            MergeMode::Majority => {
                let quorum = self.extractors.len() / 2 + 1;
                (0..n)
                    .map(|i| results.iter().filter(|r| r.mask[i]).count() >= quorum)
                    .collect()
            }
        }
    }
}

fn agreement(a: &[bool], b: &[bool]) -> f32 {
    if a.is_empty() {
        return 1.0;
    }
    let same = a.iter().zip(b.iter()).filter(|(x, y)| x == y).count();
    same as f32 / a.len() as f32
}

impl ForegroundExtractor for HybridExtractor {
    fn name(&self) -> &str {
        "hybrid"
    }

    fn process_frame(&mut self, points: &[PolarPoint], now_ns: i64) -> FrameResult {
        let frame = self.process_hybrid(points, now_ns);
        let foreground_count = frame.merged.iter().filter(|&&b| b).count();
        let metrics = FrameMetrics {
            foreground_count,
            background_count: points.len() - foreground_count,
            ..Default::default()
        };
        FrameResult {
            algorithm: "hybrid".to_string(),
            mask: frame.merged,
            metrics,
            error: None,
        }
    }

    fn reset(&mut self) {
        for extractor in self.extractors.iter_mut() {
            extractor.reset();
        }
    }
}
