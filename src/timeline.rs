use tracing::{debug, trace};

use crate::plan::{Pacing, ResolvedPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    /// Present the frame at `output_us` on the encoder's timeline.
    Render { output_us: i64 },
    /// Return the buffer to the decoder without presenting it.
    Skip,
    /// Seek the source to `seek_to_us`, flush the decoder and keep going;
    /// the buffer that triggered it is discarded by the flush.
    Rewind { seek_to_us: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameVerdict {
    pub action: FrameAction,
    /// The decoder side is finished once this frame is handled.
    pub end_of_stream: bool,
    /// The frame lies at or after the end of the trim window.
    pub past_end: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingLoop {
    loop_point_us: i64,
    wrap_to_us: i64,
}

/// Maps decoded source timestamps onto the output timeline: trims to the
/// window, paces to the target rate and stitches an avatar loop so the output
/// stays monotonic across the seam.
#[derive(Debug, Clone)]
pub struct FrameTimeline {
    pacing: Pacing,
    trim_start_us: i64,
    end_us: Option<i64>,
    pending_loop: Option<PendingLoop>,
    reference_us: Option<i64>,
    offset_us: i64,
    last_rendered_source_us: Option<i64>,
    max_output_us: Option<i64>,
}

impl FrameTimeline {
    #[must_use]
    pub fn new(plan: &ResolvedPlan) -> Self {
        let window = plan.window;
        let (trim_start_us, pending_loop) = match plan.loop_point_us {
            Some(loop_point_us) => (
                loop_point_us,
                Some(PendingLoop {
                    loop_point_us,
                    wrap_to_us: window.start_us,
                }),
            ),
            None => (window.start_us, None),
        };
        Self {
            pacing: plan.pacing,
            trim_start_us,
            end_us: window.end_us,
            pending_loop,
            reference_us: None,
            offset_us: 0,
            last_rendered_source_us: None,
            max_output_us: None,
        }
    }

    /// Where the source should be positioned before the first sample is read.
    #[must_use]
    pub fn initial_seek_us(&self) -> i64 {
        self.trim_start_us.max(0)
    }

    #[must_use]
    pub fn is_loop_pending(&self) -> bool {
        self.pending_loop.is_some()
    }

    #[must_use]
    pub fn max_output_us(&self) -> Option<i64> {
        self.max_output_us
    }

    /// Decides what to do with one decoded frame.
    pub fn on_decoded(&mut self, pts: i64, size: usize, end_of_stream: bool) -> FrameVerdict {
        let mut end_of_stream = end_of_stream;
        let mut render = size != 0;
        let past_end = self.end_us.is_some_and(|end| pts >= end);
        if past_end {
            end_of_stream = true;
            render = false;
        }

        if end_of_stream {
            if let Some(pending) = self.pending_loop.take() {
                return self.wrap(pending, past_end);
            }
        }

        if render
            && !end_of_stream
            && self
                .last_rendered_source_us
                .is_some_and(|last| pts - last < self.pacing.min_frame_gap_us)
        {
            trace!(pts, "dropping frame to hold target rate");
            render = false;
        }

        if self.reference_us.is_none() && !past_end {
            if pts < self.trim_start_us {
                trace!(pts, trim_start = self.trim_start_us, "dropping frame before trim start");
                render = false;
            } else {
                let reference = if self.trim_start_us > 0 { pts } else { 0 };
                debug!(reference, offset = self.offset_us, "output timeline anchored");
                self.reference_us = Some(reference);
            }
        }

        let action = match self.reference_us {
            Some(reference) if render => {
                let output_us = pts - reference + self.offset_us;
                self.last_rendered_source_us = Some(pts);
                self.max_output_us = Some(self.max_output_us.map_or(output_us, |m| m.max(output_us)));
                FrameAction::Render { output_us }
            }
            _ => FrameAction::Skip,
        };

        FrameVerdict {
            action,
            end_of_stream,
            past_end,
        }
    }

    fn wrap(&mut self, pending: PendingLoop, past_end: bool) -> FrameVerdict {
        self.offset_us = self
            .max_output_us
            .map_or(0, |max| max + self.pacing.frame_period_us);
        self.end_us = Some(pending.loop_point_us);
        self.trim_start_us = pending.wrap_to_us;
        self.reference_us = None;
        self.last_rendered_source_us = None;
        debug!(
            seek_to = pending.wrap_to_us,
            loop_point = pending.loop_point_us,
            offset = self.offset_us,
            "wrapping avatar loop"
        );
        FrameVerdict {
            action: FrameAction::Rewind {
                seek_to_us: pending.wrap_to_us.max(0),
            },
            end_of_stream: false,
            past_end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::Dimensions;
    use crate::request::{TranscodeRequest, TranscoderConfig};

    const FPS: i64 = 30;

    fn pts(frame: i64) -> i64 {
        frame * 1_000_000 / FPS
    }

    fn plan(start_us: i64, end_us: i64, avatar_start_us: i64) -> ResolvedPlan {
        let mut request = TranscodeRequest::new(
            "in.mp4",
            "out.mp4",
            Dimensions::new(640, 480).unwrap(),
            Dimensions::new(640, 480).unwrap(),
            10_000_000,
        );
        request.frame_rate = 30;
        request.start_us = start_us;
        request.end_us = end_us;
        request.avatar_start_us = avatar_start_us;
        ResolvedPlan::resolve(&request, &TranscoderConfig::default(), false).unwrap()
    }

    #[test]
    fn untrimmed_frames_keep_source_time() {
        let mut timeline = FrameTimeline::new(&plan(0, -1, -1));
        assert_eq!(timeline.initial_seek_us(), 0);
        for frame in 0..10 {
            let verdict = timeline.on_decoded(pts(frame), 100, false);
            assert_eq!(
                verdict.action,
                FrameAction::Render {
                    output_us: pts(frame)
                }
            );
        }
    }

    #[test]
    fn trim_window_rebases_and_stops() {
        let mut timeline = FrameTimeline::new(&plan(2_000_000, 8_000_000, -1));
        assert_eq!(timeline.initial_seek_us(), 2_000_000);

        let mut outputs = Vec::new();
        let mut stopped_at = None;
        for frame in 30..300 {
            let verdict = timeline.on_decoded(pts(frame), 100, false);
            if let FrameAction::Render { output_us } = verdict.action {
                assert!(pts(frame) >= 2_000_000 && pts(frame) < 8_000_000);
                assert!((pts(frame) - 2_000_000 - output_us).abs() <= 33_334);
                outputs.push(output_us);
            }
            if verdict.end_of_stream {
                assert!(verdict.past_end);
                stopped_at = Some(frame);
                break;
            }
        }

        assert_eq!(stopped_at, Some(240));
        assert_eq!(outputs.first(), Some(&0));
        assert!(outputs.last().copied().unwrap() <= 6_000_000);
        assert!(outputs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(outputs.len(), 180);
    }

    #[test]
    fn pacing_drops_jittered_frames_but_not_end_of_stream() {
        let mut timeline = FrameTimeline::new(&plan(0, -1, -1));
        assert!(matches!(
            timeline.on_decoded(0, 10, false).action,
            FrameAction::Render { .. }
        ));
        assert_eq!(timeline.on_decoded(10_000, 10, false).action, FrameAction::Skip);
        assert_eq!(timeline.on_decoded(20_000, 10, false).action, FrameAction::Skip);
        assert!(matches!(
            timeline.on_decoded(40_000, 10, false).action,
            FrameAction::Render { .. }
        ));

        let last = timeline.on_decoded(45_000, 10, true);
        assert!(last.end_of_stream);
        assert_eq!(last.action, FrameAction::Render { output_us: 45_000 });
    }

    #[test]
    fn empty_buffers_are_never_rendered() {
        let mut timeline = FrameTimeline::new(&plan(0, -1, -1));
        let verdict = timeline.on_decoded(0, 0, true);
        assert_eq!(verdict.action, FrameAction::Skip);
        assert!(verdict.end_of_stream);
    }

    #[test]
    fn avatar_loop_stays_monotonic_across_seam() {
        let mut timeline = FrameTimeline::new(&plan(1_000_000, 4_000_000, 3_000_000));
        assert!(timeline.is_loop_pending());
        assert_eq!(timeline.initial_seek_us(), 3_000_000);

        let mut outputs = Vec::new();
        let mut rewound_to = None;
        for frame in 90..200 {
            let verdict = timeline.on_decoded(pts(frame), 100, false);
            match verdict.action {
                FrameAction::Render { output_us } => outputs.push(output_us),
                FrameAction::Rewind { seek_to_us } => {
                    rewound_to = Some(seek_to_us);
                    assert!(!verdict.end_of_stream);
                    break;
                }
                FrameAction::Skip => {}
            }
        }
        assert_eq!(rewound_to, Some(1_000_000));
        let seam = *outputs.last().unwrap();
        assert!(!timeline.is_loop_pending());

        let mut finished = false;
        for frame in 30..200 {
            let verdict = timeline.on_decoded(pts(frame), 100, false);
            if let FrameAction::Render { output_us } = verdict.action {
                assert!(pts(frame) < 3_000_000);
                outputs.push(output_us);
            }
            if verdict.end_of_stream {
                assert_ne!(
                    verdict.action,
                    FrameAction::Rewind { seek_to_us: 1_000_000 }
                );
                finished = true;
                break;
            }
        }
        assert!(finished);

        assert!(outputs.windows(2).all(|w| w[0] < w[1]));
        let after_seam = outputs.iter().copied().find(|o| *o > seam).unwrap();
        assert_eq!(after_seam, seam + 33_000);
    }

    #[test]
    fn loop_wraps_on_source_end_of_stream() {
        let mut timeline = FrameTimeline::new(&plan(0, -1, 2_000_000));
        timeline.on_decoded(pts(60), 100, false);
        let verdict = timeline.on_decoded(pts(61), 0, true);
        assert_eq!(verdict.action, FrameAction::Rewind { seek_to_us: 0 });
        assert!(!verdict.past_end);

        let verdict = timeline.on_decoded(0, 100, false);
        assert_eq!(
            verdict.action,
            FrameAction::Render {
                output_us: 33_000
            }
        );
    }
}
