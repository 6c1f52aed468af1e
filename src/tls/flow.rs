//! Watermark hysteresis for flow control.

/// A notification produced by a watermark edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FlowEvent {
    Pause,
    Resume,
}

/// One pause/resume watermark pair.
///
/// The rule is identical in every direction it is used: when the
/// buffered byte count reaches the high watermark and the pair is not
/// already paused, pause and notify once; when it drains to the low
/// watermark while paused, resume and notify once. No notification is
/// ever repeated while already in the corresponding state.
pub(crate) struct FlowControl {
    high: usize,
    low: usize,
    paused: bool,
}

impl FlowControl {
    pub(crate) fn new(high: usize, low: usize) -> Self {
        debug_assert!(low <= high, "low watermark must not exceed high");
        Self {
            high,
            low,
            paused: false,
        }
    }

    /// Record the current buffered byte count, yielding at most one
    /// edge notification.
    pub(crate) fn record(&mut self, buffered: usize) -> Option<FlowEvent> {
        if !self.paused && buffered >= self.high {
            self.paused = true;
            Some(FlowEvent::Pause)
        } else if self.paused && buffered <= self.low {
            self.paused = false;
            Some(FlowEvent::Resume)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_fires_once_at_high_watermark() {
        let mut flow = FlowControl::new(100, 50);

        assert_eq!(flow.record(150), Some(FlowEvent::Pause));
        assert_eq!(flow.record(160), None);
        assert_eq!(flow.record(100), None);
    }

    #[test]
    fn resume_fires_once_at_low_watermark() {
        let mut flow = FlowControl::new(100, 50);

        assert_eq!(flow.record(150), Some(FlowEvent::Pause));
        assert_eq!(flow.record(40), Some(FlowEvent::Resume));
        assert_eq!(flow.record(10), None);
        // A second climb produces a fresh pause.
        assert_eq!(flow.record(120), Some(FlowEvent::Pause));
    }

    #[test]
    fn no_resume_without_prior_pause() {
        let mut flow = FlowControl::new(100, 50);

        assert_eq!(flow.record(10), None);
        assert_eq!(flow.record(0), None);
    }

    #[test]
    fn between_watermarks_holds_current_state() {
        let mut flow = FlowControl::new(100, 50);

        assert_eq!(flow.record(75), None);
        assert_eq!(flow.record(100), Some(FlowEvent::Pause));
        // Between low and high while paused: stays paused.
        assert_eq!(flow.record(75), None);
        assert_eq!(flow.record(50), Some(FlowEvent::Resume));
    }
}
