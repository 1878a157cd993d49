//! Per-task stream reassembly.
//!
//! One logical chat message per task: tokens append in sequence-number
//! order, late or duplicate tokens are dropped, edits are throttled to
//! respect platform rate limits, and either a `done=true` token or an
//! `OutgoingReply` finalizes. A transport gap poisons the stream.

use std::time::{Duration, Instant};

/// Minimum spacing between message edits.
pub const MIN_EDIT_INTERVAL: Duration = Duration::from_millis(250);

/// Suffix rendered when the model stream broke mid-reply.
pub const INTERRUPTED_SUFFIX: &str = " (connection interrupted)";

/// What the adapter should do after feeding one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamAction {
    /// Nothing visible changes yet.
    None,
    /// Render the current text (send or edit the live message).
    Render(String),
    /// Render the final text and drop the stream state.
    Finalize(String),
    /// Transport loss; render a failure note and drop the stream state.
    Fail,
}

pub struct StreamAssembler {
    text: String,
    last_seq: u64,
    finalized: bool,
    interrupted: bool,
    last_render: Option<Instant>,
    min_edit_interval: Duration,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::with_interval(MIN_EDIT_INTERVAL)
    }

    pub fn with_interval(min_edit_interval: Duration) -> Self {
        Self {
            text: String::new(),
            last_seq: 0,
            finalized: false,
            interrupted: false,
            last_render: None,
            min_edit_interval,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Feed one stream token.
    pub fn feed_token(
        &mut self,
        seq: u64,
        token: &str,
        done: bool,
        interrupted: bool,
        now: Instant,
    ) -> StreamAction {
        if self.finalized {
            return StreamAction::None;
        }
        // Sequence-number order, not arrival order: late tokens drop.
        if seq <= self.last_seq {
            return StreamAction::None;
        }
        self.last_seq = seq;
        self.text.push_str(token);
        if done {
            self.finalized = true;
            if interrupted {
                self.interrupted = true;
                self.text.push_str(INTERRUPTED_SUFFIX);
            }
            return StreamAction::Finalize(self.text.clone());
        }
        let due = match self.last_render {
            None => true,
            Some(prev) => now.duration_since(prev) >= self.min_edit_interval,
        };
        if due && !self.text.is_empty() {
            self.last_render = Some(now);
            StreamAction::Render(self.text.clone())
        } else {
            StreamAction::None
        }
    }

    /// Feed the final reply for the task. Acts as a final sync when the
    /// stream already finalized: the reply text wins, but a second
    /// finalize of identical text is a no-op. An interruption suffix
    /// added by the stream survives the sync.
    pub fn feed_reply(&mut self, text: &str) -> StreamAction {
        let text = if self.interrupted && !text.ends_with(INTERRUPTED_SUFFIX) {
            format!("{text}{INTERRUPTED_SUFFIX}")
        } else {
            text.to_string()
        };
        if self.finalized && self.text == text {
            return StreamAction::None;
        }
        self.finalized = true;
        self.text = text;
        StreamAction::Finalize(self.text.clone())
    }

    /// The transport reported lost envelopes under this task.
    pub fn transport_gap(&mut self) -> StreamAction {
        if self.finalized {
            return StreamAction::None;
        }
        self.finalized = true;
        StreamAction::Fail
    }
}

impl Default for StreamAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> Instant {
        Instant::now()
    }

    #[test]
    fn tokens_assemble_in_order() {
        let mut asm = StreamAssembler::with_interval(Duration::ZERO);
        assert_eq!(
            asm.feed_token(1, "he", false, false, t0()),
            StreamAction::Render("he".into())
        );
        assert_eq!(
            asm.feed_token(2, "llo", false, false, t0()),
            StreamAction::Render("hello".into())
        );
        assert_eq!(
            asm.feed_token(3, "", true, false, t0()),
            StreamAction::Finalize("hello".into())
        );
    }

    #[test]
    fn late_tokens_dropped() {
        let mut asm = StreamAssembler::with_interval(Duration::ZERO);
        asm.feed_token(2, "b", false, false, t0());
        assert_eq!(asm.feed_token(1, "a", false, false, t0()), StreamAction::None);
        assert_eq!(asm.text(), "b");
    }

    #[test]
    fn duplicate_seq_dropped() {
        let mut asm = StreamAssembler::with_interval(Duration::ZERO);
        asm.feed_token(1, "a", false, false, t0());
        assert_eq!(asm.feed_token(1, "a", false, false, t0()), StreamAction::None);
        assert_eq!(asm.text(), "a");
    }

    #[test]
    fn edits_are_throttled() {
        let mut asm = StreamAssembler::with_interval(Duration::from_secs(3600));
        let now = t0();
        assert!(matches!(
            asm.feed_token(1, "a", false, false, now),
            StreamAction::Render(_)
        ));
        // Within the interval: text accumulates silently.
        assert_eq!(asm.feed_token(2, "b", false, false, now), StreamAction::None);
        assert_eq!(asm.text(), "ab");
    }

    #[test]
    fn reply_after_done_is_idempotent_final_sync() {
        let mut asm = StreamAssembler::with_interval(Duration::ZERO);
        asm.feed_token(1, "hi", false, false, t0());
        assert_eq!(
            asm.feed_token(2, "", true, false, t0()),
            StreamAction::Finalize("hi".into())
        );
        // Same text arrives as OutgoingReply: nothing to do.
        assert_eq!(asm.feed_reply("hi"), StreamAction::None);
        // Different text still wins as the final sync.
        assert_eq!(asm.feed_reply("hi!"), StreamAction::Finalize("hi!".into()));
    }

    #[test]
    fn interruption_appends_suffix() {
        let mut asm = StreamAssembler::with_interval(Duration::ZERO);
        asm.feed_token(1, "par", false, false, t0());
        match asm.feed_token(2, "", true, true, t0()) {
            StreamAction::Finalize(text) => {
                assert_eq!(text, format!("par{INTERRUPTED_SUFFIX}"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn gap_poisons_stream() {
        let mut asm = StreamAssembler::with_interval(Duration::ZERO);
        asm.feed_token(1, "a", false, false, t0());
        assert_eq!(asm.transport_gap(), StreamAction::Fail);
        assert_eq!(asm.feed_token(2, "b", false, false, t0()), StreamAction::None);
    }
}
