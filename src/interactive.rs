//! Gates manual takeover of the agent's PTY.
//!
//! Modeled on the shutdown-flag pair pattern: a single `Arc<AtomicBool>`
//! shared between the RPC handler (which flips it) and the loop runner
//! (which reads it on every completion check and PTY write), no mutex
//! required since the flag only ever moves in one direction at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Escape byte the RPC layer writes to the PTY when interactive mode is
/// entered, so the agent's own UI returns to its top-level prompt before a
/// human starts typing into it.
pub const WAKE_BYTE: &[u8] = b"\x1b";

#[derive(Clone)]
pub struct InteractiveController {
    interactive_mode: Arc<AtomicBool>,
}

impl InteractiveController {
    pub fn new() -> Self {
        Self {
            interactive_mode: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Enter or leave interactive mode, returning the new effective mode.
    /// `completionSuppressed` is derived directly from this flag (per the
    /// spec's "derived: equal to interactiveMode"), not latched
    /// separately, so leaving interactive mode immediately resumes
    /// completion detection.
    pub fn set_mode(&self, interactive: bool) -> bool {
        self.interactive_mode.store(interactive, Ordering::SeqCst);
        log::info!(
            "interactive mode {}",
            if interactive { "enabled" } else { "disabled" }
        );
        interactive
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive_mode.load(Ordering::SeqCst)
    }

    /// Whether the loop runner should skip completion detection this tick.
    pub fn should_suppress_completion(&self) -> bool {
        self.is_interactive()
    }

    /// Bytes to forward into the PTY's write end when the RPC `write_pty`
    /// method is called; only accepted while interactive mode is active.
    pub fn forward_input<'a>(&self, bytes: &'a [u8]) -> Option<&'a [u8]> {
        if self.is_interactive() {
            Some(bytes)
        } else {
            None
        }
    }
}

impl Default for InteractiveController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entering_interactive_suppresses_completion() {
        let controller = InteractiveController::new();
        assert!(!controller.should_suppress_completion());

        controller.set_mode(true);
        assert!(controller.is_interactive());
        assert!(controller.should_suppress_completion());
    }

    #[test]
    fn forward_input_rejected_outside_interactive_mode() {
        let controller = InteractiveController::new();
        assert!(controller.forward_input(b"hello").is_none());

        controller.set_mode(true);
        assert_eq!(controller.forward_input(b"hello"), Some(b"hello".as_ref()));
    }

    #[test]
    fn leaving_interactive_mode_immediately_resumes_completion_detection() {
        let controller = InteractiveController::new();
        controller.set_mode(true);
        assert!(controller.should_suppress_completion());

        controller.set_mode(false);
        assert!(!controller.should_suppress_completion());
    }

    #[test]
    fn clone_shares_underlying_state() {
        let controller = InteractiveController::new();
        let clone = controller.clone();
        controller.set_mode(true);
        assert!(clone.is_interactive());
    }
}
