//! Notification Reassembler
//!
//! Rebuilds complete frames from the fragment stream of the notify
//! characteristic. The only boundary signal is the frame marker at offset 0
//! of a frame's first fragment, so a frame is only known to be complete once
//! the next one starts.
//!
//! ```text
//!  fragment          state before    action
//!  ────────────────  ──────────────  ──────────────────────────────────
//!  M + ...           Idle            start buffer with fragment
//!  M + ...           Accumulating    flush buffer, restart with fragment
//!  continuation      Idle            drop
//!  continuation      Accumulating    append
//! ```

use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyState {
    /// No frame marker seen since creation or reset
    Idle,
    /// Buffer holds at least the marker fragment of the current frame
    Accumulating,
}

/// Concatenation of every fragment of one frame, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFrame {
    pub bytes: Vec<u8>,
    pub fragments: usize,
}

pub struct Reassembler {
    marker: &'static [u8],
    state: ReassemblyState,
    buffer: Vec<u8>,
    fragments: usize,
}

impl Reassembler {
    pub fn new(marker: &'static [u8]) -> Self {
        Self {
            marker,
            state: ReassemblyState::Idle,
            buffer: Vec::new(),
            fragments: 0,
        }
    }

    /// Feed one notification payload
    ///
    /// Returns the previous frame when `fragment` opens a new one. The buffer is
    /// already holding the new frame by the time the caller sees the result, so
    /// whatever happens while decoding cannot leak into the next frame.
    pub fn push(&mut self, fragment: &[u8]) -> Option<CompletedFrame> {
        if fragment.starts_with(self.marker) {
            let completed = match self.state {
                ReassemblyState::Accumulating if !self.buffer.is_empty() => Some(CompletedFrame {
                    bytes: std::mem::take(&mut self.buffer),
                    fragments: self.fragments,
                }),
                _ => None,
            };

            self.buffer.clear();
            self.buffer.extend_from_slice(fragment);
            self.fragments = 1;
            self.state = ReassemblyState::Accumulating;

            if let Some(frame) = &completed {
                trace!(
                    "Frame complete: {} bytes from {} fragments",
                    frame.bytes.len(),
                    frame.fragments
                );
            }
            return completed;
        }

        match self.state {
            ReassemblyState::Idle => {
                debug!(
                    "Dropping {}-byte continuation fragment received before any frame marker",
                    fragment.len()
                );
            }
            ReassemblyState::Accumulating => {
                self.buffer.extend_from_slice(fragment);
                self.fragments += 1;
            }
        }
        None
    }

    pub fn state(&self) -> ReassemblyState {
        self.state
    }

    /// Bytes of the frame currently being assembled (never flushed on its own)
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn pending_fragments(&self) -> usize {
        self.fragments
    }

    /// Discard the in-progress frame and go back to `Idle`
    pub fn reset(&mut self) {
        if !self.buffer.is_empty() {
            debug!(
                "Discarding partial frame: {} bytes from {} fragments",
                self.buffer.len(),
                self.fragments
            );
        }
        self.buffer.clear();
        self.fragments = 0;
        self.state = ReassemblyState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: &[u8] = &[0xFF, 0x55];

    fn with_marker(rest: &[u8]) -> Vec<u8> {
        [M, rest].concat()
    }

    #[test]
    fn test_flushes_on_next_marker() {
        let mut r = Reassembler::new(M);
        assert_eq!(r.push(&with_marker(b"a")), None);
        assert_eq!(r.push(b"b"), None);
        assert_eq!(r.push(b"c"), None);

        let frame = r.push(&with_marker(b"d")).expect("first frame flushed");
        assert_eq!(frame.bytes, with_marker(b"abc"));
        assert_eq!(frame.fragments, 3);

        assert_eq!(r.push(b"e"), None);
        assert_eq!(r.pending(), with_marker(b"de").as_slice());
        assert_eq!(r.pending_fragments(), 2);
        assert_eq!(r.state(), ReassemblyState::Accumulating);
    }

    #[test]
    fn test_continuations_without_marker_never_flush() {
        let mut r = Reassembler::new(M);
        for chunk in [&b"x"[..], b"yy", b"zzz"] {
            assert_eq!(r.push(chunk), None);
        }
        assert_eq!(r.state(), ReassemblyState::Idle);
        assert!(r.pending().is_empty());
    }

    #[test]
    fn test_stray_continuation_not_attached_to_next_frame() {
        let mut r = Reassembler::new(M);
        r.push(b"stray");
        r.push(&with_marker(&[0x01]));
        let frame = r.push(&with_marker(&[0x02])).unwrap();
        assert_eq!(frame.bytes, vec![0xFF, 0x55, 0x01]);
    }

    #[test]
    fn test_marker_must_be_leading() {
        let mut r = Reassembler::new(M);
        r.push(&with_marker(&[0x01]));
        // Marker bytes in the middle of a fragment are payload
        assert_eq!(r.push(&[0x00, 0xFF, 0x55]), None);
        assert_eq!(r.pending(), &[0xFF, 0x55, 0x01, 0x00, 0xFF, 0x55]);
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let mut r = Reassembler::new(M);
        r.push(&with_marker(&[0x01]));
        r.push(&[0x02]);
        r.reset();
        assert_eq!(r.state(), ReassemblyState::Idle);
        assert_eq!(r.push(&with_marker(&[0x03])), None);
    }
}
