//! Pseudo-terminal value types

/// Size of a PTY window in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Window {
    pub width: u32,
    pub height: u32,
}

impl Window {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// A PTY allocation: terminal type plus the current window.
///
/// See pty(7). Only the window changes after allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pty {
    pub term: String,
    pub window: Window,
}
