//! Geometry constants for the VGA text-mode buffer.

/// Number of rows in VGA text mode 3 (80x25).
pub const BUFFER_HEIGHT: usize = 25;
/// Number of columns in VGA text mode 3 (80x25).
pub const BUFFER_WIDTH: usize = 80;
