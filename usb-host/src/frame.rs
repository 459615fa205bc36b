//! 14 位帧号运算

use core::fmt;

pub const FRAME_MASK: u16 = 0x3FFF;

/// How far ahead of a target frame a channel may still be started.
const WINDOW_SPAN: u16 = 0x1FFF;

/// A (micro)frame number as reported by the host controller, modulo 2^14.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameNumber(u16);

impl FrameNumber {
    pub const fn new(raw: u16) -> Self {
        Self(raw & FRAME_MASK)
    }

    pub const fn value(self) -> u16 {
        self.0
    }

    pub const fn add(self, n: u16) -> Self {
        Self::new(self.0.wrapping_add(n))
    }

    pub const fn sub(self, n: u16) -> Self {
        Self::new(self.0.wrapping_sub(n))
    }

    pub const fn is_odd(self) -> bool {
        self.0 & 1 != 0
    }

    /// Whether `self` lies inside the start window of `target`.
    ///
    /// The window is `[target, target + 0x1FFF]`, widened by one frame on the
    /// low side for periodic transfers, all modulo 2^14.
    pub fn is_due(self, target: FrameNumber, periodic: bool) -> bool {
        let low = if periodic { target.sub(1) } else { target };
        let upper = target.add(WINDOW_SPAN);

        if low.0 < upper.0 {
            self.0 >= low.0 && self.0 <= upper.0
        } else {
            self.0 >= low.0 || self.0 <= upper.0
        }
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
