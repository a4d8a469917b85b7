//! Server-side replay protection and client-side notification ordering.
//!
//! The window is a bitmap anchored at the highest accepted sequence number;
//! checking is pure, updating demands a prior successful check. A separate
//! flag tracks the single legal use of sequence number zero, which the
//! anchor arithmetic cannot represent.

use tarn_shared::Error;

/// Window width in sequence numbers; 32 is the RFC minimum.
pub const REPLAY_WINDOW_SIZE: u64 = 64;

/// Sequence numbers are carried in at most 5 PIV bytes.
pub const MAX_SEQ_NUM: u64 = (1 << 40) - 1;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReplayWindow {
    /// Bit `i` records reception of `top - i`.
    window: u64,
    /// Highest accepted sequence number.
    top: u64,
    zero_received: bool,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        ReplayWindow {
            window: 0,
            top: 0,
            zero_received: false,
        }
    }

    /// Restore a window from a stored session: everything up to and
    /// including `current` counts as already received.
    pub fn reinit(&mut self, current: u64) {
        self.window = u64::MAX;
        self.top = current;
        self.zero_received = true;
    }

    /// The newest accepted sequence number, for storing a session.
    pub fn last_number(&self) -> u64 {
        self.top
    }

    /// Pure check; never mutates.
    pub fn check(&self, seq: u64) -> Result<(), Error> {
        if seq > MAX_SEQ_NUM {
            return Err(Error::ReplayWindowStale);
        }
        if seq == 0 {
            return if self.zero_received {
                Err(Error::ReplayDuplicate)
            } else {
                Ok(())
            };
        }
        if seq > self.top {
            return Ok(());
        }
        let offset = self.top - seq;
        if offset >= REPLAY_WINDOW_SIZE {
            return Err(Error::ReplayWindowStale);
        }
        if self.window >> offset & 1 == 1 {
            Err(Error::ReplayDuplicate)
        } else {
            Ok(())
        }
    }

    pub fn is_valid(&self, seq: u64) -> bool {
        self.check(seq).is_ok()
    }

    /// Record `seq` as received. Returns false when the number would not
    /// pass [Self::check], signalling a caller that skipped it.
    pub fn update(&mut self, seq: u64) -> bool {
        if self.check(seq).is_err() {
            return false;
        }
        if seq == 0 {
            self.zero_received = true;
            return true;
        }
        if seq > self.top {
            let shift = seq - self.top;
            self.window = if shift >= REPLAY_WINDOW_SIZE {
                0
            } else {
                self.window << shift
            };
            self.window |= 1;
            self.top = seq;
        } else {
            self.window |= 1 << (self.top - seq);
        }
        true
    }
}

/// Notification ordering for a client observing a resource, per the
/// RFC 7641 24-bit wrap-around comparison.
#[derive(Clone, Copy, Debug, Default)]
pub struct NotificationTracker {
    number: u64,
    initialized: bool,
}

const OBSERVE_MODULO: u64 = 1 << 24;
const OBSERVE_HALF: u64 = 1 << 23;

impl NotificationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a notification with this PIV is newer than everything seen.
    pub fn check(&self, piv: u64) -> Result<(), Error> {
        if !self.initialized {
            return Ok(());
        }
        let v1 = self.number % OBSERVE_MODULO;
        let v2 = piv % OBSERVE_MODULO;
        let fresh = (v1 < v2 && v2 - v1 < OBSERVE_HALF) || (v1 > v2 && v1 - v2 > OBSERVE_HALF);
        if fresh {
            Ok(())
        } else {
            Err(Error::NotificationOutOfOrder)
        }
    }

    pub fn update(&mut self, piv: u64) -> Result<(), Error> {
        self.check(piv)?;
        self.number = piv;
        self.initialized = true;
        Ok(())
    }
}
