//! SSH keep-alive scheduling.
//!
//! Keep-alives are `keepalive@openssh.com` global requests. Nothing runs in
//! the background: the application calls
//! [`Session::keepalive_send`](crate::ssh::session::Session::keepalive_send)
//! from its own loop and gets back the number of seconds until the next one
//! is due.

use std::time::{Duration, Instant};

use crate::ssh::connection::{GlobalRequest, GlobalRequestType};

/// Keep-alive configuration and last send time.
#[derive(Debug, Clone, Default)]
pub(crate) struct Keepalive {
    want_reply: bool,
    interval: u32,
    last_sent: Option<Instant>,
}

/// Outcome of [`Keepalive::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeepaliveAction {
    /// Keep-alives are off
    Disabled,
    /// A keep-alive should be sent now
    Due,
    /// Seconds until the next one is due
    Wait(u32),
}

impl Keepalive {
    /// Sets the interval in seconds; 0 disables keep-alives.
    ///
    /// An interval of 1 is raised to 2 so the peer has time to answer.
    pub(crate) fn configure(&mut self, want_reply: bool, interval: u32) {
        self.want_reply = want_reply;
        self.interval = if interval == 1 { 2 } else { interval };
    }

    pub(crate) fn interval(&self) -> u32 {
        self.interval
    }

    pub(crate) fn want_reply(&self) -> bool {
        self.want_reply
    }

    pub(crate) fn poll(&self, now: Instant) -> KeepaliveAction {
        if self.interval == 0 {
            return KeepaliveAction::Disabled;
        }
        let Some(last) = self.last_sent else {
            return KeepaliveAction::Due;
        };
        let interval = Duration::from_secs(u64::from(self.interval));
        let elapsed = now.saturating_duration_since(last);
        if elapsed >= interval {
            KeepaliveAction::Due
        } else {
            let left = (interval - elapsed).as_secs_f64().ceil() as u32;
            KeepaliveAction::Wait(left.max(1))
        }
    }

    pub(crate) fn mark_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    /// Builds the global request payload.
    pub(crate) fn request(&self) -> Vec<u8> {
        GlobalRequest {
            request_type: GlobalRequestType::Keepalive,
            want_reply: self.want_reply,
        }
        .to_bytes()
    }
}
