//! SSH channel bookkeeping.
//!
//! One [`SshChannel`] exists per open channel. It tracks the identifier pair,
//! both flow-control windows, the received stdout/stderr bytes not yet
//! consumed, and the EOF/close flags of each direction. It performs no I/O:
//! the session feeds it incoming messages and asks it what to send.
//!
//! # Windows
//!
//! - The *local* window is what the peer may still send us. Incoming data
//!   beyond it is a protocol violation. Once the reader has consumed enough
//!   buffered data, [`SshChannel::window_adjust_due`] returns the amount to
//!   grant back with SSH_MSG_CHANNEL_WINDOW_ADJUST.
//! - The *remote* window is what we may still send. Writes are cut to
//!   `min(remote window, remote max packet, MAX_CHANNEL_DATA)`.

use bytes::{Buf, BytesMut};
use sshwire_platform::{SshError, SshResult};

/// Smallest adjustment sent by [`SshChannel::adjust_receive_window`] without
/// `force`.
pub const MIN_WINDOW_ADJUST: u32 = 1024;

/// Most data bytes put into one SSH_MSG_CHANNEL_DATA, whatever maximum
/// packet the peer advertises. Keeps the wire packet under
/// [`MAX_PACKET_SIZE`](crate::ssh::packet::MAX_PACKET_SIZE).
pub const MAX_CHANNEL_DATA: usize = 32768;

/// SSH channel state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// SSH_MSG_CHANNEL_OPEN sent, waiting for the peer
    Opening,
    /// Channel is open and ready
    Open,
    /// The peer refused the open request
    OpenFailed {
        /// Reason code
        reason: u32,
        /// Peer description
        description: String,
    },
    /// Both sides have sent SSH_MSG_CHANNEL_CLOSE
    Closed,
}

/// What happens to SSH_MSG_CHANNEL_EXTENDED_DATA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtendedData {
    /// Queue it separately, read with `read_stderr`
    #[default]
    Normal,
    /// Discard it and return the window immediately
    Ignore,
    /// Append it to the stdout stream
    Merge,
}

/// Exit signal reported by the remote process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExitSignal {
    /// Signal name without the "SIG" prefix, `None` if the process exited
    /// normally
    pub signal_name: Option<String>,
    /// Whether a core was dumped
    pub core_dumped: bool,
    /// Error message
    pub error_message: Option<String>,
    /// Language tag of the message
    pub language_tag: Option<String>,
}

/// Reply to a channel request sent with `want_reply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestReply {
    /// SSH_MSG_CHANNEL_SUCCESS
    Success,
    /// SSH_MSG_CHANNEL_FAILURE
    Failure,
}

/// Bounded read used by SCP downloads: the payload is followed by a one
/// byte status that must not leak into the caller's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadLimit {
    pub(crate) remaining: u64,
    /// The status byte after the payload arrived and was zero
    pub(crate) status_ok: bool,
    /// Our closing ack was sent; reads return EOF
    pub(crate) finished: bool,
}

impl ReadLimit {
    pub(crate) fn new(remaining: u64) -> Self {
        Self {
            remaining,
            status_ok: false,
            finished: false,
        }
    }
}

/// Per-channel flow-control and buffering state.
#[derive(Debug)]
pub struct SshChannel {
    local_id: u32,
    remote_id: u32,
    state: ChannelState,

    local_window: u32,
    local_window_initial: u32,
    local_max_packet: u32,
    pending_adjust: u32,

    remote_window: u32,
    remote_window_initial: u32,
    remote_max_packet: u32,

    stdout: BytesMut,
    stderr: BytesMut,
    extended_data: ExtendedData,

    eof_received: bool,
    eof_sent: bool,
    close_received: bool,
    close_sent: bool,

    exit_status: Option<u32>,
    exit_signal: Option<ExitSignal>,

    request_in_flight: Option<String>,
    request_reply: Option<RequestReply>,

    pub(crate) read_limit: Option<ReadLimit>,
    pub(crate) handle_dropped: bool,
}

impl SshChannel {
    /// Creates a channel in the [`ChannelState::Opening`] state.
    ///
    /// `window` and `max_packet` are what we advertise to the peer.
    pub fn new(local_id: u32, window: u32, max_packet: u32) -> Self {
        Self {
            local_id,
            remote_id: 0,
            state: ChannelState::Opening,
            local_window: window,
            local_window_initial: window,
            local_max_packet: max_packet,
            pending_adjust: 0,
            remote_window: 0,
            remote_window_initial: 0,
            remote_max_packet: 0,
            stdout: BytesMut::new(),
            stderr: BytesMut::new(),
            extended_data: ExtendedData::Normal,
            eof_received: false,
            eof_sent: false,
            close_received: false,
            close_sent: false,
            exit_status: None,
            exit_signal: None,
            request_in_flight: None,
            request_reply: None,
            read_limit: None,
            handle_dropped: false,
        }
    }

    /// Creates a channel the peer opened and we accepted.
    pub fn accepted(
        local_id: u32,
        window: u32,
        max_packet: u32,
        remote_id: u32,
        remote_window: u32,
        remote_max_packet: u32,
    ) -> Self {
        let mut channel = Self::new(local_id, window, max_packet);
        channel.confirm(remote_id, remote_window, remote_max_packet);
        channel
    }

    /// Records SSH_MSG_CHANNEL_OPEN_CONFIRMATION.
    pub fn confirm(&mut self, remote_id: u32, remote_window: u32, remote_max_packet: u32) {
        self.remote_id = remote_id;
        self.remote_window = remote_window;
        self.remote_window_initial = remote_window;
        self.remote_max_packet = remote_max_packet;
        self.state = ChannelState::Open;
    }

    /// Records SSH_MSG_CHANNEL_OPEN_FAILURE.
    pub fn open_failed(&mut self, reason: u32, description: String) {
        self.state = ChannelState::OpenFailed {
            reason,
            description,
        };
    }

    /// Returns the local channel ID.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Returns the remote channel ID.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Returns the current state.
    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    /// Returns true once the open handshake succeeded.
    pub fn is_open(&self) -> bool {
        matches!(self.state, ChannelState::Open | ChannelState::Closed)
    }

    /// Bytes the peer may still send before we adjust.
    pub fn local_window(&self) -> u32 {
        self.local_window
    }

    /// Window advertised at open time.
    pub fn local_window_initial(&self) -> u32 {
        self.local_window_initial
    }

    /// Largest packet we accept.
    pub fn local_max_packet(&self) -> u32 {
        self.local_max_packet
    }

    /// Bytes we may still send.
    pub fn remote_window(&self) -> u32 {
        self.remote_window
    }

    /// Window the peer advertised at open time.
    pub fn remote_window_initial(&self) -> u32 {
        self.remote_window_initial
    }

    /// Largest packet the peer accepts.
    pub fn remote_max_packet(&self) -> u32 {
        self.remote_max_packet
    }

    /// Buffered stdout bytes.
    pub fn stdout_available(&self) -> usize {
        self.stdout.len()
    }

    /// Buffered stderr bytes.
    pub fn stderr_available(&self) -> usize {
        self.stderr.len()
    }

    fn consume_local_window(&mut self, len: usize) -> SshResult<()> {
        if len > self.local_max_packet as usize + 1024 {
            return Err(SshError::Protocol(format!(
                "Channel {} received {} bytes, above max packet {}",
                self.local_id, len, self.local_max_packet
            )));
        }
        if len > self.local_window as usize {
            return Err(SshError::ChannelWindowExceeded(format!(
                "Channel {} received {} bytes with {} left in window",
                self.local_id, len, self.local_window
            )));
        }
        self.local_window -= len as u32;
        Ok(())
    }

    /// Applies SSH_MSG_CHANNEL_DATA.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::ChannelWindowExceeded`] if the peer overran the
    /// window we advertised.
    pub fn receive_data(&mut self, data: &[u8]) -> SshResult<()> {
        self.consume_local_window(data.len())?;
        self.stdout.extend_from_slice(data);
        Ok(())
    }

    /// Applies SSH_MSG_CHANNEL_EXTENDED_DATA according to the
    /// [`ExtendedData`] mode.
    pub fn receive_extended_data(&mut self, data: &[u8]) -> SshResult<()> {
        self.consume_local_window(data.len())?;
        match self.extended_data {
            ExtendedData::Normal => self.stderr.extend_from_slice(data),
            ExtendedData::Merge => self.stdout.extend_from_slice(data),
            ExtendedData::Ignore => {}
        }
        Ok(())
    }

    /// Sets the extended data mode.
    ///
    /// Switching to `Ignore` drops queued stderr; switching to `Merge`
    /// moves it onto stdout.
    pub fn set_extended_data(&mut self, mode: ExtendedData) {
        match mode {
            ExtendedData::Ignore => self.stderr.clear(),
            ExtendedData::Merge => {
                let queued = self.stderr.split();
                self.stdout.extend_from_slice(&queued);
            }
            ExtendedData::Normal => {}
        }
        self.extended_data = mode;
    }

    /// Copies buffered stdout into `buf`.
    pub fn read_stdout(&mut self, buf: &mut [u8]) -> usize {
        let mut len = buf.len().min(self.stdout.len());
        if let Some(limit) = &self.read_limit {
            len = len.min(usize::try_from(limit.remaining).unwrap_or(usize::MAX));
        }
        buf[..len].copy_from_slice(&self.stdout[..len]);
        self.stdout.advance(len);
        if let Some(limit) = self.read_limit.as_mut() {
            limit.remaining -= len as u64;
        }
        len
    }

    /// Copies buffered stderr into `buf`.
    pub fn read_stderr(&mut self, buf: &mut [u8]) -> usize {
        let len = buf.len().min(self.stderr.len());
        buf[..len].copy_from_slice(&self.stderr[..len]);
        self.stderr.advance(len);
        len
    }

    /// Removes one byte from stdout, bypassing any read limit.
    pub(crate) fn take_stdout_byte(&mut self) -> Option<u8> {
        if self.stdout.is_empty() {
            None
        } else {
            let byte = self.stdout[0];
            self.stdout.advance(1);
            Some(byte)
        }
    }

    /// Returns the window adjustment to send, if one is due.
    ///
    /// Adjusts are sent once the window falls below half of its initial
    /// size, and only for bytes the reader has already consumed. The local
    /// window is credited on return.
    pub fn window_adjust_due(&mut self) -> Option<u32> {
        let buffered = (self.stdout.len() + self.stderr.len()) as u64;
        let outstanding = self.local_window as u64 + buffered;
        let initial = self.local_window_initial as u64;

        if self.eof_received || self.close_received {
            return None;
        }
        if (self.local_window as u64) >= initial / 2 || outstanding >= initial {
            return None;
        }
        let credit = (initial - outstanding) as u32;
        self.local_window += credit;
        Some(credit)
    }

    /// Grows the receive window by `adjustment`.
    ///
    /// Adjustments below [`MIN_WINDOW_ADJUST`] are accumulated unless
    /// `force` is set. Returns the amount to send now, if any.
    pub fn adjust_receive_window(&mut self, adjustment: u32, force: bool) -> Option<u32> {
        self.pending_adjust = self.pending_adjust.saturating_add(adjustment);
        if self.pending_adjust == 0 || (!force && self.pending_adjust < MIN_WINDOW_ADJUST) {
            return None;
        }
        let credit = self.pending_adjust.min(u32::MAX - self.local_window);
        self.pending_adjust = 0;
        self.local_window += credit;
        self.local_window_initial = self.local_window_initial.max(self.local_window);
        Some(credit)
    }

    /// Number of bytes of `len` that fit into one packet within the remote
    /// window.
    pub fn sendable(&self, len: usize) -> usize {
        len.min(self.remote_window as usize)
            .min(self.remote_max_packet as usize)
            .min(MAX_CHANNEL_DATA)
    }

    /// Consumes remote window after sending `len` bytes.
    pub fn consume_remote_window(&mut self, len: usize) {
        self.remote_window = self.remote_window.saturating_sub(len as u32);
    }

    /// Applies SSH_MSG_CHANNEL_WINDOW_ADJUST.
    pub fn remote_window_adjust(&mut self, bytes: u32) {
        self.remote_window = self.remote_window.saturating_add(bytes);
    }

    /// Records SSH_MSG_CHANNEL_EOF from the peer.
    pub fn set_eof_received(&mut self) {
        self.eof_received = true;
    }

    /// Returns true once the peer sent EOF.
    pub fn eof_received(&self) -> bool {
        self.eof_received
    }

    /// Records that we sent EOF.
    pub fn set_eof_sent(&mut self) {
        self.eof_sent = true;
    }

    /// Returns true once we sent EOF.
    pub fn eof_sent(&self) -> bool {
        self.eof_sent
    }

    /// Records SSH_MSG_CHANNEL_CLOSE from the peer.
    pub fn set_close_received(&mut self) {
        self.close_received = true;
        self.eof_received = true;
        if self.close_sent {
            self.state = ChannelState::Closed;
        }
    }

    /// Returns true once the peer sent CLOSE.
    pub fn close_received(&self) -> bool {
        self.close_received
    }

    /// Records that we sent CLOSE.
    pub fn set_close_sent(&mut self) {
        self.close_sent = true;
        self.eof_sent = true;
        if self.close_received {
            self.state = ChannelState::Closed;
        }
    }

    /// Returns true once we sent CLOSE.
    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    /// Returns true when nothing more can be read: EOF arrived and the
    /// stdout buffer is drained.
    pub fn at_eof(&self) -> bool {
        self.eof_received && self.stdout.is_empty()
    }

    /// Records the `exit-status` request.
    pub fn set_exit_status(&mut self, status: u32) {
        self.exit_status = Some(status);
    }

    /// Exit status, if the peer sent one.
    pub fn exit_status(&self) -> Option<u32> {
        self.exit_status
    }

    /// Records the `exit-signal` request.
    pub fn set_exit_signal(&mut self, signal: ExitSignal) {
        self.exit_signal = Some(signal);
    }

    /// Exit signal, if the peer sent one.
    pub fn exit_signal(&self) -> Option<&ExitSignal> {
        self.exit_signal.as_ref()
    }

    /// Marks a `want_reply` request as sent.
    pub fn begin_request(&mut self, name: &str) {
        self.request_in_flight = Some(name.to_string());
        self.request_reply = None;
    }

    /// Name of the request waiting for a reply.
    pub fn request_in_flight(&self) -> Option<&str> {
        self.request_in_flight.as_deref()
    }

    /// Records SSH_MSG_CHANNEL_SUCCESS/FAILURE.
    pub fn set_request_reply(&mut self, reply: RequestReply) {
        if self.request_in_flight.is_some() {
            self.request_reply = Some(reply);
        }
    }

    /// Takes the reply of the request in flight once it arrived.
    pub fn take_request_reply(&mut self) -> Option<(String, RequestReply)> {
        let reply = self.request_reply.take()?;
        let name = self.request_in_flight.take().unwrap_or_default();
        Some((name, reply))
    }
}
