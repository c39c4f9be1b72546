//! Background keep-alive scheduling (C7).
//!
//! The scheduler itself is a plain [`std::thread`], spawned and owned by
//! [`crate::transport::Transport`] (see `transport::spawn_keepalive`) — this
//! module only holds the public, documented shape of that mechanism so it
//! has a home matching the design's module list. The thread holds a `Weak`
//! back-reference into the transport's shared state (design note 9): it
//! never keeps the handle alive by itself, and a dropped `Transport` lets
//! the thread notice on its next tick and exit.
//!
//! Cancellation is a bounded `mpsc` channel rather than an atomic flag: the
//! `recv_timeout` on that channel both sleeps for the tick interval and
//! wakes immediately on `close()`, so shutdown never waits for a full tick.

/// Default interval between keep-alive probes while the device is believed
/// Connected or Connecting (§4.7).
pub const DEFAULT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3);
