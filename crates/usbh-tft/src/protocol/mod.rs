//! USB Mass Storage Bulk-Only Transport (BOT) wire framing.
//!
//! This module is pure: it turns in-memory command descriptors into the
//! 31-byte Command Block Wrapper and parses the 13-byte Command Status
//! Wrapper the device sends back. It never touches an endpoint — that is
//! [`crate::transport::gateway`]'s job.

pub mod cbw;
pub mod csw;

pub use cbw::{Cbw, Direction, CBW_LEN, CBW_SIGNATURE};
pub use csw::{Csw, CswDecodeError, CswStatus, CSW_LEN, CSW_SIGNATURE};
