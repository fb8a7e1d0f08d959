//! HydroGuard: flood alert engine and mesh beacon protocol.
//!
//! Turns a noisy water-level feed into a classified hazard level and pushes
//! every confirmed level change out over independent channels: a dashboard
//! feed, an external SMS tool, and a serial-attached BLE beacon that nearby
//! phones can relay hop by hop when the network is down.
//!
//! The library is organized in two code layers:
//! - **Protocol layer** (always built): `level`, `classifier`, `protocol`,
//!   `comm`, `beacon`, `board`, `defaults`. `no_std`, no allocator. The
//!   beacon firmware (`firmware-std/`) links only this layer.
//! - **Host layer** (`std` feature): `engine`, `dispatch`, `channels`,
//!   `serial`, `source`, `status`, `monitor`, `config`, `error`. The
//!   service that runs next to the camera and drives the beacon.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod beacon;
pub mod board;
pub mod classifier;
pub mod comm;
pub mod defaults;
pub mod level;
pub mod protocol;

#[cfg(feature = "std")]
pub mod channels;
#[cfg(feature = "std")]
pub mod config;
#[cfg(feature = "std")]
pub mod dispatch;
#[cfg(feature = "std")]
pub mod engine;
#[cfg(feature = "std")]
pub mod error;
#[cfg(feature = "std")]
pub mod monitor;
#[cfg(feature = "std")]
pub mod serial;
#[cfg(feature = "std")]
pub mod source;
#[cfg(feature = "std")]
pub mod status;
