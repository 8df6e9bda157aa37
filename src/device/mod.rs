//! Camera SDK capability interface.
//!
//! The vendor SDK is consumed only through the [`CameraSystem`] and [`Camera`]
//! traits. The interface is a weakly typed node API in the GenICam style:
//! nodes are addressed by name inside a [`NodeMap`] and carry availability,
//! readability and writability predicates.
//!
//! Backends:
//! - `stub://N`: [`sim::SimulatedSystem`], N simulated cameras sharing one
//!   trigger line (tests, dry runs)
//! - vendor SDKs implement the traits out of tree

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::DeviceError;

pub mod configure;
pub mod profile;
pub mod sim;

pub use configure::{configure, AppliedSettings};
pub use profile::CameraProfile;

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Node map a feature lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeMap {
    /// GenICam device node map (exposure, trigger, lines, image format).
    Device,
    /// Transport-layer stream node map (buffer handling).
    Stream,
}

impl std::fmt::Display for NodeMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeMap::Device => f.write_str("device"),
            NodeMap::Stream => f.write_str("stream"),
        }
    }
}

/// Access predicates of one node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeAccess {
    pub available: bool,
    pub readable: bool,
    pub writable: bool,
}

impl NodeAccess {
    pub const NONE: NodeAccess = NodeAccess {
        available: false,
        readable: false,
        writable: false,
    };
    pub const READ_ONLY: NodeAccess = NodeAccess {
        available: true,
        readable: true,
        writable: false,
    };
    pub const READ_WRITE: NodeAccess = NodeAccess {
        available: true,
        readable: true,
        writable: true,
    };
}

/// Trigger role of a camera within one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerRole {
    /// Free running; its exposure-active strobe drives the shared trigger line.
    Primary,
    /// Captures exactly one frame per pulse on the trigger line.
    Secondary,
}

impl std::fmt::Display for TriggerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerRole::Primary => f.write_str("primary"),
            TriggerRole::Secondary => f.write_str("secondary"),
        }
    }
}

/// Pixel formats the rig records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Mono8,
    BayerRG8,
}

impl PixelFormat {
    pub fn from_color(color: bool) -> Self {
        if color {
            PixelFormat::BayerRG8
        } else {
            PixelFormat::Mono8
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        1
    }

    /// Enumeration entry name used by the `PixelFormat` node.
    pub fn entry_name(self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::BayerRG8 => "BayerRG8",
        }
    }

    /// Payload size of one frame with the given dimensions.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

/// One captured image buffer. Dropping the frame releases it back to the device.
#[derive(Debug)]
pub struct Frame {
    /// Device assigned sequence number, monotonic per device.
    pub frame_id: u64,
    /// Device clock timestamp in nanoseconds.
    pub timestamp_ns: u64,
    /// False when the transfer was incomplete.
    pub complete: bool,
    pub width: u32,
    pub height: u32,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(
        frame_id: u64,
        timestamp_ns: u64,
        complete: bool,
        width: u32,
        height: u32,
        data: Vec<u8>,
    ) -> Self {
        Self {
            frame_id,
            timestamp_ns,
            complete,
            width,
            height,
            data,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

/// One physical camera handle.
pub trait Camera: Send {
    /// Vendor assigned serial number.
    fn serial(&self) -> &str;
    fn model(&self) -> &str;

    fn init(&mut self) -> DeviceResult<()>;
    fn deinit(&mut self) -> DeviceResult<()>;

    fn node_access(&self, map: NodeMap, name: &str) -> NodeAccess;
    fn enum_entries(&self, map: NodeMap, name: &str) -> DeviceResult<Vec<String>>;
    fn feature_enum(&self, map: NodeMap, name: &str) -> DeviceResult<String>;
    fn feature_enum_set(&mut self, map: NodeMap, name: &str, entry: &str) -> DeviceResult<()>;
    fn feature_float(&self, map: NodeMap, name: &str) -> DeviceResult<f64>;
    fn feature_float_max(&self, map: NodeMap, name: &str) -> DeviceResult<f64>;
    fn feature_float_set(&mut self, map: NodeMap, name: &str, value: f64) -> DeviceResult<()>;
    fn feature_int(&self, map: NodeMap, name: &str) -> DeviceResult<i64>;
    fn feature_int_max(&self, map: NodeMap, name: &str) -> DeviceResult<i64>;
    fn feature_int_set(&mut self, map: NodeMap, name: &str, value: i64) -> DeviceResult<()>;
    fn feature_bool_set(&mut self, map: NodeMap, name: &str, value: bool) -> DeviceResult<()>;
    fn feature_string_set(&mut self, map: NodeMap, name: &str, value: &str) -> DeviceResult<()>;

    fn begin_acquisition(&mut self) -> DeviceResult<()>;
    fn end_acquisition(&mut self) -> DeviceResult<()>;

    /// Wait for the next frame from the device queue.
    ///
    /// `None` waits indefinitely. Returns [`DeviceError::Timeout`] when the
    /// wait expires.
    fn next_frame(&mut self, timeout: Option<Duration>) -> DeviceResult<Frame>;
}

/// Entry point of a camera SDK.
pub trait CameraSystem {
    type Camera: Camera + 'static;

    fn library_version(&self) -> String;

    /// Enumerate connected cameras. Enumeration order defines session identities.
    fn cameras(&mut self) -> DeviceResult<Vec<Self::Camera>>;
}
