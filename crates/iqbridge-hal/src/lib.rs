//! # Hardware Abstraction Layer (HAL)
//!
//! This crate defines the interface between the iqbridge server and SDR
//! hardware drivers:
//!
//! - **SdrDevice**: one opened device, covering identification, channel
//!   metadata, tuning, gain control, and stream lifecycle
//! - **DeviceDriver** / **DriverRegistry**: driver discovery and device
//!   construction from `key=value` arguments
//! - **SampleFormat**: the wire sample formats and their frame sizes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 iqbridge-server (RPC engine)                │
//! ├─────────────────────────────────────────────────────────────┤
//! │              HAL Interface (SdrDevice trait)                │
//! ├───────────────┬─────────────────────────────────────────────┤
//! │   Loopback    │   Hardware Drivers                          │
//! │   (built-in)  │   (out of tree)                             │
//! └───────────────┴─────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use iqbridge_hal::{default_registry, Direction, Kwargs};
//!
//! let registry = default_registry();
//! let mut args = Kwargs::new();
//! args.insert("driver".into(), "loopback".into());
//! let dev = registry.create(&args)?;
//! println!("{}", dev.hardware_key());
//! println!("rate: {}", dev.sample_rate(Direction::Rx, 0));
//! ```

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

pub mod loopback;

pub use loopback::LoopbackDriver;

/// Keyed string arguments: driver construction args, hardware info,
/// channel info, and tuning args.
pub type Kwargs = BTreeMap<String, String>;

/// Result type for device operations
pub type SdrResult<T> = Result<T, SdrError>;

/// Errors that can occur during device operations
#[derive(Debug, thiserror::Error)]
pub enum SdrError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("Stream not started")]
    NotStarted,

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Stream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Receive stream (device to client)
    Rx,
    /// Transmit stream (client to device)
    Tx,
}

impl Direction {
    /// Decode the protocol's integer direction. `0` is receive, `1` is
    /// transmit; anything else falls back to receive.
    pub fn from_wire(value: i32) -> Self {
        if value == 1 {
            Direction::Tx
        } else {
            Direction::Rx
        }
    }

    /// Encode for the protocol.
    pub fn to_wire(self) -> i32 {
        match self {
            Direction::Rx => 0,
            Direction::Tx => 1,
        }
    }
}

/// Wire sample format for stream data.
///
/// Each complex sample occupies `frame_bytes()` bytes per channel on the
/// wire: interleaved I/Q at 8, 16, or 32 bits per component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// 8-bit signed integer I/Q (`CS8`)
    ComplexInt8,
    /// 16-bit signed integer I/Q (`CS16`)
    ComplexInt16,
    /// 32-bit float I/Q (`CF32`)
    ComplexFloat32,
}

impl SampleFormat {
    /// Parse a wire format tag. Unknown tags are rejected.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "CS8" => Some(SampleFormat::ComplexInt8),
            "CS16" => Some(SampleFormat::ComplexInt16),
            "CF32" => Some(SampleFormat::ComplexFloat32),
            _ => None,
        }
    }

    /// The wire format tag.
    pub fn tag(self) -> &'static str {
        match self {
            SampleFormat::ComplexInt8 => "CS8",
            SampleFormat::ComplexInt16 => "CS16",
            SampleFormat::ComplexFloat32 => "CF32",
        }
    }

    /// Bytes per complex sample per channel.
    pub fn frame_bytes(self) -> usize {
        match self {
            SampleFormat::ComplexInt8 => 2,
            SampleFormat::ComplexInt16 => 4,
            SampleFormat::ComplexFloat32 => 8,
        }
    }
}

/// A closed interval with a step, as reported for gain, frequency and
/// sample-rate capabilities. A step of zero means continuous.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub minimum: f64,
    pub maximum: f64,
    pub step: f64,
}

impl Range {
    pub fn new(minimum: f64, maximum: f64, step: f64) -> Self {
        Self { minimum, maximum, step }
    }
}

/// Opaque identifier for a configured stream, issued by `setup_stream`
/// and consumed by the other stream-lifecycle calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(u64);

impl StreamHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// One opened SDR device.
///
/// All methods take `&self`: implementations own their interior locking,
/// and must tolerate a stream read proceeding on one thread while control
/// calls arrive on another. Getters report current device state and do not
/// fail; setters and the stream lifecycle return `SdrResult`.
pub trait SdrDevice: Send + Sync {
    /// Short hardware identification key (e.g. a chipset name).
    fn hardware_key(&self) -> String;

    /// Keyed hardware details: serial numbers, firmware versions, etc.
    fn hardware_info(&self) -> Kwargs;

    /// Frontend mapping configuration string for one direction.
    fn frontend_mapping(&self, direction: Direction) -> String;

    fn set_frontend_mapping(&self, direction: Direction, mapping: &str) -> SdrResult<()>;

    /// Number of channels available in one direction.
    fn num_channels(&self, direction: Direction) -> usize;

    /// Keyed metadata for one channel.
    fn channel_info(&self, direction: Direction, channel: usize) -> Kwargs;

    /// Whether the channel can operate full duplex.
    fn full_duplex(&self, direction: Direction, channel: usize) -> bool;

    /// Wire format tags this channel can stream.
    fn stream_formats(&self, direction: Direction, channel: usize) -> Vec<String>;

    /// The channel's native format tag and its full-scale value.
    fn native_stream_format(&self, direction: Direction, channel: usize) -> (String, f64);

    fn antennas(&self, direction: Direction, channel: usize) -> Vec<String>;

    fn antenna(&self, direction: Direction, channel: usize) -> String;

    fn set_antenna(&self, direction: Direction, channel: usize, name: &str) -> SdrResult<()>;

    /// Names of the individually controllable gain elements.
    fn gain_names(&self, direction: Direction, channel: usize) -> Vec<String>;

    /// Whether automatic gain mode is supported.
    fn has_gain_mode(&self, direction: Direction, channel: usize) -> bool;

    /// Whether automatic gain mode is currently enabled.
    fn gain_mode(&self, direction: Direction, channel: usize) -> bool;

    fn set_gain_mode(&self, direction: Direction, channel: usize, automatic: bool) -> SdrResult<()>;

    /// Overall gain in dB.
    fn gain(&self, direction: Direction, channel: usize) -> f64;

    fn gain_named(&self, direction: Direction, channel: usize, name: &str) -> f64;

    fn set_gain(&self, direction: Direction, channel: usize, gain_db: f64) -> SdrResult<()>;

    fn set_gain_named(
        &self,
        direction: Direction,
        channel: usize,
        name: &str,
        gain_db: f64,
    ) -> SdrResult<()>;

    fn gain_range(&self, direction: Direction, channel: usize) -> Range;

    fn gain_range_named(&self, direction: Direction, channel: usize, name: &str) -> Range;

    /// Overall center frequency in Hz.
    fn frequency(&self, direction: Direction, channel: usize) -> f64;

    fn frequency_named(&self, direction: Direction, channel: usize, name: &str) -> f64;

    /// Tune the overall center frequency. `args` carries tuner-specific
    /// hints (e.g. an offset for the RF component).
    fn set_frequency(
        &self,
        direction: Direction,
        channel: usize,
        frequency_hz: f64,
        args: &Kwargs,
    ) -> SdrResult<()>;

    fn set_frequency_named(
        &self,
        direction: Direction,
        channel: usize,
        name: &str,
        frequency_hz: f64,
        args: &Kwargs,
    ) -> SdrResult<()>;

    /// Names of the tunable frequency components (e.g. RF, corrections).
    fn frequency_components(&self, direction: Direction, channel: usize) -> Vec<String>;

    fn frequency_range(&self, direction: Direction, channel: usize) -> Vec<Range>;

    fn frequency_range_named(
        &self,
        direction: Direction,
        channel: usize,
        name: &str,
    ) -> Vec<Range>;

    /// Sample rate in samples per second.
    fn sample_rate(&self, direction: Direction, channel: usize) -> f64;

    fn set_sample_rate(&self, direction: Direction, channel: usize, rate: f64) -> SdrResult<()>;

    fn sample_rate_range(&self, direction: Direction, channel: usize) -> Vec<Range>;

    /// Configure a stream over the given channels. The returned handle is
    /// consumed by the other stream calls; `close_stream` invalidates it.
    fn setup_stream(
        &self,
        direction: Direction,
        format: SampleFormat,
        channels: &[usize],
        args: &Kwargs,
    ) -> SdrResult<StreamHandle>;

    fn close_stream(&self, stream: StreamHandle) -> SdrResult<()>;

    /// Maximum elements per read/write transaction.
    fn stream_mtu(&self, stream: StreamHandle) -> usize;

    fn activate_stream(&self, stream: StreamHandle) -> SdrResult<()>;

    fn deactivate_stream(&self, stream: StreamHandle) -> SdrResult<()>;

    /// Read up to `num_elems` samples into one byte buffer per channel.
    /// Each buffer receives whole frames of the configured format. Returns
    /// the number of samples read per channel.
    fn read_stream(
        &self,
        stream: StreamHandle,
        buffs: &mut [&mut [u8]],
        num_elems: usize,
        timeout: Duration,
    ) -> SdrResult<usize>;

    /// Write samples from one byte buffer per channel. Drivers without
    /// transmit support leave the default in place.
    fn write_stream(
        &self,
        _stream: StreamHandle,
        _buffs: &[&[u8]],
        _num_elems: usize,
        _timeout: Duration,
    ) -> SdrResult<usize> {
        Err(SdrError::Unsupported("write_stream".to_string()))
    }
}

/// Driver factory for creating devices.
pub trait DeviceDriver: Send + Sync {
    /// Driver name, matched against the `driver` argument key.
    fn name(&self) -> &str;

    /// Create a device from keyed arguments.
    fn create(&self, args: &Kwargs) -> SdrResult<Arc<dyn SdrDevice>>;
}

/// Registry of available device drivers.
pub struct DriverRegistry {
    drivers: Vec<Box<dyn DeviceDriver>>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { drivers: Vec::new() }
    }

    /// Register a device driver.
    pub fn register(&mut self, driver: Box<dyn DeviceDriver>) {
        self.drivers.push(driver);
    }

    /// Get a driver by name.
    pub fn get(&self, name: &str) -> Option<&dyn DeviceDriver> {
        self.drivers
            .iter()
            .find(|d| d.name() == name)
            .map(|d| d.as_ref())
    }

    /// List all registered driver names.
    pub fn list(&self) -> Vec<&str> {
        self.drivers.iter().map(|d| d.name()).collect()
    }

    /// Create a device. `args` must carry a `driver` key naming the driver;
    /// the remaining keys are passed through to it.
    pub fn create(&self, args: &Kwargs) -> SdrResult<Arc<dyn SdrDevice>> {
        let name = args
            .get("driver")
            .ok_or_else(|| SdrError::ConfigError("missing driver argument".to_string()))?;

        let driver = self
            .get(name)
            .ok_or_else(|| SdrError::DeviceNotFound(format!("unknown driver: {}", name)))?;

        tracing::debug!(driver = %name, "creating device");
        driver.create(args)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with all built-in drivers.
pub fn default_registry() -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    registry.register(Box::new(LoopbackDriver::new()));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_wire_mapping() {
        assert_eq!(Direction::from_wire(0), Direction::Rx);
        assert_eq!(Direction::from_wire(1), Direction::Tx);
        assert_eq!(Direction::from_wire(7), Direction::Rx);
        assert_eq!(Direction::Rx.to_wire(), 0);
        assert_eq!(Direction::Tx.to_wire(), 1);
    }

    #[test]
    fn test_format_table() {
        assert_eq!(SampleFormat::from_tag("CS8"), Some(SampleFormat::ComplexInt8));
        assert_eq!(SampleFormat::from_tag("CS16"), Some(SampleFormat::ComplexInt16));
        assert_eq!(SampleFormat::from_tag("CF32"), Some(SampleFormat::ComplexFloat32));
        assert_eq!(SampleFormat::from_tag("CU8"), None);
        assert_eq!(SampleFormat::ComplexInt8.frame_bytes(), 2);
        assert_eq!(SampleFormat::ComplexInt16.frame_bytes(), 4);
        assert_eq!(SampleFormat::ComplexFloat32.frame_bytes(), 8);
    }

    #[test]
    fn test_format_tag_roundtrip() {
        for fmt in [
            SampleFormat::ComplexInt8,
            SampleFormat::ComplexInt16,
            SampleFormat::ComplexFloat32,
        ] {
            assert_eq!(SampleFormat::from_tag(fmt.tag()), Some(fmt));
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = default_registry();
        assert!(registry.get("loopback").is_some());
        assert!(registry.get("uhd").is_none());
        assert_eq!(registry.list(), vec!["loopback"]);
    }

    #[test]
    fn test_registry_unknown_driver() {
        let registry = default_registry();
        let mut args = Kwargs::new();
        args.insert("driver".to_string(), "nonexistent".to_string());
        assert!(matches!(
            registry.create(&args),
            Err(SdrError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_registry_missing_driver_key() {
        let registry = default_registry();
        assert!(matches!(
            registry.create(&Kwargs::new()),
            Err(SdrError::ConfigError(_))
        ));
    }
}
