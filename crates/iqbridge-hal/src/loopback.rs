//! Loopback driver: a deterministic in-memory device.
//!
//! Backs the server's tests and demos when no hardware is attached. Tuning
//! writes are remembered and read back verbatim; stream reads pace
//! themselves to the configured sample rate and produce repeatable data:
//!
//! - `CS8`/`CS16`: channel `c`, frame `i` carries the byte
//!   `(i + c) mod 256` repeated across the frame, so interleaving order is
//!   directly visible on the wire
//! - `CF32`: a unit-amplitude complex tone per channel
//!
//! Driver args: `key=<hardware key>` and `channels=<count>`.

use num_complex::Complex;
use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::{
    DeviceDriver, Direction, Kwargs, Range, SampleFormat, SdrDevice, SdrError, SdrResult,
    StreamHandle,
};

/// Normalized tone frequency per channel index, cycles per sample.
const TONE_CYCLES: f64 = 0.01;

/// Factory for [`LoopbackDevice`].
pub struct LoopbackDriver;

impl LoopbackDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceDriver for LoopbackDriver {
    fn name(&self) -> &str {
        "loopback"
    }

    fn create(&self, args: &Kwargs) -> SdrResult<Arc<dyn SdrDevice>> {
        Ok(Arc::new(LoopbackDevice::from_args(args)?))
    }
}

#[derive(Debug, Clone)]
struct ChannelState {
    antenna: String,
    gain_mode: bool,
    gain: f64,
    gains: BTreeMap<String, f64>,
    frequency: f64,
    sample_rate: f64,
}

impl Default for ChannelState {
    fn default() -> Self {
        let mut gains = BTreeMap::new();
        gains.insert("LNA".to_string(), 0.0);
        gains.insert("PGA".to_string(), 0.0);
        Self {
            antenna: "A".to_string(),
            gain_mode: false,
            gain: 0.0,
            gains,
            frequency: 100e6,
            sample_rate: 1e6,
        }
    }
}

#[derive(Debug)]
struct StreamState {
    format: SampleFormat,
    channels: Vec<usize>,
    rate: f64,
    active: bool,
    counter: u64,
}

#[derive(Debug)]
struct DeviceState {
    mappings: [String; 2],
    rx: Vec<ChannelState>,
    tx: Vec<ChannelState>,
    streams: BTreeMap<u64, StreamState>,
    next_stream: u64,
}

/// Deterministic software device, fully locked internally so stream reads
/// may proceed concurrently with control calls.
pub struct LoopbackDevice {
    key: String,
    num_channels: usize,
    state: Mutex<DeviceState>,
}

impl LoopbackDevice {
    fn from_args(args: &Kwargs) -> SdrResult<Self> {
        let key = args
            .get("key")
            .cloned()
            .unwrap_or_else(|| "loopback0".to_string());
        let num_channels = match args.get("channels") {
            Some(n) => n
                .parse::<usize>()
                .map_err(|_| SdrError::ConfigError(format!("bad channels arg: {}", n)))?,
            None => 1,
        };
        if num_channels == 0 {
            return Err(SdrError::ConfigError("channels must be > 0".to_string()));
        }

        tracing::info!(key = %key, channels = num_channels, "loopback device created");

        Ok(Self {
            key,
            num_channels,
            state: Mutex::new(DeviceState {
                mappings: [String::new(), String::new()],
                rx: vec![ChannelState::default(); num_channels],
                tx: vec![ChannelState::default(); num_channels],
                streams: BTreeMap::new(),
                next_stream: 1,
            }),
        })
    }

    fn with_channel<T>(&self, direction: Direction, channel: usize, f: impl FnOnce(&ChannelState) -> T) -> T {
        let state = self.state.lock().unwrap();
        let side = match direction {
            Direction::Rx => &state.rx,
            Direction::Tx => &state.tx,
        };
        match side.get(channel) {
            Some(ch) => f(ch),
            None => f(&ChannelState::default()),
        }
    }

    fn with_channel_mut(
        &self,
        direction: Direction,
        channel: usize,
        f: impl FnOnce(&mut ChannelState),
    ) -> SdrResult<()> {
        let mut state = self.state.lock().unwrap();
        let side = match direction {
            Direction::Rx => &mut state.rx,
            Direction::Tx => &mut state.tx,
        };
        match side.get_mut(channel) {
            Some(ch) => {
                f(ch);
                Ok(())
            }
            None => Err(SdrError::ConfigError(format!("no such channel: {}", channel))),
        }
    }
}

impl SdrDevice for LoopbackDevice {
    fn hardware_key(&self) -> String {
        self.key.clone()
    }

    fn hardware_info(&self) -> Kwargs {
        let mut info = Kwargs::new();
        info.insert("driver".to_string(), "loopback".to_string());
        info.insert("key".to_string(), self.key.clone());
        info.insert("channels".to_string(), self.num_channels.to_string());
        info.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
        info
    }

    fn frontend_mapping(&self, direction: Direction) -> String {
        self.state.lock().unwrap().mappings[direction.to_wire() as usize].clone()
    }

    fn set_frontend_mapping(&self, direction: Direction, mapping: &str) -> SdrResult<()> {
        self.state.lock().unwrap().mappings[direction.to_wire() as usize] = mapping.to_string();
        Ok(())
    }

    fn num_channels(&self, _direction: Direction) -> usize {
        self.num_channels
    }

    fn channel_info(&self, direction: Direction, channel: usize) -> Kwargs {
        let mut info = Kwargs::new();
        info.insert("channel".to_string(), channel.to_string());
        info.insert(
            "name".to_string(),
            format!("{}-{}{}", self.key, match direction {
                Direction::Rx => "rx",
                Direction::Tx => "tx",
            }, channel),
        );
        info
    }

    fn full_duplex(&self, _direction: Direction, _channel: usize) -> bool {
        true
    }

    fn stream_formats(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        vec!["CS8".to_string(), "CS16".to_string(), "CF32".to_string()]
    }

    fn native_stream_format(&self, _direction: Direction, _channel: usize) -> (String, f64) {
        ("CF32".to_string(), 1.0)
    }

    fn antennas(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        vec!["A".to_string(), "B".to_string()]
    }

    fn antenna(&self, direction: Direction, channel: usize) -> String {
        self.with_channel(direction, channel, |ch| ch.antenna.clone())
    }

    fn set_antenna(&self, direction: Direction, channel: usize, name: &str) -> SdrResult<()> {
        if !self.antennas(direction, channel).iter().any(|a| a == name) {
            return Err(SdrError::ConfigError(format!("no such antenna: {}", name)));
        }
        self.with_channel_mut(direction, channel, |ch| ch.antenna = name.to_string())
    }

    fn gain_names(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        vec!["LNA".to_string(), "PGA".to_string()]
    }

    fn has_gain_mode(&self, _direction: Direction, _channel: usize) -> bool {
        true
    }

    fn gain_mode(&self, direction: Direction, channel: usize) -> bool {
        self.with_channel(direction, channel, |ch| ch.gain_mode)
    }

    fn set_gain_mode(&self, direction: Direction, channel: usize, automatic: bool) -> SdrResult<()> {
        self.with_channel_mut(direction, channel, |ch| ch.gain_mode = automatic)
    }

    fn gain(&self, direction: Direction, channel: usize) -> f64 {
        self.with_channel(direction, channel, |ch| ch.gain)
    }

    fn gain_named(&self, direction: Direction, channel: usize, name: &str) -> f64 {
        self.with_channel(direction, channel, |ch| ch.gains.get(name).copied().unwrap_or(0.0))
    }

    fn set_gain(&self, direction: Direction, channel: usize, gain_db: f64) -> SdrResult<()> {
        self.with_channel_mut(direction, channel, |ch| ch.gain = gain_db)
    }

    fn set_gain_named(
        &self,
        direction: Direction,
        channel: usize,
        name: &str,
        gain_db: f64,
    ) -> SdrResult<()> {
        if !self.gain_names(direction, channel).iter().any(|g| g == name) {
            return Err(SdrError::ConfigError(format!("no such gain: {}", name)));
        }
        self.with_channel_mut(direction, channel, |ch| {
            ch.gains.insert(name.to_string(), gain_db);
        })
    }

    fn gain_range(&self, _direction: Direction, _channel: usize) -> Range {
        Range::new(0.0, 64.0, 0.5)
    }

    fn gain_range_named(&self, _direction: Direction, _channel: usize, name: &str) -> Range {
        match name {
            "LNA" => Range::new(0.0, 32.0, 1.0),
            "PGA" => Range::new(0.0, 32.0, 0.5),
            _ => Range::new(0.0, 0.0, 0.0),
        }
    }

    fn frequency(&self, direction: Direction, channel: usize) -> f64 {
        self.with_channel(direction, channel, |ch| ch.frequency)
    }

    fn frequency_named(&self, direction: Direction, channel: usize, name: &str) -> f64 {
        if name == "RF" {
            self.frequency(direction, channel)
        } else {
            0.0
        }
    }

    fn set_frequency(
        &self,
        direction: Direction,
        channel: usize,
        frequency_hz: f64,
        args: &Kwargs,
    ) -> SdrResult<()> {
        let offset = args
            .get("offset")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0);
        self.with_channel_mut(direction, channel, |ch| ch.frequency = frequency_hz + offset)
    }

    fn set_frequency_named(
        &self,
        direction: Direction,
        channel: usize,
        name: &str,
        frequency_hz: f64,
        args: &Kwargs,
    ) -> SdrResult<()> {
        if name != "RF" {
            return Err(SdrError::ConfigError(format!(
                "no such frequency component: {}",
                name
            )));
        }
        self.set_frequency(direction, channel, frequency_hz, args)
    }

    fn frequency_components(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        vec!["RF".to_string()]
    }

    fn frequency_range(&self, _direction: Direction, _channel: usize) -> Vec<Range> {
        vec![Range::new(0.0, 6e9, 0.0)]
    }

    fn frequency_range_named(
        &self,
        direction: Direction,
        channel: usize,
        name: &str,
    ) -> Vec<Range> {
        if name == "RF" {
            self.frequency_range(direction, channel)
        } else {
            Vec::new()
        }
    }

    fn sample_rate(&self, direction: Direction, channel: usize) -> f64 {
        self.with_channel(direction, channel, |ch| ch.sample_rate)
    }

    fn set_sample_rate(&self, direction: Direction, channel: usize, rate: f64) -> SdrResult<()> {
        if rate <= 0.0 {
            return Err(SdrError::ConfigError(format!("bad sample rate: {}", rate)));
        }
        self.with_channel_mut(direction, channel, |ch| ch.sample_rate = rate)
    }

    fn sample_rate_range(&self, _direction: Direction, _channel: usize) -> Vec<Range> {
        vec![Range::new(1e3, 1e7, 0.0)]
    }

    fn setup_stream(
        &self,
        direction: Direction,
        format: SampleFormat,
        channels: &[usize],
        _args: &Kwargs,
    ) -> SdrResult<StreamHandle> {
        if channels.is_empty() {
            return Err(SdrError::StreamError("empty channel list".to_string()));
        }
        if let Some(&bad) = channels.iter().find(|&&c| c >= self.num_channels) {
            return Err(SdrError::ConfigError(format!("no such channel: {}", bad)));
        }

        let rate = self.sample_rate(direction, channels[0]);
        let mut state = self.state.lock().unwrap();
        let id = state.next_stream;
        state.next_stream += 1;
        state.streams.insert(
            id,
            StreamState {
                format,
                channels: channels.to_vec(),
                rate,
                active: false,
                counter: 0,
            },
        );
        tracing::debug!(stream = id, format = format.tag(), "stream configured");
        Ok(StreamHandle::from_raw(id))
    }

    fn close_stream(&self, stream: StreamHandle) -> SdrResult<()> {
        self.state
            .lock()
            .unwrap()
            .streams
            .remove(&stream.raw())
            .map(|_| ())
            .ok_or_else(|| SdrError::StreamError(format!("unknown stream: {}", stream.raw())))
    }

    fn stream_mtu(&self, _stream: StreamHandle) -> usize {
        16384
    }

    fn activate_stream(&self, stream: StreamHandle) -> SdrResult<()> {
        let mut state = self.state.lock().unwrap();
        let st = state
            .streams
            .get_mut(&stream.raw())
            .ok_or_else(|| SdrError::StreamError(format!("unknown stream: {}", stream.raw())))?;
        if st.active {
            return Err(SdrError::StreamError("stream already active".to_string()));
        }
        st.active = true;
        Ok(())
    }

    fn deactivate_stream(&self, stream: StreamHandle) -> SdrResult<()> {
        let mut state = self.state.lock().unwrap();
        let st = state
            .streams
            .get_mut(&stream.raw())
            .ok_or_else(|| SdrError::StreamError(format!("unknown stream: {}", stream.raw())))?;
        st.active = false;
        Ok(())
    }

    fn read_stream(
        &self,
        stream: StreamHandle,
        buffs: &mut [&mut [u8]],
        num_elems: usize,
        timeout: Duration,
    ) -> SdrResult<usize> {
        let (format, rate, start) = {
            let mut state = self.state.lock().unwrap();
            let st = state
                .streams
                .get_mut(&stream.raw())
                .ok_or_else(|| SdrError::StreamError(format!("unknown stream: {}", stream.raw())))?;
            if !st.active {
                return Err(SdrError::NotStarted);
            }
            if buffs.len() != st.channels.len() {
                return Err(SdrError::StreamError(format!(
                    "expected {} channel buffers, got {}",
                    st.channels.len(),
                    buffs.len()
                )));
            }
            let start = st.counter;
            st.counter += num_elems as u64;
            (st.format, st.rate, start)
        };

        // Pace delivery to the configured rate, bounded by the caller's
        // timeout. The lock is released first so control calls can proceed.
        if rate > 0.0 {
            let wanted = Duration::from_secs_f64(num_elems as f64 / rate);
            thread::sleep(wanted.min(timeout));
        }

        let fb = format.frame_bytes();
        for (c, buf) in buffs.iter_mut().enumerate() {
            if buf.len() < num_elems * fb {
                return Err(SdrError::StreamError("channel buffer too small".to_string()));
            }
            match format {
                SampleFormat::ComplexInt8 | SampleFormat::ComplexInt16 => {
                    for i in 0..num_elems {
                        let value = (start as usize + i + c) as u8;
                        buf[i * fb..(i + 1) * fb].fill(value);
                    }
                }
                SampleFormat::ComplexFloat32 => {
                    for i in 0..num_elems {
                        let phase = TAU * TONE_CYCLES * (c as f64 + 1.0) * (start + i as u64) as f64;
                        let s = Complex::new(phase.cos() as f32, phase.sin() as f32);
                        let off = i * fb;
                        buf[off..off + 4].copy_from_slice(&s.re.to_le_bytes());
                        buf[off + 4..off + 8].copy_from_slice(&s.im.to_le_bytes());
                    }
                }
            }
        }

        Ok(num_elems)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_device(channels: usize) -> LoopbackDevice {
        let mut args = Kwargs::new();
        args.insert("key".to_string(), "testkey".to_string());
        args.insert("channels".to_string(), channels.to_string());
        LoopbackDevice::from_args(&args).unwrap()
    }

    #[test]
    fn test_args_parsing() {
        let dev = make_device(2);
        assert_eq!(dev.hardware_key(), "testkey");
        assert_eq!(dev.num_channels(Direction::Rx), 2);

        let mut bad = Kwargs::new();
        bad.insert("channels".to_string(), "zero".to_string());
        assert!(LoopbackDevice::from_args(&bad).is_err());
    }

    #[test]
    fn test_tuning_is_remembered() {
        let dev = make_device(1);
        dev.set_gain(Direction::Rx, 0, 12.5).unwrap();
        assert_eq!(dev.gain(Direction::Rx, 0), 12.5);

        dev.set_gain_named(Direction::Rx, 0, "LNA", 8.0).unwrap();
        assert_eq!(dev.gain_named(Direction::Rx, 0, "LNA"), 8.0);
        assert!(dev.set_gain_named(Direction::Rx, 0, "BOGUS", 1.0).is_err());

        dev.set_antenna(Direction::Rx, 0, "B").unwrap();
        assert_eq!(dev.antenna(Direction::Rx, 0), "B");
        assert!(dev.set_antenna(Direction::Rx, 0, "C").is_err());

        dev.set_sample_rate(Direction::Rx, 0, 250_000.0).unwrap();
        assert_eq!(dev.sample_rate(Direction::Rx, 0), 250_000.0);
        assert!(dev.set_sample_rate(Direction::Rx, 0, -1.0).is_err());
    }

    #[test]
    fn test_frequency_offset_arg() {
        let dev = make_device(1);
        let mut args = Kwargs::new();
        args.insert("offset".to_string(), "0.5".to_string());
        dev.set_frequency(Direction::Rx, 0, 100e6, &args).unwrap();
        assert_eq!(dev.frequency(Direction::Rx, 0), 100e6 + 0.5);
        assert_eq!(dev.frequency_named(Direction::Rx, 0, "RF"), 100e6 + 0.5);
    }

    #[test]
    fn test_setup_validates_channels() {
        let dev = make_device(2);
        assert!(dev
            .setup_stream(Direction::Rx, SampleFormat::ComplexInt16, &[0, 5], &Kwargs::new())
            .is_err());
        assert!(dev
            .setup_stream(Direction::Rx, SampleFormat::ComplexInt16, &[], &Kwargs::new())
            .is_err());
    }

    #[test]
    fn test_read_requires_activation() {
        let dev = make_device(1);
        let stream = dev
            .setup_stream(Direction::Rx, SampleFormat::ComplexInt16, &[0], &Kwargs::new())
            .unwrap();

        let mut buf = vec![0u8; 64];
        let mut buffs = [&mut buf[..]];
        let err = dev.read_stream(stream, &mut buffs, 4, Duration::from_millis(10));
        assert!(matches!(err, Err(SdrError::NotStarted)));

        dev.activate_stream(stream).unwrap();
        assert!(dev.activate_stream(stream).is_err()); // double activation
        let n = dev
            .read_stream(stream, &mut buffs, 4, Duration::from_millis(10))
            .unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn test_deterministic_pattern() {
        let dev = make_device(2);
        dev.set_sample_rate(Direction::Rx, 0, 1e6).unwrap();
        let stream = dev
            .setup_stream(Direction::Rx, SampleFormat::ComplexInt16, &[0, 1], &Kwargs::new())
            .unwrap();
        dev.activate_stream(stream).unwrap();

        let mut a = vec![0u8; 16];
        let mut b = vec![0u8; 16];
        {
            let mut buffs = [&mut a[..], &mut b[..]];
            let n = dev
                .read_stream(stream, &mut buffs, 4, Duration::from_millis(100))
                .unwrap();
            assert_eq!(n, 4);
        }
        // channel 0: frame i carries byte i; channel 1: byte i + 1
        assert_eq!(&a[..8], &[0, 0, 0, 0, 1, 1, 1, 1]);
        assert_eq!(&b[..8], &[1, 1, 1, 1, 2, 2, 2, 2]);

        // counter advances across reads
        {
            let mut buffs = [&mut a[..], &mut b[..]];
            dev.read_stream(stream, &mut buffs, 4, Duration::from_millis(100))
                .unwrap();
        }
        assert_eq!(&a[..4], &[4, 4, 4, 4]);
    }

    #[test]
    fn test_cf32_tone_starts_at_unity() {
        let dev = make_device(1);
        let stream = dev
            .setup_stream(Direction::Rx, SampleFormat::ComplexFloat32, &[0], &Kwargs::new())
            .unwrap();
        dev.activate_stream(stream).unwrap();

        let mut buf = vec![0u8; 32];
        let mut buffs = [&mut buf[..]];
        dev.read_stream(stream, &mut buffs, 4, Duration::from_millis(100))
            .unwrap();

        let re = f32::from_le_bytes(buf[0..4].try_into().unwrap());
        let im = f32::from_le_bytes(buf[4..8].try_into().unwrap());
        assert!((re - 1.0).abs() < 1e-6);
        assert!(im.abs() < 1e-6);
    }

    #[test]
    fn test_close_invalidates_handle() {
        let dev = make_device(1);
        let stream = dev
            .setup_stream(Direction::Rx, SampleFormat::ComplexInt8, &[0], &Kwargs::new())
            .unwrap();
        dev.close_stream(stream).unwrap();
        assert!(dev.close_stream(stream).is_err());
        assert!(dev.activate_stream(stream).is_err());
    }
}
