//! RPC handlers, one per operation code.
//!
//! Most are thin forwarders: read the typed arguments in wire order, call
//! the device, write the typed reply. Arguments are always read into named
//! bindings before the device call: the wire order is the contract, and
//! nesting reads inside a call expression invites evaluation-order bugs.
//!
//! Setter replies are a success token, not a result code: a device-side
//! failure is logged and the wire still carries `0`. Stateful handlers
//! (stream setup, activate/deactivate, close, MTU) reply distinct negative
//! codes for their failure cases; positive or zero means success.

use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use iqbridge_hal::{Direction, Range, SampleFormat, SdrDevice};

use crate::connection::{ConnectionTable, PumpWorker};
use crate::protocol::RpcCall;
use crate::pump::{self, PumpContext};
use crate::rpc::RpcCodec;

/// Dispatch one decoded call against the control connection's codec and
/// device. `fd` keys the control record (for the remembered sample rate);
/// the table is needed by the cross-record stream handlers.
pub fn handle(
    call: RpcCall,
    codec: &mut RpcCodec,
    device: &Arc<dyn SdrDevice>,
    table: &mut ConnectionTable,
    fd: RawFd,
) {
    use RpcCall::*;
    let dev = device.as_ref();
    match call {
        GetHardwareKey => get_hardware_key(codec, dev),
        GetHardwareInfo => get_hardware_info(codec, dev),
        GetFrontendMapping => get_frontend_mapping(codec, dev),
        SetFrontendMapping => set_frontend_mapping(codec, dev),
        GetNumChannels => get_num_channels(codec, dev),
        GetChannelInfo => get_channel_info(codec, dev),
        GetFullDuplex => get_full_duplex(codec, dev),
        GetStreamFormats => get_stream_formats(codec, dev),
        GetNativeStreamFormat => get_native_stream_format(codec, dev),
        SetupStream => setup_stream(codec, device, table, fd),
        ActivateStream => activate_stream(codec, table),
        DeactivateStream => deactivate_stream(codec, table),
        CloseStream => close_stream(codec, table),
        GetStreamMtu => get_stream_mtu(codec, dev, table),
        GetStreamArgsInfo => get_stream_args_info(codec),
        ListAntennas => list_antennas(codec, dev),
        GetAntenna => get_antenna(codec, dev),
        SetAntenna => set_antenna(codec, dev),
        ListGains => list_gains(codec, dev),
        HasGainMode => has_gain_mode(codec, dev),
        GetGainRange => get_gain_range(codec, dev),
        GetGainRangeNamed => get_gain_range_named(codec, dev),
        GetGainMode => get_gain_mode(codec, dev),
        SetGainMode => set_gain_mode(codec, dev),
        GetGain => get_gain(codec, dev),
        SetGain => set_gain(codec, dev),
        GetGainNamed => get_gain_named(codec, dev),
        SetGainNamed => set_gain_named(codec, dev),
        GetSampleRate => get_sample_rate(codec, dev, table, fd),
        GetSampleRateRange => get_sample_rate_range(codec, dev),
        SetSampleRate => set_sample_rate(codec, dev, table, fd),
        GetFrequency => get_frequency(codec, dev),
        SetFrequency => set_frequency(codec, dev),
        GetFrequencyNamed => get_frequency_named(codec, dev),
        SetFrequencyNamed => set_frequency_named(codec, dev),
        ListFrequencies => list_frequencies(codec, dev),
        GetFrequencyRange => get_frequency_range(codec, dev),
        GetFrequencyRangeNamed => get_frequency_range_named(codec, dev),
        // released by the dispatch loop before handlers are reached
        Drop => {}
    }
}

/// Parse the space-separated channel list of a stream setup. Malformed
/// tokens come out as channel 0, and the list is never empty.
pub fn parse_channels(list: &str) -> Vec<usize> {
    list.split(' ')
        .map(|tok| tok.trim().parse().unwrap_or(0))
        .collect()
}

/// Serialize ranges as (min, max, step) triples closed by the sentinel
/// triple (0, 0, -1). Present even for an empty list.
fn write_range_list(codec: &mut RpcCodec, ranges: &[Range]) {
    for r in ranges {
        codec.write_double(r.minimum);
        codec.write_double(r.maximum);
        codec.write_double(r.step);
    }
    codec.write_double(0.0);
    codec.write_double(0.0);
    codec.write_double(-1.0);
}

fn get_hardware_key(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    codec.write_string(&dev.hardware_key());
}

fn get_hardware_info(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    codec.write_kwargs(&dev.hardware_info());
}

fn get_frontend_mapping(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    codec.write_string(&dev.frontend_mapping(Direction::from_wire(dir)));
}

fn set_frontend_mapping(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let mapping = codec.read_string();
    if let Err(e) = dev.set_frontend_mapping(Direction::from_wire(dir), &mapping) {
        tracing::error!(error = %e, "set_frontend_mapping failed");
    }
    codec.write_int(0);
}

fn get_num_channels(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    codec.write_int(dev.num_channels(Direction::from_wire(dir)) as i32);
}

fn get_channel_info(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    codec.write_kwargs(&dev.channel_info(Direction::from_wire(dir), chn as usize));
}

fn get_full_duplex(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    codec.write_int(dev.full_duplex(Direction::from_wire(dir), chn as usize) as i32);
}

fn get_stream_formats(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    let formats = dev.stream_formats(Direction::from_wire(dir), chn as usize);
    codec.write_str_sequence(&formats);
}

fn get_native_stream_format(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    let (format, full_scale) = dev.native_stream_format(Direction::from_wire(dir), chn as usize);
    codec.write_string(&format);
    codec.write_double(full_scale);
}

fn get_stream_args_info(codec: &mut RpcCodec) {
    // skeleton: no stream args are advertised
    let _dir = codec.read_int();
    let _chn = codec.read_int();
    codec.write_str_sequence(&[]);
}

/// Bind a previously connected data socket to a device stream.
///
/// Replies the data id on success, or: `-1` unknown data id, `-2` unknown
/// wire format, `-3` sample rate not set on this control connection, `-4`
/// device stream setup failure.
fn setup_stream(
    codec: &mut RpcCodec,
    device: &Arc<dyn SdrDevice>,
    table: &mut ConnectionTable,
    fd: RawFd,
) {
    let data_id = codec.read_int();
    let dir = codec.read_int();
    let format_tag = codec.read_string();
    let channel_list = codec.read_string();
    let args = codec.read_kwargs();

    // the client must connect the data socket first
    if !table.contains(data_id) {
        tracing::error!(data_id, "setup_stream: no such data stream id");
        codec.write_int(-1);
        return;
    }
    let format = match SampleFormat::from_tag(&format_tag) {
        Some(f) => f,
        None => {
            tracing::error!(format = %format_tag, "setup_stream: unknown sample format");
            codec.write_int(-2);
            return;
        }
    };
    let rate = table.get(fd).map(|rec| rec.sample_rate).unwrap_or(0.0);
    if !(rate > 0.0) {
        tracing::error!("setup_stream: sample rate not set for connection");
        codec.write_int(-3);
        return;
    }

    let direction = Direction::from_wire(dir);
    let channels = parse_channels(&channel_list);

    let stream = match device.setup_stream(direction, format, &channels, &args) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "setup_stream: failed to create underlying stream");
            codec.write_int(-4);
            return;
        }
    };

    // bind the data record; the pump reads these copies, never the
    // control record
    let data = match table.get_mut(data_id) {
        Some(data) => data,
        None => {
            codec.write_int(-1);
            return;
        }
    };
    data.device = Some(device.clone());
    data.direction = Some(direction);
    data.sample_rate = rate;
    data.frame_bytes = format.frame_bytes();
    data.channel_count = channels.len();
    data.stream = Some(stream);

    tracing::info!(data_id, format = format.tag(), channels = channels.len(), "stream configured");
    codec.write_int(data_id);
}

/// Start the pump worker for a data record. Replies `0`, `-1` for an
/// unknown id, `-2` when the worker cannot be started.
fn activate_stream(codec: &mut RpcCodec, table: &mut ConnectionTable) {
    let data_id = codec.read_int();

    let data = match table.get_mut(data_id) {
        Some(data) => data,
        None => {
            tracing::error!(data_id, "activate_stream: no such data stream id");
            codec.write_int(-1);
            return;
        }
    };
    let (device, stream, direction) = match (&data.device, data.stream, data.direction) {
        (Some(device), Some(stream), Some(direction)) => (device.clone(), stream, direction),
        _ => {
            tracing::error!(data_id, "activate_stream: stream not set up");
            codec.write_int(-2);
            return;
        }
    };
    if data.worker.is_some() {
        tracing::error!(data_id, "activate_stream: pump already running");
        codec.write_int(-2);
        return;
    }
    let socket = match data.socket.as_ref().map(|s| s.try_clone()) {
        Some(Ok(socket)) => socket,
        _ => {
            tracing::error!(data_id, "activate_stream: no usable data socket");
            codec.write_int(-2);
            return;
        }
    };

    // publish a non-stopped state before the thread exists, so a promptly
    // scheduled worker cannot observe a stop that was never requested
    let run = Arc::new(AtomicBool::new(true));
    data.worker = Some(PumpWorker {
        run: run.clone(),
        handle: None,
    });

    let ctx = PumpContext {
        fd: data_id,
        device,
        stream,
        direction,
        sample_rate: data.sample_rate,
        frame_bytes: data.frame_bytes,
        channel_count: data.channel_count,
        socket,
        run,
    };
    match pump::spawn(ctx) {
        Ok(handle) => {
            if let Some(worker) = data.worker.as_mut() {
                worker.handle = Some(handle);
            }
            codec.write_int(0);
        }
        Err(e) => {
            tracing::error!(data_id, error = %e, "activate_stream: failed to start pump thread");
            data.worker = None;
            codec.write_int(-2);
        }
    }
}

/// Stop and join the pump worker. Replies `0`, `-1` for an unknown id,
/// `-2` when there is no worker to join or the join fails.
fn deactivate_stream(codec: &mut RpcCodec, table: &mut ConnectionTable) {
    let data_id = codec.read_int();

    let data = match table.get_mut(data_id) {
        Some(data) => data,
        None => {
            tracing::error!(data_id, "deactivate_stream: no such data stream id");
            codec.write_int(-1);
            return;
        }
    };
    let worker = match data.worker.take() {
        Some(worker) => worker,
        None => {
            tracing::error!(data_id, "deactivate_stream: pump not running");
            codec.write_int(-2);
            return;
        }
    };
    if worker.stop() {
        codec.write_int(0);
    } else {
        tracing::error!(data_id, "deactivate_stream: failed to join pump thread");
        codec.write_int(-2);
    }
}

/// Close the device stream behind a data record and discard the record.
/// No reply.
fn close_stream(codec: &mut RpcCodec, table: &mut ConnectionTable) {
    let data_id = codec.read_int();

    let mut data = match table.remove(data_id) {
        Some(data) => data,
        None => {
            tracing::error!(data_id, "close_stream: no such data stream id");
            return;
        }
    };
    if let Some(worker) = data.worker.take() {
        worker.stop();
    }
    if let (Some(device), Some(stream)) = (&data.device, data.stream) {
        if let Err(e) = device.close_stream(stream) {
            tracing::error!(data_id, error = %e, "close_stream: device close failed");
        }
    }
    // dropping the record closes the data socket
    tracing::info!(data_id, "closed data connection");
}

/// Reply the device MTU for a data record's stream, or `-1` when the id
/// is unknown or no stream is set up.
fn get_stream_mtu(codec: &mut RpcCodec, dev: &dyn SdrDevice, table: &mut ConnectionTable) {
    let data_id = codec.read_int();

    let stream = table.get(data_id).and_then(|data| data.stream);
    match stream {
        Some(stream) => codec.write_int(dev.stream_mtu(stream) as i32),
        None => {
            tracing::error!(data_id, "get_stream_mtu: no such data stream id");
            codec.write_int(-1);
        }
    }
}

fn list_antennas(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    let antennas = dev.antennas(Direction::from_wire(dir), chn as usize);
    codec.write_str_sequence(&antennas);
}

fn get_antenna(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    codec.write_string(&dev.antenna(Direction::from_wire(dir), chn as usize));
}

fn set_antenna(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    let name = codec.read_string();
    if let Err(e) = dev.set_antenna(Direction::from_wire(dir), chn as usize, &name) {
        tracing::error!(error = %e, "set_antenna failed");
    }
    codec.write_int(0);
}

fn list_gains(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    let gains = dev.gain_names(Direction::from_wire(dir), chn as usize);
    codec.write_str_sequence(&gains);
}

fn has_gain_mode(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    codec.write_int(dev.has_gain_mode(Direction::from_wire(dir), chn as usize) as i32);
}

fn get_gain_mode(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    codec.write_int(dev.gain_mode(Direction::from_wire(dir), chn as usize) as i32);
}

fn set_gain_mode(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    let automatic = codec.read_int();
    if let Err(e) = dev.set_gain_mode(Direction::from_wire(dir), chn as usize, automatic > 0) {
        tracing::error!(error = %e, "set_gain_mode failed");
    }
    codec.write_int(0);
}

fn get_gain(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    codec.write_double(dev.gain(Direction::from_wire(dir), chn as usize));
}

fn set_gain(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    let gain = codec.read_double();
    if let Err(e) = dev.set_gain(Direction::from_wire(dir), chn as usize, gain) {
        tracing::error!(error = %e, "set_gain failed");
    }
    codec.write_int(0);
}

fn get_gain_named(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    let name = codec.read_string();
    codec.write_double(dev.gain_named(Direction::from_wire(dir), chn as usize, &name));
}

fn set_gain_named(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    let name = codec.read_string();
    let gain = codec.read_double();
    if let Err(e) = dev.set_gain_named(Direction::from_wire(dir), chn as usize, &name, gain) {
        tracing::error!(error = %e, "set_gain_named failed");
    }
    codec.write_int(0);
}

fn get_gain_range(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    let range = dev.gain_range(Direction::from_wire(dir), chn as usize);
    write_range_list(codec, &[range]);
}

fn get_gain_range_named(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    let name = codec.read_string();
    let range = dev.gain_range_named(Direction::from_wire(dir), chn as usize, &name);
    write_range_list(codec, &[range]);
}

/// Remembers the rate on the control record: stream setup requires it.
fn set_sample_rate(
    codec: &mut RpcCodec,
    dev: &dyn SdrDevice,
    table: &mut ConnectionTable,
    fd: RawFd,
) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    let rate = codec.read_double();
    if let Err(e) = dev.set_sample_rate(Direction::from_wire(dir), chn as usize, rate) {
        tracing::error!(error = %e, "set_sample_rate failed");
    }
    if let Some(rec) = table.get_mut(fd) {
        rec.sample_rate = rate;
    }
    codec.write_int(0);
}

/// Refreshes the remembered rate in case the device adjusted it.
fn get_sample_rate(
    codec: &mut RpcCodec,
    dev: &dyn SdrDevice,
    table: &mut ConnectionTable,
    fd: RawFd,
) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    let rate = dev.sample_rate(Direction::from_wire(dir), chn as usize);
    if let Some(rec) = table.get_mut(fd) {
        rec.sample_rate = rate;
    }
    codec.write_double(rate);
}

fn get_sample_rate_range(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    let ranges = dev.sample_rate_range(Direction::from_wire(dir), chn as usize);
    write_range_list(codec, &ranges);
}

fn get_frequency(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    codec.write_double(dev.frequency(Direction::from_wire(dir), chn as usize));
}

fn set_frequency(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    let freq = codec.read_double();
    let args = codec.read_kwargs();
    if let Err(e) = dev.set_frequency(Direction::from_wire(dir), chn as usize, freq, &args) {
        tracing::error!(error = %e, "set_frequency failed");
    }
    codec.write_int(0);
}

fn get_frequency_named(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    let name = codec.read_string();
    codec.write_double(dev.frequency_named(Direction::from_wire(dir), chn as usize, &name));
}

fn set_frequency_named(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    let name = codec.read_string();
    let freq = codec.read_double();
    let args = codec.read_kwargs();
    if let Err(e) =
        dev.set_frequency_named(Direction::from_wire(dir), chn as usize, &name, freq, &args)
    {
        tracing::error!(error = %e, "set_frequency_named failed");
    }
    codec.write_int(0);
}

fn list_frequencies(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    let components = dev.frequency_components(Direction::from_wire(dir), chn as usize);
    codec.write_str_sequence(&components);
}

fn get_frequency_range(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    let ranges = dev.frequency_range(Direction::from_wire(dir), chn as usize);
    write_range_list(codec, &ranges);
}

fn get_frequency_range_named(codec: &mut RpcCodec, dev: &dyn SdrDevice) {
    let dir = codec.read_int();
    let chn = codec.read_int();
    let name = codec.read_string();
    let ranges = dev.frequency_range_named(Direction::from_wire(dir), chn as usize, &name);
    write_range_list(codec, &ranges);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn test_parse_channels() {
        assert_eq!(parse_channels("0"), vec![0]);
        assert_eq!(parse_channels("0 1"), vec![0, 1]);
        assert_eq!(parse_channels("2 0 3"), vec![2, 0, 3]);
        // malformed tokens come out as channel 0, never dropped
        assert_eq!(parse_channels(""), vec![0]);
        assert_eq!(parse_channels("1 x"), vec![1, 0]);
    }

    #[test]
    fn test_range_list_sentinel() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let mut writer = RpcCodec::new(server).unwrap();
        let mut reader = RpcCodec::new(client).unwrap();

        write_range_list(&mut writer, &[Range::new(0.0, 64.0, 0.5)]);
        assert_eq!(reader.read_double(), 0.0);
        assert_eq!(reader.read_double(), 64.0);
        assert_eq!(reader.read_double(), 0.5);
        assert_eq!(reader.read_double(), 0.0);
        assert_eq!(reader.read_double(), 0.0);
        assert_eq!(reader.read_double(), -1.0);

        // an empty list is just the sentinel
        write_range_list(&mut writer, &[]);
        assert_eq!(reader.read_double(), 0.0);
        assert_eq!(reader.read_double(), 0.0);
        assert_eq!(reader.read_double(), -1.0);
    }
}
