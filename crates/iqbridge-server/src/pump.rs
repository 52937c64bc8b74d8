//! Per-stream data pump workers.
//!
//! One thread per activated stream bridges the device's channel-per-buffer
//! read API and the interleaved byte stream on the data socket. The worker
//! owns copies of everything it needs; the only state it shares with the
//! server loop is the stop flag.

use std::io::Write;
use std::net::TcpStream;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use iqbridge_hal::{Direction, SdrDevice, StreamHandle};

/// Device reads block for at most this long, which also bounds how long a
/// stop request can go unnoticed.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Target delivery cadence: reads are sized to roughly this many blocks
/// per second at the negotiated sample rate.
const READS_PER_SEC: f64 = 4.0;

/// Everything a pump worker needs, copied out of the data record at
/// activation time.
pub struct PumpContext {
    pub fd: RawFd,
    pub device: Arc<dyn SdrDevice>,
    pub stream: StreamHandle,
    pub direction: Direction,
    pub sample_rate: f64,
    pub frame_bytes: usize,
    pub channel_count: usize,
    pub socket: TcpStream,
    pub run: Arc<AtomicBool>,
}

/// Start a pump worker thread for the given stream.
pub fn spawn(ctx: PumpContext) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("data-pump-{}", ctx.fd))
        .spawn(move || run(ctx))
}

fn run(mut ctx: PumpContext) {
    if let Err(e) = ctx.device.activate_stream(ctx.stream) {
        tracing::error!(fd = ctx.fd, error = %e, "failed to activate underlying stream");
        return;
    }
    tracing::info!(fd = ctx.fd, "data pump started");

    match ctx.direction {
        Direction::Rx => pump_rx(&mut ctx),
        Direction::Tx => {
            // unfilled slot: samples client to server
            tracing::error!(fd = ctx.fd, "transmit pump not implemented");
        }
    }

    if let Err(e) = ctx.device.deactivate_stream(ctx.stream) {
        tracing::error!(fd = ctx.fd, error = %e, "failed to deactivate underlying stream");
    }
    tracing::info!(fd = ctx.fd, "data pump stopped");
}

/// Read from the device and write interleaved frames to the socket until
/// stopped or either side fails.
fn pump_rx(ctx: &mut PumpContext) {
    let num_elems = ((ctx.sample_rate / READS_PER_SEC) as usize).max(1);
    let blk_size = num_elems * ctx.frame_bytes;
    let buf_size = blk_size * ctx.channel_count;

    // one contiguous region per channel, plus the serialization buffer
    let mut chan_buf = vec![0u8; buf_size];
    let mut net_buf = vec![0u8; buf_size];

    while ctx.run.load(Ordering::SeqCst) {
        let nread = {
            let mut buffs: Vec<&mut [u8]> = chan_buf.chunks_mut(blk_size).collect();
            match ctx
                .device
                .read_stream(ctx.stream, &mut buffs, num_elems, READ_TIMEOUT)
            {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(fd = ctx.fd, error = %e, "error reading underlying stream");
                    break;
                }
            }
        };
        if nread == 0 {
            continue;
        }

        // interleave: channel-major within each sample slot
        let fb = ctx.frame_bytes;
        let mut pos = 0;
        for idx in 0..nread {
            let eoff = idx * fb;
            for chan in 0..ctx.channel_count {
                let src = chan * blk_size + eoff;
                net_buf[pos..pos + fb].copy_from_slice(&chan_buf[src..src + fb]);
                pos += fb;
            }
        }

        if let Err(e) = ctx.socket.write_all(&net_buf[..pos]) {
            tracing::error!(fd = ctx.fd, error = %e, "error writing to network");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iqbridge_hal::{default_registry, Kwargs, SampleFormat};
    use std::io::Read;
    use std::net::TcpListener;

    fn loopback_device(channels: usize) -> Arc<dyn SdrDevice> {
        let mut args = Kwargs::new();
        args.insert("driver".to_string(), "loopback".to_string());
        args.insert("channels".to_string(), channels.to_string());
        default_registry().create(&args).unwrap()
    }

    #[test]
    fn test_rx_pump_interleaves_and_stops() {
        let device = loopback_device(2);
        device
            .set_sample_rate(iqbridge_hal::Direction::Rx, 0, 4000.0)
            .unwrap();
        let stream = device
            .setup_stream(
                iqbridge_hal::Direction::Rx,
                SampleFormat::ComplexInt16,
                &[0, 1],
                &Kwargs::new(),
            )
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let run = Arc::new(AtomicBool::new(true));
        let handle = spawn(PumpContext {
            fd: 0,
            device: device.clone(),
            stream,
            direction: Direction::Rx,
            sample_rate: 4000.0,
            frame_bytes: 4,
            channel_count: 2,
            socket: server_side,
            run: run.clone(),
        })
        .unwrap();

        // one block is 1000 samples x 4 bytes x 2 channels
        let mut block = vec![0u8; 8000];
        client.read_exact(&mut block).unwrap();

        // frame 0: channel 0 then channel 1
        assert_eq!(&block[..4], &[0, 0, 0, 0]);
        assert_eq!(&block[4..8], &[1, 1, 1, 1]);
        // frame 1
        assert_eq!(&block[8..12], &[1, 1, 1, 1]);
        assert_eq!(&block[12..16], &[2, 2, 2, 2]);

        run.store(false, Ordering::SeqCst);
        handle.join().unwrap();

        // the worker deactivated the stream on exit
        assert!(device.deactivate_stream(stream).is_ok());
    }

    #[test]
    fn test_pump_exits_when_activation_fails() {
        let device = loopback_device(1);
        let stream = device
            .setup_stream(
                iqbridge_hal::Direction::Rx,
                SampleFormat::ComplexInt8,
                &[0],
                &Kwargs::new(),
            )
            .unwrap();
        // already active, so the worker's own activation fails and it
        // exits without touching the socket
        device.activate_stream(stream).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let run = Arc::new(AtomicBool::new(true));
        let handle = spawn(PumpContext {
            fd: 0,
            device,
            stream,
            direction: Direction::Rx,
            sample_rate: 4000.0,
            frame_bytes: 2,
            channel_count: 1,
            socket: server_side,
            run,
        })
        .unwrap();
        handle.join().unwrap();
        drop(client);
    }
}
