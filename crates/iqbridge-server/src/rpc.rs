//! Line-oriented text RPC framing.
//!
//! Values are framed as newline-terminated text in the tradition of the
//! simple internet protocols: integers and doubles in decimal, strings
//! verbatim, mappings as `key=value` lines closed by a lone `=`, sequences
//! as one element per line closed by an empty line.
//!
//! The codec latches on the first I/O failure: subsequent reads return
//! sentinels (`-1`, NaN, empty) and writes become no-ops, so a batch of
//! calls can run to completion and the failure be examined once at the
//! end via [`RpcCodec::is_errored`]. The connection is torn down by the
//! dispatch loop on the next failing call read.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};

use iqbridge_hal::Kwargs;

/// Longest legal wire line, including the newline. The protocol carries
/// short identifiers and decimal numbers; anything longer is a violation.
pub const MAX_LINE: usize = 256;

/// Framed reader/writer bound to one control socket.
pub struct RpcCodec {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    errored: bool,
}

impl RpcCodec {
    /// Bind a codec to a socket. The stream is cloned so reads and writes
    /// keep independent cursors; writes are flushed per line.
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        let reader = BufReader::with_capacity(MAX_LINE, stream.try_clone()?);
        Ok(Self {
            reader,
            writer: stream,
            errored: false,
        })
    }

    /// Whether the sticky error latch has been raised.
    pub fn is_errored(&self) -> bool {
        self.errored
    }

    /// The underlying socket's descriptor.
    pub fn as_raw_fd(&self) -> RawFd {
        self.writer.as_raw_fd()
    }

    fn read_line(&mut self) -> Option<String> {
        if self.errored {
            return None;
        }
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => {
                tracing::trace!(fd = self.as_raw_fd(), "EOF on RPC socket");
                self.errored = true;
                None
            }
            Ok(_) => {
                if line.len() > MAX_LINE {
                    tracing::trace!(fd = self.as_raw_fd(), len = line.len(), "over-long line");
                    self.errored = true;
                    return None;
                }
                if line.ends_with('\n') {
                    line.pop();
                }
                Some(line)
            }
            Err(e) => {
                tracing::trace!(fd = self.as_raw_fd(), error = %e, "failed to read line");
                self.errored = true;
                None
            }
        }
    }

    fn write_line(&mut self, line: &str) {
        if self.errored {
            return;
        }
        let result = writeln!(self.writer, "{}", line).and_then(|_| self.writer.flush());
        if let Err(e) = result {
            tracing::trace!(fd = self.as_raw_fd(), error = %e, "failed to write line");
            self.errored = true;
        }
    }

    /// Read one integer line. Returns `-1` on I/O failure or an empty or
    /// unparsable line.
    pub fn read_int(&mut self) -> i32 {
        match self.read_line() {
            Some(line) => line.trim().parse().unwrap_or_else(|_| {
                tracing::trace!(line = %line, "not an integer");
                -1
            }),
            None => -1,
        }
    }

    /// Read one floating-point line. Returns NaN on failure.
    pub fn read_double(&mut self) -> f64 {
        match self.read_line() {
            Some(line) => line.trim().parse().unwrap_or(f64::NAN),
            None => f64::NAN,
        }
    }

    /// Read one string line (without its newline). Returns empty on failure.
    pub fn read_string(&mut self) -> String {
        self.read_line().unwrap_or_default()
    }

    /// Read a mapping. `key=value` per line; any line shorter than two
    /// characters (the lone `=` or an empty line) terminates; a line with
    /// no `=` is logged and skipped.
    pub fn read_kwargs(&mut self) -> Kwargs {
        let mut args = Kwargs::new();
        loop {
            let line = self.read_string();
            if line.len() < 2 {
                break;
            }
            match line.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    args.insert(key.to_string(), value.to_string());
                }
                _ => {
                    tracing::debug!(line = %line, "ignored invalid mapping line");
                }
            }
        }
        args
    }

    /// Read a string sequence, one element per line, terminated by an
    /// empty line.
    pub fn read_str_sequence(&mut self) -> Vec<String> {
        let mut seq = Vec::new();
        loop {
            let line = self.read_string();
            if line.is_empty() {
                break;
            }
            seq.push(line);
        }
        seq
    }

    /// Write one integer line.
    pub fn write_int(&mut self, value: i32) {
        self.write_line(&value.to_string());
    }

    /// Write one floating-point line.
    pub fn write_double(&mut self, value: f64) {
        self.write_line(&value.to_string());
    }

    /// Write one string line. The value must not contain a newline;
    /// hardware keys, format tags and info values never do.
    pub fn write_string(&mut self, value: &str) {
        self.write_line(value);
    }

    /// Write a mapping: `key=value` per line, then the `=` terminator.
    pub fn write_kwargs(&mut self, args: &Kwargs) {
        for (key, value) in args {
            self.write_line(&format!("{}={}", key, value));
        }
        self.write_line("=");
    }

    /// Write a string sequence, then the empty terminator line.
    pub fn write_str_sequence(&mut self, seq: &[String]) {
        for item in seq {
            self.write_line(item);
        }
        self.write_line("");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn codec_pair() -> (RpcCodec, RpcCodec) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (RpcCodec::new(client).unwrap(), RpcCodec::new(server).unwrap())
    }

    #[test]
    fn test_int_roundtrip() {
        let (mut a, mut b) = codec_pair();
        for v in [0, 1, -1, 42, i32::MAX, i32::MIN] {
            a.write_int(v);
            assert_eq!(b.read_int(), v);
        }
        assert!(!a.is_errored());
        assert!(!b.is_errored());
    }

    #[test]
    fn test_double_roundtrip() {
        let (mut a, mut b) = codec_pair();
        for v in [0.0, 1.5, -2.25, 1e6, 0.001, -1.0] {
            a.write_double(v);
            assert_eq!(b.read_double(), v);
        }
    }

    #[test]
    fn test_string_roundtrip() {
        let (mut a, mut b) = codec_pair();
        a.write_string("testkey");
        a.write_string("with spaces and = signs");
        assert_eq!(b.read_string(), "testkey");
        assert_eq!(b.read_string(), "with spaces and = signs");
    }

    #[test]
    fn test_kwargs_roundtrip() {
        let (mut a, mut b) = codec_pair();
        let mut args = Kwargs::new();
        args.insert("driver".to_string(), "loopback".to_string());
        args.insert("serial".to_string(), "1234".to_string());
        a.write_kwargs(&args);
        assert_eq!(b.read_kwargs(), args);

        a.write_kwargs(&Kwargs::new());
        assert!(b.read_kwargs().is_empty());
    }

    #[test]
    fn test_kwargs_skips_invalid_line() {
        let (mut a, mut b) = codec_pair();
        a.write_string("noequals");
        a.write_string("offset=0.5");
        a.write_string("=");
        let args = b.read_kwargs();
        assert_eq!(args.len(), 1);
        assert_eq!(args.get("offset").map(String::as_str), Some("0.5"));
    }

    #[test]
    fn test_kwargs_short_line_terminates() {
        let (mut a, mut b) = codec_pair();
        a.write_string("k=v");
        a.write_string(""); // empty line is also a terminator
        let args = b.read_kwargs();
        assert_eq!(args.get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn test_str_sequence_roundtrip() {
        let (mut a, mut b) = codec_pair();
        let seq = vec!["CS8".to_string(), "CS16".to_string(), "CF32".to_string()];
        a.write_str_sequence(&seq);
        assert_eq!(b.read_str_sequence(), seq);

        a.write_str_sequence(&[]);
        assert!(b.read_str_sequence().is_empty());
    }

    #[test]
    fn test_sticky_error_on_peer_close() {
        let (a, mut b) = codec_pair();
        drop(a);
        assert_eq!(b.read_int(), -1);
        assert!(b.is_errored());
        // all subsequent reads yield sentinels without touching the socket
        assert!(b.read_double().is_nan());
        assert_eq!(b.read_string(), "");
        assert!(b.read_kwargs().is_empty());
        assert!(b.read_str_sequence().is_empty());
        // writes are silent no-ops
        b.write_int(5);
        assert!(b.is_errored());
    }

    #[test]
    fn test_over_long_line_is_a_violation() {
        let (mut a, mut b) = codec_pair();
        a.write_string(&"x".repeat(MAX_LINE));
        assert_eq!(b.read_string(), "");
        assert!(b.is_errored());
    }

    #[test]
    fn test_unparsable_int_is_sentinel_not_sticky() {
        let (mut a, mut b) = codec_pair();
        a.write_string("not-a-number");
        a.write_int(7);
        assert_eq!(b.read_int(), -1);
        assert!(!b.is_errored());
        assert_eq!(b.read_int(), 7);
    }
}
