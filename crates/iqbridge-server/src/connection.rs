//! Connection records and the fd-keyed connection table.
//!
//! The table is a plain value owned by the server loop; the loop is its
//! only mutator. A pump worker never sees the table: at activation it
//! receives copies of the fields it needs plus the shared stop flag.

use std::collections::BTreeMap;
use std::net::TcpStream;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use iqbridge_hal::{Direction, SdrDevice, StreamHandle};

use crate::rpc::RpcCodec;

/// What a socket in the table is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Carries framed RPC calls for one device.
    Control,
    /// Carries raw sample bytes, server to client.
    DataOut,
    /// Carries raw sample bytes, client to server.
    DataIn,
}

/// A running pump worker: the stop flag it watches and its join handle.
///
/// The flag is published `true` before the thread is spawned so a promptly
/// scheduled worker can never observe a stop request that was never made;
/// the join handle is stored right after the spawn.
pub struct PumpWorker {
    pub run: Arc<AtomicBool>,
    pub handle: Option<JoinHandle<()>>,
}

impl PumpWorker {
    /// Request shutdown and wait for the worker to finish. Returns false
    /// if there was no thread to join or it panicked.
    pub fn stop(mut self) -> bool {
        self.run.store(false, Ordering::SeqCst);
        match self.handle.take() {
            Some(handle) => handle.join().is_ok(),
            None => false,
        }
    }
}

/// One open socket.
///
/// Control records carry a codec and the device made at driver load. Data
/// records carry the raw socket; their device, direction and stream fields
/// stay unset until a stream setup names them.
pub struct ConnectionRecord {
    pub kind: ConnectionKind,
    pub codec: Option<RpcCodec>,
    pub socket: Option<TcpStream>,
    pub device: Option<Arc<dyn SdrDevice>>,
    pub direction: Option<Direction>,
    /// Samples per second, remembered from the last sample-rate call on a
    /// control record, copied to the data record at stream setup.
    pub sample_rate: f64,
    /// Bytes per sample per channel, from the negotiated wire format.
    pub frame_bytes: usize,
    pub channel_count: usize,
    pub stream: Option<StreamHandle>,
    pub worker: Option<PumpWorker>,
}

impl ConnectionRecord {
    /// A control record: codec plus the device it operates.
    pub fn control(codec: RpcCodec, device: Arc<dyn SdrDevice>) -> Self {
        Self {
            kind: ConnectionKind::Control,
            codec: Some(codec),
            socket: None,
            device: Some(device),
            direction: None,
            sample_rate: 0.0,
            frame_bytes: 0,
            channel_count: 0,
            stream: None,
            worker: None,
        }
    }

    /// A data record: just the socket until stream setup binds it.
    pub fn data(kind: ConnectionKind, socket: TcpStream) -> Self {
        Self {
            kind,
            codec: None,
            socket: Some(socket),
            device: None,
            direction: None,
            sample_rate: 0.0,
            frame_bytes: 0,
            channel_count: 0,
            stream: None,
            worker: None,
        }
    }

    pub fn is_control(&self) -> bool {
        self.kind == ConnectionKind::Control
    }
}

/// Mapping from socket descriptor to connection record.
#[derive(Default)]
pub struct ConnectionTable {
    records: BTreeMap<RawFd, ConnectionRecord>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fd: RawFd, record: ConnectionRecord) {
        self.records.insert(fd, record);
    }

    pub fn get(&self, fd: RawFd) -> Option<&ConnectionRecord> {
        self.records.get(&fd)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut ConnectionRecord> {
        self.records.get_mut(&fd)
    }

    pub fn remove(&mut self, fd: RawFd) -> Option<ConnectionRecord> {
        self.records.remove(&fd)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.records.contains_key(&fd)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RawFd, &ConnectionRecord)> {
        self.records.iter().map(|(fd, rec)| (*fd, rec))
    }

    /// Descriptors of every control record, for the readiness set.
    pub fn control_fds(&self) -> Vec<RawFd> {
        self.records
            .iter()
            .filter(|(_, rec)| rec.is_control())
            .map(|(fd, _)| *fd)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn socket() -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let _ = listener.accept().unwrap();
        stream
    }

    #[test]
    fn test_table_insert_lookup_remove() {
        let mut table = ConnectionTable::new();
        assert!(table.is_empty());

        table.insert(5, ConnectionRecord::data(ConnectionKind::DataOut, socket()));
        assert!(table.contains(5));
        assert!(!table.contains(6));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(5).unwrap().kind, ConnectionKind::DataOut);

        assert!(table.remove(5).is_some());
        assert!(table.remove(5).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_control_fds_excludes_data_records() {
        let mut table = ConnectionTable::new();
        table.insert(3, ConnectionRecord::data(ConnectionKind::DataOut, socket()));
        table.insert(4, ConnectionRecord::data(ConnectionKind::DataIn, socket()));
        assert!(table.control_fds().is_empty());
    }

    #[test]
    fn test_data_record_starts_unbound() {
        let rec = ConnectionRecord::data(ConnectionKind::DataIn, socket());
        assert!(rec.codec.is_none());
        assert!(rec.socket.is_some());
        assert!(rec.device.is_none());
        assert!(rec.direction.is_none());
        assert!(rec.stream.is_none());
        assert!(rec.worker.is_none());
        assert_eq!(rec.sample_rate, 0.0);
    }
}
