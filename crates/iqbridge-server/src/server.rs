//! The accept/dispatch loop.
//!
//! Single-threaded and poll-driven: each iteration watches the listening
//! socket plus every control socket for readability. New connections are
//! typed by their first byte; ready control sockets get one RPC call
//! dispatched. Data sockets are never polled here; they belong to their
//! pump workers.
//!
//! Error policy: device-level failures are reported to the client as
//! negative reply codes and the loop carries on. A desynced control socket
//! (EOF or garbage where a call code belongs) is fatal: the framing on
//! that wire can no longer be trusted, and the process exits rather than
//! guess.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::Arc;

use iqbridge_hal::{DriverRegistry, Kwargs, SdrDevice};

use crate::connection::{ConnectionKind, ConnectionRecord, ConnectionTable};
use crate::handlers;
use crate::protocol::{conn, RpcCall, UNKNOWN_CALL};
use crate::rpc::RpcCodec;

/// Fatal server failures, mapped onto process exit codes.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("cannot parse listen host: {0}")]
    AddrParse(String),

    #[error("cannot bind {0}: {1}")]
    Bind(String, io::Error),

    #[error("error waiting for input: {0}")]
    Poll(io::Error),

    #[error("fatal error on RPC dispatch")]
    Dispatch,
}

impl ServerError {
    /// The process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerError::AddrParse(_) => 1,
            ServerError::Bind(..) => 2,
            ServerError::Poll(_) => 3,
            ServerError::Dispatch => 4,
        }
    }
}

/// The connection-multiplexing RPC server. Owns the listening socket, the
/// connection table and the driver registry.
pub struct Server {
    listener: TcpListener,
    table: ConnectionTable,
    registry: DriverRegistry,
}

impl Server {
    /// Resolve `host:port` and open the listening socket with
    /// address-reuse enabled.
    pub fn bind(host: &str, port: u16, registry: DriverRegistry) -> Result<Self, ServerError> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|_| ServerError::AddrParse(host.to_string()))?
            .find_map(|a| match a {
                SocketAddr::V4(v4) => Some(v4),
                SocketAddr::V6(_) => None,
            })
            .ok_or_else(|| ServerError::AddrParse(host.to_string()))?;

        let listener =
            listen_reuseaddr(addr).map_err(|e| ServerError::Bind(addr.to_string(), e))?;

        Ok(Self {
            listener,
            table: ConnectionTable::new(),
            registry,
        })
    }

    /// The bound listen address (useful with port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until the listen socket dies (clean shutdown) or a fatal error.
    pub fn run(&mut self) -> Result<(), ServerError> {
        loop {
            // readiness set: the listener plus every control socket
            let mut pfds: Vec<libc::pollfd> = Vec::with_capacity(self.table.len() + 1);
            pfds.push(libc::pollfd {
                fd: self.listener.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            for fd in self.table.control_fds() {
                pfds.push(libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                });
            }

            let rv = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) };
            if rv < 0 {
                let e = io::Error::last_os_error();
                tracing::error!(error = %e, "error waiting for input");
                return Err(ServerError::Poll(e));
            }

            if pfds[0].revents != 0 && !self.handle_listen(pfds[0].revents) {
                break;
            }
            for pfd in &pfds[1..] {
                if pfd.revents != 0 {
                    self.dispatch(pfd.fd, pfd.revents)?;
                }
            }
        }

        tracing::info!("listen socket closed, shutting down");
        Ok(())
    }

    /// Accept and classify one connection. Returns false when the listen
    /// socket is done for and the loop should end.
    fn handle_listen(&mut self, revents: i16) -> bool {
        if revents & (libc::POLLERR | libc::POLLHUP) != 0 {
            tracing::error!("EOF or error on listen socket");
            return false;
        }
        if revents & libc::POLLIN == 0 {
            return true;
        }

        let (mut stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(error = %e, "error accepting connection");
                return false;
            }
        };

        // one ASCII digit plus newline types the connection
        let mut kind = [0u8; 2];
        if let Err(e) = stream.read_exact(&mut kind) {
            tracing::error!(%peer, error = %e, "error reading connection type");
            return false;
        }
        match kind[0] {
            conn::DRIVER_LOAD => self.create_control(stream),
            conn::DATA_OUT => self.create_data(stream, ConnectionKind::DataOut),
            conn::DATA_IN => self.create_data(stream, ConnectionKind::DataIn),
            other => {
                tracing::info!(%peer, kind = other, "unknown connection type, closing");
            }
        }
        true
    }

    /// Driver load: read the driver name and its `/`-separated args, make
    /// the device, reply with the connection id (or -1 and close).
    fn create_control(&mut self, stream: TcpStream) {
        let fd = stream.as_raw_fd();
        let mut codec = match RpcCodec::new(stream) {
            Ok(codec) => codec,
            Err(e) => {
                tracing::error!(error = %e, "failed to attach codec to control socket");
                return;
            }
        };

        let driver = codec.read_string();
        let args = codec.read_string();
        let mut kwargs = parse_driver_args(&args);
        kwargs.insert("driver".to_string(), driver);

        match self.registry.create(&kwargs) {
            Ok(device) => {
                codec.write_int(fd);
                self.table.insert(fd, ConnectionRecord::control(codec, device));
                tracing::info!(fd, "new control connection");
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to create device");
                codec.write_int(-1);
                // dropping the codec closes the socket
            }
        }
    }

    /// Data connection: record it and reply the id directly on the raw
    /// socket (a read-only data connection has no framed writer).
    fn create_data(&mut self, mut stream: TcpStream, kind: ConnectionKind) {
        let fd = stream.as_raw_fd();
        if let Err(e) = stream.write_all(format!("{}\n", fd).as_bytes()) {
            tracing::error!(error = %e, "failed to reply on data connection");
            return;
        }
        self.table.insert(fd, ConnectionRecord::data(kind, stream));
        tracing::info!(fd, ?kind, "new data connection");
    }

    /// Dispatch one RPC call from a ready control socket.
    fn dispatch(&mut self, fd: RawFd, revents: i16) -> Result<(), ServerError> {
        if revents & (libc::POLLERR | libc::POLLHUP) != 0 {
            tracing::error!(fd, "ERR or HUP on RPC socket");
            return Err(ServerError::Dispatch);
        }

        // take the codec out of the record so handlers can borrow the
        // table alongside it; put it back when the call is done
        let (mut codec, device) = match self.table.get_mut(fd) {
            Some(record) => match (record.codec.take(), record.device.clone()) {
                (Some(codec), Some(device)) => (codec, device),
                (codec, _) => {
                    record.codec = codec;
                    return Ok(());
                }
            },
            // erased earlier in this poll batch
            None => return Ok(()),
        };

        let call = codec.read_int();
        if call < 0 {
            tracing::error!(fd, "EOF or error on RPC socket");
            return Err(ServerError::Dispatch);
        }

        match RpcCall::from_code(call) {
            None => {
                tracing::error!(fd, call, "unknown RPC call");
                codec.write_int(UNKNOWN_CALL);
                Err(ServerError::Dispatch)
            }
            Some(RpcCall::Drop) => {
                tracing::info!(fd, "dropping connection");
                drop(codec);
                self.drop_connection(fd, &device);
                Ok(())
            }
            Some(op) => {
                tracing::debug!(fd, ?op, "dispatch");
                handlers::handle(op, &mut codec, &device, &mut self.table, fd);
                if let Some(record) = self.table.get_mut(fd) {
                    record.codec = Some(codec);
                }
                Ok(())
            }
        }
    }

    /// Erase a control record and every data record bound to its device.
    /// The device itself is released when the last reference goes.
    fn drop_connection(&mut self, fd: RawFd, device: &Arc<dyn SdrDevice>) {
        self.table.remove(fd);

        let bound: Vec<RawFd> = self
            .table
            .iter()
            .filter(|(_, rec)| {
                !rec.is_control()
                    && rec
                        .device
                        .as_ref()
                        .map_or(false, |d| Arc::ptr_eq(d, device))
            })
            .map(|(data_fd, _)| data_fd)
            .collect();

        for data_fd in bound {
            if let Some(mut record) = self.table.remove(data_fd) {
                if let Some(worker) = record.worker.take() {
                    worker.stop();
                }
                if let (Some(dev), Some(stream)) = (&record.device, record.stream) {
                    let _ = dev.close_stream(stream);
                }
                tracing::debug!(data_fd, "released bound data connection");
            }
        }
    }
}

/// Split a `k1=v1/k2=v2/...` driver argument string. Pairs without `=`
/// are skipped.
fn parse_driver_args(args: &str) -> Kwargs {
    let mut kwargs = Kwargs::new();
    for pair in args.split('/') {
        if let Some((key, value)) = pair.split_once('=') {
            if !key.is_empty() {
                kwargs.insert(key.to_string(), value.to_string());
            }
        }
    }
    kwargs
}

/// Open a v4 listening socket with `SO_REUSEADDR` set before bind, which
/// the std listener builder does not expose.
fn listen_reuseaddr(addr: SocketAddrV4) -> io::Result<TcpListener> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let one: libc::c_int = 1;
        // best effort; a real failure surfaces at bind
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: addr.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(*addr.ip()).to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) != 0
        {
            let e = io::Error::last_os_error();
            libc::close(fd);
            return Err(e);
        }
        if libc::listen(fd, 5) != 0 {
            let e = io::Error::last_os_error();
            libc::close(fd);
            return Err(e);
        }

        Ok(TcpListener::from_raw_fd(fd))
    }
}
