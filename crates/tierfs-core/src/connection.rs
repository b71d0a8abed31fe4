//! Framed, multiplexed connection with heartbeat supervision.
//!
//! One `Connection` owns one TCP socket and carries many concurrent logical
//! requests, each tagged with a 16-bit id. Three tasks run per connection:
//!
//! - the read loop decodes frames and routes them by the header `kind`:
//!   requests go to the inbound queue, responses to the waiter for their id;
//! - the writer owns the write half and drains a bounded outbound queue, so
//!   no lock is ever held across socket I/O;
//! - the heartbeat task sends a zero-payload ping every interval.
//!
//! Silence on the read side longer than the heartbeat timeout, any I/O
//! error, a malformed frame or a response nobody is waiting for closes the
//! connection. Closing is idempotent and releases every waiter with
//! `ConnectionClosed`.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;
use tracing::{debug, trace, warn};

use tierfs_proto::constants::{FRAME_HEADER_LEN, FRAME_STAT_OK, MAX_PAYLOAD_SIZE};
use tierfs_proto::defaults::{
    DEFAULT_CONN_WRITE_CHANNEL_SIZE, DEFAULT_HANDSHAKE_TIMEOUT_MS,
    DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_HEARTBEAT_TIMEOUT_SECS,
};
use tierfs_proto::msg::{self, HeartbeatParams, Hello};
use tierfs_proto::{Command, Frame, FrameHeader, FrameKind, FsError, FsResult, Role};

use crate::net;

/// Tunables shared by both ends of a connection.
///
/// Only the acceptor's heartbeat values matter: they are sent to the
/// connecting side during the handshake and adopted by both ends.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub heartbeat_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
    pub write_channel_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            write_channel_size: DEFAULT_CONN_WRITE_CHANNEL_SIZE,
        }
    }
}

impl ConnectionConfig {
    fn heartbeat_params(&self) -> HeartbeatParams {
        HeartbeatParams {
            timeout_ms: self.heartbeat_timeout.as_millis() as u64,
            interval_ms: self.heartbeat_interval.as_millis() as u64,
        }
    }
}

/// Item queued for the writer task.
enum Outbound {
    Frame(Frame),
    /// Header followed by `len` bytes of `file` starting at `offset`.
    File {
        header: FrameHeader,
        file: Arc<File>,
        offset: u64,
        len: u64,
    },
}

struct Shared {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    peer_role: Role,
    heartbeat_timeout: Duration,
    heartbeat_interval: Duration,
    next_id: AtomicU16,
    /// Response slots for requests still in flight.
    pending: Mutex<HashMap<u16, oneshot::Sender<Frame>>>,
    /// Receivers parked by `send_request` until `recv_response` claims them.
    waiting: Mutex<HashMap<u16, oneshot::Receiver<Frame>>>,
    outbound: mpsc::Sender<Outbound>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    closed: watch::Sender<bool>,
    close_reason: Mutex<Option<FsError>>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn close(&self, reason: FsError) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason);
        }
        self.closed.send_replace(true);
        self.inbound_tx.lock().take();
        self.waiting.lock().clear();
        let released: Vec<_> = self.pending.lock().drain().collect();
        match reason {
            FsError::ConnectionClosed => debug!(
                "conn: closed {} ({}), {} waiters released",
                self.peer_addr,
                self.peer_role,
                released.len()
            ),
            _ => warn!(
                "conn: closing {} ({}): {}, {} waiters released",
                self.peer_addr,
                self.peer_role,
                reason,
                released.len()
            ),
        }
    }
}

/// Closes the connection once the last user handle is dropped.
///
/// The background tasks hold `Shared` directly, so without this guard a
/// forgotten connection would keep pinging its peer forever.
struct CloseGuard(Arc<Shared>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.close(FsError::ConnectionClosed);
    }
}

/// A ready, handshaken connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    _guard: Arc<CloseGuard>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.shared.peer_addr)
            .field("peer_role", &self.shared.peer_role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Dial `addr` and complete the connector side of the handshake.
    ///
    /// `local_role` is announced to the acceptor; `peer_role` records what
    /// the caller knows it is dialing.
    pub async fn connect(
        addr: SocketAddr,
        local_role: Role,
        peer_role: Role,
        cfg: &ConnectionConfig,
    ) -> FsResult<Self> {
        let mut stream = net::connect_to_addr(addr).await?;

        let params = time::timeout(cfg.handshake_timeout, async {
            let est = read_frame(&mut stream, cfg.handshake_timeout).await?;
            if est.kind != FrameKind::Request || est.cmd != Command::HeartbeatEstablish {
                return Err(FsError::ProtocolViolation);
            }
            let params: HeartbeatParams = est.decode_ok()?;
            let hello = msg::encode(&Hello { role: local_role })?;
            write_frame(&mut stream, &Frame::response_to(&est, FRAME_STAT_OK, hello)).await?;
            Ok::<_, FsError>(params)
        })
        .await
        .map_err(|_| FsError::HeartbeatTimeout)??;

        debug!(
            "conn: connected to {} ({}), heartbeat {}ms/{}ms",
            addr, peer_role, params.interval_ms, params.timeout_ms
        );
        Self::spawn(stream, peer_role, params, cfg.write_channel_size)
    }

    /// Start the read, write and heartbeat tasks on a handshaken socket.
    fn spawn(
        stream: TcpStream,
        peer_role: Role,
        params: HeartbeatParams,
        write_channel_size: usize,
    ) -> FsResult<Self> {
        if params.timeout_ms == 0 || params.interval_ms == 0 {
            return Err(FsError::ProtocolViolation);
        }
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true).ok();
        let (rd, wr) = stream.into_split();

        let (out_tx, out_rx) = mpsc::channel(write_channel_size.max(1));
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            local_addr,
            peer_addr,
            peer_role,
            heartbeat_timeout: Duration::from_millis(params.timeout_ms),
            heartbeat_interval: Duration::from_millis(params.interval_ms),
            next_id: AtomicU16::new(0),
            pending: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
            outbound: out_tx,
            inbound_tx: Mutex::new(Some(in_tx)),
            inbound_rx: tokio::sync::Mutex::new(in_rx),
            closed,
            close_reason: Mutex::new(None),
        });

        tokio::spawn(read_loop(shared.clone(), rd));
        tokio::spawn(write_loop(shared.clone(), wr, out_rx));
        tokio::spawn(heartbeat_loop(shared.clone()));

        Ok(Self {
            _guard: Arc::new(CloseGuard(shared.clone())),
            shared,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    /// Role announced by (or known for) the remote end.
    pub fn peer_role(&self) -> Role {
        self.shared.peer_role
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.shared.heartbeat_timeout
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<FsError> {
        *self.shared.close_reason.lock()
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.shared.close(FsError::ConnectionClosed);
    }

    /// Close the connection, recording `reason`.
    pub fn close_with(&self, reason: FsError) {
        self.shared.close(reason);
    }

    /// Suspend until the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        wait_closed(&mut rx).await;
    }

    fn check_open(&self) -> FsResult<()> {
        if self.is_closed() {
            Err(FsError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    async fn enqueue(&self, item: Outbound) -> FsResult<()> {
        self.shared
            .outbound
            .send(item)
            .await
            .map_err(|_| FsError::ConnectionClosed)
    }

    /// Assign an id, register its response slot and queue the frame.
    async fn submit(
        &self,
        cmd: Command,
        status: u8,
        payload: Vec<u8>,
    ) -> FsResult<(u16, oneshot::Receiver<Frame>)> {
        self.check_open()?;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let mut frame = Frame::request(cmd, status, payload);
        frame.id = id;
        frame.header()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if pending.contains_key(&id) {
                return Err(FsError::Busy);
            }
            pending.insert(id, tx);
        }
        // close() drains `pending` after flipping the flag, so a slot
        // inserted past the drain is caught here.
        if self.is_closed() {
            self.shared.pending.lock().remove(&id);
            return Err(FsError::ConnectionClosed);
        }

        if let Err(e) = self.enqueue(Outbound::Frame(frame)).await {
            self.shared.pending.lock().remove(&id);
            return Err(e);
        }
        trace!("conn: {} -> {} id={}", cmd, self.shared.peer_addr, id);
        Ok((id, rx))
    }

    /// Queue a request and return its id.
    ///
    /// Every id must be claimed with [`recv_response`]; an unclaimed
    /// response stays parked until its id is reused or the connection
    /// closes.
    ///
    /// [`recv_response`]: Connection::recv_response
    pub async fn send_request(&self, cmd: Command, status: u8, payload: Vec<u8>) -> FsResult<u16> {
        let (id, rx) = self.submit(cmd, status, payload).await?;
        self.shared.waiting.lock().insert(id, rx);
        Ok(id)
    }

    /// Suspend until the response tagged `id` arrives or the connection
    /// closes.
    pub async fn recv_response(&self, id: u16) -> FsResult<Frame> {
        let rx = self.shared.waiting.lock().remove(&id);
        match rx {
            Some(rx) => rx.await.map_err(|_| FsError::ConnectionClosed),
            None if self.is_closed() => Err(FsError::ConnectionClosed),
            None => Err(FsError::InvalidParms),
        }
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, cmd: Command, status: u8, payload: Vec<u8>) -> FsResult<Frame> {
        let (_, rx) = self.submit(cmd, status, payload).await?;
        rx.await.map_err(|_| FsError::ConnectionClosed)
    }

    /// Suspend until the peer sends a request.
    pub async fn recv_request(&self) -> FsResult<Frame> {
        let mut rx = self.shared.inbound_rx.lock().await;
        let mut closed = self.shared.closed.subscribe();
        tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => Err(FsError::ConnectionClosed),
            frame = rx.recv() => frame.ok_or(FsError::ConnectionClosed),
        }
    }

    /// Answer `req`, copying its id and command.
    pub async fn send_response(&self, req: &Frame, status: u8, payload: Vec<u8>) -> FsResult<()> {
        self.check_open()?;
        let frame = Frame::response_to(req, status, payload);
        frame.header()?;
        self.enqueue(Outbound::Frame(frame)).await
    }

    /// Answer request `id` with an error status and no payload.
    pub async fn send_error(&self, id: u16, cmd: Command, err: FsError) -> FsResult<()> {
        self.check_open()?;
        let frame = Frame {
            id,
            cmd,
            kind: FrameKind::Response,
            status: err.to_status(),
            payload: Vec::new(),
        };
        self.enqueue(Outbound::Frame(frame)).await
    }

    /// Answer `req` with `len` bytes of `file` starting at `offset`,
    /// streamed straight from the descriptor.
    pub async fn send_file_response(
        &self,
        req: &Frame,
        status: u8,
        file: Arc<File>,
        offset: u64,
        len: u64,
    ) -> FsResult<()> {
        self.check_open()?;
        if len > MAX_PAYLOAD_SIZE as u64 {
            return Err(FsError::InvalidParms);
        }
        let header = FrameHeader {
            id: req.id,
            cmd: req.cmd,
            kind: FrameKind::Response,
            status,
            payload_len: len as u32,
        };
        self.enqueue(Outbound::File {
            header,
            file,
            offset,
            len,
        })
        .await
    }
}

/// Listener side of the handshake: send `HeartbeatEstablish`, expect a
/// `Hello` response within the deadline.
pub(crate) async fn handshake_accepted(
    mut stream: TcpStream,
    cfg: &ConnectionConfig,
) -> FsResult<Connection> {
    let params = cfg.heartbeat_params();
    let est = Frame::request(
        Command::HeartbeatEstablish,
        FRAME_STAT_OK,
        msg::encode(&params)?,
    );

    let reply = time::timeout(cfg.handshake_timeout, async {
        write_frame(&mut stream, &est).await?;
        read_frame(&mut stream, cfg.handshake_timeout).await
    })
    .await
    .map_err(|_| FsError::HeartbeatTimeout)??;

    if reply.kind != FrameKind::Response
        || reply.cmd != Command::HeartbeatEstablish
        || reply.id != est.id
    {
        return Err(FsError::ProtocolViolation);
    }
    let hello: Hello = reply.decode_ok()?;
    Connection::spawn(stream, hello.role, params, cfg.write_channel_size)
}

/// Fill `buf`, failing if the peer stays silent for longer than `idle`.
async fn read_full<R: AsyncRead + Unpin>(
    rd: &mut R,
    buf: &mut [u8],
    idle: Duration,
) -> FsResult<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match time::timeout(idle, rd.read(&mut buf[filled..])).await {
            Err(_) => return Err(FsError::HeartbeatTimeout),
            Ok(Ok(0)) | Ok(Err(_)) => return Err(FsError::ConnectionClosed),
            Ok(Ok(n)) => filled += n,
        }
    }
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(rd: &mut R, idle: Duration) -> FsResult<Frame> {
    let mut hdr = [0u8; FRAME_HEADER_LEN];
    read_full(rd, &mut hdr, idle).await?;
    let header = FrameHeader::decode(&hdr)?;
    let mut payload = vec![0u8; header.payload_len as usize];
    read_full(rd, &mut payload, idle).await?;
    Ok(Frame::from_parts(header, payload))
}

async fn write_frame<W: AsyncWrite + Unpin>(wr: &mut W, frame: &Frame) -> FsResult<()> {
    let header = frame.header()?;
    wr.write_all(&header.encode()).await?;
    if !frame.payload.is_empty() {
        wr.write_all(&frame.payload).await?;
    }
    Ok(())
}

async fn read_loop(shared: Arc<Shared>, mut rd: OwnedReadHalf) {
    let mut closed = shared.closed.subscribe();
    let reason = loop {
        let frame = tokio::select! {
            r = read_frame(&mut rd, shared.heartbeat_timeout) => r,
            _ = wait_closed(&mut closed) => return,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => break e,
        };

        match frame.kind {
            FrameKind::Request if frame.cmd == Command::HeartbeatPing => {
                trace!("conn: ping from {}", shared.peer_addr);
            }
            FrameKind::Request => {
                let delivered = match shared.inbound_tx.lock().as_ref() {
                    Some(tx) => tx.send(frame).is_ok(),
                    None => false,
                };
                if !delivered {
                    break FsError::ConnectionClosed;
                }
            }
            FrameKind::Response => {
                let slot = shared.pending.lock().remove(&frame.id);
                match slot {
                    // The requester may have given up; that is not an error.
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => {
                        warn!(
                            "conn: {} sent a {} response for unknown id {}",
                            shared.peer_addr, frame.cmd, frame.id
                        );
                        break FsError::ProtocolViolation;
                    }
                }
            }
        }
    };
    shared.close(reason);
}

/// Resolve once the close flag is set.
///
/// The borrowed `watch::Ref` is dropped here so callers' futures stay `Send`.
async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

async fn write_loop(
    shared: Arc<Shared>,
    mut wr: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Outbound>,
) {
    let mut closed = shared.closed.subscribe();
    loop {
        let item = tokio::select! {
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
            _ = wait_closed(&mut closed) => break,
        };

        let res = tokio::select! {
            r = write_item(&mut wr, item) => r,
            _ = wait_closed(&mut closed) => break,
        };
        if let Err(e) = res {
            debug!("conn: write to {} failed: {}", shared.peer_addr, e);
            shared.close(FsError::ConnectionClosed);
            break;
        }
    }
    let _ = wr.shutdown().await;
}

async fn write_item(wr: &mut OwnedWriteHalf, item: Outbound) -> FsResult<()> {
    match item {
        Outbound::Frame(frame) => write_frame(wr, &frame).await,
        Outbound::File {
            header,
            file,
            offset,
            len,
        } => {
            wr.write_all(&header.encode()).await?;
            send_file_segment(wr, &file, offset, len).await?;
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
async fn send_file_segment(
    wr: &mut OwnedWriteHalf,
    file: &File,
    mut offset: u64,
    len: u64,
) -> io::Result<()> {
    use tokio::io::Interest;

    let tcp: &TcpStream = wr.as_ref();
    let mut remaining = len;
    while remaining > 0 {
        tcp.writable().await?;
        let res = tcp.try_io(Interest::WRITABLE, || {
            let mut off = offset as nix::libc::off_t;
            nix::sys::sendfile::sendfile(tcp, file, Some(&mut off), remaining as usize)
                .map_err(io::Error::from)
        });
        match res {
            // File shrank under us; the frame can no longer be completed.
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                offset += n as u64;
                remaining -= n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn send_file_segment(
    wr: &mut OwnedWriteHalf,
    file: &File,
    offset: u64,
    len: u64,
) -> io::Result<()> {
    use std::os::unix::fs::FileExt;

    let file = file.try_clone()?;
    let buf = tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; len as usize];
        file.read_exact_at(&mut buf, offset).map(|_| buf)
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
    wr.write_all(&buf).await
}

async fn heartbeat_loop(shared: Arc<Shared>) {
    let mut closed = shared.closed.subscribe();
    let mut ticker = time::interval(shared.heartbeat_interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let ping = Frame::request(Command::HeartbeatPing, FRAME_STAT_OK, Vec::new());
                if shared.outbound.send(Outbound::Frame(ping)).await.is_err() {
                    break;
                }
            }
            _ = wait_closed(&mut closed) => break,
        }
    }
}
