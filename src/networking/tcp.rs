/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A [`Transport`] over plain TCP.
//!
//! Every raft message travels as one frame: its protobuf encoding prefixed by the encoding's length
//! as a little-endian `u32`. Outbound traffic to each known member is written in the background by a
//! dedicated writer thread that (re)connects lazily, so [`send`](Transport::send) never blocks on the
//! network. Every connection, inbound or outbound, also gets a reader thread which hands decoded
//! messages to [`recv`](Transport::recv).
//!
//! A member that has only just been added to the cluster does not know its peers yet. Until it does,
//! its replies go back over the connection the sender opened to it.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use protobuf::Message as PbMessage;
use raft::eraftpb::Message;

use crate::types::{address::Address, data_types::RaftId};

use super::network::{Transport, TransportError};

const WRITER_CHANNEL_BUFFER_LEN: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const RECONNECT_BACKOFF: Duration = Duration::from_millis(200);
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    me: RaftId,
    local_addr: SocketAddr,
    outbound: Mutex<HashMap<RaftId, Outbound>>,
    // Write halves of connections opened to us by members we have no outbound route to, with the id
    // of the connection they belong to.
    inbound: Mutex<HashMap<RaftId, (ConnectionId, TcpStream)>>,
    // Every open connection, removed by its reader thread when the connection closes.
    connections: Mutex<HashMap<ConnectionId, TcpStream>>,
    next_connection_id: AtomicU64,
    to_main: Mutex<Sender<Message>>,
    from_readers: Mutex<Receiver<Message>>,
}

type ConnectionId = u64;

struct Outbound {
    to_writer: SyncSender<Message>,
    active_since: Arc<Mutex<Option<SystemTime>>>,
}

impl TcpTransport {
    /// Listen for consensus traffic on `listen_addr` as member `me`.
    pub fn bind(me: RaftId, listen_addr: SocketAddr) -> io::Result<TcpTransport> {
        let listener = TcpListener::bind(listen_addr)?;
        listener.set_nonblocking(true)?;
        let (to_main, from_readers) = mpsc::channel();

        let inner = Arc::new(Inner {
            me,
            local_addr: listener.local_addr()?,
            outbound: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(0),
            to_main: Mutex::new(to_main),
            from_readers: Mutex::new(from_readers),
        });
        start_acceptor(listener, Arc::downgrade(&inner));

        Ok(TcpTransport { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }
}

impl Transport for TcpTransport {
    fn add_peer(&mut self, address: &Address) {
        if address.raft_id == self.inner.me {
            return;
        }
        let mut outbound = self.inner.outbound.lock().unwrap();
        if outbound.contains_key(&address.raft_id) {
            return;
        }

        let (to_writer, from_main) = mpsc::sync_channel(WRITER_CHANNEL_BUFFER_LEN);
        let active_since = Arc::new(Mutex::new(None));
        start_writer(
            address.clone(),
            from_main,
            active_since.clone(),
            Arc::downgrade(&self.inner),
        );
        outbound.insert(
            address.raft_id,
            Outbound {
                to_writer,
                active_since,
            },
        );
        log::debug!("{}: consensus transport added peer {}", self.inner.me, address.raft_id);
    }

    fn remove_peer(&mut self, raft_id: RaftId) {
        // Dropping the sender stops the writer thread, which closes its connection.
        self.inner.outbound.lock().unwrap().remove(&raft_id);
        if let Some((_, stream)) = self.inner.inbound.lock().unwrap().remove(&raft_id) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn send(&mut self, message: Message) -> Result<(), TransportError> {
        let to = RaftId::from_raft(message.to).ok_or(TransportError::UnknownPeer(message.to))?;

        if let Some(outbound) = self.inner.outbound.lock().unwrap().get(&to) {
            return match outbound.to_writer.try_send(message) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(TransportError::Backlogged(to)),
                Err(TrySendError::Disconnected(_)) => Err(TransportError::Disconnected(to)),
            };
        }

        let mut inbound = self.inner.inbound.lock().unwrap();
        let (_, stream) = inbound.get_mut(&to).ok_or(TransportError::UnknownPeer(message.to))?;
        if write_frame(stream, &message).is_err() {
            inbound.remove(&to);
            return Err(TransportError::Disconnected(to));
        }
        Ok(())
    }

    fn recv(&mut self) -> Option<Message> {
        self.inner.from_readers.lock().unwrap().try_recv().ok()
    }

    fn active_since(&self, raft_id: RaftId) -> Option<SystemTime> {
        let outbound = self.inner.outbound.lock().unwrap();
        let active_since = outbound.get(&raft_id)?.active_since.lock().unwrap();
        *active_since
    }
}

// Spawns a reader for `stream`, tracking it so that it is closed when the transport goes away. The
// reader forgets the connection once it closes.
fn track(transport: &Arc<Inner>, stream: &TcpStream, is_inbound: bool) -> io::Result<()> {
    let reader_stream = stream.try_clone()?;
    let reply_stream = if is_inbound {
        Some(stream.try_clone()?)
    } else {
        None
    };
    let id = transport.next_connection_id.fetch_add(1, Ordering::Relaxed);
    transport.connections.lock().unwrap().insert(id, stream.try_clone()?);
    let to_main = transport.to_main.lock().unwrap().clone();
    start_reader(id, reader_stream, to_main, reply_stream, Arc::downgrade(transport));
    Ok(())
}

impl Inner {
    fn forget_connection(&self, id: ConnectionId) {
        if let Some(stream) = self.connections.lock().unwrap().remove(&id) {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.inbound
            .lock()
            .unwrap()
            .retain(|_, (connection, _)| *connection != id);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (_, stream) in self.connections.lock().unwrap().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn start_acceptor(listener: TcpListener, inner: Weak<Inner>) {
    thread::spawn(move || loop {
        let Some(transport) = inner.upgrade() else {
            return;
        };

        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let tracked = stream
                    .set_nonblocking(false)
                    .and_then(|()| stream.set_write_timeout(Some(WRITE_TIMEOUT)))
                    .and_then(|()| track(&transport, &stream, true));
                if let Err(err) = tracked {
                    log::warn!("{}: dropping connection from {}: {}", transport.me, peer_addr, err);
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                drop(transport);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) => {
                log::warn!("{}: consensus listener failed: {}", transport.me, err);
                return;
            }
        }
    });
}

// Continuously receives messages from_main and writes them to the member at `address`, connecting
// when there is no connection. Messages that cannot be written are dropped; raft retransmits.
fn start_writer(
    address: Address,
    from_main: Receiver<Message>,
    active_since: Arc<Mutex<Option<SystemTime>>>,
    inner: Weak<Inner>,
) {
    thread::spawn(move || {
        let mut stream: Option<TcpStream> = None;
        let mut last_attempt: Option<Instant> = None;

        while let Ok(msg) = from_main.recv() {
            if stream.is_none() {
                if last_attempt.map_or(false, |at| at.elapsed() < RECONNECT_BACKOFF) {
                    continue;
                }
                last_attempt = Some(Instant::now());

                let Some(transport) = inner.upgrade() else {
                    break;
                };
                match connect(&address).and_then(|conn| track(&transport, &conn, false).map(|()| conn)) {
                    Ok(conn) => {
                        *active_since.lock().unwrap() = Some(SystemTime::now());
                        stream = Some(conn);
                    }
                    Err(err) => {
                        log::debug!("{}: cannot reach {}: {}", transport.me, address.raft_id, err);
                        continue;
                    }
                }
            }

            if let Some(conn) = stream.as_mut() {
                if write_frame(conn, &msg).is_err() {
                    let _ = conn.shutdown(Shutdown::Both);
                    stream = None;
                    *active_since.lock().unwrap() = None;
                }
            }
        }

        if let Some(conn) = stream {
            let _ = conn.shutdown(Shutdown::Both);
        }
    });
}

// Continuously reads messages from `stream` and sends them to_main. When the connection closes the
// thread forgets connection `id` and dies. If `reply_stream` is given, it becomes the route back to
// the first sender seen.
fn start_reader(
    id: ConnectionId,
    mut stream: TcpStream,
    to_main: Sender<Message>,
    mut reply_stream: Option<TcpStream>,
    inner: Weak<Inner>,
) {
    thread::spawn(move || {
        while let Ok(msg) = read_frame(&mut stream) {
            if let Some(from) = RaftId::from_raft(msg.from) {
                if let Some(reply) = reply_stream.take() {
                    let Some(transport) = inner.upgrade() else {
                        return;
                    };
                    transport.inbound.lock().unwrap().insert(from, (id, reply));
                }
            }
            if to_main.send(msg).is_err() {
                break;
            }
        }
        if let Some(transport) = inner.upgrade() {
            transport.forget_connection(id);
        }
    });
}

fn connect(address: &Address) -> io::Result<TcpStream> {
    let socket_addr = address
        .raft_socket_addr()
        .map_err(|err| io::Error::new(ErrorKind::AddrNotAvailable, err.to_string()))?;
    let stream = TcpStream::connect_timeout(&socket_addr, CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    Ok(stream)
}

fn write_frame(stream: &mut TcpStream, msg: &Message) -> io::Result<()> {
    let body = msg
        .write_to_bytes()
        .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    stream.write_all(&frame)
}

fn read_frame(stream: &mut TcpStream) -> io::Result<Message> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(ErrorKind::InvalidData, "oversized frame"));
    }

    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body)?;
    let mut msg = Message::default();
    msg.merge_from_bytes(&body)
        .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::address::PeerDescriptor;
    use crate::types::data_types::NodeId;
    use raft::eraftpb::MessageType;

    fn address_of(raft_id: u16, transport: &TcpTransport) -> Address {
        let descriptor = PeerDescriptor {
            node_id: NodeId::new([raft_id as u8; 32]),
            host: String::from("127.0.0.1"),
            p2p_port: 30303,
            raft_port: Some(transport.local_addr().port()),
        };
        Address::new(RaftId::new(raft_id), &descriptor).unwrap()
    }

    fn heartbeat(from: u64, to: u64) -> Message {
        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgHeartbeat);
        msg.from = from;
        msg.to = to;
        msg.term = 3;
        msg
    }

    fn recv_within(transport: &mut TcpTransport, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(msg) = transport.recv() {
                return Some(msg);
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn delivers_to_added_peer_and_replies_over_inbound_stream() {
        let localhost: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut first = TcpTransport::bind(RaftId::new(1), localhost).unwrap();
        let mut second = TcpTransport::bind(RaftId::new(2), localhost).unwrap();

        first.add_peer(&address_of(2, &second));
        first.send(heartbeat(1, 2)).unwrap();
        let received = recv_within(&mut second, Duration::from_secs(5)).unwrap();
        assert_eq!(received.from, 1);
        assert_eq!(received.term, 3);
        assert!(first.active_since(RaftId::new(2)).is_some());

        // `second` never learned about `first`, so the reply rides on the inbound connection.
        second.send(heartbeat(2, 1)).unwrap();
        let reply = recv_within(&mut first, Duration::from_secs(5)).unwrap();
        assert_eq!(reply.from, 2);
        assert_eq!(reply.get_msg_type(), MessageType::MsgHeartbeat);
    }

    #[test]
    fn closed_connections_are_forgotten() {
        let localhost: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut first = TcpTransport::bind(RaftId::new(1), localhost).unwrap();
        let mut second = TcpTransport::bind(RaftId::new(2), localhost).unwrap();

        for _ in 0..20 {
            first.add_peer(&address_of(2, &second));
            first.send(heartbeat(1, 2)).unwrap();
            assert!(recv_within(&mut second, Duration::from_secs(5)).is_some());
            first.remove_peer(RaftId::new(2));
        }

        let open = |transport: &TcpTransport| transport.inner.connections.lock().unwrap().len();
        let deadline = Instant::now() + Duration::from_secs(5);
        while (open(&first) > 0 || open(&second) > 0) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(open(&first), 0);
        assert_eq!(open(&second), 0);
        assert!(second.inner.inbound.lock().unwrap().is_empty());
    }

    #[test]
    fn sending_to_unknown_member_fails() {
        let localhost: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut transport = TcpTransport::bind(RaftId::new(1), localhost).unwrap();
        assert!(matches!(
            transport.send(heartbeat(1, 9)),
            Err(TransportError::UnknownPeer(9))
        ));
        assert!(matches!(
            transport.send(heartbeat(1, 0)),
            Err(TransportError::UnknownPeer(0))
        ));
        assert!(transport.active_since(RaftId::new(9)).is_none());
    }
}
