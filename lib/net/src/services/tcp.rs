//! TCP port forwarding in both directions: `tcp:<port>` streams bridged to
//! localhost, reverse listeners opened on behalf of the peer, and the
//! reverse list/kill one-shots.

use std::cmp::min;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};

use adbproto::logging;
use adbproto::status;

use super::{Fate, Ids, OpenOutcome, ServiceBody, Step};
use crate::client::{Courier, EngineCtx};
use crate::endpoint::TokenEntry;
use crate::packet::{Packet, Staged};

/// Per-stream bridging state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum StreamState {
    /// Fatal failure; close with local id zero at the next opportunity.
    ErrorClose,
    /// TCP connect in flight (forward only).
    NotConnected,
    /// Connected; the OKAY deferred at OPEN time still has to go out.
    NotifyClient,
    /// Reverse stream: OPEN toward the peer sent (or pending while the pool
    /// is dry), waiting for its OKAY.
    WaitOpenAck { sent: bool },
    /// Bridging; socket reads feed WRTE frames.
    Connected,
    /// WRTE emitted; socket reads stay stopped until the peer's OKAY.
    WaitAck,
}

/// A single bidirectional bridge between an ADB stream and a TCP socket,
/// used by both the forward and the reverse direction.
pub struct StreamService {
    socket: TcpStream,
    token: Token,
    state: StreamState,
    /// Peer payload that did not fit the socket inline; finished on
    /// writable edges and acknowledged on completion.
    pending_out: Option<(Packet, usize)>,
    /// Host-side port a reverse stream opens toward (`tcp:<port>`).
    remote_port: u16,
}

fn local_addr(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

/// `tcp:<port>`: connect to localhost and bridge. The OKAY is deferred to
/// the connect completion.
pub fn open_forward(name: &str, mut packet: Packet, ctx: &mut EngineCtx) -> OpenOutcome {
    let port = match name["tcp:".len()..].parse::<u16>() {
        Ok(port) if port != 0 => port,
        _ => return OpenOutcome::Reject(packet),
    };

    let mut socket = match TcpStream::connect(local_addr(port)) {
        Ok(socket) => socket,
        Err(_) => return OpenOutcome::Reject(packet),
    };

    let token = ctx.tokens.insert(TokenEntry::Service { client: ctx.slot });
    if ctx
        .registry
        .register(&mut socket, token, Interest::READABLE | Interest::WRITABLE)
        .is_err()
    {
        ctx.tokens.remove(token);
        return OpenOutcome::Reject(packet);
    }

    packet.staged = Staged::InitAsync;
    OpenOutcome::Service(
        ServiceBody::Stream(StreamService {
            socket,
            token,
            state: StreamState::NotConnected,
            pending_out: None,
            remote_port: 0,
        }),
        packet,
    )
}

/// Wraps a connection accepted by a reverse listener as a stream service in
/// `WaitOpenAck`; the caller registers it and kicks it to emit the OPEN.
pub fn reverse_stream(
    mut socket: TcpStream,
    remote_port: u16,
    ctx: &mut EngineCtx,
) -> io::Result<ServiceBody> {
    let token = ctx.tokens.insert(TokenEntry::Service { client: ctx.slot });
    if let Err(err) = ctx
        .registry
        .register(&mut socket, token, Interest::READABLE | Interest::WRITABLE)
    {
        ctx.tokens.remove(token);
        return Err(err);
    }

    Ok(ServiceBody::Stream(StreamService {
        socket,
        token,
        state: StreamState::WaitOpenAck { sent: false },
        pending_out: None,
        remote_port,
    }))
}

impl StreamService {
    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn reclaim(&mut self) -> Option<Packet> {
        self.pending_out.take().map(|(packet, _)| packet)
    }

    pub fn on_write(&mut self, packet: Packet, _ids: &mut Ids, _courier: &mut Courier) -> Step {
        match self.state {
            StreamState::Connected | StreamState::WaitAck => {}
            _ => return Step::Fail(Some(packet)),
        }

        if self.pending_out.is_some() {
            // A second WRTE before the previous one was acknowledged.
            return Step::Fail(Some(packet));
        }

        let len = packet.header.data_length as usize;
        let mut offset = 0;
        while offset < len {
            match self.socket.write(&packet.payload()[offset..]) {
                Ok(0) => return Step::Fail(Some(packet)),
                Ok(n) => offset += n,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // Finish on the next writable edge, acknowledge then.
                    self.pending_out = Some((packet, offset));
                    return Step::Async;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return Step::Fail(Some(packet)),
            }
        }

        Step::Done(packet)
    }

    pub fn on_ack(&mut self, packet: Packet, ids: &mut Ids, courier: &mut Courier) -> Step {
        match self.state {
            StreamState::WaitAck | StreamState::WaitOpenAck { .. } => {
                self.state = StreamState::Connected;
                match self.pump_socket(ids, courier) {
                    Fate::Alive => Step::Done(packet),
                    Fate::Close(extra) => {
                        if let Some(extra) = extra {
                            courier.release(extra);
                        }
                        Step::Fail(Some(packet))
                    }
                }
            }
            _ => Step::Done(packet),
        }
    }

    pub fn on_kick(&mut self, ids: &mut Ids, courier: &mut Courier) -> Fate {
        match self.state {
            StreamState::NotConnected | StreamState::WaitAck => Fate::Alive,
            StreamState::WaitOpenAck { sent: false } => self.try_open(ids, courier),
            StreamState::WaitOpenAck { sent: true } => Fate::Alive,
            StreamState::NotifyClient => self.try_notify(ids, courier),
            // Resume reads after a failed allocation.
            StreamState::Connected => self.pump_socket(ids, courier),
            StreamState::ErrorClose => try_close(courier),
        }
    }

    pub fn on_socket_event(
        &mut self,
        readable: bool,
        writable: bool,
        ids: &mut Ids,
        courier: &mut Courier,
    ) -> Fate {
        if self.state == StreamState::NotConnected {
            if !writable {
                return Fate::Alive;
            }
            return self.finish_connect(ids, courier);
        }

        if writable {
            if let Fate::Close(packet) = self.continue_pending(ids, courier) {
                return Fate::Close(packet);
            }
        }

        if readable && self.state == StreamState::Connected {
            return self.pump_socket(ids, courier);
        }

        Fate::Alive
    }

    pub fn close(&mut self, ctx: &mut EngineCtx) {
        let _ = ctx.registry.deregister(&mut self.socket);
        ctx.tokens.remove(self.token);
    }

    /// Connect completion. Failure reports CLSE with local id zero so the
    /// peer reads it as a rejected OPEN.
    fn finish_connect(&mut self, ids: &mut Ids, courier: &mut Courier) -> Fate {
        let error = match self.socket.take_error() {
            Ok(Some(err)) => Some(err),
            Ok(None) => match self.socket.peer_addr() {
                Ok(_) => None,
                Err(ref err) if err.kind() == io::ErrorKind::NotConnected => {
                    // Spurious wakeup; connect still in flight.
                    return Fate::Alive;
                }
                Err(err) => Some(err),
            },
            Err(err) => Some(err),
        };

        match error {
            None => {
                self.state = StreamState::NotifyClient;
                self.try_notify(ids, courier)
            }
            Some(err) => {
                logging::info!(courier.log, "forward connect failed"; "error" => %err);
                *ids.id = 0;
                self.state = StreamState::ErrorClose;
                try_close(courier)
            }
        }
    }

    /// Emits the OKAY that was deferred at OPEN time, then starts bridging.
    fn try_notify(&mut self, ids: &mut Ids, courier: &mut Courier) -> Fate {
        let packet = match courier.allocate() {
            Some(packet) => packet,
            None => return Fate::Alive,
        };

        courier.send_okay(packet, *ids.id, ids.peer_id);
        self.state = StreamState::Connected;
        self.pump_socket(ids, courier)
    }

    /// Reverse stream: OPEN `tcp:<remote>` toward the peer.
    fn try_open(&mut self, ids: &mut Ids, courier: &mut Courier) -> Fate {
        let mut packet = match courier.allocate() {
            Some(packet) => packet,
            None => return Fate::Alive,
        };

        let dest = format!("tcp:{}\0", self.remote_port);
        let len = min(dest.len(), packet.capacity());
        packet.data_mut()[..len].copy_from_slice(&dest.as_bytes()[..len]);
        courier.send_open(packet, *ids.id, len);
        self.state = StreamState::WaitOpenAck { sent: true };
        Fate::Alive
    }

    /// Forwards one socket read as a WRTE, then waits for the ack. Exactly
    /// one WRTE per received OKAY.
    fn pump_socket(&mut self, ids: &mut Ids, courier: &mut Courier) -> Fate {
        if self.state != StreamState::Connected {
            return Fate::Alive;
        }

        let mut packet = match courier.allocate() {
            Some(packet) => packet,
            // Retried on the release kick.
            None => return Fate::Alive,
        };

        loop {
            match self.socket.read(packet.data_mut()) {
                Ok(0) => return Fate::Close(Some(packet)),
                Ok(n) => {
                    packet.header.arg0 = *ids.id;
                    packet.header.arg1 = ids.peer_id;
                    packet.stage_len(n);
                    courier.send_data_frame(packet);
                    self.state = StreamState::WaitAck;
                    return Fate::Alive;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    courier.release(packet);
                    return Fate::Alive;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return Fate::Close(Some(packet)),
            }
        }
    }

    /// Finishes a socket write that went asynchronous, acknowledging the
    /// peer's WRTE once the bytes are down.
    fn continue_pending(&mut self, ids: &mut Ids, courier: &mut Courier) -> Fate {
        let (packet, mut offset) = match self.pending_out.take() {
            Some(pending) => pending,
            None => return Fate::Alive,
        };

        let len = packet.header.data_length as usize;
        while offset < len {
            match self.socket.write(&packet.payload()[offset..]) {
                Ok(0) => return Fate::Close(Some(packet)),
                Ok(n) => offset += n,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.pending_out = Some((packet, offset));
                    return Fate::Alive;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return Fate::Close(Some(packet)),
            }
        }

        courier.send_okay(packet, *ids.id, ids.peer_id);
        Fate::Alive
    }
}

fn try_close(courier: &mut Courier) -> Fate {
    // Needs a packet for the CLSE; retried on kick when the pool is dry.
    match courier.allocate() {
        Some(packet) => Fate::Close(Some(packet)),
        None => Fate::Alive,
    }
}

/// A TCP listener opened on behalf of the peer. Accepted connections become
/// reverse streams that OPEN back toward the host.
pub struct ReverseServer {
    pub local_port: u16,
    pub remote_port: u16,
    listener: TcpListener,
    token: Token,
}

impl ReverseServer {
    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    /// Non-blocking accept; `Ok(None)` once drained.
    pub fn accept(&mut self) -> io::Result<Option<TcpStream>> {
        match self.listener.accept() {
            Ok((socket, _)) => Ok(Some(socket)),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn shutdown(&mut self, ctx: &mut EngineCtx) {
        let _ = ctx.registry.deregister(&mut self.listener);
        ctx.tokens.remove(self.token);
    }
}

/// Routes the `reverse:` namespace.
pub fn open_reverse(
    params: &str,
    packet: Packet,
    reverse: &mut Vec<ReverseServer>,
    ctx: &mut EngineCtx,
) -> OpenOutcome {
    if params.starts_with("list-forward") {
        return open_reverse_list(packet, reverse);
    }

    if let Some(rest) = params.strip_prefix("killforward") {
        return open_reverse_kill(rest, packet, reverse, ctx);
    }

    if let Some(rest) = params.strip_prefix("forward:tcp:") {
        return open_reverse_create(rest, packet, reverse, ctx);
    }

    OpenOutcome::Reject(packet)
}

/// Leading decimal digits of `s` as a port, plus the remainder.
fn parse_port(s: &str) -> (Option<u16>, &str) {
    let end = s
        .bytes()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or_else(|| s.len());

    match s[..end].parse::<u16>() {
        Ok(port) => (Some(port), &s[end..]),
        Err(_) => (None, s),
    }
}

fn stage_fail(packet: &mut Packet, message: &str) {
    let len = status::write_fail(packet.data_mut(), message);
    packet.stage_len(len);
}

/// `reverse:forward:tcp:<L> tcp:<R>`: listen on L, bridge accepted
/// connections to the host's localhost:R. Replies inline.
fn open_reverse_create(
    rest: &str,
    mut packet: Packet,
    reverse: &mut Vec<ReverseServer>,
    ctx: &mut EngineCtx,
) -> OpenOutcome {
    let (local_port, remainder) = parse_port(rest);
    let remote_port = remainder
        .find("tcp:")
        .and_then(|at| parse_port(&remainder[at + 4..]).0);

    let local_port = local_port.unwrap_or(0);
    let remote_port = remote_port.unwrap_or(0);

    if local_port == 0 || remote_port == 0 {
        stage_fail(
            &mut packet,
            &format!("invalid ports {} / {}", local_port, remote_port),
        );
        return OpenOutcome::OneShot(packet);
    }

    if reverse.iter().any(|r| r.local_port == local_port) {
        stage_fail(&mut packet, &format!("port {} used", local_port));
        return OpenOutcome::OneShot(packet);
    }

    let mut listener = match TcpListener::bind(local_addr(local_port)) {
        Ok(listener) => listener,
        Err(_) => {
            stage_fail(
                &mut packet,
                &format!("Failed to listen on port {}", local_port),
            );
            return OpenOutcome::OneShot(packet);
        }
    };

    let token = ctx.tokens.insert(TokenEntry::Reverse { client: ctx.slot });
    if ctx
        .registry
        .register(&mut listener, token, Interest::READABLE)
        .is_err()
    {
        ctx.tokens.remove(token);
        stage_fail(
            &mut packet,
            &format!("Failed to listen on port {}", local_port),
        );
        return OpenOutcome::OneShot(packet);
    }

    reverse.push(ReverseServer {
        local_port,
        remote_port,
        listener,
        token,
    });

    let digits = local_port.to_string();
    let len = status::write_okay_payload(packet.data_mut(), &digits);
    packet.stage_len(len);
    OpenOutcome::OneShot(packet)
}

/// `reverse:list-forward`: a `%04x` length header inline, then the listing
/// drained one packet per ack.
fn open_reverse_list(mut packet: Packet, reverse: &[ReverseServer]) -> OpenOutcome {
    if reverse.is_empty() {
        let len = {
            let buf = packet.data_mut();
            buf[..4].copy_from_slice(b"0000");
            4
        };
        packet.stage_len(len);
        return OpenOutcome::OneShot(packet);
    }

    let mut listing = String::new();
    for server in reverse {
        listing.push_str(&format!(
            "host tcp:{} tcp:{}\n",
            server.local_port, server.remote_port
        ));
    }

    let header_len = status::write_length_header(packet.data_mut(), listing.len());
    packet.stage_len(header_len);
    OpenOutcome::Service(
        ServiceBody::ReverseList(ReverseListService {
            data: listing.into_bytes(),
            index: 0,
        }),
        packet,
    )
}

/// `reverse:killforward-all` and `reverse:killforward:tcp:<L>`.
fn open_reverse_kill(
    rest: &str,
    mut packet: Packet,
    reverse: &mut Vec<ReverseServer>,
    ctx: &mut EngineCtx,
) -> OpenOutcome {
    if rest.starts_with("-all") {
        for mut server in reverse.drain(..) {
            server.shutdown(ctx);
        }
        let len = status::write_okay(packet.data_mut());
        packet.stage_len(len);
        return OpenOutcome::OneShot(packet);
    }

    if let Some(rest) = rest.strip_prefix(":tcp:") {
        let port = parse_port(rest).0.unwrap_or(0);
        match reverse.iter().position(|r| r.local_port == port) {
            Some(idx) => {
                let mut server = reverse.remove(idx);
                server.shutdown(ctx);
                let len = status::write_okay(packet.data_mut());
                packet.stage_len(len);
            }
            None => stage_fail(&mut packet, &format!("cannot remove port {}", port)),
        }
        return OpenOutcome::OneShot(packet);
    }

    OpenOutcome::Reject(packet)
}

/// Drains the reverse listing: one packet-sized slice per OKAY, closing on
/// the first ack past the end.
pub struct ReverseListService {
    data: Vec<u8>,
    index: usize,
}

impl ReverseListService {
    pub fn on_write(&mut self, packet: Packet) -> Step {
        Step::Fail(Some(packet))
    }

    pub fn on_ack(&mut self, mut packet: Packet) -> Step {
        let n = min(self.data.len() - self.index, packet.capacity());
        if n == 0 {
            return Step::Fail(Some(packet));
        }

        packet.data_mut()[..n].copy_from_slice(&self.data[self.index..self.index + n]);
        packet.stage_len(n);
        self.index += n;
        Step::Done(packet)
    }
}
