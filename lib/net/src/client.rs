use std::cmp::min;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::mem;

use mio::{Registry, Token};

use adbproto::auth::{AuthKind, KeyStore, SignatureVerifier, TOKEN_SIZE};
use adbproto::frame::MessageHeader;
use adbproto::logging::{self, Logger};
use adbproto::{A_AUTH, A_CLSE, A_CNXN, A_OKAY, A_OPEN, A_VERSION, A_WRTE, HEADER_SIZE};

use crate::config::Config;
use crate::endpoint::TokenTable;
use crate::packet::{Packet, PacketPool, Staged};
use crate::services::shell::ShellSpawner;
use crate::services::tcp::ReverseServer;
use crate::services::{self, Fate, OpenOutcome, ServiceEntry, Step};
use crate::{NonceSource, RebootHook};

/// Event-loop facilities a client borrows for the duration of one event.
/// Collaborators (verifier, nonce source, reboot hook, shell spawner) are
/// owned by the endpoint; services reach them through here.
pub struct EngineCtx<'a> {
    pub registry: &'a Registry,
    pub tokens: &'a mut TokenTable,
    /// Slot of the client being driven, for token routing entries.
    pub slot: usize,
    pub config: &'a Config,
    pub keys: &'a mut KeyStore,
    pub verifier: &'a dyn SignatureVerifier,
    pub nonce: &'a mut dyn NonceSource,
    pub reboot: &'a mut dyn RebootHook,
    pub shell: &'a mut dyn ShellSpawner,
}

/// Send-side handle services use while the client's registry is split off.
/// Frames queued here are flushed when the current event settles.
pub struct Courier<'a> {
    pool: &'a mut PacketPool,
    out: &'a mut VecDeque<Packet>,
    pending_kick: &'a mut bool,
    pub log: &'a Logger,
}

impl<'a> Courier<'a> {
    /// Stream-class packet for service traffic. `None` under saturation;
    /// the service retries on its next kick.
    pub fn allocate(&mut self) -> Option<Packet> {
        self.pool.allocate(false)
    }

    pub fn release(&mut self, packet: Packet) {
        if self.pool.release(packet) {
            *self.pending_kick = true;
        }
    }

    /// Seals and queues a frame whose header the caller prepared.
    pub fn send_frame(&mut self, mut packet: Packet) {
        packet.seal();
        self.out.push_back(packet);
    }

    pub fn send_okay(&mut self, mut packet: Packet, local: u32, remote: u32) {
        packet.staged = Staged::None;
        self.send_okay_with_data(packet, local, remote);
    }

    /// OKAY that keeps the staged reply attached; the pump turns it into a
    /// follow-up WRTE once the OKAY is on the wire.
    pub fn send_okay_with_data(&mut self, mut packet: Packet, local: u32, remote: u32) {
        packet.header.command = A_OKAY;
        packet.header.arg0 = local;
        packet.header.arg1 = remote;
        packet.header.data_length = 0;
        self.send_frame(packet);
    }

    pub fn send_close(&mut self, mut packet: Packet, local: u32, remote: u32) {
        packet.header = MessageHeader::new(A_CLSE, local, remote);
        packet.staged = Staged::None;
        self.send_frame(packet);
    }

    /// OPEN toward the peer (reverse streams invert the usual direction).
    /// `len` payload bytes must already be in the buffer.
    pub fn send_open(&mut self, mut packet: Packet, local: u32, len: usize) {
        packet.header.command = A_OPEN;
        packet.header.arg0 = local;
        packet.header.arg1 = 0;
        packet.header.data_length = len as u32;
        packet.staged = Staged::None;
        self.send_frame(packet);
    }

    /// WRTE carrying the staged bytes. `arg0`/`arg1` must already hold the
    /// sender's stream ids.
    pub fn send_data_frame(&mut self, mut packet: Packet) {
        let len = match packet.staged {
            Staged::Reply(len) => len,
            _ => 0,
        };
        packet.staged = Staged::None;
        packet.header.command = A_WRTE;
        packet.header.data_length = len as u32;
        self.send_frame(packet);
    }
}

/// One peer transport session: the read/write pump, the handshake state and
/// the set of multiplexed services.
///
/// Generic over the byte transport so the protocol machine can be driven by
/// an in-memory channel in tests.
pub struct Client<T> {
    transport: T,
    token: Token,
    pool: PacketPool,
    is_connected: bool,
    next_service_id: u32,
    services: Vec<ServiceEntry>,
    reverse: Vec<ReverseServer>,
    auth_token: [u8; TOKEN_SIZE],
    /// Inbound packet being assembled, with the byte count received so far
    /// (header bytes included). At most one exists at a time.
    cur: Option<(Packet, usize)>,
    header_buf: [u8; HEADER_SIZE],
    read_paused: bool,
    out: VecDeque<Packet>,
    out_cursor: usize,
    pending_kick: bool,
    closing: bool,
    log: Logger,
}

impl<T: Read + Write> Client<T> {
    pub fn new(transport: T, token: Token, config: &Config, log: Logger) -> Client<T> {
        Client {
            transport,
            token,
            pool: PacketPool::new(
                config.frame_max,
                config.payload_size,
                config.cnxn_payload_size,
            ),
            is_connected: false,
            next_service_id: 1,
            services: Vec::new(),
            reverse: Vec::new(),
            auth_token: [0; TOKEN_SIZE],
            cur: None,
            header_buf: [0; HEADER_SIZE],
            read_paused: false,
            out: VecDeque::new(),
            out_cursor: 0,
            pending_kick: false,
            closing: false,
            log,
        }
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    /// True once a fatal error was seen; the endpoint reaps the client at
    /// the next opportunity.
    #[inline]
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    #[inline]
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Transport became readable.
    pub fn on_readable(&mut self, ctx: &mut EngineCtx) {
        if self.closing {
            return;
        }
        self.read_pump(ctx);
        self.settle(ctx);
    }

    /// Transport became writable again after a short write.
    pub fn on_writable(&mut self, ctx: &mut EngineCtx) {
        if self.closing {
            return;
        }
        self.settle(ctx);
    }

    /// Readiness on a socket owned by one of this client's services.
    pub fn on_service_socket(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        ctx: &mut EngineCtx,
    ) {
        if self.closing {
            return;
        }

        if let Some(idx) = self.services.iter().position(|s| s.token() == Some(token)) {
            let fate = {
                let (mut courier, services, _) = self.split();
                services[idx].on_socket_event(readable, writable, &mut courier)
            };
            if let Fate::Close(packet) = fate {
                self.close_service(idx, packet, ctx);
            }
        }

        self.settle(ctx);
    }

    /// A reverse listener owned by this client has pending connections.
    pub fn on_reverse_ready(&mut self, token: Token, ctx: &mut EngineCtx) {
        if self.closing {
            return;
        }

        let ridx = match self.reverse.iter().position(|r| r.token() == token) {
            Some(ridx) => ridx,
            None => return,
        };

        loop {
            match self.reverse[ridx].accept() {
                Ok(Some(socket)) => {
                    let remote_port = self.reverse[ridx].remote_port;
                    if self.next_service_id == 0 {
                        logging::crit!(self.log, "service id space exhausted");
                        self.fail_connection();
                        break;
                    }
                    let body = match services::tcp::reverse_stream(socket, remote_port, ctx) {
                        Ok(body) => body,
                        Err(err) => {
                            logging::warn!(self.log, "reverse stream setup failed";
                                           "error" => %err);
                            continue;
                        }
                    };
                    let id = self.alloc_id();
                    logging::debug!(self.log, "reverse connection accepted";
                                    "id" => id, "remote_port" => remote_port);
                    self.services.push(ServiceEntry {
                        id,
                        peer_id: 0,
                        body,
                    });
                    // Send the OPEN now if a packet is available; otherwise
                    // the kick machinery retries.
                    let idx = self.services.len() - 1;
                    let fate = {
                        let (mut courier, services, _) = self.split();
                        services[idx].on_kick(&mut courier)
                    };
                    if let Fate::Close(packet) = fate {
                        self.close_service(idx, packet, ctx);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    logging::warn!(self.log, "reverse accept failed"; "error" => %err);
                    break;
                }
            }
        }

        self.settle(ctx);
    }

    /// Tears down every service and reverse listener. Called by the endpoint
    /// right before the client is dropped; no frames are emitted since the
    /// transport is already gone.
    pub fn shutdown(&mut self, ctx: &mut EngineCtx) {
        logging::debug!(self.log, "client shutdown";
                        "services" => self.services.len(),
                        "reverse_servers" => self.reverse.len());

        let mut services = mem::replace(&mut self.services, Vec::new());
        for entry in services.iter_mut() {
            entry.on_close(ctx);
        }

        let mut reverse = mem::replace(&mut self.reverse, Vec::new());
        for server in reverse.iter_mut() {
            server.shutdown(ctx);
        }

        self.out.clear();
        self.closing = true;
    }

    fn split(&mut self) -> (Courier<'_>, &mut Vec<ServiceEntry>, &mut Vec<ReverseServer>) {
        let Client {
            pool,
            out,
            pending_kick,
            log,
            services,
            reverse,
            ..
        } = self;
        (
            Courier {
                pool,
                out,
                pending_kick,
                log,
            },
            services,
            reverse,
        )
    }

    #[inline]
    fn fail_connection(&mut self) {
        self.closing = true;
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_service_id;
        self.next_service_id = self.next_service_id.wrapping_add(1);
        id
    }

    fn find_service(&self, id: u32, peer_id: u32) -> Option<usize> {
        self.services
            .iter()
            .position(|s| s.id == id && (peer_id == 0 || s.peer_id == peer_id))
    }

    fn release(&mut self, packet: Packet) {
        if self.pool.release(packet) {
            self.pending_kick = true;
        }
    }

    fn queue(&mut self, mut packet: Packet) {
        packet.seal();
        self.out.push_back(packet);
    }

    fn send_close_with(&mut self, mut packet: Packet, local: u32, remote: u32) {
        packet.header = MessageHeader::new(A_CLSE, local, remote);
        packet.staged = Staged::None;
        self.queue(packet);
    }

    fn send_okay_with_data(&mut self, packet: Packet, local: u32, remote: u32) {
        let (mut courier, _, _) = self.split();
        courier.send_okay_with_data(packet, local, remote);
    }

    fn send_data_frame(&mut self, packet: Packet) {
        let (mut courier, _, _) = self.split();
        courier.send_data_frame(packet);
    }

    fn send_cnxn(&mut self, mut packet: Packet, ctx: &mut EngineCtx) {
        let banner = ctx.config.device.banner();
        let bytes = banner.as_bytes();
        let limit = min(packet.capacity(), ctx.config.cnxn_payload_size);
        let len = min(bytes.len(), limit);

        packet.data_mut()[..len].copy_from_slice(&bytes[..len]);
        packet.header = MessageHeader::new(A_CNXN, A_VERSION, ctx.config.payload_size as u32);
        packet.header.data_length = len as u32;
        packet.staged = Staged::None;
        self.queue(packet);
    }

    fn send_auth_request(&mut self, mut packet: Packet, ctx: &mut EngineCtx) {
        ctx.nonce.fill_nonce(&mut self.auth_token);

        let token = self.auth_token;
        packet.data_mut()[..TOKEN_SIZE].copy_from_slice(&token);
        packet.header = MessageHeader::new(A_AUTH, AuthKind::Token.arg(), 0);
        packet.header.data_length = TOKEN_SIZE as u32;
        packet.staged = Staged::None;
        self.queue(packet);
    }

    /// Pulls bytes off the transport into the current packet, dispatching
    /// each completed frame. Stops on `WouldBlock`, pool saturation or a
    /// fatal error.
    fn read_pump(&mut self, ctx: &mut EngineCtx) {
        loop {
            if self.closing {
                return;
            }

            if self.cur.is_none() {
                match self.pool.allocate(!self.is_connected) {
                    Some(packet) => self.cur = Some((packet, 0)),
                    None => {
                        // No frame available; the release-time kick resumes.
                        self.read_paused = true;
                        return;
                    }
                }
            }

            let mut failed = false;
            let mut complete = false;
            let mut would_block = false;
            {
                let (packet, assembled) = match self.cur.as_mut() {
                    Some(cur) => (&mut cur.0, &mut cur.1),
                    None => return,
                };

                if *assembled < HEADER_SIZE {
                    match self.transport.read(&mut self.header_buf[*assembled..HEADER_SIZE]) {
                        Ok(0) => {
                            logging::debug!(self.log, "transport eof");
                            failed = true;
                        }
                        Ok(n) => {
                            *assembled += n;
                            if *assembled == HEADER_SIZE {
                                packet.header = MessageHeader::decode(&self.header_buf);
                                let limit = if self.is_connected {
                                    ctx.config.payload_size
                                } else {
                                    ctx.config.cnxn_payload_size
                                };
                                let limit = min(limit, packet.capacity());
                                if let Err(err) = packet.header.check(limit) {
                                    logging::warn!(self.log, "bad frame header";
                                                   "error" => %err);
                                    failed = true;
                                }
                            }
                        }
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                            would_block = true;
                        }
                        Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            logging::warn!(self.log, "transport read failed"; "error" => %err);
                            failed = true;
                        }
                    }
                } else {
                    let body_len = packet.header.data_length as usize;
                    let total = HEADER_SIZE + body_len;
                    if *assembled < total {
                        let start = *assembled - HEADER_SIZE;
                        match self.transport.read(&mut packet.data_mut()[start..body_len]) {
                            Ok(0) => {
                                logging::debug!(self.log, "transport eof");
                                failed = true;
                            }
                            Ok(n) => *assembled += n,
                            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                                would_block = true;
                            }
                            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                            Err(err) => {
                                logging::warn!(self.log, "transport read failed";
                                               "error" => %err);
                                failed = true;
                            }
                        }
                    }
                    complete = *assembled >= total;
                }
            }

            if would_block {
                // Nothing buffered at a frame boundary: hand the packet back
                // rather than idle-holding it against the pool bound.
                if self.cur.as_ref().map(|cur| cur.1 == 0) == Some(true) {
                    if let Some((packet, _)) = self.cur.take() {
                        self.release(packet);
                    }
                }
                return;
            }

            if failed {
                if let Some((packet, _)) = self.cur.take() {
                    self.pool.release(packet);
                }
                self.fail_connection();
                return;
            }

            if complete {
                let (packet, _) = match self.cur.take() {
                    Some(cur) => cur,
                    None => return,
                };

                if packet.header.check_data(packet.payload()).is_err() {
                    logging::warn!(self.log, "bad frame checksum");
                    self.pool.release(packet);
                    self.fail_connection();
                    return;
                }

                self.dispatch(packet, ctx);
            }
        }
    }

    /// Drains the out-queue onto the transport. Stops on `WouldBlock`
    /// (resumed by the next writable edge); errors are fatal.
    fn flush(&mut self) -> io::Result<()> {
        loop {
            let finished = {
                let packet = match self.out.front() {
                    Some(packet) => packet,
                    None => return Ok(()),
                };

                let mut header_buf = [0u8; HEADER_SIZE];
                packet.header.encode(&mut header_buf);
                let total = HEADER_SIZE + packet.header.data_length as usize;

                loop {
                    if self.out_cursor >= total {
                        break true;
                    }

                    let result = if self.out_cursor < HEADER_SIZE {
                        self.transport.write(&header_buf[self.out_cursor..])
                    } else {
                        self.transport
                            .write(&packet.payload()[self.out_cursor - HEADER_SIZE..])
                    };

                    match result {
                        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                        Ok(n) => self.out_cursor += n,
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                            return Ok(());
                        }
                        Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => return Err(err),
                    }
                }
            };

            if finished {
                self.out_cursor = 0;
                let packet = match self.out.pop_front() {
                    Some(packet) => packet,
                    None => return Ok(()),
                };
                self.finish_write(packet);
            }
        }
    }

    /// A frame fully left the transport. Packets with a staged reply morph
    /// into the WRTE carrying it (the usual OKAY-then-payload sequence);
    /// everything else goes back to the pool.
    fn finish_write(&mut self, mut packet: Packet) {
        if let Staged::Reply(len) = packet.staged {
            packet.staged = Staged::None;
            packet.header.command = A_WRTE;
            packet.header.data_length = len as u32;
            packet.seal();
            self.out.push_back(packet);
        } else {
            self.release(packet);
        }
    }

    /// Flushes queued frames and runs deferred kicks until the client is
    /// quiescent. Every entry point funnels through here before returning
    /// to the event loop.
    fn settle(&mut self, ctx: &mut EngineCtx) {
        loop {
            if self.closing {
                return;
            }

            if let Err(err) = self.flush() {
                logging::warn!(self.log, "transport write failed"; "error" => %err);
                self.fail_connection();
                return;
            }

            if !self.pending_kick {
                return;
            }
            self.pending_kick = false;

            if self.read_paused {
                self.read_paused = false;
                self.read_pump(ctx);
            }
            self.kick_services(ctx);
        }
    }

    fn kick_services(&mut self, ctx: &mut EngineCtx) {
        let mut idx = 0;
        while idx < self.services.len() {
            let fate = {
                let (mut courier, services, _) = self.split();
                services[idx].on_kick(&mut courier)
            };
            match fate {
                Fate::Alive => idx += 1,
                Fate::Close(packet) => self.close_service(idx, packet, ctx),
            }
        }
    }

    /// Unlinks a service; when a packet is supplied the peer is told with a
    /// CLSE frame (locally initiated close), otherwise the peer already
    /// closed its half.
    fn close_service(&mut self, idx: usize, packet: Option<Packet>, ctx: &mut EngineCtx) {
        let mut entry = self.services.remove(idx);
        logging::debug!(self.log, "service closed"; "id" => entry.id, "peer" => entry.peer_id);

        // Packets the service was still holding go back to the pool.
        while let Some(held) = entry.reclaim() {
            self.release(held);
        }

        if let Some(packet) = packet {
            self.send_close_with(packet, entry.id, entry.peer_id);
        }
        entry.on_close(ctx);
    }

    fn dispatch(&mut self, mut packet: Packet, ctx: &mut EngineCtx) {
        packet.staged = Staged::None;

        match packet.header.command {
            A_CNXN => {
                // CONNECT(version, maxdata, "system-id-string")
                if ctx.config.auth_required && !self.is_connected {
                    self.send_auth_request(packet, ctx);
                    return;
                }
                self.send_cnxn(packet, ctx);
                self.is_connected = true;
            }
            A_AUTH if ctx.config.auth_required && !self.is_connected => {
                self.handle_auth(packet, ctx);
            }
            A_OPEN if self.is_connected => self.handle_open(packet, ctx),
            A_CLSE if self.is_connected => self.handle_close(packet, ctx),
            A_WRTE if self.is_connected => self.handle_write(packet, ctx),
            A_OKAY if self.is_connected => self.handle_okay(packet, ctx),
            command => {
                logging::warn!(self.log, "unexpected command";
                               "command" => format!("{:08x}", command),
                               "connected" => self.is_connected);
                self.release(packet);
                self.fail_connection();
            }
        }
    }

    fn handle_auth(&mut self, packet: Packet, ctx: &mut EngineCtx) {
        // AUTH(type, 0, "data")
        match AuthKind::from_arg(packet.header.arg0) {
            Some(AuthKind::Token) => {
                // Peer echo, nothing to do.
                self.release(packet);
            }
            Some(AuthKind::Signature) => {
                let verified = {
                    let signature = packet.payload();
                    ctx.keys
                        .iter()
                        .any(|key| ctx.verifier.verify(key, signature, &self.auth_token))
                };

                if verified {
                    logging::info!(self.log, "auth signature accepted");
                    self.send_cnxn(packet, ctx);
                    self.is_connected = true;
                } else {
                    logging::info!(self.log, "auth signature rejected, re-challenging");
                    self.send_auth_request(packet, ctx);
                }
            }
            Some(AuthKind::PublicKey) => {
                if ctx.config.auth_pubkey_autoaccept {
                    let offered = String::from_utf8_lossy(packet.payload()).into_owned();
                    let store = KeyStore::parse(offered.trim_matches('\0'));
                    for key in store.iter() {
                        ctx.keys.add(key.to_vec());
                    }
                    logging::info!(self.log, "accepting offered public key");
                    self.send_cnxn(packet, ctx);
                    self.is_connected = true;
                } else {
                    self.send_auth_request(packet, ctx);
                }
            }
            None => {
                logging::warn!(self.log, "invalid auth id"; "arg0" => packet.header.arg0);
                self.release(packet);
            }
        }
    }

    fn handle_open(&mut self, packet: Packet, ctx: &mut EngineCtx) {
        // OPEN(local-id, 0, "destination")
        if packet.header.arg0 == 0 || packet.header.arg1 != 0 {
            self.release(packet);
            return;
        }

        if self.next_service_id == 0 {
            logging::crit!(self.log, "service id space exhausted");
            self.release(packet);
            self.fail_connection();
            return;
        }

        let peer_id = packet.header.arg0;

        // The name is NUL-terminated in the payload; cut at the first NUL.
        let name = {
            let raw = packet.payload();
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            match std::str::from_utf8(&raw[..end]) {
                Ok(name) => name.to_string(),
                Err(_) => {
                    logging::warn!(self.log, "open request with non-utf8 name");
                    self.send_close_with(packet, 0, peer_id);
                    return;
                }
            }
        };

        let outcome = services::open_service(&name, packet, &mut self.reverse, ctx);

        match outcome {
            OpenOutcome::Service(body, mut packet) => {
                let id = self.alloc_id();
                logging::debug!(self.log, "service open";
                                "name" => &name, "id" => id, "peer" => peer_id);
                self.services.push(ServiceEntry { id, peer_id, body });

                if packet.staged == Staged::InitAsync {
                    // The OKAY (or CLSE) is deferred to the completion
                    // callback; the packet is done.
                    packet.staged = Staged::None;
                    self.release(packet);
                } else {
                    self.send_okay_with_data(packet, id, peer_id);
                }
            }
            OpenOutcome::OneShot(packet) => {
                // Allocate an id purely so the OKAY carries a non-zero
                // local id; nothing is registered.
                let id = self.alloc_id();
                logging::debug!(self.log, "one-shot service";
                                "name" => &name, "id" => id, "peer" => peer_id);
                self.send_okay_with_data(packet, id, peer_id);
            }
            OpenOutcome::Reject(packet) => {
                logging::info!(self.log, "rejecting service"; "name" => &name);
                self.send_close_with(packet, 0, peer_id);
            }
        }
    }

    fn handle_close(&mut self, packet: Packet, ctx: &mut EngineCtx) {
        // CLOSE(local-id, remote-id, "") or CLOSE(0, remote-id, "")
        if let Some(idx) = self.find_service(packet.header.arg1, packet.header.arg0) {
            self.close_service(idx, None, ctx);
        }
        self.release(packet);
    }

    fn handle_write(&mut self, packet: Packet, ctx: &mut EngineCtx) {
        // WRITE(local-id, remote-id, <data>)
        let idx = match self.find_service(packet.header.arg1, packet.header.arg0) {
            Some(idx) => idx,
            None => {
                // Make sure the stream is closed on the peer side.
                let (arg0, arg1) = (packet.header.arg0, packet.header.arg1);
                self.send_close_with(packet, arg1, arg0);
                return;
            }
        };

        let step = {
            let (mut courier, services, _) = self.split();
            services[idx].on_write(packet, &mut courier)
        };

        match step {
            Step::Done(packet) => {
                let (id, peer_id) = (self.services[idx].id, self.services[idx].peer_id);
                self.send_okay_with_data(packet, id, peer_id);
            }
            Step::Async => {}
            Step::Fail(packet) => self.close_service(idx, packet, ctx),
        }
    }

    fn handle_okay(&mut self, packet: Packet, ctx: &mut EngineCtx) {
        // READY(local-id, remote-id, "")
        let idx = match self.find_service(packet.header.arg1, 0) {
            Some(idx) => idx,
            None => {
                let (arg0, arg1) = (packet.header.arg0, packet.header.arg1);
                self.send_close_with(packet, arg1, arg0);
                return;
            }
        };

        if self.services[idx].peer_id == 0 {
            // First OKAY from the opener teaches us its stream id.
            self.services[idx].peer_id = packet.header.arg0;
        }

        let step = {
            let (mut courier, services, _) = self.split();
            services[idx].on_ack(packet, &mut courier)
        };

        match step {
            Step::Done(mut packet) => {
                if let Staged::Reply(_) = packet.staged {
                    let (id, peer_id) = (self.services[idx].id, self.services[idx].peer_id);
                    packet.header.arg0 = id;
                    packet.header.arg1 = peer_id;
                    self.send_data_frame(packet);
                } else {
                    self.release(packet);
                }
            }
            Step::Async => {}
            Step::Fail(packet) => self.close_service(idx, packet, ctx),
        }
    }
}
