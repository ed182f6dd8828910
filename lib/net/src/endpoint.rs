//! The event-loop endpoint: owns the poll, the ADB listener and every
//! client, and routes readiness events to the component that owns the
//! ready handle. Strictly single-threaded; `sync` is one cooperative step.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use indexmap::IndexSet;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};

use adbproto::auth::{KeyStore, SignatureVerifier};
use adbproto::logging::{self, Logger};

use crate::client::{Client, EngineCtx};
use crate::config::Config;
use crate::services::shell::ShellSpawner;
use crate::{NonceSource, RebootHook};

/// What a poll token routes to.
#[derive(Debug, Copy, Clone)]
pub enum TokenEntry {
    /// The ADB listener itself.
    Listener,
    /// A client transport stream.
    Client(usize),
    /// A socket (or pipe) owned by one of the client's services.
    Service { client: usize },
    /// A reverse listener owned by the client.
    Reverse { client: usize },
}

/// Token allocation table. Freed slots are quarantined until the end of the
/// poll round so a token is never reissued while stale events for it may
/// still be queued.
pub struct TokenTable {
    entries: Vec<Option<TokenEntry>>,
    free: Vec<usize>,
    retired: Vec<usize>,
}

impl TokenTable {
    pub fn new() -> TokenTable {
        TokenTable {
            entries: Vec::new(),
            free: Vec::new(),
            retired: Vec::new(),
        }
    }

    pub fn insert(&mut self, entry: TokenEntry) -> Token {
        match self.free.pop() {
            Some(idx) => {
                self.entries[idx] = Some(entry);
                Token(idx)
            }
            None => {
                self.entries.push(Some(entry));
                Token(self.entries.len() - 1)
            }
        }
    }

    pub fn get(&self, token: Token) -> Option<TokenEntry> {
        self.entries.get(token.0).and_then(|entry| *entry)
    }

    pub fn remove(&mut self, token: Token) {
        if let Some(entry) = self.entries.get_mut(token.0) {
            if entry.take().is_some() {
                self.retired.push(token.0);
            }
        }
    }

    /// Makes retired slots allocatable again; called between poll rounds.
    pub fn recycle(&mut self) {
        self.free.extend(self.retired.drain(..));
    }
}

/// External collaborators wired in by the daemon.
pub struct Collaborators {
    pub verifier: Box<dyn SignatureVerifier>,
    pub nonce: Box<dyn NonceSource>,
    pub reboot: Box<dyn RebootHook>,
    pub shell: Box<dyn ShellSpawner>,
}

/// Accepts ADB connections and drives every client on one poll.
pub struct Endpoint {
    poll: Poll,
    events: Events,
    registry: Registry,
    listener: TcpListener,
    tokens: TokenTable,
    clients: Vec<Option<Client<TcpStream>>>,
    free_clients: Vec<usize>,
    live: IndexSet<usize>,
    config: Config,
    keys: KeyStore,
    hooks: Collaborators,
    log: Logger,
}

impl Endpoint {
    pub fn new(
        config: Config,
        keys: KeyStore,
        hooks: Collaborators,
        log: Logger,
    ) -> io::Result<Endpoint> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let mut tokens = TokenTable::new();

        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port));
        let mut listener = TcpListener::bind(addr)?;
        let token = tokens.insert(TokenEntry::Listener);
        registry.register(&mut listener, token, Interest::READABLE)?;

        logging::info!(log, "listening"; "addr" => %listener.local_addr()?);

        Ok(Endpoint {
            poll,
            events: Events::with_capacity(1024),
            registry,
            listener,
            tokens,
            clients: Vec::new(),
            free_clients: Vec::new(),
            live: IndexSet::new(),
            config,
            keys,
            hooks,
            log,
        })
    }

    /// Address actually bound (useful with `port = 0`).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of live client connections.
    pub fn client_count(&self) -> usize {
        self.live.len()
    }

    /// Drives the loop until the process dies.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.sync(None)?;
        }
    }

    /// One poll round: waits up to `timeout`, dispatches every event and
    /// reaps clients whose transport failed.
    pub fn sync(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }

        let pending: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.is_readable(), event.is_writable()))
            .collect();

        for (token, readable, writable) in pending {
            match self.tokens.get(token) {
                Some(TokenEntry::Listener) => self.accept_clients(),
                Some(TokenEntry::Client(slot)) => {
                    self.drive_client(slot, |client, ctx| {
                        if readable {
                            client.on_readable(ctx);
                        }
                        if writable {
                            client.on_writable(ctx);
                        }
                    });
                    self.reap(slot);
                }
                Some(TokenEntry::Service { client: slot }) => {
                    self.drive_client(slot, |client, ctx| {
                        client.on_service_socket(token, readable, writable, ctx)
                    });
                    self.reap(slot);
                }
                Some(TokenEntry::Reverse { client: slot }) => {
                    self.drive_client(slot, |client, ctx| client.on_reverse_ready(token, ctx));
                    self.reap(slot);
                }
                // Retired earlier in this round.
                None => {}
            }
        }

        self.tokens.recycle();
        Ok(())
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let slot = match self.free_clients.pop() {
                        Some(slot) => slot,
                        None => {
                            self.clients.push(None);
                            self.clients.len() - 1
                        }
                    };

                    let token = self.tokens.insert(TokenEntry::Client(slot));
                    if let Err(err) = self.registry.register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        logging::warn!(self.log, "client registration failed"; "error" => %err);
                        self.tokens.remove(token);
                        self.free_clients.push(slot);
                        continue;
                    }

                    logging::info!(self.log, "client connected"; "peer" => %peer, "slot" => slot);
                    let log = self.log.new(logging::o!("client" => slot));
                    self.clients[slot] = Some(Client::new(stream, token, &self.config, log));
                    self.live.insert(slot);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn drive_client<F>(&mut self, slot: usize, f: F)
    where
        F: FnOnce(&mut Client<TcpStream>, &mut EngineCtx),
    {
        let Endpoint {
            registry,
            tokens,
            clients,
            config,
            keys,
            hooks,
            ..
        } = self;

        if let Some(Some(client)) = clients.get_mut(slot) {
            let mut ctx = EngineCtx {
                registry,
                tokens,
                slot,
                config,
                keys,
                verifier: hooks.verifier.as_ref(),
                nonce: hooks.nonce.as_mut(),
                reboot: hooks.reboot.as_mut(),
                shell: hooks.shell.as_mut(),
            };
            f(client, &mut ctx);
        }
    }

    /// Drops a client whose transport failed, cancelling all owned streams
    /// eagerly and synchronously.
    fn reap(&mut self, slot: usize) {
        let closing = match self.clients.get(slot) {
            Some(Some(client)) => client.is_closing(),
            _ => false,
        };
        if !closing {
            return;
        }

        self.drive_client(slot, |client, ctx| client.shutdown(ctx));

        if let Some(mut client) = self.clients.get_mut(slot).and_then(|c| c.take()) {
            let _ = self.registry.deregister(client.transport_mut());
            self.tokens.remove(client.token());
            logging::info!(self.log, "client gone"; "slot" => slot);
        }

        self.live.remove(&slot);
        self.free_clients.push(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::shell::ShellSession;
    use adbproto::auth::TOKEN_SIZE;
    use adbproto::frame::MessageHeader;
    use adbproto::{A_AUTH, A_CLSE, A_CNXN, A_OKAY, A_OPEN, A_VERSION, A_WRTE, HEADER_SIZE};
    use std::cell::RefCell;
    use std::io::{Read, Write};
    use std::rc::Rc;

    struct SeqNonce(u8);

    impl NonceSource for SeqNonce {
        fn fill_nonce(&mut self, buf: &mut [u8]) {
            self.0 = self.0.wrapping_add(1);
            for b in buf.iter_mut() {
                *b = self.0;
            }
        }
    }

    struct AcceptAll;

    impl SignatureVerifier for AcceptAll {
        fn verify(&self, _key: &[u8], _sig: &[u8], _token: &[u8; TOKEN_SIZE]) -> bool {
            true
        }
    }

    #[derive(Clone, Default)]
    struct RebootLog(Rc<RefCell<Vec<String>>>);

    impl RebootHook for RebootLog {
        fn reboot(&mut self, target: &str) {
            self.0.borrow_mut().push(target.to_string());
        }
    }

    struct NoShell;

    impl ShellSpawner for NoShell {
        fn spawn(&mut self, _command: Option<&str>) -> io::Result<Box<dyn ShellSession>> {
            Err(io::ErrorKind::Unsupported.into())
        }
    }

    fn hooks(reboot: RebootLog) -> Collaborators {
        Collaborators {
            verifier: Box::new(AcceptAll),
            nonce: Box::new(SeqNonce(0)),
            reboot: Box::new(reboot),
            shell: Box::new(NoShell),
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.port = 0;
        config.payload_size = 256;
        config
    }

    fn endpoint_with(config: Config, keys: KeyStore, reboot: RebootLog) -> Endpoint {
        Endpoint::new(config, keys, hooks(reboot), logging::discard()).unwrap()
    }

    fn endpoint() -> Endpoint {
        endpoint_with(test_config(), KeyStore::new(), RebootLog::default())
    }

    fn connect(endpoint: &mut Endpoint) -> std::net::TcpStream {
        let addr = endpoint.local_addr().unwrap();
        let host = std::net::TcpStream::connect(addr).unwrap();
        host.set_nodelay(true).unwrap();
        host.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
        host
    }

    fn send_frame(
        host: &mut std::net::TcpStream,
        command: u32,
        arg0: u32,
        arg1: u32,
        payload: &[u8],
    ) {
        let mut header = MessageHeader::new(command, arg0, arg1);
        header.seal(payload);
        let mut buf = [0u8; HEADER_SIZE];
        header.encode(&mut buf);
        host.write_all(&buf).unwrap();
        host.write_all(payload).unwrap();
    }

    fn read_exact_stepping(
        host: &mut std::net::TcpStream,
        endpoint: &mut Endpoint,
        buf: &mut [u8],
    ) {
        let mut got = 0;
        for _ in 0..1000 {
            endpoint.sync(Some(Duration::from_millis(2))).unwrap();
            if got == buf.len() {
                return;
            }
            match host.read(&mut buf[got..]) {
                Ok(0) => panic!("daemon closed the connection"),
                Ok(n) => got += n,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(ref err) if err.kind() == io::ErrorKind::TimedOut => {}
                Err(err) => panic!("read failed: {}", err),
            }
        }
        assert_eq!(got, buf.len(), "timed out waiting for {} bytes", buf.len());
    }

    fn read_frame(
        host: &mut std::net::TcpStream,
        endpoint: &mut Endpoint,
    ) -> (MessageHeader, Vec<u8>) {
        let mut header_buf = [0u8; HEADER_SIZE];
        read_exact_stepping(host, endpoint, &mut header_buf);
        let header = MessageHeader::decode(&header_buf);

        let mut payload = vec![0u8; header.data_length as usize];
        if !payload.is_empty() {
            read_exact_stepping(host, endpoint, &mut payload);
        }
        (header, payload)
    }

    /// No frame should arrive within a few rounds.
    fn assert_quiet(host: &mut std::net::TcpStream, endpoint: &mut Endpoint) {
        let mut buf = [0u8; 1];
        for _ in 0..20 {
            endpoint.sync(Some(Duration::from_millis(2))).unwrap();
            match host.read(&mut buf) {
                Ok(0) => panic!("daemon closed the connection"),
                Ok(_) => panic!("unexpected frame data"),
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut => {}
                Err(err) => panic!("read failed: {}", err),
            }
        }
    }

    fn handshake(endpoint: &mut Endpoint) -> std::net::TcpStream {
        let mut host = connect(endpoint);
        send_frame(&mut host, A_CNXN, A_VERSION, 0x40, b"host::features=cmd\0");

        let (header, payload) = read_frame(&mut host, endpoint);
        assert_eq!(header.command, A_CNXN);
        assert_eq!(header.arg0, A_VERSION);
        assert_eq!(header.arg1, 256);
        assert!(payload.starts_with(b"device:"));
        host
    }

    #[test]
    fn test_handshake_without_auth() {
        let mut endpoint = endpoint();
        let _host = handshake(&mut endpoint);
    }

    #[test]
    fn test_handshake_with_auth() {
        let mut config = test_config();
        config.auth_required = true;
        let keys = KeyStore::parse("aGVsbG8=\n");
        let mut endpoint = endpoint_with(config, keys, RebootLog::default());

        let mut host = connect(&mut endpoint);
        send_frame(&mut host, A_CNXN, A_VERSION, 0x40, b"host::\0");

        let (challenge, nonce) = read_frame(&mut host, &mut endpoint);
        assert_eq!(challenge.command, A_AUTH);
        assert_eq!(challenge.arg0, 1);
        assert_eq!(nonce.len(), TOKEN_SIZE);

        send_frame(&mut host, A_AUTH, 2, 0, b"any-signature-will-do");
        let (header, payload) = read_frame(&mut host, &mut endpoint);
        assert_eq!(header.command, A_CNXN);
        assert!(payload.starts_with(b"device:"));
    }

    #[test]
    fn test_auth_retry_rerandomises_nonce() {
        let mut config = test_config();
        config.auth_required = true;
        // No trusted keys: every signature is rejected.
        let mut endpoint = endpoint_with(config, KeyStore::new(), RebootLog::default());

        let mut host = connect(&mut endpoint);
        send_frame(&mut host, A_CNXN, A_VERSION, 0x40, b"host::\0");
        let (_, first_nonce) = read_frame(&mut host, &mut endpoint);

        send_frame(&mut host, A_AUTH, 2, 0, b"bad-signature");
        let (challenge, second_nonce) = read_frame(&mut host, &mut endpoint);
        assert_eq!(challenge.command, A_AUTH);
        assert_eq!(challenge.arg0, 1);
        assert_ne!(first_nonce, second_nonce);
    }

    #[test]
    fn test_reboot_one_shot() {
        let reboot = RebootLog::default();
        let mut endpoint = endpoint_with(test_config(), KeyStore::new(), reboot.clone());
        let mut host = handshake(&mut endpoint);

        send_frame(&mut host, A_OPEN, 7, 0, b"reboot:now\0");
        let (header, _) = read_frame(&mut host, &mut endpoint);

        assert_eq!(header.command, A_OKAY);
        assert_ne!(header.arg0, 0);
        assert_eq!(header.arg1, 7);
        assert_eq!(*reboot.0.borrow(), vec!["now".to_string()]);
    }

    #[test]
    fn test_open_unknown_service_rejected() {
        let mut endpoint = endpoint();
        let mut host = handshake(&mut endpoint);

        send_frame(&mut host, A_OPEN, 5, 0, b"frobnicate:\0");
        let (header, _) = read_frame(&mut host, &mut endpoint);

        assert_eq!(header.command, A_CLSE);
        assert_eq!(header.arg0, 0);
        assert_eq!(header.arg1, 5);
    }

    #[test]
    fn test_malformed_open_ignored() {
        let mut endpoint = endpoint();
        let mut host = handshake(&mut endpoint);

        // arg0 == 0 and arg1 != 0 are both rejected without a reply.
        send_frame(&mut host, A_OPEN, 0, 0, b"sync:\0");
        send_frame(&mut host, A_OPEN, 6, 9, b"sync:\0");
        assert_quiet(&mut host, &mut endpoint);
    }

    #[test]
    fn test_close_unknown_stream_is_silent() {
        let mut endpoint = endpoint();
        let mut host = handshake(&mut endpoint);

        send_frame(&mut host, A_CLSE, 11, 22, b"");
        assert_quiet(&mut host, &mut endpoint);
    }

    #[test]
    fn test_write_unknown_stream_closes_peer_half() {
        let mut endpoint = endpoint();
        let mut host = handshake(&mut endpoint);

        send_frame(&mut host, A_WRTE, 11, 22, b"data");
        let (header, _) = read_frame(&mut host, &mut endpoint);

        assert_eq!(header.command, A_CLSE);
        assert_eq!(header.arg0, 22);
        assert_eq!(header.arg1, 11);
    }

    #[test]
    fn test_forward_roundtrip() {
        let mut endpoint = endpoint();
        let mut host = handshake(&mut endpoint);

        let target = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = target.local_addr().unwrap().port();
        target.set_nonblocking(true).unwrap();

        send_frame(
            &mut host,
            A_OPEN,
            9,
            0,
            format!("tcp:{}\0", port).as_bytes(),
        );

        // The daemon connects to the target while we step the loop.
        let mut accepted = None;
        for _ in 0..500 {
            endpoint.sync(Some(Duration::from_millis(2))).unwrap();
            match target.accept() {
                Ok((socket, _)) => {
                    accepted = Some(socket);
                    break;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => panic!("accept failed: {}", err),
            }
        }
        let mut socket = accepted.expect("daemon never connected");
        socket.set_nodelay(true).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();

        let (okay, _) = read_frame(&mut host, &mut endpoint);
        assert_eq!(okay.command, A_OKAY);
        assert_eq!(okay.arg1, 9);
        let stream_id = okay.arg0;
        assert_ne!(stream_id, 0);

        // Peer to socket.
        send_frame(&mut host, A_WRTE, 9, stream_id, b"hello");
        let (ack, _) = read_frame(&mut host, &mut endpoint);
        assert_eq!(ack.command, A_OKAY);
        assert_eq!(ack.arg0, stream_id);
        assert_eq!(ack.arg1, 9);

        let mut received = [0u8; 5];
        let mut got = 0;
        for _ in 0..500 {
            endpoint.sync(Some(Duration::from_millis(2))).unwrap();
            match socket.read(&mut received[got..]) {
                Ok(0) => panic!("socket closed early"),
                Ok(n) => {
                    got += n;
                    if got == received.len() {
                        break;
                    }
                }
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut => {}
                Err(err) => panic!("socket read failed: {}", err),
            }
        }
        assert_eq!(&received, b"hello");

        // Socket to peer.
        socket.write_all(b"world").unwrap();
        let (data, payload) = read_frame(&mut host, &mut endpoint);
        assert_eq!(data.command, A_WRTE);
        assert_eq!(data.arg0, stream_id);
        assert_eq!(data.arg1, 9);
        assert_eq!(payload, b"world");
        send_frame(&mut host, A_OKAY, 9, stream_id, b"");

        // Closing the stream tears the socket down.
        send_frame(&mut host, A_CLSE, 9, stream_id, b"");
        let mut buf = [0u8; 8];
        let mut closed = false;
        for _ in 0..500 {
            endpoint.sync(Some(Duration::from_millis(2))).unwrap();
            match socket.read(&mut buf) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(_) => {}
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut => {}
                Err(_) => {
                    closed = true;
                    break;
                }
            }
        }
        assert!(closed, "socket survived the CLSE");
    }

    #[test]
    fn test_forward_connect_refused() {
        let mut endpoint = endpoint();
        let mut host = handshake(&mut endpoint);

        // Grab a port that nothing listens on.
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        send_frame(
            &mut host,
            A_OPEN,
            9,
            0,
            format!("tcp:{}\0", port).as_bytes(),
        );

        let (header, _) = read_frame(&mut host, &mut endpoint);
        assert_eq!(header.command, A_CLSE);
        // Local id zero marks a failed OPEN.
        assert_eq!(header.arg0, 0);
    }

    #[test]
    fn test_one_wrte_per_okay() {
        let mut endpoint = endpoint();
        let mut host = handshake(&mut endpoint);

        let target = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = target.local_addr().unwrap().port();
        target.set_nonblocking(true).unwrap();

        send_frame(
            &mut host,
            A_OPEN,
            9,
            0,
            format!("tcp:{}\0", port).as_bytes(),
        );

        let mut accepted = None;
        for _ in 0..500 {
            endpoint.sync(Some(Duration::from_millis(2))).unwrap();
            if let Ok((socket, _)) = target.accept() {
                accepted = Some(socket);
                break;
            }
        }
        let mut socket = accepted.expect("daemon never connected");

        let (okay, _) = read_frame(&mut host, &mut endpoint);
        assert_eq!(okay.command, A_OKAY);
        let stream_id = okay.arg0;

        // Much more data than one stream-class payload.
        socket.write_all(&[0x55u8; 2048]).unwrap();

        let (first, payload) = read_frame(&mut host, &mut endpoint);
        assert_eq!(first.command, A_WRTE);
        assert!(payload.len() <= 256);

        // Without an ack, no second WRTE may arrive.
        assert_quiet(&mut host, &mut endpoint);

        // One ack, exactly one more WRTE.
        send_frame(&mut host, A_OKAY, 9, stream_id, b"");
        let (second, payload) = read_frame(&mut host, &mut endpoint);
        assert_eq!(second.command, A_WRTE);
        assert!(payload.len() <= 256);
        assert_quiet(&mut host, &mut endpoint);
    }

    #[test]
    fn test_reverse_listen_and_accept() {
        let mut endpoint = endpoint();
        let mut host = handshake(&mut endpoint);

        let listen_port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        send_frame(
            &mut host,
            A_OPEN,
            3,
            0,
            format!("reverse:forward:tcp:{} tcp:8888\0", listen_port).as_bytes(),
        );

        let (okay, _) = read_frame(&mut host, &mut endpoint);
        assert_eq!(okay.command, A_OKAY);
        assert_ne!(okay.arg0, 0);
        assert_eq!(okay.arg1, 3);

        // The inline reply rides the follow-up WRTE. One-shots register
        // nothing, so the reply is not acknowledged.
        let (reply, payload) = read_frame(&mut host, &mut endpoint);
        assert_eq!(reply.command, A_WRTE);
        let expected = format!("OKAY{:04x}{}", listen_port.to_string().len(), listen_port);
        assert_eq!(payload, expected.as_bytes());

        // An external process connects to the reverse port.
        let mut external = None;
        for _ in 0..500 {
            endpoint.sync(Some(Duration::from_millis(2))).unwrap();
            match std::net::TcpStream::connect(("127.0.0.1", listen_port)) {
                Ok(socket) => {
                    external = Some(socket);
                    break;
                }
                Err(_) => {}
            }
        }
        let mut external = external.expect("reverse listener never came up");
        external.set_nodelay(true).unwrap();
        external
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();

        // The daemon opens a stream toward the host.
        let (open, payload) = read_frame(&mut host, &mut endpoint);
        assert_eq!(open.command, A_OPEN);
        assert_ne!(open.arg0, 0);
        assert_eq!(open.arg1, 0);
        assert_eq!(payload, b"tcp:8888\0");
        let stream_id = open.arg0;

        send_frame(&mut host, A_OKAY, 77, stream_id, b"");

        // Bridge external -> host.
        external.write_all(b"ping").unwrap();
        let (data, payload) = read_frame(&mut host, &mut endpoint);
        assert_eq!(data.command, A_WRTE);
        assert_eq!(data.arg0, stream_id);
        assert_eq!(data.arg1, 77);
        assert_eq!(payload, b"ping");
        send_frame(&mut host, A_OKAY, 77, stream_id, b"");

        // Bridge host -> external.
        send_frame(&mut host, A_WRTE, 77, stream_id, b"pong");
        let (ack, _) = read_frame(&mut host, &mut endpoint);
        assert_eq!(ack.command, A_OKAY);

        let mut received = [0u8; 4];
        let mut got = 0;
        for _ in 0..500 {
            endpoint.sync(Some(Duration::from_millis(2))).unwrap();
            match external.read(&mut received[got..]) {
                Ok(0) => panic!("external socket closed early"),
                Ok(n) => {
                    got += n;
                    if got == 4 {
                        break;
                    }
                }
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut => {}
                Err(err) => panic!("external read failed: {}", err),
            }
        }
        assert_eq!(&received, b"pong");
    }

    #[test]
    fn test_reverse_list_and_kill() {
        let mut endpoint = endpoint();
        let mut host = handshake(&mut endpoint);

        let listen_port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        send_frame(
            &mut host,
            A_OPEN,
            3,
            0,
            format!("reverse:forward:tcp:{} tcp:9000\0", listen_port).as_bytes(),
        );
        let (_, _) = read_frame(&mut host, &mut endpoint); // OKAY
        let (_, payload) = read_frame(&mut host, &mut endpoint); // inline reply
        assert!(payload.starts_with(b"OKAY"));

        // Duplicate local port is refused with a FAIL payload.
        send_frame(
            &mut host,
            A_OPEN,
            4,
            0,
            format!("reverse:forward:tcp:{} tcp:9001\0", listen_port).as_bytes(),
        );
        let (_, _) = read_frame(&mut host, &mut endpoint);
        let (_, payload) = read_frame(&mut host, &mut endpoint);
        assert!(payload.starts_with(b"FAIL"));

        // Listing drains the registered forwards.
        send_frame(&mut host, A_OPEN, 5, 0, b"reverse:list-forward\0");
        let (list_okay, _) = read_frame(&mut host, &mut endpoint);
        assert_eq!(list_okay.command, A_OKAY);
        let list_id = list_okay.arg0;

        let (hdr, header_payload) = read_frame(&mut host, &mut endpoint);
        assert_eq!(hdr.command, A_WRTE);
        let expected_line = format!("host tcp:{} tcp:9000\n", listen_port);
        assert_eq!(
            header_payload,
            format!("{:04x}", expected_line.len()).into_bytes()
        );

        send_frame(&mut host, A_OKAY, 5, list_id, b"");
        let (_, line) = read_frame(&mut host, &mut endpoint);
        assert_eq!(line, expected_line.as_bytes());

        // Ack past the end closes the listing stream.
        send_frame(&mut host, A_OKAY, 5, list_id, b"");
        let (done, _) = read_frame(&mut host, &mut endpoint);
        assert_eq!(done.command, A_CLSE);

        // Kill the forward, then killing it again fails.
        send_frame(
            &mut host,
            A_OPEN,
            6,
            0,
            format!("reverse:killforward:tcp:{}\0", listen_port).as_bytes(),
        );
        let (_, _) = read_frame(&mut host, &mut endpoint);
        let (_, payload) = read_frame(&mut host, &mut endpoint);
        assert_eq!(payload, b"OKAY");

        send_frame(
            &mut host,
            A_OPEN,
            8,
            0,
            format!("reverse:killforward:tcp:{}\0", listen_port).as_bytes(),
        );
        let (_, _) = read_frame(&mut host, &mut endpoint);
        let (_, payload) = read_frame(&mut host, &mut endpoint);
        assert!(payload.starts_with(b"FAIL"));

        // Empty list replies inline without registering a stream.
        send_frame(&mut host, A_OPEN, 10, 0, b"reverse:list-forward\0");
        let (_, _) = read_frame(&mut host, &mut endpoint);
        let (_, payload) = read_frame(&mut host, &mut endpoint);
        assert_eq!(payload, b"0000");
        assert_quiet(&mut host, &mut endpoint);
    }

    #[test]
    fn test_cnxn_replay_resends_banner() {
        let mut endpoint = endpoint();
        let mut host = handshake(&mut endpoint);

        send_frame(&mut host, A_CNXN, A_VERSION, 0x40, b"host::\0");
        let (header, payload) = read_frame(&mut host, &mut endpoint);
        assert_eq!(header.command, A_CNXN);
        assert!(payload.starts_with(b"device:"));
    }

    #[test]
    fn test_bad_magic_drops_connection() {
        let mut endpoint = endpoint();
        let mut host = handshake(&mut endpoint);

        let mut header = MessageHeader::new(A_OPEN, 1, 0);
        header.seal(b"");
        header.magic ^= 0xff;
        let mut buf = [0u8; HEADER_SIZE];
        header.encode(&mut buf);
        host.write_all(&buf).unwrap();

        let mut probe = [0u8; 1];
        let mut closed = false;
        for _ in 0..500 {
            endpoint.sync(Some(Duration::from_millis(2))).unwrap();
            match host.read(&mut probe) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(_) => panic!("unexpected reply to a corrupt frame"),
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut => {}
                Err(_) => {
                    closed = true;
                    break;
                }
            }
        }
        assert!(closed, "connection survived a corrupt frame");
        assert_eq!(endpoint.client_count(), 0);
    }

    #[test]
    fn test_oversize_payload_drops_connection() {
        let mut endpoint = endpoint();
        let mut host = handshake(&mut endpoint);

        // One byte past the stream class.
        let mut header = MessageHeader::new(A_WRTE, 1, 1);
        header.data_length = 257;
        header.data_check = 0;
        header.magic = A_WRTE ^ 0xffff_ffff;
        let mut buf = [0u8; HEADER_SIZE];
        header.encode(&mut buf);
        host.write_all(&buf).unwrap();

        let mut probe = [0u8; 1];
        let mut closed = false;
        for _ in 0..500 {
            endpoint.sync(Some(Duration::from_millis(2))).unwrap();
            match host.read(&mut probe) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(_) => panic!("unexpected reply to an oversized frame"),
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut => {}
                Err(_) => {
                    closed = true;
                    break;
                }
            }
        }
        assert!(closed, "connection survived an oversized frame");
    }
}
