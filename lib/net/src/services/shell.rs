//! The `shell` service: bridges a stream to a running shell. Process
//! creation and pty plumbing live with the daemon behind `ShellSpawner`;
//! the engine only moves bytes and enforces the ack discipline.

use std::io;

use mio::{Registry, Token};

use super::{Fate, Ids, OpenOutcome, ServiceBody, Step};
use crate::client::{Courier, EngineCtx};
use crate::endpoint::TokenEntry;
use crate::packet::Packet;

/// Launches shell sessions on behalf of the engine.
pub trait ShellSpawner {
    /// Interactive shell when `command` is `None`, `sh -c <command>`
    /// otherwise.
    fn spawn(&mut self, command: Option<&str>) -> io::Result<Box<dyn ShellSession>>;
}

/// One running shell. Output readiness must be registrable with the poll;
/// reads and writes are non-blocking. Dropping the session ends the child.
pub trait ShellSession {
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()>;
    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;
    fn read_output(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_input(&mut self, buf: &[u8]) -> io::Result<usize>;
}

enum ShellState {
    /// Forwarding child output as it arrives.
    Running,
    /// WRTE emitted; output reads stay stopped until the peer's OKAY.
    WaitAck,
}

/// Cap on input buffered toward the child; a stalled child fails the
/// stream rather than growing without bound.
const PENDING_IN_MAX: usize = 64 * 1024;

pub struct ShellService {
    session: Box<dyn ShellSession>,
    token: Token,
    state: ShellState,
    /// Peer input the child has not accepted yet.
    pending_in: Vec<u8>,
}

/// `shell`, `shell:` (interactive), `shell:<cmdline>`, and the
/// `shell:exec logcat…` form, which runs through the same path.
pub fn open(name: &str, packet: Packet, ctx: &mut EngineCtx) -> OpenOutcome {
    let rest = name.strip_prefix("shell").unwrap_or("");
    let rest = rest.strip_prefix(':').unwrap_or(rest);
    let command = match rest {
        "" => None,
        line => Some(line.strip_prefix("exec ").unwrap_or(line)),
    };

    let mut session = match ctx.shell.spawn(command) {
        Ok(session) => session,
        Err(_) => return OpenOutcome::Reject(packet),
    };

    let token = ctx.tokens.insert(TokenEntry::Service { client: ctx.slot });
    if session.register(ctx.registry, token).is_err() {
        ctx.tokens.remove(token);
        return OpenOutcome::Reject(packet);
    }

    OpenOutcome::Service(
        ServiceBody::Shell(ShellService {
            session,
            token,
            state: ShellState::Running,
            pending_in: Vec::new(),
        }),
        packet,
    )
}

impl ShellService {
    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn on_write(&mut self, packet: Packet, _ids: &mut Ids, _courier: &mut Courier) -> Step {
        if packet.header.data_length == 0 {
            return Step::Fail(Some(packet));
        }

        if self.pending_in.len() + packet.payload().len() > PENDING_IN_MAX {
            return Step::Fail(Some(packet));
        }

        self.pending_in.extend_from_slice(packet.payload());
        if self.flush_input().is_err() {
            return Step::Fail(Some(packet));
        }

        Step::Done(packet)
    }

    pub fn on_ack(&mut self, packet: Packet, ids: &mut Ids, courier: &mut Courier) -> Step {
        match self.state {
            ShellState::WaitAck => {
                self.state = ShellState::Running;
                match self.pump_output(ids, courier) {
                    Fate::Alive => Step::Done(packet),
                    Fate::Close(extra) => {
                        if let Some(extra) = extra {
                            courier.release(extra);
                        }
                        Step::Fail(Some(packet))
                    }
                }
            }
            ShellState::Running => Step::Done(packet),
        }
    }

    pub fn on_kick(&mut self, ids: &mut Ids, courier: &mut Courier) -> Fate {
        if self.flush_input().is_err() {
            return Fate::Close(courier.allocate());
        }
        self.pump_output(ids, courier)
    }

    pub fn on_socket_event(
        &mut self,
        readable: bool,
        _writable: bool,
        ids: &mut Ids,
        courier: &mut Courier,
    ) -> Fate {
        if readable {
            self.pump_output(ids, courier)
        } else {
            Fate::Alive
        }
    }

    pub fn close(&mut self, ctx: &mut EngineCtx) {
        let _ = self.session.deregister(ctx.registry);
        ctx.tokens.remove(self.token);
    }

    /// Forwards one read of child output as a WRTE, then waits for the
    /// peer's ack.
    fn pump_output(&mut self, ids: &mut Ids, courier: &mut Courier) -> Fate {
        match self.state {
            ShellState::Running => {}
            ShellState::WaitAck => return Fate::Alive,
        }

        let mut packet = match courier.allocate() {
            Some(packet) => packet,
            // Retried on the release kick.
            None => return Fate::Alive,
        };

        loop {
            match self.session.read_output(packet.data_mut()) {
                Ok(0) => return Fate::Close(Some(packet)),
                Ok(n) => {
                    packet.header.arg0 = *ids.id;
                    packet.header.arg1 = ids.peer_id;
                    packet.stage_len(n);
                    courier.send_data_frame(packet);
                    self.state = ShellState::WaitAck;
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

    fn flush_input(&mut self) -> io::Result<()> {
        while !self.pending_in.is_empty() {
            match self.session.write_input(&self.pending_in) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.pending_in.drain(..n);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
