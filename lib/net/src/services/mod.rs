//! The services the dispatcher can open, behind one closed dispatch enum.

use mio::Token;

use crate::client::{Courier, EngineCtx};
use crate::packet::Packet;

pub mod shell;
pub mod sync;
pub mod tcp;

use self::shell::ShellService;
use self::sync::SyncService;
use self::tcp::{ReverseListService, ReverseServer, StreamService};

/// Result of feeding a frame to a service.
pub enum Step {
    /// Processing finished; the dispatcher replies (OKAY for writes, a
    /// staged follow-up for acks) or releases the packet.
    Done(Packet),
    /// The service took ownership of the packet and will answer later.
    Async,
    /// The service failed; the dispatcher closes it, using the packet (when
    /// present) for the CLSE frame.
    Fail(Option<Packet>),
}

/// Result of a kick or socket event.
pub enum Fate {
    Alive,
    Close(Option<Packet>),
}

/// Result of an OPEN request.
pub enum OpenOutcome {
    /// Register the service, then OKAY. If the packet is staged
    /// `InitAsync`, the reply waits for the completion callback instead.
    Service(ServiceBody, Packet),
    /// Nothing registered; reply OKAY carrying any staged bytes.
    OneShot(Packet),
    /// Unknown or failed; reply CLSE(0, peer).
    Reject(Packet),
}

/// Stream identifiers a service needs when it emits frames itself. The id
/// is mutable because a failed open must report CLSE with local id zero.
pub struct Ids<'a> {
    pub id: &'a mut u32,
    pub peer_id: u32,
}

/// The closed set of service implementations.
pub enum ServiceBody {
    Sync(SyncService),
    Shell(ShellService),
    Stream(StreamService),
    ReverseList(ReverseListService),
}

/// One registered stream endpoint within a client.
pub struct ServiceEntry {
    pub id: u32,
    pub peer_id: u32,
    pub body: ServiceBody,
}

impl ServiceEntry {
    pub fn on_write(&mut self, packet: Packet, courier: &mut Courier) -> Step {
        let ServiceEntry { id, peer_id, body } = self;
        let mut ids = Ids {
            id,
            peer_id: *peer_id,
        };
        match body {
            ServiceBody::Sync(svc) => svc.on_write(packet),
            ServiceBody::Shell(svc) => svc.on_write(packet, &mut ids, courier),
            ServiceBody::Stream(svc) => svc.on_write(packet, &mut ids, courier),
            ServiceBody::ReverseList(svc) => svc.on_write(packet),
        }
    }

    pub fn on_ack(&mut self, packet: Packet, courier: &mut Courier) -> Step {
        let ServiceEntry { id, peer_id, body } = self;
        let mut ids = Ids {
            id,
            peer_id: *peer_id,
        };
        match body {
            ServiceBody::Sync(svc) => svc.on_ack(packet),
            ServiceBody::Shell(svc) => svc.on_ack(packet, &mut ids, courier),
            ServiceBody::Stream(svc) => svc.on_ack(packet, &mut ids, courier),
            ServiceBody::ReverseList(svc) => svc.on_ack(packet),
        }
    }

    /// Resource-recovery hint; services retry deferred work.
    pub fn on_kick(&mut self, courier: &mut Courier) -> Fate {
        let ServiceEntry { id, peer_id, body } = self;
        let mut ids = Ids {
            id,
            peer_id: *peer_id,
        };
        match body {
            ServiceBody::Shell(svc) => svc.on_kick(&mut ids, courier),
            ServiceBody::Stream(svc) => svc.on_kick(&mut ids, courier),
            ServiceBody::Sync(_) | ServiceBody::ReverseList(_) => Fate::Alive,
        }
    }

    /// Readiness on the socket (or pipe) the service owns.
    pub fn on_socket_event(
        &mut self,
        readable: bool,
        writable: bool,
        courier: &mut Courier,
    ) -> Fate {
        let ServiceEntry { id, peer_id, body } = self;
        let mut ids = Ids {
            id,
            peer_id: *peer_id,
        };
        match body {
            ServiceBody::Shell(svc) => svc.on_socket_event(readable, writable, &mut ids, courier),
            ServiceBody::Stream(svc) => svc.on_socket_event(readable, writable, &mut ids, courier),
            ServiceBody::Sync(_) | ServiceBody::ReverseList(_) => Fate::Alive,
        }
    }

    /// Packets the service still holds, surrendered before teardown so the
    /// pool accounting stays balanced.
    pub fn reclaim(&mut self) -> Option<Packet> {
        match &mut self.body {
            ServiceBody::Stream(svc) => svc.reclaim(),
            _ => None,
        }
    }

    pub fn on_close(&mut self, ctx: &mut EngineCtx) {
        match &mut self.body {
            ServiceBody::Stream(svc) => svc.close(ctx),
            ServiceBody::Shell(svc) => svc.close(ctx),
            // Dropping the state closes any open file.
            // TODO unlink a partially transferred SEND target on close.
            ServiceBody::Sync(_) => {}
            ServiceBody::ReverseList(_) => {}
        }
    }

    pub fn token(&self) -> Option<Token> {
        match &self.body {
            ServiceBody::Stream(svc) => Some(svc.token()),
            ServiceBody::Shell(svc) => Some(svc.token()),
            ServiceBody::Sync(_) | ServiceBody::ReverseList(_) => None,
        }
    }
}

/// Routes an OPEN request by name prefix.
pub fn open_service(
    name: &str,
    packet: Packet,
    reverse: &mut Vec<ReverseServer>,
    ctx: &mut EngineCtx,
) -> OpenOutcome {
    if name.starts_with("sync:") {
        return OpenOutcome::Service(ServiceBody::Sync(SyncService::new()), packet);
    }

    if name.starts_with("tcp:") {
        return tcp::open_forward(name, packet, ctx);
    }

    if let Some(rest) = name.strip_prefix("reverse:") {
        return tcp::open_reverse(rest, packet, reverse, ctx);
    }

    if name.starts_with("shell") {
        return shell::open(name, packet, ctx);
    }

    if let Some(target) = name.strip_prefix("reboot:") {
        // One-shot: acknowledge, fire the hook, register nothing.
        ctx.reboot.reboot(target);
        return OpenOutcome::OneShot(packet);
    }

    OpenOutcome::Reject(packet)
}
