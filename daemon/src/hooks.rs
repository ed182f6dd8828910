use rand::Rng;

use adbnet::{NonceSource, RebootHook};
use adbproto::auth::{SignatureVerifier, TOKEN_SIZE};
use adbproto::logging::{self, Logger};

/// Fills AUTH nonces from the thread RNG.
pub struct RandomNonce;

impl RandomNonce {
    pub fn new() -> RandomNonce {
        RandomNonce
    }
}

impl NonceSource for RandomNonce {
    fn fill_nonce(&mut self, buf: &mut [u8]) {
        rand::thread_rng().fill(buf);
    }
}

/// Declines every signature. RSA primitives stay outside the daemon, so
/// trusted-key auth runs through the pubkey auto-accept policy instead.
pub struct RejectingVerifier;

impl SignatureVerifier for RejectingVerifier {
    fn verify(&self, _public_key: &[u8], _signature: &[u8], _token: &[u8; TOKEN_SIZE]) -> bool {
        false
    }
}

/// Logs reboot requests; wiring a real reboot is a deployment concern.
pub struct LogReboot {
    log: Logger,
}

impl LogReboot {
    pub fn new(log: Logger) -> LogReboot {
        LogReboot { log }
    }
}

impl RebootHook for LogReboot {
    fn reboot(&mut self, target: &str) {
        logging::info!(self.log, "reboot requested"; "target" => target);
    }
}
