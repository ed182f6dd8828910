use std::fs;
use std::io;
use std::path::Path;

/// Size of the challenge nonce carried by AUTH TOKEN frames.
pub const TOKEN_SIZE: usize = 20;

/// AUTH frame subtypes, carried in `arg0`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AuthKind {
    Token,
    Signature,
    PublicKey,
}

impl AuthKind {
    pub fn from_arg(arg: u32) -> Option<AuthKind> {
        match arg {
            1 => Some(AuthKind::Token),
            2 => Some(AuthKind::Signature),
            3 => Some(AuthKind::PublicKey),
            _ => None,
        }
    }

    pub fn arg(self) -> u32 {
        match self {
            AuthKind::Token => 1,
            AuthKind::Signature => 2,
            AuthKind::PublicKey => 3,
        }
    }
}

/// Checks an AUTH SIGNATURE payload against one stored public key. The
/// engine decides when verification runs and what the boolean means; the
/// algorithm lives with the daemon.
pub trait SignatureVerifier {
    fn verify(&self, public_key: &[u8], signature: &[u8], token: &[u8; TOKEN_SIZE]) -> bool;
}

/// Host public keys the daemon trusts, in `adb_keys` order.
#[derive(Debug, Default)]
pub struct KeyStore {
    keys: Vec<Vec<u8>>,
}

impl KeyStore {
    pub fn new() -> KeyStore {
        KeyStore { keys: Vec::new() }
    }

    /// Parses `adb_keys` content: one base64 blob per line, optionally
    /// followed by a ` user@host` comment. Unparseable lines are skipped.
    pub fn parse(content: &str) -> KeyStore {
        let mut keys = Vec::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let blob = match line.split_whitespace().next() {
                Some(blob) => blob,
                None => continue,
            };

            if let Ok(key) = base64::decode(blob) {
                keys.push(key);
            }
        }

        KeyStore { keys }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<KeyStore> {
        Ok(KeyStore::parse(&fs::read_to_string(path)?))
    }

    /// Accepts a key offered at runtime through AUTH RSAPUBLICKEY.
    pub fn add(&mut self, key: Vec<u8>) {
        self.keys.push(key);
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.keys.iter().map(|key| key.as_slice())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_kind_roundtrip() {
        for arg in 1..=3 {
            assert_eq!(AuthKind::from_arg(arg).unwrap().arg(), arg);
        }
        assert_eq!(AuthKind::from_arg(0), None);
        assert_eq!(AuthKind::from_arg(4), None);
    }

    #[test]
    fn test_parse_key_lines() {
        let content = "aGVsbG8= user@host\n\n# comment\nd29ybGQ=\n";
        let store = KeyStore::parse(content);

        assert_eq!(store.len(), 2);
        let keys: Vec<&[u8]> = store.iter().collect();
        assert_eq!(keys[0], b"hello");
        assert_eq!(keys[1], b"world");
    }

    #[test]
    fn test_parse_skips_garbage() {
        let store = KeyStore::parse("not!!base64???\n");
        assert!(store.is_empty());
    }

    #[test]
    fn test_add_key() {
        let mut store = KeyStore::new();
        store.add(vec![1, 2, 3]);

        assert_eq!(store.len(), 1);
        assert_eq!(store.iter().next().unwrap(), &[1, 2, 3]);
    }
}
