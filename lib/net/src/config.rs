use adbproto::banner::DeviceInfo;
use serde_derive::Deserialize;

/// Engine configuration. Every knob has a default matching the reference
/// daemon; the binary deserializes this from the `[server]` table of its
/// config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port the ADB listener binds on.
    pub port: u16,
    /// Upper bound on simultaneously allocated packets per connection.
    pub frame_max: usize,
    /// Stream-class payload size. Advertised to the peer in `CNXN.arg1`;
    /// both ends must agree.
    pub payload_size: usize,
    /// Handshake-class payload size, used before the connection is
    /// established (banner and public-key frames exceed the stream class).
    pub cnxn_payload_size: usize,
    /// Demand AUTH before servicing the connection.
    pub auth_required: bool,
    /// Accept public keys offered through AUTH RSAPUBLICKEY.
    pub auth_pubkey_autoaccept: bool,
    /// Path to an `adb_keys` style trusted key list.
    pub auth_keys_path: Option<String>,
    /// Identity advertised in the CNXN banner.
    pub device: DeviceInfo,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: 5555,
            frame_max: 2,
            payload_size: 40,
            cnxn_payload_size: 1024,
            auth_required: false,
            auth_pubkey_autoaccept: true,
            auth_keys_path: None,
            device: DeviceInfo::default(),
        }
    }
}
