//! Wire protocol shared between the Skywave server and its clients.
//!
//! The control plane is a stream of `[tag: u16 BE][len: u32 BE][payload]`
//! frames over TLS; payloads are postcard-serialized records. Voice travels
//! over UDP (or tunnelled in [`messages::UdpTunnel`]) with a compact binary
//! header described in [`voice`].

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;
pub mod voice;
