pub mod connection;
pub mod delta;
pub mod dos_protection;
pub mod framing;
pub mod map_transfer;
pub mod protocol;
pub mod transport;
pub mod udp;
pub mod varint;
