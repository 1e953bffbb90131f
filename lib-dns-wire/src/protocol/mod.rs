//! The DNS wire format, as described in RFC 1035 sections 3 and 4: the
//! message types themselves (`types`), turning them into octets to put on
//! the network (`serialise`), and turning octets from the network back into
//! messages (`deserialise`).

pub mod deserialise;
pub mod serialise;
pub mod types;
