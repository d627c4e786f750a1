//! Device-independent core: packet codec, frame reassembly, event fan-out
//! and persisted settings.

pub mod codec;
pub mod events;
pub mod models;
pub mod packet;
pub mod reassembler;
pub mod settings;
