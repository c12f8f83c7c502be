//! data buffer building blocks: byte ring, file read/write buffers, bounded
//! collect and the sequential streamer.

pub mod collect;
pub mod file;
pub mod ring;
pub mod streamer;
