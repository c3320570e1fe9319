pub mod client;
pub mod media;

pub use client::*;
pub use media::*;
