//! Range-accurate streaming over stored parts.
//!
//! This crate provides:
//! - Window-to-part and part-to-chunk planning
//! - A sequential reader and a pipelined multi-fetch scheduler
//! - Seeking decryption of sealed-block parts
//! - [`read_range`], which turns a part list and a byte window into a stream

pub mod concurrent;
pub mod decrypt;
pub mod error;
pub mod linear;
pub mod plan;
pub mod reader;
pub mod source;

pub use error::{StreamError, StreamResult};
pub use reader::{PartSpec, ReaderOptions, read_range};
pub use source::{BytesSource, ChunkSource, NoopObserver, PartChunkSource, StreamObserver};

use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// An ordered stream of file bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = StreamResult<Bytes>> + Send>>;
