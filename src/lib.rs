//! A single-threaded, cooperative event-loop kernel and a composable
//! family of nonblocking byte-stream wrappers built on top of it.
//!
//! The loop (`reactor::Loop`) owns a timer heap, an immediate-work FIFO, an
//! epoll-backed fd registry, a coalescing one-shot event table, and a
//! deferred-free list for objects destroyed while still referenced by an
//! in-flight dispatch. Everything above the loop — `stream::ByteStream`,
//! `queue_stream::QueueStream`, `deserializer::Deserializer`, the chunked
//! and naive codecs, `reservoir::Reservoir`, `pacer::{Pacer, PacerStream}`,
//! `nice::NiceStream` — is built from the same small set of primitives:
//! `action::Action` as the callback value type, `io::Result<usize>`'s
//! `WouldBlock` as the universal "not ready yet" signal, and `execute` as
//! the only way state machines in this crate invoke user code.
//!
//! See `DESIGN.md` for the grounding of each module and the resolutions
//! recorded for the spec's open questions.

pub mod action;
pub mod chunked;
pub mod clock;
pub mod coalesce;
pub mod deserializer;
pub mod error;
pub mod naive;
pub mod nice;
pub mod notification;
pub mod pacer;
pub mod queue_stream;
pub mod reactor;
pub mod registry;
pub mod reservoir;
pub mod stream;
pub mod sys;
pub mod timer;
pub mod wake;

pub use action::Action;
pub use error::StreamError;
pub use reactor::Loop;
pub use stream::{ByteStream, ByteStreamV2, Yield};
