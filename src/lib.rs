//! Chain based non-blocking network I/O.
//!
//! This crate is a cooperative streaming framework built from five pieces:
//!
//! - [Scatter-gather buffers](buffer): channel partitioned, segmented byte
//!   storage that lets data flow through a processing chain with almost no
//!   copying.
//! - [Pipes](pipe): the unit of stream processing. A pipe reads its input
//!   channel, writes its output channel, and returns a small status code
//!   telling the scheduler what to do next.
//! - [The pump](pump): a cooperative scheduler that owns ordered chains of
//!   pipes, drives them against an OS poll set, enforces per-chain
//!   deadlines, and supports locking and sleeping individual chains.
//! - [Socket pipes](socket): non-blocking TCP endpoints as chain stages,
//!   including a listen/accept reactor that builds a protocol chain for
//!   every connection.
//! - A protocol stack on top: an [HTTP/1.0 server](http) with a URL routed
//!   handler tree and deferred responses, and a
//!   [structured data RPC server](rpc) speaking the [notation](notation)
//!   wire format.
//!
//! The pump never blocks inside a pipe and nothing here spins up threads;
//! the embedding application ticks the pump from its main loop:
//!
//! ```no_run
//! use iopump::http::node::Router;
//! use iopump::pump::Pump;
//!
//! let mut pump = Pump::new();
//! let root = Router::new();
//! let port = iopump::http::create_server(&mut pump, 0, root).unwrap();
//! println!("listening on {}", port);
//! loop {
//!     pump.pump();
//!     pump.callback();
//! }
//! ```

pub mod buffer;
pub mod bufstream;
pub mod clock;
pub mod error;
pub mod http;
pub mod notation;
pub mod pipe;
pub mod pump;
pub mod rpc;
pub mod sd;
pub mod socket;
pub mod urlrequest;
pub mod util;

pub use error::{Error, Result};
