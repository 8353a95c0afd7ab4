//! hoist-protocol: RESP wire codec for talking to replicated store nodes.
//!
//! Provides single-pass parsing and direct-to-buffer serialization of the
//! RESP frames exchanged with a node. Replies are accepted in both RESP2
//! and RESP3 shapes, since stock servers answer in RESP2 unless a client
//! negotiates otherwise.
//!
//! # quick start
//!
//! ```
//! use bytes::BytesMut;
//! use hoist_protocol::{Frame, parse_frame};
//!
//! // build and serialize a command
//! let cmd = Frame::command(&["CONFIG", "GET", "min-replicas-to-write"]);
//! let mut buf = BytesMut::new();
//! cmd.serialize(&mut buf);
//! assert!(buf.starts_with(b"*3\r\n$6\r\nCONFIG\r\n"));
//!
//! // parse a reply
//! let (frame, consumed) = parse_frame(b"+OK\r\n").unwrap().unwrap();
//! assert_eq!(frame, Frame::Simple("OK".into()));
//! assert_eq!(consumed, 5);
//! ```

pub mod error;
pub mod parse;
mod serialize;
pub mod types;

pub use error::ProtocolError;
pub use parse::parse_frame;
pub use types::Frame;
