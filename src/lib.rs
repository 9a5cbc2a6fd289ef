//! A reliable, in-sequence byte stream between two endpoints over UDP, using the Go-Back-N
//!  sliding window protocol.
//!
//! The crate is layered as follows:
//! * [stream::ArqStream] cuts written bytes into packets and hands received payload back as
//!    bytes. This is the application's view of a connection.
//! * [engine::WindowEngine] is the protocol state machine: it numbers and buffers outgoing
//!    frames, retransmits them on timeout, acknowledges incoming frames and applies
//!    backpressure to its producer.
//! * [timer_service::TimerService] drives retransmission and delayed acks.
//! * [channel::UnreliableChannel] sends frames to the peer and runs the receive loop. For
//!    experimenting with the protocol, it can drop, damage and delay outgoing frames on
//!    purpose (see [config::ChannelConfig]).
//!
//! ## Design
//!
//! * There is no explicit handshake. The connecting side picks a random local port and starts
//!    sending; the accepting side takes the sender of the first intact frame as its peer, and
//!    derives the window size from that frame's ack number.
//! * Sequence numbers are cyclic modulo the window size, and at most `window_size - 1` frames
//!    are unacknowledged at any time.
//! * Acks are cumulative, and they are piggybacked on data frames. An ack that can not be
//!    piggybacked within a configured delay is sent in a standalone ACK frame.
//! * The receiving side accepts frames only in sequence. Everything else is discarded and
//!    recovered by the sender's retransmission of its entire buffer.
//! * The side that finishes first sends an end-of-stream frame, which is sequenced and
//!    acknowledged like a data frame. Receiving it ends both directions: the receiving side
//!    only acknowledges it and does not send an end-of-stream frame of its own.
//!
//! ## Wire format
//!
//! All numbers are little endian:
//!
//! ```ascii
//!  0: checksum (u16) - Internet-style one's complement checksum over the entire frame
//!  2: length (u16) - total length of the frame in bytes
//!  4: ack number (u32)
//!  8: sequence number (u32) - absent in ACK frames
//! 12: payload
//! ```
//!
//! The kind of frame is determined by its length: 8 bytes is an ACK, 12 bytes is end-of-stream,
//!  and anything longer is a DATA frame. All other lengths are malformed.

pub mod channel;
pub mod config;
pub mod connection;
pub mod engine;
pub mod fault;
pub mod frame;
pub mod network_layer;
pub mod send_socket;
pub mod seq;
pub mod stream;
pub mod timer_service;
