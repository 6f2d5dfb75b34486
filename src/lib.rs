//! A concurrent queue that grows on demand.
//!
//! This crate provides [`ElasticQueue`], a multi-producer multi-consumer queue backed by a
//! circular buffer that is reallocated in flight when it fills up. Pushes never fail: the
//! producer that fills the buffer becomes the resizer, waits for the operations already past
//! admission to drain, and moves the live elements into a larger allocation while everyone
//! else parks on a flag.
//!
//! Every push is assigned a monotonically increasing sequence number, and elements come back
//! out in sequence order. Single-element and batched variants of both operations share the
//! same admission protocol, so a batch that straddles a capacity boundary is delivered in
//! full across the old and new buffers.

#![warn(missing_docs, unsafe_op_in_unsafe_fn)]

mod elastic_queue;

pub use crate::elastic_queue::{ElasticQueue, IntoIter};
