#![allow(dead_code)]

pub(crate) mod raw_peer;
pub(crate) mod tracing_common;

pub(crate) use raw_peer::RawPeer;
pub(crate) use tracing_common::setup_tracing;
