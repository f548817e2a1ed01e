//! Network access for sandboxed guests.
//!
//! All guest-originated HTTP goes through the [`NetworkGateway`], which
//! enforces a deny-by-default host policy and a response body cap. A
//! guest running on a worker thread cannot await anything, so the
//! [`bridge`] module provides a blocking rendezvous channel: the guest
//! thread parks on a status word while a service thread performs the
//! policy check and the actual transfer.

mod bridge;
mod gateway;

pub use bridge::{
    BridgeClient, FetchBridge, STATUS_ERROR, STATUS_IDLE, STATUS_REQUEST, STATUS_RESPONSE,
};
pub use gateway::{
    matches_host_list, FetchRequest, FetchResponse, NetError, NetworkGateway, NetworkPolicy,
    RequestHook, SyncFetcher, DEFAULT_BODY_LIMIT,
};
