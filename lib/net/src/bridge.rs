//! Synchronous fetch rendezvous.
//!
//! One shared frame buffer guarded by a mutex + condvar stands in for
//! the `SharedArrayBuffer` + futex pair: the guest side stores a
//! request, flips the status word to `REQUEST` and parks; the service
//! thread decodes, runs the gateway, stores `RESPONSE`/`ERROR` and
//! wakes it. Frame layout: `[metadata_len:u32 | binary_len:u32 |
//! metadata JSON | binary bytes]`.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::gateway::{FetchRequest, FetchResponse, NetworkGateway, SyncFetcher};

pub const STATUS_IDLE: i32 = 0;
pub const STATUS_REQUEST: i32 = 1;
pub const STATUS_RESPONSE: i32 = 2;
pub const STATUS_ERROR: i32 = 3;

/// Default channel capacity: 2 MiB of frame space.
const DEFAULT_CAPACITY: usize = 2 * 1024 * 1024;
const FRAME_HEADER: usize = 8;

#[derive(Debug, Default)]
struct ChannelState {
    status: i32,
    frame: Vec<u8>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Channel {
    state: Mutex<ChannelState>,
    cond: Condvar,
}

fn encode_frame(capacity: usize, meta: &[u8], binary: &[u8]) -> (Vec<u8>, bool) {
    let room = capacity.saturating_sub(FRAME_HEADER + meta.len());
    let truncated = binary.len() > room;
    let take = binary.len().min(room);
    let mut frame = Vec::with_capacity(FRAME_HEADER + meta.len() + take);
    frame.extend_from_slice(&(meta.len() as u32).to_le_bytes());
    frame.extend_from_slice(&(take as u32).to_le_bytes());
    frame.extend_from_slice(meta);
    frame.extend_from_slice(&binary[..take]);
    (frame, truncated)
}

fn decode_frame(frame: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    if frame.len() < FRAME_HEADER {
        return None;
    }
    let meta_len = u32::from_le_bytes(frame[0..4].try_into().ok()?) as usize;
    let bin_len = u32::from_le_bytes(frame[4..8].try_into().ok()?) as usize;
    if frame.len() < FRAME_HEADER + meta_len + bin_len {
        return None;
    }
    let meta = frame[FRAME_HEADER..FRAME_HEADER + meta_len].to_vec();
    let binary = frame[FRAME_HEADER + meta_len..FRAME_HEADER + meta_len + bin_len].to_vec();
    Some((meta, binary))
}

#[derive(Serialize, Deserialize)]
struct RequestMeta {
    url: String,
    method: String,
    headers: Vec<(String, String)>,
}

#[derive(Serialize, Deserialize)]
struct ResponseMeta {
    ok: bool,
    status: u16,
    headers: Vec<(String, String)>,
    truncated: bool,
}

#[derive(Serialize, Deserialize)]
struct ErrorMeta {
    code: String,
    message: String,
}

/// Guest-side handle: blocks the calling thread for the duration of the
/// round trip.
#[derive(Debug, Clone)]
pub struct BridgeClient {
    channel: Arc<Channel>,
    capacity: usize,
}

impl SyncFetcher for BridgeClient {
    fn fetch_sync(&self, req: &FetchRequest) -> FetchResponse {
        let meta = match serde_json::to_vec(&RequestMeta {
            url: req.url.clone(),
            method: req.method.clone(),
            headers: req.headers.clone(),
        }) {
            Ok(m) => m,
            Err(e) => {
                return FetchResponse {
                    ok: false,
                    status: 0,
                    headers: Vec::new(),
                    body: Vec::new(),
                    error: Some(format!("encode request: {e}")),
                    truncated: false,
                }
            }
        };
        let body = req.body.clone().unwrap_or_default();

        let mut state = self.channel.state.lock();
        while state.status != STATUS_IDLE && !state.shutdown {
            self.channel.cond.wait(&mut state);
        }
        if state.shutdown {
            return shutdown_response();
        }
        let (frame, _) = encode_frame(self.capacity, &meta, &body);
        state.frame = frame;
        state.status = STATUS_REQUEST;
        self.channel.cond.notify_all();

        while state.status == STATUS_REQUEST && !state.shutdown {
            self.channel.cond.wait(&mut state);
        }
        if state.shutdown {
            return shutdown_response();
        }
        let status_word = state.status;
        let decoded = decode_frame(&state.frame);
        state.status = STATUS_IDLE;
        state.frame = Vec::new();
        self.channel.cond.notify_all();
        drop(state);

        let Some((meta, binary)) = decoded else {
            return FetchResponse {
                ok: false,
                status: 0,
                headers: Vec::new(),
                body: Vec::new(),
                error: Some("malformed bridge frame".to_string()),
                truncated: false,
            };
        };
        if status_word == STATUS_ERROR {
            let err: ErrorMeta = serde_json::from_slice(&meta).unwrap_or(ErrorMeta {
                code: "TRANSPORT".to_string(),
                message: "unreadable bridge error".to_string(),
            });
            let status = match err.code.as_str() {
                "DENIED" | "BLOCKED_HOST" => 403,
                _ => 502,
            };
            return FetchResponse {
                ok: false,
                status,
                headers: Vec::new(),
                body: Vec::new(),
                error: Some(err.message),
                truncated: false,
            };
        }
        match serde_json::from_slice::<ResponseMeta>(&meta) {
            Ok(meta) => FetchResponse {
                ok: meta.ok,
                status: meta.status,
                headers: meta.headers,
                body: binary,
                error: None,
                truncated: meta.truncated,
            },
            Err(e) => FetchResponse {
                ok: false,
                status: 0,
                headers: Vec::new(),
                body: Vec::new(),
                error: Some(format!("decode response: {e}")),
                truncated: false,
            },
        }
    }
}

fn shutdown_response() -> FetchResponse {
    FetchResponse {
        ok: false,
        status: 0,
        headers: Vec::new(),
        body: Vec::new(),
        error: Some("fetch bridge is shut down".to_string()),
        truncated: false,
    }
}

/// Main-side half: owns the gateway service thread.
#[derive(Debug)]
pub struct FetchBridge {
    channel: Arc<Channel>,
    capacity: usize,
    service: Option<JoinHandle<()>>,
}

impl FetchBridge {
    pub fn start(gateway: Arc<NetworkGateway>) -> Self {
        Self::with_capacity(gateway, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(gateway: Arc<NetworkGateway>, capacity: usize) -> Self {
        let channel = Arc::new(Channel::default());
        let service_channel = channel.clone();
        let service = std::thread::Builder::new()
            .name("wasmbox-fetch-bridge".to_string())
            .spawn(move || service_loop(service_channel, gateway, capacity))
            .expect("spawn bridge service thread");
        FetchBridge {
            channel,
            capacity,
            service: Some(service),
        }
    }

    pub fn client(&self) -> BridgeClient {
        BridgeClient {
            channel: self.channel.clone(),
            capacity: self.capacity,
        }
    }

    pub fn shutdown(&mut self) {
        {
            let mut state = self.channel.state.lock();
            state.shutdown = true;
            self.channel.cond.notify_all();
        }
        if let Some(handle) = self.service.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FetchBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn service_loop(channel: Arc<Channel>, gateway: Arc<NetworkGateway>, capacity: usize) {
    loop {
        let request = {
            let mut state = channel.state.lock();
            while state.status != STATUS_REQUEST && !state.shutdown {
                channel.cond.wait(&mut state);
            }
            if state.shutdown {
                return;
            }
            decode_frame(&state.frame)
        };

        let (status, frame) = match request {
            Some((meta, body)) => match serde_json::from_slice::<RequestMeta>(&meta) {
                Ok(req_meta) => {
                    let req = FetchRequest {
                        url: req_meta.url,
                        method: req_meta.method,
                        headers: req_meta.headers,
                        body: if body.is_empty() { None } else { Some(body) },
                    };
                    match gateway.fetch(&req) {
                        Ok(resp) => {
                            let (frame, truncated) = encode_frame(
                                capacity,
                                // Encode with a placeholder first so the
                                // truncation flag lands in the metadata.
                                &serde_json::to_vec(&ResponseMeta {
                                    ok: resp.ok,
                                    status: resp.status,
                                    headers: resp.headers.clone(),
                                    truncated: false,
                                })
                                .unwrap_or_default(),
                                &resp.body,
                            );
                            if truncated {
                                let meta = serde_json::to_vec(&ResponseMeta {
                                    ok: resp.ok,
                                    status: resp.status,
                                    headers: resp.headers.clone(),
                                    truncated: true,
                                })
                                .unwrap_or_default();
                                let (frame, _) = encode_frame(capacity, &meta, &resp.body);
                                (STATUS_RESPONSE, frame)
                            } else {
                                (STATUS_RESPONSE, frame)
                            }
                        }
                        Err(err) => {
                            let meta = serde_json::to_vec(&ErrorMeta {
                                code: err.code().to_string(),
                                message: err.to_string(),
                            })
                            .unwrap_or_default();
                            let (frame, _) = encode_frame(capacity, &meta, &[]);
                            (STATUS_ERROR, frame)
                        }
                    }
                }
                Err(e) => {
                    let meta = serde_json::to_vec(&ErrorMeta {
                        code: "TRANSPORT".to_string(),
                        message: format!("malformed request metadata: {e}"),
                    })
                    .unwrap_or_default();
                    let (frame, _) = encode_frame(capacity, &meta, &[]);
                    (STATUS_ERROR, frame)
                }
            },
            None => {
                let meta = serde_json::to_vec(&ErrorMeta {
                    code: "TRANSPORT".to_string(),
                    message: "malformed bridge frame".to_string(),
                })
                .unwrap_or_default();
                let (frame, _) = encode_frame(capacity, &meta, &[]);
                (STATUS_ERROR, frame)
            }
        };

        let mut state = channel.state.lock();
        if state.shutdown {
            return;
        }
        state.frame = frame;
        state.status = status;
        channel.cond.notify_all();
    }
}
