//! VFS proxy for worker execution.
//!
//! The worker thread owns a [`VfsProxy`] implementing the ordinary
//! `FileSystem` trait; every call is encoded onto a shared frame buffer
//! (`[status | metadata_len:u32 | binary_len:u32 | metadata JSON |
//! binary]`), the servicing side decodes it against the real VFS and
//! writes the reply back. A mutex + condvar pair guards the status
//! word, standing in for the futex on a `SharedArrayBuffer`.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use wasmbox_vfs::{DirEntry, FileStat, FileSystem, FsError, Result as FsResult};

pub(crate) const STATUS_IDLE: i32 = 0;
pub(crate) const STATUS_REQUEST: i32 = 1;
pub(crate) const STATUS_RESPONSE: i32 = 2;
pub(crate) const STATUS_ERROR: i32 = 3;

const FRAME_HEADER: usize = 8;

#[derive(Debug, Default)]
struct ChanState {
    status: i32,
    frame: Vec<u8>,
    shutdown: bool,
}

/// The shared rendezvous buffer.
#[derive(Debug, Default)]
pub(crate) struct ProxyChannel {
    state: Mutex<ChanState>,
    cond: Condvar,
}

impl ProxyChannel {
    /// Poison the channel: every side unblocks and observes an error.
    pub(crate) fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cond.notify_all();
    }
}

fn encode_frame(meta: &[u8], binary: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER + meta.len() + binary.len());
    frame.extend_from_slice(&(meta.len() as u32).to_le_bytes());
    frame.extend_from_slice(&(binary.len() as u32).to_le_bytes());
    frame.extend_from_slice(meta);
    frame.extend_from_slice(binary);
    frame
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
    Some((
        frame[FRAME_HEADER..FRAME_HEADER + meta_len].to_vec(),
        frame[FRAME_HEADER + meta_len..FRAME_HEADER + meta_len + bin_len].to_vec(),
    ))
}

#[derive(Debug, Serialize, Deserialize)]
struct ProxyRequest {
    op: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    target: String,
    #[serde(default)]
    mode: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ProxyReply {
    Unit,
    Bytes,
    Stat { stat: FileStat },
    Entries { entries: Vec<DirEntry> },
    Text { text: String },
    Flag { value: bool },
    Error { code: String, message: String },
}

/// Worker-side filesystem handle tunneling every call to the real VFS.
pub(crate) struct VfsProxy {
    channel: Arc<ProxyChannel>,
}

impl fmt::Debug for VfsProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VfsProxy").finish_non_exhaustive()
    }
}

impl VfsProxy {
    pub(crate) fn new(channel: Arc<ProxyChannel>) -> Self {
        VfsProxy { channel }
    }

    fn call(&self, request: ProxyRequest, binary: &[u8]) -> FsResult<(ProxyReply, Vec<u8>)> {
        let meta = serde_json::to_vec(&request).map_err(|_| FsError::Interrupted)?;

        let mut state = self.channel.state.lock();
        while state.status != STATUS_IDLE && !state.shutdown {
            self.channel.cond.wait(&mut state);
        }
        if state.shutdown {
            return Err(FsError::Interrupted);
        }
        state.frame = encode_frame(&meta, binary);
        state.status = STATUS_REQUEST;
        self.channel.cond.notify_all();

        while state.status == STATUS_REQUEST && !state.shutdown {
            self.channel.cond.wait(&mut state);
        }
        if state.shutdown {
            return Err(FsError::Interrupted);
        }
        let decoded = decode_frame(&state.frame);
        state.status = STATUS_IDLE;
        state.frame = Vec::new();
        self.channel.cond.notify_all();
        drop(state);

        let (meta, binary) = decoded.ok_or(FsError::Interrupted)?;
        let reply: ProxyReply =
            serde_json::from_slice(&meta).map_err(|_| FsError::Interrupted)?;
        if let ProxyReply::Error { code, .. } = &reply {
            return Err(FsError::from_code(code));
        }
        Ok((reply, binary))
    }

    fn simple(&self, op: &str, path: &str) -> ProxyRequest {
        ProxyRequest {
            op: op.to_string(),
            path: path.to_string(),
            target: String::new(),
            mode: 0,
        }
    }
}

impl FileSystem for VfsProxy {
    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let (_, binary) = self.call(self.simple("read_file", path), &[])?;
        Ok(binary)
    }

    fn write_file(&self, path: &str, data: &[u8]) -> FsResult<()> {
        self.call(self.simple("write_file", path), data)?;
        Ok(())
    }

    fn append_file(&self, path: &str, data: &[u8]) -> FsResult<()> {
        self.call(self.simple("append_file", path), data)?;
        Ok(())
    }

    fn mkdir(&self, path: &str) -> FsResult<()> {
        self.call(self.simple("mkdir", path), &[])?;
        Ok(())
    }

    fn mkdirp(&self, path: &str) -> FsResult<()> {
        self.call(self.simple("mkdirp", path), &[])?;
        Ok(())
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        match self.call(self.simple("read_dir", path), &[])? {
            (ProxyReply::Entries { entries }, _) => Ok(entries),
            _ => Err(FsError::Interrupted),
        }
    }

    fn stat(&self, path: &str) -> FsResult<FileStat> {
        match self.call(self.simple("stat", path), &[])? {
            (ProxyReply::Stat { stat }, _) => Ok(stat),
            _ => Err(FsError::Interrupted),
        }
    }

    fn lstat(&self, path: &str) -> FsResult<FileStat> {
        match self.call(self.simple("lstat", path), &[])? {
            (ProxyReply::Stat { stat }, _) => Ok(stat),
            _ => Err(FsError::Interrupted),
        }
    }

    fn unlink(&self, path: &str) -> FsResult<()> {
        self.call(self.simple("unlink", path), &[])?;
        Ok(())
    }

    fn rmdir(&self, path: &str) -> FsResult<()> {
        self.call(self.simple("rmdir", path), &[])?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let mut request = self.simple("rename", from);
        request.target = to.to_string();
        self.call(request, &[])?;
        Ok(())
    }

    fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        let mut request = self.simple("chmod", path);
        request.mode = mode;
        self.call(request, &[])?;
        Ok(())
    }

    fn symlink(&self, target: &str, link: &str) -> FsResult<()> {
        let mut request = self.simple("symlink", link);
        request.target = target.to_string();
        self.call(request, &[])?;
        Ok(())
    }

    fn read_link(&self, path: &str) -> FsResult<String> {
        match self.call(self.simple("read_link", path), &[])? {
            (ProxyReply::Text { text }, _) => Ok(text),
            _ => Err(FsError::Interrupted),
        }
    }

    fn exists(&self, path: &str) -> bool {
        matches!(
            self.call(self.simple("exists", path), &[]),
            Ok((ProxyReply::Flag { value: true }, _))
        )
    }
}

fn dispatch(fs: &dyn FileSystem, request: &ProxyRequest, binary: &[u8]) -> (ProxyReply, Vec<u8>) {
    let unit = |r: FsResult<()>| r.map(|_| (ProxyReply::Unit, Vec::new()));
    let result: FsResult<(ProxyReply, Vec<u8>)> = match request.op.as_str() {
        "read_file" => fs.read_file(&request.path).map(|b| (ProxyReply::Bytes, b)),
        "write_file" => unit(fs.write_file(&request.path, binary)),
        "append_file" => unit(fs.append_file(&request.path, binary)),
        "mkdir" => unit(fs.mkdir(&request.path)),
        "mkdirp" => unit(fs.mkdirp(&request.path)),
        "read_dir" => fs
            .read_dir(&request.path)
            .map(|entries| (ProxyReply::Entries { entries }, Vec::new())),
        "stat" => fs
            .stat(&request.path)
            .map(|stat| (ProxyReply::Stat { stat }, Vec::new())),
        "lstat" => fs
            .lstat(&request.path)
            .map(|stat| (ProxyReply::Stat { stat }, Vec::new())),
        "unlink" => unit(fs.unlink(&request.path)),
        "rmdir" => unit(fs.rmdir(&request.path)),
        "rename" => unit(fs.rename(&request.path, &request.target)),
        "chmod" => unit(fs.chmod(&request.path, request.mode)),
        "symlink" => unit(fs.symlink(&request.target, &request.path)),
        "read_link" => fs
            .read_link(&request.path)
            .map(|text| (ProxyReply::Text { text }, Vec::new())),
        "exists" => Ok((
            ProxyReply::Flag {
                value: fs.exists(&request.path),
            },
            Vec::new(),
        )),
        _ => Err(FsError::Unsupported),
    };
    match result {
        Ok(reply) => reply,
        Err(err) => (
            ProxyReply::Error {
                code: err.code().to_string(),
                message: err.to_string(),
            },
            Vec::new(),
        ),
    }
}

/// Main-side service loop: route decoded ops to the real filesystem
/// until the channel shuts down.
pub(crate) fn serve_vfs(channel: Arc<ProxyChannel>, fs: Arc<dyn FileSystem>) {
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
            Some((meta, binary)) => match serde_json::from_slice::<ProxyRequest>(&meta) {
                Ok(request) => {
                    let (reply, binary) = dispatch(fs.as_ref(), &request, &binary);
                    let status = if matches!(reply, ProxyReply::Error { .. }) {
                        STATUS_ERROR
                    } else {
                        STATUS_RESPONSE
                    };
                    let meta = serde_json::to_vec(&reply).unwrap_or_default();
                    (status, encode_frame(&meta, &binary))
                }
                Err(e) => {
                    let meta = serde_json::to_vec(&ProxyReply::Error {
                        code: "EINTR".to_string(),
                        message: format!("malformed proxy request: {e}"),
                    })
                    .unwrap_or_default();
                    (STATUS_ERROR, encode_frame(&meta, &[]))
                }
            },
            None => {
                let meta = serde_json::to_vec(&ProxyReply::Error {
                    code: "EINTR".to_string(),
                    message: "malformed proxy frame".to_string(),
                })
                .unwrap_or_default();
                (STATUS_ERROR, encode_frame(&meta, &[]))
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

#[cfg(test)]
mod tests {
    use super::*;
    use wasmbox_vfs::Vfs;

    fn proxied() -> (Arc<ProxyChannel>, VfsProxy, Vfs, std::thread::JoinHandle<()>) {
        let channel = Arc::new(ProxyChannel::default());
        let vfs = Vfs::new();
        let service_channel = channel.clone();
        let service_fs: Arc<dyn FileSystem> = Arc::new(vfs.clone());
        let service = std::thread::spawn(move || serve_vfs(service_channel, service_fs));
        (channel.clone(), VfsProxy::new(channel), vfs, service)
    }

    #[test]
    fn proxy_round_trips_core_operations() {
        let (channel, proxy, vfs, service) = proxied();

        proxy.mkdirp("/tmp/deep/dir").unwrap();
        proxy.write_file("/tmp/deep/dir/f.txt", b"through the proxy").unwrap();
        assert_eq!(
            proxy.read_file("/tmp/deep/dir/f.txt").unwrap(),
            b"through the proxy"
        );
        // The real tree saw the write.
        assert_eq!(
            vfs.read_file("/tmp/deep/dir/f.txt").unwrap(),
            b"through the proxy"
        );

        proxy.append_file("/tmp/deep/dir/f.txt", b"!").unwrap();
        assert_eq!(proxy.stat("/tmp/deep/dir/f.txt").unwrap().size, 18);

        let names: Vec<String> = proxy
            .read_dir("/tmp/deep/dir")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["f.txt"]);

        proxy.symlink("/tmp/deep/dir/f.txt", "/tmp/ln").unwrap();
        assert_eq!(proxy.read_link("/tmp/ln").unwrap(), "/tmp/deep/dir/f.txt");
        assert!(proxy.exists("/tmp/ln"));

        proxy.rename("/tmp/deep/dir/f.txt", "/tmp/moved").unwrap();
        assert!(!proxy.exists("/tmp/deep/dir/f.txt"));
        assert_eq!(proxy.read_file("/tmp/moved").unwrap(), b"through the proxy!");

        assert_eq!(
            proxy.read_file("/absent"),
            Err(FsError::EntryNotFound)
        );

        channel.shutdown();
        service.join().unwrap();
    }

    #[test]
    fn shutdown_poisons_in_flight_calls() {
        let (channel, proxy, _vfs, service) = proxied();
        channel.shutdown();
        service.join().unwrap();
        assert_eq!(proxy.read_file("/tmp/x"), Err(FsError::Interrupted));
    }
}
