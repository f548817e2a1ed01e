//! Versioned state blob: 12-byte header (`"WSND"`, little-endian u32
//! version, 4 reserved bytes) followed by UTF-8 JSON.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use wasmbox_vfs::{ExportEntry, FileType, Vfs};

use crate::error::SandboxError;

pub const BLOB_MAGIC: &[u8; 4] = b"WSND";
pub const BLOB_VERSION: u32 = 1;
const HEADER_LEN: usize = 12;

#[derive(Serialize, Deserialize)]
struct BlobFile {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    permissions: Option<u32>,
}

#[derive(Serialize, Deserialize)]
struct Blob {
    version: u32,
    files: Vec<BlobFile>,
    env: Vec<(String, String)>,
}

fn kind_str(file_type: FileType) -> &'static str {
    match file_type {
        FileType::File => "file",
        FileType::Dir => "dir",
        FileType::Symlink => "symlink",
    }
}

/// Serialize the non-mounted subtree plus the environment.
pub fn export_state(vfs: &Vfs, env: &[(String, String)]) -> Vec<u8> {
    let files = vfs
        .export_entries()
        .into_iter()
        .map(|entry| BlobFile {
            path: entry.path,
            kind: kind_str(entry.file_type).to_string(),
            data: entry.data.map(|bytes| BASE64.encode(bytes)),
            permissions: Some(entry.mode),
        })
        .collect();
    let blob = Blob {
        version: BLOB_VERSION,
        files,
        env: env.to_vec(),
    };
    let mut out = Vec::with_capacity(HEADER_LEN + 256);
    out.extend_from_slice(BLOB_MAGIC);
    out.extend_from_slice(&BLOB_VERSION.to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&serde_json::to_vec(&blob).expect("blob serializes"));
    out
}

/// Replace the non-mounted subtree from a blob; mounts are preserved.
/// Returns the stored environment. Unknown versions are refused.
pub fn import_state(vfs: &Vfs, bytes: &[u8]) -> Result<Vec<(String, String)>, SandboxError> {
    if bytes.len() < HEADER_LEN {
        return Err(SandboxError::MalformedBlob("shorter than header".to_string()));
    }
    if &bytes[0..4] != BLOB_MAGIC {
        return Err(SandboxError::MalformedBlob("bad magic".to_string()));
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().expect("sized slice"));
    if version != BLOB_VERSION {
        return Err(SandboxError::UnsupportedVersion(version));
    }
    let blob: Blob = serde_json::from_slice(&bytes[HEADER_LEN..])
        .map_err(|e| SandboxError::MalformedBlob(e.to_string()))?;

    let mut entries = Vec::with_capacity(blob.files.len());
    for file in blob.files {
        let file_type = match file.kind.as_str() {
            "file" => FileType::File,
            "dir" => FileType::Dir,
            "symlink" => FileType::Symlink,
            other => {
                return Err(SandboxError::MalformedBlob(format!(
                    "unknown entry type {other:?}"
                )))
            }
        };
        let data = match file.data {
            Some(encoded) => Some(
                BASE64
                    .decode(encoded.as_bytes())
                    .map_err(|e| SandboxError::MalformedBlob(format!("{}: {e}", file.path)))?,
            ),
            None => None,
        };
        entries.push(ExportEntry {
            path: file.path,
            file_type,
            data,
            mode: file.permissions.unwrap_or(0o644),
        });
    }
    vfs.import_entries(&entries)?;
    Ok(blob.env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wasmbox_vfs::FileSystem;

    #[test]
    fn header_is_magic_version_reserved() {
        let vfs = Vfs::new();
        let blob = export_state(&vfs, &[]);
        assert_eq!(&blob[0..4], b"WSND");
        assert_eq!(u32::from_le_bytes(blob[4..8].try_into().unwrap()), 1);
        assert_eq!(&blob[8..12], &[0, 0, 0, 0]);
        assert!(serde_json::from_slice::<serde_json::Value>(&blob[12..]).is_ok());
    }

    #[test]
    fn roundtrip_preserves_files_and_env() {
        let vfs = Vfs::new();
        vfs.write_file("/home/user/a.txt", b"alpha").unwrap();
        vfs.write_file("/tmp/raw.bin", &[1, 2, 3, 255]).unwrap();
        let env = vec![("HOME".to_string(), "/home/user".to_string())];

        let blob = export_state(&vfs, &env);
        let fresh = Vfs::bare();
        let restored_env = import_state(&fresh, &blob).unwrap();

        assert_eq!(restored_env, env);
        assert_eq!(fresh.read_file("/home/user/a.txt").unwrap(), b"alpha");
        assert_eq!(fresh.read_file("/tmp/raw.bin").unwrap(), vec![1, 2, 3, 255]);
        assert_eq!(fresh.export_entries(), vfs.export_entries());
    }

    #[test]
    fn unknown_version_is_refused() {
        let vfs = Vfs::new();
        let mut blob = export_state(&vfs, &[]);
        blob[4..8].copy_from_slice(&99u32.to_le_bytes());
        match import_state(&Vfs::bare(), &blob) {
            Err(SandboxError::UnsupportedVersion(99)) => {}
            other => panic!("expected version refusal, got {other:?}"),
        }
    }

    #[test]
    fn bad_magic_is_malformed() {
        let vfs = Vfs::new();
        let mut blob = export_state(&vfs, &[]);
        blob[0] = b'X';
        assert!(matches!(
            import_state(&Vfs::bare(), &blob),
            Err(SandboxError::MalformedBlob(_))
        ));
    }

    #[test]
    fn import_preserves_existing_mounts() {
        use std::collections::HashMap;
        use std::sync::Arc;
        use wasmbox_vfs::HostMount;

        let source = Vfs::new();
        source.write_file("/home/user/kept.txt", b"kept").unwrap();
        let blob = export_state(&source, &[]);

        let target = Vfs::new();
        let files: HashMap<String, Vec<u8>> =
            [("data.txt".to_string(), b"mounted".to_vec())].into();
        target.mount("/mnt/tools", Arc::new(HostMount::new(files))).unwrap();
        target.write_file("/home/user/stale.txt", b"stale").unwrap();

        import_state(&target, &blob).unwrap();
        assert_eq!(target.read_file("/home/user/kept.txt").unwrap(), b"kept");
        assert!(!target.exists("/home/user/stale.txt"));
        assert_eq!(target.read_file("/mnt/tools/data.txt").unwrap(), b"mounted");
    }
}
