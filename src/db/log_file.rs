//! Append-only auxiliary files (spec §4.7): `image-info.dat` and
//! `object-type.dat`. Both are simple growing logs of length-prefixed
//! records; unlike the hash tables, nothing is ever looked up in-process,
//! so no index is maintained here.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub struct AppendLog {
    path: PathBuf,
    file: std::fs::File,
}

impl AppendLog {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .read(true)
            .open(&path)?;
        Ok(AppendLog { path, file })
    }

    /// Appends one length-prefixed record: a 4-byte little-endian length
    /// followed by `bytes`.
    pub fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        let len = bytes.len() as u32;
        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Encodes one `image-info.dat` record (spec §3 image load log): UUID +
/// load address + path.
pub fn encode_image_info(uuid: [u8; 16], load_address: u64, path: &str) -> Vec<u8> {
    let path_bytes = path.as_bytes();
    let mut out = Vec::with_capacity(16 + 8 + path_bytes.len());
    out.extend_from_slice(&uuid);
    out.extend_from_slice(&load_address.to_le_bytes());
    out.extend_from_slice(path_bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_writes_length_prefixed_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image-info.dat");
        {
            let mut log = AppendLog::open(&path).unwrap();
            log.append(&encode_image_info([7; 16], 0x1000, "/bin/app")).unwrap();
        }
        let bytes = std::fs::read(&path).unwrap();
        let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        assert_eq!(len, 16 + 8 + "/bin/app".len());
        assert_eq!(bytes.len(), 4 + len);
    }
}
