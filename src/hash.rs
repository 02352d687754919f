use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use hex::encode;
use sha2::{Digest, Sha256};

use crate::error::HoardError;

pub struct Hash;

impl Hash {
    /// Hex-encoded SHA-256 digest of a file's contents, read in 8KB chunks.
    pub fn compute_sha256_hash(path: &Path) -> Result<String, HoardError> {
        let f = File::open(path)?;
        let mut reader = BufReader::new(f);
        let mut hasher = Sha256::new();
        let mut buffer = [0; 8192];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(encode(hasher.finalize()))
    }

    /// Returns true when both files hash to the same digest.
    pub fn same_contents(a: &Path, b: &Path) -> Result<bool, HoardError> {
        Ok(Self::compute_sha256_hash(a)? == Self::compute_sha256_hash(b)?)
    }
}
