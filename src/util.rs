//! Bincode persistence for configuration files.

use std::{
    fs::File,
    io::{self, ErrorKind, Read, Write},
    path::Path,
};

use bincode::{Decode, Encode};

/// Save to file, using Bincode.
pub fn save<T: Encode>(path: &Path, data: &T) -> io::Result<()> {
    let config = bincode::config::standard();

    let encoded = bincode::encode_to_vec(data, config)
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;

    let mut file = File::create(path)?;
    file.write_all(&encoded)?;
    Ok(())
}

/// Load from file, using Bincode.
pub fn load<T: Decode<()>>(path: &Path) -> io::Result<T> {
    let mut file = File::open(path)?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;

    load_from_bytes(&buffer)
}

pub fn load_from_bytes<T: Decode<()>>(buffer: &[u8]) -> io::Result<T> {
    let config = bincode::config::standard();

    match bincode::decode_from_slice(buffer, config) {
        Ok((decoded, _len)) => Ok(decoded),
        Err(e) => {
            log::error!("Error loading from file. Did the format change? {e}");
            Err(io::Error::new(ErrorKind::InvalidData, "error loading"))
        }
    }
}
