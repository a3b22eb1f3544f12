// src/hardware/storage.rs - Non-volatile byte storage and the image layout
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage range {offset}+{len} exceeds {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },
    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte-addressed non-volatile memory. Erased bytes read as `0xFF`.
pub trait Storage: Send {
    fn size(&self) -> usize;
    fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, StorageError>;
    /// Erase and rewrite `data.len()` bytes starting at `offset`.
    fn write_erase(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError>;
}

fn check_range(offset: usize, len: usize, size: usize) -> Result<(), StorageError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(StorageError::OutOfBounds { offset, len, size }),
    }
}

/// Volatile image, used by tests and when no backing file is configured.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    bytes: Vec<u8>,
}

impl MemoryStorage {
    pub fn new(size: usize) -> Self {
        Self { bytes: vec![0xFF; size] }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Storage for MemoryStorage {
    fn size(&self) -> usize {
        self.bytes.len()
    }

    fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, StorageError> {
        check_range(offset, len, self.bytes.len())?;
        Ok(self.bytes[offset..offset + len].to_vec())
    }

    fn write_erase(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        check_range(offset, data.len(), self.bytes.len())?;
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Image mirrored to a file; every write rewrites the whole file.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    image: MemoryStorage,
}

impl FileStorage {
    /// Open the image at `path`, creating an erased one if the file does not exist.
    /// A shorter file is padded with erased bytes, a longer one truncated.
    pub fn open(path: impl AsRef<Path>, size: usize) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let mut image = MemoryStorage::new(size);
        match std::fs::read(&path) {
            Ok(bytes) => {
                let len = bytes.len().min(size);
                image.bytes[..len].copy_from_slice(&bytes[..len]);
                tracing::info!("Loaded storage image from {}", path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Creating blank storage image at {}", path.display());
                std::fs::write(&path, image.bytes())?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Self { path, image })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for FileStorage {
    fn size(&self) -> usize {
        self.image.size()
    }

    fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, StorageError> {
        self.image.read(offset, len)
    }

    fn write_erase(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        self.image.write_erase(offset, data)?;
        std::fs::write(&self.path, self.image.bytes())?;
        Ok(())
    }
}

/// Field offsets of the persisted image. All values are little-endian.
pub mod layout {
    use super::{Storage, StorageError};

    pub const SERIAL_NUMBER: usize = 0x00;
    pub const SERIAL_NUMBER_LEN: usize = 16;
    /// Five f32 probe heights: front-left, front-right, back-left, back-right, center.
    pub const PROBE_HEIGHTS: usize = 0x10;
    pub const SKEW_X: usize = 0x24;
    pub const SKEW_Y: usize = 0x28;
    pub const CALIBRATION_VALID: usize = 0x2C;
    /// X, Y, Z as f32.
    pub const LAST_POSITION: usize = 0x30;
    /// bit0 X, bit1 Y, bit2 Z
    pub const POSITION_VALID: usize = 0x3C;
    pub const EXTRUDED_MM: usize = 0x40;
    pub const BOOT_COUNTER: usize = 0x44;
    pub const IMAGE_SIZE: usize = 128;

    pub fn read_u8(storage: &dyn Storage, offset: usize) -> Result<u8, StorageError> {
        Ok(storage.read(offset, 1)?[0])
    }

    pub fn write_u8(storage: &mut dyn Storage, offset: usize, value: u8) -> Result<(), StorageError> {
        storage.write_erase(offset, &[value])
    }

    pub fn read_u32(storage: &dyn Storage, offset: usize) -> Result<u32, StorageError> {
        let bytes = storage.read(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u32(storage: &mut dyn Storage, offset: usize, value: u32) -> Result<(), StorageError> {
        storage.write_erase(offset, &value.to_le_bytes())
    }

    /// Erased cells decode to NaN; callers treat non-finite values as unset.
    pub fn read_f32(storage: &dyn Storage, offset: usize) -> Result<f32, StorageError> {
        read_u32(storage, offset).map(f32::from_bits)
    }

    pub fn write_f32(storage: &mut dyn Storage, offset: usize, value: f32) -> Result<(), StorageError> {
        write_u32(storage, offset, value.to_bits())
    }

    /// Read an unsigned field of 1 to 4 bytes.
    pub fn read_field(storage: &dyn Storage, offset: usize, len: usize) -> Result<u32, StorageError> {
        let bytes = storage.read(offset, len.clamp(1, 4))?;
        let mut word = [0u8; 4];
        word[..bytes.len()].copy_from_slice(&bytes);
        Ok(u32::from_le_bytes(word))
    }

    /// Write the low `len` bytes (1 to 4) of `value`.
    pub fn write_field(storage: &mut dyn Storage, offset: usize, len: usize, value: u32) -> Result<(), StorageError> {
        let len = len.clamp(1, 4);
        storage.write_erase(offset, &value.to_le_bytes()[..len])
    }

    /// Serial number with trailing NUL and erased bytes removed. `None` when blank.
    pub fn read_serial_number(storage: &dyn Storage) -> Result<Option<String>, StorageError> {
        let bytes = storage.read(SERIAL_NUMBER, SERIAL_NUMBER_LEN)?;
        let end = bytes.iter().position(|&b| b == 0 || b == 0xFF).unwrap_or(bytes.len());
        if end == 0 {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&bytes[..end]).into_owned()))
    }

    pub fn write_serial_number(storage: &mut dyn Storage, serial: &str) -> Result<(), StorageError> {
        let mut field = [0u8; SERIAL_NUMBER_LEN];
        let len = serial.len().min(SERIAL_NUMBER_LEN);
        field[..len].copy_from_slice(&serial.as_bytes()[..len]);
        storage.write_erase(SERIAL_NUMBER, &field)
    }
}

#[cfg(test)]
mod tests {
    use super::layout::*;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_storage_starts_erased() {
        let storage = MemoryStorage::new(IMAGE_SIZE);
        assert!(storage.bytes().iter().all(|&b| b == 0xFF));
        assert!(read_f32(&storage, SKEW_X).unwrap().is_nan());
        assert_eq!(read_serial_number(&storage).unwrap(), None);
    }

    #[test]
    fn test_out_of_bounds_access() {
        let mut storage = MemoryStorage::new(8);
        assert!(matches!(
            storage.read(6, 4),
            Err(StorageError::OutOfBounds { offset: 6, len: 4, size: 8 })
        ));
        assert!(storage.write_erase(usize::MAX, &[1]).is_err());
    }

    #[test]
    fn test_typed_fields() {
        let mut storage = MemoryStorage::new(IMAGE_SIZE);
        write_f32(&mut storage, SKEW_Y, -0.125).unwrap();
        write_u32(&mut storage, BOOT_COUNTER, 42).unwrap();
        assert_eq!(read_f32(&storage, SKEW_Y).unwrap(), -0.125);
        assert_eq!(read_u32(&storage, BOOT_COUNTER).unwrap(), 42);
        assert_eq!(storage.bytes()[BOOT_COUNTER], 42);
    }

    #[test]
    fn test_partial_width_fields() {
        let mut storage = MemoryStorage::new(IMAGE_SIZE);
        write_field(&mut storage, 0x50, 2, 0x1234_5678).unwrap();
        assert_eq!(read_field(&storage, 0x50, 2).unwrap(), 0x5678);
        assert_eq!(read_field(&storage, 0x50, 3).unwrap(), 0xFF_5678);
    }

    #[test]
    fn test_serial_number_is_truncated_to_field() {
        let mut storage = MemoryStorage::new(IMAGE_SIZE);
        write_serial_number(&mut storage, "BK15033001100ABCDEFG").unwrap();
        assert_eq!(read_serial_number(&storage).unwrap().as_deref(), Some("BK15033001100ABC"));
    }

    #[test]
    fn test_file_storage_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("eeprom.bin");
        {
            let mut storage = FileStorage::open(&path, IMAGE_SIZE).unwrap();
            write_u32(&mut storage, BOOT_COUNTER, 7).unwrap();
        }
        let storage = FileStorage::open(&path, IMAGE_SIZE).unwrap();
        assert_eq!(read_u32(&storage, BOOT_COUNTER).unwrap(), 7);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), IMAGE_SIZE as u64);
    }
}
