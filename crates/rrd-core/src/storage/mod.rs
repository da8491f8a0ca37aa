//! # Single-file round-robin container
//!
//! Each archive is one file with fixed offsets for every region, so an
//! update only overwrites 8-byte ring slots plus the fixed-size live state.
//! The file never grows after creation.
//!
//! ## File Structure
//!
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ magic "RRDHW\0\0\0"          │ 8 bytes
//! │ version                      │ u32
//! │ definition capacity          │ u32
//! │ definition length            │ u32
//! ├──────────────────────────────┤ 20
//! │ postcard definition          │ padded to capacity
//! ├──────────────────────────────┤
//! │ live state                   │ see [`state`]
//! ├──────────────────────────────┤
//! │ ring 0: rows × f64           │
//! │ ring 1: rows × f64           │
//! │ ...                          │
//! └──────────────────────────────┘
//! ```
//!
//! All integers and floats are little-endian. Unknown CDPs are stored as NaN.
//!
//! ## Commit order
//!
//! An update writes its ring slots first and the live state last. Each slot
//! is written at most once per update, and at most `rows` slots per ring. If
//! a write fails, the archive writes the touched slots and the live state
//! back from its in-memory copy. Only when that restore fails too can the
//! file keep new values in rows the stored cursors still count as old; the
//! ring structure itself stays valid.

pub(crate) mod codec;
pub mod ring;
pub mod state;

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, error};

use crate::definition::ArchiveDef;
use crate::error::RrdError;

use codec::{ByteReader, ByteWriter};
pub use ring::Ring;
pub use state::{CdpPrep, LiveState, PdpPrep, RraState};

const MAGIC: [u8; 8] = *b"RRDHW\0\0\0";
const VERSION: u32 = 1;
const PREAMBLE_LEN: u64 = 8 + 4 + 4 + 4;

/// Spare definition bytes reserved for later tuning
const DEFINITION_SLACK: usize = 64;

/// One CDP destined for a ring slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotWrite {
    pub rra: usize,
    pub row: u32,
    pub value: f64,
}

/// Byte offsets of every region, derived from the definition
#[derive(Debug, Clone, PartialEq)]
struct Layout {
    definition_capacity: u32,
    state_offset: u64,
    state_len: usize,
    ring_offsets: Vec<u64>,
    file_len: u64,
}

impl Layout {
    fn new(def: &ArchiveDef, definition_capacity: u32) -> Self {
        let state_offset = PREAMBLE_LEN + definition_capacity as u64;
        let state_len = LiveState::encoded_len(def);

        let mut offset = state_offset + state_len as u64;
        let mut ring_offsets = Vec::with_capacity(def.rras.len());
        for rra in &def.rras {
            ring_offsets.push(offset);
            offset += rra.rows as u64 * 8;
        }

        Self {
            definition_capacity,
            state_offset,
            state_len,
            ring_offsets,
            file_len: offset,
        }
    }

    fn slot_offset(&self, write: &SlotWrite) -> u64 {
        self.ring_offsets[write.rra] + write.row as u64 * 8
    }
}

/// Everything read back from an existing archive
#[derive(Debug)]
pub struct LoadedArchive {
    pub file: ArchiveFile,
    pub def: ArchiveDef,
    pub state: LiveState,
    pub rings: Vec<Ring>,
}

/// Open handle on an archive file
#[derive(Debug)]
pub struct ArchiveFile {
    file: File,
    path: PathBuf,
    layout: Layout,
}

impl ArchiveFile {
    /// Write a brand new archive with unknown-filled rings
    ///
    /// With `overwrite`, any existing file at `path` is removed first.
    pub fn create(
        path: &Path,
        def: &ArchiveDef,
        state: &LiveState,
        overwrite: bool,
    ) -> Result<Self, RrdError> {
        if path.as_os_str().is_empty() {
            return Err(RrdError::invalid("archive path is empty"));
        }
        if path.exists() {
            if !overwrite {
                return Err(RrdError::invalid(format!(
                    "archive {} already exists",
                    path.display()
                )));
            }
            fs::remove_file(path)?;
            debug!("Removed existing archive {}", path.display());
        }

        let definition = postcard::to_allocvec(def)?;
        let capacity = (definition.len() + DEFINITION_SLACK).next_multiple_of(8);
        let layout = Layout::new(def, capacity as u32);

        let mut w = ByteWriter::with_capacity(layout.file_len as usize);
        w.put_bytes(&MAGIC);
        w.put_u32(VERSION);
        w.put_u32(layout.definition_capacity);
        w.put_u32(definition.len() as u32);
        w.put_bytes(&definition);
        w.put_bytes(&vec![0u8; capacity - definition.len()]);
        w.put_bytes(&state.to_bytes());
        for rra in &def.rras {
            for _ in 0..rra.rows {
                w.put_f64(f64::NAN);
            }
        }
        debug_assert_eq!(w.len() as u64, layout.file_len);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(&w.into_bytes())?;
        file.sync_all()?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            layout,
        })
    }

    /// Open an existing archive and load its definition, state and rings
    pub fn open(path: &Path) -> Result<LoadedArchive, RrdError> {
        let mut file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(RrdError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let mut r = ByteReader::new(&bytes);

        if r.get_bytes(MAGIC.len())? != MAGIC {
            return Err(RrdError::Corrupt(format!(
                "{} is not an archive file",
                path.display()
            )));
        }
        let version = r.get_u32()?;
        if version != VERSION {
            return Err(RrdError::Corrupt(format!("unsupported version {version}")));
        }
        let capacity = r.get_u32()?;
        let definition_len = r.get_u32()?;
        if definition_len > capacity {
            return Err(RrdError::Corrupt(format!(
                "definition length {definition_len} exceeds capacity {capacity}"
            )));
        }
        let definition = r.get_bytes(capacity as usize)?;
        let def: ArchiveDef = postcard::from_bytes(&definition[..definition_len as usize])?;

        let layout = Layout::new(&def, capacity);
        if bytes.len() as u64 != layout.file_len {
            return Err(RrdError::Corrupt(format!(
                "file is {} bytes, definition describes {}",
                bytes.len(),
                layout.file_len
            )));
        }

        let state = LiveState::from_bytes(&def, r.get_bytes(layout.state_len)?)?;

        let mut rings = Vec::with_capacity(def.rras.len());
        for rra in &def.rras {
            let slots = (0..rra.rows)
                .map(|_| r.get_f64())
                .collect::<Result<Vec<_>, _>>()?;
            rings.push(Ring::from_slots(slots));
        }

        Ok(LoadedArchive {
            file: Self {
                file,
                path: path.to_path_buf(),
                layout,
            },
            def,
            state,
            rings,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the given ring slots in place
    pub fn write_slots(&mut self, writes: &[SlotWrite]) -> Result<(), RrdError> {
        for write in writes {
            let offset = self.layout.slot_offset(write);
            self.write_at(offset, &write.value.to_le_bytes())?;
        }
        Ok(())
    }

    /// Overwrite the live state block (the commit point of an update)
    pub fn write_state(&mut self, state: &LiveState) -> Result<(), RrdError> {
        let bytes = state.to_bytes();
        if bytes.len() != self.layout.state_len {
            return Err(RrdError::Corrupt(format!(
                "live state is {} bytes, layout reserves {}",
                bytes.len(),
                self.layout.state_len
            )));
        }
        self.write_at(self.layout.state_offset, &bytes)
    }

    /// Rewrite the definition block after tuning
    ///
    /// The ring layout must not change; only parameters may differ.
    pub fn write_definition(&mut self, def: &ArchiveDef) -> Result<(), RrdError> {
        let definition = postcard::to_allocvec(def)?;
        if definition.len() > self.layout.definition_capacity as usize {
            return Err(RrdError::invalid(format!(
                "definition grew to {} bytes, {} reserved",
                definition.len(),
                self.layout.definition_capacity
            )));
        }
        if Layout::new(def, self.layout.definition_capacity) != self.layout {
            return Err(RrdError::invalid("tuning may not change the ring layout"));
        }

        let mut w = ByteWriter::with_capacity(4 + definition.len());
        w.put_u32(definition.len() as u32);
        w.put_bytes(&definition);
        self.write_at(PREAMBLE_LEN - 4, &w.into_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Flush written data to the device
    pub fn sync(&mut self) -> Result<(), RrdError> {
        self.file.sync_data()?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), RrdError> {
        let result = self
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(bytes));
        if let Err(e) = result {
            error!(
                "Failed to write {} bytes at {} in {}: {}",
                bytes.len(),
                offset,
                self.path.display(),
                e
            );
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{DataSource, RraSpec, TuneRequest};

    fn def() -> ArchiveDef {
        ArchiveDef::build(
            1_641_600_000,
            86_400,
            DataSource::gauge("data", 172_800).with_range(-273.0, 5000.0),
            &[
                RraSpec::average(0.5, 1, 10),
                RraSpec::hw_predict(6, 0.5, 0.1, 2),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_create_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp.rrd");
        let def = def();
        let state = LiveState::initial(&def);

        ArchiveFile::create(&path, &def, &state, false).unwrap();
        let loaded = ArchiveFile::open(&path).unwrap();

        assert_eq!(loaded.def, def);
        assert_eq!(loaded.state.last_update, def.start);
        assert_eq!(loaded.rings.len(), 6);
        assert_eq!(loaded.rings[0].rows(), 10);
        assert!(loaded.rings[0].slots().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_existing_file_needs_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp.rrd");
        let def = def();
        let state = LiveState::initial(&def);

        ArchiveFile::create(&path, &def, &state, false).unwrap();
        assert!(matches!(
            ArchiveFile::create(&path, &def, &state, false),
            Err(RrdError::InvalidArgument(_))
        ));
        assert!(ArchiveFile::create(&path, &def, &state, true).is_ok());
    }

    #[test]
    fn test_slot_and_state_writes_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp.rrd");
        let def = def();
        let mut state = LiveState::initial(&def);

        let mut file = ArchiveFile::create(&path, &def, &state, false).unwrap();
        file.write_slots(&[
            SlotWrite { rra: 0, row: 0, value: 21.5 },
            SlotWrite { rra: 5, row: 3, value: 1.0 },
        ])
        .unwrap();
        state.last_update += 86_400;
        state.rras[0].cursor = 0;
        file.write_state(&state).unwrap();
        drop(file);

        let loaded = ArchiveFile::open(&path).unwrap();
        assert_eq!(loaded.rings[0].get(0), 21.5);
        assert_eq!(loaded.rings[5].get(3), 1.0);
        assert_eq!(loaded.state.last_update, def.start + 86_400);
        assert_eq!(loaded.state.rras[0].cursor, 0);
    }

    #[test]
    fn test_definition_rewrite_keeps_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp.rrd");
        let mut def = def();
        let state = LiveState::initial(&def);

        let mut file = ArchiveFile::create(&path, &def, &state, false).unwrap();
        def.forecasts[0].params = TuneRequest::default()
            .with_ro(3.0)
            .apply(&def.forecasts[0].params);
        file.write_definition(&def).unwrap();

        let mut grown = def.clone();
        grown.rras[0].rows = 11;
        assert!(file.write_definition(&grown).is_err());
        drop(file);

        let loaded = ArchiveFile::open(&path).unwrap();
        assert_eq!(loaded.def.forecasts[0].params.delta_pos, 3.0);
    }

    #[test]
    fn test_missing_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.rrd");
        assert!(matches!(
            ArchiveFile::open(&missing),
            Err(RrdError::NotFound(_))
        ));

        let foreign = dir.path().join("notes.txt");
        fs::write(&foreign, b"just some text, definitely not an archive").unwrap();
        assert!(matches!(
            ArchiveFile::open(&foreign),
            Err(RrdError::Corrupt(_))
        ));
    }
}
