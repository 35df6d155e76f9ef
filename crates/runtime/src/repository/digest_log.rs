//! Append-only digest log file.
//!
//! Records are stored as
//! ```text
//! [u32 length][bincode serialized DigestRecord]
//! [u32 length][bincode serialized DigestRecord]
//! ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use super::{DigestRecord, DigestRepository, RepositoryError, Result};

pub struct FileDigestLog {
    path: PathBuf,
    writer: BufWriter<File>,
    current_offset: u64,
}

impl FileDigestLog {
    /// Creates a new log.
    ///
    /// # Errors
    ///
    /// Returns error if the file already exists.
    pub fn create(base_dir: impl AsRef<Path>, filename: impl AsRef<str>) -> Result<Self> {
        let base_dir = base_dir.as_ref();
        std::fs::create_dir_all(base_dir)?;

        let path = base_dir.join(filename.as_ref());
        if path.exists() {
            return Err(RepositoryError::LogAlreadyExists(path.display().to_string()));
        }

        let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        tracing::debug!(
            target: "runtime::repository",
            path = %path.display(),
            "created digest log"
        );

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            current_offset: 0,
        })
    }

    /// Opens an existing log for appending, creating it if missing.
    pub fn open_or_create(base_dir: impl AsRef<Path>, filename: impl AsRef<str>) -> Result<Self> {
        let base_dir = base_dir.as_ref();
        std::fs::create_dir_all(base_dir)?;

        let path = base_dir.join(filename.as_ref());
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_offset = file.metadata()?.len();
        tracing::debug!(
            target: "runtime::repository",
            path = %path.display(),
            offset = current_offset,
            "opened digest log"
        );

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            current_offset,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far, including buffered ones.
    pub fn size(&self) -> u64 {
        self.current_offset
    }
}

impl DigestRepository for FileDigestLog {
    fn append(&mut self, record: &DigestRecord) -> Result<()> {
        let bytes =
            bincode::serialize(record).map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        let len = bytes.len() as u32;

        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(&bytes)?;
        self.current_offset += 4 + bytes.len() as u64;
        Ok(())
    }

    /// Reads the file back from the start. Buffered records are flushed
    /// by the caller first.
    fn load_all(&self) -> Result<Vec<DigestRecord>> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        let mut offset = 0u64;

        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }
            let len = u32::from_le_bytes(len_bytes) as usize;

            let mut data = Vec::with_capacity(len);
            let actual = (&mut reader).take(len as u64).read_to_end(&mut data)?;
            if actual != len {
                return Err(RepositoryError::Truncated {
                    offset,
                    expected: len,
                    actual,
                });
            }

            let record = bincode::deserialize(&data)
                .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
            records.push(record);
            offset += 4 + len as u64;
        }

        Ok(records)
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for FileDigestLog {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!(
                target: "runtime::repository",
                path = %self.path.display(),
                "failed to flush digest log on drop: {e}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::ReplicaId;
    use lockstep_core::Tick;

    fn record(tick: u64, digest: u8) -> DigestRecord {
        DigestRecord {
            tick: Tick(tick),
            replica: ReplicaId(0),
            digest: [digest; 32],
            rand_digest: Some([digest ^ 0xff; 32]),
        }
    }

    #[test]
    fn records_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = FileDigestLog::create(dir.path(), "digests.log").unwrap();
            log.append(&record(1, 7)).unwrap();
            log.append(&record(2, 8)).unwrap();
        }

        let mut log = FileDigestLog::open_or_create(dir.path(), "digests.log").unwrap();
        log.append(&record(3, 9)).unwrap();
        log.flush().unwrap();

        let ticks: Vec<_> = log.load_all().unwrap().iter().map(|r| r.tick).collect();
        assert_eq!(ticks, vec![Tick(1), Tick(2), Tick(3)]);
    }

    #[test]
    fn create_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let _log = FileDigestLog::create(dir.path(), "digests.log").unwrap();
        assert!(matches!(
            FileDigestLog::create(dir.path(), "digests.log"),
            Err(RepositoryError::LogAlreadyExists(_))
        ));
    }

    #[test]
    fn truncated_tail_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = FileDigestLog::create(dir.path(), "digests.log").unwrap();
        log.append(&record(1, 1)).unwrap();
        log.flush().unwrap();

        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(&64u32.to_le_bytes()).unwrap();
        file.write_all(&[0u8; 10]).unwrap();

        assert!(matches!(
            log.load_all(),
            Err(RepositoryError::Truncated { expected: 64, actual: 10, .. })
        ));
    }
}
