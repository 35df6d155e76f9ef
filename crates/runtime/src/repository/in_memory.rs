use super::{DigestRecord, DigestRepository, Result};

/// Keeps digests in memory; the default when no log directory is set.
#[derive(Debug, Default)]
pub struct InMemoryDigestRepository {
    records: Vec<DigestRecord>,
}

impl InMemoryDigestRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl DigestRepository for InMemoryDigestRepository {
    fn append(&mut self, record: &DigestRecord) -> Result<()> {
        self.records.push(*record);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<DigestRecord>> {
        Ok(self.records.clone())
    }
}
