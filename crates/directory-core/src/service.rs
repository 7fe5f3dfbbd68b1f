use crate::{DirectoryResult, GraphAssembler, Record, RecordId, RecordStore, SearchKey};

/// Answers the two read queries of the directory on top of a [`RecordStore`].
#[derive(Debug, Clone)]
pub struct DirectoryService<S> {
    store: S,
}

impl<S> DirectoryService<S>
where
    S: RecordStore,
{
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Fetch one record with both collections.
    ///
    /// A single parent cannot produce a cross-product, so the children are
    /// attached directly without going through the assembler.
    ///
    /// # Errors
    /// Returns [`crate::DirectoryError::NotFound`] unchanged when the id is unknown.
    pub fn get_by_id(&self, id: &RecordId) -> DirectoryResult<Record> {
        let header = self.store.find_by_id(id)?;
        let (addresses, phones) = self.store.find_children_of(id)?;
        tracing::debug!(
            record_id = %id,
            addresses = addresses.len(),
            phones = phones.len(),
            "loaded record by id"
        );
        Ok(Record::from_parts(header, addresses, phones))
    }

    /// Fetch every record matching `key`.
    ///
    /// Returns an empty list when nothing matches. Matching is anchored on the
    /// address fetch; see [`GraphAssembler`].
    ///
    /// # Errors
    /// Returns [`crate::DirectoryError::Validation`] for an incomplete key, or the
    /// store's error when either fetch fails.
    pub fn search(&self, key: &SearchKey) -> DirectoryResult<Vec<Record>> {
        key.validate()?;
        let address_rows = self.store.find_address_rows_by_key(key)?;
        let phone_rows = self.store.find_phone_rows_by_key(key)?;
        let fetched = (address_rows.len(), phone_rows.len());
        let records = GraphAssembler::assemble(address_rows, phone_rows);
        tracing::debug!(
            address_rows = fetched.0,
            phone_rows = fetched.1,
            records = records.len(),
            "search assembled records"
        );
        Ok(records)
    }
}
