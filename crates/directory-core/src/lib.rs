use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use ulid::Ulid;

mod assembler;
mod service;

pub use assembler::{AssemblyStats, GraphAssembler};
pub use service::DirectoryService;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DirectoryError {
    #[error("record not found: {0}")]
    NotFound(RecordId),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(String),
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Store-side identifier allocation.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ChildId(pub String);

impl ChildId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ChildId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChildId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// `YYYY-MM-DD` calendar dates.
pub mod calendar_date {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::{Date, Month};

    #[must_use]
    pub fn format(date: Date) -> String {
        format!("{:04}-{:02}-{:02}", date.year(), u8::from(date.month()), date.day())
    }

    /// Parse a `YYYY-MM-DD` string.
    ///
    /// # Errors
    /// Returns a description of the problem when the value is not a valid calendar date.
    pub fn parse(value: &str) -> Result<Date, String> {
        let mut parts = value.trim().splitn(3, '-');
        let (Some(year), Some(month), Some(day)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("expected YYYY-MM-DD, got `{value}`"));
        };
        let year = year.parse::<i32>().map_err(|err| format!("invalid year `{year}`: {err}"))?;
        let month = month.parse::<u8>().map_err(|err| format!("invalid month `{month}`: {err}"))?;
        let day = day.parse::<u8>().map_err(|err| format!("invalid day `{day}`: {err}"))?;
        let month = Month::try_from(month).map_err(|err| format!("invalid month: {err}"))?;
        Date::from_calendar_date(year, month, day).map_err(|err| format!("invalid date: {err}"))
    }

    pub mod option {
        use super::{format, parse, Date, Deserialize, Deserializer, Serializer};

        /// # Errors
        /// Propagates serializer failures.
        #[allow(clippy::ref_option)]
        pub fn serialize<S>(value: &Option<Date>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(date) => serializer.serialize_some(&format(*date)),
                None => serializer.serialize_none(),
            }
        }

        /// # Errors
        /// Returns a deserialization error when the value is not `YYYY-MM-DD`.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Date>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw = Option::<String>::deserialize(deserializer)?;
            raw.map(|value| parse(&value).map_err(serde::de::Error::custom)).transpose()
        }
    }
}

/// Scalar part of a directory record, without either child collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecordHeader {
    pub id: RecordId,
    pub first_name: String,
    pub last_name: String,
    #[serde(default, with = "calendar_date::option")]
    pub date_of_birth: Option<Date>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl RecordHeader {
    /// Check identity, name and timestamp invariants.
    ///
    /// # Errors
    /// Returns [`DirectoryError::Validation`] when a required field is blank or
    /// `updated_at` precedes `created_at`.
    pub fn validate(&self) -> DirectoryResult<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(DirectoryError::Validation("record id MUST NOT be empty".to_string()));
        }
        if self.first_name.trim().is_empty() || self.last_name.trim().is_empty() {
            return Err(DirectoryError::Validation(format!(
                "record {} MUST have first and last name",
                self.id
            )));
        }
        check_timestamps(self.id.as_str(), self.created_at, self.updated_at)
    }
}

/// First child collection of a record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub id: ChildId,
    pub record_id: RecordId,
    #[serde(rename = "type")]
    pub kind: String,
    pub street: String,
    pub city: String,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Address {
    /// # Errors
    /// Returns [`DirectoryError::Validation`] when the owner is missing or timestamps regress.
    pub fn validate(&self) -> DirectoryResult<()> {
        if self.record_id.as_str().trim().is_empty() {
            return Err(DirectoryError::Validation(format!(
                "address {} MUST reference an owning record",
                self.id
            )));
        }
        check_timestamps(self.id.as_str(), self.created_at, self.updated_at)
    }
}

/// Second child collection of a record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Phone {
    pub id: ChildId,
    pub record_id: RecordId,
    #[serde(rename = "type")]
    pub kind: String,
    pub number: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Phone {
    /// # Errors
    /// Returns [`DirectoryError::Validation`] when the owner is missing or timestamps regress.
    pub fn validate(&self) -> DirectoryResult<()> {
        if self.record_id.as_str().trim().is_empty() {
            return Err(DirectoryError::Validation(format!(
                "phone {} MUST reference an owning record",
                self.id
            )));
        }
        check_timestamps(self.id.as_str(), self.created_at, self.updated_at)
    }
}

/// A record with both child collections attached.
///
/// Children only carry their owner's id; the collections here are a read-time
/// view and are never written back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    #[serde(flatten)]
    pub header: RecordHeader,
    #[serde(default)]
    pub addresses: Vec<Address>,
    #[serde(default)]
    pub phones: Vec<Phone>,
}

impl Record {
    #[must_use]
    pub fn from_parts(header: RecordHeader, addresses: Vec<Address>, phones: Vec<Phone>) -> Self {
        Self { header, addresses, phones }
    }

    #[must_use]
    pub fn id(&self) -> &RecordId {
        &self.header.id
    }
}

/// One row of the address-by-key fetch: the address plus its parent's scalars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRow {
    pub parent: RecordHeader,
    pub address: Address,
}

/// One row of the phone-by-key fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneRow {
    pub parent_id: RecordId,
    pub phone: Phone,
}

/// Compound lookup key: two required equality fields and one optional filter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SearchKey {
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub gender: Option<String>,
}

impl SearchKey {
    #[must_use]
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self { first_name: first_name.into(), last_name: last_name.into(), gender: None }
    }

    #[must_use]
    pub fn with_gender(mut self, gender: impl Into<String>) -> Self {
        self.gender = Some(gender.into());
        self
    }

    /// # Errors
    /// Returns [`DirectoryError::Validation`] when either required field is blank.
    pub fn validate(&self) -> DirectoryResult<()> {
        if self.first_name.trim().is_empty() {
            return Err(DirectoryError::Validation("firstName MUST be provided".to_string()));
        }
        if self.last_name.trim().is_empty() {
            return Err(DirectoryError::Validation("lastName MUST be provided".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn matches(&self, header: &RecordHeader) -> bool {
        header.first_name == self.first_name
            && header.last_name == self.last_name
            && self.gender.as_ref().map_or(true, |gender| header.gender.as_ref() == Some(gender))
    }
}

/// Read-only access to the relational collaborator.
pub trait RecordStore {
    /// Load one record without its children.
    ///
    /// # Errors
    /// Returns [`DirectoryError::NotFound`] when no record has this id.
    fn find_by_id(&self, id: &RecordId) -> DirectoryResult<RecordHeader>;

    /// Addresses whose parent matches `key`, each with its parent's scalars embedded.
    ///
    /// # Errors
    /// Returns [`DirectoryError::Store`] when the collaborator fails.
    fn find_address_rows_by_key(&self, key: &SearchKey) -> DirectoryResult<Vec<AddressRow>>;

    /// Phones whose parent matches `key`.
    ///
    /// # Errors
    /// Returns [`DirectoryError::Store`] when the collaborator fails.
    fn find_phone_rows_by_key(&self, key: &SearchKey) -> DirectoryResult<Vec<PhoneRow>>;

    /// Both collections for one known record.
    ///
    /// # Errors
    /// Returns [`DirectoryError::Store`] when the collaborator fails.
    fn find_children_of(&self, id: &RecordId) -> DirectoryResult<(Vec<Address>, Vec<Phone>)>;
}

impl<S> RecordStore for &S
where
    S: RecordStore + ?Sized,
{
    fn find_by_id(&self, id: &RecordId) -> DirectoryResult<RecordHeader> {
        (**self).find_by_id(id)
    }

    fn find_address_rows_by_key(&self, key: &SearchKey) -> DirectoryResult<Vec<AddressRow>> {
        (**self).find_address_rows_by_key(key)
    }

    fn find_phone_rows_by_key(&self, key: &SearchKey) -> DirectoryResult<Vec<PhoneRow>> {
        (**self).find_phone_rows_by_key(key)
    }

    fn find_children_of(&self, id: &RecordId) -> DirectoryResult<(Vec<Address>, Vec<Phone>)> {
        (**self).find_children_of(id)
    }
}

fn check_timestamps(
    id: &str,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
) -> DirectoryResult<()> {
    if updated_at < created_at {
        return Err(DirectoryError::Validation(format!(
            "{id}: updated_at MUST NOT precede created_at"
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::collections::BTreeMap;

    use time::Duration;

    use super::*;

    pub fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    pub fn header(id: &str, first_name: &str, last_name: &str) -> RecordHeader {
        RecordHeader {
            id: RecordId::from(id),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            date_of_birth: None,
            gender: None,
            created_at: fixture_time(),
            updated_at: fixture_time(),
        }
    }

    pub fn address(id: &str, record_id: &str, kind: &str) -> Address {
        Address {
            id: ChildId::from(id),
            record_id: RecordId::from(record_id),
            kind: kind.to_string(),
            street: format!("{id} street"),
            city: "Springfield".to_string(),
            postal_code: None,
            created_at: fixture_time(),
            updated_at: fixture_time(),
        }
    }

    pub fn phone(id: &str, record_id: &str, kind: &str) -> Phone {
        Phone {
            id: ChildId::from(id),
            record_id: RecordId::from(record_id),
            kind: kind.to_string(),
            number: format!("555-{id}"),
            created_at: fixture_time(),
            updated_at: fixture_time(),
        }
    }

    /// In-memory collaborator keeping rows in insertion order.
    #[derive(Debug, Default)]
    pub struct FakeStore {
        pub headers: Vec<RecordHeader>,
        pub addresses: Vec<Address>,
        pub phones: Vec<Phone>,
    }

    impl FakeStore {
        fn header_index(&self) -> BTreeMap<&RecordId, &RecordHeader> {
            self.headers.iter().map(|header| (&header.id, header)).collect()
        }
    }

    impl RecordStore for FakeStore {
        fn find_by_id(&self, id: &RecordId) -> DirectoryResult<RecordHeader> {
            self.headers
                .iter()
                .find(|header| &header.id == id)
                .cloned()
                .ok_or_else(|| DirectoryError::NotFound(id.clone()))
        }

        fn find_address_rows_by_key(&self, key: &SearchKey) -> DirectoryResult<Vec<AddressRow>> {
            let index = self.header_index();
            Ok(self
                .addresses
                .iter()
                .filter_map(|address| {
                    let parent = index.get(&address.record_id)?;
                    key.matches(parent)
                        .then(|| AddressRow { parent: (*parent).clone(), address: address.clone() })
                })
                .collect())
        }

        fn find_phone_rows_by_key(&self, key: &SearchKey) -> DirectoryResult<Vec<PhoneRow>> {
            let index = self.header_index();
            Ok(self
                .phones
                .iter()
                .filter(|phone| {
                    index.get(&phone.record_id).is_some_and(|parent| key.matches(parent))
                })
                .map(|phone| PhoneRow { parent_id: phone.record_id.clone(), phone: phone.clone() })
                .collect())
        }

        fn find_children_of(&self, id: &RecordId) -> DirectoryResult<(Vec<Address>, Vec<Phone>)> {
            let addresses =
                self.addresses.iter().filter(|address| &address.record_id == id).cloned().collect();
            let phones =
                self.phones.iter().filter(|phone| &phone.record_id == id).cloned().collect();
            Ok((addresses, phones))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{address, fixture_time, header};
    use super::*;

    #[test]
    fn record_serializes_with_flat_camel_case_shape() {
        let mut parent = header("u1", "Jhon", "Victor");
        parent.date_of_birth =
            Some(calendar_date::parse("1990-04-07").unwrap_or_else(|err| panic!("{err}")));
        let record = Record::from_parts(parent, vec![address("a1", "u1", "Home")], Vec::new());

        let value = serde_json::to_value(&record).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(value.get("id").and_then(serde_json::Value::as_str), Some("u1"));
        assert_eq!(value.get("firstName").and_then(serde_json::Value::as_str), Some("Jhon"));
        assert_eq!(
            value.get("dateOfBirth").and_then(serde_json::Value::as_str),
            Some("1990-04-07")
        );
        assert_eq!(
            value.pointer("/addresses/0/type").and_then(serde_json::Value::as_str),
            Some("Home")
        );
        assert_eq!(
            value.get("phones").and_then(serde_json::Value::as_array).map(Vec::len),
            Some(0)
        );

        let decoded: Record = serde_json::from_value(value).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(decoded, record);
    }

    #[test]
    fn calendar_date_rejects_malformed_values() {
        assert!(calendar_date::parse("1990-13-01").is_err());
        assert!(calendar_date::parse("1990/01/01").is_err());
        assert!(calendar_date::parse("").is_err());
    }

    #[test]
    fn header_validation_rejects_regressing_timestamps() {
        let mut parent = header("u1", "Jhon", "Victor");
        parent.updated_at = fixture_time() - time::Duration::seconds(1);
        assert!(matches!(parent.validate(), Err(DirectoryError::Validation(_))));
    }

    #[test]
    fn child_validation_requires_owner() {
        let orphan = address("a1", " ", "Home");
        assert!(matches!(orphan.validate(), Err(DirectoryError::Validation(_))));
        assert!(address("a2", "u1", "Office").validate().is_ok());
    }

    #[test]
    fn search_key_requires_both_name_fields() {
        assert!(SearchKey::new("Jhon", "").validate().is_err());
        assert!(SearchKey::new("  ", "Victor").validate().is_err());
        assert!(SearchKey::new("Jhon", "Victor").validate().is_ok());
    }

    #[test]
    fn search_key_optional_gender_narrows_matches() {
        let mut parent = header("u1", "Jhon", "Victor");
        parent.gender = Some("M".to_string());

        assert!(SearchKey::new("Jhon", "Victor").matches(&parent));
        assert!(SearchKey::new("Jhon", "Victor").with_gender("M").matches(&parent));
        assert!(!SearchKey::new("Jhon", "Victor").with_gender("F").matches(&parent));
        assert!(!SearchKey::new("John", "Victor").matches(&parent));
    }
}
