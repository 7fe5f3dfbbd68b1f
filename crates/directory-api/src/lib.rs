use std::path::PathBuf;

use anyhow::{anyhow, Result};
use directory_core::{DirectoryError, DirectoryService, Record, RecordId, SearchKey};
use directory_store_sqlite::{SchemaStatus, SeedRecord, SqliteStore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const API_CONTRACT_VERSION: &str = "api.v1";

pub const RECORDS_BY_NAME_FIELD: &str = "recordsByName";
pub const RECORD_BY_ID_FIELD: &str = "recordById";

/// Body of one query: the query text plus its variable bindings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// Tagged result of one query. `errors` is omitted when empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResponse {
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<QueryError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryError {
    pub message: String,
    pub extensions: ErrorExtensions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorExtensions {
    pub code: ErrorCode,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    BadRequest,
    Internal,
}

impl QueryResponse {
    #[must_use]
    pub fn success(field: &str, value: Value) -> Self {
        let mut data = Map::new();
        data.insert(field.to_string(), value);
        Self { data: Some(Value::Object(data)), errors: Vec::new() }
    }

    #[must_use]
    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            data: None,
            errors: vec![QueryError {
                message: message.into(),
                extensions: ErrorExtensions { code },
            }],
        }
    }
}

/// Operation selected by the first root field of a query document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    RecordsByName(SearchKey),
    RecordById(RecordId),
}

impl Operation {
    /// Resolve the query text and variables into one supported operation.
    ///
    /// Only the root field name is read; selection sets are not interpreted and
    /// the full record shape is always returned.
    ///
    /// # Errors
    /// Returns a message suitable for a `BAD_REQUEST` envelope when the text has
    /// no root field, the field is unknown, or a required variable is missing.
    pub fn resolve(query: &str, variables: &Map<String, Value>) -> Result<Self, String> {
        let field = root_field(query).ok_or_else(|| "query has no root field".to_string())?;
        match field {
            RECORDS_BY_NAME_FIELD => {
                let mut key = SearchKey::new(
                    required_string(variables, "firstName")?,
                    required_string(variables, "lastName")?,
                );
                key.gender = optional_string(variables, "gender")?;
                Ok(Self::RecordsByName(key))
            }
            RECORD_BY_ID_FIELD => {
                Ok(Self::RecordById(RecordId::new(required_string(variables, "id")?)))
            }
            other => Err(format!("unknown root field `{other}`")),
        }
    }

    #[must_use]
    pub fn field(&self) -> &'static str {
        match self {
            Self::RecordsByName(_) => RECORDS_BY_NAME_FIELD,
            Self::RecordById(_) => RECORD_BY_ID_FIELD,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryApi {
    db_path: PathBuf,
}

impl DirectoryApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = SqliteStore::open(&self.db_path)?;
        store.schema_status()
    }

    /// Load fixture records.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn seed(&self, seeds: &[SeedRecord]) -> Result<Vec<RecordId>> {
        let mut store = self.open_store()?;
        store.bulk_load(seeds)
    }

    /// Fetch one record with both collections.
    ///
    /// # Errors
    /// Returns an error wrapping [`DirectoryError::NotFound`] when the id is unknown.
    pub fn get_by_id(&self, id: &RecordId) -> Result<Record> {
        let store = self.open_store()?;
        Ok(DirectoryService::new(&store).get_by_id(id)?)
    }

    /// Fetch every record matching the key.
    ///
    /// # Errors
    /// Returns an error when the key is incomplete or the store fails.
    pub fn search(&self, key: &SearchKey) -> Result<Vec<Record>> {
        let store = self.open_store()?;
        Ok(DirectoryService::new(&store).search(key)?)
    }

    /// Run one query document and wrap the outcome in a response envelope.
    ///
    /// Failures never escape as `Err`; they become `errors` entries.
    #[must_use]
    pub fn execute(&self, request: &QueryRequest) -> QueryResponse {
        let operation = match Operation::resolve(&request.query, &request.variables) {
            Ok(operation) => operation,
            Err(message) => {
                tracing::debug!(%message, "rejected query document");
                return QueryResponse::failure(ErrorCode::BadRequest, message);
            }
        };

        let field = operation.field();
        let outcome = match operation {
            Operation::RecordsByName(key) => self.search(&key).and_then(to_value),
            Operation::RecordById(id) => self.get_by_id(&id).and_then(to_value),
        };

        match outcome {
            Ok(value) => QueryResponse::success(field, value),
            Err(err) => {
                let code = classify(&err);
                if code == ErrorCode::Internal {
                    tracing::error!(field, error = %format!("{err:#}"), "query execution failed");
                } else {
                    tracing::debug!(field, error = %err, "query returned an error entry");
                }
                QueryResponse::failure(code, err.to_string())
            }
        }
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|err| anyhow!("failed to serialize query result: {err}"))
}

fn classify(err: &anyhow::Error) -> ErrorCode {
    match err.downcast_ref::<DirectoryError>() {
        Some(DirectoryError::NotFound(_)) => ErrorCode::NotFound,
        Some(DirectoryError::Validation(_)) => ErrorCode::BadRequest,
        Some(DirectoryError::Store(_)) | None => ErrorCode::Internal,
    }
}

fn root_field(query: &str) -> Option<&str> {
    let body = &query[query.find('{')? + 1..];
    let body = body.trim_start();
    let end = body
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(body.len());
    let field = &body[..end];
    (!field.is_empty()).then_some(field)
}

fn required_string(variables: &Map<String, Value>, name: &str) -> Result<String, String> {
    optional_string(variables, name)?.ok_or_else(|| format!("variable `{name}` is required"))
}

fn optional_string(variables: &Map<String, Value>, name: &str) -> Result<Option<String>, String> {
    match variables.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(other) => Err(format!("variable `{name}` must be a string, got {other}")),
    }
}
