use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::GatewayError;

pub const RECORDS_BY_NAME: &str = "recordsByName";
pub const RECORD_BY_ID: &str = "recordById";

const TEMPLATE_EXTENSION: &str = "graphql";

/// Named query bodies, fixed once constructed.
///
/// Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct QueryTemplateRegistry {
    templates: Arc<BTreeMap<String, String>>,
}

impl QueryTemplateRegistry {
    /// Templates for the two directory queries, compiled into the binary.
    #[must_use]
    pub fn builtin() -> Self {
        Self::from_entries([
            (RECORDS_BY_NAME, include_str!("../queries/recordsByName.graphql")),
            (RECORD_BY_ID, include_str!("../queries/recordById.graphql")),
        ])
    }

    #[must_use]
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let templates =
            entries.into_iter().map(|(name, text)| (name.into(), text.into())).collect();
        Self { templates: Arc::new(templates) }
    }

    /// Load every `*.graphql` file in `dir`, keyed by file stem.
    ///
    /// # Errors
    /// Returns an I/O error when the directory or one of its files cannot be read.
    pub fn from_dir(dir: &Path) -> io::Result<Self> {
        let mut templates = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(TEMPLATE_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            templates.insert(name.to_string(), fs::read_to_string(&path)?);
        }
        tracing::debug!(
            templates = templates.len(),
            dir = %dir.display(),
            "loaded query templates"
        );
        Ok(Self { templates: Arc::new(templates) })
    }

    /// # Errors
    /// Returns [`GatewayError::TemplateNotFound`] for an unregistered name.
    pub fn get(&self, name: &str) -> Result<&str, GatewayError> {
        self.templates
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| GatewayError::TemplateNotFound(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_templates_name_their_root_field() -> Result<(), GatewayError> {
        let registry = QueryTemplateRegistry::builtin();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec![RECORD_BY_ID, RECORDS_BY_NAME]);
        assert!(registry.get(RECORDS_BY_NAME)?.contains("recordsByName("));
        assert!(registry.get(RECORD_BY_ID)?.contains("recordById("));
        Ok(())
    }

    #[test]
    fn unknown_template_is_reported_by_name() {
        let registry = QueryTemplateRegistry::builtin();
        match registry.get("deleteEverything") {
            Err(GatewayError::TemplateNotFound(name)) => assert_eq!(name, "deleteEverything"),
            other => panic!("expected TemplateNotFound, got {other:?}"),
        }
    }

    #[test]
    fn from_dir_loads_only_graphql_files() -> io::Result<()> {
        let dir = std::env::temp_dir().join(format!("directory-templates-{}", ulid::Ulid::new()));
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("ping.graphql"), "{ ping }")?;
        fs::write(dir.join("notes.txt"), "ignored")?;

        let registry = QueryTemplateRegistry::from_dir(&dir)?;
        assert_eq!(registry.len(), 1);
        assert!(matches!(registry.get("ping"), Ok("{ ping }")));
        assert!(registry.get("notes").is_err());

        let _ = fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn clones_share_templates() {
        let registry = QueryTemplateRegistry::from_entries([("a", "{ a }")]);
        let clone = registry.clone();
        assert!(Arc::ptr_eq(&registry.templates, &clone.templates));
        assert!(!clone.is_empty());
    }
}
