//! Company → DDL schema resolution.

use crate::error::CoreError;

use log::{debug, warn};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// The DDL text the SQL generator is grounded on, for one company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaDescriptor {
    pub company_key: String,
    pub prefix: String,
    pub ddl: String,
}

/// Maps a normalized company name to its DDL file prefix.
pub trait CompanyDirectory: Send + Sync {
    /// `company` is already trimmed and lowercased.
    fn lookup_prefix(&self, company: &str) -> Result<Option<String>, CoreError>;

    /// Names this directory knows, lowercased. Used to spot companies in free text.
    fn known_companies(&self) -> Result<Vec<String>, CoreError>;
}

const BUILTIN_COMPANIES: &[(&str, &str)] = &[
    ("amazon", "amzn"),
    ("mcdonald's", "mcd"),
    ("meta", "meta"),
    ("coca-cola", "ko"),
    ("google", "goog"),
    ("alphabet", "goog"),
    ("s&p global", "spgi"),
    ("tesla", "tsla"),
    ("microsoft", "msft"),
    ("netflix", "nflx"),
    ("hsbc", "hsbc"),
    ("jpmorgan", "jpm"),
    ("shell", "shel"),
    ("att", "t"),
    ("verizon", "vz"),
    ("amd", "amd"),
    ("mastercard", "ma"),
    ("pepsico", "pep"),
];

/// A fixed lookup table.
#[derive(Debug, Clone)]
pub struct StaticDirectory {
    entries: Vec<(String, String)>,
}

impl StaticDirectory {
    /// The companies the bundled financial database covers.
    pub fn builtin() -> Self {
        Self::new(BUILTIN_COMPANIES.iter().map(|(c, p)| (c.to_string(), p.to_string())))
    }

    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(company, prefix)| (normalize(&company), prefix))
            .collect();
        Self { entries }
    }
}

impl CompanyDirectory for StaticDirectory {
    fn lookup_prefix(&self, company: &str) -> Result<Option<String>, CoreError> {
        Ok(self
            .entries
            .iter()
            .find(|(name, _)| name == company)
            .map(|(_, prefix)| prefix.clone()))
    }

    fn known_companies(&self) -> Result<Vec<String>, CoreError> {
        Ok(self.entries.iter().map(|(name, _)| name.clone()).collect())
    }
}

/// A mapping kept in a SQLite table `company_schema_map(company_name, ddl_prefix)`.
///
/// A connection is opened per lookup, read-only.
#[derive(Debug, Clone)]
pub struct SqliteDirectory {
    db_path: PathBuf,
}

impl SqliteDirectory {
    pub fn new(db_path: &Path) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
        }
    }

    fn get_conn(&self) -> Result<Connection, CoreError> {
        Connection::open_with_flags(&self.db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(Into::into)
    }

    /// Every `(company_name, ddl_prefix)` row, names normalized here rather than in SQL
    /// since SQLite's `lower()` only folds ASCII.
    fn entries(&self) -> Result<Vec<(String, String)>, CoreError> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT company_name, ddl_prefix FROM company_schema_map")?;
        let mut rows = stmt.query([])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            entries.push((normalize(&name), row.get(1)?));
        }
        Ok(entries)
    }
}

impl CompanyDirectory for SqliteDirectory {
    fn lookup_prefix(&self, company: &str) -> Result<Option<String>, CoreError> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|(name, _)| name == company)
            .map(|(_, prefix)| prefix))
    }

    fn known_companies(&self) -> Result<Vec<String>, CoreError> {
        let mut names: Vec<String> = self.entries()?.into_iter().map(|(name, _)| name).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

fn normalize(company: &str) -> String {
    company.trim().to_lowercase()
}

/// Resolves company identifiers to DDL descriptors. Reads the DDL file on every call.
pub struct SchemaResolver {
    directory: Box<dyn CompanyDirectory>,
    ddl_dir: PathBuf,
}

impl SchemaResolver {
    pub fn new(directory: Box<dyn CompanyDirectory>, ddl_dir: &Path) -> Self {
        Self {
            directory,
            ddl_dir: ddl_dir.to_path_buf(),
        }
    }

    pub fn ddl_path(&self, prefix: &str) -> PathBuf {
        self.ddl_dir.join(format!("{}_ddl.sql", prefix))
    }

    pub fn resolve(&self, company_key: &str) -> Result<SchemaDescriptor, CoreError> {
        let company = normalize(company_key);
        let prefix = self
            .directory
            .lookup_prefix(&company)?
            .ok_or_else(|| CoreError::CompanyNotRecognized(company_key.trim().to_string()))?;

        let path = self.ddl_path(&prefix);
        if !path.is_file() {
            warn!("No DDL file found for '{}' at {}", company, path.display());
            return Err(CoreError::SchemaFileMissing { prefix, path });
        }
        let ddl = fs::read_to_string(&path)?.trim().to_string();
        debug!("Loaded DDL for '{}' from {}", company, path.display());

        Ok(SchemaDescriptor {
            company_key: company,
            prefix,
            ddl,
        })
    }

    /// Finds a known company named in `text`. The longest matching name wins so
    /// that "s&p global" beats a shorter overlapping entry.
    pub fn detect_in_text(&self, text: &str) -> Result<Option<String>, CoreError> {
        let haystack = text.to_lowercase();
        let mut best: Option<String> = None;
        for name in self.directory.known_companies()? {
            if name.is_empty() || !contains_word(&haystack, &name) {
                continue;
            }
            if best.as_ref().map_or(true, |b| name.len() > b.len()) {
                best = Some(name);
            }
        }
        Ok(best)
    }
}

/// Substring match that refuses to match inside a longer word ("att" in "attention").
fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.map_or(false, char::is_alphanumeric) && !after.map_or(false, char::is_alphanumeric)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_whole_word_mentions_only() {
        assert!(contains_word("what was mcdonald's revenue?", "mcdonald's"));
        assert!(!contains_word("pay attention to margins", "att"));
        assert!(contains_word("att revenue", "att"));
    }

    #[test]
    fn builtin_table_is_case_insensitive_after_normalizing() {
        let dir = StaticDirectory::builtin();
        assert_eq!(dir.lookup_prefix(&normalize("  MCDONALD'S ")).unwrap().as_deref(), Some("mcd"));
        assert_eq!(dir.lookup_prefix(&normalize("Alphabet")).unwrap().as_deref(), Some("goog"));
        assert_eq!(dir.lookup_prefix("unknown corp").unwrap(), None);
    }

    fn sqlite_resolver(dir: &Path) -> SchemaResolver {
        let db_path = dir.join("company_map.db");
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE company_schema_map (company_name TEXT NOT NULL, ddl_prefix TEXT NOT NULL);
             INSERT INTO company_schema_map VALUES ('MCDONALD''S', 'mcd');
             INSERT INTO company_schema_map VALUES ('  NESTLÉ ', 'nesn');",
        )
        .unwrap();
        for prefix in ["mcd", "nesn"] {
            fs::write(dir.join(format!("{}_ddl.sql", prefix)), format!("-- {} ddl\n", prefix)).unwrap();
        }
        SchemaResolver::new(Box::new(SqliteDirectory::new(&db_path)), dir)
    }

    #[test]
    fn sqlite_directory_resolves_any_case() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = sqlite_resolver(dir.path());

        let mcd = resolver.resolve("McDonald's").unwrap();
        assert_eq!(mcd.prefix, "mcd");
        assert_eq!(mcd.company_key, "mcdonald's");
        assert_eq!(mcd.ddl, "-- mcd ddl");

        for spelling in ["NESTLÉ", "nestlé", " Nestlé "] {
            assert_eq!(resolver.resolve(spelling).unwrap().prefix, "nesn");
        }
    }

    #[test]
    fn sqlite_directory_rejects_unknown_names() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = sqlite_resolver(dir.path());
        match resolver.resolve("Unilever") {
            Err(CoreError::CompanyNotRecognized(name)) => assert_eq!(name, "Unilever"),
            other => panic!("expected CompanyNotRecognized, got {:?}", other),
        }
    }

    #[test]
    fn sqlite_directory_names_are_detected_in_text() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = sqlite_resolver(dir.path());
        assert_eq!(
            resolver.detect_in_text("What was Nestlé revenue?").unwrap().as_deref(),
            Some("nestlé")
        );
        assert_eq!(
            resolver.detect_in_text("How did MCDONALD'S do?").unwrap().as_deref(),
            Some("mcdonald's")
        );
        assert_eq!(resolver.detect_in_text("What about Unilever?").unwrap(), None);

        let directory = SqliteDirectory::new(&dir.path().join("company_map.db"));
        assert_eq!(
            directory.known_companies().unwrap(),
            vec!["mcdonald's".to_string(), "nestlé".to_string()]
        );
    }
}
