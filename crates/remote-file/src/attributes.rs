use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::resource::trimmed;

/// Ownership and mode a caller wants on a path. The reconciler never
/// applies these itself; it hands them to an [`AttributeCatalog`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: Option<u32>,
}

impl FileAttributes {
    pub fn is_empty(&self) -> bool {
        self.owner.is_none() && self.group.is_none() && self.mode.is_none()
    }

    /// Octal permission bits, e.g. "0644" or "755".
    pub fn parse_mode(raw: &str) -> Result<u32> {
        let s = raw.trim();
        let digits = s.strip_prefix("0o").unwrap_or(s);
        if digits.is_empty() || digits.len() > 4 {
            return Err(Error::config(format!("invalid mode '{raw}'")));
        }
        u32::from_str_radix(digits, 8)
            .ok()
            .filter(|m| *m <= 0o7777)
            .ok_or_else(|| Error::config(format!("invalid mode '{raw}' (expected octal)")))
    }

    // Fields set on both sides must agree; unset fields are filled in.
    fn merge(&self, other: &FileAttributes) -> Option<FileAttributes> {
        fn pick<T: Clone + PartialEq>(a: &Option<T>, b: &Option<T>) -> Option<Option<T>> {
            match (a, b) {
                (Some(x), Some(y)) if x != y => None,
                _ => Some(a.clone().or_else(|| b.clone())),
            }
        }
        Some(FileAttributes {
            owner: pick(&self.owner, &other.owner)?,
            group: pick(&self.group, &other.group)?,
            mode: pick(&self.mode, &other.mode)?,
        })
    }
}

impl fmt::Display for FileAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(o) = &self.owner {
            parts.push(format!("owner={o}"));
        }
        if let Some(g) = &self.group {
            parts.push(format!("group={g}"));
        }
        if let Some(m) = self.mode {
            parts.push(format!("mode={m:04o}"));
        }
        if parts.is_empty() {
            f.write_str("{}")
        } else {
            write!(f, "{{{}}}", parts.join(", "))
        }
    }
}

/// `[[file]]` manifest entry: attributes some other part of the
/// configuration already manages.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub path: String,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: Option<String>,
}

impl FileConfig {
    pub fn attributes(&self) -> Result<FileAttributes> {
        Ok(FileAttributes {
            owner: trimmed(self.owner.as_deref()),
            group: trimmed(self.group.as_deref()),
            mode: self
                .mode
                .as_deref()
                .map(FileAttributes::parse_mode)
                .transpose()?,
        })
    }
}

/// The collaborator that owns plain-file attribute enforcement.
pub trait AttributeCatalog: Send + Sync {
    /// Ask the catalog to manage `path` with `attrs`. Returns
    /// [`Error::AttributeConflict`] when the path is already managed with
    /// different values.
    fn request_file(&self, path: &Path, attrs: &FileAttributes) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct FileCatalog {
    entries: Mutex<BTreeMap<PathBuf, FileAttributes>>,
}

impl FileCatalog {
    pub fn from_configs(files: &[FileConfig]) -> Result<Self> {
        let catalog = Self::default();
        for f in files {
            let path = PathBuf::from(f.path.trim());
            if !path.is_absolute() {
                return Err(Error::config(format!(
                    "file path '{}' must be absolute",
                    f.path
                )));
            }
            catalog.request_file(&path, &f.attributes()?)?;
        }
        Ok(catalog)
    }

    pub fn get(&self, path: &Path) -> Option<FileAttributes> {
        self.entries.lock().ok()?.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|g| g.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AttributeCatalog for FileCatalog {
    fn request_file(&self, path: &Path, attrs: &FileAttributes) -> Result<()> {
        if attrs.is_empty() {
            return Ok(());
        }
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::msg("file catalog lock poisoned"))?;
        match entries.get(path) {
            None => {
                entries.insert(path.to_path_buf(), attrs.clone());
                Ok(())
            }
            Some(existing) => {
                let Some(merged) = existing.merge(attrs) else {
                    return Err(Error::AttributeConflict {
                        path: path.to_path_buf(),
                        existing: existing.to_string(),
                        requested: attrs.to_string(),
                    });
                };
                entries.insert(path.to_path_buf(), merged);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(owner: Option<&str>, mode: Option<u32>) -> FileAttributes {
        FileAttributes {
            owner: owner.map(str::to_string),
            group: None,
            mode,
        }
    }

    #[test]
    fn parse_mode_accepts_octal_forms() {
        assert_eq!(FileAttributes::parse_mode("0644").unwrap(), 0o644);
        assert_eq!(FileAttributes::parse_mode("755").unwrap(), 0o755);
        assert_eq!(FileAttributes::parse_mode("0o600").unwrap(), 0o600);
        assert!(FileAttributes::parse_mode("0999").is_err());
        assert!(FileAttributes::parse_mode("rwxr-xr-x").is_err());
    }

    #[test]
    fn compatible_requests_merge() {
        let cat = FileCatalog::default();
        let p = Path::new("/opt/a");
        cat.request_file(p, &attrs(Some("root"), None)).unwrap();
        cat.request_file(p, &attrs(None, Some(0o644))).unwrap();
        assert_eq!(cat.get(p), Some(attrs(Some("root"), Some(0o644))));
    }

    #[test]
    fn conflicting_request_is_fatal() {
        let cat = FileCatalog::default();
        let p = Path::new("/opt/a");
        cat.request_file(p, &attrs(None, Some(0o644))).unwrap();
        let err = cat.request_file(p, &attrs(None, Some(0o600))).unwrap_err();
        match err {
            Error::AttributeConflict {
                existing,
                requested,
                ..
            } => {
                assert_eq!(existing, "{mode=0644}");
                assert_eq!(requested, "{mode=0600}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(cat.get(p), Some(attrs(None, Some(0o644))));
    }

    #[test]
    fn declared_owner_is_trimmed_like_remote_entries() {
        let declared = FileConfig {
            path: "/opt/a".into(),
            owner: Some(" root ".into()),
            group: Some("  ".into()),
            mode: None,
        };
        let cat = FileCatalog::default();
        let p = Path::new("/opt/a");
        cat.request_file(p, &declared.attributes().unwrap()).unwrap();
        cat.request_file(p, &attrs(Some("root"), None)).unwrap();
        assert_eq!(cat.get(p), Some(attrs(Some("root"), None)));
    }

    #[test]
    fn empty_request_is_ignored() {
        let cat = FileCatalog::default();
        cat.request_file(Path::new("/opt/a"), &FileAttributes::default())
            .unwrap();
        assert!(cat.is_empty());
    }

    #[test]
    fn declared_files_must_be_absolute() {
        let err = FileCatalog::from_configs(&[FileConfig {
            path: "relative".into(),
            ..FileConfig::default()
        }])
        .unwrap_err();
        assert!(err.to_string().contains("must be absolute"));
    }
}
