use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;

use crate::attributes::{FileCatalog, FileConfig};
use crate::error::{Error, Result};
use crate::resource::{RemoteFileConfig, ResourceSpec};
use crate::transport::TransportSettings;

/// A manifest file after `extends` and `imports` have been folded in.
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in path.split('.') {
            cur = cur.as_table()?.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::config(format!("failed to deserialize '{path}': {e}")))?;
        Ok(Some(parsed))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(&self.value)
            .map_err(|e| Error::msg(format!("failed to render {}: {e}", self.path.display())))
    }
}

/// Tables merge key by key. Arrays of tables (`[[remote_file]]`) append so
/// imported manifests contribute entries; any other value is replaced.
fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (Value::Array(base_arr), Value::Array(child_arr))
            if is_table_array(base_arr) && is_table_array(&child_arr) =>
        {
            base_arr.extend(child_arr);
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn is_table_array(arr: &[Value]) -> bool {
    arr.iter().all(Value::is_table)
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn parse_imports(path: &Path, table: &toml::value::Table) -> Result<Vec<String>> {
    let Some(raw) = table.get("imports") else {
        return Ok(Vec::new());
    };
    let Some(arr) = raw.as_array() else {
        return Err(Error::config(format!(
            "imports in {} must be an array of strings",
            path.display()
        )));
    };
    let mut out = Vec::new();
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(Error::config(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::config(format!(
            "manifest import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::io(format!("failed to read manifest {}", path.display()), e))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;
    let Some(tbl) = value.as_table_mut() else {
        return Err(Error::config(format!("{} is not a TOML table", path.display())));
    };

    let mut out = Value::Table(Default::default());
    if let Some(ext) = tbl.remove("extends") {
        let Some(ext) = ext.as_str() else {
            return Err(Error::config(format!(
                "extends in {} must be a string",
                path.display()
            )));
        };
        out = load_value_inner(&resolve_ref_path(path, ext), stack)?;
    }
    for imp in parse_imports(path, tbl)? {
        let loaded = load_value_inner(&resolve_ref_path(path, &imp), stack)?;
        merge_values(&mut out, loaded);
    }
    tbl.remove("imports");

    merge_values(&mut out, value);
    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    tracing::debug!(manifest = %path.display(), "manifest loaded");
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

/// Raw manifest contents.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Manifest {
    pub settings: TransportSettings,
    pub remote_file: Vec<RemoteFileConfig>,
    pub file: Vec<FileConfig>,
}

/// Validated manifest, ready for the executor.
#[derive(Debug)]
pub struct ResolvedManifest {
    pub settings: TransportSettings,
    pub resources: Vec<ResourceSpec>,
    pub catalog: Arc<FileCatalog>,
}

impl Manifest {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        Ok(doc.deserialize_path("")?.unwrap_or_default())
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn resolve(&self) -> Result<ResolvedManifest> {
        let catalog = FileCatalog::from_configs(&self.file)?;
        let mut seen = BTreeSet::new();
        let mut resources = Vec::with_capacity(self.remote_file.len());
        for (i, cfg) in self.remote_file.iter().enumerate() {
            let spec = cfg.validate().map_err(|e| match e {
                Error::InvalidConfiguration(m) => Error::config(format!("remote_file[{i}]: {m}")),
                other => other,
            })?;
            if !seen.insert(spec.path.clone()) {
                return Err(Error::config(format!(
                    "remote_file[{i}]: path {} is declared more than once",
                    spec.path.display()
                )));
            }
            resources.push(spec);
        }
        Ok(ResolvedManifest {
            settings: self.settings.clone(),
            resources,
            catalog: Arc::new(catalog),
        })
    }
}

pub fn load_manifest(path: &Path) -> Result<ResolvedManifest> {
    let doc = load(path)?;
    Manifest::from_doc(&doc)?.resolve()
}
