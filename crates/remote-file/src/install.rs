use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::timestamp;

#[cfg(unix)]
const NEW_FILE_MODE: u32 = 0o644;

/// Temporary file next to the destination that fetched bytes are written
/// into. Dropping it without [`Staging::commit`] removes it and leaves the
/// destination untouched.
pub struct Staging {
    file: NamedTempFile,
    dest: PathBuf,
}

impl Staging {
    pub fn create(dest: &Path) -> Result<Self> {
        let parent = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => {
                return Err(Error::config(format!(
                    "destination {} has no parent directory",
                    dest.display()
                )));
            }
        };
        let file_name = dest
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::config(format!("invalid destination path {}", dest.display())))?;
        let file = tempfile::Builder::new()
            .prefix(&format!(".{file_name}."))
            .suffix(".part")
            .tempfile_in(parent)
            .map_err(|e| {
                Error::io(
                    format!("failed to create staging file in {}", parent.display()),
                    e,
                )
            })?;
        tracing::debug!(staging = %file.path().display(), dest = %dest.display(), "staging file created");
        Ok(Self {
            file,
            dest: dest.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Flush, then move the staged bytes onto the destination. A permission
    /// error on the rename falls back to copying over the destination.
    pub fn commit(mut self, remote_mtime: Option<DateTime<Utc>>) -> Result<()> {
        let staged = self.file.path().to_path_buf();
        self.file
            .flush()
            .and_then(|_| self.file.as_file().sync_all())
            .map_err(|e| Error::io(format!("failed to flush {}", staged.display()), e))?;
        carry_permissions(&self.dest, &staged)?;

        match self.file.persist(&self.dest) {
            Ok(_) => {}
            Err(err) if err.error.kind() == io::ErrorKind::PermissionDenied => {
                tracing::debug!(
                    dest = %self.dest.display(),
                    "rename not permitted, falling back to copy"
                );
                // `err.file` still owns the staging file and deletes it on drop.
                let staged_file = err.file;
                fs::copy(staged_file.path(), &self.dest).map_err(|e| {
                    Error::io(
                        format!(
                            "failed to copy {} -> {}",
                            staged_file.path().display(),
                            self.dest.display()
                        ),
                        e,
                    )
                })?;
            }
            Err(err) => {
                return Err(Error::io(
                    format!(
                        "failed to rename {} -> {}",
                        staged.display(),
                        self.dest.display()
                    ),
                    err.error,
                ));
            }
        }

        if let Some(t) = remote_mtime {
            timestamp::set_file_times(&self.dest, t)?;
        }
        Ok(())
    }
}

impl Write for Staging {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(unix)]
fn carry_permissions(dest: &Path, staged: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let perms = match fs::metadata(dest) {
        Ok(m) => m.permissions(),
        Err(_) => fs::Permissions::from_mode(NEW_FILE_MODE),
    };
    fs::set_permissions(staged, perms)
        .map_err(|e| Error::io(format!("failed to set permissions on {}", staged.display()), e))
}

#[cfg(not(unix))]
fn carry_permissions(_dest: &Path, _staged: &Path) -> Result<()> {
    Ok(())
}

/// Stage `write_body`'s output and install it at `dest`.
pub fn install_with<T, F>(dest: &Path, write_body: F) -> Result<(T, Option<DateTime<Utc>>)>
where
    F: FnOnce(&mut Staging) -> Result<(T, Option<DateTime<Utc>>)>,
{
    let mut staging = Staging::create(dest)?;
    let (value, mtime) = write_body(&mut staging)?;
    staging.commit(mtime)?;
    Ok((value, mtime))
}
