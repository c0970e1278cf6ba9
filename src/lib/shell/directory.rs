use std::{
    env::{self, set_current_dir},
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("OLDPWD not set")]
    NoPreviousDir,
    #[error("HOME not set")]
    NoHomeDir,
    #[error("failed to query the current directory: {0}")]
    CurrentDir(#[source] io::Error),
    #[error("{dir}: {source}")]
    Change {
        dir:    String,
        #[source]
        source: io::Error,
    },
}

/// Remembers the directory the shell was in before its last successful `cd`.
#[derive(Debug, Default)]
pub struct DirectoryState {
    previous: Option<PathBuf>,
}

impl DirectoryState {
    pub fn new() -> Self { DirectoryState::default() }

    pub fn previous(&self) -> Option<&Path> { self.previous.as_deref() }

    /// Changes the working directory according to the `cd` argument: `None`
    /// goes home, `-` goes back to the previous directory, anything else is a
    /// path. Returns the directory that was entered.
    pub fn cd(&mut self, dir: Option<&str>) -> Result<PathBuf, DirectoryError> {
        let target = match dir {
            None => home_dir().ok_or(DirectoryError::NoHomeDir)?,
            Some("-") => self.previous.clone().ok_or(DirectoryError::NoPreviousDir)?,
            Some(dir) => PathBuf::from(dir),
        };

        let current = env::current_dir().map_err(DirectoryError::CurrentDir)?;
        if let Err(source) = set_current_dir(&target) {
            return Err(DirectoryError::Change { dir: target.display().to_string(), source });
        }
        self.previous = Some(current);
        Ok(target)
    }
}

#[cfg(all(unix, not(target_os = "redox")))]
fn home_dir() -> Option<PathBuf> {
    use users::os::unix::UserExt;
    env::var_os("HOME").filter(|home| !home.is_empty()).map(PathBuf::from).or_else(|| {
        users::get_user_by_uid(users::get_current_uid()).map(|user| user.home_dir().to_path_buf())
    })
}

#[cfg(not(all(unix, not(target_os = "redox"))))]
fn home_dir() -> Option<PathBuf> { env::var_os("HOME").map(PathBuf::from) }
