use std::collections::HashSet;
use std::path::Path;
use std::{fs, io};
use thiserror::Error;
use tracing::{info, trace};

#[derive(Error, Debug)]
pub enum AllowListError {
    #[error("failed to read allow list {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Optional set of class names that may be counted.
///
/// `AllowList::all()` lets every class through; a parsed list, even an empty
/// one, only lets through the names it contains.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllowList {
    names: Option<HashSet<String>>,
}

impl AllowList {
    pub fn all() -> Self {
        Self { names: None }
    }

    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: Some(names.into_iter().map(Into::into).collect()),
        }
    }

    /// One class per line; blank lines and `#` comments are ignored.
    pub fn parse(text: &str) -> Self {
        Self::only(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#')),
        )
    }

    /// Loads the list from `path`. A missing file means "allow everything".
    pub fn load(path: &Path) -> Result<Self, AllowListError> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let list = Self::parse(&text);
                info!(path = %path.display(), allowed = list.len(), "loaded allow list");
                Ok(list)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "allow list not found, counting every class");
                Ok(Self::all())
            }
            Err(source) => Err(AllowListError::Read {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    pub fn allows(&self, class: &str) -> bool {
        match &self.names {
            Some(names) => {
                let allowed = names.contains(class);
                if !allowed {
                    trace!(class, "class filtered by allow list");
                }
                allowed
            }
            None => true,
        }
    }

    /// Number of allowed names; zero for an unrestricted list.
    pub fn len(&self) -> usize {
        self.names.as_ref().map_or(0, HashSet::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
