//! Operation requests and options.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::PlanningError;

/// The kind of bulk operation being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Copy,
    Move,
    Delete,
}

impl OperationKind {
    /// Whether this kind of operation writes to a destination.
    pub fn needs_destination(&self) -> bool {
        !matches!(self, Self::Delete)
    }

    /// Past-tense verb for summaries.
    pub fn past_tense(&self) -> &'static str {
        match self {
            Self::Copy => "Copied",
            Self::Move => "Moved",
            Self::Delete => "Deleted",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Copy => write!(f, "Copy"),
            Self::Move => write!(f, "Move"),
            Self::Delete => write!(f, "Delete"),
        }
    }
}

/// Flags that change how an operation treats conflicts, errors and volumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOptions {
    /// Replace existing destination items without asking.
    #[serde(default)]
    pub overwrite: bool,
    /// Skip items that fail with a permission-class error without asking.
    #[serde(default)]
    pub skip_permission_errors: bool,
    /// Turn a move across volumes into an explicit copy followed by deletes.
    #[serde(default)]
    pub do_not_cross_volumes: bool,
}

impl OperationOptions {
    pub const OVERWRITE: u32 = 0x1;
    pub const SKIP_PERMISSION_ERRORS: u32 = 0x2;
    pub const DO_NOT_CROSS_VOLUMES: u32 = 0x4;

    /// Build options from a legacy bit mask. Unknown bits are ignored.
    pub fn from_bits(bits: u32) -> Self {
        Self {
            overwrite: bits & Self::OVERWRITE != 0,
            skip_permission_errors: bits & Self::SKIP_PERMISSION_ERRORS != 0,
            do_not_cross_volumes: bits & Self::DO_NOT_CROSS_VOLUMES != 0,
        }
    }

    /// The legacy bit mask for these options.
    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.overwrite {
            bits |= Self::OVERWRITE;
        }
        if self.skip_permission_errors {
            bits |= Self::SKIP_PERMISSION_ERRORS;
        }
        if self.do_not_cross_volumes {
            bits |= Self::DO_NOT_CROSS_VOLUMES;
        }
        bits
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_skip_permission_errors(mut self, skip: bool) -> Self {
        self.skip_permission_errors = skip;
        self
    }

    pub fn with_do_not_cross_volumes(mut self, value: bool) -> Self {
        self.do_not_cross_volumes = value;
        self
    }
}

/// Where the sources of a request should end up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destinations {
    /// No destination (deletes).
    None,
    /// One full destination path per source, in the same order.
    Each(Vec<PathBuf>),
    /// A directory that receives every source under its own file name.
    Into(PathBuf),
}

impl Destinations {
    /// A single full destination path.
    pub fn single(path: impl Into<PathBuf>) -> Self {
        Self::Each(vec![path.into()])
    }
}

/// A submitted bulk operation. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    kind: OperationKind,
    sources: Vec<PathBuf>,
    destinations: Destinations,
    options: OperationOptions,
}

impl OperationRequest {
    /// Create a copy request.
    pub fn copy(sources: Vec<PathBuf>, destinations: Destinations, options: OperationOptions) -> Self {
        Self {
            kind: OperationKind::Copy,
            sources,
            destinations,
            options,
        }
    }

    /// Create a move request.
    pub fn move_to(
        sources: Vec<PathBuf>,
        destinations: Destinations,
        options: OperationOptions,
    ) -> Self {
        Self {
            kind: OperationKind::Move,
            sources,
            destinations,
            options,
        }
    }

    /// Create a delete request.
    pub fn delete(targets: Vec<PathBuf>, options: OperationOptions) -> Self {
        Self {
            kind: OperationKind::Delete,
            sources: targets,
            destinations: Destinations::None,
            options,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    pub fn destinations(&self) -> &Destinations {
        &self.destinations
    }

    pub fn options(&self) -> OperationOptions {
        self.options
    }

    /// Resolve the request into ordered (source, destination) pairs.
    ///
    /// Deletes always yield `None` destinations; copies and moves must yield
    /// exactly one destination per source.
    pub fn pairs(&self) -> Result<Vec<(PathBuf, Option<PathBuf>)>, PlanningError> {
        if !self.kind.needs_destination() {
            return Ok(self.sources.iter().map(|s| (s.clone(), None)).collect());
        }

        match &self.destinations {
            Destinations::None => Err(PlanningError::MissingDestination { kind: self.kind }),
            Destinations::Each(destinations) => {
                if destinations.len() != self.sources.len() {
                    return Err(PlanningError::DestinationCountMismatch {
                        sources: self.sources.len(),
                        destinations: destinations.len(),
                    });
                }
                Ok(self
                    .sources
                    .iter()
                    .cloned()
                    .zip(destinations.iter().cloned().map(Some))
                    .collect())
            }
            Destinations::Into(directory) => self
                .sources
                .iter()
                .map(|source| {
                    let name = file_name(source)?;
                    Ok((source.clone(), Some(directory.join(name))))
                })
                .collect(),
        }
    }
}

fn file_name(source: &Path) -> Result<&std::ffi::OsStr, PlanningError> {
    source.file_name().ok_or_else(|| PlanningError::InvalidSource {
        path: source.to_path_buf(),
    })
}
