//! Single-item transfer primitive.
//!
//! Everything above this module works on one planned item at a time and never
//! recurses; directories are created or removed individually.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use ferry_core::{ErrorReason, ItemKind, TransferError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What to do with a single item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    /// Duplicate the item at the destination. Directories are created empty.
    Copy,
    /// Relocate the item. Directories are created empty at the destination
    /// and the source directory is removed by a later task.
    Move,
    /// Remove the item. Directories must already be empty.
    Delete,
}

/// Performs one copy, move or delete of a single item.
///
/// Implementations must be safe to call from the blocking pool. Replacing a
/// file in place must be atomic: the destination either keeps its old content
/// or has the complete new content.
pub trait ItemTransfer: Send + Sync {
    /// Transfer one item and return the number of file bytes written.
    fn transfer_item(
        &self,
        source: &Path,
        destination: Option<&Path>,
        kind: TransferKind,
    ) -> Result<u64, TransferError>;

    /// Remove whatever occupies `path` so a replacement can be written.
    fn clear_destination(&self, path: &Path) -> Result<(), TransferError> {
        let metadata = fs::symlink_metadata(path)
            .map_err(|e| TransferError::from_io(path, &e, ErrorReason::NotWritable))?;
        let result = if metadata.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        result.map_err(|e| TransferError::from_io(path, &e, ErrorReason::NotWritable))
    }

    /// Kind of the item at `path`, or `None` when nothing is there.
    fn probe(&self, path: &Path) -> Option<ItemKind> {
        fs::symlink_metadata(path)
            .ok()
            .map(|metadata| ItemKind::from_file_type(&metadata.file_type()))
    }

    /// Identifier of the volume holding `path`, when it can be determined.
    fn volume_id(&self, path: &Path) -> Option<u64> {
        fs::metadata(path).ok().map(|metadata| get_dev(&metadata))
    }
}

/// [`ItemTransfer`] backed by `std::fs`.
#[derive(Debug, Clone, Copy)]
pub struct FsTransfer {
    sync_writes: bool,
}

impl FsTransfer {
    /// Create a transfer primitive. With `sync_writes`, copied files are
    /// flushed to disk before they are renamed into place.
    pub fn new(sync_writes: bool) -> Self {
        Self { sync_writes }
    }
}

impl Default for FsTransfer {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ItemTransfer for FsTransfer {
    fn transfer_item(
        &self,
        source: &Path,
        destination: Option<&Path>,
        kind: TransferKind,
    ) -> Result<u64, TransferError> {
        let metadata = fs::symlink_metadata(source)
            .map_err(|e| TransferError::from_io(source, &e, ErrorReason::NotReadable))?;
        let item = ItemKind::from_file_type(&metadata.file_type());

        match (kind, destination) {
            (TransferKind::Delete, _) => {
                if is_locked(&metadata) {
                    return Err(locked(source));
                }
                debug!(path = %source.display(), "Deleting item");
                let result = if item.is_dir() {
                    fs::remove_dir(source)
                } else {
                    fs::remove_file(source)
                };
                result
                    .map(|()| 0)
                    .map_err(|e| TransferError::from_io(source, &e, ErrorReason::NotDeletable))
            }
            (TransferKind::Copy, Some(destination)) => {
                self.copy_item(source, destination, item, &metadata)
            }
            (TransferKind::Move, Some(destination)) => {
                if is_locked(&metadata) {
                    return Err(locked(source));
                }
                self.move_item(source, destination, item, &metadata)
            }
            (_, None) => Err(TransferError::new(
                ErrorReason::Other,
                source,
                "no destination given",
            )),
        }
    }
}

impl FsTransfer {
    fn copy_item(
        &self,
        source: &Path,
        destination: &Path,
        item: ItemKind,
        metadata: &fs::Metadata,
    ) -> Result<u64, TransferError> {
        debug!(
            from = %source.display(),
            to = %destination.display(),
            kind = %item,
            "Copying item"
        );
        match item {
            ItemKind::Directory => fs::create_dir(destination)
                .map(|()| 0)
                .map_err(|e| TransferError::from_io(destination, &e, ErrorReason::NotWritable)),
            ItemKind::Symlink => copy_symlink(source, destination).map(|()| 0),
            ItemKind::File => self.copy_file(source, destination, metadata),
        }
    }

    fn move_item(
        &self,
        source: &Path,
        destination: &Path,
        item: ItemKind,
        metadata: &fs::Metadata,
    ) -> Result<u64, TransferError> {
        if item.is_dir() {
            // Children are moved by their own tasks; the emptied source is
            // removed afterwards.
            return fs::create_dir(destination)
                .map(|()| 0)
                .map_err(|e| TransferError::from_io(destination, &e, ErrorReason::NotWritable));
        }

        debug!(from = %source.display(), to = %destination.display(), "Moving item");
        match fs::rename(source, destination) {
            Ok(()) => Ok(if item == ItemKind::File { metadata.len() } else { 0 }),
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                let bytes = self.copy_item(source, destination, item, metadata)?;
                fs::remove_file(source)
                    .map_err(|e| TransferError::from_io(source, &e, ErrorReason::NotMovable))?;
                Ok(bytes)
            }
            Err(e) => Err(TransferError::from_io(source, &e, ErrorReason::NotMovable)),
        }
    }

    /// Copy file contents through a hidden sibling and rename it into place.
    fn copy_file(
        &self,
        source: &Path,
        destination: &Path,
        metadata: &fs::Metadata,
    ) -> Result<u64, TransferError> {
        let mut reader = File::open(source)
            .map_err(|e| TransferError::from_io(source, &e, ErrorReason::NotReadable))?;
        let partial = partial_path(destination);

        let result = self.write_partial(&mut reader, &partial, metadata).and_then(|bytes| {
            fs::rename(&partial, destination)
                .map(|()| bytes)
                .map_err(|e| TransferError::from_io(destination, &e, ErrorReason::NotWritable))
        });

        if result.is_err() {
            let _ = fs::remove_file(&partial);
        }
        result
    }

    fn write_partial(
        &self,
        reader: &mut File,
        partial: &Path,
        metadata: &fs::Metadata,
    ) -> Result<u64, TransferError> {
        let needed = metadata.len();
        let write_error =
            |e: io::Error| TransferError::from_io(partial, &e, ErrorReason::NotWritable).with_needed_space(needed);

        let mut writer = File::create(partial).map_err(write_error)?;
        let bytes = io::copy(reader, &mut writer).map_err(write_error)?;
        if self.sync_writes {
            writer.sync_all().map_err(write_error)?;
        }
        fs::set_permissions(partial, metadata.permissions()).map_err(write_error)?;
        Ok(bytes)
    }
}

/// Hidden sibling used while a file copy is in flight.
fn partial_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(".{name}.ferry-partial"))
}

#[cfg(unix)]
fn copy_symlink(source: &Path, destination: &Path) -> Result<(), TransferError> {
    let target = fs::read_link(source)
        .map_err(|e| TransferError::from_io(source, &e, ErrorReason::NotReadable))?;
    let partial = partial_path(destination);
    let result = std::os::unix::fs::symlink(&target, &partial)
        .and_then(|()| fs::rename(&partial, destination))
        .map_err(|e| TransferError::from_io(destination, &e, ErrorReason::NotWritable));
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, _destination: &Path) -> Result<(), TransferError> {
    Err(TransferError::new(
        ErrorReason::Other,
        source,
        "symbolic links are not supported on this platform",
    ))
}

fn locked(path: &Path) -> TransferError {
    TransferError::new(ErrorReason::Locked, path, "item is marked immutable")
}

/// Whether the item carries a user or system immutable flag.
#[cfg(target_os = "macos")]
fn is_locked(metadata: &fs::Metadata) -> bool {
    use std::os::macos::fs::MetadataExt;

    const UF_IMMUTABLE: u32 = 0x0000_0002;
    const SF_IMMUTABLE: u32 = 0x0002_0000;
    metadata.st_flags() & (UF_IMMUTABLE | SF_IMMUTABLE) != 0
}

#[cfg(not(target_os = "macos"))]
fn is_locked(_metadata: &fs::Metadata) -> bool {
    false
}

/// Get the device ID from metadata.
#[cfg(unix)]
fn get_dev(metadata: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.dev()
}

#[cfg(not(unix))]
fn get_dev(_metadata: &fs::Metadata) -> u64 {
    0
}
