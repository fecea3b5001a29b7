use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tempfile::{Builder, NamedTempFile};

use crate::cnf::{SPILL_FILE_PREFIX, TEMPORARY_DIRECTORY, TEMPORARY_QUOTA};
use crate::err::Error;

/// The temporary space in which spill files are created.
///
/// A single temporary space is typically shared by every container in a
/// process, so that the disk quota applies to all spill files together.
/// Containers create their files here, ask for admission once a file has
/// been written and its final size is known, and return the space when the
/// file is released.
#[derive(Debug)]
pub struct TempSpace {
	dir: Option<PathBuf>,
	/// The number of bytes which may be in use at once, or 0 for no limit
	quota: u64,
	used: AtomicU64,
}

impl TempSpace {
	/// Creates a temporary space in the given directory
	pub fn new(dir: impl Into<PathBuf>, quota: u64) -> Self {
		Self {
			dir: Some(dir.into()),
			quota,
			used: AtomicU64::new(0),
		}
	}

	/// Creates a temporary space in the system temporary directory
	pub fn system(quota: u64) -> Self {
		Self {
			dir: None,
			quota,
			used: AtomicU64::new(0),
		}
	}

	/// Creates a temporary space from the environment configuration
	pub fn from_env() -> Self {
		match TEMPORARY_DIRECTORY.as_deref() {
			Some(dir) => Self::new(dir, *TEMPORARY_QUOTA),
			None => Self::system(*TEMPORARY_QUOTA),
		}
	}

	/// The directory in which spill files are created
	pub fn dir(&self) -> PathBuf {
		match &self.dir {
			Some(dir) => dir.clone(),
			None => std::env::temp_dir(),
		}
	}

	pub fn quota(&self) -> u64 {
		self.quota
	}

	/// The number of bytes admitted and not yet released
	pub fn used(&self) -> u64 {
		self.used.load(Ordering::Acquire)
	}

	/// Creates a new, exclusively opened, spill file. The file is removed
	/// when it is dropped.
	pub fn create(&self) -> Result<NamedTempFile, Error> {
		let mut builder = Builder::new();
		builder.prefix(SPILL_FILE_PREFIX);
		let file = match &self.dir {
			Some(dir) => builder.tempfile_in(dir),
			None => builder.tempfile(),
		};
		file.map_err(Error::SpillCreate)
	}

	/// Asks for `size` bytes of the quota for the named file, returning
	/// whether they were granted
	pub fn reserve(&self, name: &Path, size: u64) -> bool {
		let granted = self
			.used
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
				let total = used.checked_add(size)?;
				(self.quota == 0 || total <= self.quota).then_some(total)
			})
			.is_ok();
		if !granted {
			warn!(
				"Temporary file quota of {} bytes exceeded by {} ({size} bytes, {} in use)",
				self.quota,
				name.display(),
				self.used()
			);
		}
		granted
	}

	/// Returns `size` bytes of the quota held by the named file
	pub fn release(&self, name: &Path, size: u64) {
		let result = self.used.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| used.checked_sub(size));
		if result.is_err() {
			error!("Releasing {size} bytes for {} which were never reserved", name.display());
			self.used.store(0, Ordering::Release);
		}
	}
}

impl Default for TempSpace {
	fn default() -> Self {
		Self::from_env()
	}
}

#[cfg(test)]
mod tests {
	use std::path::Path;

	use super::TempSpace;
	use crate::cnf::SPILL_FILE_PREFIX;

	#[test]
	fn files_are_created_in_the_directory() {
		let dir = tempfile::tempdir().unwrap();
		let temp = TempSpace::new(dir.path(), 0);
		let file = temp.create().unwrap();
		assert!(file.path().starts_with(dir.path()));
		let name = file.path().file_name().unwrap().to_string_lossy().into_owned();
		assert!(name.starts_with(SPILL_FILE_PREFIX));
		let path = file.path().to_path_buf();
		drop(file);
		assert!(!path.exists());
	}

	#[test]
	fn quota_is_enforced() {
		let temp = TempSpace::system(100);
		let name = Path::new("spill");
		assert!(temp.reserve(name, 60));
		assert!(!temp.reserve(name, 41));
		assert!(temp.reserve(name, 40));
		assert_eq!(temp.used(), 100);
		temp.release(name, 60);
		assert_eq!(temp.used(), 40);
		assert!(temp.reserve(name, 41));
	}

	#[test]
	fn zero_quota_is_unlimited() {
		let temp = TempSpace::system(0);
		assert!(temp.reserve(Path::new("spill"), u64::MAX / 2));
		assert_eq!(temp.used(), u64::MAX / 2);
	}

	#[test]
	fn missing_directory_fails_creation() {
		let temp = TempSpace::new("/nonexistent/n1ql/spill", 0);
		assert!(matches!(temp.create(), Err(crate::err::Error::SpillCreate(_))));
	}
}
