use std::io::Error as IoError;

use thiserror::Error;

/// An error originating from the value layer.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
	/// The value layer encountered unreachable logic
	#[error("The value layer encountered unreachable logic: {0}")]
	Unreachable(String),

	/// A temporary file for spilling could not be created
	#[error("Unable to create a spill file: {0}")]
	SpillCreate(#[source] IoError),

	/// Values could not be written to a spill file
	#[error("Unable to write to a spill file: {0}")]
	SpillWrite(#[source] IoError),

	/// Values could not be read back from a spill file
	#[error("Unable to read from a spill file: {0}")]
	SpillRead(#[source] IoError),

	/// The final size of a spill file could not be determined
	#[error("Unable to determine the size of a spill file: {0}")]
	SpillSize(#[source] IoError),

	/// A spill record carried a valid tag but a malformed payload
	#[error("Unable to reconstruct a value from a spill file: {0}")]
	ValueReconstruct(String),

	/// A spill record carried an unknown tag, or a tag of the wrong kind
	#[error("Invalid spill record: found tag {found:#04x} where {expected} was expected")]
	ValueInvalid {
		found: u8,
		expected: &'static str,
	},

	/// The temporary file quota rejected a spill file
	#[error("Temporary file quota exceeded")]
	TempQuotaExceeded,

	/// A container was modified or iterated again after its iteration started
	#[error("The container is being iterated and can not be modified")]
	Frozen,
}

impl Error {
	/// Creates an error for broken internal invariants, with location details
	pub(crate) fn unreachable<T: std::fmt::Display>(message: T) -> Error {
		Error::Unreachable(message.to_string())
	}

	/// Creates an error for a malformed spill payload
	pub(crate) fn reconstruct<T: std::fmt::Display>(message: T) -> Error {
		Error::ValueReconstruct(message.to_string())
	}

	/// Whether the enclosing operation may recover from this error, for
	/// instance by surfacing a resource limit to the query instead of failing
	pub fn is_resource_limit(&self) -> bool {
		matches!(self, Error::TempQuotaExceeded)
	}
}

#[cfg(test)]
mod tests {
	use std::io::ErrorKind;

	use super::*;

	#[test]
	fn messages_are_descriptive() {
		let err = Error::ValueInvalid {
			found: 0x7f,
			expected: "an annotated value",
		};
		assert_eq!(
			err.to_string(),
			"Invalid spill record: found tag 0x7f where an annotated value was expected"
		);
		let err = Error::SpillRead(IoError::new(ErrorKind::UnexpectedEof, "early eof"));
		assert_eq!(err.to_string(), "Unable to read from a spill file: early eof");
	}

	#[test]
	fn quota_is_a_resource_limit() {
		assert!(Error::TempQuotaExceeded.is_resource_limit());
		assert!(!Error::Frozen.is_resource_limit());
	}

	#[test]
	fn errors_are_thread_safe() {
		fn assert_send_sync<T: Send + Sync + 'static>() {}
		assert_send_sync::<Error>();
	}
}
