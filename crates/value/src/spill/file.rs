use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;

use crate::cnf::SPILL_BUFFER_SIZE;
use crate::err::Error;
use crate::spill::TempSpace;
use crate::spill::codec::{Decoder, Encoder, Spill};
use crate::val::ValuePool;

/// A single spill file, written once and then read back sequentially.
///
/// The head holds the record most recently decoded from the file, which is
/// the next candidate while merging several files together.
pub(crate) struct SpillFile<T> {
	file: NamedTempFile,
	writer: Option<Encoder<BufWriter<File>>>,
	reader: Option<Decoder<BufReader<File>>>,
	pub(crate) head: Option<T>,
	/// The size of the file once finished
	size: u64,
	/// Whether the size was admitted by the temporary space quota
	reserved: bool,
	read: Duration,
	write: Duration,
	temp: Arc<TempSpace>,
	pool: Arc<ValuePool>,
}

impl<T> SpillFile<T> {
	/// Creates an empty spill file ready for writing
	pub(crate) fn create(temp: &Arc<TempSpace>, pool: &Arc<ValuePool>) -> Result<Self, Error> {
		let file = temp.create()?;
		let handle = file.as_file().try_clone().map_err(Error::SpillCreate)?;
		Ok(Self {
			file,
			writer: Some(Encoder::new(BufWriter::with_capacity(*SPILL_BUFFER_SIZE, handle))),
			reader: None,
			head: None,
			size: 0,
			reserved: false,
			read: Duration::ZERO,
			write: Duration::ZERO,
			temp: temp.clone(),
			pool: pool.clone(),
		})
	}

	pub(crate) fn path(&self) -> &Path {
		self.file.path()
	}

	/// The size of the file on disk, once finished
	pub(crate) fn size(&self) -> u64 {
		self.size
	}

	pub(crate) fn read_time(&self) -> Duration {
		self.read
	}

	pub(crate) fn write_time(&self) -> Duration {
		self.write
	}

	/// Appends a record to the file
	pub(crate) fn write<V: Spill>(&mut self, value: &V) -> Result<(), Error> {
		let Some(writer) = self.writer.as_mut() else {
			fail!("Writing to a finished spill file");
		};
		let start = Instant::now();
		let res = writer.encode(value);
		self.write += start.elapsed();
		res
	}

	/// Flushes the written records, and asks the temporary space to admit
	/// the final size of the file
	pub(crate) fn finish(&mut self) -> Result<(), Error> {
		let Some(mut writer) = self.writer.take() else {
			fail!("Finishing a spill file twice");
		};
		let start = Instant::now();
		writer.flush()?;
		drop(writer);
		self.size = self.file.as_file_mut().seek(SeekFrom::End(0)).map_err(Error::SpillSize)?;
		self.write += start.elapsed();
		if !self.temp.reserve(self.file.path(), self.size) {
			return Err(Error::TempQuotaExceeded);
		}
		self.reserved = true;
		Ok(())
	}

	/// Positions the reader at the first record
	pub(crate) fn rewind(&mut self) -> Result<(), Error> {
		let mut handle = self.file.as_file().try_clone().map_err(Error::SpillRead)?;
		handle.seek(SeekFrom::Start(0)).map_err(Error::SpillRead)?;
		let reader = BufReader::with_capacity(*SPILL_BUFFER_SIZE, handle);
		self.reader = Some(Decoder::new(reader, Some(self.pool.clone())));
		self.head = None;
		Ok(())
	}

	/// Reads the next record, or `None` at the end of the file
	pub(crate) fn read<V: Spill>(&mut self) -> Result<Option<V>, Error> {
		let Some(reader) = self.reader.as_mut() else {
			fail!("Reading from a spill file which was not rewound");
		};
		let start = Instant::now();
		let res = reader.next();
		self.read += start.elapsed();
		res
	}

	/// Reads the next record, which must be present
	pub(crate) fn read_exact<V: Spill>(&mut self) -> Result<V, Error> {
		let Some(reader) = self.reader.as_mut() else {
			fail!("Reading from a spill file which was not rewound");
		};
		let start = Instant::now();
		let res = reader.decode();
		self.read += start.elapsed();
		res
	}
}

impl<T> Drop for SpillFile<T> {
	fn drop(&mut self) {
		if self.reserved {
			self.temp.release(self.file.path(), self.size);
		}
		debug!(
			"Removing spill file {} ({} bytes, R:{:?}, W:{:?})",
			self.file.path().display(),
			self.size,
			self.read,
			self.write
		);
	}
}
