use std::sync::LazyLock;

/// The prefix given to every spill file created by the value containers.
pub const SPILL_FILE_PREFIX: &str = "av_spill_";

/// The attachment used to carry the key of an externalised scope parent
/// while an annotated value is on disk.
pub const PARENT_ATTACHMENT: &str = "~parent";

/// The size of the buffered reader and writer placed over each spill file (default: 64 KiB).
pub static SPILL_BUFFER_SIZE: LazyLock<usize> =
	lazy_env_parse!(bytes, "N1QL_SPILL_BUFFER_SIZE", usize, 64 * 1024);

/// The directory in which spill files are created. When not set the
/// system temporary directory is used.
pub static TEMPORARY_DIRECTORY: LazyLock<Option<String>> =
	lazy_env_parse!("N1QL_TEMPORARY_DIRECTORY", Option<String>);

/// The total number of bytes which spill files may occupy on disk at any
/// one time, across all containers sharing a temporary space (default: 0, unlimited).
pub static TEMPORARY_QUOTA: LazyLock<u64> =
	lazy_env_parse!(bytes, "N1QL_TEMPORARY_QUOTA", u64, 0);

/// The in-memory size after which the default spill predicate asks a
/// container to spill (default: 64 MiB).
pub static SPILL_MEMORY_THRESHOLD: LazyLock<u64> =
	lazy_env_parse!(bytes, "N1QL_SPILL_MEMORY_THRESHOLD", u64, 64 * 1024 * 1024);

/// The initial capacity of the in-memory map of a spill map.
pub static SPILL_MAP_INITIAL_CAPACITY: LazyLock<usize> =
	lazy_env_parse!("N1QL_SPILL_MAP_INITIAL_CAPACITY", usize, 1024);

/// The number of distinct scope parents a spill array keeps in memory
/// instead of writing them out with every item.
pub static SPILL_MAX_PARENTS: LazyLock<usize> =
	lazy_env_parse!("N1QL_SPILL_MAX_PARENTS", usize, 2000);

/// The number of released annotated value bodies a value pool retains for reuse.
pub static VALUE_POOL_CAPACITY: LazyLock<usize> =
	lazy_env_parse!("N1QL_VALUE_POOL_CAPACITY", usize, 1024);

/// The number of released value buffers a value pool retains for reuse.
pub static BUFFER_POOL_CAPACITY: LazyLock<usize> =
	lazy_env_parse!("N1QL_BUFFER_POOL_CAPACITY", usize, 64);
