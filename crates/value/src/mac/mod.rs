/// Declares a setting which is read from an environment variable the first
/// time it is used.
///
/// A variable which is unset, or which does not parse as `$t`, leaves the
/// setting at `$default`. The `bytes` form accepts quantities with a size
/// suffix such as `64KiB`, and the `Option<String>` form yields `None` when
/// the variable is unset.
macro_rules! lazy_env_parse {
	// With a static expression for the default value, allowing for byte suffixes
	(bytes, $key:expr, $t:ty, $default:expr) => {
		std::sync::LazyLock::new(|| {
			std::env::var($key)
				.ok()
				.and_then(|s| {
					use $crate::str::ParseBytes;
					s.parse_bytes::<$t>().ok()
				})
				.unwrap_or($default)
		})
	};
	// With no default specified
	($key:expr, Option<String>) => {
		std::sync::LazyLock::new(|| std::env::var($key).ok())
	};
	// With a static expression for the default value
	($key:expr, $t:ty, $default:expr) => {
		std::sync::LazyLock::new(|| {
			std::env::var($key).ok().and_then(|s| s.parse::<$t>().ok()).unwrap_or($default)
		})
	};
}

/// Returns early with an unreachable logic error, recording where the
/// broken invariant was detected
macro_rules! fail {
	($($arg:tt)+) => {
		return Err($crate::err::Error::unreachable(format_args!(
			"{}:{}: {}",
			file!(),
			line!(),
			format_args!($($arg)+)
		)))
	};
}
