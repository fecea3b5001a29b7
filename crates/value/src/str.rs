use std::num::ParseIntError;
use std::str::FromStr;

/// Parses human readable byte quantities such as `64KiB`, `2MB` or `512`.
///
/// Decimal suffixes (`KB`, `MB`, `GB`) use powers of 1000 and binary
/// suffixes (`KiB`, `MiB`, `GiB`) use powers of 1024. Suffixes are matched
/// case-insensitively and may be separated from the number by whitespace.
pub trait ParseBytes {
	fn parse_bytes<T>(&self) -> Result<T, ParseIntError>
	where
		T: FromStr<Err = ParseIntError> + TryFrom<u128>;
}

const UNITS: [(&str, u128); 7] = [
	("kib", 1 << 10),
	("mib", 1 << 20),
	("gib", 1 << 30),
	("kb", 1_000),
	("mb", 1_000_000),
	("gb", 1_000_000_000),
	("b", 1),
];

impl ParseBytes for str {
	fn parse_bytes<T>(&self) -> Result<T, ParseIntError>
	where
		T: FromStr<Err = ParseIntError> + TryFrom<u128>,
	{
		let lower = self.trim().to_ascii_lowercase();
		for (suffix, multiplier) in UNITS {
			if let Some(number) = lower.strip_suffix(suffix) {
				let number = number.trim_end().parse::<u128>()?;
				let bytes = number.saturating_mul(multiplier);
				// Out of range quantities are rejected by re-parsing the
				// decimal representation with the target type
				return match T::try_from(bytes) {
					Ok(v) => Ok(v),
					Err(_) => bytes.to_string().parse::<T>(),
				};
			}
		}
		lower.parse::<T>()
	}
}

impl ParseBytes for String {
	fn parse_bytes<T>(&self) -> Result<T, ParseIntError>
	where
		T: FromStr<Err = ParseIntError> + TryFrom<u128>,
	{
		self.as_str().parse_bytes()
	}
}
