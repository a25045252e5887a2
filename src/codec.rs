//! Serialization codec (component K): a fixed-width, big-endian,
//! signature-driven encoder/decoder.
//!
//! The signature grammar is the original `siy`/`mae` grammar (`u1 u2 u4 u8`,
//! `i1 i2 i4 i8`, `f`, `v<type>`, `(<fields>)`, whitespace ignored between
//! tokens), but the wire encoding of each integer follows `romp`'s
//! fixed-width big-endian packing rather than `siy`'s tagged variable-length
//! scheme — this crate's RPC channel needs byte-exact compatibility with the
//! `nero`/`romp` wire format, not `siy`'s own encoding. See `DESIGN.md`.
//!
//! A signature is a flat list of top-level fields (what the original passes
//! as a C varargs list); a single value used as the whole argument list of a
//! one-field signature must still be wrapped in a one-element tuple, e.g.
//! `(v,)`. A `(...)` signature nested *inside* another signature is a single
//! struct-typed value instead, e.g. a vector element.

use crate::error::{Error, Result};

/// A parsed signature node. A full top-level signature is `Vec<Sig>`, one
/// entry per field; `Sig::Struct` only appears nested, for `(...)` groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sig {
	U(u8),
	I(u8),
	F,
	Vec(Box<Sig>),
	Struct(Vec<Sig>)
}

impl Sig {
	/// Size in bytes of one value of this shape, not counting a vector's
	/// variable-length payload (only its 4-byte length prefix is static).
	#[must_use]
	pub fn size(&self) -> usize {
		match self {
			Self::U(width) | Self::I(width) => usize::from(*width),
			Self::F => 8,
			Self::Vec(_) => 4,
			Self::Struct(fields) => fields.iter().map(Sig::size).sum()
		}
	}
}

/// A decoded or to-be-encoded value, shaped to match some [`Sig`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
	U(u64),
	I(i64),
	F(f64),
	Vec(Vec<Value>),
	Struct(Vec<Value>)
}

/// Parses a top-level signature string into its flat field list.
///
/// # Errors
/// Returns [`Error::SignSyntax`] if the string isn't a well-formed
/// signature.
pub fn parse_signature(sig: &str) -> Result<Vec<Sig>> {
	let mut chars = sig.chars().peekable();
	let fields = parse_fields(&mut chars, None)?;

	Ok(fields)
}

fn skip_ws(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
	while chars.peek().is_some_and(|c| c.is_whitespace()) {
		chars.next();
	}
}

fn parse_fields(
	chars: &mut std::iter::Peekable<std::str::Chars<'_>>, end: Option<char>
) -> Result<Vec<Sig>> {
	let mut fields = Vec::new();

	loop {
		skip_ws(chars);

		match (chars.peek().copied(), end) {
			(Some(c), Some(e)) if c == e => {
				chars.next();
				break;
			}
			(None, None) => break,
			(None, Some(_)) => return Err(Error::sign_syntax("unterminated '('")),
			_ => fields.push(parse_one(chars)?)
		}
	}

	Ok(fields)
}

fn parse_one(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<Sig> {
	skip_ws(chars);

	match chars.next() {
		Some('u') => Ok(Sig::U(parse_width(chars)?)),
		Some('i') => Ok(Sig::I(parse_width(chars)?)),
		Some('f') => Ok(Sig::F),
		Some('v') => Ok(Sig::Vec(Box::new(parse_one(chars)?))),
		Some('(') => Ok(Sig::Struct(parse_fields(chars, Some(')'))?)),
		Some(c) => Err(Error::sign_syntax(format!("unexpected character '{c}'"))),
		None => Err(Error::sign_syntax("unexpected end of signature"))
	}
}

fn parse_width(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<u8> {
	match chars.next() {
		Some(c @ ('1' | '2' | '4' | '8')) => {
			#[allow(clippy::unwrap_used)]
			Ok(c.to_digit(10).unwrap() as u8)
		}
		Some(c) => Err(Error::sign_syntax(format!("invalid integer width '{c}'"))),
		None => Err(Error::sign_syntax("missing integer width"))
	}
}

/// Encodes `value` according to `sig`, appending to `out`.
///
/// # Errors
/// Returns [`Error::SignSyntax`] if `value`'s shape doesn't match `sig`, or
/// [`Error::Overflow`] if a vector is too long to fit its 4-byte length
/// prefix.
pub fn encode_value(sig: &Sig, value: &Value, out: &mut Vec<u8>) -> Result<()> {
	match (sig, value) {
		(Sig::U(width), Value::U(v)) => {
			encode_uint(*v, *width, out);
			Ok(())
		}
		(Sig::I(width), Value::I(v)) => {
			#[allow(clippy::cast_sign_loss)]
			encode_uint(*v as u64, *width, out);
			Ok(())
		}
		(Sig::F, Value::F(v)) => {
			out.extend_from_slice(&v.to_bits().to_be_bytes());
			Ok(())
		}
		(Sig::Vec(elem), Value::Vec(items)) => {
			let len = u32::try_from(items.len()).map_err(|_| Error::Overflow)?;

			out.extend_from_slice(&len.to_be_bytes());

			for item in items {
				encode_value(elem, item, out)?;
			}

			Ok(())
		}
		(Sig::Struct(fields), Value::Struct(items)) if fields.len() == items.len() => {
			for (field, item) in fields.iter().zip(items) {
				encode_value(field, item, out)?;
			}

			Ok(())
		}
		_ => Err(Error::sign_syntax("value shape does not match signature"))
	}
}

fn encode_uint(v: u64, width: u8, out: &mut Vec<u8>) {
	let bytes = v.to_be_bytes();

	out.extend_from_slice(&bytes[8 - usize::from(width)..]);
}

/// Decodes one value shaped like `sig` from the front of `input`, advancing
/// it past the consumed bytes.
///
/// # Errors
/// Returns [`Error::Truncated`] if `input` ends before `sig` is fully
/// decoded.
pub fn decode_value(sig: &Sig, input: &mut &[u8]) -> Result<Value> {
	match sig {
		Sig::U(width) => Ok(Value::U(decode_uint(input, *width)?)),
		Sig::I(width) => {
			let bits = decode_uint(input, *width)?;
			let shift = 64 - 8 * u32::from(*width);

			#[allow(clippy::cast_possible_wrap)]
			Ok(Value::I(((bits << shift) as i64) >> shift))
		}
		Sig::F => {
			let bits = decode_uint(input, 8)?;

			Ok(Value::F(f64::from_bits(bits)))
		}
		Sig::Vec(elem) => {
			let len = decode_uint(input, 4)?;
			let mut items = Vec::new();

			for _ in 0..len {
				items.push(decode_value(elem, input)?);
			}

			Ok(Value::Vec(items))
		}
		Sig::Struct(fields) => {
			let mut items = Vec::with_capacity(fields.len());

			for field in fields {
				items.push(decode_value(field, input)?);
			}

			Ok(Value::Struct(items))
		}
	}
}

fn decode_uint(input: &mut &[u8], width: u8) -> Result<u64> {
	let width = usize::from(width);

	if input.len() < width {
		return Err(Error::Truncated);
	}

	let mut buf = [0u8; 8];

	buf[8 - width..].copy_from_slice(&input[..width]);
	*input = &input[width..];

	Ok(u64::from_be_bytes(buf))
}

/// A Rust type that maps to a single [`Value`] node: a struct field, a
/// vector element, or (via [`EncodeTuple`]/[`DecodeTuple`]) one argument.
pub trait Encode {
	fn to_value(&self) -> Value;
}

/// The decoding counterpart of [`Encode`].
pub trait Decode: Sized {
	/// # Errors
	/// Returns [`Error::SignSyntax`] if `value`'s shape doesn't match `Self`.
	fn from_value(value: Value) -> Result<Self>;
}

macro_rules! impl_uint {
	($($t:ty),*) => {$(
		impl Encode for $t {
			fn to_value(&self) -> Value { Value::U(u64::from(*self)) }
		}
		impl Decode for $t {
			fn from_value(value: Value) -> Result<Self> {
				match value {
					Value::U(v) => <$t>::try_from(v).map_err(|_| Error::Overflow),
					_ => Err(Error::sign_syntax("expected an unsigned integer"))
				}
			}
		}
	)*};
}

macro_rules! impl_uint_widest {
	($t:ty) => {
		impl Encode for $t {
			fn to_value(&self) -> Value {
				Value::U(*self)
			}
		}
		impl Decode for $t {
			fn from_value(value: Value) -> Result<Self> {
				match value {
					Value::U(v) => Ok(v),
					_ => Err(Error::sign_syntax("expected an unsigned integer"))
				}
			}
		}
	};
}

macro_rules! impl_int {
	($($t:ty),*) => {$(
		impl Encode for $t {
			fn to_value(&self) -> Value { Value::I(i64::from(*self)) }
		}
		impl Decode for $t {
			fn from_value(value: Value) -> Result<Self> {
				match value {
					Value::I(v) => <$t>::try_from(v).map_err(|_| Error::Overflow),
					_ => Err(Error::sign_syntax("expected a signed integer"))
				}
			}
		}
	)*};
}

macro_rules! impl_int_widest {
	($t:ty) => {
		impl Encode for $t {
			fn to_value(&self) -> Value {
				Value::I(*self)
			}
		}
		impl Decode for $t {
			fn from_value(value: Value) -> Result<Self> {
				match value {
					Value::I(v) => Ok(v),
					_ => Err(Error::sign_syntax("expected a signed integer"))
				}
			}
		}
	};
}

impl_uint!(u8, u16, u32);
impl_uint_widest!(u64);
impl_int!(i8, i16, i32);
impl_int_widest!(i64);

impl Encode for f64 {
	fn to_value(&self) -> Value {
		Value::F(*self)
	}
}

impl Decode for f64 {
	fn from_value(value: Value) -> Result<Self> {
		match value {
			Value::F(v) => Ok(v),
			_ => Err(Error::sign_syntax("expected a float"))
		}
	}
}

impl<T: Encode> Encode for Vec<T> {
	fn to_value(&self) -> Value {
		Value::Vec(self.iter().map(Encode::to_value).collect())
	}
}

impl<T: Decode> Decode for Vec<T> {
	fn from_value(value: Value) -> Result<Self> {
		match value {
			Value::Vec(items) => items.into_iter().map(T::from_value).collect(),
			_ => Err(Error::sign_syntax("expected a vector"))
		}
	}
}

macro_rules! impl_tuple_struct {
	($($idx:tt $t:ident),+) => {
		impl<$($t: Encode),+> Encode for ($($t,)+) {
			fn to_value(&self) -> Value {
				Value::Struct(vec![$(self.$idx.to_value()),+])
			}
		}

		impl<$($t: Decode),+> Decode for ($($t,)+) {
			fn from_value(value: Value) -> Result<Self> {
				match value {
					Value::Struct(items) => {
						let mut it = items.into_iter();
						$(
							let $t = $t::from_value(
								it.next().ok_or_else(|| Error::sign_syntax("struct field count mismatch"))?
							)?;
						)+
						Ok(($($t,)+))
					}
					_ => Err(Error::sign_syntax("expected a struct"))
				}
			}
		}
	};
}

impl_tuple_struct!(0 A);
impl_tuple_struct!(0 A, 1 B);
impl_tuple_struct!(0 A, 1 B, 2 C);
impl_tuple_struct!(0 A, 1 B, 2 C, 3 D);

/// Maps a Rust value to the flat list of top-level fields a signature
/// describes — the RPC argument-list convention, distinct from [`Encode`]'s
/// single-node mapping used inside vectors and nested structs.
pub trait EncodeTuple {
	fn to_values(&self) -> Vec<Value>;
}

/// The decoding counterpart of [`EncodeTuple`].
pub trait DecodeTuple: Sized {
	/// # Errors
	/// Returns [`Error::SignSyntax`] if the field count or shapes don't
	/// match `Self`.
	fn from_values(values: Vec<Value>) -> Result<Self>;
}

macro_rules! impl_args_single {
	($($t:ty),*) => {$(
		impl EncodeTuple for $t {
			fn to_values(&self) -> Vec<Value> { vec![Encode::to_value(self)] }
		}
		impl DecodeTuple for $t {
			fn from_values(mut values: Vec<Value>) -> Result<Self> {
				if values.len() != 1 {
					return Err(Error::sign_syntax("argument count mismatch"));
				}
				#[allow(clippy::unwrap_used)]
				<$t as Decode>::from_value(values.pop().unwrap())
			}
		}
	)*};
}

impl_args_single!(u8, u16, u32, u64, i8, i16, i32, i64, f64);

impl<T: Encode> EncodeTuple for Vec<T> {
	fn to_values(&self) -> Vec<Value> {
		vec![Encode::to_value(self)]
	}
}

impl<T: Decode> DecodeTuple for Vec<T> {
	fn from_values(mut values: Vec<Value>) -> Result<Self> {
		if values.len() != 1 {
			return Err(Error::sign_syntax("argument count mismatch"));
		}

		#[allow(clippy::unwrap_used)]
		Decode::from_value(values.pop().unwrap())
	}
}

impl EncodeTuple for () {
	fn to_values(&self) -> Vec<Value> {
		Vec::new()
	}
}

impl DecodeTuple for () {
	fn from_values(values: Vec<Value>) -> Result<Self> {
		if values.is_empty() {
			Ok(())
		} else {
			Err(Error::sign_syntax("argument count mismatch"))
		}
	}
}

macro_rules! impl_args_tuple {
	($($idx:tt $t:ident),+) => {
		impl<$($t: Encode),+> EncodeTuple for ($($t,)+) {
			fn to_values(&self) -> Vec<Value> {
				vec![$(self.$idx.to_value()),+]
			}
		}

		impl<$($t: Decode),+> DecodeTuple for ($($t,)+) {
			fn from_values(values: Vec<Value>) -> Result<Self> {
				let expected = [$(stringify!($t)),+].len();
				if values.len() != expected {
					return Err(Error::sign_syntax("argument count mismatch"));
				}
				let mut it = values.into_iter();
				$(
					let $t = $t::from_value(
						it.next().ok_or_else(|| Error::sign_syntax("argument count mismatch"))?
					)?;
				)+
				Ok(($($t,)+))
			}
		}
	};
}

impl_args_tuple!(0 A);
impl_args_tuple!(0 A, 1 B);
impl_args_tuple!(0 A, 1 B, 2 C);
impl_args_tuple!(0 A, 1 B, 2 C, 3 D);

/// Encodes `value` as `sig`'s wire bytes.
///
/// # Errors
/// See [`encode_value`] and [`parse_signature`].
pub fn encode<T: EncodeTuple>(sig: &str, value: &T) -> Result<Vec<u8>> {
	let fields = parse_signature(sig)?;
	let values = value.to_values();

	if fields.len() != values.len() {
		return Err(Error::sign_syntax("argument count does not match signature"));
	}

	let mut out = Vec::new();

	for (field, value) in fields.iter().zip(values.iter()) {
		encode_value(field, value, &mut out)?;
	}

	Ok(out)
}

/// Decodes `input` as `sig`'s wire bytes. Trailing bytes past the last field
/// are ignored, matching the original's behavior of decoding a prefix.
///
/// # Errors
/// See [`decode_value`] and [`parse_signature`].
pub fn decode<T: DecodeTuple>(sig: &str, input: &[u8]) -> Result<T> {
	let fields = parse_signature(sig)?;
	let mut cursor = input;
	let mut values = Vec::with_capacity(fields.len());

	for field in &fields {
		values.push(decode_value(field, &mut cursor)?);
	}

	T::from_values(values)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_primitive_signs() {
		assert_eq!(parse_signature("u1 u2 u4 u8").unwrap(), vec![
			Sig::U(1),
			Sig::U(2),
			Sig::U(4),
			Sig::U(8)
		]);
		assert_eq!(
			parse_signature("i1i2i4i8f").unwrap(),
			vec![Sig::I(1), Sig::I(2), Sig::I(4), Sig::I(8), Sig::F]
		);
	}

	#[test]
	fn parses_nested_vectors_and_structs() {
		let sig = parse_signature("v(u1 u4)").unwrap();

		assert_eq!(
			sig,
			vec![Sig::Vec(Box::new(Sig::Struct(vec![Sig::U(1), Sig::U(4)])))]
		);
	}

	#[test]
	fn rejects_malformed_signatures() {
		assert!(parse_signature("u3").is_err());
		assert!(parse_signature("(u4").is_err());
		assert!(parse_signature("q").is_err());
	}

	#[test]
	fn roundtrips_primitive_values() {
		let bytes = encode("u4", &42u32).unwrap();

		assert_eq!(bytes, vec![0, 0, 0, 42]);
		assert_eq!(decode::<u32>("u4", &bytes).unwrap(), 42);

		let bytes = encode("i4", &-1i32).unwrap();

		assert_eq!(bytes, vec![0xff, 0xff, 0xff, 0xff]);
		assert_eq!(decode::<i32>("i4", &bytes).unwrap(), -1);
	}

	#[test]
	fn roundtrips_vectors_of_structs() {
		let value: Vec<(u8, u32)> = vec![(1, 100), (2, 200)];
		let bytes = encode("v(u1 u4)", &value).unwrap();
		let decoded: Vec<(u8, u32)> = decode("v(u1 u4)", &bytes).unwrap();

		assert_eq!(decoded, value);
	}

	#[test]
	fn truncated_input_is_an_error() {
		assert!(matches!(
			decode::<u32>("u4", &[0, 0]),
			Err(Error::Truncated)
		));
	}
}
