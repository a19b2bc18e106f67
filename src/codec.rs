use crate::error::CodecError;

/// Conversion between a typed attribute value and its raw characteristic bytes.
///
/// Multi-byte scalars use little-endian byte order, which is the GATT default.
/// Decoding requires the exact width of the type; shorter or longer buffers are
/// rejected rather than padded or truncated.
pub trait AttributeCodec: Sized {
    /// Decodes a raw characteristic payload.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload width or encoding does not match the type.
    fn decode(data: &[u8]) -> Result<Self, CodecError>;

    /// Encodes the value into the payload written to the characteristic.
    fn encode(&self) -> Vec<u8>;
}

fn fixed_width<const N: usize>(
    data: &[u8],
    type_name: &'static str,
) -> Result<[u8; N], CodecError> {
    <[u8; N]>::try_from(data).map_err(|_| CodecError::WrongWidth {
        type_name,
        expected: N,
        actual: data.len(),
    })
}

macro_rules! impl_le_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl AttributeCodec for $ty {
                fn decode(data: &[u8]) -> Result<Self, CodecError> {
                    fixed_width(data, stringify!($ty)).map(<$ty>::from_le_bytes)
                }

                fn encode(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }
        )*
    };
}

impl_le_scalar!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

impl AttributeCodec for bool {
    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        fixed_width::<1>(data, "bool").map(|[byte]| byte != 0)
    }

    fn encode(&self) -> Vec<u8> {
        vec![u8::from(*self)]
    }
}

impl AttributeCodec for String {
    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        Ok(String::from_utf8(data.to_vec())?)
    }

    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

/// Raw passthrough for characteristics without a typed representation.
impl AttributeCodec for Vec<u8> {
    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        Ok(data.to_vec())
    }

    fn encode(&self) -> Vec<u8> {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn round_trip<T: AttributeCodec + PartialEq + Debug>(value: T) {
        let decoded = T::decode(&value.encode()).expect("encoded value should decode");
        assert_eq!(value, decoded);
    }

    #[test]
    fn scalars_survive_encode_then_decode() {
        round_trip(i8::MIN);
        round_trip(u16::MAX);
        round_trip(-123_456_i32);
        round_trip(u64::MAX - 7);
        round_trip(3.5_f32);
        round_trip(-0.125_f64);
        round_trip(true);
        round_trip("Heart Rate Sensor".to_string());
        round_trip(vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn multi_byte_scalars_are_little_endian() {
        assert_eq!(vec![0x34, 0x12], 0x1234_u16.encode());
        assert_eq!(Ok(0x1234_u16), u16::decode(&[0x34, 0x12]));
        assert_eq!(Ok(-2_i16), i16::decode(&[0xFE, 0xFF]));
    }

    #[rstest]
    #[case(&[], 0)]
    #[case(&[0x01], 1)]
    #[case(&[0x01, 0x02, 0x03], 3)]
    fn wrong_width_is_rejected(#[case] payload: &[u8], #[case] actual: usize) {
        assert_eq!(
            Err(CodecError::WrongWidth {
                type_name: "u16",
                expected: 2,
                actual,
            }),
            u16::decode(payload)
        );
    }

    #[test]
    fn bool_treats_any_non_zero_byte_as_true() {
        assert_eq!(Ok(true), bool::decode(&[0x7F]));
        assert_eq!(Ok(false), bool::decode(&[0x00]));
    }

    #[test]
    fn string_rejects_invalid_utf8() {
        assert_matches!(String::decode(&[0xC3, 0x28]), Err(CodecError::InvalidUtf8(_)));
    }
}
