//! Raw register decoding.
//!
//! Pure functions from raw 16-bit words to scaled engineering values. Word
//! order is big-endian (most-significant word first) for the whole system;
//! this is the convention the register maps are written against.

use crate::error::DecodeError;
use crate::point::DataType;

/// Decode `raw` according to `data_type` and apply the scale divisor:
/// `physical = decoded_raw / scale`.
///
/// The word count must match `data_type.register_count()` exactly; a
/// mismatch fails rather than attempting a best-effort decode.
pub fn decode(raw: &[u16], data_type: DataType, scale: f64) -> Result<f64, DecodeError> {
    let expected = data_type.register_count();
    if raw.len() != expected as usize {
        return Err(DecodeError::InsufficientRegisters {
            data_type: data_type.as_str(),
            expected,
            got: raw.len(),
        });
    }

    let value = match data_type {
        DataType::Uint16 => f64::from(raw[0]),
        DataType::Int16 => f64::from(raw[0] as i16),
        DataType::Uint32 => f64::from(combine_u32(raw[0], raw[1])),
        DataType::Int32 => f64::from(combine_u32(raw[0], raw[1]) as i32),
        DataType::Float32 => {
            let bits = combine_u32(raw[0], raw[1]);
            let v = f32::from_bits(bits);
            if !v.is_finite() {
                return Err(DecodeError::NonFinite { bits });
            }
            f64::from(v)
        }
    };

    Ok(value / scale)
}

/// Combine two words into a 32-bit quantity, high word first.
#[inline]
fn combine_u32(high: u16, low: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint16_passthrough() {
        assert_eq!(decode(&[42], DataType::Uint16, 1.0).unwrap(), 42.0);
        assert_eq!(decode(&[0xFFFF], DataType::Uint16, 1.0).unwrap(), 65535.0);
    }

    #[test]
    fn int16_sign() {
        assert_eq!(decode(&[0x8000], DataType::Int16, 1.0).unwrap(), -32768.0);
        assert_eq!(decode(&[0x7FFF], DataType::Int16, 1.0).unwrap(), 32767.0);
        assert_eq!(decode(&[0xFFFF], DataType::Int16, 1.0).unwrap(), -1.0);
    }

    #[test]
    fn uint32_combination() {
        // high word first: 1 * 65536 + 2
        assert_eq!(
            decode(&[0x0001, 0x0002], DataType::Uint32, 1.0).unwrap(),
            65538.0
        );
        assert_eq!(
            decode(&[0xFFFF, 0xFFFF], DataType::Uint32, 1.0).unwrap(),
            4294967295.0
        );
    }

    #[test]
    fn int32_sign_extension() {
        assert_eq!(
            decode(&[0xFFFF, 0xFFFF], DataType::Int32, 1.0).unwrap(),
            -1.0
        );
        assert_eq!(decode(&[0x0000, 0x0001], DataType::Int32, 1.0).unwrap(), 1.0);
        assert_eq!(
            decode(&[0x8000, 0x0000], DataType::Int32, 1.0).unwrap(),
            -2147483648.0
        );
    }

    #[test]
    fn float32_round_trip() {
        let bits = 123.456_f32.to_bits();
        let words = [(bits >> 16) as u16, (bits & 0xFFFF) as u16];
        // 123.456f32 encodes to approximately [0x42F6, 0xE979]
        assert_eq!(words[0], 0x42F6);
        assert_eq!(words[1], 0xE979);
        let value = decode(&words, DataType::Float32, 1.0).unwrap();
        assert!((value - 123.456).abs() < 1e-4);
    }

    #[test]
    fn float32_non_finite_rejected() {
        let bits = f32::NAN.to_bits();
        let words = [(bits >> 16) as u16, (bits & 0xFFFF) as u16];
        let err = decode(&words, DataType::Float32, 1.0).unwrap_err();
        assert!(matches!(err, DecodeError::NonFinite { .. }));

        let bits = f32::INFINITY.to_bits();
        let words = [(bits >> 16) as u16, (bits & 0xFFFF) as u16];
        assert!(decode(&words, DataType::Float32, 1.0).is_err());
    }

    #[test]
    fn scale_is_a_divisor() {
        // register holds tenths of a volt
        assert_eq!(decode(&[2305], DataType::Uint16, 10.0).unwrap(), 230.5);
        // scale below one amplifies
        assert_eq!(decode(&[100], DataType::Uint16, 0.5).unwrap(), 200.0);
        // signed values scale the same way
        assert_eq!(decode(&[0xFFFF], DataType::Int16, 10.0).unwrap(), -0.1);
    }

    #[test]
    fn word_count_mismatch_rejected() {
        let err = decode(&[0x0001], DataType::Float32, 1.0).unwrap_err();
        assert_eq!(
            err,
            DecodeError::InsufficientRegisters {
                data_type: "float32",
                expected: 2,
                got: 1,
            }
        );
        // too many words is also a mismatch, not a prefix decode
        assert!(decode(&[1, 2], DataType::Uint16, 1.0).is_err());
        assert!(decode(&[], DataType::Uint16, 1.0).is_err());
    }

    #[test]
    fn decode_is_deterministic() {
        let words = [0x4049, 0x0FDB];
        let a = decode(&words, DataType::Float32, 2.0).unwrap();
        let b = decode(&words, DataType::Float32, 2.0).unwrap();
        assert_eq!(a, b);
    }
}
