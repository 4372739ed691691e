//! Byte-level codecs shared by records and blocks.
//!
//! Two codecs live here: variable-length unsigned integers in the Git pack
//! encoding, and prefix-compressed key entries with their 3-bit value-type
//! tag. Both are exact inverses of each other for all valid inputs; decoders
//! fail on truncated or overflowing data instead of guessing.

pub mod keycode;
pub mod varint;

pub use keycode::{
    common_prefix_len, decode_key, decode_restart_key, decode_string, encode_key, encode_string,
};
pub use varint::{get_varint, put_varint, MAX_VARINT_LEN};
