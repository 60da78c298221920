/// Base64 helpers, usable both as free functions and as a serde
/// `#[serde(with = "base64")]` module for byte fields.
pub mod base64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[inline]
    pub fn encode<T: AsRef<[u8]>>(data: T) -> String {
        ::base64::encode(data)
    }

    #[inline]
    pub fn decode<T: AsRef<[u8]>>(data: T) -> Result<Vec<u8>, ::base64::DecodeError> {
        ::base64::decode(data)
    }

    pub fn serialize<S, T>(data: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = <&str>::deserialize(deserializer)?;
        decode(raw).map_err(de::Error::custom)
    }
}

/// Minimal percent encoder for `application/x-www-form-urlencoded` bodies.
pub mod form {
    pub fn urlencode(value: &str) -> String {
        let mut encoded = String::with_capacity(value.len());

        for byte in value.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    encoded.push(byte as char)
                }
                b' ' => encoded.push('+'),
                _ => encoded.push_str(&format!("%{:02X}", byte)),
            }
        }

        encoded
    }
}
