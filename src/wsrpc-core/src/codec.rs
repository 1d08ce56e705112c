pub trait Codec: Clone + Sync + Send + 'static {
    fn encode<T: serde::Serialize + ?Sized>(&self, value: &T) -> anyhow::Result<Vec<u8>>;
    fn decode<T: serde::de::DeserializeOwned>(&self, data: &[u8]) -> anyhow::Result<T>;
}

pub mod json {
    use crate::codec::Codec;
    use serde::Serialize;
    use serde::de::DeserializeOwned;

    #[derive(Debug, Clone, Copy, Default)]
    pub struct JsonCodec;

    impl JsonCodec {
        pub fn new() -> Self {
            Self {}
        }
    }

    impl Codec for JsonCodec {
        fn encode<T: Serialize + ?Sized>(&self, value: &T) -> anyhow::Result<Vec<u8>> {
            let json = serde_json::to_vec(value)?;
            Ok(json)
        }

        fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> anyhow::Result<T> {
            let val = serde_json::from_slice(data)?;
            Ok(val)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::{Value, json};

        #[test]
        fn test_decode_rejects_garbage() {
            let codec = JsonCodec::new();
            assert!(codec.decode::<Value>(b"{not json").is_err());
        }

        #[test]
        fn test_encode_is_compact() {
            let codec = JsonCodec::new();
            let bytes = codec.encode(&json!({"a": [1, 2]})).unwrap();
            assert_eq!(bytes, br#"{"a":[1,2]}"#);
        }
    }
}
