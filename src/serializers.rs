//! Serde adapters for steam's stringly-typed JSON numbers.

pub mod string {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::fmt::Display;
    use std::str::FromStr;

    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Display,
        S: Serializer,
    {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}

pub mod option_string {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::fmt::Display;
    use std::str::FromStr;

    pub fn serialize<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Display,
        S: Serializer,
    {
        match value {
            Some(value) => serializer.collect_str(value),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) if !raw.is_empty() => raw.parse().map(Some).map_err(de::Error::custom),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Wrapper {
        #[serde(with = "super::string")]
        id: u64,
        #[serde(with = "super::option_string", default)]
        countered: Option<u64>,
    }

    #[test]
    fn parses_string_numbers() {
        let parsed: Wrapper = serde_json::from_str(r#"{"id": "4398046511104"}"#).unwrap();
        assert_eq!(parsed.id, 4398046511104);
        assert_eq!(parsed.countered, None);

        let parsed: Wrapper =
            serde_json::from_str(r#"{"id": "1", "countered": "77"}"#).unwrap();
        assert_eq!(parsed.countered, Some(77));
    }

    #[test]
    fn rejects_non_numeric() {
        assert!(serde_json::from_str::<Wrapper>(r#"{"id": "abc"}"#).is_err());
    }
}
