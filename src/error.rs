use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuotaSentryError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("probe error: {0}")]
    Probe(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

pub use crate::Result;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_variant_prefixes() {
        let err = QuotaSentryError::Config("empty task name".to_string());
        assert!(format!("{err}").contains("configuration error"));
        let err = QuotaSentryError::Probe("connection refused".to_string());
        assert!(format!("{err}").contains("probe error"));
    }
}
