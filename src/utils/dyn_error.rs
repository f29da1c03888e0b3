//! Provides [DynError].

/// Wrap `Box<dyn std::error::Error>` and provide a [std::error::Error] implementation.
///
/// Transport errors of different types are boxed into this so that
/// [crate::Connection] can hold any sink and stream.
#[derive(Debug)]
pub struct DynError(Box<dyn std::error::Error + Send + Sync>);

impl DynError {
    pub fn new(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Box::new(error))
    }
}

impl From<std::io::Error> for DynError {
    fn from(value: std::io::Error) -> Self {
        DynError::new(value)
    }
}

impl std::fmt::Display for DynError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for DynError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}
