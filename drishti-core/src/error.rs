use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Malformed zone: {0}")]
    MalformedZone(String),

    #[error("Malformed trigger: {0}")]
    MalformedTrigger(String),

    #[error("Trigger {trigger} references unknown zone {zone}")]
    DanglingZone { trigger: String, zone: String },

    #[error("Duplicate zone id {zone} in trigger {trigger}")]
    DuplicateZone { trigger: String, zone: String },

    #[error("No observation for zone {zone} of trigger {trigger}")]
    MissingObservation { trigger: String, zone: String },
}

impl Error {
    /// True for errors caused by an authored definition rather than the environment.
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedZone(_)
                | Error::MalformedTrigger(_)
                | Error::DanglingZone { .. }
                | Error::DuplicateZone { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
