use std::path::{Path, PathBuf};

pub type MapResult<T> = Result<T, MapError>;

#[derive(thiserror::Error, Debug)]
pub enum MapError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("data error: {0}")]
    Data(String),

    #[error("compile error in {path:?}: {message}")]
    Compile { path: PathBuf, message: String },

    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MapError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn compile(path: &Path, msg: impl Into<String>) -> Self {
        Self::Compile {
            path: path.to_path_buf(),
            message: msg.into(),
        }
    }

    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(MapError::invalid_argument("x")
            .to_string()
            .contains("invalid argument:"));
        assert!(MapError::data("x").to_string().contains("data error:"));
        assert!(MapError::compile(Path::new("a.css"), "x")
            .to_string()
            .contains("compile error in"));
    }

    #[test]
    fn io_keeps_path_and_source() {
        let err = MapError::io(Path::new("dist/x"), std::io::Error::other("boom"));
        let text = err.to_string();
        assert!(text.contains("dist/x"));
        assert!(text.contains("boom"));
    }

    #[test]
    fn other_preserves_source() {
        let err = MapError::Other(anyhow::anyhow!("boom"));
        assert!(err.to_string().contains("boom"));
    }
}
