//! Model artifact discovery and size verification

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::ModelError;

/// Where the model file is and how large it should be
#[derive(Debug, Clone, PartialEq)]
pub struct ModelArtifactDescriptor {
    pub path: PathBuf,
    pub expected_size_bytes: u64,
    /// Relative tolerance, e.g. `0.05` for ±5%
    pub size_tolerance: f64,
}

impl ModelArtifactDescriptor {
    pub fn new(path: impl Into<PathBuf>, expected_size_bytes: u64, size_tolerance: f64) -> Self {
        Self {
            path: path.into(),
            expected_size_bytes,
            size_tolerance,
        }
    }

    /// Inclusive `(min, max)` byte bounds accepted by [`verify`](Self::verify).
    pub fn size_bounds(&self) -> (u64, u64) {
        let expected = self.expected_size_bytes as f64;
        let tolerance = self.size_tolerance.max(0.0);
        // Rounded so that float noise in `1 ± tolerance` cannot shift a bound by a byte.
        let min = (expected * (1.0 - tolerance)).round().max(0.0) as u64;
        let max = (expected * (1.0 + tolerance)).round() as u64;
        (min, max)
    }

    /// Verified means: the file exists and its size lies within tolerance.
    pub fn verify(&self) -> Result<u64, ModelError> {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Err(ModelError::ModelNotFound),
            Err(e) => {
                debug!("Artifact {:?} not readable: {}", self.path, e);
                return Err(ModelError::ModelNotFound);
            }
        };

        let actual = metadata.len();
        let (min, max) = self.size_bounds();
        if actual < min || actual > max {
            warn!(
                "Artifact {:?} is {} bytes, outside [{}, {}]",
                self.path, actual, min, max
            );
            return Err(ModelError::ModelCorrupted {
                actual,
                expected: self.expected_size_bytes,
            });
        }

        Ok(actual)
    }
}

/// First candidate that is an existing regular file.
pub fn locate_artifact<P: AsRef<Path>>(candidates: &[P]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(|p| p.as_ref())
        .find(|p| p.is_file())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn sized_file(dir: &Path, name: &str, len: u64) -> PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).expect("create");
        file.set_len(len).expect("set_len");
        path
    }

    #[test]
    fn test_size_tolerance_boundaries() {
        let dir = tempfile::tempdir().expect("tempdir");

        let short = sized_file(dir.path(), "short.gguf", 949_999);
        let result = ModelArtifactDescriptor::new(&short, 1_000_000, 0.05).verify();
        assert_eq!(
            result,
            Err(ModelError::ModelCorrupted {
                actual: 949_999,
                expected: 1_000_000
            })
        );

        let long_ok = sized_file(dir.path(), "ok.gguf", 1_049_999);
        let result = ModelArtifactDescriptor::new(&long_ok, 1_000_000, 0.05).verify();
        assert_eq!(result, Ok(1_049_999));
    }

    #[test]
    fn test_exact_bounds_are_inclusive() {
        let descriptor = ModelArtifactDescriptor::new("unused", 1_000_000, 0.05);
        assert_eq!(descriptor.size_bounds(), (950_000, 1_050_000));

        let dir = tempfile::tempdir().expect("tempdir");
        let upper = sized_file(dir.path(), "upper.gguf", 1_050_000);
        assert!(ModelArtifactDescriptor::new(&upper, 1_000_000, 0.05)
            .verify()
            .is_ok());
        let over = sized_file(dir.path(), "over.gguf", 1_050_001);
        assert!(matches!(
            ModelArtifactDescriptor::new(&over, 1_000_000, 0.05).verify(),
            Err(ModelError::ModelCorrupted { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let descriptor = ModelArtifactDescriptor::new(dir.path().join("absent.gguf"), 10, 0.05);
        assert_eq!(descriptor.verify(), Err(ModelError::ModelNotFound));

        // A directory with the artifact's name does not count either.
        let descriptor = ModelArtifactDescriptor::new(dir.path(), 10, 0.05);
        assert_eq!(descriptor.verify(), Err(ModelError::ModelNotFound));
    }

    #[test]
    fn test_locate_prefers_bundled_then_fallback() {
        let bundled = tempfile::tempdir().expect("tempdir");
        let fallback = tempfile::tempdir().expect("tempdir");
        let candidates = [bundled.path().join("m.gguf"), fallback.path().join("m.gguf")];

        assert_eq!(locate_artifact(&candidates), None);

        sized_file(fallback.path(), "m.gguf", 1);
        assert_eq!(locate_artifact(&candidates), Some(candidates[1].clone()));

        sized_file(bundled.path(), "m.gguf", 1);
        assert_eq!(locate_artifact(&candidates), Some(candidates[0].clone()));
    }
}
