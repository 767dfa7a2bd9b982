use serde::{Deserialize, Serialize};

/// Configuration for a [`Pipeline`](crate::Pipeline).
///
/// Deserializable so host applications can keep pipeline metadata in their
/// own configuration files. Missing fields take their defaults.
///
/// # Examples
///
/// ```
/// use nagare::{Pipeline, PipelineConfig};
///
/// let config = PipelineConfig {
///     name: "ingest".to_string(),
/// };
/// let pipeline = Pipeline::with_config(config);
/// assert_eq!(pipeline.name(), "ingest");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Name used in logs and as the step name when nested. Default: `"pipeline"`.
    pub name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "pipeline".to_string(),
        }
    }
}
