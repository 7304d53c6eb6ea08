use std::path::PathBuf;

use serde_json::Value;

/// Sink for fire-and-forget transformation snapshots. Injected into the
/// projection path so the transformation logic itself stays side-effect-free
/// and unit-testable; a `None` sink means capture is disabled.
pub trait TransformSink: Send + Sync {
    fn capture(&self, stage: &str, payload: &Value);
}

/// Writes each snapshot as its own JSON file under a capture directory.
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl TransformSink for FileSink {
    fn capture(&self, stage: &str, payload: &Value) {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            tracing::warn!("failed to create capture directory: {}", e);
            return;
        }
        let filename = self.dir.join(format!(
            "{}_{}.json",
            chrono::Utc::now().timestamp_millis(),
            stage
        ));
        match serde_json::to_string_pretty(payload) {
            Ok(content) => {
                if let Err(e) = std::fs::write(&filename, content) {
                    tracing::warn!("failed to write snapshot {}: {}", filename.display(), e);
                }
            }
            Err(e) => tracing::warn!("failed to serialize snapshot '{}': {}", stage, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_writes_one_file_per_stage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = FileSink::new(dir.path());
        sink.capture("projected", &serde_json::json!({"model": "m"}));

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].file_name().to_string_lossy().to_string();
        assert!(name.ends_with("_projected.json"));

        let content = std::fs::read_to_string(entries[0].path()).expect("read snapshot");
        let parsed: Value = serde_json::from_str(&content).expect("valid json");
        assert_eq!(parsed["model"], "m");
    }
}
