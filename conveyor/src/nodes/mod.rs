//! Node functions: one per phase, each translating its agent's result into a
//! partial state update.
//!
//! Shared contract: read state, call the phase's [`AgentService`] method,
//! return only changed fields with `current_phase` set and at least one log
//! entry appended. Collaborator failures become entries in `errors` (never
//! `Err`), which the routers turn into a terminal failure.

mod failed;
mod generator;
mod mock_generator;
mod publisher;
mod research;
mod reviewer;
mod test_reviewer;
mod tester;

pub use failed::FailedNode;
pub use generator::GeneratorNode;
pub use mock_generator::MockGeneratorNode;
pub use publisher::PublisherNode;
pub use research::ResearchNode;
pub use reviewer::ReviewerNode;
pub use test_reviewer::TestReviewerNode;
pub use tester::TesterNode;

use std::path::{Path, PathBuf};

use crate::settings::Settings;
use crate::state::{FileMap, PipelineState};

/// Timestamped log entry, mirrored to tracing.
pub(crate) fn log_entry(message: impl AsRef<str>) -> String {
    let message = message.as_ref();
    tracing::info!("{message}");
    format!("[{}] {}", chrono::Utc::now().format("%H:%M:%S"), message)
}

/// Working directory for this run: `<base>/<type>-<slug>`.
///
/// Keyed by connector, not thread: two concurrent runs of the same connector
/// share (and fight over) the directory; the in-state file map stays
/// authoritative either way.
pub(crate) fn connector_dir(settings: &Settings, state: &PipelineState) -> PathBuf {
    match &state.connector_dir {
        Some(dir) => PathBuf::from(dir),
        None => settings.output_base_dir.join(format!(
            "{}-{}",
            state.connector_type,
            state.connector_slug()
        )),
    }
}

/// Reads the connector sources back from the working tree for in-state
/// persistence: every `.py` file plus `requirements.txt` and
/// `IMPLEMENTATION.md`.
pub(crate) fn read_workspace_files(dir: &Path) -> FileMap {
    let mut files = FileMap::new();
    if !dir.exists() {
        return files;
    }
    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let relative = match path.strip_prefix(dir) {
            Ok(p) => p.to_string_lossy().into_owned(),
            Err(_) => continue,
        };
        let keep = path.extension().is_some_and(|ext| ext == "py")
            || relative == "requirements.txt"
            || relative == "IMPLEMENTATION.md";
        if !keep {
            continue;
        }
        match std::fs::read_to_string(path) {
            Ok(content) => {
                files.insert(relative, content);
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to read generated file"),
        }
    }
    files
}

/// Seconds elapsed since the run's `created_at` stamp.
pub(crate) fn elapsed_since(created_at: &str) -> f64 {
    chrono::DateTime::parse_from_rfc3339(created_at)
        .map(|t| (chrono::Utc::now() - t.with_timezone(&chrono::Utc)).num_milliseconds() as f64 / 1000.0)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ConnectorType, RetryLimits};

    /// **Scenario**: The working directory is keyed by type and slug, and an
    /// explicit connector_dir in state wins.
    #[test]
    fn connector_dir_naming() {
        let settings = Settings {
            output_base_dir: PathBuf::from("/tmp/out"),
            ..Settings::default()
        };
        let mut state = PipelineState::initial(
            "Google Sheets",
            ConnectorType::Source,
            None,
            None,
            RetryLimits::default(),
        );
        assert_eq!(
            connector_dir(&settings, &state),
            PathBuf::from("/tmp/out/source-google-sheets")
        );
        state.connector_dir = Some("/elsewhere/dir".into());
        assert_eq!(
            connector_dir(&settings, &state),
            PathBuf::from("/elsewhere/dir")
        );
    }

    /// **Scenario**: Only connector sources and the two manifests are read back.
    #[test]
    fn workspace_read_filters_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/client.py"), "x = 1\n").unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "requests\n").unwrap();
        std::fs::write(dir.path().join("IMPLEMENTATION.md"), "# impl\n").unwrap();
        std::fs::write(dir.path().join("notes.rst"), "skip me\n").unwrap();

        let files = read_workspace_files(dir.path());
        assert_eq!(files.len(), 3);
        assert!(files.contains_key("src/client.py"));
        assert!(files.contains_key("requirements.txt"));
        assert!(files.contains_key("IMPLEMENTATION.md"));
    }
}
