// apps/kernel-server/src/fs_manager.rs
// Purpose: Manages file system operations for the kernel's storage volume:
// per-client library namespaces, per-run session workspaces, and the
// artifact-promotion surface. §4.12, §6.4
// Architecture: Infrastructure Helper Layer
// Dependencies: tokio::fs, serde_json

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io;

pub const PUBLIC_TENANT: &str = "public";

/// Sidecar written next to every run's promoted artifacts so the library and
/// artifact-browsing endpoints don't need to re-derive it by walking the
/// filesystem on every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub run_id: String,
    pub client_id: String,
    pub files: Vec<String>,
    pub created_at: String,
    #[serde(default)]
    pub promoted_to_library: Vec<String>,
}

pub struct WorkspaceInitializer;

fn sessions_dir(storage_root: &str, run_id: &str) -> PathBuf {
    Path::new(storage_root).join("sessions").join(run_id)
}

fn library_dir(storage_root: &str, client_id: &str) -> PathBuf {
    Path::new(storage_root).join("library").join(client_id)
}

fn artifacts_dir(storage_root: &str, client_id: &str, run_id: &str) -> PathBuf {
    Path::new(storage_root).join("artifacts").join(client_id).join(run_id)
}

fn is_safe_filename(name: &str) -> bool {
    !name.contains("..") && !name.starts_with('/') && !name.is_empty()
}

impl WorkspaceInitializer {
    /// Creates the session's input/output directories and snapshots the
    /// requested library files into `input/`. A file is resolved from the
    /// caller's own namespace first, falling back to the shared `public`
    /// namespace -- tenants never see each other's libraries, but everyone
    /// sees the shared one.
    pub async fn init_run_session(
        storage_root: &str,
        run_id: &str,
        client_id: &str,
        library_files: Vec<String>,
    ) -> io::Result<()> {
        let session_path = sessions_dir(storage_root, run_id);
        let input_path = session_path.join("input");
        let output_path = session_path.join("output");

        fs::create_dir_all(&input_path).await?;
        fs::create_dir_all(&output_path).await?;

        tracing::info!("Created workspace for run {}: {}", run_id, session_path.display());

        for filename in library_files {
            if !is_safe_filename(&filename) {
                tracing::warn!("Refusing to attach unsafe filename: {}", filename);
                continue;
            }

            let tenant_src = library_dir(storage_root, client_id).join(&filename);
            let public_src = library_dir(storage_root, PUBLIC_TENANT).join(&filename);

            let src = if tenant_src.exists() {
                tenant_src
            } else if public_src.exists() {
                public_src
            } else {
                tracing::warn!("Requested file {} not found in library for client {}", filename, client_id);
                continue;
            };

            let dest = input_path.join(&filename);
            match fs::copy(&src, &dest).await {
                Ok(_) => tracing::info!("Attached file {} to run {}", filename, run_id),
                Err(e) => tracing::error!("Failed to copy {}: {}", filename, e),
            }
        }

        Ok(())
    }

    pub async fn cleanup_run(storage_root: &str, run_id: &str) -> io::Result<()> {
        let path = sessions_dir(storage_root, run_id);
        if path.exists() {
            fs::remove_dir_all(&path).await?;
            tracing::info!("Cleaned up workspace for run {}", run_id);
        }
        Ok(())
    }

    /// Writes an uploaded file into `client_id`'s library namespace.
    pub async fn save_to_library(storage_root: &str, client_id: &str, filename: &str, data: &[u8]) -> io::Result<()> {
        if !is_safe_filename(filename) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "unsafe filename"));
        }

        let dir = library_dir(storage_root, client_id);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(filename), data).await
    }

    pub async fn list_library_files(storage_root: &str, client_id: &str) -> io::Result<Vec<String>> {
        let dir = library_dir(storage_root, client_id);
        if !dir.exists() {
            fs::create_dir_all(&dir).await?;
        }

        let mut entries = fs::read_dir(&dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Ok(name) = entry.file_name().into_string() {
                    if !name.starts_with('.') {
                        files.push(name);
                    }
                }
            }
        }
        Ok(files)
    }

    /// Moves a run's generated output files into the tenant-scoped artifact
    /// store and writes the metadata.json sidecar. Called once a run reaches
    /// a terminal state.
    pub async fn promote_run_to_artifacts(
        storage_root: &str,
        client_id: &str,
        run_id: &str,
        files: Vec<String>,
    ) -> io::Result<ArtifactMetadata> {
        let output_dir = sessions_dir(storage_root, run_id).join("output");
        let dest_dir = artifacts_dir(storage_root, client_id, run_id);
        fs::create_dir_all(&dest_dir).await?;

        let mut stored = Vec::new();
        for filename in &files {
            if !is_safe_filename(filename) {
                continue;
            }
            let src = output_dir.join(filename);
            if src.exists() {
                fs::copy(&src, dest_dir.join(filename)).await?;
                stored.push(filename.clone());
            }
        }

        let metadata = ArtifactMetadata {
            run_id: run_id.to_string(),
            client_id: client_id.to_string(),
            files: stored,
            created_at: Utc::now().to_rfc3339(),
            promoted_to_library: Vec::new(),
        };

        let json = serde_json::to_string_pretty(&metadata)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        fs::write(dest_dir.join("metadata.json"), json).await?;

        Ok(metadata)
    }

    pub async fn list_artifact_runs(storage_root: &str, client_id: &str) -> io::Result<Vec<String>> {
        let dir = Path::new(storage_root).join("artifacts").join(client_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&dir).await?;
        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Ok(name) = entry.file_name().into_string() {
                    runs.push(name);
                }
            }
        }
        Ok(runs)
    }

    pub async fn get_artifact_metadata(storage_root: &str, client_id: &str, run_id: &str) -> io::Result<ArtifactMetadata> {
        let path = artifacts_dir(storage_root, client_id, run_id).join("metadata.json");
        let data = fs::read_to_string(&path).await?;
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }

    /// Records that `filename` was copied out of a run's artifacts into the
    /// tenant's library, updating the sidecar so later listings reflect it.
    pub async fn mark_promoted_to_library(storage_root: &str, client_id: &str, run_id: &str, filename: &str) -> io::Result<()> {
        let path = artifacts_dir(storage_root, client_id, run_id).join("metadata.json");
        let data = fs::read_to_string(&path).await?;
        let mut metadata: ArtifactMetadata =
            serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        if !metadata.promoted_to_library.iter().any(|f| f == filename) {
            metadata.promoted_to_library.push(filename.to_string());
        }

        let json = serde_json::to_string_pretty(&metadata)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        fs::write(path, json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_run_session_falls_back_to_public_library() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_str().unwrap();

        WorkspaceInitializer::save_to_library(root, PUBLIC_TENANT, "shared.txt", b"hello")
            .await
            .unwrap();

        WorkspaceInitializer::init_run_session(root, "run1", "tenant-a", vec!["shared.txt".to_string()])
            .await
            .unwrap();

        let attached = Path::new(root).join("sessions/run1/input/shared.txt");
        assert!(attached.exists());
    }

    #[tokio::test]
    async fn tenant_library_file_is_not_visible_to_other_tenants() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_str().unwrap();

        WorkspaceInitializer::save_to_library(root, "tenant-a", "secret.txt", b"private")
            .await
            .unwrap();

        WorkspaceInitializer::init_run_session(root, "run1", "tenant-b", vec!["secret.txt".to_string()])
            .await
            .unwrap();

        let leaked = Path::new(root).join("sessions/run1/input/secret.txt");
        assert!(!leaked.exists());
    }

    #[tokio::test]
    async fn promote_run_writes_metadata_sidecar() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_str().unwrap();

        let output_dir = Path::new(root).join("sessions/run1/output");
        fs::create_dir_all(&output_dir).await.unwrap();
        fs::write(output_dir.join("report.md"), b"# done").await.unwrap();

        let metadata = WorkspaceInitializer::promote_run_to_artifacts(root, "tenant-a", "run1", vec!["report.md".to_string()])
            .await
            .unwrap();

        assert_eq!(metadata.files, vec!["report.md".to_string()]);

        let read_back = WorkspaceInitializer::get_artifact_metadata(root, "tenant-a", "run1").await.unwrap();
        assert_eq!(read_back.run_id, "run1");
    }

    #[tokio::test]
    async fn unsafe_filenames_are_rejected_everywhere() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_str().unwrap();

        let result = WorkspaceInitializer::save_to_library(root, "tenant-a", "../escape.txt", b"x").await;
        assert!(result.is_err());
    }
}
