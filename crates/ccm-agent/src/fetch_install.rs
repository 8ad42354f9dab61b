//! Shared download-extract-install pipeline used by the object-store and
//! HTTP cache maintainers: both end up with a byte slice holding a gzip'd
//! tar and need the same atomic "extract to temp, then swap into place"
//! handling.

use crate::error::AgentError;
use crate::metrics::AgentMetrics;
use crate::worker::ManifestReady;
use ccm_system::ComponentHandle;
use std::path::{Path, PathBuf};

/// Extracts `body` (a gzip'd tar) into a fresh temp directory under
/// `cache_dir`, locates `manifest.yaml`, then atomically replaces
/// `cache_dir/<dir_name>` with the extracted tree and notifies `worker`.
pub async fn install<C>(
    body: Vec<u8>,
    cache_dir: &Path,
    dir_name: &str,
    worker: &mut ComponentHandle<C>,
    metrics: &AgentMetrics,
    source_label: &str,
) -> Result<(), AgentError>
where
    C: ccm_system::Component + ccm_system::Handler<ManifestReady, Result = ()>,
{
    let result = install_inner(body, cache_dir, dir_name).await;
    match &result {
        Ok(_) => metrics.manifest_fetch_count.with_label_values(&[source_label]).inc(),
        Err(_) => metrics
            .manifest_fetch_error_count
            .with_label_values(&[source_label])
            .inc(),
    }
    let (manifest_path, working_dir) = result?;
    let _ = worker
        .send(
            ManifestReady {
                manifest_path,
                working_dir,
            },
            None,
        )
        .await;
    Ok(())
}

async fn install_inner(
    body: Vec<u8>,
    cache_dir: &Path,
    dir_name: &str,
) -> Result<(PathBuf, PathBuf), AgentError> {
    std::fs::create_dir_all(cache_dir)?;

    let temp_dir = cache_dir.join(format!(".{dir_name}.tmp-{}", std::process::id()));
    if temp_dir.exists() {
        std::fs::remove_dir_all(&temp_dir)?;
    }
    std::fs::create_dir_all(&temp_dir)?;

    let created = ccm_archive::extract(std::io::Cursor::new(body), &temp_dir)?;
    let manifest_in_temp = ccm_archive::find_manifest(&created)
        .map(PathBuf::from)
        .ok_or_else(|| {
            let _ = std::fs::remove_dir_all(&temp_dir);
            AgentError::Config(format!("no manifest.yaml found under {dir_name}"))
        })?;

    let final_dir = cache_dir.join(dir_name);
    if final_dir.exists() {
        std::fs::remove_dir_all(&final_dir)?;
    }
    std::fs::rename(&temp_dir, &final_dir)?;

    let relative = manifest_in_temp
        .strip_prefix(&temp_dir)
        .unwrap_or(&manifest_in_temp);
    let manifest_path = final_dir.join(relative);
    let working_dir = manifest_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| final_dir.clone());

    Ok((manifest_path, working_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ApplyEngine, ApplyEngineError, SessionSummary};
    use crate::snapshot::Snapshot;
    use crate::worker::Worker;
    use async_trait::async_trait;
    use ccm_system::System;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tar::Builder;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    struct NoopEngine;

    #[async_trait]
    impl ApplyEngine for NoopEngine {
        async fn set_facts(&self, _facts: Snapshot) {}
        async fn resolve(
            &self,
            _manifest_path: &std::path::Path,
            _working_dir: &std::path::Path,
            _data: Snapshot,
        ) -> Result<(), ApplyEngineError> {
            Ok(())
        }
        async fn execute(&self, _health_check_only: bool) -> Result<SessionSummary, ApplyEngineError> {
            Ok(SessionSummary::default())
        }
    }

    fn build_tar_gz() -> Vec<u8> {
        let mut tar_bytes = Vec::new();
        {
            let mut builder = Builder::new(&mut tar_bytes);
            let data = b"kind: Manifest\n";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "manifest.yaml", &data[..]).unwrap();
            builder.finish().unwrap();
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn installs_and_notifies_worker() {
        let dir = tempdir().unwrap();
        let system = System::new();
        let (tx, _rx) = mpsc::channel(1);
        let mut handle = system.start_component(Worker::new(
            "test".to_string(),
            std::sync::Arc::new(NoopEngine),
            std::sync::Arc::new(AgentMetrics::new()),
            tx,
        ));

        install(
            build_tar_gz(),
            dir.path(),
            "my_source",
            &mut handle,
            &AgentMetrics::new(),
            "test",
        )
        .await
        .unwrap();

        assert!(dir.path().join("my_source/manifest.yaml").exists());
    }
}
