//! Artifact Pipeline: captures a build's sandbox filesystem into a zip
//! and uploads it to the object store (spec §4.8).
//!
//! Grounded in the magic-byte sniff idiom already present in
//! `sandbox::parse_memory_limit`'s string-prefix dispatch, generalized
//! here to a gzip-magic byte sniff, and the streaming-line-reader idiom
//! of `pipeline::execute_pipeline_streaming`, applied instead to a tar
//! entry stream from `SandboxAdapter::download_dir`.

use std::io::{Cursor, Read, Write as _};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use flate2::read::GzDecoder;
use uuid::Uuid;

use super::object_store::ObjectStoreAdapter;
use super::sandbox::SandboxAdapter;

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const CAPTURE_PATH: &str = "/home/user";

/// Download the sandbox's working directory, repackage it as a zip, and
/// upload it to `builds/{build_id}/artifacts.zip`. Returns the object
/// store key on success.
pub async fn capture(
    sandbox: &dyn SandboxAdapter,
    store: &dyn ObjectStoreAdapter,
    build_id: Uuid,
) -> Result<String> {
    let raw = sandbox
        .download_dir(CAPTURE_PATH)
        .await
        .context("failed to download sandbox directory")?;

    let zip_bytes = repack_as_zip(&raw).context("failed to repackage tar stream as zip")?;

    let key = format!("builds/{build_id}/artifacts.zip");
    let metadata = vec![
        ("buildId".to_string(), build_id.to_string()),
        ("originalPath".to_string(), CAPTURE_PATH.to_string()),
        ("createdAt".to_string(), Utc::now().to_rfc3339()),
    ];
    store
        .upload(&key, zip_bytes, "application/zip", metadata)
        .await
        .context("failed to upload artifact")?;

    Ok(key)
}

/// Best-effort capture followed by unconditional sandbox destruction.
/// Capture failures are logged but never block destroy (spec §4.8/§7).
/// Returns the artifact key if capture succeeded.
pub async fn capture_and_destroy(
    sandbox: Arc<dyn SandboxAdapter>,
    store: Option<Arc<dyn ObjectStoreAdapter>>,
    build_id: Uuid,
) -> Option<String> {
    let artifact_key = if let Some(store) = &store {
        match capture(sandbox.as_ref(), store.as_ref(), build_id).await {
            Ok(key) => Some(key),
            Err(err) => {
                tracing::warn!(error = %err, %build_id, "artifact capture failed");
                None
            }
        }
    } else {
        None
    };

    if let Err(err) = sandbox.destroy().await {
        tracing::warn!(error = %err, %build_id, "sandbox destroy failed after artifact capture");
    }

    artifact_key
}

/// gzip-sniff, then stream tar entries straight into a zip archive,
/// regular files only, stripping any leading `./`.
fn repack_as_zip(raw: &[u8]) -> Result<Vec<u8>> {
    let is_gzip = raw.len() >= 2 && raw[0..2] == GZIP_MAGIC;

    let mut zip_buf = Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut zip_buf);
        let options: zip::write::FileOptions<()> =
            zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        if is_gzip {
            let mut archive = tar::Archive::new(GzDecoder::new(raw));
            write_entries(&mut archive, &mut writer, options)?;
        } else {
            let mut archive = tar::Archive::new(raw);
            write_entries(&mut archive, &mut writer, options)?;
        }

        writer.finish().context("failed to finalize zip archive")?;
    }

    Ok(zip_buf.into_inner())
}

fn write_entries<R: Read>(
    archive: &mut tar::Archive<R>,
    writer: &mut zip::ZipWriter<&mut Cursor<Vec<u8>>>,
    options: zip::write::FileOptions<()>,
) -> Result<()> {
    for entry in archive.entries().context("failed to read tar entries")? {
        let mut entry = entry.context("failed to read tar entry")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().context("tar entry has invalid path")?;
        let name = path
            .to_string_lossy()
            .trim_start_matches("./")
            .to_string();
        if name.is_empty() {
            continue;
        }

        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .context("failed to read tar entry contents")?;

        writer
            .start_file(&name, options)
            .with_context(|| format!("failed to start zip entry {name}"))?;
        writer
            .write_all(&contents)
            .with_context(|| format!("failed to write zip entry {name}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::object_store::LocalObjectStore;
    use crate::factory::sandbox::ExecOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeSandbox {
        tar_bytes: Vec<u8>,
        destroyed: Mutex<bool>,
    }

    #[async_trait]
    impl SandboxAdapter for FakeSandbox {
        async fn exec(&self, _command: &str) -> Result<ExecOutput> {
            unimplemented!()
        }
        async fn read_file(&self, _path: &str) -> Result<Option<Vec<u8>>> {
            unimplemented!()
        }
        async fn write_file(&self, _path: &str, _content: &[u8]) -> Result<()> {
            unimplemented!()
        }
        async fn download_dir(&self, _path: &str) -> Result<Vec<u8>> {
            Ok(self.tar_bytes.clone())
        }
        async fn destroy(&self) -> Result<()> {
            *self.destroyed.lock().unwrap() = true;
            Ok(())
        }
        async fn set_timeout(&self, _seconds: u64) {}
        fn get_host(&self) -> Option<String> {
            None
        }
    }

    fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *contents).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[tokio::test]
    async fn capture_uploads_zip_with_stripped_prefix() {
        let tar_bytes = build_tar(&[("./index.html", b"<html></html>")]);
        let sandbox = FakeSandbox {
            tar_bytes,
            destroyed: Mutex::new(false),
        };
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let build_id = Uuid::new_v4();

        let key = capture(&sandbox, &store, build_id).await.unwrap();
        assert_eq!(key, format!("builds/{build_id}/artifacts.zip"));
        assert!(store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn capture_and_destroy_destroys_even_without_store() {
        let tar_bytes = build_tar(&[("a.txt", b"hello")]);
        let sandbox = Arc::new(FakeSandbox {
            tar_bytes,
            destroyed: Mutex::new(false),
        });
        let key = capture_and_destroy(sandbox.clone(), None, Uuid::new_v4()).await;
        assert!(key.is_none());
        assert!(*sandbox.destroyed.lock().unwrap());
    }

    #[tokio::test]
    async fn repack_handles_gzip_magic() {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        let tar_bytes = build_tar(&[("b.txt", b"world")]);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        let gz = encoder.finish().unwrap();

        let zip_bytes = repack_as_zip(&gz).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(zip_bytes)).unwrap();
        assert_eq!(archive.len(), 1);
        let file = archive.by_index(0).unwrap();
        assert_eq!(file.name(), "b.txt");
    }
}
