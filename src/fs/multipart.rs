//! Multipart upload coordinator.
//!
//! S3-style resumable upload sessions. Each session owns a directory
//! `<uploads-root>/<session-id>/` containing `part-N` files plus a
//! `metadata.json`, which lets the coordinator rehydrate sessions after a
//! restart. Parts may arrive in any order and concurrently; completion
//! concatenates them in ascending part-number order into the target file.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AgentError, Result};

/// A single uploaded part. The ETag is the lowercase hex MD5 of the part
/// bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedPart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

/// Caller-supplied part reference used to complete an upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartSpec {
    pub part_number: u32,
    pub etag: String,
}

/// An in-progress multipart upload.
pub struct UploadSession {
    pub upload_id: String,
    pub path: PathBuf,
    pub permissions: u32,
    pub initiated_at: DateTime<Utc>,
    parts: RwLock<HashMap<u32, UploadedPart>>,
}

/// On-disk and list-endpoint representation of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub upload_id: String,
    pub path: PathBuf,
    pub permissions: u32,
    pub initiated_at: DateTime<Utc>,
    pub parts: BTreeMap<u32, UploadedPart>,
}

impl UploadSession {
    async fn snapshot(&self) -> SessionMetadata {
        let parts = self.parts.read().await;
        SessionMetadata {
            upload_id: self.upload_id.clone(),
            path: self.path.clone(),
            permissions: self.permissions,
            initiated_at: self.initiated_at,
            parts: parts.iter().map(|(k, v)| (*k, v.clone())).collect(),
        }
    }

    fn from_metadata(meta: SessionMetadata) -> Self {
        Self {
            upload_id: meta.upload_id,
            path: meta.path,
            permissions: meta.permissions,
            initiated_at: meta.initiated_at,
            parts: RwLock::new(meta.parts.into_iter().collect()),
        }
    }
}

/// Manages all multipart upload sessions.
pub struct UploadCoordinator {
    uploads_root: PathBuf,
    sessions: RwLock<HashMap<String, Arc<UploadSession>>>,
}

impl UploadCoordinator {
    /// Create a coordinator rooted at `uploads_root` (created if missing).
    pub fn new(uploads_root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&uploads_root)?;
        Ok(Self {
            uploads_root,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    fn session_dir(&self, upload_id: &str) -> PathBuf {
        self.uploads_root.join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_number: u32) -> PathBuf {
        self.session_dir(upload_id).join(format!("part-{}", part_number))
    }

    fn metadata_path(&self, upload_id: &str) -> PathBuf {
        self.session_dir(upload_id).join("metadata.json")
    }

    async fn lookup(&self, upload_id: &str) -> Result<Arc<UploadSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(upload_id)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(format!("upload not found: {}", upload_id)))
    }

    async fn persist_metadata(&self, session: &UploadSession) -> Result<()> {
        let snapshot = session.snapshot().await;
        let data = serde_json::to_vec(&snapshot)
            .map_err(|e| AgentError::Io(std::io::Error::other(e)))?;
        tokio::fs::write(self.metadata_path(&session.upload_id), data).await?;
        Ok(())
    }

    /// Repopulate the session index from disk. Directories without a
    /// parseable `metadata.json` are skipped, not deleted.
    pub async fn rehydrate(&self) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.uploads_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let meta_path = entry.path().join("metadata.json");
            let Ok(data) = tokio::fs::read(&meta_path).await else {
                continue;
            };
            let Ok(meta) = serde_json::from_slice::<SessionMetadata>(&data) else {
                continue;
            };

            let session = Arc::new(UploadSession::from_metadata(meta));
            self.sessions
                .write()
                .await
                .insert(session.upload_id.clone(), session);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Create a new upload session for `path`. Partial failures roll back.
    pub async fn initiate(&self, path: PathBuf, permissions: u32) -> Result<Arc<UploadSession>> {
        let upload_id = Uuid::new_v4().to_string();
        let session = Arc::new(UploadSession {
            upload_id: upload_id.clone(),
            path,
            permissions,
            initiated_at: Utc::now(),
            parts: RwLock::new(HashMap::new()),
        });

        let dir = self.session_dir(&upload_id);
        tokio::fs::create_dir_all(&dir).await?;

        if let Err(e) = self.persist_metadata(&session).await {
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(e);
        }

        self.sessions
            .write()
            .await
            .insert(upload_id, Arc::clone(&session));
        Ok(session)
    }

    /// Stream one part into the session, computing its MD5 as bytes flow.
    /// Re-uploading a part number replaces the earlier part wholesale.
    pub async fn upload_part<R>(
        &self,
        upload_id: &str,
        part_number: u32,
        reader: &mut R,
    ) -> Result<UploadedPart>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let session = self.lookup(upload_id).await?;

        if !(1..=10000).contains(&part_number) {
            return Err(AgentError::InvalidInput(
                "part number must be between 1 and 10000".to_string(),
            ));
        }

        let part_path = self.part_path(upload_id, part_number);
        let mut file = tokio::fs::File::create(&part_path).await?;

        let mut hash = md5::Context::new();
        let mut size: u64 = 0;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    let _ = tokio::fs::remove_file(&part_path).await;
                    return Err(e.into());
                }
            };
            hash.consume(&buf[..n]);
            if let Err(e) = file.write_all(&buf[..n]).await {
                let _ = tokio::fs::remove_file(&part_path).await;
                return Err(e.into());
            }
            size += n as u64;
        }
        file.flush().await?;

        let part = UploadedPart {
            part_number,
            etag: format!("{:x}", hash.compute()),
            size,
            uploaded_at: Utc::now(),
        };

        session.parts.write().await.insert(part_number, part.clone());
        self.persist_metadata(&session).await?;

        Ok(part)
    }

    /// All parts of a session, ascending by part number.
    pub async fn list_parts(&self, upload_id: &str) -> Result<Vec<UploadedPart>> {
        let session = self.lookup(upload_id).await?;
        let parts = session.parts.read().await;
        let mut out: Vec<UploadedPart> = parts.values().cloned().collect();
        out.sort_by_key(|p| p.part_number);
        Ok(out)
    }

    /// Session metadata for one upload.
    pub async fn get(&self, upload_id: &str) -> Result<SessionMetadata> {
        let session = self.lookup(upload_id).await?;
        Ok(session.snapshot().await)
    }

    /// All active sessions.
    pub async fn list(&self) -> Vec<SessionMetadata> {
        let sessions: Vec<Arc<UploadSession>> =
            self.sessions.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions {
            out.push(session.snapshot().await);
        }
        out
    }

    /// Assemble the target file from the supplied parts list.
    ///
    /// Every supplied part must exist with a matching ETag; a mismatch or
    /// copy error leaves the session intact so the caller can retry. On
    /// success the session is removed (cleanup failure is non-fatal - the
    /// target file is the source of truth).
    pub async fn complete(&self, upload_id: &str, mut parts: Vec<PartSpec>) -> Result<PathBuf> {
        let session = self.lookup(upload_id).await?;

        {
            let stored = session.parts.read().await;
            for spec in &parts {
                let Some(part) = stored.get(&spec.part_number) else {
                    return Err(AgentError::Conflict(format!(
                        "part {} not found",
                        spec.part_number
                    )));
                };
                if part.etag != spec.etag {
                    return Err(AgentError::Conflict(format!(
                        "etag mismatch for part {}",
                        spec.part_number
                    )));
                }
            }
        }

        parts.sort_by_key(|p| p.part_number);

        if let Some(parent) = session.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut target = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(session.permissions)
            .open(&session.path)
            .await?;

        for spec in &parts {
            let mut part_file =
                tokio::fs::File::open(self.part_path(upload_id, spec.part_number)).await?;
            tokio::io::copy(&mut part_file, &mut target).await?;
        }
        target.flush().await?;
        tokio::fs::set_permissions(
            &session.path,
            std::os::unix::fs::PermissionsExt::from_mode(session.permissions),
        )
        .await?;

        if let Err(e) = self.abort(upload_id).await {
            tracing::warn!("failed to clean up completed upload {}: {}", upload_id, e);
        }

        Ok(session.path.clone())
    }

    /// Remove the session directory and index entry.
    pub async fn abort(&self, upload_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if !sessions.contains_key(upload_id) {
            return Err(AgentError::NotFound(format!(
                "upload not found: {}",
                upload_id
            )));
        }

        tokio::fs::remove_dir_all(self.session_dir(upload_id)).await?;
        sessions.remove(upload_id);
        Ok(())
    }

    /// Remove every session whose initiation time is older than `max_age`.
    pub async fn cleanup_expired(&self, max_age: Duration) -> Result<usize> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;

        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| {
                (now - s.initiated_at).to_std().unwrap_or_default() > max_age
            })
            .map(|(id, _)| id.clone())
            .collect();

        for upload_id in &expired {
            let _ = tokio::fs::remove_dir_all(self.session_dir(upload_id)).await;
            sessions.remove(upload_id);
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn scratch_root() -> PathBuf {
        std::env::temp_dir().join(format!("sandbox_agent_uploads_{}", Uuid::new_v4()))
    }

    async fn put_part(
        coordinator: &UploadCoordinator,
        id: &str,
        n: u32,
        body: &[u8],
    ) -> UploadedPart {
        let mut reader = std::io::Cursor::new(body.to_vec());
        coordinator.upload_part(id, n, &mut reader).await.unwrap()
    }

    #[tokio::test]
    async fn out_of_order_upload_completes_to_concatenation() {
        let root = scratch_root();
        let coordinator = UploadCoordinator::new(root.clone()).unwrap();
        let target = root.join("assembled.dat");

        let session = coordinator.initiate(target.clone(), 0o644).await.unwrap();
        let id = session.upload_id.clone();

        let p1 = b"This is part 1 content. ";
        let p2 = b"This is part 2 content. ";
        let p3 = b"This is part 3 content.";

        // Arrival order 3, 1, 2.
        let e3 = put_part(&coordinator, &id, 3, p3).await;
        let e1 = put_part(&coordinator, &id, 1, p1).await;
        let e2 = put_part(&coordinator, &id, 2, p2).await;

        assert_eq!(e1.etag, format!("{:x}", md5::compute(p1)));
        assert_eq!(e2.size, p2.len() as u64);

        let listed = coordinator.list_parts(&id).await.unwrap();
        assert_eq!(
            listed.iter().map(|p| p.part_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let specs = vec![
            PartSpec { part_number: 2, etag: e2.etag },
            PartSpec { part_number: 1, etag: e1.etag },
            PartSpec { part_number: 3, etag: e3.etag },
        ];
        coordinator.complete(&id, specs).await.unwrap();

        let assembled = std::fs::read(&target).unwrap();
        assert_eq!(assembled.len(), 71);
        assert_eq!(
            assembled,
            [p1.as_slice(), p2.as_slice(), p3.as_slice()].concat()
        );
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o644);

        // Session is gone after completion.
        assert!(matches!(
            coordinator.get(&id).await,
            Err(AgentError::NotFound(_))
        ));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn etag_mismatch_leaves_session_recoverable() {
        let root = scratch_root();
        let coordinator = UploadCoordinator::new(root.clone()).unwrap();
        let session = coordinator
            .initiate(root.join("x.dat"), 0o644)
            .await
            .unwrap();
        let id = session.upload_id.clone();

        let e1 = put_part(&coordinator, &id, 1, b"one").await;
        let _ = put_part(&coordinator, &id, 2, b"two").await;

        let err = coordinator
            .complete(
                &id,
                vec![
                    PartSpec { part_number: 1, etag: e1.etag },
                    PartSpec { part_number: 2, etag: "deadbeef".to_string() },
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Conflict(_)));

        // Still listable, then abort succeeds exactly once.
        assert_eq!(coordinator.list_parts(&id).await.unwrap().len(), 2);
        coordinator.abort(&id).await.unwrap();
        assert!(matches!(
            coordinator.abort(&id).await,
            Err(AgentError::NotFound(_))
        ));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn missing_part_at_completion_is_conflict() {
        let root = scratch_root();
        let coordinator = UploadCoordinator::new(root.clone()).unwrap();
        let session = coordinator
            .initiate(root.join("y.dat"), 0o644)
            .await
            .unwrap();
        let id = session.upload_id.clone();

        let e1 = put_part(&coordinator, &id, 1, b"only").await;
        let err = coordinator
            .complete(
                &id,
                vec![
                    PartSpec { part_number: 1, etag: e1.etag },
                    PartSpec { part_number: 2, etag: "ffff".to_string() },
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Conflict(_)));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn part_number_bounds_are_enforced() {
        let root = scratch_root();
        let coordinator = UploadCoordinator::new(root.clone()).unwrap();
        let session = coordinator
            .initiate(root.join("z.dat"), 0o644)
            .await
            .unwrap();
        let id = session.upload_id.clone();

        for bad in [0u32, 10001] {
            let mut reader = std::io::Cursor::new(b"data".to_vec());
            let err = coordinator
                .upload_part(&id, bad, &mut reader)
                .await
                .unwrap_err();
            assert!(matches!(err, AgentError::InvalidInput(_)), "part {}", bad);
        }

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn reupload_replaces_part_wholesale() {
        let root = scratch_root();
        let coordinator = UploadCoordinator::new(root.clone()).unwrap();
        let target = root.join("replaced.dat");
        let session = coordinator.initiate(target.clone(), 0o644).await.unwrap();
        let id = session.upload_id.clone();

        let _ = put_part(&coordinator, &id, 1, b"first body").await;
        let second = put_part(&coordinator, &id, 1, b"second").await;
        assert_eq!(second.etag, format!("{:x}", md5::compute(b"second")));
        assert_eq!(second.size, 6);

        let listed = coordinator.list_parts(&id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].etag, second.etag);

        coordinator
            .complete(&id, vec![PartSpec { part_number: 1, etag: second.etag }])
            .await
            .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"second");

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn rehydrate_restores_sessions_from_disk() {
        let root = scratch_root();
        let target = root.join("resumed.dat");
        let (id, e1) = {
            let coordinator = UploadCoordinator::new(root.clone()).unwrap();
            let session = coordinator.initiate(target.clone(), 0o600).await.unwrap();
            let id = session.upload_id.clone();
            let e1 = put_part(&coordinator, &id, 1, b"persisted ").await;
            (id, e1)
        };

        // Fresh coordinator over the same root, as after a crash.
        let coordinator = UploadCoordinator::new(root.clone()).unwrap();
        assert_eq!(coordinator.rehydrate().await.unwrap(), 1);

        let e2 = put_part(&coordinator, &id, 2, b"bytes").await;
        coordinator
            .complete(
                &id,
                vec![
                    PartSpec { part_number: 1, etag: e1.etag },
                    PartSpec { part_number: 2, etag: e2.etag },
                ],
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"persisted bytes");

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn rehydrate_skips_unparseable_directories() {
        let root = scratch_root();
        std::fs::create_dir_all(root.join("not-a-session")).unwrap();
        std::fs::write(root.join("not-a-session/metadata.json"), b"{garbage").unwrap();

        let coordinator = UploadCoordinator::new(root.clone()).unwrap();
        assert_eq!(coordinator.rehydrate().await.unwrap(), 0);
        // The directory is skipped, not deleted.
        assert!(root.join("not-a-session").is_dir());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn cleanup_expired_removes_old_sessions() {
        let root = scratch_root();
        let coordinator = UploadCoordinator::new(root.clone()).unwrap();
        let session = coordinator
            .initiate(root.join("old.dat"), 0o644)
            .await
            .unwrap();
        let id = session.upload_id.clone();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = coordinator.cleanup_expired(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
        assert!(matches!(
            coordinator.get(&id).await,
            Err(AgentError::NotFound(_))
        ));

        let _ = std::fs::remove_dir_all(&root);
    }
}
