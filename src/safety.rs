//! # Safety Module
//!
//! Protocollo di sicurezza per-file: l'originale non viene mai toccato
//! finché ogni verifica sul nuovo artefatto non è passata.
//!
//! ## Responsabilità:
//! - Macchina a stati con ordine rigido:
//!   Init → HashOriginal → CompressToTemp → VerifyTemp → MoveToFinal →
//!   VerifyFinal → DeleteOriginal → Done
//! - Verifica artefatti: dimensione minima, metadata leggibili, stream
//!   video presente, decodifica spot all'inizio/metà/fine
//! - Hash SHA-256 degli artefatti per rilevare troncamenti
//! - In caso di fallimento: originale intatto, temp rimosso o conservato
//!   secondo configurazione, stadio e motivo registrati
//!
//! DeleteOriginal è raggiungibile solo dopo VerifyFinal: mai riordinato,
//! mai saltato, nemmeno sotto retry.

use crate::config::{Config, SafetySettings};
use crate::error::{CompressError, Result};
use crate::file_manager::FileManager;
use crate::media_tool::{playability_args, stderr_tail, MediaTool};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outputs below this size cannot be a plausible video container
pub const MIN_PLAUSIBLE_BYTES: u64 = 1024;

/// Stages of the per-file safety state machine, in protocol order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SafetyStage {
    Init,
    HashOriginal,
    CompressToTemp,
    VerifyTemp,
    MoveToFinal,
    VerifyFinal,
    DeleteOriginal,
    Done,
}

impl SafetyStage {
    /// The single stage allowed to follow this one
    pub fn successor(&self) -> Option<SafetyStage> {
        match self {
            SafetyStage::Init => Some(SafetyStage::HashOriginal),
            SafetyStage::HashOriginal => Some(SafetyStage::CompressToTemp),
            SafetyStage::CompressToTemp => Some(SafetyStage::VerifyTemp),
            SafetyStage::VerifyTemp => Some(SafetyStage::MoveToFinal),
            SafetyStage::MoveToFinal => Some(SafetyStage::VerifyFinal),
            SafetyStage::VerifyFinal => Some(SafetyStage::DeleteOriginal),
            SafetyStage::DeleteOriginal => Some(SafetyStage::Done),
            SafetyStage::Done => None,
        }
    }

    /// Deletion is configurable, so a record may complete straight from
    /// VerifyFinal. Every other transition follows the strict chain.
    pub fn may_advance_to(&self, next: SafetyStage) -> bool {
        match (self, next) {
            (SafetyStage::VerifyFinal, SafetyStage::Done) => true,
            _ => self.successor() == Some(next),
        }
    }
}

impl fmt::Display for SafetyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SafetyStage::Init => "Init",
            SafetyStage::HashOriginal => "HashOriginal",
            SafetyStage::CompressToTemp => "CompressToTemp",
            SafetyStage::VerifyTemp => "VerifyTemp",
            SafetyStage::MoveToFinal => "MoveToFinal",
            SafetyStage::VerifyFinal => "VerifyFinal",
            SafetyStage::DeleteOriginal => "DeleteOriginal",
            SafetyStage::Done => "Done",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageFailure {
    pub stage: SafetyStage,
    pub reason: String,
}

/// Audit record of one file's trip through the protocol
#[derive(Debug, Clone, Serialize)]
pub struct SafetyRecord {
    pub original: PathBuf,
    pub temp_output: PathBuf,
    pub final_output: PathBuf,
    pub original_hash: Option<String>,
    pub output_hash: Option<String>,
    pub verifications: Vec<String>,
    pub warnings: Vec<String>,
    pub stage: SafetyStage,
    pub history: Vec<SafetyStage>,
    pub failure: Option<StageFailure>,
}

impl SafetyRecord {
    pub fn new(original: &Path, temp_output: &Path, final_output: &Path) -> Self {
        Self {
            original: original.to_path_buf(),
            temp_output: temp_output.to_path_buf(),
            final_output: final_output.to_path_buf(),
            original_hash: None,
            output_hash: None,
            verifications: Vec::new(),
            warnings: Vec::new(),
            stage: SafetyStage::Init,
            history: vec![SafetyStage::Init],
            failure: None,
        }
    }

    /// Move to `next`, rejecting any out-of-order transition
    pub fn advance(&mut self, next: SafetyStage) -> Result<()> {
        if let Some(failure) = &self.failure {
            return Err(CompressError::Verification(format!(
                "record already failed at {}: {}",
                failure.stage, failure.reason
            )));
        }
        if !self.stage.may_advance_to(next) {
            return Err(CompressError::Verification(format!(
                "illegal safety transition {} -> {}",
                self.stage, next
            )));
        }
        self.stage = next;
        self.history.push(next);
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.failure = Some(StageFailure {
            stage: self.stage,
            reason: reason.into(),
        });
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn completed(&self) -> bool {
        self.stage == SafetyStage::Done && self.failure.is_none()
    }
}

/// Drives artifacts through hash, compress, verify, move and delete
pub struct SafetyProtocol {
    tool: MediaTool,
    settings: SafetySettings,
    probe_timeout: Duration,
    playability_timeout: Duration,
}

impl SafetyProtocol {
    pub fn new(tool: MediaTool, config: &Config) -> Self {
        Self {
            tool,
            settings: config.safety.clone(),
            probe_timeout: Duration::from_secs(config.tool.probe_timeout_seconds),
            playability_timeout: Duration::from_secs(config.tool.playability_timeout_seconds),
        }
    }

    /// Run one artifact through the full protocol.
    ///
    /// `compress` must produce `temp_output`. The returned record carries
    /// either a completed history or the failure stage and reason; errors
    /// never escape as bare Err because callers always need the record.
    pub async fn run<F, Fut>(
        &self,
        original: &Path,
        temp_output: &Path,
        final_output: &Path,
        compress: F,
    ) -> SafetyRecord
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut record = SafetyRecord::new(original, temp_output, final_output);
        if let Err(e) = self.drive(&mut record, compress).await {
            warn!("❌ Safety protocol failed at {}: {}", record.stage, e);
            record.fail(e.to_string());
            self.handle_failure(&record).await;
        }
        record
    }

    async fn drive<F, Fut>(&self, record: &mut SafetyRecord, compress: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        record.advance(SafetyStage::HashOriginal)?;
        if self.settings.hash_artifacts {
            let hash = FileManager::hash_file(&record.original).await?;
            debug!("Original SHA-256 {}", hash);
            record.original_hash = Some(hash);
        }

        record.advance(SafetyStage::CompressToTemp)?;
        compress().await?;

        record.advance(SafetyStage::VerifyTemp)?;
        let temp_path = record.temp_output.clone();
        self.verify_artifact(&temp_path, record).await?;
        if self.settings.hash_artifacts {
            // Hash of the NEW artifact, recorded against later truncation.
            // Never compared to the original hash: contents legitimately differ.
            let hash = FileManager::hash_file(&record.temp_output).await?;
            record.output_hash = Some(hash);
        }

        record.advance(SafetyStage::MoveToFinal)?;
        FileManager::move_file(&record.temp_output, &record.final_output).await?;

        record.advance(SafetyStage::VerifyFinal)?;
        let final_path = record.final_output.clone();
        self.verify_artifact(&final_path, record).await?;

        if self.settings.delete_original_after_compression {
            record.advance(SafetyStage::DeleteOriginal)?;
            FileManager::delete_file(&record.original).await?;
            info!("🔒 Original deleted after verification: {}", record.original.display());
        }

        record.advance(SafetyStage::Done)?;
        Ok(())
    }

    /// All integrity checks on one artifact, in escalating cost order.
    /// Passed checks and soft warnings are written into the record.
    async fn verify_artifact(&self, path: &Path, record: &mut SafetyRecord) -> Result<()> {
        let meta = tokio::fs::metadata(path).await.map_err(|_| {
            CompressError::Verification(format!("output missing: {}", path.display()))
        })?;
        if meta.len() < MIN_PLAUSIBLE_BYTES {
            return Err(CompressError::Verification(format!(
                "output is {} bytes, below the {} byte minimum",
                meta.len(),
                MIN_PLAUSIBLE_BYTES
            )));
        }
        record
            .verifications
            .push(format!("size {}", FileManager::format_size(meta.len())));

        if !self.settings.verify_integrity {
            return Ok(());
        }

        let info = self
            .tool
            .probe(path, self.probe_timeout)
            .await
            .map_err(|e| CompressError::Verification(format!("metadata probe failed: {}", e)))?;
        if info.video_streams == 0 {
            return Err(CompressError::Verification(
                "no video stream in output".to_string(),
            ));
        }
        record.verifications.push(format!(
            "{} video stream(s), {:.1}s",
            info.video_streams, info.duration
        ));

        // Spot decode windows: the start must decode, middle and end
        // tolerate soft failures on streams with sparse keyframes
        self.check_playability(path, None, true).await?;
        record.verifications.push("decodes at start".to_string());

        if info.duration > 20.0 {
            let middle = info.duration / 2.0 - 2.5;
            match self.check_playability(path, Some(middle), false).await? {
                true => record.verifications.push("decodes at middle".to_string()),
                false => record
                    .warnings
                    .push(format!("soft decode failure at {:.1}s", middle)),
            }
        }
        if info.duration > 10.0 {
            let end = info.duration - 5.0;
            match self.check_playability(path, Some(end), false).await? {
                true => record.verifications.push("decodes at end".to_string()),
                false => record
                    .warnings
                    .push(format!("soft decode failure at {:.1}s", end)),
            }
        }

        Ok(())
    }

    async fn check_playability(&self, path: &Path, start: Option<f64>, hard: bool) -> Result<bool> {
        let args = playability_args(path, start);
        let output = self.tool.ffmpeg(&args, self.playability_timeout, None).await?;
        if output.success() {
            return Ok(true);
        }

        let position = start.unwrap_or(0.0);
        if hard {
            Err(CompressError::Verification(format!(
                "decode failed at {:.1}s: {}",
                position,
                stderr_tail(&output.stderr)
            )))
        } else {
            warn!("⚠️ Soft playability check failed at {:.1}s", position);
            Ok(false)
        }
    }

    /// The original is never removed here, only partial outputs
    async fn handle_failure(&self, record: &SafetyRecord) {
        if self.settings.keep_failed_artifacts {
            warn!(
                "Keeping failed artifact for inspection: {}",
                record.temp_output.display()
            );
            return;
        }
        for path in [&record.temp_output, &record.final_output] {
            if path == &record.original {
                continue;
            }
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!("Removed partial output {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove {}: {}", path.display(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolSettings;
    use tempfile::TempDir;

    const CHAIN: [SafetyStage; 7] = [
        SafetyStage::HashOriginal,
        SafetyStage::CompressToTemp,
        SafetyStage::VerifyTemp,
        SafetyStage::MoveToFinal,
        SafetyStage::VerifyFinal,
        SafetyStage::DeleteOriginal,
        SafetyStage::Done,
    ];

    fn test_record() -> SafetyRecord {
        SafetyRecord::new(
            Path::new("/videos/movie.mp4"),
            Path::new("/tmp/movie.tmp.mp4"),
            Path::new("/videos/movie_compressed.mp4"),
        )
    }

    fn protocol_with(settings: SafetySettings) -> SafetyProtocol {
        let mut config = Config::default();
        config.safety = settings;
        SafetyProtocol::new(MediaTool::resolve(&ToolSettings::default()), &config)
    }

    fn offline_settings() -> SafetySettings {
        // No ffmpeg in unit tests: size-only verification
        SafetySettings {
            verify_integrity: false,
            ..SafetySettings::default()
        }
    }

    #[test]
    fn test_full_chain_advances_in_order() {
        let mut record = test_record();
        for stage in CHAIN {
            record.advance(stage).unwrap();
        }
        assert!(record.completed());
        assert_eq!(record.history.len(), 8);
        assert_eq!(record.history[0], SafetyStage::Init);
        assert_eq!(record.history[7], SafetyStage::Done);
    }

    #[test]
    fn test_out_of_order_transitions_rejected() {
        let mut record = test_record();
        assert!(record.advance(SafetyStage::VerifyTemp).is_err());
        assert!(record.advance(SafetyStage::Done).is_err());
        assert!(record.advance(SafetyStage::DeleteOriginal).is_err());

        record.advance(SafetyStage::HashOriginal).unwrap();
        // Skipping CompressToTemp is not allowed
        assert!(record.advance(SafetyStage::VerifyTemp).is_err());
    }

    #[test]
    fn test_done_reachable_without_delete() {
        let mut record = test_record();
        for stage in &CHAIN[..5] {
            record.advance(*stage).unwrap();
        }
        assert_eq!(record.stage, SafetyStage::VerifyFinal);
        record.advance(SafetyStage::Done).unwrap();
        assert!(record.completed());
        assert!(!record.history.contains(&SafetyStage::DeleteOriginal));
    }

    #[test]
    fn test_done_not_reachable_from_earlier_stages() {
        let mut record = test_record();
        record.advance(SafetyStage::HashOriginal).unwrap();
        record.advance(SafetyStage::CompressToTemp).unwrap();
        record.advance(SafetyStage::VerifyTemp).unwrap();
        assert!(record.advance(SafetyStage::Done).is_err());
    }

    #[test]
    fn test_failed_record_cannot_advance() {
        let mut record = test_record();
        record.advance(SafetyStage::HashOriginal).unwrap();
        record.fail("disk on fire");

        let err = record.advance(SafetyStage::CompressToTemp).unwrap_err();
        assert!(err.to_string().contains("disk on fire"));
        assert_eq!(record.failure.as_ref().unwrap().stage, SafetyStage::HashOriginal);
    }

    #[test]
    fn test_delete_requires_every_verification_before_it() {
        // Inject a failure at each stage: DeleteOriginal must appear in
        // history only when all five predecessors preceded it in order
        for fail_after in 0..CHAIN.len() {
            let mut record = test_record();
            for stage in &CHAIN[..fail_after] {
                record.advance(*stage).unwrap();
            }
            record.fail("injected");

            let deleted = record.history.contains(&SafetyStage::DeleteOriginal);
            let expected = fail_after >= 6;
            assert_eq!(deleted, expected, "failure after {} stages", fail_after);
            if deleted {
                let expected_order = [
                    SafetyStage::Init,
                    SafetyStage::HashOriginal,
                    SafetyStage::CompressToTemp,
                    SafetyStage::VerifyTemp,
                    SafetyStage::MoveToFinal,
                    SafetyStage::VerifyFinal,
                    SafetyStage::DeleteOriginal,
                ];
                assert_eq!(&record.history[..7], &expected_order);
            }
        }
    }

    #[tokio::test]
    async fn test_protocol_happy_path_deletes_original() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("movie.mp4");
        let temp = dir.path().join("movie.tmp.mp4");
        let final_out = dir.path().join("movie_compressed.mp4");
        tokio::fs::write(&original, vec![7u8; 4096]).await.unwrap();

        let protocol = protocol_with(offline_settings());
        let temp_clone = temp.clone();
        let record = protocol
            .run(&original, &temp, &final_out, || async move {
                tokio::fs::write(&temp_clone, vec![1u8; 2048]).await?;
                Ok(())
            })
            .await;

        assert!(record.completed(), "failure: {:?}", record.failure);
        assert!(record.history.contains(&SafetyStage::DeleteOriginal));
        assert!(!original.exists());
        assert!(final_out.exists());
        assert!(!temp.exists());
        assert_eq!(record.original_hash.as_ref().unwrap().len(), 64);
        assert_eq!(record.output_hash.as_ref().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_protocol_preserves_original_when_delete_disabled() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("movie.mp4");
        let temp = dir.path().join("movie.tmp.mp4");
        let final_out = dir.path().join("movie_compressed.mp4");
        tokio::fs::write(&original, vec![7u8; 4096]).await.unwrap();

        let mut settings = offline_settings();
        settings.delete_original_after_compression = false;
        let protocol = protocol_with(settings);

        let temp_clone = temp.clone();
        let record = protocol
            .run(&original, &temp, &final_out, || async move {
                tokio::fs::write(&temp_clone, vec![1u8; 2048]).await?;
                Ok(())
            })
            .await;

        assert!(record.completed());
        assert!(!record.history.contains(&SafetyStage::DeleteOriginal));
        assert!(original.exists());
        assert!(final_out.exists());
    }

    #[tokio::test]
    async fn test_protocol_compress_failure_keeps_original() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("movie.mp4");
        let temp = dir.path().join("movie.tmp.mp4");
        let final_out = dir.path().join("movie_compressed.mp4");
        tokio::fs::write(&original, vec![7u8; 4096]).await.unwrap();

        let protocol = protocol_with(offline_settings());
        let record = protocol
            .run(&original, &temp, &final_out, || async {
                Err(CompressError::Tool {
                    tool: "ffmpeg".to_string(),
                    message: "encoder exploded".to_string(),
                })
            })
            .await;

        assert!(record.is_failed());
        assert_eq!(
            record.failure.as_ref().unwrap().stage,
            SafetyStage::CompressToTemp
        );
        assert!(original.exists());
        assert!(!final_out.exists());
    }

    #[tokio::test]
    async fn test_protocol_rejects_undersized_artifact() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("movie.mp4");
        let temp = dir.path().join("movie.tmp.mp4");
        let final_out = dir.path().join("movie_compressed.mp4");
        tokio::fs::write(&original, vec![7u8; 4096]).await.unwrap();

        let protocol = protocol_with(offline_settings());
        let temp_clone = temp.clone();
        let record = protocol
            .run(&original, &temp, &final_out, || async move {
                // Truncated output, below the plausibility floor
                tokio::fs::write(&temp_clone, vec![1u8; 100]).await?;
                Ok(())
            })
            .await;

        assert!(record.is_failed());
        assert_eq!(record.failure.as_ref().unwrap().stage, SafetyStage::VerifyTemp);
        assert!(record
            .failure
            .as_ref()
            .unwrap()
            .reason
            .contains("below the 1024 byte minimum"));
        assert!(original.exists());
        // Failed temp cleaned up by default
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_protocol_keeps_failed_artifact_when_configured() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("movie.mp4");
        let temp = dir.path().join("movie.tmp.mp4");
        let final_out = dir.path().join("movie_compressed.mp4");
        tokio::fs::write(&original, vec![7u8; 4096]).await.unwrap();

        let mut settings = offline_settings();
        settings.keep_failed_artifacts = true;
        let protocol = protocol_with(settings);

        let temp_clone = temp.clone();
        let record = protocol
            .run(&original, &temp, &final_out, || async move {
                tokio::fs::write(&temp_clone, vec![1u8; 100]).await?;
                Ok(())
            })
            .await;

        assert!(record.is_failed());
        assert!(temp.exists());
        assert!(original.exists());
    }
}
