//! # File Management Module
//!
//! Questo modulo gestisce tutte le operazioni sui file e la discovery dei video.
//!
//! ## Responsabilità:
//! - Discovery ricorsiva di file video in directory
//! - Query di dimensione, esistenza e spazio libero su disco
//! - Hashing SHA-256 a chunk con memoria limitata
//! - Spostamento "atomic-enough" (rename, fallback copy+delete)
//! - Utilità per calcoli dimensioni e percentuali
//!
//! ## Formati supportati:
//! - **Video**: MP4, MKV, AVI, MOV, WebM, M4V, TS, FLV
//!
//! ## Sicurezza operazioni:
//! - Nessuna cancellazione implicita: i caller decidono quando distruggere
//! - Lo spostamento preferisce rename (stesso filesystem); il fallback
//!   copia e rimuove solo dopo una copia riuscita
//!
//! ## Utilità:
//! - `format_size()`: Converte bytes in formato leggibile (KB, MB, GB)
//! - `calculate_reduction()`: Calcola percentuale di riduzione
//!
//! ## Esempio:
//! ```rust,no_run
//! # use safe_video_compressor::file_manager::FileManager;
//! # async fn run() -> safe_video_compressor::error::Result<()> {
//! let files = FileManager::find_video_files(std::path::Path::new("/path/to/media"))?;
//! let hash = FileManager::hash_file(&files[0]).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::debug;
use walkdir::WalkDir;

/// Chunk size for bounded-memory hashing
const HASH_CHUNK_SIZE: usize = 8192;

/// Manages file operations and discovery
pub struct FileManager;

impl FileManager {
    /// Get the size of a file in bytes
    pub async fn file_size(path: &Path) -> Result<u64> {
        let metadata = fs::metadata(path).await?;
        Ok(metadata.len())
    }

    /// Find all supported video files in a directory
    pub fn find_video_files(media_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        for entry in WalkDir::new(media_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            if Self::is_video(path) {
                files.push(path.to_path_buf());
            }
        }

        files.sort();
        Ok(files)
    }

    /// Check if a file is a video
    pub fn is_video(path: &Path) -> bool {
        if let Some(ext) = path.extension() {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            matches!(
                ext_lower.as_str(),
                "mp4" | "mkv" | "avi" | "mov" | "webm" | "m4v" | "ts" | "flv"
            )
        } else {
            false
        }
    }

    /// SHA-256 of a file, streamed in fixed-size chunks
    pub async fn hash_file(path: &Path) -> Result<String> {
        let mut file = fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; HASH_CHUNK_SIZE];

        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// Available disk space in bytes for the filesystem containing `path`.
    ///
    /// Returns None when no mounted filesystem covers the path; callers
    /// treat that as "unknown" and log rather than abort.
    pub fn available_space(path: &Path) -> Option<u64> {
        let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        let mounts = disks
            .list()
            .iter()
            .map(|disk| (disk.mount_point().to_path_buf(), disk.available_space()));

        let available = best_mount_available(&resolved, mounts);
        if let Some(bytes) = available {
            debug!(
                "{} free on the filesystem holding {}",
                Self::format_size(bytes),
                resolved.display()
            );
        }
        available
    }

    /// Move a file, preferring rename and falling back to copy+delete
    /// across filesystems
    pub async fn move_file(source: &Path, destination: &Path) -> Result<()> {
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
            }
        }

        match fs::rename(source, destination).await {
            Ok(()) => Ok(()),
            Err(_) => {
                // Cross-device move: copy then remove the source
                fs::copy(source, destination).await?;
                fs::remove_file(source).await?;
                Ok(())
            }
        }
    }

    /// Delete a file, logging the removal
    pub async fn delete_file(path: &Path) -> Result<()> {
        debug!("Removing {}", path.display());
        fs::remove_file(path).await?;
        Ok(())
    }

    /// Get human-readable file size
    pub fn format_size(size: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = size as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        if unit_index == 0 {
            format!("{} {}", size as u64, UNITS[unit_index])
        } else {
            format!("{:.2} {}", size, UNITS[unit_index])
        }
    }

    /// Calculate percentage reduction
    pub fn calculate_reduction(original_size: u64, new_size: u64) -> f64 {
        if original_size == 0 {
            0.0
        } else {
            ((original_size as f64 - new_size as f64) / original_size as f64) * 100.0
        }
    }
}

/// Free bytes of the most specific mount covering `path`.
///
/// Matching is by path component, so a mount point containing spaces
/// (network shares) never claims a sibling path that merely shares a
/// string prefix. The deepest matching mount wins.
fn best_mount_available<I>(path: &Path, mounts: I) -> Option<u64>
where
    I: IntoIterator<Item = (PathBuf, u64)>,
{
    let mut best: Option<(usize, u64)> = None;
    for (mount, available) in mounts {
        if !path.starts_with(&mount) {
            continue;
        }
        let depth = mount.components().count();
        if best.map_or(true, |(best_depth, _)| depth > best_depth) {
            best = Some((depth, available));
        }
    }
    best.map(|(_, available)| available)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_is_video() {
        assert!(FileManager::is_video(Path::new("movie.mp4")));
        assert!(FileManager::is_video(Path::new("movie.MKV")));
        assert!(!FileManager::is_video(Path::new("photo.jpg")));
        assert!(!FileManager::is_video(Path::new("noext")));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(FileManager::format_size(512), "512 B");
        assert_eq!(FileManager::format_size(2048), "2.00 KB");
        assert_eq!(FileManager::format_size(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_calculate_reduction() {
        assert_eq!(FileManager::calculate_reduction(1000, 600), 40.0);
        assert_eq!(FileManager::calculate_reduction(0, 600), 0.0);
    }

    #[test]
    fn test_best_mount_prefers_most_specific() {
        let mounts = vec![
            (PathBuf::from("/"), 100),
            (PathBuf::from("/mnt"), 200),
            (PathBuf::from("/mnt/media"), 300),
        ];
        assert_eq!(
            best_mount_available(Path::new("/mnt/media/movies/a.mkv"), mounts.clone()),
            Some(300)
        );
        assert_eq!(
            best_mount_available(Path::new("/home/user/a.mkv"), mounts),
            Some(100)
        );
    }

    #[test]
    fn test_best_mount_matches_whole_components_only() {
        // Network shares routinely mount with spaces in the name; a
        // mount must not claim paths that merely share a string prefix
        let mounts = vec![
            (PathBuf::from("/"), 100),
            (PathBuf::from("/mnt/nas"), 200),
            (PathBuf::from("/mnt/nas share"), 300),
        ];
        assert_eq!(
            best_mount_available(Path::new("/mnt/nas share/videos/a.mkv"), mounts.clone()),
            Some(300)
        );
        assert_eq!(
            best_mount_available(Path::new("/mnt/nas/videos/a.mkv"), mounts),
            Some(200)
        );
    }

    #[test]
    fn test_best_mount_none_without_match() {
        let mounts = vec![(PathBuf::from("/mnt"), 200)];
        assert_eq!(best_mount_available(Path::new("/srv/x.mkv"), mounts), None);
    }

    #[tokio::test]
    async fn test_hash_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let hash = FileManager::hash_file(&path).await.unwrap();
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn test_move_file() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("a.mp4");
        let destination = temp_dir.path().join("sub").join("b.mp4");
        tokio::fs::write(&source, b"segment data").await.unwrap();

        FileManager::move_file(&source, &destination).await.unwrap();

        assert!(!source.exists());
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), b"segment data");
    }

    #[test]
    fn test_find_video_files() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("a.mp4"), b"x").unwrap();
        std::fs::write(temp_dir.path().join("b.txt"), b"x").unwrap();
        std::fs::create_dir(temp_dir.path().join("nested")).unwrap();
        std::fs::write(temp_dir.path().join("nested").join("c.mkv"), b"x").unwrap();

        let files = FileManager::find_video_files(temp_dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| FileManager::is_video(f)));
    }
}
