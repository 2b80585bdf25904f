//! # Error Types Module
//!
//! Questo modulo definisce tutti i tipi di errore custom dell'applicazione.
//!
//! ## Responsabilità:
//! - Definisce `CompressError` enum per categorizzare tutti gli errori possibili
//! - Fornisce messaggi di errore descrittivi e strutturati
//! - Integra con `thiserror` per automatic error conversion
//! - Distingue errori fatali, errori per-file e errori ritentabili
//!
//! ## Categorie di errori:
//! - `Io`: Errori di I/O (file non trovati, permessi, etc.)
//! - `Config`: Combinazione di parametri non valida (fatale, prima di ogni file)
//! - `Resource`: Spazio disco insufficiente o sorgente non leggibile (fatale per-file)
//! - `Tool`: Processo esterno terminato con exit code non-zero (ritentabile)
//! - `Timeout`: Processo esterno oltre il timeout, terminato forzatamente (ritentabile)
//! - `Verification`: Verifica di integrità/riproducibilità fallita (originale preservato)
//! - `Dependency`: Tool esterno mancante (ffmpeg, ffprobe)
//! - `Cancelled`: Operazione annullata dall'utente
//!
//! Le derive di consistenza (size drift su split/merge) NON sono errori:
//! viaggiano come warning nei risultati.
//!
//! ## Esempio:
//! ```rust
//! # use safe_video_compressor::CompressError;
//! # fn check(tool_exists: bool) -> Result<(), CompressError> {
//! if !tool_exists {
//!     return Err(CompressError::Dependency("ffmpeg".to_string()));
//! }
//! # Ok(())
//! # }
//! ```

/// Custom error types for the compression pipeline
#[derive(thiserror::Error, Debug)]
pub enum CompressError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },

    #[error("{tool} timed out after {seconds}s")]
    Timeout { tool: String, seconds: u64 },

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Dependency missing: {0}")]
    Dependency(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CompressError {
    /// True for failures worth another attempt (tool exit / timeout).
    pub fn is_retryable(&self) -> bool {
        matches!(self, CompressError::Tool { .. } | CompressError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, CompressError>;
