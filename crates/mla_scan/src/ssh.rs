//! SSH/SFTP access to remote database hosts
//!
//! One connection per source per scan: connect, authenticate, open the
//! SFTP subsystem, list and stream log files, disconnect.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mla_config::SourceConfig;
use russh::client;
use russh_sftp::client::SftpSession;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// SSH-specific errors
#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed to {host}: {reason}")]
    ConnectionFailed { host: String, reason: String },

    #[error("Authentication failed for {user}@{host}")]
    AuthFailed { user: String, host: String },

    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("No credentials configured for {0}")]
    NoCredentials(String),

    #[error("Key loading failed: {0}")]
    KeyError(String),

    #[error("SFTP error: {0}")]
    SftpError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Russh error: {0}")]
    RusshError(#[from] russh::Error),
}

/// One remote directory entry, as the scanner sees it.
#[derive(Debug, Clone)]
pub struct RemoteFileEntry {
    /// Bare file name (no directory component)
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Remote modification time
    pub modified: DateTime<Utc>,
    pub is_file: bool,
}

/// SSH client handler for russh
struct SshHandler;

#[async_trait]
impl client::Handler for SshHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all server keys (equivalent to StrictHostKeyChecking=accept-new)
        Ok(true)
    }
}

/// An authenticated SSH session with the SFTP subsystem open.
pub struct SftpConnection {
    handle: client::Handle<SshHandler>,
    sftp: SftpSession,
    host: String,
}

impl SftpConnection {
    /// Connect and authenticate against one configured source.
    ///
    /// Tries the configured private key first, falling back to the password
    /// when no key path is set.
    ///
    /// # Errors
    ///
    /// Returns [`SshError`] on connection, authentication, or SFTP subsystem
    /// failure.
    #[instrument(skip(source), fields(host = %source.host, user = %source.user))]
    pub async fn connect(
        source: &SourceConfig,
        connect_timeout: Duration,
    ) -> Result<Self, SshError> {
        debug!(port = source.port, "Connecting to SSH host");

        let config = client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let addr = format!("{}:{}", source.host, source.port);

        let mut handle = match tokio::time::timeout(
            connect_timeout,
            client::connect(Arc::new(config), &addr, SshHandler),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                return Err(SshError::ConnectionFailed {
                    host: source.host.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => return Err(SshError::Timeout(connect_timeout)),
        };

        // Past this point the transport is live, so every failure must
        // disconnect before it surfaces.
        if let Err(e) = Self::authenticate(&mut handle, source).await {
            Self::drop_handle(handle, &source.host).await;
            return Err(e);
        }

        let sftp = match Self::open_sftp(&handle).await {
            Ok(sftp) => sftp,
            Err(e) => {
                Self::drop_handle(handle, &source.host).await;
                return Err(e);
            }
        };

        debug!("SFTP subsystem ready");

        Ok(Self {
            handle,
            sftp,
            host: source.host.clone(),
        })
    }

    /// Key auth when a key path is configured, password otherwise.
    async fn authenticate(
        handle: &mut client::Handle<SshHandler>,
        source: &SourceConfig,
    ) -> Result<(), SshError> {
        let authenticated = if let Some(key_path) = &source.key_path {
            let secret_key = russh_keys::load_secret_key(key_path, None).map_err(|e| {
                SshError::KeyError(format!("Failed to load key {}: {e}", key_path.display()))
            })?;
            handle
                .authenticate_publickey(&source.user, Arc::new(secret_key))
                .await?
        } else if let Some(password) = &source.password {
            handle
                .authenticate_password(&source.user, password)
                .await?
        } else {
            return Err(SshError::NoCredentials(source.host.clone()));
        };

        if !authenticated {
            return Err(SshError::AuthFailed {
                user: source.user.clone(),
                host: source.host.clone(),
            });
        }
        Ok(())
    }

    async fn open_sftp(handle: &client::Handle<SshHandler>) -> Result<SftpSession, SshError> {
        let channel = handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::SftpError(e.to_string()))
    }

    /// Best-effort disconnect for a session that never became a connection.
    async fn drop_handle(handle: client::Handle<SshHandler>, host: &str) {
        if let Err(e) = handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(host = %host, error = %e, "SSH disconnect failed");
        }
    }

    /// List regular files in `dir` whose names end with `suffix`
    /// (case-insensitive). Entries with unreadable modification times sort
    /// as the epoch rather than failing the listing.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::SftpError`] if the directory cannot be read.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn list_log_files(
        &self,
        dir: &str,
        suffix: &str,
    ) -> Result<Vec<RemoteFileEntry>, SshError> {
        let read_dir = self
            .sftp
            .read_dir(dir)
            .await
            .map_err(|e| SshError::SftpError(format!("read_dir {dir}: {e}")))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if !matches_suffix(&name, suffix) {
                continue;
            }
            let metadata = entry.metadata();
            let modified = match metadata.modified() {
                Ok(time) => DateTime::<Utc>::from(time),
                Err(e) => {
                    warn!(file = %name, error = %e, "Unreadable mtime, treating as epoch");
                    DateTime::UNIX_EPOCH
                }
            };
            entries.push(RemoteFileEntry {
                name,
                size: metadata.len(),
                modified,
                is_file: !metadata.is_dir(),
            });
        }

        debug!(dir = %dir, count = entries.len(), "Listed remote log files");
        Ok(entries)
    }

    /// Open a remote file for streaming reads.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::SftpError`] if the file cannot be opened.
    pub async fn open_file(&self, path: &str) -> Result<russh_sftp::client::fs::File, SshError> {
        self.sftp
            .open(path)
            .await
            .map_err(|e| SshError::SftpError(format!("open {path}: {e}")))
    }

    /// Tear down the SFTP session and the SSH connection. Errors during
    /// shutdown are logged, not surfaced.
    pub async fn close(self) {
        if let Err(e) = self.sftp.close().await {
            debug!(host = %self.host, error = %e, "SFTP close failed");
        }
        Self::drop_handle(self.handle, &self.host).await;
    }
}

/// Case-insensitive suffix match on a remote file name
#[must_use]
pub fn matches_suffix(name: &str, suffix: &str) -> bool {
    name.to_ascii_lowercase()
        .ends_with(&suffix.to_ascii_lowercase())
}

/// Join a remote directory and file name with a single slash
#[must_use]
pub fn join_remote_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}
