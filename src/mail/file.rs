//! File-backed mailboxes: `<dir>/<rig>/<role>.jsonl`, one message per line.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{MailError, Message, Notifier, Result};
use crate::persistence::{PersistError, fsync_file};

#[derive(Debug, Clone)]
pub struct FileMailbox {
    dir: PathBuf,
}

impl FileMailbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileMailbox { dir: dir.into() }
    }

    /// Mailbox file for an address like `gastown/witness`.
    pub fn mailbox_path(&self, address: &str) -> Result<PathBuf> {
        let valid = |part: &str| {
            !part.is_empty()
                && part != "."
                && part != ".."
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        match address.split_once('/') {
            Some((rig, role)) if valid(rig) && valid(role) => {
                Ok(self.dir.join(rig).join(format!("{role}.jsonl")))
            }
            _ => Err(MailError::InvalidRecipient(address.to_string())),
        }
    }

    /// Reads every message delivered to `address`, oldest first.
    ///
    /// A trailing partial line (from a crash mid-append) is ignored.
    pub fn read(&self, address: &str) -> Result<Vec<Message>> {
        let path = self.mailbox_path(address)?;
        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut messages = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            match serde_json::from_str(&line) {
                Ok(msg) => messages.push(msg),
                Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable mailbox line"),
            }
        }
        Ok(messages)
    }

    fn append(&self, path: &Path, line: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        fsync_file(&file)?;
        Ok(())
    }
}

impl Notifier for FileMailbox {
    fn send(&self, message: &Message) -> Result<()> {
        let path = self.mailbox_path(&message.to)?;
        let line = serde_json::to_string(message).map_err(PersistError::from)?;
        self.append(&path, &line)?;
        debug!(to = %message.to, subject = %message.subject, "delivered mail");
        Ok(())
    }
}
