use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

/// Write-only side channel that appends the encoded Annex-B stream to a file.
///
/// The first I/O error disables the dump for the rest of the session.
pub struct BitstreamDump {
    path:   PathBuf,
    writer: Option<BufWriter<File>>,
}

impl BitstreamDump {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!("Saving encoded video to {}", path.display());
        Ok(Self { path: path.to_path_buf(), writer: Some(BufWriter::new(file)) })
    }

    pub fn is_active(&self) -> bool {
        self.writer.is_some()
    }

    pub fn write(&mut self, data: &[u8]) {
        let Some(writer) = self.writer.as_mut() else { return };
        if let Err(e) = writer.write_all(data) {
            warn!("Encoded dump {} failed, disabling: {}", self.path.display(), e);
            self.writer = None;
        }
    }

    pub fn flush(&mut self) {
        let Some(writer) = self.writer.as_mut() else { return };
        if let Err(e) = writer.flush() {
            warn!("Encoded dump {} flush failed: {}", self.path.display(), e);
            self.writer = None;
        }
    }
}

impl Drop for BitstreamDump {
    fn drop(&mut self) {
        self.flush();
    }
}
