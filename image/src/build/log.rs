//! Line-oriented build output.

use tokio::sync::mpsc;

/// Collects build output and forwards it one newline-terminated line at a
/// time. Text without a trailing newline is held until more arrives or the
/// log is flushed.
pub struct BuildLog {
    tx: mpsc::UnboundedSender<String>,
    partial: String,
}

impl BuildLog {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            tx,
            partial: String::new(),
        }
    }

    /// Append raw output.
    pub fn write(&mut self, text: &str) {
        self.partial.push_str(text);
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            self.send(line);
        }
    }

    /// Append one complete line.
    pub fn line(&mut self, line: impl AsRef<str>) {
        self.write(line.as_ref());
        self.write("\n");
    }

    /// Emit any held partial line, newline-terminated.
    pub fn flush(&mut self) {
        if !self.partial.is_empty() {
            let mut line = std::mem::take(&mut self.partial);
            line.push('\n');
            self.send(line);
        }
    }

    fn send(&self, line: String) {
        tracing::debug!(line = line.trim_end(), "build");
        // The reader may have gone away; the build runs to completion anyway.
        let _ = self.tx.send(line);
    }
}

impl Drop for BuildLog {
    fn drop(&mut self) {
        self.flush();
    }
}
