//! Tracing layer that appends events to `<data_dir>/logs/cybercall.log`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Flattens an event into `message, key = value, ...`.
#[derive(Default)]
struct LineVisitor {
    line: String,
}

impl LineVisitor {
    fn push(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            if self.line.is_empty() {
                self.line = value;
            } else {
                self.line = format!("{value}, {}", self.line);
            }
        } else if self.line.is_empty() {
            self.line = format!("{} = {}", field.name(), value);
        } else {
            self.line.push_str(&format!(", {} = {}", field.name(), value));
        }
    }
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.push(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, value.to_string());
    }
}

fn level_str(level: Level) -> &'static str {
    match level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARN",
        Level::INFO => "INFO",
        Level::DEBUG => "DEBUG",
        Level::TRACE => "TRACE",
    }
}

/// Writes `[ISO-8601] LEVEL target: message` lines.
pub struct FileLogLayer {
    writer: Arc<Mutex<File>>,
}

impl FileLogLayer {
    /// Appends to `path`, creating parent directories as needed.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(file)),
        })
    }
}

fn format_line(level: Level, target: &str, message: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z");
    if message.is_empty() {
        format!("[{timestamp}] {} {target}\n", level_str(level))
    } else {
        format!("[{timestamp}] {} {target}: {message}\n", level_str(level))
    }
}

impl<S: Subscriber> Layer<S> for FileLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let line = format_line(*meta.level(), meta.target(), &visitor.line);
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.write_all(line.as_bytes());
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn writes_structured_lines() {
        let dir = std::env::temp_dir().join("cybercall_test_file_log");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("logs").join("test.log");

        let layer = FileLogLayer::new(&path).unwrap();
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(event = "link_closed", code = 1006, "Signaling link dropped");
        });

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with('['));
        assert!(text.contains(" WARN "));
        assert!(text.contains("Signaling link dropped, event = link_closed, code = 1006"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
