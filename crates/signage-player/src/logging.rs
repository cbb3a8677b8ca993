use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const RECENT_CAPACITY: usize = 50;

/// Ring of the most recent WARN / ERROR lines, shown by `/api/status`.
#[derive(Clone, Default)]
pub struct RecentLog {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl RecentLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        if lines.len() == RECENT_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// Tracing layer that copies WARN and ERROR events into a `RecentLog`.
pub struct RecentLogLayer {
    recent: RecentLog,
}

impl RecentLogLayer {
    pub fn new(recent: RecentLog) -> Self {
        Self { recent }
    }
}

impl<S> tracing_subscriber::Layer<S> for RecentLogLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);
        self.recent.push(message);
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

/// Install the global subscriber: file log in `data_dir`, stderr, and the
/// recent-warnings ring.  Returns the log file path.
pub fn init(data_dir: &Path, recent: RecentLog) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(data_dir)?;
    let log_path = data_dir.join("player.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(RecentLogLayer::new(recent))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,signage_player=debug")),
        )
        .init();

    Ok(log_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_warnings_and_errors_are_kept() {
        let recent = RecentLog::new();
        let subscriber = tracing_subscriber::registry().with(RecentLogLayer::new(recent.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("hello");
            tracing::warn!(item = "a", "skipping item");
            tracing::error!("feed gone");
        });
        let lines = recent.snapshot();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[WARN] skipping item"), "{}", lines[0]);
        assert!(lines[0].contains("item=\"a\""), "{}", lines[0]);
        assert!(lines[1].contains("[ERROR] feed gone"));
    }

    #[test]
    fn test_ring_is_bounded() {
        let recent = RecentLog::new();
        for i in 0..(RECENT_CAPACITY + 5) {
            recent.push(i.to_string());
        }
        let lines = recent.snapshot();
        assert_eq!(lines.len(), RECENT_CAPACITY);
        assert_eq!(lines[0], "5");
    }
}
