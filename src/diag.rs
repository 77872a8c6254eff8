//! Diagnostic sink capability
//!
//! External front ends (console dashboards, UIs) only need a stream of
//! notable-event lines. Components receive a `DiagSink` at construction and
//! publish through it; the default sink forwards to the `log` crate.

use std::sync::Arc;

/// A shared "publish one diagnostic line" capability
#[derive(Clone)]
pub struct DiagSink {
    inner: Arc<dyn Fn(&str) + Send + Sync>,
}

impl DiagSink {
    pub fn new(publish: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(publish),
        }
    }

    /// Sink that forwards lines to `log::info!`
    pub fn to_log() -> Self {
        Self::new(|line| log::info!("{}", line))
    }

    pub fn publish(&self, line: impl AsRef<str>) {
        (self.inner)(line.as_ref());
    }
}

impl Default for DiagSink {
    fn default() -> Self {
        Self::to_log()
    }
}

impl std::fmt::Debug for DiagSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DiagSink")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_sink_captures_lines() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        let sink = DiagSink::new(move |line| captured.lock().unwrap().push(line.to_string()));

        sink.publish("peer banned: 1.2.3.4");
        sink.publish(format!("height {}", 42));

        let lines = lines.lock().unwrap();
        assert_eq!(lines.as_slice(), ["peer banned: 1.2.3.4", "height 42"]);
    }
}
