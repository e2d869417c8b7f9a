//! User-facing diagnostics.
//!
//! Compile problems and runtime gaps are reported here rather than returned
//! as errors. A [`DiagnosticScope`] collects messages for one compilation;
//! the [`DiagnosticsHub`] is the process-wide sink that logs, deduplicates
//! runtime messages per executor generation and fans out to subscribers.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use rustc_hash::FxHashSet;

use crate::graph::id::NodeKey;
use crate::sync::lock;

/// Maximum number of diagnostics kept for [`DiagnosticsHub::recent`].
pub const DIAGNOSTIC_HISTORY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub node: Option<NodeKey>,
    pub pin: Option<Arc<str>>,
    pub timestamp: DateTime<Utc>,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            node: None,
            pin: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn with_node(mut self, node: NodeKey) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_pin(mut self, pin: impl Into<Arc<str>>) -> Self {
        self.pin = Some(pin.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    fn log(&self) {
        match self.severity {
            Severity::Error => tracing::error!(node = ?self.node, pin = ?self.pin, "{}", self.message),
            Severity::Warning => tracing::warn!(node = ?self.node, pin = ?self.pin, "{}", self.message),
            Severity::Info => tracing::info!(node = ?self.node, pin = ?self.pin, "{}", self.message),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.severity)?;
        if let Some(node) = &self.node {
            write!(f, " {node}")?;
            if let Some(pin) = &self.pin {
                write!(f, ".{pin}")?;
            }
        }
        write!(f, ": {}", self.message)
    }
}

// ── DiagnosticScope ──────────────────────────────────────────────────

/// Messages collected during one compilation.
#[derive(Debug, Default, Clone)]
pub struct DiagnosticScope {
    messages: Vec<Diagnostic>,
    errors: usize,
}

impl DiagnosticScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        if diagnostic.is_error() {
            self.errors += 1;
        }
        self.messages.push(diagnostic);
    }

    pub fn error(&mut self, node: &NodeKey, message: impl Into<String>) {
        self.push(Diagnostic::error(message).with_node(node.clone()));
    }

    pub fn pin_error(&mut self, node: &NodeKey, pin: &str, message: impl Into<String>) {
        self.push(Diagnostic::error(message).with_node(node.clone()).with_pin(pin));
    }

    pub fn warning(&mut self, node: &NodeKey, message: impl Into<String>) {
        self.push(Diagnostic::warning(message).with_node(node.clone()));
    }

    pub fn extend(&mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        for d in diagnostics {
            self.push(d);
        }
    }

    pub fn has_error(&self) -> bool {
        self.errors > 0
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    pub fn messages(&self) -> &[Diagnostic] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Diagnostic> {
        self.messages
    }
}

// ── DiagnosticsHub ───────────────────────────────────────────────────

type DedupeKey = (u64, Option<NodeKey>, Option<Arc<str>>, String);

/// Process-wide diagnostic sink.
#[derive(Default)]
pub struct DiagnosticsHub {
    seen: Mutex<FxHashSet<DedupeKey>>,
    history: Mutex<VecDeque<Diagnostic>>,
    subscribers: Mutex<Vec<Sender<Diagnostic>>>,
}

impl DiagnosticsHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log, record and forward a diagnostic.
    pub fn report(&self, diagnostic: Diagnostic) {
        diagnostic.log();

        {
            let mut history = lock(&self.history);
            if history.len() == DIAGNOSTIC_HISTORY {
                history.pop_front();
            }
            history.push_back(diagnostic.clone());
        }

        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| tx.send(diagnostic.clone()).is_ok());
    }

    /// Report unless an identical message was already reported for this
    /// generation. Runtime errors repeat on every query; this keeps one.
    pub fn report_once(&self, generation: u64, diagnostic: Diagnostic) -> bool {
        let key = (
            generation,
            diagnostic.node.clone(),
            diagnostic.pin.clone(),
            diagnostic.message.clone(),
        );
        if !lock(&self.seen).insert(key) {
            return false;
        }
        self.report(diagnostic);
        true
    }

    pub fn report_all(&self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        for d in diagnostics {
            self.report(d);
        }
    }

    /// Forget dedupe state of a retired generation.
    pub fn clear_generation(&self, generation: u64) {
        lock(&self.seen).retain(|(g, ..)| *g != generation);
    }

    pub fn subscribe(&self) -> Receiver<Diagnostic> {
        let (tx, rx) = crossbeam_channel::unbounded();
        lock(&self.subscribers).push(tx);
        rx
    }

    pub fn recent(&self) -> Vec<Diagnostic> {
        lock(&self.history).iter().cloned().collect()
    }

    pub fn error_count(&self) -> usize {
        lock(&self.history).iter().filter(|d| d.is_error()).count()
    }
}

impl fmt::Debug for DiagnosticsHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticsHub")
            .field("history", &lock(&self.history).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::id::GraphId;

    #[test]
    fn test_scope_counts_errors() {
        let key = NodeKey::new(GraphId(1), "A");
        let mut scope = DiagnosticScope::new();
        scope.warning(&key, "careful");
        assert!(!scope.has_error());
        scope.pin_error(&key, "In", "broken");
        assert!(scope.has_error());
        assert_eq!(scope.error_count(), 1);
        assert_eq!(scope.messages().len(), 2);
        assert_eq!(scope.messages()[1].to_string(), "[error] 1/A.In: broken");
    }

    #[test]
    fn test_report_once_per_generation() {
        let hub = DiagnosticsHub::new();
        let rx = hub.subscribe();
        let d = Diagnostic::error("Division failed").with_node(NodeKey::new(GraphId(0), "Div"));

        assert!(hub.report_once(1, d.clone()));
        assert!(!hub.report_once(1, d.clone()));
        assert!(hub.report_once(2, d.clone()));
        assert_eq!(rx.try_iter().count(), 2);

        hub.clear_generation(1);
        assert!(hub.report_once(1, d));
    }

    #[test]
    fn test_history_is_bounded() {
        let hub = DiagnosticsHub::new();
        for i in 0..DIAGNOSTIC_HISTORY + 10 {
            hub.report(Diagnostic::info(format!("m{i}")));
        }
        let recent = hub.recent();
        assert_eq!(recent.len(), DIAGNOSTIC_HISTORY);
        assert_eq!(recent[0].message, "m10");
    }
}
