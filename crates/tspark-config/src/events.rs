// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tokio::sync::broadcast;

/// Domain events published when workspace state changes.
/// Front-ends subscribe to these to refresh their views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceEvent {
    /// The installed-provider map changed (install/uninstall/credentials)
    ProvidersChanged,
    /// A tool-server config was saved or deleted
    ToolsChanged,
    /// A rule was created, updated or deleted
    RulesChanged,
    /// A reference was created, updated or deleted
    ReferencesChanged,
    /// A workspace setting changed
    SettingsChanged,
    /// The system prompt text changed
    SystemPromptChanged,
}

/// Broadcast bus for [`WorkspaceEvent`]s.
///
/// One bus per workspace, shared by the config store and the fragment
/// stores. `subscribe` returns a receiver that doubles as the unsubscribe
/// handle: dropping it detaches the subscriber.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkspaceEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        // Slow subscribers drop the oldest events past this depth; events
        // are refresh hints, not a durable log.
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A bus with no subscribers swallows it.
    pub fn emit(&self, event: WorkspaceEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(WorkspaceEvent::RulesChanged);
        assert_eq!(rx.recv().await.unwrap(), WorkspaceEvent::RulesChanged);
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(WorkspaceEvent::SettingsChanged);
    }

    #[tokio::test]
    async fn dropped_receiver_stops_receiving() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        // No receiver left; emit must still succeed silently.
        bus.emit(WorkspaceEvent::ToolsChanged);
    }
}
