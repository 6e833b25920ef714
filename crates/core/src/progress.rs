use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub message: String,
    pub completed: u32,
    pub total: u32,
}

impl ProgressUpdate {
    pub fn new(message: impl Into<String>, completed: u32, total: u32) -> Self {
        Self {
            message: message.into(),
            completed,
            total,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.total > 0 && self.completed >= self.total
    }
}

impl fmt::Display for ProgressUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] {}", self.completed, self.total, self.message)
    }
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, update: ProgressUpdate);
}

#[derive(Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn report(&self, _update: ProgressUpdate) {}
}

#[derive(Default)]
pub struct VecProgressSink {
    updates: Mutex<Vec<ProgressUpdate>>,
}

impl VecProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<ProgressUpdate> {
        self.updates
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn milestones(&self) -> Vec<(u32, u32)> {
        self.updates()
            .into_iter()
            .map(|update| (update.completed, update.total))
            .collect()
    }
}

impl ProgressSink for VecProgressSink {
    fn report(&self, update: ProgressUpdate) {
        if let Ok(mut guard) = self.updates.lock() {
            guard.push(update);
        }
    }
}

/// Forwards progress to the `log` facade.
#[derive(Default, Clone)]
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn report(&self, update: ProgressUpdate) {
        log::info!("{update}");
    }
}

/// Which project field a stream of partial output belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamField {
    CoreSeed,
    CharacterDynamics,
    CharacterState,
    WorldBuilding,
    PlotArchitecture,
    GlobalSummary,
}

impl StreamField {
    pub fn label(&self) -> &'static str {
        match self {
            StreamField::CoreSeed => "core_seed",
            StreamField::CharacterDynamics => "character_dynamics",
            StreamField::CharacterState => "character_state",
            StreamField::WorldBuilding => "world_building",
            StreamField::PlotArchitecture => "plot_architecture",
            StreamField::GlobalSummary => "global_summary",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StreamEvent<'a> {
    pub field: Option<StreamField>,
    pub increment: &'a str,
    pub full_text: &'a str,
}

impl StreamEvent<'_> {
    /// The last event of a request carries an empty increment and the full text.
    pub fn is_final(&self) -> bool {
        self.increment.is_empty()
    }

    /// `true` for the first delivered event of an attempt, whose increment is
    /// the whole text so far. After a retry this repeats text the sink has
    /// already seen.
    pub fn starts_request(&self) -> bool {
        !self.increment.is_empty() && self.increment.len() == self.full_text.len()
    }
}

/// Receives streamed text. Retried requests start over from the beginning,
/// so a sink that appends increments should watch
/// [`StreamEvent::starts_request`].
pub trait StreamSink: Send + Sync {
    fn on_stream(&self, event: StreamEvent<'_>);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedStreamEvent {
    pub field: Option<StreamField>,
    pub increment: String,
    pub full_text: String,
}

#[derive(Default)]
pub struct VecStreamSink {
    events: Mutex<Vec<RecordedStreamEvent>>,
}

impl VecStreamSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedStreamEvent> {
        self.events
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl StreamSink for VecStreamSink {
    fn on_stream(&self, event: StreamEvent<'_>) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(RecordedStreamEvent {
                field: event.field,
                increment: event.increment.to_string(),
                full_text: event.full_text.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event<'a>(increment: &'a str, full_text: &'a str) -> StreamEvent<'a> {
        StreamEvent {
            field: None,
            increment,
            full_text,
        }
    }

    #[test]
    fn first_increment_of_an_attempt_starts_the_request() {
        assert!(event("灯塔", "灯塔").starts_request());
        assert!(!event("熄灭", "灯塔熄灭").starts_request());
        assert!(!event("", "灯塔熄灭").starts_request());
        assert!(event("", "灯塔熄灭").is_final());
    }

    #[test]
    fn recorder_keeps_a_restarted_attempt() {
        let sink = VecStreamSink::new();
        sink.on_stream(event("灯塔", "灯塔"));
        sink.on_stream(event("灯塔熄", "灯塔熄"));
        sink.on_stream(event("", "灯塔熄"));

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].increment, events[1].full_text);
        assert_eq!(events[2].full_text, "灯塔熄");
    }
}
