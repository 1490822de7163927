use crate::{EventType, ExecutionEvent, ExecutionId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EventOrder {
    #[default]
    Chronological,
    ReverseChronological,
}

/// Composable read filter over the event log
///
/// ```
/// use flowcore::EventQuery;
/// use uuid::Uuid;
///
/// let query = EventQuery::for_execution(Uuid::new_v4())
///     .steps_only()
///     .most_recent(5);
/// assert_eq!(query.limit, Some(5));
/// ```
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub execution_id: Option<ExecutionId>,
    pub event_type: Option<EventType>,
    pub order: EventOrder,
    pub limit: Option<usize>,
    pub steps_only: bool,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_execution(execution_id: ExecutionId) -> Self {
        Self {
            execution_id: Some(execution_id),
            ..Self::default()
        }
    }

    pub fn with_event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn chronological(mut self) -> Self {
        self.order = EventOrder::Chronological;
        self
    }

    pub fn reverse(mut self) -> Self {
        self.order = EventOrder::ReverseChronological;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The newest `n` events, newest first
    pub fn most_recent(self, n: usize) -> Self {
        self.reverse().limit(n)
    }

    /// Exclude execution-level events
    pub fn steps_only(mut self) -> Self {
        self.steps_only = true;
        self
    }

    pub fn matches(&self, event: &ExecutionEvent) -> bool {
        if self.execution_id.is_some_and(|id| id != event.execution_id) {
            return false;
        }
        if self.event_type.is_some_and(|t| t != event.event_type) {
            return false;
        }
        !self.steps_only || event.event_type.is_step_event()
    }

    /// Filter, order and truncate events given in insertion order
    pub fn apply<I>(&self, events: I) -> Vec<ExecutionEvent>
    where
        I: IntoIterator<Item = ExecutionEvent>,
    {
        let mut selected: Vec<_> = events.into_iter().filter(|e| self.matches(e)).collect();

        // Stable sort keeps insertion order for equal timestamps
        selected.sort_by_key(|e| e.inserted_at);
        if self.order == EventOrder::ReverseChronological {
            selected.reverse();
        }
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}
