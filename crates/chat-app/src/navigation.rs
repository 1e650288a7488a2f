use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use exochat_storage::{MessageId, QueryId};

/// The two views that cross-navigate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    Conversation,
    Results,
}

/// Id a view is asked to bring into focus; message and query ids share one space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FocusId(pub u64);

impl From<MessageId> for FocusId {
    fn from(value: MessageId) -> Self {
        Self(value.as_u64())
    }
}

impl From<QueryId> for FocusId {
    fn from(value: QueryId) -> Self {
        Self(value.as_u64())
    }
}

impl fmt::Display for FocusId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

pub type FocusHandler = Arc<dyn Fn(FocusId) + Send + Sync + 'static>;

/// Identifies one registration so a torn-down view cannot remove its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationToken {
    view: ViewKind,
    generation: u64,
}

impl RegistrationToken {
    pub fn view(&self) -> ViewKind {
        self.view
    }
}

#[derive(Default)]
struct BridgeState {
    handlers: HashMap<ViewKind, (u64, FocusHandler)>,
    next_generation: u64,
}

/// Focus broker owned by the application shell and handed to both views.
///
/// Holds at most one handler per view kind. Handlers run synchronously on the
/// caller's task, outside the bridge lock, so a handler may itself call `focus`.
#[derive(Clone, Default)]
pub struct NavigationBridge {
    state: Arc<Mutex<BridgeState>>,
}

impl NavigationBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handler` for `view`, replacing any earlier one.
    pub fn register<F>(&self, view: ViewKind, handler: F) -> RegistrationToken
    where
        F: Fn(FocusId) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        let generation = state.next_generation;
        state.next_generation += 1;

        let handler: FocusHandler = Arc::new(handler);
        if state.handlers.insert(view, (generation, handler)).is_some() {
            tracing::debug!(?view, "replaced focus handler");
        }
        RegistrationToken { view, generation }
    }

    /// Removes the handler installed with `token`. Returns false when it was already replaced.
    pub fn unregister(&self, token: RegistrationToken) -> bool {
        let mut state = self.lock();
        match state.handlers.get(&token.view) {
            Some((generation, _)) if *generation == token.generation => {
                state.handlers.remove(&token.view);
                true
            }
            _ => false,
        }
    }

    pub fn is_registered(&self, view: ViewKind) -> bool {
        self.lock().handlers.contains_key(&view)
    }

    /// Asks `view` to focus `id`. A view that is not mounted is a silent no-op.
    pub fn focus(&self, view: ViewKind, id: impl Into<FocusId>) -> bool {
        let id = id.into();
        let handler = self
            .lock()
            .handlers
            .get(&view)
            .map(|(_, handler)| Arc::clone(handler));

        match handler {
            Some(handler) => {
                handler(id);
                true
            }
            None => {
                tracing::debug!(?view, id = %id, "focus request without a mounted view");
                false
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<FocusId>>>, impl Fn(FocusId) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |id| sink.lock().unwrap().push(id))
    }

    #[test]
    fn focus_without_handler_is_a_no_op() {
        let bridge = NavigationBridge::new();
        assert!(!bridge.focus(ViewKind::Results, QueryId::new(3)));
    }

    #[test]
    fn focus_reaches_only_the_requested_view() {
        let bridge = NavigationBridge::new();
        let (results, results_handler) = recorder();
        let (conversation, conversation_handler) = recorder();
        bridge.register(ViewKind::Results, results_handler);
        bridge.register(ViewKind::Conversation, conversation_handler);

        assert!(bridge.focus(ViewKind::Results, QueryId::new(5)));
        assert_eq!(*results.lock().unwrap(), vec![FocusId(5)]);
        assert!(conversation.lock().unwrap().is_empty());
    }

    #[test]
    fn later_registration_replaces_the_earlier_one() {
        let bridge = NavigationBridge::new();
        let (first, first_handler) = recorder();
        let (second, second_handler) = recorder();
        let first_token = bridge.register(ViewKind::Conversation, first_handler);
        bridge.register(ViewKind::Conversation, second_handler);

        bridge.focus(ViewKind::Conversation, MessageId::new(8));
        assert!(first.lock().unwrap().is_empty());
        assert_eq!(*second.lock().unwrap(), vec![FocusId(8)]);

        // The replaced view unmounting must not remove the live handler.
        assert!(!bridge.unregister(first_token));
        assert!(bridge.is_registered(ViewKind::Conversation));
    }

    #[test]
    fn unregister_with_current_token_unmounts_the_view() {
        let bridge = NavigationBridge::new();
        let (_, handler) = recorder();
        let token = bridge.register(ViewKind::Results, handler);
        assert_eq!(token.view(), ViewKind::Results);

        assert!(bridge.unregister(token));
        assert!(!bridge.focus(ViewKind::Results, QueryId::new(1)));
    }

    #[test]
    fn handler_may_navigate_back_without_deadlocking() {
        let bridge = NavigationBridge::new();
        let (conversation, conversation_handler) = recorder();
        bridge.register(ViewKind::Conversation, conversation_handler);

        let back = bridge.clone();
        bridge.register(ViewKind::Results, move |id| {
            back.focus(ViewKind::Conversation, id);
        });

        assert!(bridge.focus(ViewKind::Results, QueryId::new(2)));
        assert_eq!(*conversation.lock().unwrap(), vec![FocusId(2)]);
    }
}
