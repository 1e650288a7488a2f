//! Conversation engine for asking questions about exoplanet tables: streams
//! answers into a shared store, pages through their results and lets the
//! conversation and results views focus each other.

pub mod logging;
pub mod navigation;
pub mod pager;
pub mod session;
pub mod settings;

pub use navigation::{FocusHandler, FocusId, NavigationBridge, RegistrationToken, ViewKind};
pub use pager::{DEFAULT_PAGE_SIZE, Page, PagerError, PagerResult, QueryPager};
pub use session::{ChatSession, Exchange};
pub use settings::{Settings, SettingsError, SettingsStore};
