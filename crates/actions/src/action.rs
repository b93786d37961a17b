use hearth_config::ActionEntry;

/// A user-configured action as the companion sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub id: String,
    pub name: String,
    pub icon: String,
    pub background_color: String,
    pub icon_color: String,
    pub text_color: String,
    pub position: i32,
    pub show_on_watch: bool,
    /// Server that executes the action.
    pub server: String,
}

impl From<&ActionEntry> for Action {
    fn from(entry: &ActionEntry) -> Self {
        Self {
            id: entry.id.clone(),
            name: entry.name.clone(),
            icon: entry.icon.clone(),
            background_color: entry.background_color.clone(),
            icon_color: entry.icon_color.clone(),
            text_color: entry.text_color.clone(),
            position: entry.position,
            show_on_watch: entry.show_on_watch,
            server: entry.server.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActionRunState {
    #[default]
    Idle,
    Loading,
    Success,
    Failure,
}

impl ActionRunState {
    /// Success and failure clear back to idle on their own.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

/// Run state plus a counter bumped on every write. The idle reset only
/// applies if nothing was written after the result it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSnapshot {
    pub state: ActionRunState,
    pub revision: u64,
}
