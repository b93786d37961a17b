use std::sync::{Mutex, PoisonError};

use {hearth_config::HearthConfig, tokio::sync::watch, tracing::debug};

use crate::action::Action;

/// Source of the actions visible on the companion device.
pub trait ActionCatalog: Send + Sync {
    /// Current snapshot plus every later one, ordered and filtered to
    /// companion-visible actions. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> watch::Receiver<Vec<Action>>;
}

/// In-memory catalog holding every action record, visible or not.
#[derive(Debug)]
pub struct MemoryCatalog {
    records: Mutex<Vec<Action>>,
    tx: watch::Sender<Vec<Action>>,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MemoryCatalog {
    pub fn new(actions: impl IntoIterator<Item = Action>) -> Self {
        let records: Vec<Action> = actions.into_iter().collect();
        let (tx, _rx) = watch::channel(visible(&records));
        Self {
            records: Mutex::new(records),
            tx,
        }
    }

    pub fn from_config(config: &HearthConfig) -> Self {
        Self::new(config.actions.iter().map(Action::from))
    }

    /// Replace every record.
    pub fn replace(&self, actions: impl IntoIterator<Item = Action>) {
        self.update(|records| {
            *records = actions.into_iter().collect();
        });
    }

    /// Insert or replace the record with the same id.
    pub fn upsert(&self, action: Action) {
        self.update(|records| match records.iter_mut().find(|a| a.id == action.id) {
            Some(existing) => *existing = action,
            None => records.push(action),
        });
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut removed = false;
        self.update(|records| {
            let before = records.len();
            records.retain(|a| a.id != id);
            removed = records.len() != before;
        });
        removed
    }

    /// Visible actions in display order.
    pub fn snapshot(&self) -> Vec<Action> {
        self.tx.borrow().clone()
    }

    fn update(&self, f: impl FnOnce(&mut Vec<Action>)) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut records);
        let snapshot = visible(&records);
        debug!(total = records.len(), visible = snapshot.len(), "action catalog updated");
        self.tx.send_replace(snapshot);
    }
}

impl ActionCatalog for MemoryCatalog {
    fn subscribe(&self) -> watch::Receiver<Vec<Action>> {
        self.tx.subscribe()
    }
}

fn visible(records: &[Action]) -> Vec<Action> {
    let mut actions: Vec<Action> = records.iter().filter(|a| a.show_on_watch).cloned().collect();
    actions.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
    actions
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn action(id: &str, position: i32) -> Action {
        Action {
            id: id.into(),
            name: format!("Action {id}"),
            icon: "mdi:lightbulb".into(),
            background_color: "#FFFFFF".into(),
            icon_color: "#000000".into(),
            text_color: "#000000".into(),
            position,
            show_on_watch: true,
            server: "home".into(),
        }
    }

    fn ids(actions: &[Action]) -> Vec<&str> {
        actions.iter().map(|a| a.id.as_str()).collect()
    }

    #[test]
    fn filters_and_orders() {
        let mut hidden = action("hidden", 0);
        hidden.show_on_watch = false;
        let catalog = MemoryCatalog::new([action("b", 2), action("c", 1), action("a", 1), hidden]);
        assert_eq!(ids(&catalog.snapshot()), vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn subscribers_see_every_change() {
        let catalog = MemoryCatalog::new([action("a", 0)]);
        let mut rx = catalog.subscribe();
        assert_eq!(ids(&rx.borrow()), vec!["a"]);

        catalog.upsert(action("b", -1));
        rx.changed().await.unwrap();
        assert_eq!(ids(&rx.borrow_and_update()), vec!["b", "a"]);

        assert!(catalog.remove("a"));
        assert!(!catalog.remove("a"));
        rx.changed().await.unwrap();
        assert_eq!(ids(&rx.borrow_and_update()), vec!["b"]);

        let mut moved = action("b", 5);
        moved.name = "Renamed".into();
        catalog.upsert(moved);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow()[0].name, "Renamed");
    }

    #[test]
    fn loads_from_config() {
        let config: HearthConfig = toml::from_str(
            r#"
            [[actions]]
            id = "porch"
            name = "Porch light"
            server = "home"
            position = 2

            [[actions]]
            id = "garage"
            name = "Garage"
            server = "home"
            show_on_watch = false
            "#,
        )
        .unwrap();
        let catalog = MemoryCatalog::from_config(&config);
        assert_eq!(ids(&catalog.snapshot()), vec!["porch"]);
        catalog.replace([]);
        assert!(catalog.snapshot().is_empty());
    }
}
