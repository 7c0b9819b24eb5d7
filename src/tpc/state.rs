use super::message::Action;
use crate::error::{Error, Result};

use std::collections::BTreeMap;

/// The replicated collection: items keyed by unique name. Mutated only by
/// whichever role currently holds a decided transaction, exactly once per
/// commit; dispatch is serialized per node, so there is no concurrent
/// mutation path.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Store {
    items: BTreeMap<String, String>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks an action's validity against the current items: adds require
    /// an unused name, updates and deletes an existing one. Invalid actions
    /// are voted down, they are not errors.
    pub fn validate(&self, action: &Action) -> bool {
        match action {
            Action::Add { name, .. } => !self.items.contains_key(name),
            Action::Update { name, .. } => self.items.contains_key(name),
            Action::Delete { name } => self.items.contains_key(name),
        }
    }

    /// Applies a committed action. Applying an action that does not
    /// validate indicates a protocol defect, since every commit was
    /// preceded by a successful validity vote.
    pub fn apply(&mut self, action: &Action) -> Result<()> {
        if !self.validate(action) {
            return Err(Error::Internal(format!("cannot apply invalid action {action:?}")));
        }
        match action {
            Action::Add { name, value } => {
                self.items.insert(name.clone(), value.clone());
            }
            Action::Update { name, new_name, value } => {
                self.items.remove(name);
                self.items.insert(new_name.clone(), value.clone());
            }
            Action::Delete { name } => {
                self.items.remove(name);
            }
        }
        Ok(())
    }

    /// Fetches an item value by name.
    pub fn get(&self, name: &str) -> Option<&String> {
        self.items.get(name)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates over all items in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn add(name: &str, value: &str) -> Action {
        Action::Add { name: name.to_owned(), value: value.to_owned() }
    }

    #[test]
    fn add_requires_unused_name() -> Result<()> {
        let mut store = Store::new();
        assert!(store.validate(&add("s", "u")));
        store.apply(&add("s", "u"))?;
        assert_eq!(store.get("s"), Some(&"u".to_owned()));
        assert!(!store.validate(&add("s", "other")));
        assert!(store.apply(&add("s", "other")).is_err());
        Ok(())
    }

    #[test]
    fn update_renames_and_replaces() -> Result<()> {
        let mut store = Store::new();
        let update = Action::Update {
            name: "s".to_owned(),
            new_name: "t".to_owned(),
            value: "v2".to_owned(),
        };
        assert!(!store.validate(&update));
        store.apply(&add("s", "v1"))?;
        assert!(store.validate(&update));
        store.apply(&update)?;
        assert_eq!(store.get("s"), None);
        assert_eq!(store.get("t"), Some(&"v2".to_owned()));
        Ok(())
    }

    #[test]
    fn delete_requires_existing_name() -> Result<()> {
        let mut store = Store::new();
        let delete = Action::Delete { name: "s".to_owned() };
        assert!(!store.validate(&delete));
        store.apply(&add("s", "u"))?;
        store.apply(&delete)?;
        assert!(store.is_empty());
        Ok(())
    }
}
