//! Resettable request state.
//!
//! [`StaticStore`] is a name-keyed store that remembers the default each entry
//! was created with, so a single entry or the whole store can be put back to
//! its initial state. Callers get `&mut T` and mutate in place.

use std::any::Any;
use std::collections::HashMap;

type Value = Box<dyn Any + Send + Sync>;
type DefaultFn = Box<dyn Fn() -> Value + Send + Sync>;

#[derive(Default)]
pub struct StaticStore {
    values: HashMap<String, Value>,
    defaults: HashMap<String, DefaultFn>,
}

impl std::fmt::Debug for StaticStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.defaults.keys().collect();
        names.sort();
        f.debug_struct("StaticStore").field("names", &names).finish()
    }
}

impl StaticStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry for `name`, created from `default` on first use.
    ///
    /// The default is only recorded the first time a name is seen. Asking for
    /// an existing name with a different type replaces the entry.
    pub fn get<T>(&mut self, name: &str, default: T) -> &mut T
    where
        T: Clone + Send + Sync + 'static,
    {
        let type_matches = self
            .values
            .get(name)
            .is_some_and(|value| value.is::<T>());
        if !type_matches {
            let initial = default.clone();
            self.defaults
                .insert(name.to_string(), Box::new(move || Box::new(initial.clone()) as Value));
            self.values.insert(name.to_string(), Box::new(default));
        }

        self.values
            .get_mut(name)
            .and_then(|value| value.downcast_mut::<T>())
            .unwrap_or_else(|| unreachable!("static entry {name} was just stored as this type"))
    }

    /// The current value, if the entry exists with this type.
    pub fn peek<T: 'static>(&self, name: &str) -> Option<&T> {
        self.values.get(name).and_then(|value| value.downcast_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Put one entry back to its default.
    pub fn reset(&mut self, name: &str) {
        if let Some(default) = self.defaults.get(name) {
            self.values.insert(name.to_string(), default());
        }
    }

    /// Put every entry back to its default.
    pub fn reset_all(&mut self) {
        for (name, default) in &self.defaults {
            self.values.insert(name.clone(), default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_use_initializes() {
        let mut statics = StaticStore::new();
        assert_eq!(*statics.get("x", 5u32), 5);
        // The default only applies on first use.
        assert_eq!(*statics.get("x", 9u32), 5);
    }

    #[test]
    fn test_reset_restores_original_default() {
        let mut statics = StaticStore::new();
        *statics.get("x", String::from("default")) = "first".to_string();
        *statics.get("x", String::from("other")) = "second".to_string();
        statics.reset("x");
        assert_eq!(statics.get("x", String::new()), "default");
    }

    #[test]
    fn test_reset_all() {
        let mut statics = StaticStore::new();
        *statics.get("a", 1i64) = 10;
        statics.get("b", Vec::<String>::new()).push("item".to_string());
        statics.reset_all();
        assert_eq!(statics.peek::<i64>("a"), Some(&1));
        assert_eq!(statics.peek::<Vec<String>>("b").map(Vec::len), Some(0));
    }

    #[test]
    fn test_reset_unknown_name_is_noop() {
        let mut statics = StaticStore::new();
        statics.reset("missing");
        assert!(!statics.contains("missing"));
    }

    #[test]
    fn test_type_change_replaces_entry() {
        let mut statics = StaticStore::new();
        *statics.get("x", 1u8) = 2;
        assert_eq!(statics.get("x", "text"), &"text");
        statics.reset("x");
        assert_eq!(statics.peek::<&str>("x"), Some(&"text"));
    }
}
