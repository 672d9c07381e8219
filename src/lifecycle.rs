use crate::{Result, ResultExt};
use slotmap::{Key, SecondaryMap};

/// One entry of an ordered bring-up table.
///
/// `bring_up` must leave nothing of its own behind when it fails, the runner
/// only tears down the stages that completed before it.
pub(crate) struct Stage<C> {
    pub(crate) name: &'static str,
    pub(crate) bring_up: fn(&mut C) -> Result<()>,
    pub(crate) tear_down: fn(&mut C),
}

pub(crate) fn bring_up<C>(stages: &[Stage<C>], context: &mut C) -> Result<()> {
    for (index, stage) in stages.iter().enumerate() {
        trace!("Bring up stage {}", stage.name);
        if let Err(error) = (stage.bring_up)(context) {
            error!("Stage {} failed: {}", stage.name, error);
            tear_down(&stages[..index], context);
            return Err(error).context(stage.name);
        }
    }
    Ok(())
}

pub(crate) fn tear_down<C>(stages: &[Stage<C>], context: &mut C) {
    for stage in stages.iter().rev() {
        trace!("Tear down stage {}", stage.name);
        (stage.tear_down)(context);
    }
}

/// Live children keyed by their declaration key, dropped in reverse insertion order.
pub(crate) struct Children<K: Key, T> {
    order: Vec<K>,
    live: SecondaryMap<K, T>,
}

impl<K: Key, T> Default for Children<K, T> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            live: SecondaryMap::new(),
        }
    }
}

impl<K: Key, T> Children<K, T> {
    pub(crate) fn insert(&mut self, key: K, value: T) {
        if self.live.insert(key, value).is_none() {
            self.order.push(key);
        }
    }

    pub(crate) fn get(&self, key: K) -> Option<&T> {
        self.live.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: K) -> Option<&mut T> {
        self.live.get_mut(key)
    }

    pub(crate) fn remove(&mut self, key: K) -> Option<T> {
        let value = self.live.remove(key);
        if value.is_some() {
            self.order.retain(|&other| other != key);
        }
        value
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.order.iter().filter_map(|&key| Some((key, self.live.get(key)?)))
    }

    pub(crate) fn clear(&mut self) {
        while let Some(key) = self.order.pop() {
            drop(self.live.remove(key));
        }
    }
}

impl<K: Key, T> Drop for Children<K, T> {
    fn drop(&mut self) {
        self.clear();
    }
}
