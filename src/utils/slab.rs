/// Slot storage handing out stable `usize` keys.
///
/// Freed slots are recycled, so a key stays valid until its entry is removed
/// and may be reused afterwards.
pub(crate) struct Slab<T> {
    items: Vec<Option<T>>,
    free: Vec<usize>,
    len: usize,
}

impl<T> Slab<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            free: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn insert(&mut self, item: T) -> usize {
        self.len += 1;

        if let Some(index) = self.free.pop() {
            self.items[index] = Some(item);
            return index;
        }

        self.items.push(Some(item));
        self.items.len() - 1
    }

    pub(crate) fn remove(&mut self, index: usize) -> Option<T> {
        let item = self.items.get_mut(index)?.take()?;

        self.free.push(index);
        self.len -= 1;

        Some(item)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Occupied entries in key order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(index, item)| item.as_ref().map(|item| (index, item)))
    }
}

#[cfg(test)]
mod tests {
    use super::Slab;

    #[test]
    fn keys_are_recycled_after_removal() {
        let mut slab = Slab::with_capacity(4);
        let first = slab.insert("a");
        let second = slab.insert("b");
        assert_eq!(slab.len(), 2);

        assert_eq!(slab.remove(first), Some("a"));
        assert_eq!(slab.remove(first), None);
        assert_eq!(slab.len(), 1);

        let third = slab.insert("c");
        assert_eq!(third, first);
        assert_eq!(
            slab.iter().map(|(_, item)| *item).collect::<Vec<_>>(),
            vec!["c", "b"]
        );
        assert_eq!(slab.remove(second), Some("b"));
    }

    #[test]
    fn removing_unknown_key_is_a_no_op() {
        let mut slab: Slab<u8> = Slab::with_capacity(0);
        assert_eq!(slab.remove(7), None);
        assert_eq!(slab.len(), 0);
    }
}
