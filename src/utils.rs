/// LIFO with a hard bound on its depth. `push` refuses entries past the
/// bound instead of growing without limit.
pub(crate) struct Stack<T> {
    entries: Vec<T>,
    limit: usize,
}

impl<T> Stack<T> {
    pub(crate) fn with_limit(limit: usize) -> Self {
        Stack {
            entries: Vec::with_capacity(limit.min(16)),
            limit,
        }
    }

    #[must_use]
    pub(crate) fn push(&mut self, entry: T) -> Option<()> {
        if self.entries.len() >= self.limit {
            return None;
        }
        self.entries.push(entry);
        Some(())
    }

    pub(crate) fn pop(&mut self) -> Option<T> {
        self.entries.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
