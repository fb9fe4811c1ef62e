// One rollup lane: at most one open bucket, closed strictly in index order

use crate::models::{Bucket, PingBucket};

pub(crate) trait Indexed {
    fn index(&self) -> i64;
}

impl Indexed for Bucket {
    fn index(&self) -> i64 {
        self.index
    }
}

impl Indexed for PingBucket {
    fn index(&self) -> i64 {
        self.index
    }
}

pub(crate) struct Lane<B> {
    open: Option<B>,
    last_closed: Option<i64>,
}

impl<B: Indexed> Lane<B> {
    pub(crate) fn new() -> Self {
        Self {
            open: None,
            last_closed: None,
        }
    }

    pub(crate) fn open(&self) -> Option<&B> {
        self.open.as_ref()
    }

    /// Returns the open bucket for `index`, plus the previous bucket if opening it closed one.
    /// `None` when `index` is behind the open bucket or inside an interval already closed.
    pub(crate) fn slot(
        &mut self,
        index: i64,
        fresh: impl FnOnce() -> B,
    ) -> Option<(Option<B>, &mut B)> {
        if self.last_closed.is_some_and(|closed| index <= closed) {
            return None;
        }
        let open_index = self.open.as_ref().map(Indexed::index);
        let closed = match open_index {
            Some(current) if current == index => None,
            Some(current) if current > index => return None,
            Some(_) => self.open.take(),
            None => None,
        };
        if let Some(c) = &closed {
            self.last_closed = Some(c.index());
        }
        Some((closed, self.open.get_or_insert_with(fresh)))
    }

    /// Closes the open bucket if its interval is before `index`.
    pub(crate) fn seal_before(&mut self, index: i64) -> Option<B> {
        if self.open.as_ref().is_some_and(|b| b.index() < index) {
            let closed = self.open.take()?;
            self.last_closed = Some(closed.index());
            return Some(closed);
        }
        None
    }
}
