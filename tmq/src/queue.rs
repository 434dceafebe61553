use std::collections::VecDeque;
use std::sync::Arc;

pub trait OnEventFn: 'static + Sync + Send + Fn() {}
impl<T> OnEventFn for T where T: 'static + Sync + Send + Fn() {}

/// Bounded FIFO backlog of one session.
pub struct Queue<T> {
    cap: usize,
    inner: VecDeque<T>,
    on_push_fn: Option<Arc<dyn OnEventFn>>,
    on_pop_fn: Option<Arc<dyn OnEventFn>>,
}

impl<T> Drop for Queue<T> {
    #[inline]
    fn drop(&mut self) {
        log::debug!("Queue Drop ... len: {}", self.len());
        if let Some(f) = self.on_pop_fn.as_ref() {
            self.inner.iter().for_each(|_| f());
        }
    }
}

impl<T> Queue<T> {
    #[inline]
    pub fn new(cap: usize) -> Self {
        Self { cap, inner: VecDeque::new(), on_push_fn: None, on_pop_fn: None }
    }

    #[inline]
    pub fn on_push<F>(mut self, f: F) -> Self
    where
        F: OnEventFn,
    {
        self.on_push_fn = Some(Arc::new(f));
        self
    }

    #[inline]
    pub fn on_pop<F>(mut self, f: F) -> Self
    where
        F: OnEventFn,
    {
        self.on_pop_fn = Some(Arc::new(f));
        self
    }

    #[inline]
    pub fn push(&mut self, v: T) -> Result<(), T> {
        if self.inner.len() >= self.cap {
            return Err(v);
        }
        if let Some(f) = self.on_push_fn.as_ref() {
            f();
        }
        self.inner.push_back(v);
        Ok(())
    }

    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        let v = self.inner.pop_front()?;
        if let Some(f) = self.on_pop_fn.as_ref() {
            f();
        }
        Some(v)
    }

    #[inline]
    pub fn front(&self) -> Option<&T> {
        self.inner.front()
    }

    #[inline]
    pub fn clear(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.inner.len());
        while let Some(v) = self.pop() {
            out.push(v);
        }
        out
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
