/// Runs the cleanup closure on drop unless [`Defer::cancel`] was called.
pub struct Defer<F: FnOnce()> {
    f: Option<F>,
}

impl<F: FnOnce()> Defer<F> {
    pub fn new(f: F) -> Self {
        Self { f: Some(f) }
    }

    pub fn cancel(&mut self) {
        self.f = None;
    }
}

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_runs_unless_canceled() {
        let count = Cell::new(0);
        {
            let _guard = Defer::new(|| count.set(count.get() + 1));
        }
        assert_eq!(count.get(), 1);
        {
            let mut guard = Defer::new(|| count.set(count.get() + 1));
            guard.cancel();
        }
        assert_eq!(count.get(), 1);
    }
}
