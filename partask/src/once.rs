//!
//! Single-Assignment Cell
//!
//! A write-once cell with a blocking read, used to back every future's
//! result. Note: the spec calls the blocking read `await`, which is a
//! reserved keyword in Rust; it is exposed here as `await_value`.
//!

use std::sync::{Condvar, Mutex};

use crate::error::PartaskError;

pub struct AssignCell<T> {
    name: String,
    state: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T: Clone> AssignCell<T> {
    /// `name` is for diagnostics only (misuse error messages), per §4.2.
    pub fn new(name: impl Into<String>) -> Self {
        AssignCell {
            name: name.into(),
            state: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the assigned value if any, without blocking.
    pub fn peek(&self) -> Option<T> {
        self.state.lock().unwrap().clone()
    }

    /// Blocks until assigned, then returns the value.
    pub fn await_value(&self) -> T {
        let mut guard = self.state.lock().unwrap();
        while guard.is_none() {
            guard = self.ready.wait(guard).unwrap();
        }
        guard.clone().unwrap()
    }

    /// Writes once. A second attempt fails with `Misuse` and leaves the
    /// first assignment untouched.
    pub fn assign(&self, value: T) -> Result<(), PartaskError> {
        let mut guard = self.state.lock().unwrap();
        if guard.is_some() {
            return Err(PartaskError::Misuse(format!(
                "cell '{}' already assigned",
                self.name
            )));
        }
        *guard = Some(value);
        self.ready.notify_all();
        Ok(())
    }

    pub fn is_assigned(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn peek_before_assignment_is_none() {
        let cell: AssignCell<i32> = AssignCell::new("test");
        assert_eq!(cell.peek(), None);
    }

    #[test]
    fn peek_is_stable_once_assigned() {
        let cell: AssignCell<i32> = AssignCell::new("test");
        cell.assign(7).unwrap();
        assert_eq!(cell.peek(), Some(7));
        assert_eq!(cell.peek(), Some(7));
    }

    #[test]
    fn second_assignment_fails() {
        let cell: AssignCell<i32> = AssignCell::new("test");
        cell.assign(1).unwrap();
        let err = cell.assign(2).unwrap_err();
        assert!(matches!(err, PartaskError::Misuse(_)));
        assert_eq!(cell.peek(), Some(1));
    }

    #[test]
    fn await_value_blocks_until_assigned() {
        let cell = Arc::new(AssignCell::<i32>::new("test"));
        let reader = {
            let cell = cell.clone();
            thread::spawn(move || cell.await_value())
        };
        thread::sleep(Duration::from_millis(10));
        cell.assign(99).unwrap();
        assert_eq!(reader.join().unwrap(), 99);
    }
}
