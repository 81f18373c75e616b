use std::sync::Mutex;

/// Thread-safe cursor over the password list.
///
/// Each position is handed out at most once across all workers; `unget`
/// rewinds by one so a password whose attempt died on a transient fault is
/// retried instead of skipped.
pub struct PasswordQueue {
    passwords: Vec<String>,
    index: Mutex<usize>,
}

impl PasswordQueue {
    pub fn new(passwords: Vec<String>) -> Self {
        Self {
            passwords,
            index: Mutex::new(0),
        }
    }

    /// Next password, or `None` once the list is exhausted.
    pub fn next(&self) -> Option<String> {
        let mut index = self.index.lock().unwrap();
        let password = self.passwords.get(*index).cloned()?;
        *index += 1;
        Some(password)
    }

    /// Rewind the cursor by one, saturating at zero.
    pub fn unget(&self) {
        let mut index = self.index.lock().unwrap();
        *index = index.saturating_sub(1);
    }

    /// Rewind the cursor to the beginning.
    pub fn reset(&self) {
        *self.index.lock().unwrap() = 0;
    }

    /// Fraction of the list consumed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.passwords.is_empty() {
            return 0.0;
        }
        *self.index.lock().unwrap() as f64 / self.passwords.len() as f64
    }

    pub fn total(&self) -> usize {
        self.passwords.len()
    }

    pub fn remaining(&self) -> usize {
        self.passwords.len() - *self.index.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(items: &[&str]) -> PasswordQueue {
        PasswordQueue::new(items.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn delivers_each_password_once_in_order() {
        let q = queue(&["a", "b", "c"]);
        assert_eq!(q.next().as_deref(), Some("a"));
        assert_eq!(q.next().as_deref(), Some("b"));
        assert_eq!(q.next().as_deref(), Some("c"));
        assert_eq!(q.next(), None);
        assert_eq!(q.next(), None);
    }

    #[test]
    fn unget_redelivers_the_last_password() {
        let q = queue(&["a", "b"]);
        assert_eq!(q.next().as_deref(), Some("a"));
        q.unget();
        assert_eq!(q.next().as_deref(), Some("a"));
        assert_eq!(q.next().as_deref(), Some("b"));
    }

    #[test]
    fn unget_saturates_at_zero() {
        let q = queue(&["a"]);
        q.unget();
        q.unget();
        assert_eq!(q.next().as_deref(), Some("a"));
    }

    #[test]
    fn next_then_unget_leaves_the_cursor_unchanged() {
        let q = queue(&["a", "b", "c"]);
        let before = q.remaining();
        q.next();
        q.unget();
        assert_eq!(q.remaining(), before);
    }

    #[test]
    fn progress_and_counts() {
        let q = queue(&["a", "b", "c", "d"]);
        assert_eq!(q.progress(), 0.0);
        assert_eq!(q.total(), 4);
        q.next();
        q.next();
        assert_eq!(q.progress(), 0.5);
        assert_eq!(q.remaining(), 2);
        q.reset();
        assert_eq!(q.remaining(), 4);
    }

    #[test]
    fn empty_queue_is_immediately_exhausted() {
        let q = queue(&[]);
        assert_eq!(q.next(), None);
        assert_eq!(q.progress(), 0.0);
    }

    #[test]
    fn concurrent_consumers_see_every_password_exactly_once() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let items: Vec<String> = (0..500).map(|i| format!("pw{i}")).collect();
        let q = Arc::new(PasswordQueue::new(items.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(p) = q.next() {
                    seen.push(p);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }

        assert_eq!(all.len(), items.len());
        let unique: HashSet<_> = all.into_iter().collect();
        assert_eq!(unique.len(), items.len());
    }
}
