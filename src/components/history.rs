use std::collections::VecDeque;

use crate::document::Document;
use crate::error::EditError;

// ============================================================================
// COMMAND TRAIT
// ============================================================================

/// One reversible user action.
///
/// A command is built from already-resolved data and never changes after
/// construction.  `apply` moves the document forward, `reverse` moves it back;
/// calling either twice in a row must leave the document as one call would.
/// Missing targets (a layer that was removed, an object already gone from
/// the graph) are skipped, not reported.
pub trait Command {
    fn apply(&self, doc: &mut Document) -> Result<(), EditError>;
    fn reverse(&self, doc: &mut Document) -> Result<(), EditError>;
    fn description(&self) -> String;
    fn memory_size(&self) -> usize;
}

pub type HistoryCallback = Box<dyn FnMut(bool, bool)>;

// ============================================================================
// HISTORY MANAGER - Manages undo/redo stacks with memory limits
// ============================================================================

/// Undo/redo history manager with depth and memory limits.
pub struct HistoryManager {
    undo_stack: VecDeque<Box<dyn Command>>,
    redo_stack: VecDeque<Box<dyn Command>>,
    max_history_size: usize,
    /// Optional memory cap in bytes.
    max_memory_bytes: Option<usize>,
    /// Running memory total across both stacks.
    total_memory: usize,
    on_change: Option<HistoryCallback>,
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(50)
    }
}

impl HistoryManager {
    pub fn new(max_history_size: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            max_history_size: max_history_size.max(1),
            max_memory_bytes: Some(100 * 1024 * 1024), // 100 MB default limit
            total_memory: 0,
            on_change: None,
        }
    }

    /// `None` disables the memory cap.
    pub fn with_memory_limit(mut self, max_bytes: Option<usize>) -> Self {
        self.max_memory_bytes = max_bytes;
        self
    }

    pub fn set_on_change(&mut self, callback: HistoryCallback) {
        self.on_change = Some(callback);
    }

    /// Apply `command`, record it and drop the redo branch.
    ///
    /// The entry is recorded even when `apply` reports an error; the error is
    /// handed back after the stacks and listeners are up to date.
    pub fn execute(&mut self, command: Box<dyn Command>, doc: &mut Document) -> Result<(), EditError> {
        let result = command.apply(doc);
        if let Err(e) = &result {
            log_warn!("History: '{}' failed while applying: {}", command.description(), e);
        }
        self.push(command);
        self.notify();
        result
    }

    /// Record a command whose effect is already on the document.
    pub fn push(&mut self, command: Box<dyn Command>) {
        // Clear redo stack when a new action is performed
        for cmd in self.redo_stack.drain(..) {
            self.total_memory = self.total_memory.saturating_sub(cmd.memory_size());
        }

        self.total_memory += command.memory_size();
        self.undo_stack.push_back(command);

        self.prune();
    }

    /// Reverse the most recent command.  `Ok(None)` when there is nothing to undo.
    pub fn undo(&mut self, doc: &mut Document) -> Result<Option<String>, EditError> {
        let Some(command) = self.undo_stack.pop_back() else {
            return Ok(None);
        };
        let description = command.description();
        let result = command.reverse(doc);
        self.redo_stack.push_back(command);
        self.notify();
        result.map(|_| Some(description))
    }

    /// Re-apply the most recently undone command.  `Ok(None)` when there is nothing to redo.
    pub fn redo(&mut self, doc: &mut Document) -> Result<Option<String>, EditError> {
        let Some(command) = self.redo_stack.pop_back() else {
            return Ok(None);
        };
        let description = command.description();
        let result = command.apply(doc);
        self.undo_stack.push_back(command);
        self.notify();
        result.map(|_| Some(description))
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_description(&self) -> Option<String> {
        self.undo_stack.back().map(|c| c.description())
    }

    pub fn redo_description(&self) -> Option<String> {
        self.redo_stack.back().map(|c| c.description())
    }

    /// Get all undo descriptions (most recent first)
    pub fn undo_history(&self) -> Vec<String> {
        self.undo_stack.iter().rev().map(|c| c.description()).collect()
    }

    /// Memory held by both stacks (cached running total).
    pub fn memory_usage(&self) -> usize {
        self.total_memory
    }

    pub fn max_history_size(&self) -> usize {
        self.max_history_size
    }

    /// Prune old commands to stay within limits.  Only called from `push`,
    /// after the redo branch is dropped, so `total_memory` is undo bytes here.
    fn prune(&mut self) {
        while self.undo_stack.len() > self.max_history_size {
            if let Some(removed) = self.undo_stack.pop_front() {
                self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
            }
        }

        if let Some(max_bytes) = self.max_memory_bytes {
            while self.total_memory > max_bytes && self.undo_stack.len() > 1 {
                if let Some(removed) = self.undo_stack.pop_front() {
                    log_info!(
                        "History: dropped '{}' to stay under {} bytes",
                        removed.description(),
                        max_bytes
                    );
                    self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.total_memory = 0;
        self.notify();
    }

    /// Undo `count` steps (`undo_history()[count - 1]` becomes the redo top).
    /// Stops at the first error.
    pub fn undo_to(&mut self, count: usize, doc: &mut Document) -> Result<usize, EditError> {
        let mut done = 0;
        while done < count && self.can_undo() {
            self.undo(doc)?;
            done += 1;
        }
        Ok(done)
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    fn notify(&mut self) {
        let (can_undo, can_redo) = (self.can_undo(), self.can_redo());
        if let Some(cb) = self.on_change.as_mut() {
            cb(can_undo, can_redo);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::DocumentOrigin;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Moves the origin between two fixed points.
    struct SetOrigin {
        before: DocumentOrigin,
        after: DocumentOrigin,
        size: usize,
    }

    impl SetOrigin {
        fn boxed(doc: &Document, dx: f32) -> Box<dyn Command> {
            let before = doc.origin();
            Box::new(Self { before, after: before.offset(dx, 0.0), size: 10 })
        }
    }

    impl Command for SetOrigin {
        fn apply(&self, doc: &mut Document) -> Result<(), EditError> {
            doc.set_origin(self.after);
            Ok(())
        }
        fn reverse(&self, doc: &mut Document) -> Result<(), EditError> {
            doc.set_origin(self.before);
            Ok(())
        }
        fn description(&self) -> String {
            format!("Origin {}", self.after.x)
        }
        fn memory_size(&self) -> usize {
            self.size
        }
    }

    struct Failing;

    impl Command for Failing {
        fn apply(&self, _doc: &mut Document) -> Result<(), EditError> {
            Err(EditError::Collaborator("export failed".into()))
        }
        fn reverse(&self, _doc: &mut Document) -> Result<(), EditError> {
            Ok(())
        }
        fn description(&self) -> String {
            "Failing".into()
        }
        fn memory_size(&self) -> usize {
            0
        }
    }

    fn exec(h: &mut HistoryManager, doc: &mut Document, dx: f32) {
        let cmd = SetOrigin::boxed(doc, dx);
        h.execute(cmd, doc).unwrap();
    }

    #[test]
    fn undo_redo_roundtrip() {
        let mut doc = Document::new(10, 10);
        let mut h = HistoryManager::default();
        exec(&mut h, &mut doc, 1.0);
        exec(&mut h, &mut doc, 2.0);
        assert_eq!(doc.origin().x, 3.0);

        assert_eq!(h.undo(&mut doc).unwrap(), Some("Origin 3".into()));
        assert_eq!(doc.origin().x, 1.0);
        h.undo(&mut doc).unwrap();
        assert_eq!(doc.origin().x, 0.0);
        assert_eq!(h.undo(&mut doc).unwrap(), None);

        h.redo(&mut doc).unwrap();
        h.redo(&mut doc).unwrap();
        assert_eq!(doc.origin().x, 3.0);
        assert!(!h.can_redo());
    }

    #[test]
    fn execute_clears_redo() {
        let mut doc = Document::new(10, 10);
        let mut h = HistoryManager::default();
        exec(&mut h, &mut doc, 1.0);
        h.undo(&mut doc).unwrap();
        assert!(h.can_redo());
        exec(&mut h, &mut doc, 5.0);
        assert!(!h.can_redo());
        assert_eq!(h.redo(&mut doc).unwrap(), None);
        assert_eq!(doc.origin().x, 5.0);
    }

    #[test]
    fn depth_bound_discards_oldest() {
        let mut doc = Document::new(10, 10);
        let mut h = HistoryManager::new(3);
        for _ in 0..5 {
            exec(&mut h, &mut doc, 1.0);
        }
        assert_eq!(h.undo_count(), 3);
        assert_eq!(h.undo_to(10, &mut doc).unwrap(), 3);
        // The two oldest steps are gone for good.
        assert_eq!(doc.origin().x, 2.0);
        assert_eq!(h.redo_count(), 3);
    }

    #[test]
    fn memory_cap_keeps_at_least_one_entry() {
        let mut doc = Document::new(10, 10);
        let mut h = HistoryManager::new(50).with_memory_limit(Some(25));
        for _ in 0..4 {
            exec(&mut h, &mut doc, 1.0);
        }
        assert_eq!(h.undo_count(), 2);
        assert_eq!(h.memory_usage(), 20);

        let mut tiny = HistoryManager::new(50).with_memory_limit(Some(1));
        exec(&mut tiny, &mut doc, 1.0);
        assert_eq!(tiny.undo_count(), 1);
    }

    #[test]
    fn redo_bytes_leave_with_the_redo_branch() {
        let mut doc = Document::new(10, 10);
        let mut h = HistoryManager::new(50).with_memory_limit(Some(25));
        exec(&mut h, &mut doc, 1.0);
        exec(&mut h, &mut doc, 1.0);
        h.undo(&mut doc).unwrap();
        assert_eq!(h.memory_usage(), 20);

        exec(&mut h, &mut doc, 1.0);
        assert_eq!(h.memory_usage(), 20);
        assert_eq!((h.undo_count(), h.redo_count()), (2, 0));
    }

    #[test]
    fn listener_sees_state_after_each_change() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let mut doc = Document::new(10, 10);
        let mut h = HistoryManager::default();
        h.set_on_change(Box::new(move |u, r| sink.borrow_mut().push((u, r))));

        exec(&mut h, &mut doc, 1.0);
        h.undo(&mut doc).unwrap();
        h.redo(&mut doc).unwrap();
        h.clear();
        assert_eq!(
            *seen.borrow(),
            vec![(true, false), (false, true), (true, false), (false, false)]
        );
    }

    #[test]
    fn failing_apply_is_still_recorded() {
        let mut doc = Document::new(10, 10);
        let mut h = HistoryManager::default();
        assert!(h.execute(Box::new(Failing), &mut doc).is_err());
        assert_eq!(h.undo_description(), Some("Failing".into()));
        assert_eq!(h.undo_history(), vec!["Failing".to_string()]);
    }
}
