use crate::message::ContextFileId;

/// A user selection headed for the context registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextFileSelection {
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

impl ContextFileSelection {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size_bytes,
        }
    }
}

/// An auxiliary document registered for future retrieval use.
///
/// Never becomes a message attachment; its ingestion pipeline lives outside
/// this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextFile {
    pub id: ContextFileId,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

/// Local bookkeeping for context documents plus the list's expanded flag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContextRegistry {
    files: Vec<ContextFile>,
    expanded: bool,
    next_id: u64,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self) -> &[ContextFile] {
        &self.files
    }

    pub fn is_expanded(&self) -> bool {
        self.expanded
    }

    pub fn toggle_expanded(&mut self) {
        self.expanded = !self.expanded;
    }

    /// Registers selections in order and expands the list.
    ///
    /// An empty selection set is a no-op and leaves the expanded flag alone.
    pub fn add(&mut self, selections: Vec<ContextFileSelection>) {
        if selections.is_empty() {
            return;
        }

        for selection in selections {
            let id = ContextFileId::new(self.next_id.saturating_add(1));
            self.next_id = id.0;
            self.files.push(ContextFile {
                id,
                name: selection.name,
                mime_type: selection.mime_type,
                size_bytes: selection.size_bytes,
            });
        }

        self.expanded = true;
    }

    /// Removes one context file; unknown ids are a no-op.
    pub fn remove(&mut self, id: ContextFileId) {
        self.files.retain(|file| file.id != id);
    }
}
