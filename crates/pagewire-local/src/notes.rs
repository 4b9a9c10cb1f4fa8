//! In-memory notes, exposed to agents as resources plus one summarization prompt.

use pagewire_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub const NOTE_URI_PREFIX: &str = "note:///";
pub const NOTE_MIME_TYPE: &str = "text/plain";
pub const SUMMARIZE_PROMPT: &str = "summarize_notes";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Note {
    pub id: String,
    pub title: String,
    pub content: String,
}

impl Note {
    pub fn uri(&self) -> String {
        note_uri(&self.id)
    }
}

pub fn note_uri(id: &str) -> String {
    format!("{NOTE_URI_PREFIX}{id}")
}

/// Extract the note id from `note:///<id>`.
pub fn parse_note_uri(uri: &str) -> Result<u64> {
    let id = uri
        .trim()
        .strip_prefix(NOTE_URI_PREFIX)
        .ok_or_else(|| Error::Validation(format!("not a note uri: {uri:?}")))?;
    id.parse::<u64>()
        .map_err(|_| Error::Validation(format!("malformed note id in {uri:?}")))
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    notes: BTreeMap<u64, Note>,
}

/// Shared note store. Clones share the same notes.
#[derive(Debug, Clone, Default)]
pub struct NoteStore {
    inner: Arc<Mutex<Inner>>,
}

impl NoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create(&self, title: &str, content: &str) -> Result<Note> {
        if title.trim().is_empty() {
            return Err(Error::Validation("title must be non-empty".to_string()));
        }
        if content.trim().is_empty() {
            return Err(Error::Validation("content must be non-empty".to_string()));
        }

        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let note = Note {
            id: id.to_string(),
            title: title.to_string(),
            content: content.to_string(),
        };
        inner.notes.insert(id, note.clone());
        tracing::debug!(id, "note created");
        Ok(note)
    }

    pub fn get(&self, id: u64) -> Option<Note> {
        self.lock().notes.get(&id).cloned()
    }

    /// All notes in creation order.
    pub fn list(&self) -> Vec<Note> {
        self.lock().notes.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resource read: the note content for `note:///<id>`.
    pub fn read_uri(&self, uri: &str) -> Result<Note> {
        let id = parse_note_uri(uri)?;
        self.get(id)
            .ok_or_else(|| Error::NotFound(format!("no note at {uri}")))
    }

    /// Render the named prompt. `style` is `brief` (default) or `detailed`.
    pub fn render_prompt(&self, name: &str, style: Option<&str>) -> Result<String> {
        if name != SUMMARIZE_PROMPT {
            return Err(Error::UnknownOperation(format!("unknown prompt: {name}")));
        }
        let detail = match style.map(str::trim).unwrap_or("brief") {
            "brief" | "" => "",
            "detailed" => " Give extensive details.",
            other => {
                return Err(Error::Validation(format!(
                    "unknown style {other:?} (expected brief or detailed)"
                )))
            }
        };

        let mut out = format!("Here are the current notes to summarize:{detail}\n");
        let notes = self.list();
        if notes.is_empty() {
            out.push_str("\n(no notes yet)\n");
        }
        for n in notes {
            out.push_str(&format!("\n- {}: {}\n", n.title, n.content));
        }
        Ok(out)
    }
}
