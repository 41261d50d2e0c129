//! The four bookkeeping tables of a session.
//!
//! All of them live inside the vat core and are mutated only from the
//! session event loop.

use crate::{
    capability::{Capability, Payload},
    AnswerId, ExportId, ImportId, QuestionId, RpcError, RpcResult,
};
use capwire::MethodDescriptor;
use std::collections::HashMap;
use tokio::sync::oneshot;
use vec_map::VecMap;

/// Outcome of a question or answer, shared between waiters.
pub(crate) type Outcome = Result<Payload, RpcError>;

pub(crate) fn duplicate_outcome(outcome: &Outcome) -> Outcome {
    match outcome {
        Ok(payload) => Ok(payload.clone()),
        Err(e) => Err(e.duplicate()),
    }
}

/// A call queued on a promise that has not resolved yet.
#[derive(Debug)]
pub(crate) struct QueuedCall {
    pub transform: Vec<u16>,
    pub method: MethodDescriptor,
    pub params: Payload,
    /// The already-allocated question that will carry the pipelined call.
    pub question_id: QuestionId,
}

/// An inbound call pipelined onto one of our unfinished answers.
#[derive(Debug)]
pub(crate) struct QueuedInboundCall {
    pub answer_id: AnswerId,
    pub transform: Vec<u16>,
    pub interface_id: u64,
    pub method_id: u16,
    pub params: Payload,
}

// ---------------------------------------------------------------
// questions
// ---------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct QuestionEntry {
    pub waiters: Vec<oneshot::Sender<RpcResult<Payload>>>,
    pub result: Option<Outcome>,
    /// The PendingCall guard was dropped.
    pub originator_gone: bool,
    /// Answered by local dispatch, no wire traffic.
    pub local: bool,
    /// Imports referenced by the result cap table, released on finish.
    pub result_imports: Vec<ImportId>,
    /// Exports we bumped for the params cap table, released when the peer
    /// returns with `releaseParamCaps`.
    pub param_exports: Vec<ExportId>,
    /// Locally pipelined calls waiting for this question to resolve.
    pub queued_calls: Vec<QueuedCall>,
}

impl QuestionEntry {
    pub fn new(local: bool) -> Self {
        Self {
            waiters: Vec::new(),
            result: None,
            originator_gone: false,
            local,
            result_imports: Vec::new(),
            param_exports: Vec::new(),
            queued_calls: Vec::new(),
        }
    }
}

/// Outstanding outbound calls. Ids are monotonic and never reused while the
/// previous holder is still in the table.
#[derive(Debug, Default)]
pub(crate) struct Questions {
    next_id: QuestionId,
    entries: VecMap<QuestionEntry>,
}

impl Questions {
    pub fn insert(&mut self, entry: QuestionEntry) -> QuestionId {
        while self.entries.contains_key(self.next_id as usize) {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.entries.insert(id as usize, entry);
        id
    }

    pub fn get_mut(&mut self, id: QuestionId) -> Option<&mut QuestionEntry> {
        self.entries.get_mut(id as usize)
    }

    pub fn remove(&mut self, id: QuestionId) -> Option<QuestionEntry> {
        self.entries.remove(id as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Empties the table, handing out every entry (used on stop).
    pub fn drain(&mut self) -> Vec<(QuestionId, QuestionEntry)> {
        let ids: Vec<usize> = self.entries.keys().collect();
        ids.into_iter()
            .filter_map(|id| {
                self.entries
                    .remove(id)
                    .map(|e| (u32::try_from(id).unwrap_or(u32::MAX), e))
            })
            .collect()
    }
}

// ---------------------------------------------------------------
// answers
// ---------------------------------------------------------------

#[derive(Debug)]
pub(crate) enum AnswerState {
    /// Still being computed by a worker.
    Pending,
    /// Computed; the payload keeps our local capability handles so that
    /// pipelined calls can resolve through it.
    Ready(Outcome),
}

#[derive(Debug)]
pub(crate) struct AnswerEntry {
    pub state: AnswerState,
    /// Finish arrived; a pending answer is canceled, a ready one released.
    pub released: bool,
    /// Exports referenced by the cap table of the sent return.
    pub sent_exports: Vec<ExportId>,
    /// Imports retained for the params of this call.
    pub param_imports: Vec<ImportId>,
    /// Inbound calls pipelined onto this answer while pending.
    pub queued_calls: Vec<QueuedInboundCall>,
    /// Calls issued locally against this answer's promise while pending.
    pub queued_local_calls: Vec<QueuedCall>,
}

impl AnswerEntry {
    pub fn new(param_imports: Vec<ImportId>) -> Self {
        Self {
            state: AnswerState::Pending,
            released: false,
            sent_exports: Vec::new(),
            param_imports,
            queued_calls: Vec::new(),
            queued_local_calls: Vec::new(),
        }
    }
}

/// Outstanding inbound calls, keyed by the id the peer assigned.
#[derive(Debug, Default)]
pub(crate) struct Answers {
    entries: VecMap<AnswerEntry>,
}

impl Answers {
    /// Inserts a fresh entry; `false` if the peer reused a live id.
    pub fn insert(&mut self, id: AnswerId, entry: AnswerEntry) -> bool {
        if self.entries.contains_key(id as usize) {
            return false;
        }
        self.entries.insert(id as usize, entry);
        true
    }

    pub fn get_mut(&mut self, id: AnswerId) -> Option<&mut AnswerEntry> {
        self.entries.get_mut(id as usize)
    }

    pub fn remove(&mut self, id: AnswerId) -> Option<AnswerEntry> {
        self.entries.remove(id as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------
// exports
// ---------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct ExportEntry {
    pub ref_count: u32,
    pub cap: Capability,
}

/// Local capabilities made addressable to the peer. The reverse index keeps
/// one export id per capability; it is updated in lockstep with the forward
/// table under every mutation.
#[derive(Debug, Default)]
pub(crate) struct Exports {
    next_id: ExportId,
    entries: VecMap<ExportEntry>,
    by_cap: HashMap<Capability, ExportId>,
}

impl Exports {
    /// Bumps an existing entry's ref-count; `false` if the id is unknown.
    pub fn retain(&mut self, id: ExportId) -> bool {
        match self.entries.get_mut(id as usize) {
            Some(entry) => {
                entry.ref_count += 1;
                trace!("export {id} ref_count -> {}", entry.ref_count);
                true
            }
            None => false,
        }
    }

    /// Export `cap` (or bump the existing entry) and return its id.
    pub fn export(&mut self, cap: Capability) -> ExportId {
        if let Some(id) = self.by_cap.get(&cap) {
            let id = *id;
            if let Some(entry) = self.entries.get_mut(id as usize) {
                entry.ref_count += 1;
                trace!("export {id} ref_count -> {}", entry.ref_count);
                return id;
            }
        }
        while self.entries.contains_key(self.next_id as usize) {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.entries.insert(
            id as usize,
            ExportEntry {
                ref_count: 1,
                cap: cap.clone(),
            },
        );
        self.by_cap.insert(cap, id);
        id
    }

    pub fn get(&self, id: ExportId) -> Option<&ExportEntry> {
        self.entries.get(id as usize)
    }

    /// Drops `count` references (all of them for `None`); at zero the entry
    /// leaves both indices and the capability is handed back to the caller.
    pub fn release(&mut self, id: ExportId, count: Option<u32>) -> Option<Capability> {
        let entry = self.entries.get_mut(id as usize)?;
        let count = count.unwrap_or(entry.ref_count).min(entry.ref_count);
        entry.ref_count -= count;
        trace!("release {id} by {count}, ref_count -> {}", entry.ref_count);
        if entry.ref_count > 0 {
            return None;
        }
        let entry = self.entries.remove(id as usize)?;
        self.by_cap.remove(&entry.cap);
        Some(entry.cap)
    }

    pub fn ref_count(&self, id: ExportId) -> u32 {
        self.entries.get(id as usize).map_or(0, |e| e.ref_count)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------
// imports
// ---------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct Imports {
    ref_counts: VecMap<u32>,
}

impl Imports {
    /// Notes one more reference to the peer export `id`.
    pub fn retain(&mut self, id: ImportId) {
        let count = self.ref_counts.entry(id as usize).or_insert(0);
        *count += 1;
        trace!("import {id} ref_count -> {count}");
    }

    /// Drops `count` references; `true` when the entry reached zero.
    pub fn release(&mut self, id: ImportId, count: u32) -> bool {
        let Some(current) = self.ref_counts.get_mut(id as usize) else {
            return false;
        };
        *current = current.saturating_sub(count);
        if *current == 0 {
            self.ref_counts.remove(id as usize);
            return true;
        }
        false
    }

    pub fn ref_count(&self, id: ImportId) -> u32 {
        self.ref_counts.get(id as usize).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.ref_counts.len()
    }
}

#[cfg(test)]
mod test {
    use super::{AnswerEntry, Answers, Exports, Imports, QuestionEntry, Questions};
    use crate::capability::Capability;

    #[test]
    fn question_ids_are_not_reused_while_open() {
        let mut questions = Questions::default();
        let a = questions.insert(QuestionEntry::new(false));
        let b = questions.insert(QuestionEntry::new(false));
        assert_ne!(a, b);
        questions.remove(a);
        // the counter moves on; the freed id is not handed out next
        let c = questions.insert(QuestionEntry::new(false));
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn export_dedup_and_ref_counting() {
        let mut exports = Exports::default();
        let cap = Capability::Local { id: 3 };
        let a = exports.export(cap.clone());
        let b = exports.export(cap.clone());
        assert_eq!(a, b);
        assert_eq!(exports.ref_count(a), 2);

        assert!(exports.release(a, Some(1)).is_none());
        assert_eq!(exports.ref_count(a), 1);
        assert_eq!(exports.release(a, Some(1)), Some(cap.clone()));
        assert_eq!(exports.ref_count(a), 0);
        assert_eq!(exports.len(), 0);

        // a fresh export of the same capability gets a fresh id
        let c = exports.export(cap);
        assert_ne!(a, c);
    }

    #[test]
    fn release_all_clears_the_entry() {
        let mut exports = Exports::default();
        let id = exports.export(Capability::Local { id: 1 });
        exports.export(Capability::Local { id: 1 });
        exports.export(Capability::Local { id: 1 });
        assert_eq!(exports.ref_count(id), 3);
        assert!(exports.release(id, None).is_some());
        assert_eq!(exports.len(), 0);
    }

    #[test]
    fn answers_reject_duplicate_ids() {
        let mut answers = Answers::default();
        assert!(answers.insert(5, AnswerEntry::new(Vec::new())));
        assert!(!answers.insert(5, AnswerEntry::new(Vec::new())));
    }

    #[test]
    fn import_ref_counts() {
        let mut imports = Imports::default();
        imports.retain(2);
        imports.retain(2);
        assert_eq!(imports.ref_count(2), 2);
        assert!(!imports.release(2, 1));
        assert!(imports.release(2, 1));
        assert_eq!(imports.ref_count(2), 0);
        assert_eq!(imports.len(), 0);
    }
}
