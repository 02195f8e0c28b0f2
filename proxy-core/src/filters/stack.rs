//! Component E: `FilterStack`, the ordered, predicate-gated chain of
//! filters applied to one of the four stages (`ReqHdr`, `ReqBody`,
//! `RespHdr`, `RespBody`).
//!
//! Registered entries (`HeaderFilterStack`/`BodyFilterStack`) are built once
//! at configuration time and then shared read-only across every connection:
//! `HeaderFilter`/`BodyFilter` instances must be reentrant, so the stack
//! itself never needs `&mut self` once serving starts. The per-message
//! selection and carry state that *does* change every message lives in
//! `HeaderStackState`/`BodyStackState`, one instance per connection, so
//! `Threaded` and `Scoreboard` workers never contend over it.
//!
//! `HeaderFilterStack` and `BodyFilterStack` are kept as two distinct types
//! rather than unified behind one generic: `HeaderFilter` and `BodyFilter`
//! have different call signatures (streaming carry vs. single-shot), so a
//! shared generic would need an adapter layer that buys little over two
//! short, independently readable implementations. See DESIGN.md.

use bytes::BytesMut;

use crate::context::ProxyContext;
use crate::headers::Headers;
use crate::message::{Request, Response};

use super::predicate::MatchPredicate;
use super::traits::{BodyFilter, HeaderFilter, MessageHead};

struct Entry<F: ?Sized> {
    predicate: MatchPredicate,
    filter: Box<F>,
}

/// Per-connection scratch state for a `HeaderFilterStack`: which entries
/// matched this message, and which have already had `begin` called.
#[derive(Default)]
pub struct HeaderStackState {
    selected: Option<Vec<usize>>,
    began: Vec<bool>,
}

impl HeaderStackState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// The ordered chain of `HeaderFilter`s for one header stage.
pub struct HeaderFilterStack {
    entries: Vec<Entry<dyn HeaderFilter>>,
}

impl Default for HeaderFilterStack {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderFilterStack {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn push(&mut self, predicate: MatchPredicate, filter: Box<dyn HeaderFilter>) {
        self.entries.push(Entry { predicate, filter });
    }

    pub fn insert(&mut self, index: usize, predicate: MatchPredicate, filter: Box<dyn HeaderFilter>) {
        self.entries.insert(index, Entry { predicate, filter });
    }

    pub fn remove(&mut self, index: usize) -> bool {
        if index < self.entries.len() {
            self.entries.remove(index);
            true
        } else {
            false
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &MatchPredicate> {
        self.entries.iter().map(|e| &e.predicate)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clears `state`'s per-message memo. Must be called once a message's
    /// header stage is fully done before the next message on the same
    /// connection reuses `state`.
    pub fn begin_message(&self, state: &mut HeaderStackState) {
        state.selected = None;
        state.began = vec![false; self.entries.len()];
    }

    /// Picks the subset of filters whose predicate matches this message.
    /// Idempotent within a message: the first call after `begin_message`
    /// computes and caches the selection; later calls for the same message
    /// are no-ops: the selection is recomputed once per message.
    pub fn select_filters(&self, state: &mut HeaderStackState, request: &Request, response: Option<&Response>) {
        if state.selected.is_some() {
            return;
        }
        let chosen = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.predicate.matches(request, response))
            .map(|(i, _)| i)
            .collect();
        state.selected = Some(chosen);
    }

    /// Runs every selected filter in order, short-circuiting (stopping
    /// early) as soon as `ctx.response` becomes `Some`.
    pub fn filter(&self, state: &mut HeaderStackState, headers: &mut Headers, head: &MessageHead, ctx: &mut ProxyContext) {
        let selected = state.selected.clone().unwrap_or_default();
        for idx in selected {
            if ctx.is_short_circuited() {
                break;
            }
            let entry = &self.entries[idx];
            if !state.began[idx] {
                entry.filter.begin(head, ctx);
                state.began[idx] = true;
            }
            entry.filter.filter(headers, head, ctx);
        }
    }

    /// Runs `end()` on every filter that was actually begun this message.
    pub fn end_message(&self, state: &mut HeaderStackState, head: &MessageHead, ctx: &mut ProxyContext) {
        if let Some(selected) = &state.selected {
            for &idx in selected {
                if state.began[idx] {
                    self.entries[idx].filter.end(head, ctx);
                }
            }
        }
    }
}

/// Per-connection scratch state for a `BodyFilterStack`: selection,
/// begun-tracking, and the per-filter carry buffer.
#[derive(Default)]
pub struct BodyStackState {
    selected: Option<Vec<usize>>,
    began: Vec<bool>,
    carry: Vec<BytesMut>,
}

impl BodyStackState {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct BodyFilterStack {
    entries: Vec<Entry<dyn BodyFilter>>,
}

impl Default for BodyFilterStack {
    fn default() -> Self {
        Self::new()
    }
}

impl BodyFilterStack {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn push(&mut self, predicate: MatchPredicate, filter: Box<dyn BodyFilter>) {
        self.entries.push(Entry { predicate, filter });
    }

    pub fn insert(&mut self, index: usize, predicate: MatchPredicate, filter: Box<dyn BodyFilter>) {
        self.entries.insert(index, Entry { predicate, filter });
    }

    pub fn remove(&mut self, index: usize) -> bool {
        if index < self.entries.len() {
            self.entries.remove(index);
            true
        } else {
            false
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &MatchPredicate> {
        self.entries.iter().map(|e| &e.predicate)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn begin_message(&self, state: &mut BodyStackState) {
        state.selected = None;
        state.began = vec![false; self.entries.len()];
        state.carry = (0..self.entries.len()).map(|_| BytesMut::new()).collect();
    }

    pub fn select_filters(&self, state: &mut BodyStackState, request: &Request, response: Option<&Response>) {
        if state.selected.is_some() {
            return;
        }
        let chosen = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.predicate.matches(request, response))
            .map(|(i, _)| i)
            .collect();
        state.selected = Some(chosen);
    }

    /// Whether any selected filter may change body length/content. Used to
    /// decide whether `Content-Length` survives the stack once a message is
    /// already chunked (see `HeaderFilter` docs in `standard.rs`).
    pub fn any_selected_will_modify(&self, state: &BodyStackState) -> bool {
        state
            .selected
            .as_ref()
            .map(|sel| sel.iter().any(|&idx| self.entries[idx].filter.will_modify()))
            .unwrap_or(false)
    }

    /// Runs one chunk through every selected filter, in order, chaining
    /// each filter's output into the next filter's input.
    pub fn filter(
        &self,
        state: &mut BodyStackState,
        data: &mut BytesMut,
        head: &MessageHead,
        headers: &Headers,
        is_last: bool,
        ctx: &mut ProxyContext,
    ) {
        let selected = state.selected.clone().unwrap_or_default();
        for idx in selected {
            let entry = &self.entries[idx];
            if !state.began[idx] {
                entry.filter.begin(head, ctx);
                state.began[idx] = true;
            }

            let carried = std::mem::take(&mut state.carry[idx]);
            let mut input = BytesMut::with_capacity(carried.len() + data.len());
            input.extend_from_slice(&carried);
            input.extend_from_slice(data);

            let mut carry_out = BytesMut::new();
            entry
                .filter
                .filter(&mut input, &mut carry_out, head, headers, is_last, ctx);

            state.carry[idx] = carry_out;
            *data = input;
        }
    }

    /// Ends the message: runs `end()` on every filter begun this message
    /// and clears carry/selection state.
    pub fn eod(&self, state: &mut BodyStackState, head: &MessageHead, ctx: &mut ProxyContext) {
        if let Some(selected) = state.selected.clone() {
            for idx in selected {
                if state.began[idx] {
                    self.entries[idx].filter.end(head, ctx);
                }
            }
        }
        state.selected = None;
        state.began.clear();
        state.carry.clear();
    }
}
