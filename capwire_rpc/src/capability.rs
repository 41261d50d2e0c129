use crate::{vat::Vat, ImportId, LocalId, QuestionId, RpcError, RpcResult};
use async_trait::async_trait;
use capwire::{Object, Ref, RefKind, StructSize};
use std::sync::Arc;
use vec_map::VecMap;

/// A capability handle, tagged by id domain.
///
/// Every translation boundary (wire descriptor to handle and back, call
/// targeting) matches exhaustively over this union.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Capability {
    /// An object in this vat's local registry.
    Local { id: LocalId },
    /// Hosted by the peer; `id` is the peer's export id (our import id).
    Remote { id: ImportId },
    /// One of our own exports, echoed back by the peer.
    Exported { id: crate::ExportId },
    /// Not yet resolved; `transform` holds the pointer-field steps applied
    /// to the eventual value.
    Promise {
        id: u32,
        variant: PromiseVariant,
        transform: Vec<u16>,
    },
    /// A descriptor this level of the protocol does not carry
    /// (`thirdPartyHosted`).
    Unsupported,
}

/// Which table the promise id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromiseVariant {
    /// The result of a question in the peer's answer table (we asked).
    Remote,
    /// The result of a question in our answer table (the peer asked).
    Answer,
    /// A peer promise awaiting a `resolve` message.
    Resolve,
}

impl Capability {
    /// A promise for the result of one of our questions, navigated by
    /// `transform` once the return arrives.
    pub fn promised_answer(question_id: QuestionId, transform: Vec<u16>) -> Self {
        Self::Promise {
            id: question_id,
            variant: PromiseVariant::Remote,
            transform,
        }
    }
}

/// A local object's method surface, invoked from worker tasks.
#[async_trait]
pub trait CapDispatch: Send + Sync + std::fmt::Debug {
    /// Runs one method call and produces the result payload.
    async fn dispatch(
        &self,
        interface_id: u64,
        method_id: u16,
        params: Payload,
        vat: Vat,
    ) -> RpcResult<Payload>;
}

/// Resolves `restore` requests to capabilities.
#[async_trait]
pub trait Restorer: Send + Sync + std::fmt::Debug {
    async fn restore(&self, object_id: &str, vat: Vat) -> RpcResult<Capability>;
}

/// The objects this vat hosts, indexed by [`LocalId`].
///
/// Built before the session starts; the ids are what [`Restorer`]
/// implementations and result payloads hand out.
#[derive(Debug, Default)]
pub struct LocalRegistry {
    entries: VecMap<Arc<dyn CapDispatch>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an object and returns its handle.
    pub fn add(&mut self, dispatcher: Arc<dyn CapDispatch>) -> LocalId {
        let id = u32::try_from(self.entries.len()).unwrap_or(u32::MAX);
        self.entries.insert(id as usize, dispatcher);
        id
    }

    pub(crate) fn get(&self, id: LocalId) -> Option<Arc<dyn CapDispatch>> {
        self.entries.get(id as usize).cloned()
    }
}

/// User data plus its capability table.
///
/// Interface pointers inside `content` carry indices into `caps`; the
/// invariant is that every embedded capability appears at exactly one index.
#[derive(Debug, Clone)]
pub struct Payload {
    pub content: Ref,
    pub caps: Vec<Capability>,
}

impl Payload {
    /// A payload over a freshly built object, with an empty cap table.
    pub fn new(object: &Object) -> Self {
        Self {
            content: object.reference().clone(),
            caps: Vec::new(),
        }
    }

    /// Builds an empty payload with a struct root of the given size.
    pub fn build(size: StructSize) -> RpcResult<(Self, Object)> {
        let object = Object::build(size)?;
        Ok((Self::new(&object), object))
    }

    /// Typed view of the content root.
    pub fn object(&self, size: StructSize) -> Object {
        Object::with_ref(self.content.clone(), size)
    }

    /// Adds `cap` to the table, reusing the index of an equal entry.
    pub fn add_cap(&mut self, cap: Capability) -> u32 {
        if let Some(idx) = self.caps.iter().position(|c| *c == cap) {
            return u32::try_from(idx).unwrap_or(u32::MAX);
        }
        self.caps.push(cap);
        u32::try_from(self.caps.len() - 1).unwrap_or(u32::MAX)
    }

    pub fn cap_at(&self, index: u32) -> Option<&Capability> {
        self.caps.get(index as usize)
    }

    /// Follows `transform` (pointer-field steps) from the content root and
    /// returns the capability the final interface pointer refers to.
    pub fn resolve_transform(&self, transform: &[u16]) -> RpcResult<Capability> {
        let mut at = self.content.clone();
        for step in transform {
            at = at.read_struct_ptr(*step)?;
        }
        match at.kind {
            RefKind::Interface { cap } => self
                .cap_at(cap)
                .cloned()
                .ok_or_else(|| RpcError::PromiseBroken(format!("cap index {cap} not in table"))),
            other => Err(RpcError::PromiseBroken(format!(
                "transform {transform:?} landed on {other:?}, not a capability"
            ))),
        }
    }
}
