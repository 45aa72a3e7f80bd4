use std::any::Any;
use std::collections::HashSet;
use std::rc::Rc;

use plenum_wire::ByteReader;
use thiserror::Error;

use crate::messaging::envelope::Envelope;
use crate::runtime::Runtime;
use crate::types::HandlerId;

/// Errors from the handler registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Registering the same handler name twice is a program bug
    #[error("Handler '{name}' registered twice")]
    DuplicateHandler { name: String },

    /// Registration after the runtime started would desynchronize IDs
    /// across nodes
    #[error("Handler '{name}' registered after the registry was frozen")]
    RegistryFrozen { name: String },

    /// Dispatch on an ID no process registered
    #[error("Unknown handler id {id}")]
    UnknownHandler { id: u32 },
}

/// An active function invoked with the arrived envelope and a reader
/// positioned at its payload.
pub type PlainHandlerFn =
    Rc<dyn for<'a> Fn(&mut Runtime, &Envelope, &mut ByteReader<'a>)>;

/// A handler bound to a located instance: a collection element or an
/// object-group singleton. The `u64` is the element's linearized index
/// (zero for object groups).
pub type InstanceHandlerFn =
    Rc<dyn for<'a> Fn(&mut dyn Any, &mut Runtime, u64, &mut ByteReader<'a>)>;

#[derive(Clone)]
pub enum HandlerKind {
    Plain(PlainHandlerFn),
    Instance(InstanceHandlerFn),
}

/// Registry mapping handler IDs to active functions.
///
/// Registration is collective: every process must register the same
/// handlers in the same order before starting the scheduler, so that equal
/// IDs resolve to the same logical function everywhere. The registry
/// freezes at startup.
pub struct HandlerKinds {
    entries: Vec<(String, HandlerKind)>,
    names: HashSet<String>,
    frozen: bool,
}

impl HandlerKinds {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            names: HashSet::new(),
            frozen: false,
        }
    }

    pub fn try_register(
        &mut self,
        name: &str,
        kind: HandlerKind,
    ) -> Result<HandlerId, HandlerError> {
        if self.frozen {
            return Err(HandlerError::RegistryFrozen {
                name: name.to_string(),
            });
        }
        if !self.names.insert(name.to_string()) {
            return Err(HandlerError::DuplicateHandler {
                name: name.to_string(),
            });
        }
        let id = HandlerId(self.entries.len() as u32);
        self.entries.push((name.to_string(), kind));
        Ok(id)
    }

    /// Registers a handler.
    ///
    /// # Panics
    ///
    /// Panics on duplicate registration or registration after startup;
    /// both are contract violations.
    pub fn register(&mut self, name: &str, kind: HandlerKind) -> HandlerId {
        self.try_register(name, kind)
            .unwrap_or_else(|error| panic!("{error}"))
    }

    pub fn get(&self, id: HandlerId) -> Result<HandlerKind, HandlerError> {
        self.entries
            .get(id.0 as usize)
            .map(|(_, kind)| kind.clone())
            .ok_or(HandlerError::UnknownHandler { id: id.0 })
    }

    pub fn name_of(&self, id: HandlerId) -> Option<&str> {
        self.entries.get(id.0 as usize).map(|(name, _)| name.as_str())
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for HandlerKinds {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> HandlerKind {
        HandlerKind::Plain(Rc::new(|_, _, _| {}))
    }

    #[test]
    fn registration_is_ordered() {
        let mut kinds = HandlerKinds::new();
        let a = kinds.register("a", noop());
        let b = kinds.register("b", noop());
        assert_eq!(a, HandlerId(0));
        assert_eq!(b, HandlerId(1));
        assert_eq!(kinds.name_of(a), Some("a"));
        assert_eq!(kinds.len(), 2);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut kinds = HandlerKinds::new();
        kinds.register("a", noop());
        assert!(matches!(
            kinds.try_register("a", noop()),
            Err(HandlerError::DuplicateHandler { .. })
        ));
    }

    #[test]
    fn frozen_registry_rejects_registration() {
        let mut kinds = HandlerKinds::new();
        kinds.freeze();
        assert!(matches!(
            kinds.try_register("late", noop()),
            Err(HandlerError::RegistryFrozen { .. })
        ));
    }

    #[test]
    fn unknown_id_is_an_error() {
        let kinds = HandlerKinds::new();
        assert!(matches!(
            kinds.get(HandlerId(3)),
            Err(HandlerError::UnknownHandler { id: 3 })
        ));
    }
}
