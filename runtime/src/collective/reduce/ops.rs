use std::collections::HashSet;
use std::rc::Rc;

use plenum_wire::{from_bytes, to_bytes, Wire};
use thiserror::Error;

use crate::types::OpId;

/// Errors from the combine-operator registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpError {
    #[error("Combine operator '{name}' registered twice")]
    DuplicateOp { name: String },

    #[error("Combine operator '{name}' registered after the registry was frozen")]
    RegistryFrozen { name: String },

    #[error("Unknown combine operator id {id}")]
    UnknownOp { id: u32 },
}

/// A registered combine operator over serialized values. Must be
/// commutative and associative; the reducer folds contributions in
/// arbitrary arrival order.
pub type CombineFn = Rc<dyn Fn(&[u8], &[u8]) -> Vec<u8>>;

/// Builds a [`CombineFn`] from a typed operator. Decode failure inside a
/// reduction is a fatal wire-corruption bug, so it panics with the
/// operator's context.
pub fn combine_of<T: Wire + 'static>(f: fn(T, T) -> T) -> CombineFn {
    Rc::new(move |left, right| {
        let a = from_bytes::<T>(left).unwrap_or_else(|e| panic!("corrupt reduce contribution: {e}"));
        let b =
            from_bytes::<T>(right).unwrap_or_else(|e| panic!("corrupt reduce contribution: {e}"));
        to_bytes(&f(a, b))
    })
}

/// Registry of combine operators, mirroring the handler registry:
/// registration is collective and ordered, and the registry freezes at
/// startup. Operators are identified on the wire by [`OpId`], never by a
/// type parameter.
pub struct CombineOps {
    entries: Vec<(String, CombineFn)>,
    names: HashSet<String>,
    frozen: bool,
}

impl CombineOps {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            names: HashSet::new(),
            frozen: false,
        }
    }

    pub fn try_register(&mut self, name: &str, f: CombineFn) -> Result<OpId, OpError> {
        if self.frozen {
            return Err(OpError::RegistryFrozen {
                name: name.to_string(),
            });
        }
        if !self.names.insert(name.to_string()) {
            return Err(OpError::DuplicateOp {
                name: name.to_string(),
            });
        }
        let id = OpId(self.entries.len() as u32);
        self.entries.push((name.to_string(), f));
        Ok(id)
    }

    /// # Panics
    ///
    /// Panics on duplicate or post-freeze registration.
    pub fn register(&mut self, name: &str, f: CombineFn) -> OpId {
        self.try_register(name, f)
            .unwrap_or_else(|error| panic!("{error}"))
    }

    pub fn get(&self, id: OpId) -> Result<CombineFn, OpError> {
        self.entries
            .get(id.0 as usize)
            .map(|(_, f)| f.clone())
            .ok_or(OpError::UnknownOp { id: id.0 })
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }
}

impl Default for CombineOps {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_combine_folds_serialized_values() {
        let plus = combine_of::<f64>(|a, b| a + b);
        let result = plus(&to_bytes(&1.5f64), &to_bytes(&2.0f64));
        assert_eq!(from_bytes::<f64>(&result).unwrap(), 3.5);
    }

    #[test]
    fn registration_is_ordered_and_unique() {
        let mut ops = CombineOps::new();
        let plus = ops.register("plus.f64", combine_of::<f64>(|a, b| a + b));
        let max = ops.register("max.u64", combine_of::<u64>(|a, b| a.max(b)));
        assert_eq!(plus, OpId(0));
        assert_eq!(max, OpId(1));
        assert!(matches!(
            ops.try_register("plus.f64", combine_of::<f64>(|a, b| a + b)),
            Err(OpError::DuplicateOp { .. })
        ));
        assert!(ops.get(OpId(1)).is_ok());
        assert!(matches!(ops.get(OpId(5)), Err(OpError::UnknownOp { id: 5 })));
    }
}
